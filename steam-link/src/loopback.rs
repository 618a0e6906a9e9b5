// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! In-process Steam backend.
//!
//! Connects and logs on immediately (an empty password is rejected with
//! `InvalidPassword`) and keeps lobbies in a table shared by every client
//! opened from the same connector.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use lobby_common::{LobbyDetails, LobbyInfo};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    EResult, GameCoordinator, GcError, LogOnDetails, PersonaState, SteamClient, SteamConnector,
    SteamEvent, SteamSession, TransportError,
};

const LOBBY_ID_BASE: u64 = 26_000_000_000_000_000;

#[derive(Default)]
struct LobbyTable {
    next_id: AtomicU64,
    lobbies: Mutex<HashMap<String, LobbyInfo>>,
}

impl LobbyTable {
    fn insert(&self, details: &LobbyDetails) -> LobbyInfo {
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let lobby = LobbyInfo {
            lobby_id: (LOBBY_ID_BASE + seq).to_string(),
            lobby_name: details.lobby_name.clone(),
            game_mode: details.game_mode.clone(),
            server_region: details.server_region.clone(),
            member_count: 1,
            state: "UI".to_string(),
        };
        self.lobbies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(lobby.lobby_id.clone(), lobby.clone());
        lobby
    }

    fn get(&self, lobby_id: &str) -> Option<LobbyInfo> {
        self.lobbies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(lobby_id)
            .cloned()
    }
}

#[derive(Clone, Default)]
pub struct LoopbackConnector {
    lobbies: Arc<LobbyTable>,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SteamConnector for LoopbackConnector {
    fn open(&self, username: &str) -> SteamSession {
        let (events_tx, events) = mpsc::unbounded_channel();
        let client = LoopbackClient {
            username: username.to_string(),
            events_tx,
            connected: AtomicBool::new(false),
            logged_on: Arc::new(AtomicBool::new(false)),
            lobbies: self.lobbies.clone(),
        };
        SteamSession {
            client: Arc::new(client),
            events,
        }
    }
}

struct LoopbackClient {
    username: String,
    events_tx: mpsc::UnboundedSender<SteamEvent>,
    connected: AtomicBool,
    logged_on: Arc<AtomicBool>,
    lobbies: Arc<LobbyTable>,
}

impl LoopbackClient {
    fn emit(&self, event: SteamEvent) {
        debug!(username = %self.username, ?event, "loopback steam event");
        let _ = self.events_tx.send(event);
    }
}

#[async_trait]
impl SteamClient for LoopbackClient {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connected.store(true, Ordering::SeqCst);
        self.emit(SteamEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        self.logged_on.store(false, Ordering::SeqCst);
        if self.connected.swap(false, Ordering::SeqCst) {
            self.emit(SteamEvent::Disconnected);
        }
    }

    async fn log_on(&self, details: &LogOnDetails) {
        if !self.connected.load(Ordering::SeqCst) {
            self.emit(SteamEvent::LogOnFailed(EResult::NotConnected));
            return;
        }
        if details.password.is_empty() {
            self.emit(SteamEvent::LogOnFailed(EResult::InvalidPassword));
            return;
        }
        self.logged_on.store(true, Ordering::SeqCst);
        self.emit(SteamEvent::LoggedOn);
    }

    async fn set_persona_state(&self, state: PersonaState) {
        debug!(username = %self.username, ?state, "loopback persona state");
    }

    fn game_coordinator(&self) -> Result<Arc<dyn GameCoordinator>, GcError> {
        if !self.logged_on.load(Ordering::SeqCst) {
            return Err(GcError::NotLoggedOn);
        }
        Ok(Arc::new(LoopbackCoordinator {
            online: self.logged_on.clone(),
            lobbies: self.lobbies.clone(),
        }))
    }
}

struct LoopbackCoordinator {
    online: Arc<AtomicBool>,
    lobbies: Arc<LobbyTable>,
}

impl LoopbackCoordinator {
    fn ensure_online(&self) -> Result<(), GcError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GcError::SessionClosed)
        }
    }
}

#[async_trait]
impl GameCoordinator for LoopbackCoordinator {
    async fn create_lobby(&self, details: &LobbyDetails) -> Result<LobbyInfo, GcError> {
        self.ensure_online()?;
        Ok(self.lobbies.insert(details))
    }

    async fn lobby_info(&self, lobby_id: &str) -> Result<LobbyInfo, GcError> {
        self.ensure_online()?;
        self.lobbies
            .get(lobby_id)
            .ok_or_else(|| GcError::LobbyNotFound(lobby_id.to_string()))
    }
}
