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

//! Scripted Steam backend shared by the unit tests.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use lobby_common::{BotState, LobbyDetails, LobbyInfo};
use steam_link::{
    EResult, GameCoordinator, GcError, LogOnDetails, PersonaState, SteamClient, SteamConnector,
    SteamEvent, SteamSession, TransportError,
};
use tokio::{sync::mpsc, time::Instant};

use crate::supervisor::Bot;

/// Polls until the bot reaches `state`. Works with paused time.
pub async fn wait_for_state(bot: &Bot, state: BotState) {
    for _ in 0..20_000 {
        if bot.state().await == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "bot {} never reached {state}; stuck in {}",
        bot.username(),
        bot.state().await
    );
}

#[derive(Default)]
struct Script {
    reject_logins: u32,
    fail_connects: u32,
    stall_logons: bool,
    stall_disconnects: bool,
}

#[derive(Default)]
pub struct FakeConnector {
    clients: Mutex<HashMap<String, Arc<FakeClient>>>,
    scripts: Mutex<HashMap<String, Script>>,
    gc: Arc<FakeGc>,
}

impl FakeConnector {
    pub fn gc(&self) -> Arc<FakeGc> {
        self.gc.clone()
    }

    pub fn client(&self, username: &str) -> Arc<FakeClient> {
        self.clients.lock().unwrap()[username].clone()
    }

    /// Rejects the next `count` logons for `username` with `InvalidPassword`.
    pub fn reject_logins(&self, username: &str, count: u32) {
        self.scripts
            .lock()
            .unwrap()
            .entry(username.to_string())
            .or_default()
            .reject_logins = count;
    }

    pub fn fail_connects(&self, username: &str, count: u32) {
        self.scripts
            .lock()
            .unwrap()
            .entry(username.to_string())
            .or_default()
            .fail_connects = count;
    }

    /// Makes every logon for `username` hang forever.
    pub fn stall_logons(&self, username: &str) {
        self.scripts
            .lock()
            .unwrap()
            .entry(username.to_string())
            .or_default()
            .stall_logons = true;
    }

    pub fn stall_disconnects(&self, username: &str) {
        self.scripts
            .lock()
            .unwrap()
            .entry(username.to_string())
            .or_default()
            .stall_disconnects = true;
    }
}

impl SteamConnector for FakeConnector {
    fn open(&self, username: &str) -> SteamSession {
        let (events_tx, events) = mpsc::unbounded_channel();
        let script = self
            .scripts
            .lock()
            .unwrap()
            .remove(username)
            .unwrap_or_default();
        let client = Arc::new(FakeClient {
            events_tx: Mutex::new(Some(events_tx)),
            connected: AtomicBool::new(false),
            reject_logins: AtomicU32::new(script.reject_logins),
            fail_connects: AtomicU32::new(script.fail_connects),
            stall_logons: script.stall_logons,
            stall_disconnects: script.stall_disconnects,
            connects: Mutex::new(Vec::new()),
            disconnects: AtomicUsize::new(0),
            logons: AtomicUsize::new(0),
            personas: Mutex::new(Vec::new()),
            gc: self.gc.clone(),
        });
        self.clients
            .lock()
            .unwrap()
            .insert(username.to_string(), client.clone());
        SteamSession {
            client,
            events,
        }
    }
}

pub struct FakeClient {
    events_tx: Mutex<Option<mpsc::UnboundedSender<SteamEvent>>>,
    connected: AtomicBool,
    reject_logins: AtomicU32,
    fail_connects: AtomicU32,
    stall_logons: bool,
    stall_disconnects: bool,
    connects: Mutex<Vec<Instant>>,
    disconnects: AtomicUsize,
    logons: AtomicUsize,
    personas: Mutex<Vec<PersonaState>>,
    gc: Arc<FakeGc>,
}

impl FakeClient {
    pub fn inject(&self, event: SteamEvent) {
        if let Some(tx) = self.events_tx.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn close_events(&self) {
        self.events_tx.lock().unwrap().take();
    }

    pub fn connects(&self) -> Vec<Instant> {
        self.connects.lock().unwrap().clone()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn logons(&self) -> usize {
        self.logons.load(Ordering::SeqCst)
    }

    pub fn personas(&self) -> Vec<PersonaState> {
        self.personas.lock().unwrap().clone()
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SteamClient for FakeClient {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connects.lock().unwrap().push(Instant::now());
        if Self::take_one(&self.fail_connects) {
            return Err(TransportError::Connect("scripted failure".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        self.inject(SteamEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        if self.stall_disconnects {
            std::future::pending::<()>().await;
        }
        if self.connected.swap(false, Ordering::SeqCst) {
            self.inject(SteamEvent::Disconnected);
        }
    }

    async fn log_on(&self, _details: &LogOnDetails) {
        self.logons.fetch_add(1, Ordering::SeqCst);
        if self.stall_logons {
            std::future::pending::<()>().await;
        }
        if Self::take_one(&self.reject_logins) {
            self.inject(SteamEvent::LogOnFailed(EResult::InvalidPassword));
        } else {
            self.inject(SteamEvent::LoggedOn);
        }
    }

    async fn set_persona_state(&self, state: PersonaState) {
        self.personas.lock().unwrap().push(state);
    }

    fn game_coordinator(&self) -> Result<Arc<dyn GameCoordinator>, GcError> {
        Ok(self.gc.clone())
    }
}

/// Records every lobby request; optionally fails or stalls them.
#[derive(Default)]
pub struct FakeGc {
    created: Mutex<Vec<LobbyDetails>>,
    lookups: Mutex<Vec<String>>,
    failure: Mutex<Option<GcError>>,
    stall: AtomicBool,
}

impl FakeGc {
    pub fn created(&self) -> Vec<LobbyDetails> {
        self.created.lock().unwrap().clone()
    }

    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().unwrap().clone()
    }

    pub fn fail_with(&self, error: GcError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    pub fn stall(&self) {
        self.stall.store(true, Ordering::SeqCst);
    }

    async fn outcome(&self) -> Result<(), GcError> {
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        match self.failure.lock().unwrap().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl GameCoordinator for FakeGc {
    async fn create_lobby(&self, details: &LobbyDetails) -> Result<LobbyInfo, GcError> {
        self.created.lock().unwrap().push(details.clone());
        self.outcome().await?;
        Ok(LobbyInfo {
            lobby_id: "26000000000000042".to_string(),
            lobby_name: details.lobby_name.clone(),
            game_mode: details.game_mode.clone(),
            server_region: details.server_region.clone(),
            member_count: 1,
            state: "UI".to_string(),
        })
    }

    async fn lobby_info(&self, lobby_id: &str) -> Result<LobbyInfo, GcError> {
        self.lookups.lock().unwrap().push(lobby_id.to_string());
        self.outcome().await?;
        if lobby_id != "26000000000000042" {
            return Err(GcError::LobbyNotFound(lobby_id.to_string()));
        }
        Ok(LobbyInfo {
            lobby_id: lobby_id.to_string(),
            lobby_name: "semifinals".to_string(),
            game_mode: None,
            server_region: None,
            member_count: 3,
            state: "UI".to_string(),
        })
    }
}
