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

//! Contract between the lobby service and a Steam / Dota 2 client library.
//!
//! A [`SteamConnector`] opens one long-lived [`SteamSession`] per account.
//! The session pairs a [`SteamClient`] handle with the ordered stream of
//! [`SteamEvent`]s it produces. Once logged on, the client hands out a
//! [`GameCoordinator`] for lobby operations.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use lobby_common::{LobbyDetails, LobbyInfo};
use tokio::sync::mpsc;

pub mod loopback;

/// Result codes reported by Steam for logon failures and logoffs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EResult {
    Fail,
    InvalidPassword,
    AccountLogonDenied,
    RateLimitExceeded,
    ServiceUnavailable,
    LoggedInElsewhere,
    NotConnected,
    Other(i32),
}

impl fmt::Display for EResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EResult::Fail => f.write_str("Fail"),
            EResult::InvalidPassword => f.write_str("InvalidPassword"),
            EResult::AccountLogonDenied => f.write_str("AccountLogonDenied"),
            EResult::RateLimitExceeded => f.write_str("RateLimitExceeded"),
            EResult::ServiceUnavailable => f.write_str("ServiceUnavailable"),
            EResult::LoggedInElsewhere => f.write_str("LoggedInElsewhere"),
            EResult::NotConnected => f.write_str("NotConnected"),
            EResult::Other(code) => write!(f, "EResult({code})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SteamEvent {
    Connected,
    LoggedOn,
    LogOnFailed(EResult),
    Disconnected,
    LoggedOff(EResult),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersonaState {
    Offline,
    Online,
}

/// Credentials submitted with a logon request.
#[derive(Clone)]
pub struct LogOnDetails {
    pub username: String,
    pub password: String,
    pub sentry_hash: Option<String>,
}

impl fmt::Debug for LogOnDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogOnDetails")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("sentry_hash", &self.sentry_hash.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("steam connect failed: {0}")]
    Connect(String),
}

#[derive(Debug, thiserror::Error)]
pub enum GcError {
    #[error("steam client is not logged on")]
    NotLoggedOn,
    #[error("game coordinator session closed")]
    SessionClosed,
    #[error("lobby {0} not found")]
    LobbyNotFound(String),
    #[error("game coordinator rejected request: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait SteamClient: Send + Sync {
    /// Starts a connection attempt. Success is reported as
    /// [`SteamEvent::Connected`]; an immediate failure is returned here.
    async fn connect(&self) -> Result<(), TransportError>;
    async fn disconnect(&self);
    async fn log_on(&self, details: &LogOnDetails);
    async fn set_persona_state(&self, state: PersonaState);
    /// Builds a game coordinator session on top of a logged-on client.
    fn game_coordinator(&self) -> Result<Arc<dyn GameCoordinator>, GcError>;
}

#[async_trait]
pub trait GameCoordinator: Send + Sync {
    async fn create_lobby(&self, details: &LobbyDetails) -> Result<LobbyInfo, GcError>;
    async fn lobby_info(&self, lobby_id: &str) -> Result<LobbyInfo, GcError>;
}

pub struct SteamSession {
    pub client: Arc<dyn SteamClient>,
    pub events: mpsc::UnboundedReceiver<SteamEvent>,
}

/// Creates client sessions. Must not perform network I/O.
pub trait SteamConnector: Send + Sync {
    fn open(&self, username: &str) -> SteamSession;
}
