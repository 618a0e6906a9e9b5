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

use std::{collections::BTreeMap, fmt, sync::LazyLock, time::Duration};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const MAX_LOBBY_NAME_CHARS: usize = 100;
pub const MAX_LOBBY_PASSWORD_CHARS: usize = 50;

/// Minimum wait after a transport drop before the next connect attempt.
pub const RECONNECT_DELAY_FLOOR: Duration = Duration::from_secs(5);
/// Minimum wait after Steam rejects a login before the next attempt.
pub const LOGIN_RETRY_DELAY_FLOOR: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);

pub const STATUS_HEALTHY: &str = "healthy";
pub const STATUS_SUCCESS: &str = "success";

/// Connection state of a single bot, as driven by its supervisor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BotState {
    Initial,
    Connecting,
    Authenticating,
    Ready,
    Backoff,
    Stopped,
}

impl BotState {
    /// Whether the supervisor may move from `self` to `next`.
    ///
    /// Recovery from any live state always goes through `Backoff`, and
    /// `Stopped` is terminal.
    pub fn can_transition_to(self, next: BotState) -> bool {
        use BotState::*;
        match (self, next) {
            (Stopped, _) => false,
            (_, Stopped) => true,
            (Initial, Connecting) => true,
            (Connecting, Authenticating | Backoff) => true,
            (Authenticating, Ready | Backoff) => true,
            (Ready, Backoff) => true,
            (Backoff, Connecting) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BotState::Initial => "initial",
            BotState::Connecting => "connecting",
            BotState::Authenticating => "authenticating",
            BotState::Ready => "ready",
            BotState::Backoff => "backoff",
            BotState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for BotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated lobby parameters handed to the game coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobbyDetails {
    pub lobby_name: String,
    pub password: Option<String>,
    pub server_region: Option<String>,
    pub game_mode: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LobbyInfo {
    pub lobby_id: String,
    pub lobby_name: String,
    #[serde(default)]
    pub game_mode: Option<String>,
    #[serde(default)]
    pub server_region: Option<String>,
    pub member_count: u32,
    pub state: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateLobbyRequest {
    #[serde(default)]
    pub lobby_name: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub server_region: Option<String>,
    #[serde(default)]
    pub game_mode: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateLobbyResponse {
    pub status: String,
    pub message: String,
    pub lobby_name: String,
    pub lobby_id: String,
    pub bot_used: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LobbyInfoRequest {
    #[serde(default)]
    pub lobby_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyInfoResponse {
    pub status: String,
    pub lobby_id: String,
    pub bot_used: String,
    pub lobby: LobbyInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotsResponse {
    pub bots: BTreeMap<String, bool>,
}

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is a valid regex")
});

/// Replace `${VAR_NAME}` patterns in a string with values resolved through
/// `lookup`. Unknown or unset variables are replaced with an empty string.
pub fn expand_env_vars_with<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    ENV_VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures| {
            lookup(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}
