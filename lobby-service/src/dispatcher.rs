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

use std::{future::Future, sync::Arc, time::Duration};

use lobby_common::{
    CreateLobbyRequest, LobbyDetails, LobbyInfo, MAX_LOBBY_NAME_CHARS, MAX_LOBBY_PASSWORD_CHARS,
};
use steam_link::{GameCoordinator, GcError};
use tracing::{info, warn};

use crate::{registry::BotRegistry, supervisor::Bot};

/// Upper bound on a single game coordinator round trip.
pub const GC_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("{0}")]
    BadRequest(String),
    #[error("No available bots")]
    NoAvailableBot,
    #[error("Bot not ready")]
    BotNotReady,
    #[error("Lobby not found")]
    LobbyNotFound,
    #[error("Game coordinator request failed")]
    Upstream,
}

#[derive(Debug, Clone)]
pub struct Dispatched {
    pub lobby: LobbyInfo,
    pub bot_used: String,
}

/// Routes lobby operations to a Ready bot's game coordinator session.
pub struct LobbyDispatcher {
    registry: Arc<BotRegistry>,
    gc_timeout: Duration,
}

impl LobbyDispatcher {
    pub fn new(registry: Arc<BotRegistry>, gc_timeout: Duration) -> Self {
        Self {
            registry,
            gc_timeout,
        }
    }

    pub async fn create_lobby(
        &self,
        request: CreateLobbyRequest,
    ) -> Result<Dispatched, DispatchError> {
        let details = validate_create_request(request)?;
        let bot = self.pick_bot().await?;
        self.create_on(&bot, &details).await
    }

    /// Creates the lobby through a bot that was already picked. The bot may
    /// have left Ready since the pick, which surfaces as `BotNotReady`.
    async fn create_on(
        &self,
        bot: &Bot,
        details: &LobbyDetails,
    ) -> Result<Dispatched, DispatchError> {
        let gc = self.handle_for(bot).await?;

        info!(username = %bot.username(), lobby_name = %details.lobby_name, "creating lobby");
        let lobby = self
            .call_gc(bot.username(), "create_lobby", gc.create_lobby(details))
            .await?;
        info!(
            username = %bot.username(),
            lobby_id = %lobby.lobby_id,
            lobby_name = %lobby.lobby_name,
            "lobby created"
        );
        Ok(Dispatched {
            lobby,
            bot_used: bot.username().to_string(),
        })
    }

    pub async fn lobby_info(&self, lobby_id: &str) -> Result<Dispatched, DispatchError> {
        if lobby_id.trim().is_empty() {
            return Err(DispatchError::BadRequest(
                "lobby_id is required".to_string(),
            ));
        }
        let bot = self.pick_bot().await?;
        let gc = self.handle_for(&bot).await?;

        let lobby = self
            .call_gc(bot.username(), "lobby_info", gc.lobby_info(lobby_id))
            .await?;
        Ok(Dispatched {
            lobby,
            bot_used: bot.username().to_string(),
        })
    }

    async fn pick_bot(&self) -> Result<Arc<Bot>, DispatchError> {
        self.registry
            .pick_available()
            .await
            .map_err(|_| DispatchError::NoAvailableBot)
    }

    async fn handle_for(&self, bot: &Bot) -> Result<Arc<dyn GameCoordinator>, DispatchError> {
        match bot.gc_handle().await {
            Ok(gc) => Ok(gc),
            Err(_) => {
                let state = bot.state().await;
                warn!(
                    username = %bot.username(),
                    state = %state,
                    "bot left Ready before the request was sent"
                );
                Err(DispatchError::BotNotReady)
            }
        }
    }

    async fn call_gc<T>(
        &self,
        username: &str,
        operation: &str,
        request: impl Future<Output = Result<T, GcError>>,
    ) -> Result<T, DispatchError> {
        match tokio::time::timeout(self.gc_timeout, request).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(GcError::LobbyNotFound(lobby_id))) => {
                info!(username = %username, lobby_id = %lobby_id, "lobby not found");
                Err(DispatchError::LobbyNotFound)
            }
            Ok(Err(error @ (GcError::NotLoggedOn | GcError::SessionClosed))) => {
                warn!(username = %username, operation, error = %error, "bot lost its session mid-request");
                Err(DispatchError::BotNotReady)
            }
            Ok(Err(error)) => {
                warn!(username = %username, operation, error = %error, "game coordinator request failed");
                Err(DispatchError::Upstream)
            }
            Err(_) => {
                warn!(
                    username = %username,
                    operation,
                    timeout_ms = self.gc_timeout.as_millis() as u64,
                    "game coordinator request timed out"
                );
                Err(DispatchError::Upstream)
            }
        }
    }
}

/// Bounds the request fields without rewriting them. Lengths count
/// characters of the value as sent, not bytes.
pub fn validate_create_request(
    request: CreateLobbyRequest,
) -> Result<LobbyDetails, DispatchError> {
    let lobby_name = request.lobby_name;
    if lobby_name.trim().is_empty() {
        return Err(DispatchError::BadRequest(
            "lobby_name is required".to_string(),
        ));
    }
    if lobby_name.chars().count() > MAX_LOBBY_NAME_CHARS {
        return Err(DispatchError::BadRequest(format!(
            "lobby_name must be at most {MAX_LOBBY_NAME_CHARS} characters"
        )));
    }

    let password = request.password.filter(|password| !password.is_empty());
    if password
        .as_ref()
        .is_some_and(|password| password.chars().count() > MAX_LOBBY_PASSWORD_CHARS)
    {
        return Err(DispatchError::BadRequest(format!(
            "password must be at most {MAX_LOBBY_PASSWORD_CHARS} characters"
        )));
    }

    Ok(LobbyDetails {
        lobby_name,
        password,
        server_region: non_empty(request.server_region),
        game_mode: non_empty(request.game_mode),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::SupervisorConfig,
        testing::{FakeConnector, wait_for_state},
    };
    use lobby_common::BotState;
    use steam_link::SteamEvent;
    use tokio_util::sync::CancellationToken;

    fn request(name: &str, password: Option<&str>) -> CreateLobbyRequest {
        CreateLobbyRequest {
            lobby_name: name.to_string(),
            password: password.map(str::to_string),
            server_region: Some("eu_west".to_string()),
            game_mode: None,
        }
    }

    async fn ready_dispatcher() -> (LobbyDispatcher, Arc<FakeConnector>, Arc<BotRegistry>) {
        let connector = Arc::new(FakeConnector::default());
        let registry = Arc::new(BotRegistry::new(
            connector.clone(),
            &SupervisorConfig::default(),
            CancellationToken::new(),
        ));
        let bot = registry.add("bot_one", "pw").await.unwrap();
        wait_for_state(&bot, BotState::Ready).await;
        (
            LobbyDispatcher::new(registry.clone(), GC_REQUEST_TIMEOUT),
            connector,
            registry,
        )
    }

    #[test]
    fn lobby_name_length_boundary() {
        assert!(validate_create_request(request(&"a".repeat(100), None)).is_ok());
        assert!(matches!(
            validate_create_request(request(&"a".repeat(101), None)),
            Err(DispatchError::BadRequest(_))
        ));
    }

    #[test]
    fn padded_lobby_name_counts_its_whitespace() {
        let padded = format!("{} ", "a".repeat(100));
        assert!(matches!(
            validate_create_request(request(&padded, None)),
            Err(DispatchError::BadRequest(_))
        ));

        let details = validate_create_request(request(&format!(" {}", "a".repeat(99)), None)).unwrap();
        assert_eq!(details.lobby_name.chars().count(), 100);
        assert!(details.lobby_name.starts_with(' '));
    }

    #[test]
    fn lobby_name_counts_characters_not_bytes() {
        let name = "é".repeat(100);
        assert!(name.len() > 100);
        assert!(validate_create_request(request(&name, None)).is_ok());
    }

    #[test]
    fn password_length_boundary() {
        assert!(validate_create_request(request("ok", Some(&"p".repeat(50)))).is_ok());
        assert!(matches!(
            validate_create_request(request("ok", Some(&"p".repeat(51)))),
            Err(DispatchError::BadRequest(_))
        ));
    }

    #[test]
    fn blank_name_is_rejected_and_values_pass_through() {
        assert!(matches!(
            validate_create_request(request("   ", None)),
            Err(DispatchError::BadRequest(_))
        ));

        let details = validate_create_request(CreateLobbyRequest {
            lobby_name: "  finals ".to_string(),
            password: Some(String::new()),
            server_region: Some("  ".to_string()),
            game_mode: Some(" all_pick ".to_string()),
        })
        .unwrap();
        assert_eq!(details.lobby_name, "  finals ");
        assert_eq!(details.password, None);
        assert_eq!(details.server_region, None);
        assert_eq!(details.game_mode.as_deref(), Some(" all_pick "));
    }

    #[tokio::test]
    async fn create_without_ready_bot_is_unavailable() {
        let registry = Arc::new(BotRegistry::new(
            Arc::new(FakeConnector::default()),
            &SupervisorConfig::default(),
            CancellationToken::new(),
        ));
        let dispatcher = LobbyDispatcher::new(registry, GC_REQUEST_TIMEOUT);

        let result = dispatcher.create_lobby(request("finals", None)).await;
        assert!(matches!(result, Err(DispatchError::NoAvailableBot)));
    }

    #[tokio::test]
    async fn invalid_request_never_reaches_game_coordinator() {
        let (dispatcher, connector, registry) = ready_dispatcher().await;

        let result = dispatcher
            .create_lobby(request(&"a".repeat(101), None))
            .await;
        assert!(matches!(result, Err(DispatchError::BadRequest(_))));
        assert!(connector.gc().created().is_empty());

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn create_forwards_validated_details_once() {
        let (dispatcher, connector, registry) = ready_dispatcher().await;

        let created = dispatcher
            .create_lobby(request("finals", Some("secret")))
            .await
            .unwrap();

        assert_eq!(created.bot_used, "bot_one");
        assert_eq!(created.lobby.lobby_name, "finals");
        let calls = connector.gc().created();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].password.as_deref(), Some("secret"));
        assert_eq!(calls[0].server_region.as_deref(), Some("eu_west"));

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn bot_leaving_ready_after_pick_is_not_ready() {
        let (dispatcher, connector, registry) = ready_dispatcher().await;

        let bot = registry.pick_available().await.unwrap();
        connector.client("bot_one").inject(SteamEvent::Disconnected);
        wait_for_state(&bot, BotState::Backoff).await;

        let details = validate_create_request(request("finals", None)).unwrap();
        let result = dispatcher.create_on(&bot, &details).await;
        assert!(matches!(result, Err(DispatchError::BotNotReady)));
        assert_eq!(result.unwrap_err().to_string(), "Bot not ready");
        assert!(connector.gc().created().is_empty());

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn lobby_id_is_forwarded_as_sent() {
        let (dispatcher, connector, registry) = ready_dispatcher().await;

        assert!(matches!(
            dispatcher.lobby_info(" 26000000000000042").await,
            Err(DispatchError::LobbyNotFound)
        ));
        assert_eq!(connector.gc().lookups(), vec![" 26000000000000042"]);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn lobby_info_requires_id_and_maps_not_found() {
        let (dispatcher, connector, registry) = ready_dispatcher().await;

        assert!(matches!(
            dispatcher.lobby_info("  ").await,
            Err(DispatchError::BadRequest(_))
        ));
        assert!(matches!(
            dispatcher.lobby_info("123").await,
            Err(DispatchError::LobbyNotFound)
        ));
        let found = dispatcher.lobby_info("26000000000000042").await.unwrap();
        assert_eq!(found.lobby.member_count, 3);
        assert_eq!(connector.gc().lookups(), vec!["123", "26000000000000042"]);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn gc_failures_are_sanitized() {
        let (dispatcher, connector, registry) = ready_dispatcher().await;

        connector
            .gc()
            .fail_with(GcError::Rejected("internal detail".to_string()));
        let error = dispatcher
            .create_lobby(request("finals", None))
            .await
            .unwrap_err();
        assert!(matches!(error, DispatchError::Upstream));
        assert!(!error.to_string().contains("internal detail"));

        connector.gc().fail_with(GcError::SessionClosed);
        assert!(matches!(
            dispatcher.create_lobby(request("finals", None)).await,
            Err(DispatchError::BotNotReady)
        ));

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn stalled_gc_call_times_out() {
        let (_, connector, registry) = ready_dispatcher().await;
        let dispatcher = LobbyDispatcher::new(registry.clone(), Duration::from_millis(50));
        connector.gc().stall();

        let result = dispatcher.create_lobby(request("finals", None)).await;
        assert!(matches!(result, Err(DispatchError::Upstream)));

        registry.shutdown().await;
    }
}
