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

//! Per-bot session supervisor.
//!
//! Each [`Supervisor`] owns one Steam client and drives the shared [`Bot`]
//! record through `Initial -> Connecting -> Authenticating -> Ready`,
//! falling back to `Backoff` on any failure until its cancellation token
//! fires. Only the supervisor writes the record; HTTP handlers read it.

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use lobby_common::BotState;
use rand::Rng;
use steam_link::{
    GameCoordinator, LogOnDetails, PersonaState, SteamClient, SteamEvent, SteamSession,
};
use tokio::{
    sync::{RwLock, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("bot is not ready")]
pub struct NotReady;

/// Session phase. The game coordinator handle only exists inside `Ready`.
#[derive(Clone)]
enum Session {
    Initial,
    Connecting,
    Authenticating,
    Ready(Arc<dyn GameCoordinator>),
    Backoff,
    Stopped,
}

impl Session {
    fn state(&self) -> BotState {
        match self {
            Session::Initial => BotState::Initial,
            Session::Connecting => BotState::Connecting,
            Session::Authenticating => BotState::Authenticating,
            Session::Ready(_) => BotState::Ready,
            Session::Backoff => BotState::Backoff,
            Session::Stopped => BotState::Stopped,
        }
    }
}

struct BotStatus {
    session: Session,
    since: DateTime<Utc>,
    backoff_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotSnapshot {
    pub state: BotState,
    pub since: DateTime<Utc>,
    pub backoff_attempts: u32,
}

impl BotSnapshot {
    pub fn is_ready(&self) -> bool {
        self.state == BotState::Ready
    }
}

/// Shared record for one bot account.
pub struct Bot {
    username: String,
    status: RwLock<BotStatus>,
}

impl fmt::Debug for Bot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bot")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl Bot {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            status: RwLock::new(BotStatus {
                session: Session::Initial,
                since: Utc::now(),
                backoff_attempts: 0,
            }),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub async fn state(&self) -> BotState {
        self.status.read().await.session.state()
    }

    pub async fn is_ready(&self) -> bool {
        matches!(self.status.read().await.session, Session::Ready(_))
    }

    pub async fn snapshot(&self) -> BotSnapshot {
        let status = self.status.read().await;
        BotSnapshot {
            state: status.session.state(),
            since: status.since,
            backoff_attempts: status.backoff_attempts,
        }
    }

    /// Returns the live game coordinator handle, checked under the same
    /// lock that guards the state.
    pub async fn gc_handle(&self) -> Result<Arc<dyn GameCoordinator>, NotReady> {
        match &self.status.read().await.session {
            Session::Ready(gc) => Ok(gc.clone()),
            _ => Err(NotReady),
        }
    }

    async fn transition(&self, next: Session, backoff_attempts: u32) -> bool {
        let mut status = self.status.write().await;
        let from = status.session.state();
        let to = next.state();
        if !from.can_transition_to(to) {
            warn!(username = %self.username, %from, %to, "rejected invalid bot state transition");
            return false;
        }
        status.session = next;
        status.since = Utc::now();
        status.backoff_attempts = backoff_attempts;
        drop(status);
        debug!(username = %self.username, %from, %to, backoff_attempts, "bot state transition");
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    Transport,
    Login,
}

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    reconnect_delay: Duration,
    login_retry_delay: Duration,
    max_backoff: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default())
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            reconnect_delay: config.reconnect_delay,
            login_retry_delay: config.login_retry_delay,
            max_backoff: config.max_backoff,
        }
    }

    pub fn base_delay(&self, reason: RetryReason) -> Duration {
        match reason {
            RetryReason::Transport => self.reconnect_delay,
            RetryReason::Login => self.login_retry_delay,
        }
    }

    /// Exponential delay for a 1-based attempt, capped at `max_backoff`
    /// but never below the base delay.
    pub fn scheduled_delay(&self, reason: RetryReason, attempt: u32) -> Duration {
        let base = self.base_delay(reason);
        let exponent = attempt.saturating_sub(1).min(16);
        base.saturating_mul(1 << exponent)
            .min(self.max_backoff)
            .max(base)
    }

    /// `scheduled_delay` plus up to 20% random jitter.
    pub fn delay(&self, reason: RetryReason, attempt: u32) -> Duration {
        let scheduled = self.scheduled_delay(reason, attempt);
        let jitter_ceiling = (scheduled.as_millis() / 5) as u64;
        let jitter = if jitter_ceiling == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ceiling)
        };
        scheduled + Duration::from_millis(jitter)
    }
}

enum Step {
    Connect,
    Await,
    Retry {
        reason: RetryReason,
        disconnect: bool,
    },
    Exit,
}

pub struct Supervisor {
    bot: Arc<Bot>,
    client: Arc<dyn SteamClient>,
    events: mpsc::UnboundedReceiver<SteamEvent>,
    credentials: LogOnDetails,
    policy: BackoffPolicy,
    cancel: CancellationToken,
    state: BotState,
    attempts: u32,
}

impl Supervisor {
    pub fn new(
        bot: Arc<Bot>,
        session: SteamSession,
        credentials: LogOnDetails,
        policy: BackoffPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            bot,
            client: session.client,
            events: session.events,
            credentials,
            policy,
            cancel,
            state: BotState::Initial,
            attempts: 0,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!(username = %self.bot.username(), "bot supervisor started");
        let mut step = Step::Connect;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            step = match step {
                Step::Connect => self.connect().await,
                Step::Await => self.next_event().await,
                Step::Retry { reason, disconnect } => self.backoff(reason, disconnect).await,
                Step::Exit => break,
            };
        }
        self.stop().await;
    }

    async fn move_to(&mut self, next: Session) {
        let to = next.state();
        if self.bot.transition(next, self.attempts).await {
            self.state = to;
        }
    }

    async fn connect(&mut self) -> Step {
        self.move_to(Session::Connecting).await;
        info!(username = %self.bot.username(), attempt = self.attempts, "connecting to steam");

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Step::Exit,
            result = self.client.connect() => result,
        };
        match result {
            Ok(()) => Step::Await,
            Err(error) => {
                warn!(username = %self.bot.username(), error = %error, "steam connect failed");
                Step::Retry {
                    reason: RetryReason::Transport,
                    disconnect: false,
                }
            }
        }
    }

    async fn next_event(&mut self) -> Step {
        let event = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Step::Exit,
            event = self.events.recv() => event,
        };
        match event {
            Some(event) => self.handle_event(event).await,
            None => {
                warn!(username = %self.bot.username(), "steam event stream closed");
                Step::Exit
            }
        }
    }

    async fn handle_event(&mut self, event: SteamEvent) -> Step {
        let username = self.bot.username().to_string();
        match (self.state, event) {
            (BotState::Connecting, SteamEvent::Connected) => {
                info!(username = %username, "connected to steam");
                self.move_to(Session::Authenticating).await;
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Step::Exit,
                    _ = self.client.log_on(&self.credentials) => Step::Await,
                }
            }
            (BotState::Authenticating, SteamEvent::LoggedOn) => {
                let gc = match self.client.game_coordinator() {
                    Ok(gc) => gc,
                    Err(error) => {
                        warn!(username = %username, error = %error, "failed to open game coordinator session");
                        return Step::Retry {
                            reason: RetryReason::Transport,
                            disconnect: true,
                        };
                    }
                };
                self.attempts = 0;
                self.move_to(Session::Ready(gc)).await;
                self.client.set_persona_state(PersonaState::Online).await;
                info!(username = %username, "logged on to steam; bot ready");
                Step::Await
            }
            (BotState::Authenticating, SteamEvent::LogOnFailed(result)) => {
                warn!(username = %username, result = %result, "steam logon failed");
                Step::Retry {
                    reason: RetryReason::Login,
                    disconnect: true,
                }
            }
            (BotState::Authenticating | BotState::Ready, SteamEvent::LoggedOff(result)) => {
                warn!(username = %username, result = %result, "logged off from steam");
                Step::Retry {
                    reason: RetryReason::Login,
                    disconnect: true,
                }
            }
            (
                BotState::Connecting | BotState::Authenticating | BotState::Ready,
                SteamEvent::Disconnected,
            ) => {
                warn!(username = %username, state = %self.state, "disconnected from steam");
                Step::Retry {
                    reason: RetryReason::Transport,
                    disconnect: false,
                }
            }
            (state, event) => {
                debug!(username = %username, %state, ?event, "ignoring steam event");
                Step::Await
            }
        }
    }

    async fn backoff(&mut self, reason: RetryReason, disconnect: bool) -> Step {
        self.attempts = self.attempts.saturating_add(1);
        self.move_to(Session::Backoff).await;
        if disconnect {
            self.client.disconnect().await;
        }

        let delay = self.policy.delay(reason, self.attempts);
        info!(
            username = %self.bot.username(),
            ?reason,
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling steam reconnect"
        );

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Step::Exit,
                _ = &mut sleep => return Step::Connect,
                event = self.events.recv() => match event {
                    Some(event) => {
                        debug!(username = %self.bot.username(), ?event, "discarding steam event during backoff");
                    }
                    None => {
                        warn!(username = %self.bot.username(), "steam event stream closed");
                        return Step::Exit;
                    }
                },
            }
        }
    }

    async fn stop(&mut self) {
        self.move_to(Session::Stopped).await;
        self.client.disconnect().await;
        info!(username = %self.bot.username(), "bot supervisor stopped");
    }
}
