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

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use steam_link::{LogOnDetails, SteamConnector};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::SupervisorConfig,
    supervisor::{BackoffPolicy, Bot, BotSnapshot, Supervisor},
};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("bot {0} is already registered")]
    DuplicateBot(String),
    #[error("invalid bot: {0}")]
    InvalidBot(String),
    #[error("bot {0} not found")]
    NotFound(String),
    #[error("no available bots")]
    NoneAvailable,
    #[error("registry is shutting down")]
    ShuttingDown,
}

#[derive(Default)]
struct Members {
    bots: HashMap<String, Arc<Bot>>,
    order: Vec<Arc<Bot>>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

/// Username-keyed set of supervised bots.
///
/// Lock order is registry first, then a bot's own record. Nothing holds
/// the registry lock while waiting on the network.
pub struct BotRegistry {
    members: RwLock<Members>,
    cursor: AtomicUsize,
    connector: Arc<dyn SteamConnector>,
    policy: BackoffPolicy,
    drain_timeout: Duration,
    cancel: CancellationToken,
}

impl BotRegistry {
    pub fn new(
        connector: Arc<dyn SteamConnector>,
        config: &SupervisorConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            members: RwLock::new(Members::default()),
            cursor: AtomicUsize::new(0),
            connector,
            policy: BackoffPolicy::from_config(config),
            drain_timeout: config.drain_timeout,
            cancel,
        }
    }

    #[cfg(test)]
    pub async fn add(&self, username: &str, password: &str) -> Result<Arc<Bot>, RegistryError> {
        self.add_bot(LogOnDetails {
            username: username.to_string(),
            password: password.to_string(),
            sentry_hash: None,
        })
        .await
    }

    /// Registers the account and starts its supervisor. The username is
    /// stored exactly as given.
    pub async fn add_bot(&self, credentials: LogOnDetails) -> Result<Arc<Bot>, RegistryError> {
        let username = credentials.username.clone();
        if username.trim().is_empty() {
            return Err(RegistryError::InvalidBot("username is required".to_string()));
        }
        if credentials.password.is_empty() {
            return Err(RegistryError::InvalidBot(format!(
                "{username}: password is required"
            )));
        }

        let mut members = self.members.write().await;
        if self.cancel.is_cancelled() {
            return Err(RegistryError::ShuttingDown);
        }
        if members.bots.contains_key(&username) {
            return Err(RegistryError::DuplicateBot(username));
        }

        let bot = Arc::new(Bot::new(username.clone()));
        let session = self.connector.open(&username);
        let handle = Supervisor::new(
            bot.clone(),
            session,
            credentials,
            self.policy.clone(),
            self.cancel.child_token(),
        )
        .spawn();

        members.bots.insert(username.clone(), bot.clone());
        members.order.push(bot.clone());
        members.tasks.push((username.clone(), handle));
        info!(username = %username, total = members.order.len(), "bot registered");
        Ok(bot)
    }

    pub async fn get(&self, username: &str) -> Result<Arc<Bot>, RegistryError> {
        self.members
            .read()
            .await
            .bots
            .get(username)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(username.to_string()))
    }

    /// Picks a Ready bot, starting the scan one slot further on each call
    /// so load rotates across the fleet.
    pub async fn pick_available(&self) -> Result<Arc<Bot>, RegistryError> {
        let members = self.members.read().await;
        let count = members.order.len();
        if count == 0 {
            return Err(RegistryError::NoneAvailable);
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % count;
        for offset in 0..count {
            let bot = &members.order[(start + offset) % count];
            if bot.is_ready().await {
                return Ok(bot.clone());
            }
        }
        Err(RegistryError::NoneAvailable)
    }

    pub async fn snapshot(&self) -> BTreeMap<String, BotSnapshot> {
        let members = self.members.read().await;
        let mut statuses = BTreeMap::new();
        for bot in &members.order {
            statuses.insert(bot.username().to_string(), bot.snapshot().await);
        }
        statuses
    }

    pub async fn len(&self) -> usize {
        self.members.read().await.order.len()
    }

    /// Cancels every supervisor and waits for them to stop. Supervisors
    /// that miss the drain window are aborted.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut self.members.write().await.tasks);
        info!(bots = tasks.len(), "stopping bot supervisors");

        for (username, mut handle) in tasks {
            match tokio::time::timeout(self.drain_timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    warn!(username = %username, error = %error, "bot supervisor task failed");
                }
                Err(_) => {
                    warn!(username = %username, "bot supervisor missed drain window; aborting");
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }

        let mut members = self.members.write().await;
        members.bots.clear();
        members.order.clear();
        info!("bot registry drained");
    }
}
