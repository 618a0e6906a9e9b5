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
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use lobby_common::{
    DEFAULT_MAX_BACKOFF, LOGIN_RETRY_DELAY_FLOOR, RECONNECT_DELAY_FLOOR, expand_env_vars_with,
};
use serde::Deserialize;
use serde_yaml::Value;
use tracing::{info, warn};

const ENV_PREFIX: &str = "DOTA_LOBBY_";
const CONFIG_FILE: &str = "config.yaml";
const SECRETS_FILE: &str = "secrets.yaml";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: i64 = 8080;
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub bots: Vec<BotConfig>,
    pub supervisor: SupervisorConfig,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// `None` disables authentication on protected routes.
    pub api_key: Option<String>,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Clone)]
pub struct BotConfig {
    pub username: String,
    pub password: String,
    pub sentry_hash: Option<String>,
    pub enabled: bool,
}

impl fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BotConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("enabled", &self.enabled)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub reconnect_delay: Duration,
    pub login_retry_delay: Duration,
    pub max_backoff: Duration,
    pub drain_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: RECONNECT_DELAY_FLOOR,
            login_retry_delay: LOGIN_RETRY_DELAY_FLOOR,
            max_backoff: DEFAULT_MAX_BACKOFF,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerSection,
    bots: Vec<BotEntry>,
    supervisor: SupervisorSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServerSection {
    host: Option<String>,
    port: Option<i64>,
    api_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BotEntry {
    username: String,
    password: String,
    sentry_hash: Option<String>,
    enabled: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SupervisorSection {
    reconnect_delay_secs: Option<u64>,
    login_retry_delay_secs: Option<u64>,
    max_backoff_secs: Option<u64>,
    drain_timeout_secs: Option<u64>,
}

/// Locates and layers `config.yaml`, `secrets.yaml` and `DOTA_LOBBY_*`
/// environment overrides.
pub struct ConfigLoader {
    search_paths: Vec<PathBuf>,
    env: HashMap<String, String>,
}

impl ConfigLoader {
    pub fn from_env() -> Self {
        let env: HashMap<String, String> = std::env::vars().collect();
        let mut search_paths = Vec::new();
        if let Some(dir) = env
            .get("DOTA_LOBBY_CONFIG_DIR")
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
        {
            search_paths.push(PathBuf::from(dir));
        }
        search_paths.push(PathBuf::from("."));
        search_paths.push(PathBuf::from("./config"));
        search_paths.push(PathBuf::from("/etc/dota_lobby"));
        if let Some(home) = dirs::home_dir() {
            search_paths.push(home.join(".config").join("dota_lobby"));
        }
        Self::new(search_paths, env)
    }

    pub fn new(search_paths: Vec<PathBuf>, env: HashMap<String, String>) -> Self {
        Self { search_paths, env }
    }

    pub fn load(&self) -> anyhow::Result<Config> {
        let mut merged = Value::Mapping(Default::default());

        match self.read_layer(CONFIG_FILE)? {
            Some((path, layer)) => {
                info!(path = %path.display(), "loaded configuration file");
                merge_yaml(&mut merged, layer);
            }
            None => info!("no config.yaml found; using defaults and environment"),
        }

        match self.read_layer(SECRETS_FILE)? {
            Some((path, layer)) => {
                info!(path = %path.display(), "loaded secrets file");
                merge_yaml(&mut merged, lift_secrets_section(layer));
            }
            None => warn!("secrets.yaml not found; no bots will be configured from secrets"),
        }

        let mut file: ConfigFile =
            serde_yaml::from_value(merged).context("unable to decode configuration")?;
        self.apply_env_overrides(&mut file)?;
        validate(file)
    }

    fn read_layer(&self, file_name: &str) -> anyhow::Result<Option<(PathBuf, Value)>> {
        let Some(path) = self.find(file_name) else {
            return Ok(None);
        };
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("error reading {}", path.display()))?;
        let expanded = expand_env_vars_with(&raw, |name| self.env.get(name).cloned());
        if expanded.trim().is_empty() {
            return Ok(Some((path, Value::Mapping(Default::default()))));
        }
        let value: Value = serde_yaml::from_str(&expanded)
            .with_context(|| format!("error parsing {}", path.display()))?;
        Ok(Some((path, value)))
    }

    fn find(&self, file_name: &str) -> Option<PathBuf> {
        self.search_paths
            .iter()
            .map(|dir| dir.join(file_name))
            .find(|candidate| is_file(candidate))
    }

    fn env_value(&self, key: &str) -> Option<&str> {
        let name = format!("{ENV_PREFIX}{}", key.replace('.', "_").to_ascii_uppercase());
        self.env.get(&name).map(String::as_str)
    }

    fn env_secs(&self, key: &str) -> anyhow::Result<Option<u64>> {
        self.env_value(key)
            .map(|raw| {
                raw.trim()
                    .parse::<u64>()
                    .with_context(|| format!("invalid value for {key}: {raw}"))
            })
            .transpose()
    }

    fn apply_env_overrides(&self, file: &mut ConfigFile) -> anyhow::Result<()> {
        if let Some(host) = self.env_value("server.host") {
            file.server.host = Some(host.to_string());
        }
        if let Some(raw) = self.env_value("server.port") {
            let port = raw
                .trim()
                .parse::<i64>()
                .with_context(|| format!("invalid value for server.port: {raw}"))?;
            file.server.port = Some(port);
        }
        if let Some(api_key) = self.env_value("server.api_key") {
            file.server.api_key = Some(api_key.to_string());
        }
        if let Some(secs) = self.env_secs("supervisor.reconnect_delay_secs")? {
            file.supervisor.reconnect_delay_secs = Some(secs);
        }
        if let Some(secs) = self.env_secs("supervisor.login_retry_delay_secs")? {
            file.supervisor.login_retry_delay_secs = Some(secs);
        }
        if let Some(secs) = self.env_secs("supervisor.max_backoff_secs")? {
            file.supervisor.max_backoff_secs = Some(secs);
        }
        if let Some(secs) = self.env_secs("supervisor.drain_timeout_secs")? {
            file.supervisor.drain_timeout_secs = Some(secs);
        }
        Ok(())
    }
}

fn is_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

/// Accepts secrets written either flat (`bots: [...]`) or nested under a
/// top-level `secrets:` key.
fn lift_secrets_section(value: Value) -> Value {
    match value {
        Value::Mapping(mut mapping) => match mapping.remove("secrets") {
            Some(nested @ Value::Mapping(_)) => {
                let mut lifted = Value::Mapping(mapping);
                merge_yaml(&mut lifted, nested);
                lifted
            }
            Some(other) => {
                mapping.insert(Value::from("secrets"), other);
                Value::Mapping(mapping)
            }
            None => Value::Mapping(mapping),
        },
        other => other,
    }
}

/// Deep-merges mappings; any other overlay value replaces the base.
fn merge_yaml(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (base, overlay) => *base = overlay,
    }
}

fn normalize_optional_string(value: Option<String>) -> Option<String> {
    value
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
}

fn at_least(name: &str, configured: Option<u64>, default: Duration, floor: Duration) -> Duration {
    let value = configured.map(Duration::from_secs).unwrap_or(default);
    if value < floor {
        warn!(
            setting = name,
            configured_secs = value.as_secs(),
            floor_secs = floor.as_secs(),
            "retry delay below minimum; using minimum"
        );
        floor
    } else {
        value
    }
}

fn validate(file: ConfigFile) -> anyhow::Result<Config> {
    let port = file.server.port.unwrap_or(DEFAULT_PORT);
    if !(1..=65535).contains(&port) {
        anyhow::bail!("invalid server port: {port}");
    }
    let host = normalize_optional_string(file.server.host).unwrap_or_else(|| DEFAULT_HOST.to_string());

    let mut bots = Vec::with_capacity(file.bots.len());
    for (index, entry) in file.bots.into_iter().enumerate() {
        if entry.username.trim().is_empty() {
            anyhow::bail!("bot {index}: username is required");
        }
        if entry.password.is_empty() {
            anyhow::bail!("bot {index}: password is required");
        }
        bots.push(BotConfig {
            username: entry.username,
            password: entry.password,
            sentry_hash: normalize_optional_string(entry.sentry_hash),
            enabled: entry.enabled.unwrap_or(true),
        });
    }

    let reconnect_delay = at_least(
        "reconnect_delay_secs",
        file.supervisor.reconnect_delay_secs,
        RECONNECT_DELAY_FLOOR,
        RECONNECT_DELAY_FLOOR,
    );
    let login_retry_delay = at_least(
        "login_retry_delay_secs",
        file.supervisor.login_retry_delay_secs,
        LOGIN_RETRY_DELAY_FLOOR,
        LOGIN_RETRY_DELAY_FLOOR,
    );
    let max_backoff = file
        .supervisor
        .max_backoff_secs
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_MAX_BACKOFF)
        .max(login_retry_delay)
        .max(reconnect_delay);
    let drain_timeout = file
        .supervisor
        .drain_timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_DRAIN_TIMEOUT);

    Ok(Config {
        server: ServerConfig {
            host,
            port: port as u16,
            api_key: normalize_optional_string(file.server.api_key),
        },
        bots,
        supervisor: SupervisorConfig {
            reconnect_delay,
            login_retry_delay,
            max_backoff,
            drain_timeout,
        },
    })
}
