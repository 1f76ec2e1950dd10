// =============================================================================
// Matrixon Sync Gateway - Configuration Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Gateway configuration. Loaded from a TOML file (`[global]` table) merged
//   with `MATRIXON_GATEWAY_*` environment variables, then validated once at
//   startup.
//
// =============================================================================

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    providers::{Env, Format, Toml},
    value::Uncased,
    Figment,
};
use matrixon_gateway_core::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

/// Environment variable prefix; `MATRIXON_GATEWAY_PORT=8090` sets `port`.
pub const ENV_PREFIX: &str = "MATRIXON_GATEWAY_";

// Tables that can be addressed from the environment as `<TABLE>_<KEY>`.
static SUB_TABLES: [&str; 4] = ["fast_initial_sync", "sync", "identity", "room_info_cache"];

/// Configuration structure for the sync gateway
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_address")]
    pub address: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// `EnvFilter` directive string
    #[serde(default = "default_log")]
    pub log: String,
    #[serde(default = "default_max_request_size")]
    pub max_request_size: u32,

    /// Homeservers asked, in order of listing, to confirm unknown credentials
    #[serde(default)]
    pub auth_homeservers: Vec<String>,
    /// Users allowed to call the admin extension endpoints
    #[serde(default)]
    pub admins: Vec<String>,
    /// Server name to client API base URL, skipping `.well-known` discovery
    #[serde(default)]
    pub homeserver_overrides: HashMap<String, String>,
    /// Relative size of well known homeservers, used to order room preloading
    #[serde(default = "default_homeserver_weights")]
    pub homeserver_weights: HashMap<String, i64>,

    #[serde(default)]
    pub fast_initial_sync: FastInitialSyncConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub room_info_cache: RoomInfoCacheConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FastInitialSyncConfig {
    /// When off, `/sync` is relayed to the homeserver untouched
    pub enabled: bool,
    /// Reuse cached room state while preloading
    pub use_room_info_cache: bool,
    /// Rooms fetched concurrently during one preload pass
    pub preload_concurrency: usize,
    /// Delay before the first upstream poll of a fresh session
    pub initial_poll_delay_ms: u64,
    /// Timeline events requested per preloaded room
    pub timeline_limit: u32,
}

impl Default for FastInitialSyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            use_room_info_cache: true,
            preload_concurrency: 32,
            initial_poll_delay_ms: 15_000,
            timeline_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Wait budget when the client sends no `timeout`
    pub default_timeout_ms: u64,
    /// Upper bound on any client wait
    pub max_wait_ms: u64,
    /// Wait cap while a session is still in its initial phase
    pub initial_sync_wait_ms: u64,
    /// Floor for the load-shed wait reduction
    pub min_wait_ms: u64,
    /// Active session count above which waits shrink
    pub load_shed_threshold: usize,
    /// Sessions with a client request this recent count as active
    pub active_window_ms: u64,
    /// `timeout` forwarded to upstream long-polls
    pub upstream_timeout_ms: u64,
    /// Sessions with no client request for this long are dropped, 0 keeps them forever
    pub session_idle_ttl_s: u64,
    /// Period of the maintenance sweep
    pub sweep_interval_s: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 1_000,
            max_wait_ms: 30_000,
            initial_sync_wait_ms: 250,
            min_wait_ms: 100,
            load_shed_threshold: 64,
            active_window_ms: 60_000,
            upstream_timeout_ms: 30_000,
            session_idle_ttl_s: 86_400,
            sweep_interval_s: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Append-only `token<TAB>user_id` log
    pub token_map_path: PathBuf,
    /// Per-candidate wait during a lookup
    pub candidate_timeout_ms: u64,
    /// Candidates queried at the same time
    pub max_concurrent_lookups: usize,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            token_map_path: PathBuf::from("token_map"),
            candidate_timeout_ms: 500,
            max_concurrent_lookups: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RoomInfoCacheConfig {
    pub base_ttl_ms: u64,
    /// Extra lifetime per state event, so big rooms are refetched less often
    pub extra_ttl_per_state_ms: u64,
}

impl Default for RoomInfoCacheConfig {
    fn default() -> Self {
        Self {
            base_ttl_ms: 60_000,
            extra_ttl_per_state_ms: 100,
        }
    }
}

fn default_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8089
}

fn default_log() -> String {
    "info".to_owned()
}

fn default_max_request_size() -> u32 {
    20 * 1024 * 1024
}

fn default_homeserver_weights() -> HashMap<String, i64> {
    [
        ("matrix.org", 4000),
        ("gitter.im", 3000),
        ("mozilla.org", 2500),
        ("kde.org", 1500),
        ("gnome.org", 1500),
        ("envs.net", 1000),
        ("tchncs.de", 1000),
    ]
    .into_iter()
    .map(|(server, weight)| (server.to_owned(), weight))
    .collect()
}

/// Maps `FAST_INITIAL_SYNC_ENABLED` style keys onto `fast_initial_sync.enabled`.
pub fn map_env_key(key: &str) -> String {
    let lower = key.to_ascii_lowercase();
    for table in SUB_TABLES {
        if let Some(rest) = lower.strip_prefix(table).and_then(|r| r.strip_prefix('_')) {
            if !rest.is_empty() {
                return format!("{}.{}", table, rest);
            }
        }
    }
    lower
}

impl Config {
    /// Builds the figment for a config file plus environment overrides.
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path).nested())
            .merge(
                Env::prefixed(ENV_PREFIX)
                    .global()
                    .map(|k| Uncased::from(map_env_key(k.as_str()))),
            )
    }

    /// Loads and validates the configuration.
    pub fn load(path: &Path) -> Result<Self> {
        debug!("🔧 Loading configuration from {}", path.display());
        let config = Self::figment(path)
            .extract::<Self>()
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.auth_homeservers.iter().all(|s| s.trim().is_empty()) {
            return Err(GatewayError::Config(
                "auth_homeservers must list at least one homeserver".to_owned(),
            ));
        }
        if self.port == 0 {
            return Err(GatewayError::Config("port must not be 0".to_owned()));
        }
        if self.fast_initial_sync.preload_concurrency == 0 {
            return Err(GatewayError::Config(
                "fast_initial_sync.preload_concurrency must be at least 1".to_owned(),
            ));
        }
        if self.identity.max_concurrent_lookups == 0 {
            return Err(GatewayError::Config(
                "identity.max_concurrent_lookups must be at least 1".to_owned(),
            ));
        }
        for (server, base_url) in &self.homeserver_overrides {
            Url::parse(base_url).map_err(|e| {
                GatewayError::Config(format!("homeserver_overrides.{}: {}", server, e))
            })?;
        }
        Ok(())
    }

    /// Logs settings that are legal but probably unintended.
    pub fn warn_suspicious(&self) {
        if self.sync.initial_sync_wait_ms > self.sync.max_wait_ms {
            warn!("⚠️ sync.initial_sync_wait_ms exceeds sync.max_wait_ms, the lower value wins");
        }
        if self.sync.session_idle_ttl_s == 0 {
            warn!("⚠️ sync.session_idle_ttl_s is 0, sessions are never evicted");
        }
        if !self.fast_initial_sync.enabled {
            warn!("⚠️ Fast initial sync is disabled, /sync is relayed unchanged");
        }
    }

    /// Copy that can be shown to admins, with passwords in override URLs masked.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        for base_url in config.homeserver_overrides.values_mut() {
            let Ok(mut url) = Url::parse(base_url) else {
                continue;
            };
            if url.password().is_some() && url.set_password(Some("REDACTED")).is_ok() {
                *base_url = url.to_string();
            }
        }
        config
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.admins.iter().any(|admin| admin == user_id)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.sync.upstream_timeout_ms)
    }

    pub fn initial_poll_delay(&self) -> Duration {
        Duration::from_millis(self.fast_initial_sync.initial_poll_delay_ms)
    }

    pub fn candidate_timeout(&self) -> Duration {
        Duration::from_millis(self.identity.candidate_timeout_ms)
    }

    /// `None` means sessions are kept until shutdown.
    pub fn session_idle_ttl(&self) -> Option<Duration> {
        (self.sync.session_idle_ttl_s > 0).then(|| Duration::from_secs(self.sync.session_idle_ttl_s))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sync.sweep_interval_s.max(1))
    }

    /// Minimal configuration pointing at the given homeservers.
    pub fn with_auth_homeservers<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            address: default_address(),
            port: default_port(),
            log: default_log(),
            max_request_size: default_max_request_size(),
            auth_homeservers: servers.into_iter().map(Into::into).collect(),
            admins: Vec::new(),
            homeserver_overrides: HashMap::new(),
            homeserver_weights: default_homeserver_weights(),
            fast_initial_sync: FastInitialSyncConfig::default(),
            sync: SyncConfig::default(),
            identity: IdentityConfig::default(),
            room_info_cache: RoomInfoCacheConfig::default(),
        }
    }
}
