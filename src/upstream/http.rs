// =============================================================================
// Matrixon Sync Gateway - HTTP Upstream Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   reqwest implementation of the upstream seam. Base URLs come from the
//   configured overrides, then `.well-known/matrix/client`, then
//   `https://<server>`; both base URLs and per-credential handles are cached.
//
// =============================================================================

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use matrixon_gateway_core::{
    utils::redact_token, GatewayError, MessagesResponse, Result, SyncEvent, WhoAmI,
};
use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{Direction, Homeserver, HomeserverConnector, UpstreamReply};
use crate::config::Config;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const WELL_KNOWN_TIMEOUT: Duration = Duration::from_secs(5);
const DISCOVERY_RETRY: Duration = Duration::from_secs(60);
// Slack on top of the long-poll timeout before the request itself is abandoned.
const SYNC_GRACE: Duration = Duration::from_secs(15);

#[derive(Deserialize)]
struct WellKnownClient {
    #[serde(rename = "m.homeserver")]
    homeserver: Option<WellKnownHomeserver>,
}

#[derive(Deserialize)]
struct WellKnownHomeserver {
    base_url: String,
}

/// Result of a `.well-known/matrix/client` lookup.
#[derive(Debug)]
enum Discovery {
    Found(Url),
    /// No client discovery published, the server's own origin is the base URL
    Absent,
    /// Nothing conclusive, the lookup is repeated later
    Failed(String),
}

struct CachedBase {
    url: Url,
    /// Set when discovery failed; the entry is only trusted until then
    retry_at: Option<Instant>,
}

impl CachedBase {
    fn is_usable(&self) -> bool {
        self.retry_at.map_or(true, |retry_at| Instant::now() < retry_at)
    }
}

struct CachedConnection {
    handle: Arc<HttpHomeserver>,
    last_used: Instant,
}

#[derive(Deserialize)]
struct JoinedRoomsBody {
    #[serde(default)]
    joined_rooms: Vec<String>,
}

fn transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_builder() {
        GatewayError::Internal(format!("Failed to build upstream request: {}", err))
    } else {
        GatewayError::TransientNetwork(err.to_string())
    }
}

fn endpoint(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| GatewayError::Internal(format!("Homeserver URL {} cannot be a base", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

async fn get_json<T: DeserializeOwned>(client: &Client, url: Url, credential: &str) -> Result<T> {
    let response = client
        .get(url)
        .bearer_auth(credential)
        .timeout(REQUEST_TIMEOUT)
        .send()
        .await
        .map_err(transport_error)?;

    let status = response.status();
    let body = response.bytes().await.map_err(transport_error)?;
    if !status.is_success() {
        return Err(GatewayError::from_upstream(status.as_u16(), &body));
    }
    Ok(serde_json::from_slice(&body)?)
}

/// Connector that talks to real homeservers over HTTPS.
pub struct HttpConnector {
    client: Client,
    /// Configured base URLs, never replaced by discovery
    overrides: HashMap<String, Url>,
    /// Discovered base URLs
    base_urls: DashMap<String, CachedBase>,
    discovery_retry: Duration,
    /// Open handles keyed by (server, credential)
    connections: DashMap<(String, String), CachedConnection>,
    sync_timeout: Duration,
}

impl HttpConnector {
    #[instrument(level = "debug", skip(config))]
    pub fn new(config: &Config) -> Result<Self> {
        let start = Instant::now();
        info!("🔧 Creating upstream HTTP connector");

        let client = Client::builder()
            .user_agent(concat!("matrixon-gateway/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let overrides = config
            .homeserver_overrides
            .iter()
            .map(|(server, base_url)| {
                Url::parse(base_url)
                    .map(|url| (server.clone(), url))
                    .map_err(|e| GatewayError::Config(format!("homeserver_overrides.{}: {}", server, e)))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        info!(
            "✅ Upstream HTTP connector created with {} override(s) in {:?}",
            overrides.len(),
            start.elapsed()
        );
        Ok(Self {
            client,
            overrides,
            base_urls: DashMap::new(),
            discovery_retry: DISCOVERY_RETRY,
            connections: DashMap::new(),
            sync_timeout: config.upstream_timeout(),
        })
    }

    /// Client API base URL of `server`.
    #[instrument(level = "debug", skip(self))]
    pub async fn base_url(&self, server: &str) -> Result<Url> {
        if let Some(url) = self.overrides.get(server) {
            return Ok(url.clone());
        }
        let origin = Url::parse(&format!("https://{}", server))
            .map_err(|e| GatewayError::BadRequest(format!("Invalid homeserver name {}: {}", server, e)))?;
        Ok(self.base_url_at(server, origin).await)
    }

    async fn base_url_at(&self, server: &str, origin: Url) -> Url {
        if let Some(cached) = self.base_urls.get(server) {
            if cached.is_usable() {
                return cached.url.clone();
            }
        }

        let (url, retry_at) = match self.discover(&origin).await {
            Discovery::Found(url) => (url, None),
            Discovery::Absent => (origin, None),
            Discovery::Failed(reason) => {
                warn!(
                    "⚠️ Client discovery for {} failed ({}), using {} for now",
                    server, reason, origin
                );
                (origin, Some(Instant::now() + self.discovery_retry))
            }
        };
        debug!("🔍 Resolved {} to {}", server, url);
        self.base_urls.insert(
            server.to_owned(),
            CachedBase {
                url: url.clone(),
                retry_at,
            },
        );
        url
    }

    async fn discover(&self, origin: &Url) -> Discovery {
        let url = match origin.join(".well-known/matrix/client") {
            Ok(url) => url,
            Err(e) => return Discovery::Failed(e.to_string()),
        };
        let response = match self.client.get(url).timeout(WELL_KNOWN_TIMEOUT).send().await {
            Ok(response) => response,
            Err(e) => return Discovery::Failed(e.to_string()),
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Discovery::Absent;
        }
        if !status.is_success() {
            return Discovery::Failed(format!("status {}", status));
        }
        match response.json::<WellKnownClient>().await {
            Ok(WellKnownClient { homeserver: None }) => Discovery::Absent,
            Ok(WellKnownClient {
                homeserver: Some(homeserver),
            }) => match Url::parse(&homeserver.base_url) {
                Ok(url) => Discovery::Found(url),
                Err(e) => Discovery::Failed(format!("invalid base_url: {}", e)),
            },
            Err(e) => Discovery::Failed(e.to_string()),
        }
    }
}

#[async_trait]
impl HomeserverConnector for HttpConnector {
    async fn prepare(&self, server: &str) -> Result<()> {
        self.base_url(server).await.map(|_| ())
    }

    #[instrument(level = "debug", skip(self, credential))]
    async fn whoami(&self, server: &str, credential: &str) -> Result<WhoAmI> {
        let base = self.base_url(server).await?;
        let url = endpoint(&base, &["_matrix", "client", "v3", "account", "whoami"])?;
        get_json(&self.client, url, credential).await
    }

    #[instrument(level = "debug", skip(self, credential))]
    async fn connect(&self, server: &str, credential: &str) -> Result<Arc<dyn Homeserver>> {
        let key = (server.to_owned(), credential.to_owned());
        if let Some(mut existing) = self.connections.get_mut(&key) {
            existing.last_used = Instant::now();
            let handle: Arc<dyn Homeserver> = existing.handle.clone();
            return Ok(handle);
        }

        let start = Instant::now();
        let base_url = self.base_url(server).await?;
        let whoami_url = endpoint(&base_url, &["_matrix", "client", "v3", "account", "whoami"])?;
        let whoami: WhoAmI = get_json(&self.client, whoami_url, credential).await?;

        let handle = Arc::new(HttpHomeserver {
            client: self.client.clone(),
            base_url,
            server_name: server.to_owned(),
            credential: credential.to_owned(),
            whoami,
            sync_timeout: self.sync_timeout,
        });
        let stored = self
            .connections
            .entry(key)
            .or_insert(CachedConnection {
                handle,
                last_used: Instant::now(),
            })
            .handle
            .clone();
        info!(
            "✅ Connected to {} as {} ({}) in {:?}",
            server,
            stored.whoami.user_id,
            redact_token(credential),
            start.elapsed()
        );
        let handle: Arc<dyn Homeserver> = stored;
        Ok(handle)
    }

    fn forget(&self, credential: &str) {
        self.connections.retain(|(_, cached), _| cached != credential);
    }

    fn prune_idle(&self, max_idle: Duration) -> usize {
        let before = self.connections.len();
        self.connections
            .retain(|_, connection| connection.last_used.elapsed() <= max_idle);
        before.saturating_sub(self.connections.len())
    }
}

/// Authenticated handle to one homeserver.
pub struct HttpHomeserver {
    client: Client,
    base_url: Url,
    server_name: String,
    credential: String,
    whoami: WhoAmI,
    sync_timeout: Duration,
}

impl HttpHomeserver {
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        endpoint(&self.base_url, segments)
    }
}

#[async_trait]
impl Homeserver for HttpHomeserver {
    fn server_name(&self) -> &str {
        &self.server_name
    }

    fn whoami(&self) -> &WhoAmI {
        &self.whoami
    }

    #[instrument(level = "debug", skip(self, query), fields(user = %self.whoami.user_id))]
    async fn sync(&self, query: &str) -> Result<UpstreamReply> {
        let mut url = self.endpoint(&["_matrix", "client", "v3", "sync"])?;
        if !query.is_empty() {
            url.set_query(Some(query));
        }

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.credential)
            .timeout(self.sync_timeout + SYNC_GRACE)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = response.bytes().await.map_err(transport_error)?.to_vec();
        debug!("📥 Upstream sync answered {} with {} bytes", status, body.len());

        Ok(UpstreamReply {
            status,
            content_type,
            body,
        })
    }

    #[instrument(level = "debug", skip(self))]
    async fn joined_rooms(&self) -> Result<Vec<String>> {
        let url = self.endpoint(&["_matrix", "client", "v3", "joined_rooms"])?;
        let body: JoinedRoomsBody = get_json(&self.client, url, &self.credential).await?;
        Ok(body.joined_rooms)
    }

    #[instrument(level = "debug", skip(self))]
    async fn direct_rooms(&self) -> Result<HashSet<String>> {
        let url = self.endpoint(&[
            "_matrix",
            "client",
            "v3",
            "user",
            self.whoami.user_id.as_str(),
            "account_data",
            "m.direct",
        ])?;
        match get_json::<HashMap<String, Vec<String>>>(&self.client, url, &self.credential).await {
            Ok(direct) => Ok(direct.into_values().flatten().collect()),
            Err(GatewayError::UpstreamProtocol { status: 404, .. }) => Ok(HashSet::new()),
            Err(e) => Err(e),
        }
    }

    #[instrument(level = "debug", skip(self))]
    async fn room_state(&self, room_id: &str) -> Result<Vec<SyncEvent>> {
        let url = self.endpoint(&["_matrix", "client", "v3", "rooms", room_id, "state"])?;
        get_json(&self.client, url, &self.credential).await
    }

    #[instrument(level = "debug", skip(self))]
    async fn room_messages(
        &self,
        room_id: &str,
        limit: u32,
        dir: Direction,
    ) -> Result<MessagesResponse> {
        let mut url = self.endpoint(&["_matrix", "client", "v3", "rooms", room_id, "messages"])?;
        url.query_pairs_mut()
            .append_pair("dir", dir.as_str())
            .append_pair("limit", &limit.to_string());
        get_json(&self.client, url, &self.credential).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode as ServerStatus, routing::get, Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_log::test;

    /// Serves `.well-known/matrix/client`, answering the n-th request with
    /// `replies[n]` (the last entry repeats).
    async fn well_known_server(
        replies: Vec<(ServerStatus, serde_json::Value)>,
    ) -> (Url, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let replies = Arc::new(replies);
        let router = Router::new().route(
            "/.well-known/matrix/client",
            get(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let replies = Arc::clone(&replies);
                async move {
                    let (status, body) = replies[n.min(replies.len() - 1)].clone();
                    (status, Json(body))
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (Url::parse(&format!("http://{addr}/")).unwrap(), hits)
    }

    fn connector() -> HttpConnector {
        HttpConnector::new(&Config::with_auth_homeservers(["example.org"])).unwrap()
    }

    #[test]
    fn test_endpoint_joins_segments() {
        let base = Url::parse("https://matrix.example.org/").unwrap();
        let url = endpoint(&base, &["_matrix", "client", "v3", "sync"]).unwrap();
        assert_eq!(url.as_str(), "https://matrix.example.org/_matrix/client/v3/sync");

        let prefixed = Url::parse("https://example.org/matrix").unwrap();
        let url = endpoint(&prefixed, &["_matrix", "client", "v3", "joined_rooms"]).unwrap();
        assert_eq!(url.as_str(), "https://example.org/matrix/_matrix/client/v3/joined_rooms");
    }

    #[test(tokio::test)]
    async fn test_override_wins_over_discovery() {
        let mut config = Config::with_auth_homeservers(["example.org"]);
        config
            .homeserver_overrides
            .insert("example.org".into(), "http://127.0.0.1:8008".into());
        let connector = HttpConnector::new(&config).unwrap();
        let url = connector.base_url("example.org").await.unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8008/");
    }

    #[test(tokio::test)]
    async fn test_discovered_base_url_is_cached() {
        let (origin, hits) = well_known_server(vec![(
            ServerStatus::OK,
            json!({ "m.homeserver": { "base_url": "https://matrix.example.org" } }),
        )])
        .await;
        let connector = connector();

        for _ in 0..2 {
            let url = connector.base_url_at("example.org", origin.clone()).await;
            assert_eq!(url.as_str(), "https://matrix.example.org/");
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test(tokio::test)]
    async fn test_missing_well_known_pins_origin() {
        let (origin, hits) =
            well_known_server(vec![(ServerStatus::NOT_FOUND, json!({ "errcode": "M_NOT_FOUND" }))])
                .await;
        let mut connector = connector();
        connector.discovery_retry = Duration::ZERO;

        for _ in 0..2 {
            assert_eq!(connector.base_url_at("example.org", origin.clone()).await, origin);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test(tokio::test)]
    async fn test_failed_discovery_is_retried() {
        let (origin, hits) = well_known_server(vec![
            (ServerStatus::SERVICE_UNAVAILABLE, json!({})),
            (
                ServerStatus::OK,
                json!({ "m.homeserver": { "base_url": "https://matrix.example.org" } }),
            ),
        ])
        .await;
        let mut connector = connector();
        connector.discovery_retry = Duration::ZERO;

        assert_eq!(connector.base_url_at("example.org", origin.clone()).await, origin);
        let url = connector.base_url_at("example.org", origin.clone()).await;
        assert_eq!(url.as_str(), "https://matrix.example.org/");
        connector.base_url_at("example.org", origin).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test(tokio::test)]
    async fn test_failed_discovery_is_not_retried_before_deadline() {
        let (origin, hits) =
            well_known_server(vec![(ServerStatus::BAD_GATEWAY, json!({}))]).await;
        let connector = connector();

        connector.base_url_at("example.org", origin.clone()).await;
        connector.base_url_at("example.org", origin).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_prune_idle_connections() {
        let connector = connector();
        let handle = |credential: &str| {
            Arc::new(HttpHomeserver {
                client: connector.client.clone(),
                base_url: Url::parse("https://example.org").unwrap(),
                server_name: "example.org".to_owned(),
                credential: credential.to_owned(),
                whoami: WhoAmI {
                    user_id: "@alice:example.org".try_into().unwrap(),
                    device_id: None,
                    is_guest: false,
                },
                sync_timeout: Duration::from_secs(30),
            })
        };
        let stale = Instant::now()
            .checked_sub(Duration::from_secs(120))
            .unwrap_or_else(Instant::now);
        connector.connections.insert(
            ("example.org".into(), "old".into()),
            CachedConnection {
                handle: handle("old"),
                last_used: stale,
            },
        );
        connector.connections.insert(
            ("example.org".into(), "new".into()),
            CachedConnection {
                handle: handle("new"),
                last_used: Instant::now(),
            },
        );

        assert_eq!(connector.prune_idle(Duration::from_secs(60)), 1);
        assert!(connector
            .connections
            .contains_key(&("example.org".to_owned(), "new".to_owned())));
    }

    #[test]
    fn test_invalid_override_is_config_error() {
        let mut config = Config::with_auth_homeservers(["example.org"]);
        config
            .homeserver_overrides
            .insert("example.org".into(), "::nonsense".into());
        assert!(matches!(HttpConnector::new(&config), Err(GatewayError::Config(_))));
    }
}
