// =============================================================================
// Matrixon Sync Gateway - Identity Resolver Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Maps an opaque access token to the user that owns it. Known tokens are
//   served from memory (restored from the token map on first use); unknown
//   tokens are checked against every configured homeserver concurrently and
//   the first positive answer is persisted.
//
// =============================================================================

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use futures::{stream::FuturesUnordered, StreamExt};
use matrixon_gateway_core::{utils::redact_token, GatewayError, Result, UserIdentity, WhoAmI};
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, info, instrument, warn};

use crate::{config::Config, upstream::HomeserverConnector};

mod token_map;

pub use token_map::TokenMap;

pub struct IdentityResolver {
    candidates: Vec<String>,
    candidate_timeout: Duration,
    lookup_permits: Arc<Semaphore>,
    connector: Arc<dyn HomeserverConnector>,
    token_map: TokenMap,
    cache: DashMap<String, UserIdentity>,
    /// Lookups in progress, so concurrent first requests share one
    pending: DashMap<String, Arc<OnceCell<UserIdentity>>>,
    loaded: OnceCell<()>,
}

impl IdentityResolver {
    pub fn new(config: &Config, connector: Arc<dyn HomeserverConnector>) -> Self {
        Self {
            candidates: config
                .auth_homeservers
                .iter()
                .filter(|server| !server.trim().is_empty())
                .cloned()
                .collect(),
            candidate_timeout: config.candidate_timeout(),
            lookup_permits: Arc::new(Semaphore::new(config.identity.max_concurrent_lookups.max(1))),
            connector,
            token_map: TokenMap::new(&config.identity.token_map_path),
            cache: DashMap::new(),
            pending: DashMap::new(),
            loaded: OnceCell::new(),
        }
    }

    /// Identity behind `credential`.
    ///
    /// Repeated calls with a known credential never reach a homeserver.
    #[instrument(level = "debug", skip_all)]
    pub async fn resolve(&self, credential: Option<&str>) -> Result<UserIdentity> {
        let token = credential
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(GatewayError::MissingCredential)?;

        self.ensure_loaded().await?;
        if let Some(known) = self.cache.get(token) {
            return Ok(known.value().clone());
        }

        let flight = Arc::clone(&*self.pending.entry(token.to_owned()).or_default());
        let outcome = flight
            .get_or_try_init(|| self.lookup_and_record(token))
            .await
            .cloned();
        self.pending
            .remove_if(token, |_, current| Arc::ptr_eq(current, &flight));
        outcome
    }

    async fn lookup_and_record(&self, token: &str) -> Result<UserIdentity> {
        // A flight that just finished may already have recorded it.
        if let Some(known) = self.cache.get(token) {
            return Ok(known.value().clone());
        }

        let start = Instant::now();
        let identity = self.lookup(token).await?;
        self.token_map.append(token, Some(&identity.user_id)).await?;
        self.cache.insert(token.to_owned(), identity.clone());
        info!(
            "✅ Resolved {} to {} via {} in {:?}",
            redact_token(token),
            identity.user_id,
            identity.resolved_by.as_deref().unwrap_or("-"),
            start.elapsed()
        );
        Ok(identity)
    }

    /// Drops a credential a homeserver no longer accepts.
    pub async fn forget(&self, credential: &str) -> Result<()> {
        self.connector.forget(credential);
        if self.cache.remove(credential).is_some() {
            info!("🗑️ Forgetting rejected credential {}", redact_token(credential));
            self.token_map.append(credential, None).await?;
        }
        Ok(())
    }

    /// Number of credentials currently known.
    pub fn known_credentials(&self) -> usize {
        self.cache.len()
    }

    async fn ensure_loaded(&self) -> Result<()> {
        self.loaded
            .get_or_try_init(|| async {
                let start = Instant::now();
                let entries = self.token_map.load().await?;
                let count = entries.len();
                for (token, user_id) in entries {
                    self.cache.insert(token, UserIdentity::new(user_id));
                }
                info!(
                    "📁 Loaded {} credentials from {} in {:?}",
                    count,
                    self.token_map.path().display(),
                    start.elapsed()
                );
                Ok::<_, GatewayError>(())
            })
            .await?;
        Ok(())
    }

    /// Asks every candidate at once; the first non-empty answer wins.
    ///
    /// Only the `whoami` round-trip is bounded by the candidate timeout,
    /// preparing a candidate is not.
    async fn lookup(&self, token: &str) -> Result<UserIdentity> {
        let mut lookups: FuturesUnordered<_> = self
            .candidates
            .iter()
            .map(|candidate| async move {
                let outcome = self.ask(candidate, token).await;
                (candidate, outcome)
            })
            .collect();

        while let Some((candidate, outcome)) = lookups.next().await {
            match outcome {
                Ok(whoami) if !whoami.user_id.as_str().is_empty() => {
                    return Ok(UserIdentity {
                        user_id: whoami.user_id,
                        resolved_by: Some(candidate.clone()),
                    });
                }
                Ok(_) => debug!("🔍 {} returned an empty identity", candidate),
                Err(e) => debug!("🔍 {} did not accept {}: {}", candidate, redact_token(token), e),
            }
        }

        warn!("⚠️ No configured homeserver accepted {}", redact_token(token));
        Err(GatewayError::UnknownCredential {
            candidates: self.candidates.clone(),
        })
    }

    async fn ask(&self, candidate: &str, token: &str) -> Result<WhoAmI> {
        let _permit = self
            .lookup_permits
            .acquire()
            .await
            .map_err(|e| GatewayError::Internal(format!("Lookup pool closed: {}", e)))?;
        self.connector.prepare(candidate).await?;
        tokio::time::timeout(self.candidate_timeout, self.connector.whoami(candidate, token)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::FakeConnector,
        upstream::MockHomeserverConnector,
    };
    use mockall::predicate::eq;
    use ruma::user_id;
    use test_log::test;

    fn config(dir: &tempfile::TempDir, candidates: &[&str]) -> Config {
        let mut config = Config::with_auth_homeservers(candidates.iter().copied());
        config.identity.token_map_path = dir.path().join("token_map");
        config.identity.candidate_timeout_ms = 200;
        config
    }

    fn whoami(user: &str) -> WhoAmI {
        WhoAmI {
            user_id: user.try_into().unwrap(),
            device_id: None,
            is_guest: false,
        }
    }

    #[test(tokio::test)]
    async fn test_missing_credential() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = IdentityResolver::new(
            &config(&dir, &["a.example"]),
            Arc::new(MockHomeserverConnector::new()),
        );
        assert!(matches!(resolver.resolve(None).await, Err(GatewayError::MissingCredential)));
        assert!(matches!(
            resolver.resolve(Some("  ")).await,
            Err(GatewayError::MissingCredential)
        ));
    }

    #[test(tokio::test)]
    async fn test_known_credential_is_not_looked_up_again() {
        let dir = tempfile::tempdir().unwrap();
        let mut connector = MockHomeserverConnector::new();
        connector.expect_prepare().returning(|_| Ok(()));
        connector
            .expect_whoami()
            .with(eq("a.example"), eq("tok"))
            .times(1)
            .returning(|_, _| Ok(whoami("@alice:a.example")));

        let resolver = IdentityResolver::new(&config(&dir, &["a.example"]), Arc::new(connector));
        let first = resolver.resolve(Some("tok")).await.unwrap();
        let second = resolver.resolve(Some("tok")).await.unwrap();
        assert_eq!(first.user_id, second.user_id);
        assert_eq!(first.resolved_by.as_deref(), Some("a.example"));
        assert_eq!(resolver.known_credentials(), 1);
    }

    #[test(tokio::test)]
    async fn test_unknown_credential_names_all_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let mut connector = MockHomeserverConnector::new();
        connector.expect_prepare().times(3).returning(|_| Ok(()));
        connector.expect_whoami().times(3).returning(|_, _| {
            Err(GatewayError::TokenRejected {
                error: "Unknown token".into(),
                soft_logout: false,
            })
        });

        let resolver = IdentityResolver::new(
            &config(&dir, &["a.example", "b.example", "c.example"]),
            Arc::new(connector),
        );
        let err = resolver.resolve(Some("tok")).await.unwrap_err();
        assert_eq!(err.status_code(), 401);
        assert_eq!(err.errcode(), "M_UNKNOWN_TOKEN");
        let message = err.to_string();
        for candidate in ["a.example", "b.example", "c.example"] {
            assert!(message.contains(candidate), "{message}");
        }
    }

    #[test(tokio::test)]
    async fn test_slow_candidate_does_not_block_fast_one() {
        let dir = tempfile::tempdir().unwrap();
        let connector = FakeConnector::new()
            .with_account("slow.example", "tok", "@alice:slow.example", Duration::from_secs(5))
            .with_account("fast.example", "tok", "@alice:fast.example", Duration::ZERO);

        let resolver = IdentityResolver::new(
            &config(&dir, &["slow.example", "fast.example"]),
            Arc::new(connector),
        );
        let start = Instant::now();
        let identity = resolver.resolve(Some("tok")).await.unwrap();
        assert_eq!(identity.user_id, user_id!("@alice:fast.example"));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test(tokio::test)]
    async fn test_candidate_timeout_counts_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let connector = FakeConnector::new().with_account(
            "slow.example",
            "tok",
            "@alice:slow.example",
            Duration::from_secs(5),
        );
        let resolver = IdentityResolver::new(&config(&dir, &["slow.example"]), Arc::new(connector));

        let start = Instant::now();
        assert!(matches!(
            resolver.resolve(Some("tok")).await,
            Err(GatewayError::UnknownCredential { .. })
        ));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test(tokio::test)]
    async fn test_slow_discovery_is_outside_candidate_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(
            FakeConnector::new()
                .with_account("a.example", "tok", "@alice:a.example", Duration::ZERO)
                .with_discovery_delay("a.example", Duration::from_millis(400)),
        );
        let resolver = IdentityResolver::new(&config(&dir, &["a.example"]), connector.clone());

        let identity = resolver.resolve(Some("tok")).await.unwrap();
        assert_eq!(identity.user_id, user_id!("@alice:a.example"));
        assert_eq!(connector.prepare_calls(), 1);
    }

    #[test(tokio::test)]
    async fn test_concurrent_first_resolves_share_one_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(FakeConnector::new().with_account(
            "a.example",
            "tok",
            "@alice:a.example",
            Duration::from_millis(100),
        ));
        let resolver = IdentityResolver::new(&config(&dir, &["a.example"]), connector.clone());

        let identities =
            futures::future::join_all((0..8).map(|_| resolver.resolve(Some("tok")))).await;
        for identity in identities {
            assert_eq!(identity.unwrap().user_id, user_id!("@alice:a.example"));
        }
        assert_eq!(connector.whoami_calls(), 1);

        let log = std::fs::read_to_string(dir.path().join("token_map")).unwrap();
        assert_eq!(log.lines().count(), 1);
        assert!(resolver.pending.is_empty());
    }

    #[test(tokio::test)]
    async fn test_identity_survives_restart_and_forget() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(FakeConnector::new().with_account(
            "a.example",
            "tok",
            "@alice:a.example",
            Duration::ZERO,
        ));

        let first = IdentityResolver::new(&config(&dir, &["a.example"]), connector.clone());
        first.resolve(Some("tok")).await.unwrap();
        assert_eq!(connector.whoami_calls(), 1);

        let restarted = IdentityResolver::new(&config(&dir, &["a.example"]), connector.clone());
        let identity = restarted.resolve(Some("tok")).await.unwrap();
        assert_eq!(identity.user_id, user_id!("@alice:a.example"));
        assert_eq!(connector.whoami_calls(), 1);

        restarted.forget("tok").await.unwrap();
        let after_forget = IdentityResolver::new(&config(&dir, &["a.example"]), connector.clone());
        after_forget.resolve(Some("tok")).await.unwrap();
        assert_eq!(connector.whoami_calls(), 2);
    }
}
