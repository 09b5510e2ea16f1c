//! Credential cache — short-lived vendor bearer token with TTL reuse.
//!
//! The vendor issues no API keys; the only way to obtain a bearer token is to
//! log into its web console and observe the token the authenticated page puts
//! on its own fleet-data requests. That harvesting is expensive (a full
//! headless-browser session), so the token is cached and reused for every
//! request until its expiry instant. Requests at or after expiry force a
//! fresh acquisition.
//!
//! The cache holds a `tokio::sync::Mutex` across the whole miss path, so
//! simultaneous misses from concurrent callers trigger exactly one
//! acquisition (single-flight).

pub mod harvester;

pub use harvester::BrowserHarvester;

use crate::clock::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Token lifetime. The vendor session lasts about two hours; 90 minutes
/// leaves headroom so a cached token never dies mid-cycle.
pub const CREDENTIAL_TTL_MINUTES: i64 = 90;

/// Credential harvesting errors. Not retried within a cycle; they propagate
/// to the cycle boundary where the orchestrator logs and moves on.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("Browser launch failed: {0}")]
    Launch(String),

    #[error("Browser protocol error: {0}")]
    Protocol(String),

    #[error("Login element not found: {0}")]
    ElementNotFound(&'static str),

    #[error("Navigation timed out")]
    NavigationTimeout,

    #[error("Credential token never observed in outbound requests")]
    TokenNotObserved,
}

/// Token and account identifier captured from the vendor's authenticated page.
#[derive(Debug, Clone)]
pub struct HarvestedCredential {
    pub token: String,
    pub account_id: String,
}

/// A cached credential plus the instant it stops being valid.
#[derive(Debug, Clone)]
pub struct CachedCredential {
    pub token: String,
    pub account_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Performs one full credential acquisition. Implemented by
/// [`BrowserHarvester`] in production and by fakes in tests.
#[async_trait]
pub trait CredentialHarvester: Send + Sync {
    async fn harvest(&self) -> Result<HarvestedCredential, AcquisitionError>;
}

/// TTL cache in front of a [`CredentialHarvester`].
pub struct CredentialCache {
    harvester: Arc<dyn CredentialHarvester>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    slot: tokio::sync::Mutex<Option<CachedCredential>>,
}

impl CredentialCache {
    pub fn new(harvester: Arc<dyn CredentialHarvester>, clock: Arc<dyn Clock>) -> Self {
        Self {
            harvester,
            clock,
            ttl: Duration::minutes(CREDENTIAL_TTL_MINUTES),
            slot: tokio::sync::Mutex::new(None),
        }
    }

    /// Return a valid credential, reusing the cached one when it has not
    /// expired. On a miss, runs one acquisition and caches the result; on
    /// acquisition failure nothing is cached.
    pub async fn get_valid(&self) -> Result<CachedCredential, AcquisitionError> {
        let mut slot = self.slot.lock().await;

        if let Some(cached) = slot.as_ref() {
            if self.clock.now() < cached.expires_at {
                debug!(expires_at = %cached.expires_at, "Reusing cached vendor credential");
                return Ok(cached.clone());
            }
            debug!(expired_at = %cached.expires_at, "Cached vendor credential expired");
        }

        let harvested = self.harvester.harvest().await?;
        let credential = CachedCredential {
            token: harvested.token,
            account_id: harvested.account_id,
            expires_at: self.clock.now() + self.ttl,
        };
        info!(
            account = %credential.account_id,
            expires_at = %credential.expires_at,
            "Vendor credential acquired"
        );
        *slot = Some(credential.clone());
        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHarvester {
        calls: AtomicU32,
        fail: bool,
    }

    impl CountingHarvester {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CredentialHarvester for CountingHarvester {
        async fn harvest(&self) -> Result<HarvestedCredential, AcquisitionError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(AcquisitionError::TokenNotObserved);
            }
            Ok(HarvestedCredential {
                token: format!("token-{n}"),
                account_id: "acct-1".to_string(),
            })
        }
    }

    fn start_instant() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn reuses_token_within_ttl() {
        let harvester = CountingHarvester::new(false);
        let clock = Arc::new(ManualClock::new(start_instant()));
        let cache = CredentialCache::new(harvester.clone(), clock.clone());

        let first = cache.get_valid().await.unwrap();
        clock.advance(Duration::minutes(89));
        let second = cache.get_valid().await.unwrap();

        assert_eq!(first.token, second.token);
        assert_eq!(harvester.calls(), 1);
    }

    #[tokio::test]
    async fn reacquires_at_expiry() {
        let harvester = CountingHarvester::new(false);
        let clock = Arc::new(ManualClock::new(start_instant()));
        let cache = CredentialCache::new(harvester.clone(), clock.clone());

        let first = cache.get_valid().await.unwrap();
        // Exactly at the expiry instant the token is no longer valid.
        clock.advance(Duration::minutes(CREDENTIAL_TTL_MINUTES));
        let second = cache.get_valid().await.unwrap();

        assert_ne!(first.token, second.token);
        assert_eq!(harvester.calls(), 2);
    }

    #[tokio::test]
    async fn failure_caches_nothing() {
        let failing = CountingHarvester::new(true);
        let clock = Arc::new(ManualClock::new(start_instant()));
        let cache = CredentialCache::new(failing.clone(), clock.clone());

        assert!(matches!(
            cache.get_valid().await,
            Err(AcquisitionError::TokenNotObserved)
        ));
        // A second call must try again rather than serve a poisoned cache.
        assert!(cache.get_valid().await.is_err());
        assert_eq!(failing.calls(), 2);
    }
}
