//! Gateway credential tracking and refresh.
//!
//! A [`TokenStore`] holds the credential for the current instance. Reads
//! of a fresh credential never touch the refresh mutex; a stale credential
//! is refreshed by at most one caller at a time, and the new token is
//! pushed into the bound runtime before the mutex is released.

use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use super::broker::CredentialBroker;
use super::control_plane::TokenGrant;
use super::error::DeploymentError;
use super::runtime::{RuntimeHandle, TokenRefresher};

/// Refresh once less than this much validity remains.
pub const TOKEN_REFRESH_THRESHOLD: Duration = Duration::from_secs(60);

/// Assumed validity when the provider's expiry cannot be parsed.
pub const FALLBACK_VALIDITY: Duration = Duration::from_secs(60 * 60);

/// A gateway access token bound to the instance it was minted for.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub instance_id: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

impl Credential {
    pub fn from_grant(grant: TokenGrant, instance_id: &str) -> Self {
        Self {
            token: grant.token,
            expires_at: parse_expiry(&grant.expires_at, Utc::now()),
            instance_id: instance_id.to_string(),
        }
    }

    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.is_stale_at(Utc::now(), threshold)
    }

    /// Stale when at most `threshold` of validity remains at `now`.
    pub fn is_stale_at(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::TimeDelta::MAX);
        self.expires_at - now <= threshold
    }
}

/// Parse a provider expiry timestamp.
///
/// Accepts RFC 3339 (including a `Z` suffix), naive ISO-8601 (read as UTC)
/// and Unix epoch seconds. Anything else falls back to `now + 1h` with a
/// warning, trading a possibly early refresh for not failing the deployment.
pub fn parse_expiry(raw: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    let trimmed = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return ts.with_timezone(&Utc);
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Utc.from_utc_datetime(&naive);
        }
    }
    if let Ok(secs) = trimmed.parse::<f64>() {
        if secs.is_finite() {
            let millis = (secs * 1000.0) as i64;
            if let Some(ts) = Utc.timestamp_millis_opt(millis).single() {
                return ts;
            }
        }
    }

    tracing::warn!(
        timestamp = %raw,
        "could not parse token expiry, assuming 1 hour validity"
    );
    now + chrono::Duration::from_std(FALLBACK_VALIDITY).unwrap_or(chrono::TimeDelta::MAX)
}

/// Current credential plus the machinery to refresh it.
pub struct TokenStore {
    broker: CredentialBroker,
    threshold: Duration,
    current: RwLock<Option<Credential>>,
    refresh_lock: tokio::sync::Mutex<()>,
    runtime: RwLock<Option<Weak<dyn RuntimeHandle>>>,
}

impl TokenStore {
    pub fn new(broker: CredentialBroker, threshold: Duration) -> Self {
        Self {
            broker,
            threshold,
            current: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            runtime: RwLock::new(None),
        }
    }

    pub fn broker(&self) -> &CredentialBroker {
        &self.broker
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn current(&self) -> Option<Credential> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn install(&self, credential: Credential) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(credential);
    }

    /// Keep a non-owning reference so refreshed tokens reach the runtime.
    pub(crate) fn bind_runtime(&self, runtime: &Arc<dyn RuntimeHandle>) {
        *self.runtime.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::downgrade(runtime));
    }

    /// Forget the credential and the runtime binding.
    pub(crate) fn clear(&self) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = None;
        *self.runtime.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn fresh_token(&self) -> Result<Option<String>, DeploymentError> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        let credential = guard.as_ref().ok_or(DeploymentError::NotStarted)?;
        if credential.is_stale(self.threshold) {
            Ok(None)
        } else {
            Ok(Some(credential.token.clone()))
        }
    }

    /// Return a token that is not stale, refreshing it if needed.
    pub async fn ensure_valid_token(&self) -> Result<String, DeploymentError> {
        if let Some(token) = self.fresh_token()? {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited.
        if let Some(token) = self.fresh_token()? {
            return Ok(token);
        }

        let instance_id = self
            .current()
            .map(|c| c.instance_id)
            .ok_or(DeploymentError::NotStarted)?;

        tracing::info!(instance_id = %instance_id, "token expired, refreshing");
        let fresh = self.broker.acquire(&instance_id).await?;
        if fresh.instance_id != instance_id {
            return Err(DeploymentError::CredentialMismatch {
                expected: instance_id,
                actual: fresh.instance_id,
            });
        }

        {
            let mut slot = self.current.write().unwrap_or_else(PoisonError::into_inner);
            // The deployment may have been stopped while the broker call ran.
            match slot.as_ref() {
                Some(current) if current.instance_id == instance_id => {
                    *slot = Some(fresh.clone());
                }
                _ => return Err(DeploymentError::NotStarted),
            }
        }

        let runtime = self
            .runtime
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade);
        if let Some(runtime) = runtime {
            runtime.set_gateway_token(&fresh.token);
        }

        tracing::debug!(
            instance_id = %instance_id,
            expires_at = %fresh.expires_at,
            "token refreshed"
        );
        Ok(fresh.token)
    }
}

#[async_trait]
impl TokenRefresher for TokenStore {
    async fn ensure_valid_token(&self) -> Result<String, DeploymentError> {
        TokenStore::ensure_valid_token(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::control_plane::ControlPlane;
    use crate::sandbox::testing::{FakeControlPlane, FakeRuntime};
    use chrono::TimeZone;

    fn credential(expires_at: DateTime<Utc>) -> Credential {
        Credential {
            token: "tok-initial".into(),
            expires_at,
            instance_id: "sbi-1".into(),
        }
    }

    fn store(fake: &Arc<FakeControlPlane>) -> TokenStore {
        let cp: Arc<dyn ControlPlane> = fake.clone();
        TokenStore::new(CredentialBroker::new(cp), TOKEN_REFRESH_THRESHOLD)
    }

    // ── Staleness ───────────────────────────────────────────────

    #[test]
    fn stale_when_less_than_threshold_remains() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let cred = credential(now + chrono::Duration::seconds(59));
        assert!(cred.is_stale_at(now, Duration::from_secs(60)));
    }

    #[test]
    fn stale_exactly_at_threshold() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let cred = credential(now + chrono::Duration::seconds(60));
        assert!(cred.is_stale_at(now, Duration::from_secs(60)));
    }

    #[test]
    fn fresh_when_more_than_threshold_remains() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let cred = credential(now + chrono::Duration::seconds(61));
        assert!(!cred.is_stale_at(now, Duration::from_secs(60)));
    }

    #[test]
    fn already_expired_is_stale() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let cred = credential(now - chrono::Duration::minutes(5));
        assert!(cred.is_stale_at(now, Duration::from_secs(60)));
    }

    #[test]
    fn debug_redacts_token() {
        let cred = credential(Utc::now());
        let rendered = format!("{cred:?}");
        assert!(!rendered.contains("tok-initial"));
        assert!(rendered.contains("sbi-1"));
    }

    // ── Timestamp parsing ───────────────────────────────────────

    #[test]
    fn parses_rfc3339_with_z_suffix() {
        let now = Utc::now();
        let ts = parse_expiry("2025-09-20T10:00:00Z", now);
        assert_eq!(ts, Utc.with_ymd_and_hms(2025, 9, 20, 10, 0, 0).unwrap());
    }

    #[test]
    fn parses_rfc3339_with_offset() {
        let ts = parse_expiry("2025-09-20T18:00:00+08:00", Utc::now());
        assert_eq!(ts, Utc.with_ymd_and_hms(2025, 9, 20, 10, 0, 0).unwrap());
    }

    #[test]
    fn parses_naive_iso_as_utc() {
        let ts = parse_expiry("2025-09-20T10:00:00", Utc::now());
        assert_eq!(ts, Utc.with_ymd_and_hms(2025, 9, 20, 10, 0, 0).unwrap());
    }

    #[test]
    fn parses_epoch_seconds() {
        let ts = parse_expiry("1758362400", Utc::now());
        assert_eq!(ts, Utc.with_ymd_and_hms(2025, 9, 20, 10, 0, 0).unwrap());
    }

    #[test]
    fn unparseable_falls_back_to_one_hour() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let ts = parse_expiry("next tuesday", now);
        assert_eq!(ts, now + chrono::Duration::hours(1));
    }

    // ── Refresh ─────────────────────────────────────────────────

    #[tokio::test]
    async fn no_credential_is_not_started() {
        let fake = Arc::new(FakeControlPlane::new());
        let store = store(&fake);
        let err = store.ensure_valid_token().await.unwrap_err();
        assert!(matches!(err, DeploymentError::NotStarted));
    }

    #[tokio::test]
    async fn fresh_credential_skips_broker_and_lock() {
        let fake = Arc::new(FakeControlPlane::new());
        let store = store(&fake);
        store.install(credential(Utc::now() + chrono::Duration::hours(1)));

        // Holding the refresh lock must not delay the fast path.
        let _held = store.refresh_lock.try_lock().unwrap();
        let token = tokio::time::timeout(Duration::from_millis(200), store.ensure_valid_token())
            .await
            .expect("fast path must not wait on the refresh lock")
            .unwrap();

        assert_eq!(token, "tok-initial");
        assert_eq!(fake.acquire_calls(), 0);
    }

    #[tokio::test]
    async fn stale_credential_is_replaced() {
        let fake = Arc::new(FakeControlPlane::new());
        let store = store(&fake);
        store.install(credential(Utc::now()));

        let token = store.ensure_valid_token().await.unwrap();

        assert_ne!(token, "tok-initial");
        assert_eq!(fake.acquire_calls(), 1);
        let current = store.current().unwrap();
        assert_eq!(current.token, token);
        assert_eq!(current.instance_id, "sbi-1");
        assert!(!current.is_stale(TOKEN_REFRESH_THRESHOLD));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_refresh_hits_broker_once() {
        let fake = Arc::new(FakeControlPlane::new().with_acquire_delay(Duration::from_millis(100)));
        let store = Arc::new(store(&fake));
        store.install(credential(Utc::now()));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.ensure_valid_token().await })
            })
            .collect();
        let tokens: Vec<String> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert_eq!(fake.acquire_calls(), 1);
        assert!(tokens.iter().all(|t| t == &tokens[0]));
        assert_ne!(tokens[0], "tok-initial");
    }

    #[tokio::test]
    async fn refreshed_token_is_pushed_into_bound_runtime() {
        let fake = Arc::new(FakeControlPlane::new());
        let store = store(&fake);
        store.install(credential(Utc::now()));
        let runtime = Arc::new(FakeRuntime::new("tok-initial"));
        let handle: Arc<dyn RuntimeHandle> = runtime.clone();
        store.bind_runtime(&handle);

        let token = store.ensure_valid_token().await.unwrap();

        assert_eq!(runtime.gateway_token(), token);
    }

    #[tokio::test]
    async fn dropped_runtime_is_ignored() {
        let fake = Arc::new(FakeControlPlane::new());
        let store = store(&fake);
        store.install(credential(Utc::now()));
        {
            let handle: Arc<dyn RuntimeHandle> = Arc::new(FakeRuntime::new("tok-initial"));
            store.bind_runtime(&handle);
        }

        assert!(store.ensure_valid_token().await.is_ok());
    }

    #[tokio::test]
    async fn broker_failure_propagates_and_keeps_old_credential() {
        let fake = Arc::new(FakeControlPlane::new().with_acquire_error("InternalError"));
        let store = store(&fake);
        store.install(credential(Utc::now()));

        let err = store.ensure_valid_token().await.unwrap_err();

        assert!(matches!(err, DeploymentError::ControlPlane(_)));
        assert_eq!(store.current().unwrap().token, "tok-initial");
    }

    #[tokio::test]
    async fn cleared_store_is_not_started() {
        let fake = Arc::new(FakeControlPlane::new());
        let store = store(&fake);
        store.install(credential(Utc::now() + chrono::Duration::hours(1)));
        store.clear();
        assert!(store.current().is_none());
        assert!(matches!(
            store.ensure_valid_token().await,
            Err(DeploymentError::NotStarted)
        ));
    }
}
