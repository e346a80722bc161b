//! Bearer token lifecycle for one provider
//!
//! An [`AuthSession`] hands out the current token to every task of its
//! provider. Tokens are replaced whole on refresh, never edited in place,
//! and concurrent rejection reports for the same token collapse into a
//! single refresh.

use crate::error::EngineError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info};
use url::Url;
use vodfetch_types::ProviderConfig;

/// A token as returned by a provider handshake
#[derive(Clone)]
pub struct FetchedToken {
    pub raw: String,
    /// Lifetime reported by the provider, if any
    pub ttl: Option<Duration>,
}

/// Source of fresh tokens for one provider
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Provider identity, used in logs and errors
    fn name(&self) -> &str;

    async fn fetch_token(&self) -> Result<FetchedToken, EngineError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    play_token: Option<String>,
    expires_in: Option<u64>,
}

/// Token handshake against a portal's `player_api.php`
pub struct PortalTokenProvider {
    config: ProviderConfig,
    client: Client,
}

impl PortalTokenProvider {
    pub fn new(config: ProviderConfig, client: Client) -> Self {
        Self { config, client }
    }

    fn endpoint(&self) -> String {
        format!("{}/player_api.php", self.config.base_url.trim_end_matches('/'))
    }

    fn failure(&self, message: impl Into<String>) -> EngineError {
        EngineError::AuthFailure {
            provider: self.config.name.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for PortalTokenProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn fetch_token(&self) -> Result<FetchedToken, EngineError> {
        let response = self
            .client
            .post(self.endpoint())
            .query(&[
                ("username", self.config.username.as_str()),
                ("password", self.config.password.as_str()),
                ("action", "get_token"),
            ])
            .send()
            .await
            .map_err(|e| self.failure(format!("portal unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.failure(format!("portal answered HTTP {}", status.as_u16())));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| self.failure(format!("malformed token response: {}", e)))?;

        let raw = body
            .token
            .or(body.play_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| self.failure("response carried no token"))?;

        Ok(FetchedToken {
            raw,
            ttl: body.expires_in.map(Duration::from_secs),
        })
    }
}

/// Where a token goes on outgoing requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenPlacement {
    /// `Authorization: Bearer <token>`
    Bearer,
    /// A query parameter, replacing any existing value
    Query(String),
}

impl TokenPlacement {
    pub fn for_provider(config: &ProviderConfig) -> Self {
        match &config.token_param {
            Some(param) if !param.is_empty() => TokenPlacement::Query(param.clone()),
            _ => TokenPlacement::Bearer,
        }
    }
}

/// An issued token. Immutable once built.
pub struct AuthToken {
    raw: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    refresh_at: DateTime<Utc>,
    pub provider: String,
    /// Increases by one on every refresh
    pub generation: u64,
    placement: TokenPlacement,
}

impl AuthToken {
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Still usable without a refresh, allowing for clock skew
    pub fn is_fresh(&self) -> bool {
        Utc::now() < self.refresh_at
    }

    /// Build a request for `url` carrying this token
    pub fn request(
        &self,
        client: &Client,
        method: Method,
        url: &str,
    ) -> Result<RequestBuilder, EngineError> {
        match &self.placement {
            TokenPlacement::Bearer => Ok(client.request(method, url).bearer_auth(&self.raw)),
            TokenPlacement::Query(param) => {
                let url = with_query_token(url, param, &self.raw)?;
                Ok(client.request(method, url))
            }
        }
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("provider", &self.provider)
            .field("generation", &self.generation)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

fn with_query_token(url: &str, param: &str, token: &str) -> Result<Url, EngineError> {
    let mut parsed = Url::parse(url).map_err(|e| EngineError::InvalidUrl(e.to_string()))?;
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| key != param)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    parsed
        .query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair(param, token);
    Ok(parsed)
}

struct AuthState {
    token: Option<Arc<AuthToken>>,
    refreshing: bool,
    failed: Option<String>,
    generation: u64,
}

enum NextStep {
    Ready(Arc<AuthToken>),
    Refresh,
    Wait,
}

/// Owns the token of a single provider
pub struct AuthSession {
    name: String,
    provider: Arc<dyn TokenProvider>,
    placement: TokenPlacement,
    default_ttl: Duration,
    skew: Duration,
    state: Mutex<AuthState>,
    refreshed: Notify,
    refreshes: AtomicU64,
}

impl AuthSession {
    pub fn new(
        provider: Arc<dyn TokenProvider>,
        placement: TokenPlacement,
        default_ttl: Duration,
        skew: Duration,
    ) -> Self {
        Self {
            name: provider.name().to_string(),
            provider,
            placement,
            default_ttl,
            skew,
            state: Mutex::new(AuthState {
                token: None,
                refreshing: false,
                failed: None,
                generation: 0,
            }),
            refreshed: Notify::new(),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Session for a configured portal
    pub fn for_portal(config: &ProviderConfig, client: Client, skew: Duration) -> Self {
        let placement = TokenPlacement::for_provider(config);
        let ttl = Duration::from_secs(config.token_ttl_secs.max(1));
        let provider = Arc::new(PortalTokenProvider::new(config.clone(), client));
        Self::new(provider, placement, ttl, skew)
    }

    pub fn provider_name(&self) -> &str {
        &self.name
    }

    /// A refresh has failed; every later acquire fails too
    pub fn is_failed(&self) -> bool {
        self.state.lock().failed.is_some()
    }

    /// Number of refreshes performed so far
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Acquire)
    }

    /// Return a valid token, refreshing first when none is held.
    ///
    /// Callers arriving during a refresh wait for its result instead of
    /// starting another one.
    pub async fn acquire(&self) -> Result<Arc<AuthToken>, EngineError> {
        loop {
            // Registered before checking state so a refresh finishing in
            // between still wakes us
            let refreshed = self.refreshed.notified();

            let next = {
                let mut state = self.state.lock();
                if let Some(message) = &state.failed {
                    return Err(self.failure(message.clone()));
                }
                let fresh = state.token.as_ref().filter(|t| t.is_fresh()).cloned();
                if let Some(token) = fresh {
                    NextStep::Ready(token)
                } else if state.refreshing {
                    NextStep::Wait
                } else {
                    state.refreshing = true;
                    NextStep::Refresh
                }
            };

            match next {
                NextStep::Ready(token) => return Ok(token),
                NextStep::Refresh => return self.refresh().await,
                NextStep::Wait => refreshed.await,
            }
        }
    }

    /// Signal that a server rejected `token`.
    ///
    /// Only the first report for a given generation invalidates it; later
    /// reports for the same stale token just receive the replacement.
    pub async fn report_rejected(&self, token: &AuthToken) -> Result<Arc<AuthToken>, EngineError> {
        {
            let mut state = self.state.lock();
            let is_current = state
                .token
                .as_ref()
                .map(|current| current.generation == token.generation)
                .unwrap_or(false);
            if is_current {
                debug!(
                    provider = %self.name,
                    generation = token.generation,
                    "token rejected, invalidating"
                );
                state.token = None;
            }
        }
        self.acquire().await
    }

    async fn refresh(&self) -> Result<Arc<AuthToken>, EngineError> {
        // Clears the in-flight flag and wakes waiters even if this future is dropped
        let _guard = RefreshGuard { session: self };
        self.refreshes.fetch_add(1, Ordering::AcqRel);
        info!(provider = %self.name, "refreshing auth token");

        match self.provider.fetch_token().await {
            Ok(fetched) => {
                let mut state = self.state.lock();
                state.generation += 1;
                let token = Arc::new(self.build_token(fetched, state.generation));
                state.token = Some(Arc::clone(&token));
                info!(
                    provider = %self.name,
                    generation = token.generation,
                    expires_at = %token.expires_at,
                    "auth token refreshed"
                );
                Ok(token)
            }
            Err(e) => {
                let message = match &e {
                    EngineError::AuthFailure { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                error!(provider = %self.name, "auth refresh failed: {}", message);
                let mut state = self.state.lock();
                state.token = None;
                state.failed = Some(message.clone());
                Err(self.failure(message))
            }
        }
    }

    fn build_token(&self, fetched: FetchedToken, generation: u64) -> AuthToken {
        let ttl = fetched.ttl.unwrap_or(self.default_ttl);
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1));
        // Never let the skew eat more than half the lifetime
        let skew = chrono::Duration::from_std(self.skew)
            .unwrap_or_else(|_| chrono::Duration::zero())
            .min(ttl / 2);

        let issued_at = Utc::now();
        AuthToken {
            raw: fetched.raw,
            issued_at,
            expires_at: issued_at + ttl,
            refresh_at: issued_at + ttl - skew,
            provider: self.name.clone(),
            generation,
            placement: self.placement.clone(),
        }
    }

    fn failure(&self, message: String) -> EngineError {
        EngineError::AuthFailure {
            provider: self.name.clone(),
            message,
        }
    }
}

struct RefreshGuard<'a> {
    session: &'a AuthSession,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.session.state.lock().refreshing = false;
        self.session.refreshed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingProvider {
        calls: AtomicUsize,
        delay: Duration,
        ttl: Option<Duration>,
        fail: bool,
    }

    impl CountingProvider {
        fn new(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
                ttl: None,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl TokenProvider for CountingProvider {
        fn name(&self) -> &str {
            "test"
        }

        async fn fetch_token(&self) -> Result<FetchedToken, EngineError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(EngineError::AuthFailure {
                    provider: "test".into(),
                    message: "bad credentials".into(),
                });
            }
            Ok(FetchedToken {
                raw: format!("token-{}", n),
                ttl: self.ttl,
            })
        }
    }

    fn session(provider: Arc<CountingProvider>) -> Arc<AuthSession> {
        Arc::new(AuthSession::new(
            provider,
            TokenPlacement::Bearer,
            Duration::from_secs(600),
            Duration::from_secs(30),
        ))
    }

    #[tokio::test]
    async fn concurrent_acquires_share_one_refresh() {
        let provider = Arc::new(CountingProvider::new(Duration::from_millis(50)));
        let session = session(Arc::clone(&provider));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.acquire().await.unwrap().raw().to_string() })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "token-1");
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejection_reports_for_same_token_coalesce() {
        let provider = Arc::new(CountingProvider::new(Duration::from_millis(30)));
        let session = session(Arc::clone(&provider));
        let stale = session.acquire().await.unwrap();

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let session = Arc::clone(&session);
                let stale = Arc::clone(&stale);
                tokio::spawn(async move { session.report_rejected(&stale).await.unwrap() })
            })
            .collect();
        for handle in handles {
            let fresh = handle.await.unwrap();
            assert_eq!(fresh.generation, 2);
            assert_eq!(fresh.raw(), "token-2");
        }
        assert_eq!(session.refresh_count(), 2);

        // A late report for the already replaced token changes nothing
        let again = session.report_rejected(&stale).await.unwrap();
        assert_eq!(again.generation, 2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn short_lived_token_is_refreshed() {
        let mut provider = CountingProvider::new(Duration::ZERO);
        provider.ttl = Some(Duration::from_millis(200));
        let provider = Arc::new(provider);
        let session = session(Arc::clone(&provider));

        let first = session.acquire().await.unwrap();
        assert!(!first.is_expired());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(first.is_expired());

        let second = session.acquire().await.unwrap();
        assert_eq!(second.generation, 2);
        assert!(!second.is_expired());
    }

    #[tokio::test]
    async fn refresh_failure_is_sticky() {
        let mut provider = CountingProvider::new(Duration::ZERO);
        provider.fail = true;
        let provider = Arc::new(provider);
        let session = session(Arc::clone(&provider));

        assert!(matches!(
            session.acquire().await,
            Err(EngineError::AuthFailure { .. })
        ));
        assert!(session.is_failed());
        assert!(session.acquire().await.is_err());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn query_placement_replaces_existing_token() {
        let url = with_query_token(
            "http://portal.example.com/movie/1.mkv?play_token=old&x=1",
            "play_token",
            "new",
        )
        .unwrap();
        assert_eq!(url.as_str(), "http://portal.example.com/movie/1.mkv?x=1&play_token=new");
    }

    #[test]
    fn debug_output_hides_raw_token() {
        let session = session(Arc::new(CountingProvider::new(Duration::ZERO)));
        let token = session.build_token(
            FetchedToken {
                raw: "secret-value".into(),
                ttl: None,
            },
            7,
        );
        let printed = format!("{:?}", token);
        assert!(!printed.contains("secret-value"));
        assert!(printed.contains("generation: 7"));
    }
}
