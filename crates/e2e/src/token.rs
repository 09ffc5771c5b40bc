//! Token fixtures
//!
//! Host/user token pairs for test isolation. Tokens are 8 characters drawn
//! from the application's alphabet, which leaves out `0`, `O` and `1`.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::error::{E2eError, E2eResult};

/// Characters a token may contain
pub const TOKEN_ALPHABET: &str = "ABCDEFGHIJKLMNPQRSTUVWXYZ23456789";

/// Fixed token length
pub const TOKEN_LENGTH: usize = 8;

/// How many times a colliding token is regenerated before giving up
const MAX_REGENERATE_ATTEMPTS: usize = 8;

/// A host/user token pair bound to a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub host_token: String,
    pub user_token: String,
    pub session_id: i64,
    pub created_by: String,
    pub title: String,
    /// False when the remote registration write failed; the pair is then
    /// advisory and must be validated before use.
    #[serde(default = "default_registered")]
    pub registered: bool,
}

fn default_registered() -> bool {
    true
}

impl TokenPair {
    /// Both tokens are syntactically valid
    pub fn is_well_formed(&self) -> bool {
        validate_token(&self.host_token) && validate_token(&self.user_token)
    }
}

/// Options for a new pair
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenRequest {
    /// Session to bind to; random in 200..1200 when absent
    pub session_id: Option<i64>,
    pub created_by: String,
    pub title: Option<String>,
}

impl Default for TokenRequest {
    fn default() -> Self {
        Self {
            session_id: None,
            created_by: "Playwright Test Suite".to_string(),
            title: None,
        }
    }
}

impl TokenRequest {
    fn resolve(&self) -> (i64, String, String) {
        let session_id = self
            .session_id
            .unwrap_or_else(|| rand::thread_rng().gen_range(200..1200));
        let title = self
            .title
            .clone()
            .unwrap_or_else(|| format!("Test Session {}", chrono::Utc::now().timestamp_millis()));
        (session_id, self.created_by.clone(), title)
    }
}

/// Check length and alphabet
pub fn validate_token(token: &str) -> bool {
    token.len() == TOKEN_LENGTH && token.chars().all(|c| TOKEN_ALPHABET.contains(c))
}

/// Generate a random token from the alphabet
pub fn generate_token<R: Rng + ?Sized>(rng: &mut R) -> String {
    let alphabet = TOKEN_ALPHABET.as_bytes();
    (0..TOKEN_LENGTH)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
        .collect()
}

/// Where token pairs come from
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn create(&self, request: &TokenRequest) -> E2eResult<TokenPair>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Asks the application to generate the pair
pub struct ApiTokenSource {
    client: ApiClient,
}

impl ApiTokenSource {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TokenSource for ApiTokenSource {
    async fn create(&self, request: &TokenRequest) -> E2eResult<TokenPair> {
        let (session_id, created_by, title) = request.resolve();
        let generated = self
            .client
            .generate_token(session_id, &created_by, &title)
            .await
            .map_err(|e| E2eError::FixtureUnavailable(format!("generate-token failed: {}", e)))?;

        let pair = TokenPair {
            host_token: generated.host_token,
            user_token: generated.user_token,
            session_id,
            created_by,
            title,
            registered: true,
        };

        if !pair.is_well_formed() {
            return Err(E2eError::FixtureUnavailable(format!(
                "server returned malformed tokens: host={} user={}",
                pair.host_token, pair.user_token
            )));
        }

        Ok(pair)
    }

    fn name(&self) -> &'static str {
        "api"
    }
}

/// Generates tokens locally, optionally registering them with the application
pub struct LocalTokenSource {
    registrar: Option<ApiClient>,
    valid_hours: u32,
}

impl LocalTokenSource {
    /// Tokens are never written anywhere
    pub fn offline() -> Self {
        Self {
            registrar: None,
            valid_hours: 24,
        }
    }

    /// Tokens are registered through the test token endpoint
    pub fn registering(client: ApiClient) -> Self {
        Self {
            registrar: Some(client),
            valid_hours: 24,
        }
    }
}

#[async_trait]
impl TokenSource for LocalTokenSource {
    async fn create(&self, request: &TokenRequest) -> E2eResult<TokenPair> {
        let (session_id, created_by, title) = request.resolve();
        let (host_token, user_token) = {
            let mut rng = rand::thread_rng();
            (generate_token(&mut rng), generate_token(&mut rng))
        };

        let mut pair = TokenPair {
            host_token,
            user_token,
            session_id,
            created_by,
            title,
            registered: self.registrar.is_none(),
        };

        if let Some(client) = &self.registrar {
            match client
                .register_token_pair(session_id, &pair.host_token, &pair.user_token, self.valid_hours)
                .await
            {
                Ok(()) => pair.registered = true,
                Err(e) => {
                    warn!(
                        "Token pair for session {} not registered, using it as advisory only: {}",
                        session_id, e
                    );
                }
            }
        }

        Ok(pair)
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

/// Serves a fixed list of long-lived test tokens round-robin
pub struct StaticTokenSource {
    pairs: Vec<TokenPair>,
    next: AtomicUsize,
}

impl StaticTokenSource {
    pub fn new(pairs: Vec<TokenPair>) -> Self {
        Self {
            pairs,
            next: AtomicUsize::new(0),
        }
    }

    /// The permanent Playwright session kept in the development database
    pub fn permanent() -> Self {
        Self::new(vec![TokenPair {
            host_token: "VNBPRVII".to_string(),
            user_token: "DPH42JR5".to_string(),
            session_id: 212,
            created_by: "Playwright Permanent Test Session".to_string(),
            title: "we look at the purpose of sending messengers, and their role in our spiritual awakening."
                .to_string(),
            registered: true,
        }])
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn create(&self, _request: &TokenRequest) -> E2eResult<TokenPair> {
        if self.pairs.is_empty() {
            return Err(E2eError::FixtureUnavailable("no static tokens configured".to_string()));
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.pairs.len();
        Ok(self.pairs[index].clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// Hands out token pairs, guaranteeing uniqueness within one run
#[derive(Clone)]
pub struct TokenFixtureProvider {
    source: Arc<dyn TokenSource>,
    issued: Arc<Mutex<HashSet<String>>>,
    enforce_unique: bool,
}

impl TokenFixtureProvider {
    pub fn new(source: impl TokenSource + 'static) -> Self {
        Self {
            source: Arc::new(source),
            issued: Arc::new(Mutex::new(HashSet::new())),
            enforce_unique: true,
        }
    }

    /// Skip the uniqueness check, for fixed token lists
    pub fn allow_reuse(mut self) -> Self {
        self.enforce_unique = false;
        self
    }

    /// Create one pair
    pub async fn create_token_pair(&self, request: &TokenRequest) -> E2eResult<TokenPair> {
        for attempt in 1..=MAX_REGENERATE_ATTEMPTS {
            let pair = self.source.create(request).await?;

            if !pair.is_well_formed() {
                return Err(E2eError::FixtureUnavailable(format!(
                    "{} source produced malformed tokens",
                    self.source.name()
                )));
            }

            if !self.enforce_unique || self.claim(&pair) {
                debug!(
                    "Issued token pair host={} user={} (session {}, source {})",
                    pair.host_token,
                    pair.user_token,
                    pair.session_id,
                    self.source.name()
                );
                return Ok(pair);
            }

            debug!("Token collision on attempt {}, regenerating", attempt);
        }

        Err(E2eError::FixtureUnavailable(format!(
            "could not produce a unique token pair after {} attempts",
            MAX_REGENERATE_ATTEMPTS
        )))
    }

    /// Create `count` pairs concurrently
    pub async fn create_token_pairs(&self, count: usize, request: &TokenRequest) -> E2eResult<Vec<TokenPair>> {
        info!("Creating {} token pair(s) via {} source", count, self.source.name());
        let futures = (0..count).map(|_| self.create_token_pair(request));
        futures::future::try_join_all(futures).await
    }

    /// Reserve both tokens atomically, or neither
    fn claim(&self, pair: &TokenPair) -> bool {
        let mut issued = self.issued.lock();
        if pair.host_token == pair.user_token
            || issued.contains(&pair.host_token)
            || issued.contains(&pair.user_token)
        {
            return false;
        }
        issued.insert(pair.host_token.clone());
        issued.insert(pair.user_token.clone());
        true
    }

    /// Number of tokens issued in this run
    pub fn issued_count(&self) -> usize {
        self.issued.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_alphabet_excludes_ambiguous_characters() {
        for c in ['0', 'O', '1'] {
            assert!(!TOKEN_ALPHABET.contains(c), "alphabet must not contain {}", c);
        }
        assert_eq!(TOKEN_ALPHABET.len(), 33);
    }

    #[test]
    fn test_generated_tokens_validate() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let token = generate_token(&mut rng);
            assert!(validate_token(&token), "{} should be valid", token);
        }
    }

    #[test]
    fn test_static_source_round_robin() {
        let source = StaticTokenSource::permanent();
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let a = rt.block_on(source.create(&TokenRequest::default())).unwrap();
        let b = rt.block_on(source.create(&TokenRequest::default())).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.session_id, 212);
    }

    #[tokio::test]
    async fn test_static_source_collides_without_reuse() {
        let provider = TokenFixtureProvider::new(StaticTokenSource::permanent());
        provider.create_token_pair(&TokenRequest::default()).await.unwrap();
        let second = provider.create_token_pair(&TokenRequest::default()).await;
        assert!(matches!(second, Err(E2eError::FixtureUnavailable(_))));

        let reusing = TokenFixtureProvider::new(StaticTokenSource::permanent()).allow_reuse();
        reusing.create_token_pair(&TokenRequest::default()).await.unwrap();
        reusing.create_token_pair(&TokenRequest::default()).await.unwrap();
    }
}
