use {
    base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD},
    rand::RngCore,
    tokio::sync::RwLock,
};

use switchyard_config::GatewayConfig;

/// Bytes of CSPRNG output per generated token (256 bits).
const TOKEN_BYTES: usize = 32;

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Constant-time string comparison (prevents timing attacks).
fn safe_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let diff = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

/// Generate a fresh bearer token. The token is not added to any guard; the
/// caller decides whether to persist it.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

// ── Guard ────────────────────────────────────────────────────────────────────

/// Shared-secret gate in front of `register`.
pub struct AuthGuard {
    require_auth: bool,
    tokens: RwLock<Vec<String>>,
}

impl AuthGuard {
    pub fn new(require_auth: bool, tokens: Vec<String>) -> Self {
        Self {
            require_auth,
            tokens: RwLock::new(tokens),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(config.require_auth, config.token_set())
    }

    pub fn require_auth(&self) -> bool {
        self.require_auth
    }

    /// Always true when auth is off. Otherwise the token must be present and
    /// match one accepted token exactly.
    pub async fn validate_token(&self, token: Option<&str>) -> bool {
        if !self.require_auth {
            return true;
        }
        let Some(given) = token else {
            return false;
        };
        let tokens = self.tokens.read().await;
        // Compare against every entry so timing does not reveal the index.
        tokens
            .iter()
            .fold(false, |found, t| safe_equal(given, t) | found)
    }

    /// Accept `token` from now on. Returns false if it was already accepted.
    pub async fn add_token(&self, token: impl Into<String>) -> bool {
        let token = token.into();
        let mut tokens = self.tokens.write().await;
        if token.is_empty() || tokens.contains(&token) {
            return false;
        }
        tokens.push(token);
        true
    }

    pub async fn revoke_token(&self, token: &str) -> bool {
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|t| t != token);
        tokens.len() != before
    }

    pub async fn token_count(&self) -> usize {
        self.tokens.read().await.len()
    }
}
