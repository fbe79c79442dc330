use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use tether_proto::ANONYMOUS_USER;

/// Identity attached to a connection for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub email: Option<String>,
    pub is_authenticated: bool,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self {
            user_id: ANONYMOUS_USER.to_string(),
            email: None,
            is_authenticated: false,
        }
    }

    /// Owner recorded on sessions this identity creates.
    pub fn owner(&self) -> Option<String> {
        self.is_authenticated.then(|| self.user_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizerConfig {
    pub jwks_url: Option<String>,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    pub cache_ttl: Duration,
}

impl Default for AuthorizerConfig {
    fn default() -> Self {
        Self {
            jwks_url: None,
            issuer: None,
            audience: None,
            cache_ttl: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("jwks url not configured")]
    MissingJwksUrl,
    #[error("jwks fetch failed: {0}")]
    JwksFetch(String),
    #[error("token header missing kid")]
    MissingKid,
    #[error("unknown jwk key id {0}")]
    UnknownKey(String),
    #[error("token algorithm {0:?} does not match key")]
    AlgorithmMismatch(Algorithm),
    #[error("token validation failed: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token missing subject")]
    MissingSubject,
    #[error("token verification requires a configured {0}")]
    Unconfigured(&'static str),
}

#[derive(Clone)]
struct VerificationKey {
    key: DecodingKey,
    algorithm: Algorithm,
}

struct JwksCache {
    keys: HashMap<String, VerificationKey>,
    fetched_at: Instant,
}

impl JwksCache {
    fn stale(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() > ttl
    }
}

#[derive(Debug, Deserialize)]
struct AccessTokenClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<JwkEntry>,
}

#[derive(Debug, Deserialize)]
struct JwkEntry {
    kid: Option<String>,
    kty: String,
    #[serde(default)]
    alg: Option<String>,
    #[serde(default)]
    crv: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
    #[serde(default)]
    x: Option<String>,
    #[serde(default)]
    y: Option<String>,
}

impl JwkEntry {
    fn into_key(self) -> Option<(String, Result<VerificationKey, jsonwebtoken::errors::Error>)> {
        let kid = self.kid?;
        let parsed = match (self.kty.as_str(), self.crv.as_deref()) {
            ("RSA", _) => {
                let algorithm = match self.alg.as_deref() {
                    Some("RS384") => Algorithm::RS384,
                    Some("RS512") => Algorithm::RS512,
                    _ => Algorithm::RS256,
                };
                DecodingKey::from_rsa_components(&self.n?, &self.e?)
                    .map(|key| VerificationKey { key, algorithm })
            }
            ("EC", Some("P-256")) => DecodingKey::from_ec_components(&self.x?, &self.y?)
                .map(|key| VerificationKey {
                    key,
                    algorithm: Algorithm::ES256,
                }),
            ("EC", Some("P-384")) => DecodingKey::from_ec_components(&self.x?, &self.y?)
                .map(|key| VerificationKey {
                    key,
                    algorithm: Algorithm::ES384,
                }),
            _ => return None,
        };
        Some((kid, parsed))
    }
}

/// Turns an optional bearer token into an [`Identity`].
///
/// No token means anonymous. A token must verify against the issuer's JWKS,
/// which is cached for `cache_ttl` and can be reloaded with [`refresh`].
///
/// [`refresh`]: Authorizer::refresh
#[derive(Clone)]
pub struct Authorizer {
    config: AuthorizerConfig,
    cache: Arc<RwLock<Option<JwksCache>>>,
    client: Client,
}

impl Authorizer {
    pub fn new(config: AuthorizerConfig) -> Self {
        Self {
            config,
            cache: Arc::new(RwLock::new(None)),
            client: Client::new(),
        }
    }

    pub fn config(&self) -> &AuthorizerConfig {
        &self.config
    }

    pub async fn authorize(&self, token: Option<&str>) -> Result<Identity, AuthError> {
        match token.map(str::trim).filter(|token| !token.is_empty()) {
            None => Ok(Identity::anonymous()),
            Some(token) => self.verify(token).await,
        }
    }

    /// Verify signature, expiry, issuer and audience. Without a configured
    /// issuer and audience every token is refused.
    pub async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let issuer = self
            .config
            .issuer
            .as_deref()
            .ok_or(AuthError::Unconfigured("issuer"))?;
        let audience = self
            .config
            .audience
            .as_deref()
            .ok_or(AuthError::Unconfigured("audience"))?;

        let header = decode_header(token)?;
        let kid = header.kid.ok_or(AuthError::MissingKid)?;
        let key = self.decoding_key(&kid).await?;
        if header.alg != key.algorithm {
            return Err(AuthError::AlgorithmMismatch(header.alg));
        }

        let mut validation = Validation::new(key.algorithm);
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);

        let claims = decode::<AccessTokenClaims>(token, &key.key, &validation)?.claims;
        if claims.sub.trim().is_empty() {
            return Err(AuthError::MissingSubject);
        }

        debug!(user = %claims.sub, "token verified");
        Ok(Identity {
            user_id: claims.sub,
            email: claims.email,
            is_authenticated: true,
        })
    }

    /// Reload the key set now, regardless of cache age. Returns the key count.
    pub async fn refresh(&self) -> Result<usize, AuthError> {
        let fresh = self.fetch_jwks().await?;
        let count = fresh.keys.len();
        *self.cache.write().await = Some(fresh);
        Ok(count)
    }

    async fn decoding_key(&self, kid: &str) -> Result<VerificationKey, AuthError> {
        {
            let cache = self.cache.read().await;
            if let Some(cache) = cache.as_ref() {
                if !cache.stale(self.config.cache_ttl) {
                    if let Some(key) = cache.keys.get(kid) {
                        return Ok(key.clone());
                    }
                }
            }
        }

        {
            let mut cache = self.cache.write().await;
            // An unknown kid usually means the provider rotated its keys.
            let should_refresh = cache
                .as_ref()
                .map(|c| c.stale(self.config.cache_ttl) || !c.keys.contains_key(kid))
                .unwrap_or(true);
            if should_refresh {
                *cache = Some(self.fetch_jwks().await?);
            }

            if let Some(cache) = cache.as_ref() {
                if let Some(key) = cache.keys.get(kid) {
                    return Ok(key.clone());
                }
            }
        }

        Err(AuthError::UnknownKey(kid.to_string()))
    }

    async fn fetch_jwks(&self) -> Result<JwksCache, AuthError> {
        let url = self
            .config
            .jwks_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or(AuthError::MissingJwksUrl)?;

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(AuthError::JwksFetch(format!("status {}", response.status())));
        }

        let body: JwksResponse = response.json().await?;
        let mut keys = HashMap::new();
        for (kid, parsed) in body.keys.into_iter().filter_map(JwkEntry::into_key) {
            match parsed {
                Ok(key) => {
                    keys.insert(kid, key);
                }
                Err(err) => {
                    warn!(
                        target: "tether_relay::authorizer",
                        kid = %kid,
                        error = %err,
                        "failed to parse jwk entry; skipping"
                    );
                }
            }
        }

        if keys.is_empty() {
            return Err(AuthError::JwksFetch(
                "no usable keys in JWKS response".to_string(),
            ));
        }

        Ok(JwksCache {
            keys,
            fetched_at: Instant::now(),
        })
    }

    #[cfg(test)]
    fn with_static_keys(
        config: AuthorizerConfig,
        keys: impl IntoIterator<Item = (String, DecodingKey, Algorithm)>,
    ) -> Self {
        let keys = keys
            .into_iter()
            .map(|(kid, key, algorithm)| (kid, VerificationKey { key, algorithm }))
            .collect();
        Self {
            config,
            cache: Arc::new(RwLock::new(Some(JwksCache {
                keys,
                fetched_at: Instant::now(),
            }))),
            client: Client::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &[u8] = b"relay-test-secret";

    #[derive(Serialize)]
    struct Claims<'a> {
        sub: &'a str,
        email: &'a str,
        iss: &'a str,
        aud: &'a str,
        exp: u64,
    }

    fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    const ISSUER: &str = "https://issuer.test";

    fn config() -> AuthorizerConfig {
        AuthorizerConfig {
            issuer: Some(ISSUER.into()),
            audience: Some("tether".into()),
            ..AuthorizerConfig::default()
        }
    }

    fn with_config(config: AuthorizerConfig) -> Authorizer {
        Authorizer::with_static_keys(
            config,
            [(
                "k1".to_string(),
                DecodingKey::from_secret(SECRET),
                Algorithm::HS256,
            )],
        )
    }

    fn authorizer() -> Authorizer {
        with_config(config())
    }

    fn signed(kid: &str, iss: &str, aud: &str, exp: u64) -> String {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(kid.to_string());
        let claims = Claims {
            sub: "user-1",
            email: "dev@example.com",
            iss,
            aud,
            exp,
        };
        encode(&header, &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    fn token(kid: &str, aud: &str, exp: u64) -> String {
        signed(kid, ISSUER, aud, exp)
    }

    /// Serve `body` as a JWKS document on a loopback port, counting fetches.
    async fn serve_jwks(body: &'static str) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = axum::Router::new().route(
            "/jwks",
            axum::routing::get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    body
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/jwks"), hits)
    }

    const ROTATED_JWKS: &str = r#"{"keys":[
        {"kid":"k2","kty":"EC","crv":"P-256","x":"f83OJ3D2xF1Bg8vub9tLe1gHMzV76e8Tus9uPHvRVEU","y":"x_FEzRu9m36HLN_tue659LNpXW6pCyStikYjKIWI5a0"}
    ]}"#;

    #[test_timeout::tokio_timeout_test]
    async fn missing_token_is_anonymous() {
        let identity = authorizer().authorize(None).await.unwrap();
        assert_eq!(identity, Identity::anonymous());
        assert_eq!(identity.owner(), None);

        let blank = authorizer().authorize(Some("  ")).await.unwrap();
        assert!(!blank.is_authenticated);
    }

    #[test_timeout::tokio_timeout_test]
    async fn valid_token_yields_identity() {
        let jwt = token("k1", "tether", now_secs() + 600);
        let identity = authorizer().authorize(Some(&jwt)).await.unwrap();
        assert!(identity.is_authenticated);
        assert_eq!(identity.user_id, "user-1");
        assert_eq!(identity.email.as_deref(), Some("dev@example.com"));
        assert_eq!(identity.owner().as_deref(), Some("user-1"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn expired_token_is_rejected() {
        let jwt = token("k1", "tether", now_secs() - 3600);
        let err = authorizer().authorize(Some(&jwt)).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn wrong_audience_is_rejected() {
        let jwt = token("k1", "someone-else", now_secs() + 600);
        assert!(authorizer().authorize(Some(&jwt)).await.is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn token_minted_for_another_client_is_rejected() {
        let jwt = signed("k1", "https://evil.test", "other-app", now_secs() + 600);
        let err = authorizer().authorize(Some(&jwt)).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));

        let jwt = signed("k1", "https://evil.test", "tether", now_secs() + 600);
        assert!(authorizer().authorize(Some(&jwt)).await.is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn missing_issuer_or_audience_refuses_every_token() {
        let jwt = signed("k1", "https://evil.test", "other-app", now_secs() + 600);

        let no_audience = with_config(AuthorizerConfig {
            audience: None,
            ..config()
        });
        let err = no_audience.authorize(Some(&jwt)).await.unwrap_err();
        assert!(matches!(err, AuthError::Unconfigured("audience")));

        let no_issuer = with_config(AuthorizerConfig {
            issuer: None,
            ..config()
        });
        let err = no_issuer.authorize(Some(&jwt)).await.unwrap_err();
        assert!(matches!(err, AuthError::Unconfigured("issuer")));

        // Anonymous access is unaffected.
        assert!(!no_issuer.authorize(None).await.unwrap().is_authenticated);
    }

    #[test_timeout::tokio_timeout_test]
    async fn unknown_kid_refetches_the_key_set() {
        let (url, hits) = serve_jwks(ROTATED_JWKS).await;
        let authorizer = with_config(AuthorizerConfig {
            jwks_url: Some(url),
            ..config()
        });

        // k2 only exists after the refetch; it is an EC key, so the HS256
        // token is then refused on algorithm rather than on an unknown kid.
        let jwt = token("k2", "tether", now_secs() + 600);
        let err = authorizer.authorize(Some(&jwt)).await.unwrap_err();
        assert!(matches!(err, AuthError::AlgorithmMismatch(Algorithm::HS256)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let jwt = token("k9", "tether", now_secs() + 600);
        let err = authorizer.authorize(Some(&jwt)).await.unwrap_err();
        assert!(matches!(err, AuthError::UnknownKey(kid) if kid == "k9"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn unknown_kid_without_jwks_url_fails() {
        let jwt = token("k2", "tether", now_secs() + 600);
        let err = authorizer().authorize(Some(&jwt)).await.unwrap_err();
        assert!(matches!(err, AuthError::MissingJwksUrl));
    }

    #[test_timeout::tokio_timeout_test]
    async fn garbage_token_is_rejected() {
        assert!(authorizer().authorize(Some("not-a-jwt")).await.is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn refresh_requires_a_jwks_url() {
        let err = Authorizer::new(AuthorizerConfig::default())
            .refresh()
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::MissingJwksUrl));
    }

    #[test_timeout::timeout]
    fn parses_rsa_and_ec_jwks_entries() {
        let body = r#"{"keys":[
            {"kid":"rsa","kty":"RSA","alg":"RS256","n":"0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw","e":"AQAB"},
            {"kid":"ec","kty":"EC","crv":"P-256","x":"f83OJ3D2xF1Bg8vub9tLe1gHMzV76e8Tus9uPHvRVEU","y":"x_FEzRu9m36HLN_tue659LNpXW6pCyStikYjKIWI5a0"},
            {"kid":"oct","kty":"oct","k":"c2VjcmV0"},
            {"kty":"EC","crv":"P-256","x":"a","y":"b"}
        ]}"#;
        let parsed: JwksResponse = serde_json::from_str(body).unwrap();
        let keys: HashMap<String, Algorithm> = parsed
            .keys
            .into_iter()
            .filter_map(JwkEntry::into_key)
            .filter_map(|(kid, key)| key.ok().map(|key| (kid, key.algorithm)))
            .collect();
        assert_eq!(keys.get("rsa"), Some(&Algorithm::RS256));
        assert_eq!(keys.get("ec"), Some(&Algorithm::ES256));
        assert_eq!(keys.len(), 2);
    }
}
