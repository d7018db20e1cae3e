use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use leadflow_core::config::CrmConfig;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::client::clip_detail;
use crate::store::{FileCredentialStore, StoreError, StoredCredentials};

/// Access tokens are refreshed this long before their recorded expiry so an
/// in-flight request never rides a token that dies mid-call.
const REFRESH_SAFETY_BUFFER_MINUTES: i64 = 5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenGrant {
    AuthorizationCode(String),
    RefreshToken(String),
}

impl TokenGrant {
    pub fn grant_type(&self) -> &'static str {
        match self {
            Self::AuthorizationCode(_) => "authorization_code",
            Self::RefreshToken(_) => "refresh_token",
        }
    }
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct TokenReply {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no stored credentials and no bootstrap material; run the authorization flow first")]
    MissingBootstrap,
    #[error("token exchange was rejected with status {status}: {detail}")]
    Rejected { status: u16, detail: String },
    #[error("token endpoint request failed: {0}")]
    Transport(String),
    #[error("token endpoint returned an empty access token")]
    EmptyAccessToken,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(&self, grant: &TokenGrant) -> Result<TokenReply, AuthError>;
}

/// Talks to the account's OAuth token endpoint.
pub struct HttpTokenExchanger {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: SecretString,
    redirect_uri: String,
}

impl HttpTokenExchanger {
    pub fn new(config: &CrmConfig) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|error| AuthError::Transport(error.to_string()))?;

        Ok(Self {
            http,
            token_url: format!("https://{}.kommo.com/oauth2/access_token", config.subdomain),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
        })
    }
}

#[derive(Serialize)]
struct ExchangePayload<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    grant_type: &'a str,
    redirect_uri: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<&'a str>,
}

#[async_trait]
impl TokenExchanger for HttpTokenExchanger {
    async fn exchange(&self, grant: &TokenGrant) -> Result<TokenReply, AuthError> {
        let (code, refresh_token) = match grant {
            TokenGrant::AuthorizationCode(code) => (Some(code.as_str()), None),
            TokenGrant::RefreshToken(token) => (None, Some(token.as_str())),
        };
        let payload = ExchangePayload {
            client_id: &self.client_id,
            client_secret: self.client_secret.expose_secret(),
            grant_type: grant.grant_type(),
            redirect_uri: &self.redirect_uri,
            code,
            refresh_token,
        };

        let response = self
            .http
            .post(&self.token_url)
            .json(&payload)
            .send()
            .await
            .map_err(|error| AuthError::Transport(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                detail: clip_detail(&detail),
            });
        }

        response.json().await.map_err(|error| AuthError::Transport(error.to_string()))
    }
}

/// Owns the credential cache and the refresh policy.
pub struct TokenManager {
    store: FileCredentialStore,
    exchanger: Arc<dyn TokenExchanger>,
    bootstrap: Option<SecretString>,
    cached: Mutex<Option<StoredCredentials>>,
}

impl TokenManager {
    pub fn new(
        store: FileCredentialStore,
        exchanger: Arc<dyn TokenExchanger>,
        bootstrap: Option<SecretString>,
    ) -> Self {
        Self { store, exchanger, bootstrap, cached: Mutex::new(None) }
    }

    /// Returns a bearer token valid for at least the safety buffer.
    ///
    /// The mutex is held across the whole check-and-refresh, so concurrent
    /// callers trigger at most one exchange and the losers reuse its result.
    pub async fn access_token(&self) -> Result<String, AuthError> {
        let mut cached = self.cached.lock().await;

        if cached.is_none() {
            *cached = self.store.load().await?;
        }

        let buffer = Duration::minutes(REFRESH_SAFETY_BUFFER_MINUTES);
        if let Some(credentials) = cached.as_ref() {
            if !credentials.expires_within(buffer, Utc::now()) {
                return Ok(credentials.access_token.clone());
            }
        }

        let grant = match cached.as_ref() {
            Some(credentials) => TokenGrant::RefreshToken(credentials.refresh_token.clone()),
            None => self.bootstrap_grant()?,
        };
        let grant_type = grant.grant_type();

        let reply = self.exchanger.exchange(&grant).await?;
        if reply.access_token.trim().is_empty() {
            return Err(AuthError::EmptyAccessToken);
        }

        let credentials = StoredCredentials {
            access_token: reply.access_token,
            refresh_token: reply.refresh_token,
            expires_at: Utc::now() + Duration::seconds(reply.expires_in.max(0)),
        };
        self.store.persist(&credentials).await?;

        info!(
            event_name = "auth.token.exchanged",
            grant_type,
            expires_at = %credentials.expires_at,
            "stored refreshed credentials"
        );

        let token = credentials.access_token.clone();
        *cached = Some(credentials);
        Ok(token)
    }

    fn bootstrap_grant(&self) -> Result<TokenGrant, AuthError> {
        let material = self.bootstrap.as_ref().ok_or(AuthError::MissingBootstrap)?;
        let value = material.expose_secret().trim().to_string();
        if value.is_empty() {
            return Err(AuthError::MissingBootstrap);
        }

        if is_refresh_token(&value) {
            Ok(TokenGrant::RefreshToken(value))
        } else {
            Ok(TokenGrant::AuthorizationCode(value))
        }
    }
}

/// Refresh tokens issued by the CRM are JWT shaped (three dot separated
/// segments); one-time authorization codes from the OAuth redirect are
/// opaque `def502...` blobs.
fn is_refresh_token(material: &str) -> bool {
    let mut segments = material.split('.');
    matches!(
        (segments.next(), segments.next(), segments.next(), segments.next()),
        (Some(header), Some(claims), Some(signature), None)
            if !header.is_empty() && !claims.is_empty() && !signature.is_empty()
    )
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    use super::{
        is_refresh_token, AuthError, TokenExchanger, TokenGrant, TokenManager, TokenReply,
    };
    use crate::store::{FileCredentialStore, StoredCredentials};

    const JWT_SHAPED: &str = "eyJhbGciOi.eyJzdWIiOi.c2lnbmF0dXJl";
    const OPAQUE: &str = "def50200c0ffee";

    #[derive(Default)]
    struct ScriptedExchanger {
        state: Mutex<ScriptedState>,
    }

    #[derive(Default)]
    struct ScriptedState {
        replies: VecDeque<Result<TokenReply, AuthError>>,
        grants: Vec<TokenGrant>,
    }

    impl ScriptedExchanger {
        fn with_replies(replies: Vec<Result<TokenReply, AuthError>>) -> Self {
            Self {
                state: Mutex::new(ScriptedState { replies: replies.into(), grants: Vec::new() }),
            }
        }

        async fn grants(&self) -> Vec<TokenGrant> {
            self.state.lock().await.grants.clone()
        }
    }

    #[async_trait]
    impl TokenExchanger for ScriptedExchanger {
        async fn exchange(&self, grant: &TokenGrant) -> Result<TokenReply, AuthError> {
            let mut state = self.state.lock().await;
            state.grants.push(grant.clone());
            state
                .replies
                .pop_front()
                .unwrap_or_else(|| Err(AuthError::Transport("script exhausted".to_string())))
        }
    }

    fn reply(access: &str) -> TokenReply {
        TokenReply {
            access_token: access.to_string(),
            refresh_token: "refresh-new".to_string(),
            expires_in: 86_400,
        }
    }

    fn store_in(dir: &TempDir) -> FileCredentialStore {
        FileCredentialStore::new(dir.path().join("tokens.json"))
    }

    #[tokio::test]
    async fn jwt_shaped_bootstrap_material_exchanges_as_refresh_token() {
        let dir = TempDir::new().expect("temp dir");
        let exchanger = Arc::new(ScriptedExchanger::with_replies(vec![Ok(reply("access-1"))]));
        let manager = TokenManager::new(
            store_in(&dir),
            exchanger.clone(),
            Some(JWT_SHAPED.to_string().into()),
        );

        let token = manager.access_token().await.expect("token");

        assert_eq!(token, "access-1");
        assert_eq!(
            exchanger.grants().await,
            vec![TokenGrant::RefreshToken(JWT_SHAPED.to_string())]
        );
    }

    #[tokio::test]
    async fn opaque_bootstrap_material_exchanges_as_authorization_code() {
        let dir = TempDir::new().expect("temp dir");
        let exchanger = Arc::new(ScriptedExchanger::with_replies(vec![Ok(reply("access-1"))]));
        let manager =
            TokenManager::new(store_in(&dir), exchanger.clone(), Some(OPAQUE.to_string().into()));

        manager.access_token().await.expect("token");

        assert_eq!(
            exchanger.grants().await,
            vec![TokenGrant::AuthorizationCode(OPAQUE.to_string())]
        );
    }

    #[tokio::test]
    async fn fresh_stored_credentials_skip_the_exchange() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);
        store
            .persist(&StoredCredentials {
                access_token: "access-stored".to_string(),
                refresh_token: "refresh-stored".to_string(),
                expires_at: Utc::now() + Duration::hours(2),
            })
            .await
            .expect("persist");

        let exchanger = Arc::new(ScriptedExchanger::default());
        let manager = TokenManager::new(store, exchanger.clone(), None);

        let token = manager.access_token().await.expect("token");

        assert_eq!(token, "access-stored");
        assert!(exchanger.grants().await.is_empty());
    }

    #[tokio::test]
    async fn near_expiry_credentials_refresh_with_the_stored_refresh_token() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_in(&dir);
        store
            .persist(&StoredCredentials {
                access_token: "access-old".to_string(),
                refresh_token: "refresh-old".to_string(),
                expires_at: Utc::now() + Duration::minutes(2),
            })
            .await
            .expect("persist");

        let exchanger = Arc::new(ScriptedExchanger::with_replies(vec![Ok(reply("access-new"))]));
        let manager = TokenManager::new(store_in(&dir), exchanger.clone(), None);

        let token = manager.access_token().await.expect("token");

        assert_eq!(token, "access-new");
        assert_eq!(
            exchanger.grants().await,
            vec![TokenGrant::RefreshToken("refresh-old".to_string())]
        );

        let persisted = store_in(&dir).load().await.expect("load").expect("file exists");
        assert_eq!(persisted.access_token, "access-new");
        assert_eq!(persisted.refresh_token, "refresh-new");
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_exchange() {
        let dir = TempDir::new().expect("temp dir");
        let exchanger = Arc::new(ScriptedExchanger::with_replies(vec![Ok(reply("access-1"))]));
        let manager = Arc::new(TokenManager::new(
            store_in(&dir),
            exchanger.clone(),
            Some(OPAQUE.to_string().into()),
        ));

        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.access_token().await }
        });
        let second = tokio::spawn({
            let manager = manager.clone();
            async move { manager.access_token().await }
        });

        let first = first.await.expect("join").expect("token");
        let second = second.await.expect("join").expect("token");

        assert_eq!(first, "access-1");
        assert_eq!(second, "access-1");
        assert_eq!(exchanger.grants().await.len(), 1);
    }

    #[tokio::test]
    async fn missing_bootstrap_without_stored_credentials_fails() {
        let dir = TempDir::new().expect("temp dir");
        let manager = TokenManager::new(store_in(&dir), Arc::new(ScriptedExchanger::default()), None);

        let error = manager.access_token().await.expect_err("should fail");
        assert!(matches!(error, AuthError::MissingBootstrap));
    }

    #[tokio::test]
    async fn rejected_exchange_surfaces_the_status() {
        let dir = TempDir::new().expect("temp dir");
        let exchanger = Arc::new(ScriptedExchanger::with_replies(vec![Err(AuthError::Rejected {
            status: 400,
            detail: "invalid_grant".to_string(),
        })]));
        let manager =
            TokenManager::new(store_in(&dir), exchanger, Some(OPAQUE.to_string().into()));

        let error = manager.access_token().await.expect_err("should fail");
        assert!(matches!(error, AuthError::Rejected { status: 400, .. }));
    }

    #[test]
    fn refresh_token_shape_detection() {
        assert!(is_refresh_token(JWT_SHAPED));
        assert!(!is_refresh_token(OPAQUE));
        assert!(!is_refresh_token("a.b"));
        assert!(!is_refresh_token("a..c"));
        assert!(!is_refresh_token("a.b.c.d"));
    }
}
