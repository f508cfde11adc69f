//! OAuth2 credentials for the Gmail API.
//!
//! Startup flow:
//! 1. Load `token.json` if present.
//! 2. If the access token is expired and a refresh token exists, refresh it.
//! 3. Otherwise run the installed-app flow once (loopback redirect, `state`
//!    for CSRF, PKCE S256) using `credentials.json`, then persist the token.
//!
//! Token files are written atomically with 0600 permissions.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use base64::Engine;
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{InitError, MailboxError};

/// Read, send, label and modify; no permanent deletion.
pub const GMAIL_MODIFY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.modify";

const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// How long the loopback listener waits for the browser redirect.
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

// ── Client secrets ──────────────────────────────────────────────────

/// OAuth client downloaded from the Google Cloud Console.
#[derive(Debug, Clone)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: SecretString,
    pub auth_uri: String,
    pub token_uri: String,
}

#[derive(Debug, Deserialize)]
struct SecretsFile {
    installed: Option<SecretsBody>,
    web: Option<SecretsBody>,
}

#[derive(Debug, Deserialize)]
struct SecretsBody {
    client_id: String,
    client_secret: String,
    auth_uri: Option<String>,
    token_uri: Option<String>,
}

impl ClientSecrets {
    pub fn load(path: &Path) -> Result<Self, InitError> {
        if !path.exists() {
            return Err(InitError::MissingCredentials {
                path: path.to_path_buf(),
            });
        }
        let raw = fs::read_to_string(path).map_err(|e| InitError::InvalidCredentials {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&raw).map_err(|reason| InitError::InvalidCredentials {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Parse the `{"installed": {...}}` or `{"web": {...}}` layout.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let file: SecretsFile =
            serde_json::from_str(raw).map_err(|e| format!("not valid JSON: {e}"))?;
        let body = file
            .installed
            .or(file.web)
            .ok_or_else(|| "expected an \"installed\" or \"web\" client".to_string())?;
        Ok(Self {
            client_id: body.client_id,
            client_secret: SecretString::from(body.client_secret),
            auth_uri: body.auth_uri.unwrap_or_else(|| DEFAULT_AUTH_URI.into()),
            token_uri: body.token_uri.unwrap_or_else(|| DEFAULT_TOKEN_URI.into()),
        })
    }
}

// ── Stored token ────────────────────────────────────────────────────

/// Persisted authorization token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Expiry as Unix seconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl StoredToken {
    /// Expired, with a 60-second buffer. No expiry info means valid.
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|at| chrono::Utc::now().timestamp() >= at - 60)
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }

    fn from_response(resp: TokenResponse, previous_refresh: Option<String>) -> Self {
        Self {
            access_token: resp.access_token,
            // Google only returns a refresh token on first consent.
            refresh_token: resp.refresh_token.or(previous_refresh),
            token_type: resp.token_type.unwrap_or_else(default_token_type),
            expires_at: resp
                .expires_in
                .map(|secs| chrono::Utc::now().timestamp() + secs),
            scopes: resp
                .scope
                .map(|s| s.split_whitespace().map(String::from).collect())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
    token_type: Option<String>,
}

// ── Token store ─────────────────────────────────────────────────────

/// File-backed token persistence.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the token. A missing file is `Ok(None)`; an unreadable one is an error.
    pub fn load(&self) -> Result<Option<StoredToken>, InitError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&self.path)
            .map_err(|e| InitError::TokenStore(format!("failed to read token file: {e}")))?;
        let token = serde_json::from_str(&json)
            .map_err(|e| InitError::TokenStore(format!("failed to parse token file: {e}")))?;
        debug!(path = %self.path.display(), "loaded token");
        Ok(Some(token))
    }

    /// Write atomically: temp file with 0600, then rename.
    pub fn store(&self, token: &StoredToken) -> Result<(), InitError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| InitError::TokenStore(format!("failed to create token dir: {e}")))?;
        }
        let json = serde_json::to_string_pretty(token)
            .map_err(|e| InitError::TokenStore(format!("failed to serialize token: {e}")))?;

        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json)
            .map_err(|e| InitError::TokenStore(format!("failed to write token file: {e}")))?;
        set_owner_only(&tmp_path)?;
        fs::rename(&tmp_path, &self.path)
            .map_err(|e| InitError::TokenStore(format!("failed to rename token file: {e}")))?;

        debug!(path = %self.path.display(), "stored token");
        Ok(())
    }
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> Result<(), InitError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|e| InitError::TokenStore(format!("failed to set token permissions: {e}")))
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> Result<(), InitError> {
    Ok(())
}

// ── Authenticator ───────────────────────────────────────────────────

/// Hands out a valid access token, refreshing when needed.
pub struct Authenticator {
    http: reqwest::Client,
    secrets: Option<ClientSecrets>,
    store: TokenStore,
    token: Mutex<StoredToken>,
}

impl Authenticator {
    pub fn new(
        http: reqwest::Client,
        secrets: Option<ClientSecrets>,
        store: TokenStore,
        token: StoredToken,
    ) -> Self {
        Self {
            http,
            secrets,
            store,
            token: Mutex::new(token),
        }
    }

    /// Load a persisted token, refreshing it or running the interactive
    /// flow when it is missing or unusable.
    pub async fn load_or_authorize(
        credentials_path: &Path,
        token_path: &Path,
    ) -> Result<Self, InitError> {
        let http = reqwest::Client::new();
        let store = TokenStore::new(token_path);
        let secrets = match ClientSecrets::load(credentials_path) {
            Ok(s) => Some(s),
            Err(InitError::MissingCredentials { .. }) => None,
            Err(e) => return Err(e),
        };

        if let Some(token) = store.load()? {
            if !token.is_expired() {
                info!("Using stored Gmail token");
                return Ok(Self::new(http, secrets, store, token));
            }
            if let (Some(s), true) = (secrets.as_ref(), token.can_refresh()) {
                match refresh(&http, s, &token).await {
                    Ok(fresh) => {
                        store.store(&fresh)?;
                        info!("Refreshed stored Gmail token");
                        return Ok(Self::new(http, secrets, store, fresh));
                    }
                    Err(e) => warn!(error = %e, "Token refresh failed, re-authorizing"),
                }
            }
        }

        let secrets = secrets.ok_or_else(|| InitError::MissingCredentials {
            path: credentials_path.to_path_buf(),
        })?;
        Self::authorize_with(http, secrets, store).await
    }

    /// Run the interactive flow even when a usable token is stored.
    pub async fn reauthorize(credentials_path: &Path, token_path: &Path) -> Result<Self, InitError> {
        let secrets = ClientSecrets::load(credentials_path)?;
        Self::authorize_with(reqwest::Client::new(), secrets, TokenStore::new(token_path)).await
    }

    async fn authorize_with(
        http: reqwest::Client,
        secrets: ClientSecrets,
        store: TokenStore,
    ) -> Result<Self, InitError> {
        let token = authorize_interactive(&http, &secrets).await?;
        store.store(&token)?;
        info!(path = %store.path().display(), "Authorization complete, token saved");
        Ok(Self::new(http, Some(secrets), store, token))
    }

    /// A currently valid access token.
    pub async fn access_token(&self) -> Result<SecretString, MailboxError> {
        let mut token = self.token.lock().await;
        if token.is_expired() {
            let secrets = self.secrets.as_ref().ok_or_else(|| MailboxError::Auth {
                provider: "gmail".into(),
            })?;
            let fresh = refresh(&self.http, secrets, &token).await.map_err(|e| {
                warn!(error = %e, "Access token refresh failed");
                MailboxError::Auth {
                    provider: "gmail".into(),
                }
            })?;
            if let Err(e) = self.store.store(&fresh) {
                warn!(error = %e, "Refreshed token could not be persisted");
            }
            *token = fresh;
        }
        Ok(SecretString::from(token.access_token.clone()))
    }
}

async fn refresh(
    http: &reqwest::Client,
    secrets: &ClientSecrets,
    token: &StoredToken,
) -> Result<StoredToken, InitError> {
    let refresh_token = token
        .refresh_token
        .as_deref()
        .ok_or_else(|| InitError::Authorization("no refresh token available".into()))?;

    let params = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", secrets.client_id.as_str()),
        ("client_secret", secrets.client_secret.expose_secret()),
    ];
    let resp = post_token(http, &secrets.token_uri, &params).await?;
    Ok(StoredToken::from_response(resp, token.refresh_token.clone()))
}

async fn post_token(
    http: &reqwest::Client,
    token_uri: &str,
    params: &[(&str, &str)],
) -> Result<TokenResponse, InitError> {
    let response = http
        .post(token_uri)
        .form(params)
        .send()
        .await
        .map_err(|e| InitError::Authorization(format!("token request failed: {e}")))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| InitError::Authorization(format!("token response unreadable: {e}")))?;
    if !status.is_success() {
        return Err(InitError::Authorization(format!(
            "token endpoint returned {status}: {body}"
        )));
    }
    serde_json::from_str(&body)
        .map_err(|e| InitError::Authorization(format!("failed to parse token response: {e}")))
}

// ── Interactive flow ────────────────────────────────────────────────

fn random_urlsafe(len: usize) -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..len).map(|_| rng.r#gen()).collect();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn pkce_challenge(verifier: &str) -> String {
    use sha2::Digest;
    let hash = sha2::Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hash)
}

fn authorization_url(
    secrets: &ClientSecrets,
    redirect_uri: &str,
    state: &str,
    challenge: &str,
) -> Result<String, InitError> {
    let mut url = reqwest::Url::parse(&secrets.auth_uri)
        .map_err(|e| InitError::Authorization(format!("invalid auth URI: {e}")))?;
    url.query_pairs_mut()
        .append_pair("client_id", &secrets.client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("response_type", "code")
        .append_pair("scope", GMAIL_MODIFY_SCOPE)
        .append_pair("state", state)
        .append_pair("code_challenge", challenge)
        .append_pair("code_challenge_method", "S256")
        .append_pair("access_type", "offline")
        .append_pair("prompt", "consent");
    Ok(url.to_string())
}

/// Extract the authorization code from the redirect's query, checking `state`.
fn parse_callback(
    params: &HashMap<String, String>,
    expected_state: &str,
) -> Result<String, InitError> {
    if let Some(error) = params.get("error") {
        return Err(InitError::Authorization(format!(
            "authorization denied: {error}"
        )));
    }
    if params.get("state").map(String::as_str) != Some(expected_state) {
        return Err(InitError::Authorization("state mismatch in redirect".into()));
    }
    params
        .get("code")
        .cloned()
        .ok_or_else(|| InitError::Authorization("redirect carried no code".into()))
}

/// Run the installed-app flow: print the consent URL, wait for the
/// loopback redirect, exchange the code.
pub async fn authorize_interactive(
    http: &reqwest::Client,
    secrets: &ClientSecrets,
) -> Result<StoredToken, InitError> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| InitError::Authorization(format!("cannot bind loopback listener: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| InitError::Authorization(e.to_string()))?
        .port();
    let redirect_uri = format!("http://127.0.0.1:{port}/");

    let state = random_urlsafe(32);
    let verifier = random_urlsafe(32);
    let url = authorization_url(secrets, &redirect_uri, &state, &pkce_challenge(&verifier))?;

    eprintln!("Open this URL in a browser to authorize Gmail access:\n\n  {url}\n");

    let code = tokio::time::timeout(CALLBACK_TIMEOUT, accept_callback(listener, &state))
        .await
        .map_err(|_| InitError::Authorization("timed out waiting for the browser redirect".into()))??;

    let params = [
        ("grant_type", "authorization_code"),
        ("code", code.as_str()),
        ("redirect_uri", redirect_uri.as_str()),
        ("client_id", secrets.client_id.as_str()),
        ("client_secret", secrets.client_secret.expose_secret()),
        ("code_verifier", verifier.as_str()),
    ];
    let resp = post_token(http, &secrets.token_uri, &params).await?;
    Ok(StoredToken::from_response(resp, None))
}

#[derive(Clone)]
struct CallbackState {
    expected_state: Arc<str>,
    result: mpsc::Sender<Result<String, InitError>>,
}

/// One route: the OAuth redirect at `/`. Anything else is a 404.
fn callback_router(
    expected_state: &str,
    result: mpsc::Sender<Result<String, InitError>>,
) -> Router {
    Router::new()
        .route("/", get(handle_redirect))
        .with_state(CallbackState {
            expected_state: Arc::from(expected_state),
            result,
        })
}

async fn handle_redirect(
    State(cb): State<CallbackState>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, &'static str) {
    // A bare hit on the root is not the redirect; keep waiting.
    if params.is_empty() {
        return (StatusCode::NOT_FOUND, "");
    }
    let result = parse_callback(&params, &cb.expected_state);
    let page = if result.is_ok() {
        "Authorization complete. You can close this window."
    } else {
        "Authorization failed. Check the terminal for details."
    };
    // Only the first redirect counts.
    let _ = cb.result.try_send(result);
    (StatusCode::OK, page)
}

/// Serve the loopback redirect until the first callback arrives.
async fn accept_callback(
    listener: tokio::net::TcpListener,
    expected_state: &str,
) -> Result<String, InitError> {
    let (tx, mut rx) = mpsc::channel(1);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let app = callback_router(expected_state, tx);

    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .await
    });

    let result = rx.recv().await.unwrap_or_else(|| {
        Err(InitError::Authorization("loopback server stopped".into()))
    });

    let _ = stop_tx.send(());
    match tokio::time::timeout(Duration::from_secs(5), server).await {
        Ok(Ok(Err(e))) => warn!(error = %e, "Loopback server error"),
        Ok(Err(e)) => warn!(error = %e, "Loopback server task failed"),
        _ => {}
    }
    result
}
