//! ACME v2 client: directory, nonces, account and the JWS-signed requests an
//! order needs.
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::{AcmeError, AcmeResult, OrderManagerConfig};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const REPLAY_NONCE: &str = "Replay-Nonce";
const JOSE_JSON: &str = "application/jose+json";
const PEM_CHAIN: &str = "application/pem-certificate-chain";

#[derive(Debug, Deserialize, Clone)]
struct Directory {
    #[serde(rename = "newNonce")]
    new_nonce: String,
    #[serde(rename = "newAccount")]
    new_account: String,
    #[serde(rename = "newOrder")]
    new_order: String,
}

#[derive(Debug)]
struct NonceManager {
    current_nonce: Mutex<Option<String>>,
}

impl NonceManager {
    fn new() -> Self {
        Self {
            current_nonce: Mutex::new(None),
        }
    }

    /// A nonce is good for one request only.
    fn take_nonce(&self) -> Option<String> {
        self.current_nonce.lock().unwrap().take()
    }

    fn update_nonce(&self, new_nonce: String) {
        *self.current_nonce.lock().unwrap() = Some(new_nonce);
    }
}

struct AccountInner {
    email: Option<String>,
    key: PKey<Private>,
    kid: RwLock<Option<String>>,
}

/// ACME account: an RSA key plus the account URL (`kid`) once registered.
#[derive(Clone)]
pub struct AcmeAccount {
    inner: Arc<AccountInner>,
}

#[derive(Serialize, Deserialize)]
struct AccountConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    directory: Option<String>,
}

impl Display for AcmeAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AcmeAccount(email: {})", self.inner.email.as_deref().unwrap_or("-"))
    }
}

impl AcmeAccount {
    pub fn new(email: Option<String>) -> AcmeResult<Self> {
        info!("generate acme account key for {}", email.as_deref().unwrap_or("-"));
        let key = PKey::from_rsa(Rsa::generate(2048)?)?;
        Ok(Self::with_key(email, key, None))
    }

    fn with_key(email: Option<String>, key: PKey<Private>, kid: Option<String>) -> Self {
        Self {
            inner: Arc::new(AccountInner {
                email,
                key,
                kid: RwLock::new(kid),
            }),
        }
    }

    /// Loads an account saved by [`AcmeAccount::save_to_file`]. The account URL
    /// is only kept when it was registered against `directory_url`.
    pub async fn from_file(path: &Path, directory_url: &str) -> AcmeResult<Self> {
        info!("load acme account key from {}", path.display());
        let content = fs::read_to_string(path).await.map_err(|e| {
            error!("read acme account key file {} failed, {}", path.display(), e);
            AcmeError::IoError(format!("read {} failed, {}", path.display(), e))
        })?;

        let config: AccountConfig = serde_json::from_str(&content).map_err(|e| {
            error!("parse acme account key file {} failed, {}", path.display(), e);
            AcmeError::InvalidConfig(format!("parse {} failed, {}", path.display(), e))
        })?;

        let key = PKey::private_key_from_pem(config.key.as_bytes())?;
        let kid = match config.directory.as_deref() {
            Some(directory) if directory == directory_url => config.kid,
            _ => None,
        };
        let account = Self::with_key(config.email, key, kid);
        info!("load acme account key from {} success, account: {}", path.display(), account);
        Ok(account)
    }

    pub async fn save_to_file(&self, path: &Path, directory_url: &str) -> AcmeResult<()> {
        let key = String::from_utf8(self.inner.key.private_key_to_pem_pkcs8()?)
            .map_err(|e| AcmeError::Crypto(e.to_string()))?;
        let config = AccountConfig {
            email: self.inner.email.clone(),
            key,
            kid: self.kid(),
            directory: Some(directory_url.to_string()),
        };
        let json = serde_json::to_string_pretty(&config)?;
        fs::write(path, json).await.map_err(|e| {
            error!("save acme account key to {} failed, {}", path.display(), e);
            AcmeError::IoError(format!("write {} failed, {}", path.display(), e))
        })?;

        info!("save acme account key to {} success, account: {}", path.display(), self);
        Ok(())
    }

    pub fn email(&self) -> Option<&str> {
        self.inner.email.as_deref()
    }

    pub fn key(&self) -> &PKey<Private> {
        &self.inner.key
    }

    pub fn kid(&self) -> Option<String> {
        self.inner.kid.read().unwrap().clone()
    }

    pub fn set_kid(&self, kid: String) {
        *self.inner.kid.write().unwrap() = Some(kid);
    }

    /// Public JWK. `json!` keeps keys sorted, which is the member order the
    /// thumbprint requires.
    pub fn jwk(&self) -> AcmeResult<Value> {
        let rsa = self.inner.key.rsa()?;
        Ok(serde_json::json!({
            "e": URL_SAFE_NO_PAD.encode(rsa.e().to_vec()),
            "kty": "RSA",
            "n": URL_SAFE_NO_PAD.encode(rsa.n().to_vec()),
        }))
    }

    /// base64url(SHA-256(JWK)).
    pub fn thumbprint(&self) -> AcmeResult<String> {
        let jwk = serde_json::to_string(&self.jwk()?)?;
        Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(jwk.as_bytes())))
    }

    /// Flattened JWS. `None` payload is a POST-as-GET. Before registration the
    /// header carries the JWK, afterwards the account URL.
    fn sign_request(&self, url: &str, nonce: &str, payload: Option<&Value>) -> AcmeResult<Value> {
        let payload_b64 = match payload {
            Some(payload) => URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload)?),
            None => String::new(),
        };

        let protected = match self.kid() {
            Some(kid) => serde_json::json!({
                "alg": "RS256",
                "kid": kid,
                "nonce": nonce,
                "url": url,
            }),
            None => serde_json::json!({
                "alg": "RS256",
                "jwk": self.jwk()?,
                "nonce": nonce,
                "url": url,
            }),
        };
        let protected_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&protected)?);

        let signing_input = format!("{}.{}", protected_b64, payload_b64);
        let mut signer = openssl::sign::Signer::new(openssl::hash::MessageDigest::sha256(), &self.inner.key)?;
        let mut signature = vec![0; signer.len()?];
        let len = signer.sign_oneshot(&mut signature, signing_input.as_bytes())?;
        signature.truncate(len);

        Ok(serde_json::json!({
            "protected": protected_b64,
            "payload": payload_b64,
            "signature": URL_SAFE_NO_PAD.encode(signature),
        }))
    }
}

/// RFC 7807 problem document returned with ACME errors.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Problem {
    #[serde(rename = "type", default)]
    pub type_: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub status: Option<u16>,
}

impl Display for Problem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.type_, self.detail)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcmeStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
    Expired,
    Deactivated,
    Revoked,
    #[serde(other)]
    Unknown,
}

impl AcmeStatus {
    /// Authorization states that can never become valid again.
    pub fn is_rejected(&self) -> bool {
        matches!(
            self,
            AcmeStatus::Invalid | AcmeStatus::Expired | AcmeStatus::Deactivated | AcmeStatus::Revoked
        )
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Copy, Serialize, Deserialize)]
pub enum ChallengeType {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "dns-01")]
    Dns01,
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
    #[serde(other)]
    Unknown,
}

impl Display for ChallengeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            ChallengeType::Http01 => "http-01",
            ChallengeType::Dns01 => "dns-01",
            ChallengeType::TlsAlpn01 => "tls-alpn-01",
            ChallengeType::Unknown => "unknown",
        };
        write!(f, "{}", str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub type_: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: &str) -> Self {
        Self {
            type_: "dns".to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcmeOrder {
    /// Order URL, from the `Location` header of newOrder.
    #[serde(skip)]
    pub url: String,
    pub status: AcmeStatus,
    #[serde(default)]
    pub identifiers: Vec<Identifier>,
    #[serde(default)]
    pub authorizations: Vec<String>,
    pub finalize: String,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub error: Option<Problem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcmeAuthorization {
    pub identifier: Identifier,
    pub status: AcmeStatus,
    #[serde(default)]
    pub challenges: Vec<AcmeChallenge>,
    #[serde(default)]
    pub wildcard: bool,
}

impl AcmeAuthorization {
    pub fn http01_challenge(&self) -> Option<&AcmeChallenge> {
        self.challenges.iter().find(|c| c.type_ == ChallengeType::Http01)
    }

    /// First problem reported by any of the challenges.
    pub fn problem(&self) -> Option<&Problem> {
        self.challenges.iter().find_map(|c| c.error.as_ref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcmeChallenge {
    #[serde(rename = "type")]
    pub type_: ChallengeType,
    pub url: String,
    #[serde(default)]
    pub token: String,
    pub status: AcmeStatus,
    #[serde(default)]
    pub error: Option<Problem>,
}

/// The ACME operations the order manager drives. Every call may fail with a
/// retriable error (see [`AcmeError::is_retriable`]) or a terminal one.
#[async_trait::async_trait]
pub trait AcmeTransport: Send + Sync {
    /// Registers the account on first use. Concurrent callers wait for the
    /// single registration.
    async fn ensure_account(&self) -> AcmeResult<()>;
    async fn new_order(&self, domains: &[String]) -> AcmeResult<AcmeOrder>;
    async fn get_order(&self, url: &str) -> AcmeResult<AcmeOrder>;
    async fn get_authorization(&self, url: &str) -> AcmeResult<AcmeAuthorization>;
    /// Tells the server the challenge response is in place.
    async fn trigger_challenge(&self, url: &str) -> AcmeResult<()>;
    async fn finalize_order(&self, order: &AcmeOrder, csr_der: &[u8]) -> AcmeResult<AcmeOrder>;
    /// PEM certificate chain, leaf first.
    async fn download_certificate(&self, url: &str) -> AcmeResult<Vec<u8>>;
    /// Payload served for `token`: `token.thumbprint`.
    fn key_authorization(&self, token: &str) -> AcmeResult<String>;
}

pub type AcmeTransportRef = Arc<dyn AcmeTransport>;

/// Maps a failed ACME response to an error kind.
pub fn classify_failure(status: u16, problem: Option<&Problem>, body: &str) -> AcmeError {
    let (type_, message) = match problem {
        Some(problem) => (problem.type_.as_str(), format!("{} {}", status, problem)),
        None => ("", format!("{} {}", status, body)),
    };

    if status == 429 || type_.ends_with(":rateLimited") {
        AcmeError::RateLimited(message)
    } else if type_.ends_with(":badNonce") {
        AcmeError::BadNonce(message)
    } else if status >= 500 {
        AcmeError::Network(message)
    } else {
        AcmeError::Protocol(message)
    }
}

#[derive(Clone)]
pub struct AcmeClient {
    inner: Arc<AcmeClientInner>,
}

struct AcmeClientInner {
    directory: tokio::sync::Mutex<Option<Directory>>,
    account_lock: tokio::sync::Mutex<()>,
    http_client: reqwest::Client,
    nonce_manager: NonceManager,
    account: AcmeAccount,
    account_path: Option<PathBuf>,
    acme_server: String,
}

impl Display for AcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AcmeClient(account: {})", self.inner.account)
    }
}

impl AcmeClient {
    pub fn new(account: AcmeAccount, acme_directory: &str) -> AcmeResult<Self> {
        Self::with_account_path(account, acme_directory, None)
    }

    fn with_account_path(
        account: AcmeAccount,
        acme_directory: &str,
        account_path: Option<PathBuf>,
    ) -> AcmeResult<Self> {
        info!("create acme client, account: {}, directory: {}", account, acme_directory);
        let http_client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| AcmeError::Network(format!("build http client failed, {}", e)))?;

        Ok(Self {
            inner: Arc::new(AcmeClientInner {
                directory: tokio::sync::Mutex::new(None),
                account_lock: tokio::sync::Mutex::new(()),
                http_client,
                nonce_manager: NonceManager::new(),
                account,
                account_path,
                acme_server: acme_directory.to_string(),
            }),
        })
    }

    /// Client for the configured endpoint, reusing the persisted account key
    /// when there is one for the same email.
    pub async fn from_config(config: &OrderManagerConfig) -> AcmeResult<Self> {
        let directory_url = config.endpoint.directory_url();
        let email = config.account_email.clone();

        let saved = match &config.account_key_path {
            Some(path) => fs::try_exists(path).await.unwrap_or(false),
            None => false,
        };

        let account = match &config.account_key_path {
            Some(path) if saved => {
                let account = AcmeAccount::from_file(path, directory_url).await?;
                if account.email() == email.as_deref() {
                    account
                } else {
                    info!("account email changed, generate new acme account for {}", path.display());
                    let account = AcmeAccount::new(email)?;
                    account.save_to_file(path, directory_url).await?;
                    account
                }
            }
            Some(path) => {
                let account = AcmeAccount::new(email)?;
                account.save_to_file(path, directory_url).await?;
                account
            }
            None => AcmeAccount::new(email)?,
        };

        Self::with_account_path(account, directory_url, config.account_key_path.clone())
    }

    pub fn account(&self) -> &AcmeAccount {
        &self.inner.account
    }

    async fn get_directory(&self) -> AcmeResult<Directory> {
        let mut directory = self.inner.directory.lock().await;
        if let Some(dir) = directory.as_ref() {
            return Ok(dir.clone());
        }

        info!("get acme directory {}", self.inner.acme_server);
        let response = self
            .inner
            .http_client
            .get(self.inner.acme_server.as_str())
            .send()
            .await
            .map_err(|e| {
                error!("get acme directory failed, {}", e);
                AcmeError::Network(format!("get directory {} failed, {}", self.inner.acme_server, e))
            })?;
        let response = self.check_response("directory", response).await?;
        let dir: Directory = Self::read_json("directory", response).await?;

        info!("get acme directory success, directory: {:?}", dir);
        *directory = Some(dir.clone());
        Ok(dir)
    }

    async fn register_account(&self) -> AcmeResult<()> {
        info!("register acme account, client: {}", self);
        let directory = self.get_directory().await?;
        let mut payload = serde_json::json!({ "termsOfServiceAgreed": true });
        if let Some(email) = self.account().email() {
            payload["contact"] = serde_json::json!([format!("mailto:{}", email)]);
        }

        let response = self.post(&directory.new_account, Some(&payload), None).await?;
        let kid = Self::location(&response)
            .ok_or_else(|| AcmeError::Protocol("no Location header in new account response".to_string()))?;
        self.account().set_kid(kid.clone());
        info!("got account kid: {}", kid);

        if let Some(path) = &self.inner.account_path {
            if let Err(e) = self.account().save_to_file(path, &self.inner.acme_server).await {
                warn!("keep acme account kid failed, {}", e);
            }
        }
        Ok(())
    }

    async fn get_nonce(&self, directory: &Directory) -> AcmeResult<String> {
        match self.inner.nonce_manager.take_nonce() {
            Some(nonce) => Ok(nonce),
            None => self.fetch_new_nonce(directory).await,
        }
    }

    async fn fetch_new_nonce(&self, directory: &Directory) -> AcmeResult<String> {
        debug!("fetch acme nonce, client: {}", self);
        let response = self
            .inner
            .http_client
            .head(&directory.new_nonce)
            .send()
            .await
            .map_err(|e| {
                error!("fetch acme nonce failed, client: {}, {}", self, e);
                AcmeError::Network(format!("fetch nonce failed, {}", e))
            })?;

        response
            .headers()
            .get(REPLAY_NONCE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .ok_or_else(|| AcmeError::BadNonce("no nonce in newNonce response".to_string()))
    }

    /// Signed POST; a `None` payload makes it a POST-as-GET.
    async fn post(&self, url: &str, payload: Option<&Value>, accept: Option<&str>) -> AcmeResult<reqwest::Response> {
        let directory = self.get_directory().await?;
        let nonce = self.get_nonce(&directory).await?;
        let jws = self.account().sign_request(url, &nonce, payload)?;

        let mut request = self
            .inner
            .http_client
            .post(url)
            .header(CONTENT_TYPE, JOSE_JSON)
            .body(serde_json::to_vec(&jws)?);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }

        let response = request.send().await.map_err(|e| {
            error!("acme request {} failed, client: {}, {}", url, self, e);
            AcmeError::Network(format!("POST {} failed, {}", url, e))
        })?;
        self.check_response(url, response).await
    }

    async fn check_response(&self, what: &str, response: reqwest::Response) -> AcmeResult<reqwest::Response> {
        if let Some(nonce) = response.headers().get(REPLAY_NONCE).and_then(|v| v.to_str().ok()) {
            self.inner.nonce_manager.update_nonce(nonce.to_string());
        }

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let problem = serde_json::from_str::<Problem>(&body).ok();
        let err = classify_failure(status.as_u16(), problem.as_ref(), &body);
        error!("acme response error, {}, status: {}, {}", what, status, err);
        Err(err)
    }

    async fn read_json<R: DeserializeOwned>(what: &str, response: reqwest::Response) -> AcmeResult<R> {
        response
            .json()
            .await
            .map_err(|e| AcmeError::Protocol(format!("decode {} response failed, {}", what, e)))
    }

    fn location(response: &reqwest::Response) -> Option<String> {
        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
    }
}

#[async_trait::async_trait]
impl AcmeTransport for AcmeClient {
    async fn ensure_account(&self) -> AcmeResult<()> {
        let _guard = self.inner.account_lock.lock().await;
        if self.account().kid().is_some() {
            return Ok(());
        }
        self.register_account().await
    }

    async fn new_order(&self, domains: &[String]) -> AcmeResult<AcmeOrder> {
        info!("create acme order, client: {}, domains: {}", self, domains.join(","));
        let directory = self.get_directory().await?;
        let identifiers: Vec<Identifier> = domains.iter().map(|d| Identifier::dns(d)).collect();
        let payload = serde_json::json!({ "identifiers": identifiers });

        let response = self.post(&directory.new_order, Some(&payload), None).await?;
        let url = Self::location(&response)
            .ok_or_else(|| AcmeError::Protocol("no Location header in new order response".to_string()))?;
        let mut order: AcmeOrder = Self::read_json("new order", response).await?;
        order.url = url;

        info!("create acme order success, domains: {}, order: {}", domains.join(","), order.url);
        Ok(order)
    }

    async fn get_order(&self, url: &str) -> AcmeResult<AcmeOrder> {
        let response = self.post(url, None, None).await?;
        let mut order: AcmeOrder = Self::read_json("order", response).await?;
        order.url = url.to_string();
        Ok(order)
    }

    async fn get_authorization(&self, url: &str) -> AcmeResult<AcmeAuthorization> {
        debug!("get acme authorization, client: {}, url: {}", self, url);
        let response = self.post(url, None, None).await?;
        Self::read_json("authorization", response).await
    }

    async fn trigger_challenge(&self, url: &str) -> AcmeResult<()> {
        info!("trigger acme challenge, client: {}, url: {}", self, url);
        self.post(url, Some(&serde_json::json!({})), None).await?;
        Ok(())
    }

    async fn finalize_order(&self, order: &AcmeOrder, csr_der: &[u8]) -> AcmeResult<AcmeOrder> {
        info!("finalize acme order, client: {}, url: {}, csr: {}", self, order.finalize, csr_der.len());
        let payload = serde_json::json!({ "csr": URL_SAFE_NO_PAD.encode(csr_der) });
        let response = self.post(&order.finalize, Some(&payload), None).await?;
        let mut finalized: AcmeOrder = Self::read_json("finalize", response).await?;
        finalized.url = order.url.clone();
        Ok(finalized)
    }

    async fn download_certificate(&self, url: &str) -> AcmeResult<Vec<u8>> {
        info!("download acme certificate, client: {}, url: {}", self, url);
        let response = self.post(url, None, Some(PEM_CHAIN)).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| AcmeError::Network(format!("read certificate {} failed, {}", url, e)))?;
        Ok(bytes.to_vec())
    }

    fn key_authorization(&self, token: &str) -> AcmeResult<String> {
        Ok(format!("{}.{}", token, self.account().thumbprint()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::with_retry;
    use crate::RetryPolicy;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use hyper::body::Incoming;
    use hyper::{Method, Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use openssl::hash::MessageDigest;
    use openssl::sign::Verifier;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::net::TcpListener;

    const DIRECTORY: &str = "https://acme.test/directory";

    fn decode_json(b64: &str) -> Value {
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(b64).unwrap()).unwrap()
    }

    #[test]
    fn test_jwk_member_order_and_thumbprint() {
        let account = AcmeAccount::new(Some("admin@example.com".to_string())).unwrap();
        let jwk = serde_json::to_string(&account.jwk().unwrap()).unwrap();
        assert!(jwk.starts_with("{\"e\":\"AQAB\",\"kty\":\"RSA\",\"n\":\""), "{jwk}");

        let thumbprint = account.thumbprint().unwrap();
        assert_eq!(thumbprint.len(), 43);
        assert_eq!(thumbprint, URL_SAFE_NO_PAD.encode(Sha256::digest(jwk.as_bytes())));
    }

    #[test]
    fn test_key_authorization() {
        let account = AcmeAccount::new(None).unwrap();
        let client = AcmeClient::new(account.clone(), DIRECTORY).unwrap();
        let key_auth = client.key_authorization("tok-abc").unwrap();
        assert_eq!(key_auth, format!("tok-abc.{}", account.thumbprint().unwrap()));
    }

    #[test]
    fn test_sign_request_uses_jwk_then_kid() {
        let account = AcmeAccount::new(None).unwrap();
        let payload = serde_json::json!({"termsOfServiceAgreed": true});

        let jws = account.sign_request("https://acme.test/new-acct", "n1", Some(&payload)).unwrap();
        let protected = decode_json(jws["protected"].as_str().unwrap());
        assert_eq!(protected["alg"], "RS256");
        assert_eq!(protected["nonce"], "n1");
        assert_eq!(protected["url"], "https://acme.test/new-acct");
        assert_eq!(protected["jwk"], account.jwk().unwrap());
        assert!(protected.get("kid").is_none());
        assert_eq!(decode_json(jws["payload"].as_str().unwrap()), payload);

        let signing_input = format!("{}.{}", jws["protected"].as_str().unwrap(), jws["payload"].as_str().unwrap());
        let signature = URL_SAFE_NO_PAD.decode(jws["signature"].as_str().unwrap()).unwrap();
        let mut verifier = Verifier::new(MessageDigest::sha256(), account.key()).unwrap();
        assert!(verifier.verify_oneshot(&signature, signing_input.as_bytes()).unwrap());

        account.set_kid("https://acme.test/acct/1".to_string());
        let jws = account.sign_request("https://acme.test/authz/1", "n2", None).unwrap();
        let protected = decode_json(jws["protected"].as_str().unwrap());
        assert_eq!(protected["kid"], "https://acme.test/acct/1");
        assert!(protected.get("jwk").is_none());
        assert_eq!(jws["payload"], "");
    }

    #[tokio::test]
    async fn test_account_file_round_trip() {
        let path = std::env::temp_dir().join(format!("http01-acme-account-{}.json", std::process::id()));
        let account = AcmeAccount::new(Some("ops@example.com".to_string())).unwrap();
        account.set_kid("https://acme.test/acct/7".to_string());
        account.save_to_file(&path, DIRECTORY).await.unwrap();

        let loaded = AcmeAccount::from_file(&path, DIRECTORY).await.unwrap();
        assert_eq!(loaded.email(), Some("ops@example.com"));
        assert_eq!(loaded.kid().as_deref(), Some("https://acme.test/acct/7"));
        assert_eq!(loaded.thumbprint().unwrap(), account.thumbprint().unwrap());

        let other = AcmeAccount::from_file(&path, "https://other.test/directory").await.unwrap();
        assert_eq!(other.kid(), None);
        assert_eq!(other.thumbprint().unwrap(), account.thumbprint().unwrap());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_classify_failure() {
        let problem = |t: &str| Problem {
            type_: format!("urn:ietf:params:acme:error:{}", t),
            detail: "detail".to_string(),
            status: None,
        };

        assert!(matches!(classify_failure(429, None, ""), AcmeError::RateLimited(_)));
        assert!(matches!(
            classify_failure(403, Some(&problem("rateLimited")), ""),
            AcmeError::RateLimited(_)
        ));
        assert!(matches!(classify_failure(400, Some(&problem("badNonce")), ""), AcmeError::BadNonce(_)));
        assert!(matches!(classify_failure(503, None, "unavailable"), AcmeError::Network(_)));
        assert!(matches!(classify_failure(400, Some(&problem("malformed")), ""), AcmeError::Protocol(_)));
        assert!(matches!(classify_failure(403, Some(&problem("unauthorized")), ""), AcmeError::Protocol(_)));
        assert!(classify_failure(500, None, "").is_retriable());
        assert!(!classify_failure(404, None, "").is_retriable());
    }

    #[test]
    fn test_parse_order_and_authorization() {
        let order: AcmeOrder = serde_json::from_str(
            r#"{
                "status": "pending",
                "expires": "2026-01-01T00:00:00Z",
                "identifiers": [{"type": "dns", "value": "example.com"}],
                "authorizations": ["https://acme.test/authz/1"],
                "finalize": "https://acme.test/order/1/finalize"
            }"#,
        )
        .unwrap();
        assert_eq!(order.status, AcmeStatus::Pending);
        assert_eq!(order.identifiers, vec![Identifier::dns("example.com")]);
        assert_eq!(order.certificate, None);
        assert!(order.url.is_empty());

        let authz: AcmeAuthorization = serde_json::from_str(
            r#"{
                "identifier": {"type": "dns", "value": "example.com"},
                "status": "invalid",
                "challenges": [
                    {"type": "dns-01", "url": "https://acme.test/chall/1", "token": "t1", "status": "pending"},
                    {"type": "http-01", "url": "https://acme.test/chall/2", "token": "t2", "status": "invalid",
                     "error": {"type": "urn:ietf:params:acme:error:unauthorized", "detail": "404", "status": 403}},
                    {"type": "some-new-type", "url": "https://acme.test/chall/3", "status": "pending"}
                ]
            }"#,
        )
        .unwrap();
        assert!(authz.status.is_rejected());
        let http01 = authz.http01_challenge().unwrap();
        assert_eq!(http01.token, "t2");
        assert_eq!(authz.challenges[2].type_, ChallengeType::Unknown);
        assert_eq!(authz.problem().unwrap().status, Some(403));
    }

    /// Minimal ACME server on loopback: directory, newNonce, newAccount and
    /// newOrder. Every signed request is checked and its protected header kept.
    struct LoopbackAcme {
        base: String,
        nonce_seq: AtomicU32,
        nonce_fetches: AtomicU32,
        protected: Mutex<Vec<Value>>,
        bad_nonce_once: AtomicBool,
        rate_limited: AtomicBool,
    }

    impl LoopbackAcme {
        async fn start() -> (Arc<Self>, tokio::task::JoinHandle<()>) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let server = Arc::new(Self {
                base: format!("http://{}", listener.local_addr().unwrap()),
                nonce_seq: AtomicU32::new(0),
                nonce_fetches: AtomicU32::new(0),
                protected: Mutex::new(vec![]),
                bad_nonce_once: AtomicBool::new(false),
                rate_limited: AtomicBool::new(false),
            });

            let state = server.clone();
            let task = tokio::spawn(async move {
                loop {
                    let (stream, _) = match listener.accept().await {
                        Ok(ret) => ret,
                        Err(_) => continue,
                    };
                    let state = state.clone();
                    tokio::spawn(async move {
                        let _ = hyper::server::conn::http1::Builder::new()
                            .serve_connection(
                                TokioIo::new(stream),
                                hyper::service::service_fn(move |req: Request<Incoming>| {
                                    let state = state.clone();
                                    async move { Ok::<_, Infallible>(state.handle(req).await) }
                                }),
                            )
                            .await;
                    });
                }
            });
            (server, task)
        }

        fn directory_url(&self) -> String {
            format!("{}/directory", self.base)
        }

        fn protected(&self) -> Vec<Value> {
            self.protected.lock().unwrap().clone()
        }

        fn next_nonce(&self) -> String {
            format!("nonce-{}", self.nonce_seq.fetch_add(1, Ordering::SeqCst) + 1)
        }

        fn reply(&self, status: StatusCode, location: Option<String>, body: Value) -> Response<Full<Bytes>> {
            let mut builder = Response::builder()
                .status(status)
                .header(REPLAY_NONCE, self.next_nonce());
            if let Some(location) = location {
                builder = builder.header(LOCATION, location);
            }
            builder.body(Full::new(Bytes::from(body.to_string()))).unwrap()
        }

        fn problem(&self, status: StatusCode, type_: &str) -> Response<Full<Bytes>> {
            let body = serde_json::json!({
                "type": format!("urn:ietf:params:acme:error:{}", type_),
                "detail": type_,
                "status": status.as_u16(),
            });
            self.reply(status, None, body)
        }

        async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
            let method = req.method().clone();
            let path = req.uri().path().to_string();
            let body = req.into_body().collect().await.unwrap().to_bytes();

            match (method, path.as_str()) {
                (Method::GET, "/directory") => {
                    let directory = serde_json::json!({
                        "newNonce": format!("{}/nonce", self.base),
                        "newAccount": format!("{}/acct", self.base),
                        "newOrder": format!("{}/order", self.base),
                    });
                    Response::new(Full::new(Bytes::from(directory.to_string())))
                }
                (Method::HEAD, "/nonce") => {
                    self.nonce_fetches.fetch_add(1, Ordering::SeqCst);
                    Response::builder()
                        .header(REPLAY_NONCE, self.next_nonce())
                        .body(Full::new(Bytes::new()))
                        .unwrap()
                }
                (Method::POST, path) => {
                    let jws: Value = serde_json::from_slice(&body).unwrap();
                    let protected = decode_json(jws["protected"].as_str().unwrap());
                    assert_eq!(protected["url"], format!("{}{}", self.base, path));
                    self.protected.lock().unwrap().push(protected);

                    if self.bad_nonce_once.swap(false, Ordering::SeqCst) {
                        return self.problem(StatusCode::BAD_REQUEST, "badNonce");
                    }
                    match path {
                        "/acct" => self.reply(
                            StatusCode::CREATED,
                            Some(format!("{}/acct/1", self.base)),
                            serde_json::json!({ "status": "valid" }),
                        ),
                        "/order" if self.rate_limited.load(Ordering::SeqCst) => {
                            self.problem(StatusCode::TOO_MANY_REQUESTS, "rateLimited")
                        }
                        "/order" => {
                            let payload = decode_json(jws["payload"].as_str().unwrap());
                            self.reply(
                                StatusCode::CREATED,
                                Some(format!("{}/order/1", self.base)),
                                serde_json::json!({
                                    "status": "pending",
                                    "identifiers": payload["identifiers"],
                                    "authorizations": [format!("{}/authz/1", self.base)],
                                    "finalize": format!("{}/order/1/finalize", self.base),
                                }),
                            )
                        }
                        _ => self.problem(StatusCode::NOT_FOUND, "malformed"),
                    }
                }
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Full::new(Bytes::new()))
                    .unwrap(),
            }
        }
    }

    #[tokio::test]
    async fn test_client_over_loopback_server() {
        let (server, task) = LoopbackAcme::start().await;
        let client = AcmeClient::new(AcmeAccount::new(None).unwrap(), &server.directory_url()).unwrap();
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2));

        server.bad_nonce_once.store(true, Ordering::SeqCst);
        let c = &client;
        with_retry(&policy, "register account", move || c.ensure_account())
            .await
            .unwrap();
        assert_eq!(client.account().kid(), Some(format!("{}/acct/1", server.base)));

        let protected = server.protected();
        assert_eq!(protected.len(), 2);
        assert_eq!(protected[0]["nonce"], "nonce-1");
        assert_eq!(protected[1]["nonce"], "nonce-2");
        assert_eq!(protected[1]["jwk"], client.account().jwk().unwrap());
        assert_eq!(server.nonce_fetches.load(Ordering::SeqCst), 1);

        client.ensure_account().await.unwrap();
        assert_eq!(server.protected().len(), 2);

        let domains = vec!["example.com".to_string()];
        let order = client.new_order(&domains).await.unwrap();
        assert_eq!(order.url, format!("{}/order/1", server.base));
        assert_eq!(order.status, AcmeStatus::Pending);
        assert_eq!(order.identifiers, vec![Identifier::dns("example.com")]);

        let protected = server.protected();
        let last = protected.last().unwrap();
        assert_eq!(last["nonce"], "nonce-3");
        assert_eq!(last["kid"], format!("{}/acct/1", server.base));
        assert!(last.get("jwk").is_none());
        assert_eq!(server.nonce_fetches.load(Ordering::SeqCst), 1);

        server.rate_limited.store(true, Ordering::SeqCst);
        let err = client.new_order(&domains).await.unwrap_err();
        assert!(matches!(err, AcmeError::RateLimited(_)), "{err}");
        assert!(err.is_retriable());

        task.abort();
    }

    #[tokio::test]
    async fn test_unreachable_directory_is_not_cached() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = AcmeClient::new(AcmeAccount::new(None).unwrap(), &format!("http://{}/directory", addr)).unwrap();
        let err = client.ensure_account().await.unwrap_err();
        assert!(matches!(err, AcmeError::Network(_)), "{err}");
        assert!(client.inner.directory.lock().await.is_none());
    }
}
