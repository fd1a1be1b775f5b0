//! Identity tokens attached to outbound messages and checked on inbound ones.
//!
//! Four mechanisms are supported: a shared HMAC secret, JWT, SPIRE JWT-SVIDs
//! and a static token file. Each is a [`TokenProvider`] plus a
//! [`TokenVerifier`]; the verifier yields the sender identity that ends up in
//! the message context.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{Result, SlimError};

type HmacSha256 = Hmac<Sha256>;

/// Minimum length of a shared secret, in bytes.
pub const MIN_SHARED_SECRET_LEN: usize = 32;

/// Validity window of shared-secret tokens, in seconds.
pub const SHARED_SECRET_VALIDITY_SECS: u64 = 3600;

/// Produces the identity token placed on every outbound message.
pub trait TokenProvider: Send + Sync {
    /// Returns a token for the next outbound message.
    fn token(&self) -> Result<String>;
}

/// Validates an inbound token and returns the verified identity.
pub trait TokenVerifier: Send + Sync {
    /// Returns the identity carried by `token`.
    fn verify(&self, token: &str) -> Result<String>;
}

/// Signing algorithms accepted for JWT and SPIRE tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum JwtAlgorithm {
    /// HMAC with SHA-256.
    #[default]
    HS256,
    /// RSA PKCS#1 with SHA-256.
    RS256,
    /// ECDSA P-256 with SHA-256.
    ES256,
}

impl From<JwtAlgorithm> for Algorithm {
    fn from(alg: JwtAlgorithm) -> Self {
        match alg {
            JwtAlgorithm::HS256 => Algorithm::HS256,
            JwtAlgorithm::RS256 => Algorithm::RS256,
            JwtAlgorithm::ES256 => Algorithm::ES256,
        }
    }
}

/// Settings for self-issued JWTs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    /// Signing algorithm.
    pub algorithm: JwtAlgorithm,
    /// HMAC secret for HS256.
    pub secret: Option<String>,
    /// Signing key (PEM) for RS256/ES256.
    pub private_key_file: Option<PathBuf>,
    /// Verification key (PEM) for RS256/ES256.
    pub public_key_file: Option<PathBuf>,
    /// Expected `iss` claim.
    pub issuer: Option<String>,
    /// Expected `aud` claim.
    pub audience: Option<String>,
    /// Subject placed in issued tokens; defaults to the app name.
    pub subject: Option<String>,
    /// Token lifetime.
    pub duration_secs: u64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            algorithm: JwtAlgorithm::HS256,
            secret: None,
            private_key_file: None,
            public_key_file: None,
            issuer: None,
            audience: None,
            subject: None,
            duration_secs: 3600,
        }
    }
}

/// Settings for SPIFFE JWT-SVID authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpireConfig {
    /// JWT-SVID file kept fresh by the SPIFFE helper.
    pub jwt_svid_file: PathBuf,
    /// Trust bundle public key, PEM or raw DER.
    pub bundle_key_file: PathBuf,
    /// Algorithm of the trust bundle key.
    #[serde(default = "default_spire_algorithm")]
    pub algorithm: JwtAlgorithm,
    /// Expected `aud` claim.
    #[serde(default)]
    pub audience: Option<String>,
}

fn default_spire_algorithm() -> JwtAlgorithm {
    JwtAlgorithm::ES256
}

/// Authentication mechanism of an app.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    /// HMAC tokens derived from a secret shared by all apps.
    SharedSecret {
        /// At least 32 bytes.
        secret: String,
    },
    /// Self-issued JWTs.
    Jwt(JwtConfig),
    /// JWT-SVIDs provisioned by SPIRE.
    Spire(SpireConfig),
    /// A fixed token read from disk.
    StaticToken {
        /// File holding the token; reread on every use.
        token_file: PathBuf,
    },
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthConfig::SharedSecret { .. } => write!(f, "SharedSecret([REDACTED])"),
            AuthConfig::Jwt(c) => f
                .debug_struct("Jwt")
                .field("algorithm", &c.algorithm)
                .field("issuer", &c.issuer)
                .field("audience", &c.audience)
                .finish(),
            AuthConfig::Spire(c) => f.debug_tuple("Spire").field(c).finish(),
            AuthConfig::StaticToken { token_file } => {
                f.debug_struct("StaticToken").field("token_file", token_file).finish()
            }
        }
    }
}

/// Provider and verifier pair used by an app.
#[derive(Clone)]
pub struct Authenticator {
    provider: Arc<dyn TokenProvider>,
    verifier: Arc<dyn TokenVerifier>,
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Authenticator")
    }
}

impl Authenticator {
    /// Pairs a token provider with a verifier.
    pub fn new(provider: Arc<dyn TokenProvider>, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { provider, verifier }
    }

    /// Builds the mechanism described by `config` for an app called `identity`.
    pub fn from_config(identity: &str, config: &AuthConfig) -> Result<Self> {
        match config {
            AuthConfig::SharedSecret { secret } => {
                let auth = Arc::new(SharedSecretAuth::new(identity, secret)?);
                Ok(Self::new(auth.clone(), auth))
            }
            AuthConfig::Jwt(jwt) => {
                let auth = Arc::new(JwtAuth::new(identity, jwt)?);
                Ok(Self::new(auth.clone(), auth))
            }
            AuthConfig::Spire(spire) => {
                let auth = Arc::new(SpireAuth::new(spire)?);
                Ok(Self::new(auth.clone(), auth))
            }
            AuthConfig::StaticToken { token_file } => {
                let auth = Arc::new(StaticTokenAuth::new(token_file)?);
                Ok(Self::new(auth.clone(), auth))
            }
        }
    }

    /// Issues a token for an outbound message.
    pub fn token(&self) -> Result<String> {
        self.provider.token()
    }

    /// Verifies an inbound token and returns the sender identity.
    pub fn verify(&self, token: &str) -> Result<String> {
        self.verifier.verify(token)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn auth_err(msg: impl fmt::Display) -> SlimError {
    SlimError::AuthError(msg.to_string())
}

/// HMAC-SHA256 tokens of the form `identity|issued_at|hex(mac)`.
pub struct SharedSecretAuth {
    identity: String,
    secret: Zeroizing<Vec<u8>>,
}

impl SharedSecretAuth {
    /// Fails with `AuthError` when the secret is too short.
    pub fn new(identity: &str, secret: &str) -> Result<Self> {
        if secret.len() < MIN_SHARED_SECRET_LEN {
            return Err(SlimError::InvalidArgument(format!(
                "shared secret must be at least {} bytes",
                MIN_SHARED_SECRET_LEN
            )));
        }
        Ok(Self {
            identity: identity.to_string(),
            secret: Zeroizing::new(secret.as_bytes().to_vec()),
        })
    }

    fn mac(&self, identity: &str, issued_at: u64) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(auth_err)?;
        mac.update(identity.as_bytes());
        mac.update(b"|");
        mac.update(issued_at.to_string().as_bytes());
        Ok(mac)
    }

    fn token_at(&self, issued_at: u64) -> Result<String> {
        let tag = self.mac(&self.identity, issued_at)?.finalize().into_bytes();
        Ok(format!("{}|{}|{}", self.identity, issued_at, hex::encode(tag)))
    }

    fn verify_at(&self, token: &str, now: u64) -> Result<String> {
        let mut parts = token.rsplitn(3, '|');
        let (Some(tag), Some(issued_at), Some(identity)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(auth_err("malformed shared-secret token"));
        };
        let issued_at: u64 = issued_at
            .parse()
            .map_err(|_| auth_err("malformed token timestamp"))?;
        if now.abs_diff(issued_at) > SHARED_SECRET_VALIDITY_SECS {
            return Err(auth_err("token expired"));
        }
        let tag = hex::decode(tag).map_err(|_| auth_err("malformed token signature"))?;
        self.mac(identity, issued_at)?
            .verify_slice(&tag)
            .map_err(|_| auth_err("token signature mismatch"))?;
        Ok(identity.to_string())
    }
}

impl TokenProvider for SharedSecretAuth {
    fn token(&self) -> Result<String> {
        self.token_at(now_secs())
    }
}

impl TokenVerifier for SharedSecretAuth {
    fn verify(&self, token: &str) -> Result<String> {
        self.verify_at(token, now_secs())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: u64,
    iat: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    aud: Option<String>,
}

fn read_key_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| auth_err(format!("{}: {}", path.display(), e)))
}

fn is_pem(bytes: &[u8]) -> bool {
    bytes.starts_with(b"-----BEGIN")
}

fn decoding_key(alg: JwtAlgorithm, bytes: &[u8]) -> Result<DecodingKey> {
    match (alg, is_pem(bytes)) {
        (JwtAlgorithm::HS256, _) => Ok(DecodingKey::from_secret(bytes)),
        (JwtAlgorithm::RS256, true) => DecodingKey::from_rsa_pem(bytes).map_err(auth_err),
        (JwtAlgorithm::RS256, false) => Ok(DecodingKey::from_rsa_der(bytes)),
        (JwtAlgorithm::ES256, true) => DecodingKey::from_ec_pem(bytes).map_err(auth_err),
        (JwtAlgorithm::ES256, false) => Ok(DecodingKey::from_ec_der(bytes)),
    }
}

fn encoding_key(alg: JwtAlgorithm, bytes: &[u8]) -> Result<EncodingKey> {
    match (alg, is_pem(bytes)) {
        (JwtAlgorithm::HS256, _) => Ok(EncodingKey::from_secret(bytes)),
        (JwtAlgorithm::RS256, true) => EncodingKey::from_rsa_pem(bytes).map_err(auth_err),
        (JwtAlgorithm::RS256, false) => Ok(EncodingKey::from_rsa_der(bytes)),
        (JwtAlgorithm::ES256, true) => EncodingKey::from_ec_pem(bytes).map_err(auth_err),
        (JwtAlgorithm::ES256, false) => Ok(EncodingKey::from_ec_der(bytes)),
    }
}

fn validation(alg: JwtAlgorithm, issuer: Option<&str>, audience: Option<&str>) -> Validation {
    let mut validation = Validation::new(alg.into());
    if let Some(iss) = issuer {
        validation.set_issuer(&[iss]);
    }
    match audience {
        Some(aud) => validation.set_audience(&[aud]),
        None => validation.validate_aud = false,
    }
    validation
}

/// Signed JWTs (HS256, RS256 or ES256).
pub struct JwtAuth {
    config: JwtConfig,
    subject: String,
    encoding: Option<EncodingKey>,
    decoding: DecodingKey,
}

impl JwtAuth {
    /// Loads the keys named in `config`.
    pub fn new(identity: &str, config: &JwtConfig) -> Result<Self> {
        let (encoding, decoding) = match config.algorithm {
            JwtAlgorithm::HS256 => {
                let secret = config.secret.as_deref().ok_or_else(|| {
                    SlimError::InvalidArgument("HS256 requires a secret".to_string())
                })?;
                (
                    Some(EncodingKey::from_secret(secret.as_bytes())),
                    DecodingKey::from_secret(secret.as_bytes()),
                )
            }
            alg => {
                let public = config.public_key_file.as_deref().ok_or_else(|| {
                    SlimError::InvalidArgument(format!("{:?} requires a public key file", alg))
                })?;
                let encoding = match config.private_key_file.as_deref() {
                    Some(path) => Some(encoding_key(alg, &read_key_file(path)?)?),
                    None => None,
                };
                (encoding, decoding_key(alg, &read_key_file(public)?)?)
            }
        };
        Ok(Self {
            config: config.clone(),
            subject: config.subject.clone().unwrap_or_else(|| identity.to_string()),
            encoding,
            decoding,
        })
    }
}

impl TokenProvider for JwtAuth {
    fn token(&self) -> Result<String> {
        let key = self
            .encoding
            .as_ref()
            .ok_or_else(|| auth_err("no signing key configured"))?;
        let now = now_secs();
        let claims = Claims {
            sub: self.subject.clone(),
            iat: now,
            exp: now + self.config.duration_secs,
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
        };
        jsonwebtoken::encode(&Header::new(self.config.algorithm.into()), &claims, key)
            .map_err(auth_err)
    }
}

impl TokenVerifier for JwtAuth {
    fn verify(&self, token: &str) -> Result<String> {
        let validation = validation(
            self.config.algorithm,
            self.config.issuer.as_deref(),
            self.config.audience.as_deref(),
        );
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .map_err(auth_err)?;
        Ok(data.claims.sub)
    }
}

/// SPIFFE JWT-SVIDs read from disk and checked against the trust bundle key.
pub struct SpireAuth {
    config: SpireConfig,
    decoding: DecodingKey,
}

impl SpireAuth {
    /// Loads the trust bundle key.
    pub fn new(config: &SpireConfig) -> Result<Self> {
        if config.algorithm == JwtAlgorithm::HS256 {
            return Err(SlimError::InvalidArgument(
                "JWT-SVIDs must be signed asymmetrically".to_string(),
            ));
        }
        let decoding = decoding_key(config.algorithm, &read_key_file(&config.bundle_key_file)?)?;
        Ok(Self {
            config: config.clone(),
            decoding,
        })
    }
}

impl TokenProvider for SpireAuth {
    fn token(&self) -> Result<String> {
        let svid = std::fs::read_to_string(&self.config.jwt_svid_file).map_err(|e| {
            auth_err(format!("{}: {}", self.config.jwt_svid_file.display(), e))
        })?;
        Ok(svid.trim().to_string())
    }
}

impl TokenVerifier for SpireAuth {
    fn verify(&self, token: &str) -> Result<String> {
        let validation = validation(self.config.algorithm, None, self.config.audience.as_deref());
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .map_err(auth_err)?;
        if !data.claims.sub.starts_with("spiffe://") {
            return Err(auth_err(format!("subject {} is not a SPIFFE id", data.claims.sub)));
        }
        Ok(data.claims.sub)
    }
}

/// Label reported as the identity of static-token senders.
pub const STATIC_TOKEN_IDENTITY: &str = "static-token";

/// A pre-shared token read from a file.
pub struct StaticTokenAuth {
    token_file: PathBuf,
}

impl StaticTokenAuth {
    /// Fails when the file cannot be read.
    pub fn new(token_file: &Path) -> Result<Self> {
        let auth = Self {
            token_file: token_file.to_path_buf(),
        };
        if auth.read()?.is_empty() {
            return Err(SlimError::InvalidArgument(format!(
                "{}: token file is empty",
                token_file.display()
            )));
        }
        Ok(auth)
    }

    fn read(&self) -> Result<Zeroizing<String>> {
        let content = std::fs::read_to_string(&self.token_file)
            .map_err(|e| auth_err(format!("{}: {}", self.token_file.display(), e)))?;
        Ok(Zeroizing::new(content.trim().to_string()))
    }
}

impl TokenProvider for StaticTokenAuth {
    fn token(&self) -> Result<String> {
        Ok(self.read()?.to_string())
    }
}

impl TokenVerifier for StaticTokenAuth {
    fn verify(&self, token: &str) -> Result<String> {
        let expected = self.read()?;
        if bool::from(expected.as_bytes().ct_eq(token.as_bytes())) {
            Ok(STATIC_TOKEN_IDENTITY.to_string())
        } else {
            Err(auth_err("static token mismatch"))
        }
    }
}
