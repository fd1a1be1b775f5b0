//! End-to-end payload encryption for sessions.
//!
//! Peers agree on pairwise keys with ephemeral X25519 (`ring`), derive
//! AES-256-GCM keys with HKDF-SHA256 and seal payloads with a random nonce.
//! Group sessions layer epochs on top: every membership change installs a
//! fresh random epoch secret and the key of the epoch before it is kept only
//! long enough to open messages already in flight.

use aes_gcm::{aead::Aead, aead::Payload, Aes256Gcm, KeyInit};
use hkdf::Hkdf;
use rand::RngCore;
use ring::agreement::{self, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{Result, SlimError};

const PAIRWISE_INFO: &[u8] = b"slim-session-pairwise";
const EPOCH_INFO: &[u8] = b"slim-session-epoch";

/// 256-bit AEAD key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey([REDACTED])")
    }
}

/// Sealed payload: ciphertext with the 16-byte tag appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sealed {
    /// Epoch whose key sealed the payload.
    pub epoch: u64,
    /// Random AES-GCM nonce.
    pub nonce: [u8; 12],
    /// Ciphertext and tag.
    pub ciphertext: Vec<u8>,
}

fn aad(session_id: u32, epoch: u64) -> [u8; 12] {
    let mut aad = [0u8; 12];
    aad[..4].copy_from_slice(&session_id.to_be_bytes());
    aad[4..].copy_from_slice(&epoch.to_be_bytes());
    aad
}

fn expand(ikm: &[u8], info: &[u8], context: &[u8]) -> Result<SessionKey> {
    let hk = Hkdf::<Sha256>::new(None, ikm);
    let mut full_info = Vec::with_capacity(info.len() + context.len());
    full_info.extend_from_slice(info);
    full_info.extend_from_slice(context);
    let mut okm = [0u8; 32];
    hk.expand(&full_info, &mut okm)
        .map_err(|e| SlimError::InternalError(format!("key derivation failed: {}", e)))?;
    let key = SessionKey(okm);
    okm.zeroize();
    Ok(key)
}

impl SessionKey {
    /// Derives the epoch key from an epoch secret.
    pub fn from_epoch_secret(secret: &EpochSecret, context: &[u8]) -> Result<Self> {
        expand(&secret.0[..], EPOCH_INFO, context)
    }

    /// Encrypts with a fresh nonce, binding session id and epoch.
    pub fn seal(&self, session_id: u32, epoch: u64, plaintext: &[u8]) -> Result<Sealed> {
        let cipher = Aes256Gcm::new_from_slice(&self.0)
            .map_err(|e| SlimError::InternalError(e.to_string()))?;
        let mut nonce = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce);
        let aad = aad(session_id, epoch);
        let ciphertext = cipher
            .encrypt(
                aes_gcm::Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| SlimError::InternalError("encryption failed".to_string()))?;
        Ok(Sealed {
            epoch,
            nonce,
            ciphertext,
        })
    }

    /// Decrypts; fails with `ReceiveError` on a bad tag.
    pub fn open(&self, session_id: u32, sealed: &Sealed) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(&self.0)
            .map_err(|e| SlimError::InternalError(e.to_string()))?;
        let aad = aad(session_id, sealed.epoch);
        cipher
            .decrypt(
                aes_gcm::Nonce::from_slice(&sealed.nonce),
                Payload {
                    msg: &sealed.ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| SlimError::ReceiveError("payload authentication failed".to_string()))
    }
}

/// Random secret distributed by the group moderator for one epoch.
pub struct EpochSecret(Zeroizing<[u8; 32]>);

impl EpochSecret {
    /// Fresh secret from the thread RNG.
    pub fn random() -> Self {
        let mut bytes = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut bytes[..]);
        Self(bytes)
    }

    /// Wraps a received 32-byte secret.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SlimError::SessionError("epoch secret has wrong length".to_string()))?;
        Ok(Self(Zeroizing::new(array)))
    }

    /// Raw secret bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }
}

/// One side of an ephemeral X25519 exchange.
pub struct KeyExchange {
    private: EphemeralPrivateKey,
    public: Vec<u8>,
}

impl std::fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExchange")
            .field("public", &hex::encode(&self.public))
            .finish()
    }
}

impl KeyExchange {
    /// Generates an ephemeral key pair.
    pub fn new() -> Result<Self> {
        let rng = SystemRandom::new();
        let private = EphemeralPrivateKey::generate(&X25519, &rng)
            .map_err(|_| SlimError::InternalError("key generation failed".to_string()))?;
        let public = private
            .compute_public_key()
            .map_err(|_| SlimError::InternalError("public key computation failed".to_string()))?
            .as_ref()
            .to_vec();
        Ok(Self { private, public })
    }

    /// Public half to send to the peer.
    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    /// Consumes the private half and derives the pairwise key. `context`
    /// binds the key to the session.
    pub fn derive(self, peer_public: &[u8], context: &[u8]) -> Result<SessionKey> {
        let peer = UnparsedPublicKey::new(&X25519, peer_public);
        agreement::agree_ephemeral(self.private, &peer, |shared| {
            expand(shared, PAIRWISE_INFO, context)
        })
        .map_err(|_| SlimError::SessionError("key agreement failed".to_string()))?
    }
}

/// Current epoch key plus, briefly, the previous one.
#[derive(Debug)]
pub struct EpochKeys {
    current: (u64, SessionKey),
    previous: Option<(u64, SessionKey)>,
}

impl EpochKeys {
    /// Starts at `epoch` with no previous key.
    pub fn new(epoch: u64, key: SessionKey) -> Self {
        Self {
            current: (epoch, key),
            previous: None,
        }
    }

    /// Current epoch number.
    pub fn epoch(&self) -> u64 {
        self.current.0
    }

    /// Installs a newer epoch. Older keys are dropped (and zeroised); stale
    /// or repeated epochs are ignored.
    pub fn rotate(&mut self, epoch: u64, key: SessionKey) -> bool {
        if epoch <= self.current.0 {
            return false;
        }
        let old = std::mem::replace(&mut self.current, (epoch, key));
        self.previous = Some(old);
        true
    }

    /// Seals with the current key.
    pub fn seal(&self, session_id: u32, plaintext: &[u8]) -> Result<Sealed> {
        let (epoch, key) = &self.current;
        key.seal(session_id, *epoch, plaintext)
    }

    /// Opens with whichever held key matches the sealed epoch.
    pub fn open(&self, session_id: u32, sealed: &Sealed) -> Result<Vec<u8>> {
        if sealed.epoch == self.current.0 {
            return self.current.1.open(session_id, sealed);
        }
        match &self.previous {
            Some((epoch, key)) if *epoch == sealed.epoch => key.open(session_id, sealed),
            _ => Err(SlimError::ReceiveError(format!(
                "no key for epoch {}",
                sealed.epoch
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pair(context: &[u8]) -> (SessionKey, SessionKey) {
        let a = KeyExchange::new().unwrap();
        let b = KeyExchange::new().unwrap();
        let a_pub = a.public_key().to_vec();
        let b_pub = b.public_key().to_vec();
        (a.derive(&b_pub, context).unwrap(), b.derive(&a_pub, context).unwrap())
    }

    #[test]
    fn test_pairwise_keys_agree() {
        let (a, b) = pair(b"session-1");
        let sealed = a.seal(1, 0, b"hello").unwrap();
        assert_eq!(b.open(1, &sealed).unwrap(), b"hello");
    }

    #[test]
    fn test_context_binds_key() {
        let x = KeyExchange::new().unwrap();
        let y = KeyExchange::new().unwrap();
        let x_pub = x.public_key().to_vec();
        let kx = x.derive(y.public_key(), b"one").unwrap();
        let ky = y.derive(&x_pub, b"two").unwrap();
        let sealed = kx.seal(1, 0, b"data").unwrap();
        assert!(ky.open(1, &sealed).is_err());
    }

    #[test]
    fn test_aad_binds_session_and_epoch() {
        let (a, b) = pair(b"ctx");
        let mut sealed = a.seal(7, 3, b"payload").unwrap();
        assert!(b.open(8, &sealed).is_err());
        sealed.epoch = 4;
        assert!(b.open(7, &sealed).is_err());
    }

    #[test]
    fn test_tamper_detected() {
        let (a, b) = pair(b"ctx");
        let mut sealed = a.seal(1, 0, b"payload").unwrap();
        sealed.ciphertext[0] ^= 0xff;
        assert!(matches!(b.open(1, &sealed), Err(SlimError::ReceiveError(_))));
    }

    #[test]
    fn test_bad_peer_key_rejected() {
        let a = KeyExchange::new().unwrap();
        assert!(a.derive(&[1, 2, 3], b"ctx").is_err());
    }

    #[test]
    fn test_epoch_rotation_keeps_only_previous() {
        let s0 = EpochSecret::random();
        let s1 = EpochSecret::random();
        let s2 = EpochSecret::random();
        let key = |s: &EpochSecret| SessionKey::from_epoch_secret(s, b"g").unwrap();

        let mut keys = EpochKeys::new(0, key(&s0));
        let old = keys.seal(1, b"epoch0").unwrap();
        assert!(keys.rotate(1, key(&s1)));
        assert_eq!(keys.open(1, &old).unwrap(), b"epoch0");
        assert!(!keys.rotate(1, key(&s2)));

        assert!(keys.rotate(2, key(&s2)));
        assert!(keys.open(1, &old).is_err());
        assert_eq!(keys.epoch(), 2);
    }

    #[test]
    fn test_epoch_secret_length() {
        assert!(EpochSecret::from_bytes(&[0u8; 31]).is_err());
        let s = EpochSecret::random();
        assert_eq!(EpochSecret::from_bytes(s.as_bytes()).unwrap().as_bytes(), s.as_bytes());
    }

    proptest! {
        #[test]
        fn prop_seal_open(data in prop::collection::vec(any::<u8>(), 0..4096), sid in any::<u32>()) {
            let secret = EpochSecret::random();
            let keys = EpochKeys::new(5, SessionKey::from_epoch_secret(&secret, b"ctx").unwrap());
            let sealed = keys.seal(sid, &data).unwrap();
            prop_assert_eq!(keys.open(sid, &sealed).unwrap(), data);
        }
    }
}
