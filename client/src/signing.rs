//! # Transaction Signing
//!
//! Transactions are signed per node: the body is framed with the account of
//! the node it is submitted to, so a retry against a different node needs a
//! fresh signature. The executor never sees keys. It asks the request to
//! encode itself for a node, and the request asks its [`Signer`]s.
//!
//! Key bytes are never logged.

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;

use crate::error::{ClientError, Result};

/// Anything that can sign a transaction body.
pub trait Signer: Send + Sync {
    /// Raw public key bytes.
    fn public_key(&self) -> Vec<u8>;

    fn sign(&self, message: &[u8]) -> Vec<u8>;
}

/// An in-memory Ed25519 key.
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    /// A fresh key from the OS RNG.
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self {
            key: SigningKey::from_bytes(seed),
        }
    }

    /// Loads a hex-encoded 32-byte secret, e.g. from an operator key file.
    pub fn from_hex(secret: &str) -> Result<Self> {
        let bytes = hex::decode(secret.trim())
            .map_err(|_| ClientError::Signing("secret key is not valid hex".into()))?;
        let seed: [u8; SECRET_KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| ClientError::Signing("secret key must be 32 bytes".into()))?;
        Ok(Self::from_seed(&seed))
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().as_bytes())
    }
}

impl Signer for Ed25519Signer {
    fn public_key(&self) -> Vec<u8> {
        self.key.verifying_key().as_bytes().to_vec()
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.key.sign(message).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Checks an Ed25519 signature. Malformed keys or signatures fail the
/// check rather than erroring.
pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(message, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let signer = Ed25519Signer::generate();
        let sig = signer.sign(b"body");
        assert_eq!(sig.len(), 64);
        assert!(verify(&signer.public_key(), b"body", &sig));
        assert!(!verify(&signer.public_key(), b"other body", &sig));
    }

    #[test]
    fn malformed_inputs_do_not_verify() {
        let signer = Ed25519Signer::generate();
        let sig = signer.sign(b"body");
        assert!(!verify(&[0u8; 5], b"body", &sig));
        assert!(!verify(&signer.public_key(), b"body", &sig[..10]));
    }

    #[test]
    fn hex_keys_are_deterministic() {
        let secret = "11".repeat(32);
        let a = Ed25519Signer::from_hex(&secret).unwrap();
        let b = Ed25519Signer::from_hex(&secret).unwrap();
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.sign(b"x"), b.sign(b"x"));

        assert!(Ed25519Signer::from_hex("zz").is_err());
        assert!(Ed25519Signer::from_hex("0011").is_err());
    }

    #[test]
    fn debug_hides_the_secret() {
        let secret = "22".repeat(32);
        let signer = Ed25519Signer::from_hex(&secret).unwrap();
        let rendered = format!("{signer:?}");
        assert!(!rendered.contains(&secret));
        assert!(rendered.contains(&signer.public_key_hex()));
    }
}
