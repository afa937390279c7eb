use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::IdentityError;
use crate::types::UserId;

/// Ed25519 key of one node. Signs every mutation the node sends; its public
/// half is the default owner id of content created here.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Read the 32-byte secret at `path`, or create one there on first start.
    pub fn load_or_create(path: &Path) -> Result<Self, IdentityError> {
        let key_file = |e: std::io::Error| IdentityError::KeyFile(format!("{}: {e}", path.display()));

        match std::fs::read(path) {
            Ok(bytes) => {
                let secret: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| IdentityError::KeyFile("expected 32 secret bytes".into()))?;
                Ok(Self {
                    signing_key: SigningKey::from_bytes(&secret),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self::generate();
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(key_file)?;
                }
                std::fs::write(path, identity.signing_key.as_bytes()).map_err(key_file)?;
                Ok(identity)
            }
            Err(e) => Err(key_file(e)),
        }
    }

    pub fn user_id(&self) -> UserId {
        UserId(self.signing_key.verifying_key().to_bytes())
    }

    /// Hex-encoded signature, the form carried in sync messages.
    pub fn sign_hex(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }
}

/// Check a signature produced by [`Identity::sign_hex`] against `signer`.
pub fn verify_hex(signer: &UserId, message: &[u8], signature_hex: &str) -> Result<(), IdentityError> {
    let key = VerifyingKey::from_bytes(&signer.0).map_err(|_| IdentityError::InvalidKeyBytes)?;
    let bytes: [u8; 64] = hex::decode(signature_hex)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or(IdentityError::InvalidSignature)?;
    key.verify(message, &Signature::from_bytes(&bytes))
        .map_err(|_| IdentityError::InvalidSignature)
}
