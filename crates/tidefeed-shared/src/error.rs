use thiserror::Error;

/// Failure to encode, decode or authenticate a wire message.
#[derive(Error, Debug)]
pub enum SharedError {
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Well-formed JSON that breaks a protocol rule.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid public key bytes")]
    InvalidKeyBytes,

    #[error("Signature does not match")]
    InvalidSignature,

    #[error("Node key file: {0}")]
    KeyFile(String),
}
