//! Types, wire protocol and identity shared by every tidefeed crate.

pub mod constants;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod types;

pub use error::{IdentityError, SharedError};
pub use identity::Identity;
pub use types::*;
