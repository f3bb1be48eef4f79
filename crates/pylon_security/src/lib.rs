//! Pylon Security Module
//!
//! Provides:
//! - **Gatekeeper**: AST-based Python code validation (syntax + blocked imports)
//! - **Signing**: HMAC-SHA256 script signatures with constant-time verification
//! - **Credentials**: API-key and admin-key checking

pub mod credentials;
pub mod gatekeeper;
pub mod signing;

pub use credentials::{CredentialChecker, Identity, SessionResolver};
pub use gatekeeper::{Gatekeeper, SyntaxIssue};
pub use signing::{
    derive_install_key, sha256_hex, sign_script, verify_script, SignatureError, SigningKey,
};
