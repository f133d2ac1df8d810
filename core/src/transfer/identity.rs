// Identity collaborator (one-time identities, addresses, offline packages)

use async_trait::async_trait;
use thiserror::Error;

use super::types::Identity;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("Identity generation failed: {0}")]
    Generation(String),
    #[error("Address derivation failed: {0}")]
    Derivation(String),
    #[error("Package creation failed: {0}")]
    PackageCreation(String),
    #[error("Package completion failed: {0}")]
    PackageCompletion(String),
    #[error("Identity operation timed out: {0}")]
    Timeout(String),
}

/// Cryptographic operations the coordinator delegates to the wallet.
///
/// Completion is a single call so a token is applied entirely or not at all.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Fresh one-time identity for receiving one token
    async fn generate_identity(&self) -> Result<Identity, IdentityError>;

    /// Receiving address for `identity`, bound to the token being transferred
    async fn derive_address(
        &self,
        identity: &Identity,
        token_type: &str,
        token_id: &str,
    ) -> Result<String, IdentityError>;

    /// Signed package moving `token_json` from `sender` to `recipient_address`
    async fn create_offline_transfer_package(
        &self,
        sender: &Identity,
        recipient_address: &str,
        token_json: &str,
    ) -> Result<String, IdentityError>;

    /// Validate and apply a package; returns the received token JSON
    async fn complete_offline_transfer(
        &self,
        recipient: &Identity,
        package: &str,
    ) -> Result<String, IdentityError>;
}
