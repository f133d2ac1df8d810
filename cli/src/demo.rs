// Demo identity provider for the simulator
//
// Not real cryptography: addresses are derived from the identity nonce and
// packages are JSON bound to that address, which is enough to show that a
// package only completes with the identity that produced the address.

use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokenmesh_core::{Identity, IdentityError, IdentityProvider};

#[derive(Serialize, Deserialize)]
struct DemoPackage {
    to: String,
    from: String,
    token: String,
}

pub struct DemoIdentity;

impl DemoIdentity {
    pub fn random_identity() -> Identity {
        let mut secret = vec![0u8; 32];
        let mut nonce = vec![0u8; 12];
        rand::thread_rng().fill_bytes(&mut secret);
        rand::thread_rng().fill_bytes(&mut nonce);
        Identity { secret, nonce }
    }

    fn address(identity: &Identity, token_type: &str) -> String {
        format!("tm1{}{}", token_type.len(), hex::encode(&identity.nonce))
    }
}

#[async_trait]
impl IdentityProvider for DemoIdentity {
    async fn generate_identity(&self) -> Result<Identity, IdentityError> {
        Ok(Self::random_identity())
    }

    async fn derive_address(
        &self,
        identity: &Identity,
        token_type: &str,
        _token_id: &str,
    ) -> Result<String, IdentityError> {
        Ok(Self::address(identity, token_type))
    }

    async fn create_offline_transfer_package(
        &self,
        sender: &Identity,
        recipient_address: &str,
        token_json: &str,
    ) -> Result<String, IdentityError> {
        let package = DemoPackage {
            to: recipient_address.to_string(),
            from: hex::encode(&sender.nonce),
            token: token_json.to_string(),
        };
        serde_json::to_string(&package).map_err(|e| IdentityError::PackageCreation(e.to_string()))
    }

    async fn complete_offline_transfer(
        &self,
        recipient: &Identity,
        package: &str,
    ) -> Result<String, IdentityError> {
        let package: DemoPackage = serde_json::from_str(package)
            .map_err(|e| IdentityError::PackageCompletion(e.to_string()))?;
        if !package.to.ends_with(&hex::encode(&recipient.nonce)) {
            return Err(IdentityError::PackageCompletion(
                "package is addressed to another identity".to_string(),
            ));
        }
        Ok(package.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_package_opens_only_for_its_identity() {
        let provider = DemoIdentity;
        let sender = DemoIdentity::random_identity();
        let recipient = provider.generate_identity().await.expect("identity");
        let stranger = provider.generate_identity().await.expect("identity");

        let address = provider
            .derive_address(&recipient, "ticket", "t1")
            .await
            .expect("address");
        let package = provider
            .create_offline_transfer_package(&sender, &address, "{\"a\":1}")
            .await
            .expect("package");

        assert_eq!(
            provider
                .complete_offline_transfer(&recipient, &package)
                .await
                .expect("complete"),
            "{\"a\":1}"
        );
        assert!(provider
            .complete_offline_transfer(&stranger, &package)
            .await
            .is_err());
    }
}
