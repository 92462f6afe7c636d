use async_trait::async_trait;
use vpnshop_db::models::order::ServiceOrder;

pub mod xui;

/// Opaque handle of an entitlement on the VPN panel.
pub type ProviderRef = String;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisioningError {
    /// Network failure, timeout or 5xx; worth retrying.
    #[error("transient provisioning failure: {0}")]
    Transient(String),
    /// Validation or quota rejection; retrying will not help.
    #[error("provisioning rejected: {0}")]
    Permanent(String),
}

impl ProvisioningError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProvisioningError::Transient(_))
    }
}

#[async_trait]
pub trait ProvisioningAdapter: Send + Sync {
    /// Looks up an entitlement created earlier for this order's credential.
    async fn find(&self, order: &ServiceOrder) -> Result<Option<ProviderRef>, ProvisioningError>;

    async fn provision(&self, order: &ServiceOrder) -> Result<ProviderRef, ProvisioningError>;

    /// Rewrites the entitlement at `provider_ref` with the order's absolute limits.
    async fn renew(&self, provider_ref: &str, order: &ServiceOrder) -> Result<(), ProvisioningError>;

    async fn deactivate(&self, provider_ref: &str) -> Result<(), ProvisioningError>;
}
