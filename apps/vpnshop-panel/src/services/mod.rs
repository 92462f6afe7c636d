pub mod fulfillment;
pub mod notification_service;
pub mod orchestrator;
pub mod payment;
pub mod provisioning;
pub mod reconciliation;

#[cfg(test)]
pub(crate) mod testing;

/// HTTP client for unit tests; reqwest is built without a bundled TLS provider.
#[cfg(test)]
pub(crate) fn test_http_client() -> reqwest::Client {
    let _ = rustls::crypto::ring::default_provider().install_default();
    reqwest::Client::new()
}
