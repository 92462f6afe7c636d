use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;
use vpnshop_db::models::payment::PaymentIntent;
use vpnshop_shared::types::{FailureReason, GatewayKind};

pub mod cryptomus;
pub mod zarinpal;

/// A webhook delivery exactly as it reached us.
///
/// Stored on the intent when verification starts, so the check can be
/// replayed after a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCallback {
    pub query: Option<String>,
    pub body: String,
    /// Lower-cased header names.
    pub headers: BTreeMap<String, String>,
}

impl RawCallback {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn to_payload(&self) -> String {
        // A struct of strings always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_payload(payload: &str) -> Result<Self, VerificationError> {
        serde_json::from_str(payload)
            .map_err(|e| VerificationError::Malformed(format!("stored callback: {e}")))
    }
}

/// What the gateway claims about a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Paid,
    Declined(FailureReason),
    /// Intermediate status (e.g. waiting for confirmations); nothing to do yet.
    InProgress,
}

/// An authenticated but not yet confirmed callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackNotice {
    pub intent_id: Uuid,
    pub verdict: Verdict,
    /// Amount in minor units, when the callback carries one.
    pub amount: Option<i64>,
    /// Gateway handle carried by the callback (Cryptomus invoice uuid, ZarinPal authority).
    pub reference: Option<String>,
}

/// Final word from the gateway that money arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfirmation {
    pub gateway_ref: String,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkout {
    pub redirect_url: String,
    pub checkout_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("callback failed authentication: {0}")]
    Unauthenticated(String),
    #[error("malformed callback: {0}")]
    Malformed(String),
    #[error("no payment intent {0}")]
    UnknownIntent(Uuid),
    #[error("intent {intent_id} belongs to gateway {expected}, not {got}")]
    WrongGateway {
        intent_id: Uuid,
        expected: GatewayKind,
        got: GatewayKind,
    },
    #[error("gateway {0} is not configured")]
    UnsupportedGateway(GatewayKind),
    #[error("amount mismatch: expected {expected}, gateway reported {reported}")]
    AmountMismatch { expected: i64, reported: i64 },
    #[error("gateway declined payment: {0}")]
    Declined(FailureReason),
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

impl VerificationError {
    /// Failure code written on the intent when this error is an authenticated verdict.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            VerificationError::AmountMismatch { .. } => Some(FailureReason::AmountMismatch),
            VerificationError::Declined(reason) => Some(*reason),
            _ => None,
        }
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn kind(&self) -> GatewayKind;

    /// Opens a checkout and returns where to send the user.
    async fn create_checkout(
        &self,
        intent: &PaymentIntent,
        callback_url: &str,
    ) -> Result<Checkout, VerificationError>;

    /// Local check of a delivery: signature and shape. Never touches the network.
    fn authenticate(&self, raw: &RawCallback) -> Result<CallbackNotice, VerificationError>;

    /// Binds the notice to the stored intent before anything is written.
    fn precheck(&self, _notice: &CallbackNotice, _intent: &PaymentIntent) -> Result<(), VerificationError> {
        Ok(())
    }

    /// Turns a notice into a confirmation, asking the gateway when its scheme requires it.
    async fn confirm(
        &self,
        notice: &CallbackNotice,
        intent: &PaymentIntent,
    ) -> Result<GatewayConfirmation, VerificationError>;
}

/// Parses a decimal major-unit amount ("12.50") into minor units at `scale`.
/// Anything that does not land on a whole minor unit is rejected.
pub fn to_minor_units(raw: &str, scale: u32) -> Result<i64, VerificationError> {
    let value: Decimal = raw
        .trim()
        .parse()
        .map_err(|_| VerificationError::Malformed(format!("amount {raw:?}")))?;
    let factor = 10_i64
        .checked_pow(scale)
        .map(Decimal::from)
        .ok_or_else(|| VerificationError::Malformed(format!("currency scale {scale}")))?;
    let minor = value
        .checked_mul(factor)
        .ok_or_else(|| VerificationError::Malformed(format!("amount {raw:?} overflows")))?;
    if minor.fract() != Decimal::ZERO {
        return Err(VerificationError::Malformed(format!(
            "amount {raw:?} has more than {scale} decimal places"
        )));
    }
    i64::try_from(minor).map_err(|_| VerificationError::Malformed(format!("amount {raw:?} out of range")))
}

pub fn to_major_units(minor: i64, scale: u32) -> Decimal {
    Decimal::new(minor, scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn minor_units_are_exact() {
        assert_eq!(to_minor_units("12.50", 2), Ok(1250));
        assert_eq!(to_minor_units("12.5", 2), Ok(1250));
        assert_eq!(to_minor_units("50000", 0), Ok(50000));
        assert!(to_minor_units("12.505", 2).is_err());
        assert!(to_minor_units("ten", 2).is_err());
        assert_eq!(to_major_units(1250, 2), dec!(12.50));
    }

    #[test]
    fn raw_callback_survives_storage() {
        let mut raw = RawCallback {
            query: Some("Authority=A1&Status=OK".into()),
            body: String::new(),
            headers: BTreeMap::new(),
        };
        raw.headers.insert("sign".into(), "abc".into());
        let back = RawCallback::from_payload(&raw.to_payload()).unwrap();
        assert_eq!(back, raw);
        assert_eq!(back.header("Sign"), Some("abc"));
    }

    #[test]
    fn only_verdicts_carry_failure_reasons() {
        assert_eq!(
            VerificationError::AmountMismatch { expected: 1, reported: 2 }.failure_reason(),
            Some(FailureReason::AmountMismatch)
        );
        assert_eq!(
            VerificationError::Unauthenticated("sig".into()).failure_reason(),
            None
        );
        assert_eq!(VerificationError::Unavailable("503".into()).failure_reason(), None);
    }
}
