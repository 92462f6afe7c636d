use crate::services::payment::{
    CallbackNotice, Checkout, GatewayConfirmation, PaymentGateway, RawCallback, Verdict,
    VerificationError, to_major_units,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;
use uuid::Uuid;
use vpnshop_db::models::payment::PaymentIntent;
use vpnshop_shared::types::{FailureReason, GatewayKind};

/// ZarinPal v4. The callback itself is an unsigned browser redirect, so
/// authenticity comes from the server-side `verify` call bound to the
/// authority we were given at checkout.
pub struct ZarinPalGateway {
    client: reqwest::Client,
    merchant_id: String,
    api_base: &'static str,
    start_pay_base: &'static str,
    currency_scale: u32,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    #[serde(rename = "Authority")]
    authority: String,
    #[serde(rename = "Status")]
    status: String,
    intent: String,
}

impl ZarinPalGateway {
    pub fn new(client: reqwest::Client, merchant_id: String, sandbox: bool, currency_scale: u32) -> Self {
        let (api_base, start_pay_base) = if sandbox {
            (
                "https://sandbox.zarinpal.com/pg/v4/payment",
                "https://sandbox.zarinpal.com/pg/StartPay",
            )
        } else {
            (
                "https://api.zarinpal.com/pg/v4/payment",
                "https://www.zarinpal.com/pg/StartPay",
            )
        };
        Self {
            client,
            merchant_id,
            api_base,
            start_pay_base,
            currency_scale,
        }
    }

    /// ZarinPal only takes whole rials.
    fn gateway_amount(&self, minor: i64) -> Result<i64, VerificationError> {
        let major = to_major_units(minor, self.currency_scale);
        if major.fract() != Decimal::ZERO {
            return Err(VerificationError::Malformed(format!(
                "amount {major} is not a whole rial value"
            )));
        }
        i64::try_from(major).map_err(|_| VerificationError::Malformed(format!("amount {major} out of range")))
    }

    async fn post(&self, endpoint: &str, body: Value) -> Result<Value, VerificationError> {
        let resp = self
            .client
            .post(format!("{}/{}", self.api_base, endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| VerificationError::Unavailable(e.to_string()))?;

        if resp.status().is_server_error() {
            return Err(VerificationError::Unavailable(format!("zarinpal returned {}", resp.status())));
        }

        resp.json()
            .await
            .map_err(|e| VerificationError::Unavailable(format!("zarinpal response: {e}")))
    }

    /// `data.code` on success, `errors.code` otherwise.
    fn result_code(resp: &Value) -> Option<i64> {
        resp.pointer("/data/code")
            .and_then(Value::as_i64)
            .or_else(|| resp.pointer("/errors/code").and_then(Value::as_i64))
    }

    fn classify_verify(resp: &Value, amount: i64) -> Result<GatewayConfirmation, VerificationError> {
        match Self::result_code(resp) {
            Some(100) | Some(101) => {
                let ref_id = resp
                    .pointer("/data/ref_id")
                    .map(|r| match r {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .ok_or_else(|| VerificationError::Malformed("verify response without ref_id".into()))?;
                Ok(GatewayConfirmation {
                    gateway_ref: ref_id,
                    amount,
                })
            }
            Some(-50) => Err(VerificationError::Declined(FailureReason::AmountMismatch)),
            Some(-51) | Some(-54) => Err(VerificationError::Declined(FailureReason::PaymentNotCompleted)),
            Some(code) => Err(VerificationError::Unavailable(format!("zarinpal verify code {code}"))),
            None => Err(VerificationError::Unavailable(format!("unexpected verify response: {resp}"))),
        }
    }
}

#[async_trait]
impl PaymentGateway for ZarinPalGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::ZarinPal
    }

    async fn create_checkout(
        &self,
        intent: &PaymentIntent,
        callback_url: &str,
    ) -> Result<Checkout, VerificationError> {
        let resp = self
            .post(
                "request.json",
                json!({
                    "merchant_id": self.merchant_id,
                    "amount": self.gateway_amount(intent.amount)?,
                    "callback_url": callback_url,
                    "description": format!("Order {}", intent.id.simple()),
                }),
            )
            .await?;

        match (
            Self::result_code(&resp),
            resp.pointer("/data/authority").and_then(Value::as_str),
        ) {
            (Some(100), Some(authority)) => Ok(Checkout {
                redirect_url: format!("{}/{}", self.start_pay_base, authority),
                checkout_ref: authority.to_string(),
            }),
            (code, _) => {
                warn!(intent_id = %intent.id, ?code, "zarinpal refused payment request");
                Err(VerificationError::Malformed(format!("zarinpal request failed with code {code:?}")))
            }
        }
    }

    fn authenticate(&self, raw: &RawCallback) -> Result<CallbackNotice, VerificationError> {
        let query = raw
            .query
            .as_deref()
            .ok_or_else(|| VerificationError::Malformed("missing query string".into()))?;
        let params: CallbackQuery = serde_urlencoded::from_str(query)
            .map_err(|e| VerificationError::Malformed(format!("query: {e}")))?;
        let intent_id = Uuid::parse_str(&params.intent)
            .map_err(|_| VerificationError::Malformed("intent is not an id".into()))?;
        if params.authority.trim().is_empty() {
            return Err(VerificationError::Malformed("empty Authority".into()));
        }

        // NOK is still confirmed via verify; the redirect alone proves nothing.
        let verdict = match params.status.as_str() {
            "OK" => Verdict::Paid,
            _ => Verdict::Declined(FailureReason::PaymentNotCompleted),
        };

        Ok(CallbackNotice {
            intent_id,
            verdict,
            amount: None,
            reference: Some(params.authority),
        })
    }

    fn precheck(&self, notice: &CallbackNotice, intent: &PaymentIntent) -> Result<(), VerificationError> {
        if intent.checkout_ref.is_none() || notice.reference != intent.checkout_ref {
            return Err(VerificationError::Unauthenticated(format!(
                "authority does not match the checkout issued for intent {}",
                intent.id
            )));
        }
        Ok(())
    }

    async fn confirm(
        &self,
        notice: &CallbackNotice,
        intent: &PaymentIntent,
    ) -> Result<GatewayConfirmation, VerificationError> {
        let authority = notice
            .reference
            .as_deref()
            .ok_or_else(|| VerificationError::Malformed("missing Authority".into()))?;
        let resp = self
            .post(
                "verify.json",
                json!({
                    "merchant_id": self.merchant_id,
                    "amount": self.gateway_amount(intent.amount)?,
                    "authority": authority,
                }),
            )
            .await?;

        // verify is called with the stored amount; code 100 means the gateway
        // collected exactly that.
        Self::classify_verify(&resp, intent.amount)
    }
}
