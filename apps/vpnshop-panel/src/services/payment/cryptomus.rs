use crate::services::payment::{
    CallbackNotice, Checkout, GatewayConfirmation, PaymentGateway, RawCallback, Verdict,
    VerificationError, to_major_units, to_minor_units,
};
use async_trait::async_trait;
use base64::Engine;
use serde_json::{Value, json};
use uuid::Uuid;
use vpnshop_db::models::payment::PaymentIntent;
use vpnshop_shared::types::{FailureReason, GatewayKind};

const API_URL: &str = "https://api.cryptomus.com/v1/payment";

pub struct CryptomusGateway {
    client: reqwest::Client,
    merchant_id: String,
    payment_key: String,
    currency: String,
    currency_scale: u32,
}

impl CryptomusGateway {
    pub fn new(
        client: reqwest::Client,
        merchant_id: String,
        payment_key: String,
        currency: String,
        currency_scale: u32,
    ) -> Self {
        Self {
            client,
            merchant_id,
            payment_key,
            currency,
            currency_scale,
        }
    }

    fn generate_signature(&self, body: &str) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(body);
        let to_hash = format!("{}{}", encoded, self.payment_key);
        format!("{:x}", md5::compute(to_hash.as_bytes()))
    }

    /// Webhooks carry `sign` inside the body, computed over the body without it
    /// in PHP `json_encode` form (slashes escaped).
    fn body_signature_matches(&self, body: &Value) -> Result<bool, VerificationError> {
        let mut fields = body
            .as_object()
            .cloned()
            .ok_or_else(|| VerificationError::Malformed("body is not an object".into()))?;
        let sign = match fields.shift_remove("sign") {
            Some(Value::String(sign)) => sign,
            _ => return Err(VerificationError::Unauthenticated("missing sign".into())),
        };
        let canonical = serde_json::to_string(&Value::Object(fields))
            .map_err(|e| VerificationError::Malformed(e.to_string()))?
            .replace('/', "\\/");
        Ok(self.generate_signature(&canonical) == sign)
    }

    fn verdict(status: &str) -> Verdict {
        match status {
            "paid" | "paid_over" => Verdict::Paid,
            "wrong_amount" => Verdict::Declined(FailureReason::AmountMismatch),
            "fail" | "cancel" | "system_fail" => Verdict::Declined(FailureReason::PaymentNotCompleted),
            _ => Verdict::InProgress,
        }
    }
}

fn string_field<'a>(body: &'a Value, field: &str) -> Result<&'a str, VerificationError> {
    body.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| VerificationError::Malformed(format!("missing {field}")))
}

#[async_trait]
impl PaymentGateway for CryptomusGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Cryptomus
    }

    async fn create_checkout(
        &self,
        intent: &PaymentIntent,
        callback_url: &str,
    ) -> Result<Checkout, VerificationError> {
        let body_json = json!({
            "amount": to_major_units(intent.amount, self.currency_scale).to_string(),
            "currency": self.currency,
            "order_id": intent.id.simple().to_string(),
            "url_callback": callback_url,
        });
        let body_str = serde_json::to_string(&body_json)
            .map_err(|e| VerificationError::Malformed(e.to_string()))?;
        let sign = self.generate_signature(&body_str);

        let resp = self
            .client
            .post(API_URL)
            .header("merchant", &self.merchant_id)
            .header("sign", sign)
            .header("Content-Type", "application/json")
            .body(body_str)
            .send()
            .await
            .map_err(|e| VerificationError::Unavailable(e.to_string()))?;

        if resp.status().is_server_error() {
            return Err(VerificationError::Unavailable(format!("cryptomus returned {}", resp.status())));
        }

        let resp_json: Value = resp
            .json()
            .await
            .map_err(|e| VerificationError::Unavailable(e.to_string()))?;

        let result = resp_json.get("result");
        let url = result.and_then(|r| r.get("url")).and_then(Value::as_str);
        let uuid = result.and_then(|r| r.get("uuid")).and_then(Value::as_str);
        match (url, uuid) {
            (Some(url), Some(uuid)) => Ok(Checkout {
                redirect_url: url.to_string(),
                checkout_ref: uuid.to_string(),
            }),
            _ => Err(VerificationError::Malformed(format!("cryptomus invoice response: {resp_json}"))),
        }
    }

    fn authenticate(&self, raw: &RawCallback) -> Result<CallbackNotice, VerificationError> {
        let body: Value = serde_json::from_str(&raw.body)
            .map_err(|e| VerificationError::Malformed(format!("body: {e}")))?;

        let authentic = match raw.header("sign") {
            Some(sig) => sig == self.generate_signature(&raw.body),
            None => self.body_signature_matches(&body)?,
        };
        if !authentic {
            return Err(VerificationError::Unauthenticated("signature mismatch".into()));
        }

        let intent_id = Uuid::parse_str(string_field(&body, "order_id")?)
            .map_err(|_| VerificationError::Malformed("order_id is not an intent id".into()))?;
        let verdict = Self::verdict(string_field(&body, "status")?);
        let amount = body
            .get("amount")
            .and_then(Value::as_str)
            .map(|a| to_minor_units(a, self.currency_scale))
            .transpose()?;
        let reference = body.get("uuid").and_then(Value::as_str).map(str::to_string);

        Ok(CallbackNotice {
            intent_id,
            verdict,
            amount,
            reference,
        })
    }

    fn precheck(&self, notice: &CallbackNotice, intent: &PaymentIntent) -> Result<(), VerificationError> {
        match (&intent.checkout_ref, &notice.reference) {
            (Some(expected), Some(got)) if expected != got => Err(VerificationError::Malformed(
                format!("invoice {got} does not belong to intent {}", intent.id),
            )),
            _ => Ok(()),
        }
    }

    /// Signed webhooks are authoritative; no remote call is needed.
    async fn confirm(
        &self,
        notice: &CallbackNotice,
        _intent: &PaymentIntent,
    ) -> Result<GatewayConfirmation, VerificationError> {
        match notice.verdict {
            Verdict::Paid => match (&notice.reference, notice.amount) {
                (Some(reference), Some(amount)) => Ok(GatewayConfirmation {
                    gateway_ref: reference.clone(),
                    amount,
                }),
                _ => Err(VerificationError::Malformed("paid callback without uuid or amount".into())),
            },
            Verdict::Declined(reason) => Err(VerificationError::Declined(reason)),
            Verdict::InProgress => Err(VerificationError::Malformed("payment is not final".into())),
        }
    }
}
