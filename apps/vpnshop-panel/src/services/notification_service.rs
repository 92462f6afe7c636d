use teloxide::prelude::*;
use tracing::{info, warn};
use uuid::Uuid;
use vpnshop_db::models::payment::PaymentIntent;
use vpnshop_shared::types::{FailureReason, IntentState, PaymentPurpose};

/// Terminal result of an intent, as told to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub intent_id: Uuid,
    pub purpose: PaymentPurpose,
    pub amount: i64,
    pub state: IntentState,
    pub reason: Option<FailureReason>,
}

impl Outcome {
    pub fn from_intent(intent: &PaymentIntent) -> Self {
        Self {
            intent_id: intent.id,
            purpose: intent.purpose,
            amount: intent.amount,
            state: intent.state,
            reason: intent.failure_reason,
        }
    }

    pub fn message(&self) -> String {
        let reference = self.intent_id.simple().to_string();
        let short = &reference[..8];
        match (self.state, self.reason) {
            (IntentState::Finalized, _) => match self.purpose {
                PaymentPurpose::WalletTopUp => {
                    format!("✅ Your wallet was topped up by {}. (#{short})", self.amount)
                }
                PaymentPurpose::NewService => {
                    format!("✅ Payment received, your subscription is active. (#{short})")
                }
                PaymentPurpose::UpgradeService => {
                    format!("✅ Payment received, your subscription was updated. (#{short})")
                }
            },
            (_, Some(reason)) => {
                let detail = match reason {
                    FailureReason::AmountMismatch => "the paid amount did not match the order",
                    FailureReason::PaymentNotCompleted => "the payment was not completed",
                    FailureReason::InsufficientFunds => "your wallet balance is too low",
                    FailureReason::ProvisioningRejected | FailureReason::ProvisioningExhausted => {
                        "we could not activate the service"
                    }
                    FailureReason::DuplicateReference => "this payment was already used",
                    FailureReason::Cancelled => "it was cancelled",
                };
                let refund = if reason.implies_refund() {
                    " The amount was returned to your wallet."
                } else {
                    ""
                };
                format!("❌ Payment #{short} failed: {detail}.{refund} [{}]", reason.code())
            }
            (state, None) => format!("Payment #{short} is {state}."),
        }
    }
}

/// Fire-and-forget delivery of outcomes. Implementations must not block the caller.
pub trait Notifier: Send + Sync {
    fn notify(&self, user_id: i64, outcome: &Outcome);
}

/// Sends outcomes to the user's Telegram chat. `user_id` is the Telegram user id.
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

impl Notifier for TelegramNotifier {
    fn notify(&self, user_id: i64, outcome: &Outcome) {
        let bot = self.bot.clone();
        let text = outcome.message();
        let intent_id = outcome.intent_id;
        tokio::spawn(async move {
            if let Err(e) = bot.send_message(ChatId(user_id), text).await {
                warn!(%intent_id, user_id, "Failed to notify user: {}", e);
            }
        });
    }
}

/// Used when no bot token is configured.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, user_id: i64, outcome: &Outcome) {
        info!(
            intent_id = %outcome.intent_id,
            user_id,
            state = %outcome.state,
            reason = outcome.reason.map(|r| r.code()),
            "notification: {}",
            outcome.message()
        );
    }
}
