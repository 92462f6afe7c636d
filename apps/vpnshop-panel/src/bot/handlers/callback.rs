use crate::AppState;
use crate::bot::keyboards;
use crate::services::notification_service::Outcome;
use crate::services::orchestrator::{OrchestratorError, Settlement};
use teloxide::prelude::*;
use teloxide::types::{CallbackQuery, InlineKeyboardMarkup};
use tracing::{error, info, warn};
use url::Url;
use vpnshop_db::models::payment::PaymentIntent;
use vpnshop_db::store::StoreError;
use vpnshop_shared::callback::CallbackAction;

/// What the bot sends back for a button press.
#[derive(Debug, Clone)]
pub struct Reply {
    pub text: String,
    pub markup: Option<InlineKeyboardMarkup>,
}

impl Reply {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            markup: None,
        }
    }
}

pub async fn callback_handler(
    bot: Bot,
    q: CallbackQuery,
    state: AppState,
) -> Result<(), teloxide::RequestError> {
    let tg_id = q.from.id.0 as i64;
    let _ = bot.answer_callback_query(q.id.clone()).await;

    let Some(data) = q.data else {
        return Ok(());
    };
    info!(user_id = tg_id, "Received callback: {}", data);

    let reply = resolve(&state, tg_id, &data).await;
    let mut request = bot.send_message(ChatId(tg_id), reply.text);
    if let Some(markup) = reply.markup {
        request = request.reply_markup(markup);
    }
    if let Err(e) = request.await {
        error!(user_id = tg_id, "Failed to answer callback: {}", e);
    }
    Ok(())
}

fn short_ref(intent: &PaymentIntent) -> String {
    intent.id.simple().to_string()[..8].to_string()
}

fn describe(settled: &Settlement, intent: &PaymentIntent) -> Reply {
    if settled.state.is_terminal() {
        let mut outcome = Outcome::from_intent(intent);
        outcome.state = settled.state;
        outcome.reason = settled.reason;
        return Reply::text(outcome.message());
    }
    Reply {
        text: format!("⏳ Payment #{} is {}.", short_ref(intent), settled.state),
        markup: Some(keyboards::status_only(intent.id)),
    }
}

fn failure(intent: &PaymentIntent, err: OrchestratorError) -> Reply {
    match err {
        OrchestratorError::InsufficientFunds { balance, required } => Reply::text(format!(
            "💸 Not enough balance for #{}: you have {balance}, it costs {required}.",
            short_ref(intent)
        )),
        OrchestratorError::WrongState { state, .. } => {
            Reply::text(format!("ℹ️ Payment #{} is already {state}.", short_ref(intent)))
        }
        other => {
            error!(intent_id = %intent.id, "Callback action failed: {}", other);
            Reply::text("⚠️ Something went wrong. Please try again in a minute.")
        }
    }
}

/// Runs a button press for `tg_id` and returns the reply to send.
pub async fn resolve(state: &AppState, tg_id: i64, data: &str) -> Reply {
    let action = match data.parse::<CallbackAction>() {
        Ok(action) => action,
        Err(e) => {
            warn!(user_id = tg_id, "Ignoring callback: {}", e);
            return Reply::text("⚠️ This button is no longer valid.");
        }
    };

    let intent = match state.orchestrator.payments().get(action.intent_id()).await {
        Ok(intent) if intent.user_id == tg_id => intent,
        Ok(intent) => {
            warn!(intent_id = %intent.id, user_id = tg_id, "Callback for another user's intent");
            return Reply::text("⚠️ This payment does not belong to you.");
        }
        Err(StoreError::NotFound { .. }) => return Reply::text("⚠️ This payment no longer exists."),
        Err(e) => {
            error!(user_id = tg_id, "Failed to load intent: {}", e);
            return Reply::text("⚠️ Something went wrong. Please try again in a minute.");
        }
    };

    let orchestrator = &state.orchestrator;
    match action {
        CallbackAction::PayWallet(id) => match orchestrator.pay_with_wallet(id).await {
            Ok(settled) => describe(&settled, &intent),
            Err(e) => failure(&intent, e),
        },
        CallbackAction::PayGateway(kind, id) => {
            if kind != intent.gateway {
                return Reply::text(format!(
                    "⚠️ Payment #{} must be paid with {}.",
                    short_ref(&intent),
                    intent.gateway
                ));
            }
            match orchestrator.begin_checkout(id).await {
                Ok(started) => match Url::parse(&started.redirect_url) {
                    Ok(url) => Reply {
                        text: format!(
                            "🧾 Payment #{} for {} is ready. Open the page below to pay.",
                            short_ref(&intent),
                            intent.amount
                        ),
                        markup: Some(keyboards::checkout(url, id)),
                    },
                    Err(e) => {
                        error!(intent_id = %id, "Gateway returned an invalid checkout URL: {}", e);
                        Reply::text("⚠️ The payment page is unavailable right now.")
                    }
                },
                Err(e) => failure(&intent, e),
            }
        }
        CallbackAction::CheckStatus(id) => match orchestrator.status(id).await {
            Ok(settled) if settled.state == vpnshop_shared::types::IntentState::Created => Reply {
                text: format!("🧾 Payment #{} is waiting for you.", short_ref(&intent)),
                markup: Some(keyboards::payment_options(id, intent.gateway)),
            },
            Ok(settled) => describe(&settled, &intent),
            Err(e) => failure(&intent, e),
        },
        CallbackAction::Cancel(id) => match orchestrator.cancel(id).await {
            Ok(settled) => describe(&settled, &intent),
            Err(e) => failure(&intent, e),
        },
    }
}
