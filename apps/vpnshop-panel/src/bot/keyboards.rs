use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};
use url::Url;
use uuid::Uuid;
use vpnshop_shared::callback::CallbackAction;
use vpnshop_shared::types::GatewayKind;

fn gateway_label(kind: GatewayKind) -> &'static str {
    match kind {
        GatewayKind::ZarinPal => "💳 Pay with ZarinPal",
        GatewayKind::Cryptomus => "🪙 Pay with crypto",
        GatewayKind::Wallet => "👛 Pay from wallet",
    }
}

/// Buttons for an intent that has not been paid yet.
pub fn payment_options(intent_id: Uuid, gateway: GatewayKind) -> InlineKeyboardMarkup {
    let pay = match gateway {
        GatewayKind::Wallet => CallbackAction::PayWallet(intent_id),
        external => CallbackAction::PayGateway(external, intent_id),
    };
    InlineKeyboardMarkup::new(vec![
        vec![InlineKeyboardButton::callback(gateway_label(gateway), pay.to_string())],
        vec![
            InlineKeyboardButton::callback("🔄 Status", CallbackAction::CheckStatus(intent_id).to_string()),
            InlineKeyboardButton::callback("❌ Cancel", CallbackAction::Cancel(intent_id).to_string()),
        ],
    ])
}

pub fn checkout(redirect: Url, intent_id: Uuid) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![InlineKeyboardButton::url("➡️ Open payment page", redirect)],
        vec![InlineKeyboardButton::callback(
            "🔄 I have paid",
            CallbackAction::CheckStatus(intent_id).to_string(),
        )],
    ])
}

pub fn status_only(intent_id: Uuid) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
        "🔄 Status",
        CallbackAction::CheckStatus(intent_id).to_string(),
    )]])
}
