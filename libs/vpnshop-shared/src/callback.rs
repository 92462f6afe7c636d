//! Button payloads exchanged with the chat front-end.
//!
//! Every payload the bot can receive is one variant of [`CallbackAction`]; the
//! text form fits Telegram's 64-byte `callback_data` limit.

use crate::types::GatewayKind;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    /// Charge the intent against the user's wallet balance.
    PayWallet(Uuid),
    /// Start checkout on an external gateway.
    PayGateway(GatewayKind, Uuid),
    CheckStatus(Uuid),
    Cancel(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallbackParseError {
    #[error("unknown callback prefix: {0}")]
    UnknownPrefix(String),
    #[error("malformed callback payload: {0}")]
    Malformed(String),
}

impl CallbackAction {
    pub fn intent_id(&self) -> Uuid {
        match self {
            CallbackAction::PayWallet(id)
            | CallbackAction::PayGateway(_, id)
            | CallbackAction::CheckStatus(id)
            | CallbackAction::Cancel(id) => *id,
        }
    }
}

impl fmt::Display for CallbackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackAction::PayWallet(id) => write!(f, "pw:{}", id.simple()),
            CallbackAction::PayGateway(kind, id) => write!(f, "pg:{}:{}", kind, id.simple()),
            CallbackAction::CheckStatus(id) => write!(f, "st:{}", id.simple()),
            CallbackAction::Cancel(id) => write!(f, "cx:{}", id.simple()),
        }
    }
}

impl FromStr for CallbackAction {
    type Err = CallbackParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || CallbackParseError::Malformed(s.to_string());
        let parse_id = |raw: &str| Uuid::parse_str(raw).map_err(|_| malformed());

        let (prefix, rest) = s.split_once(':').ok_or_else(malformed)?;
        match prefix {
            "pw" => Ok(CallbackAction::PayWallet(parse_id(rest)?)),
            "pg" => {
                let (kind, id) = rest.split_once(':').ok_or_else(malformed)?;
                let kind: GatewayKind = kind.parse().map_err(|_| malformed())?;
                if !kind.is_external() {
                    return Err(malformed());
                }
                Ok(CallbackAction::PayGateway(kind, parse_id(id)?))
            }
            "st" => Ok(CallbackAction::CheckStatus(parse_id(rest)?)),
            "cx" => Ok(CallbackAction::Cancel(parse_id(rest)?)),
            other => Err(CallbackParseError::UnknownPrefix(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_action_fits_telegram_limit_and_parses_back() {
        let id = Uuid::new_v4();
        let actions = [
            CallbackAction::PayWallet(id),
            CallbackAction::PayGateway(GatewayKind::Cryptomus, id),
            CallbackAction::PayGateway(GatewayKind::ZarinPal, id),
            CallbackAction::CheckStatus(id),
            CallbackAction::Cancel(id),
        ];
        for action in actions {
            let text = action.to_string();
            assert!(text.len() <= 64, "{text} is too long");
            assert_eq!(text.parse::<CallbackAction>().unwrap(), action);
            assert_eq!(action.intent_id(), id);
        }
    }

    #[test]
    fn rejects_unknown_and_malformed_payloads() {
        assert_eq!(
            "buy_plan_3".parse::<CallbackAction>(),
            Err(CallbackParseError::Malformed("buy_plan_3".into()))
        );
        assert!(matches!(
            "zz:abc".parse::<CallbackAction>(),
            Err(CallbackParseError::UnknownPrefix(p)) if p == "zz"
        ));
        assert!("pw:not-a-uuid".parse::<CallbackAction>().is_err());
        let id = Uuid::new_v4().simple().to_string();
        assert!(format!("pg:wallet:{id}").parse::<CallbackAction>().is_err());
        assert!(format!("pg:paypal:{id}").parse::<CallbackAction>().is_err());
    }
}
