//! Deterministic identifiers for booking-scoped conversations.
//!
//! A conversation id is a pure function of the booking, customer and captain
//! ids and is never persisted. Only the exact `booking_{b}_{c}_{k}` shape is
//! accepted when decoding.

use std::{fmt, str::FromStr};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const PREFIX: &str = "booking";

static CONVERSATION_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^booking_([0-9]+)_([0-9]+)_([0-9]+)$").expect("conversation id pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId {
    pub booking_id: u64,
    pub customer_id: u64,
    pub captain_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("'{0}' is not a booking conversation id")]
pub struct InvalidConversationId(pub String);

impl ConversationId {
    pub fn new(booking_id: u64, customer_id: u64, captain_id: u64) -> Self {
        Self {
            booking_id,
            customer_id,
            captain_id,
        }
    }

    /// Whether `user_id` is one of the two parties embedded in the id.
    pub fn is_participant(&self, user_id: u64) -> bool {
        user_id == self.customer_id || user_id == self.captain_id
    }
}

/// Builds the string form of a conversation id.
pub fn encode(booking_id: u64, customer_id: u64, captain_id: u64) -> String {
    format!("{PREFIX}_{booking_id}_{customer_id}_{captain_id}")
}

/// Parses a conversation id, returning `None` for anything that is not
/// exactly a booking conversation.
pub fn decode(raw: &str) -> Option<ConversationId> {
    let captures = CONVERSATION_ID.captures(raw)?;
    let field = |index: usize| captures.get(index)?.as_str().parse::<u64>().ok();
    Some(ConversationId {
        booking_id: field(1)?,
        customer_id: field(2)?,
        captain_id: field(3)?,
    })
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode(self.booking_id, self.customer_id, self.captain_id))
    }
}

impl FromStr for ConversationId {
    type Err = InvalidConversationId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode(s).ok_or_else(|| InvalidConversationId(s.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn decode_inverts_encode(b in any::<u64>(), c in any::<u64>(), k in any::<u64>()) {
            let decoded = decode(&encode(b, c, k));
            prop_assert_eq!(decoded, Some(ConversationId::new(b, c, k)));
        }
    }

    #[test]
    fn rejects_malformed_ids() {
        for raw in [
            "booking_1_2",
            "abc",
            "booking_-1_2_3",
            "booking_1_2_3_4",
            " booking_1_2_3",
            "booking_1_2_3\n",
            "Booking_1_2_3",
            "booking_1_2_x",
            "booking_١_2_3",
            "",
        ] {
            assert_eq!(decode(raw), None, "{raw:?} should not decode");
        }
    }

    #[test]
    fn overflowing_component_is_rejected() {
        let raw = format!("booking_{}0_1_2", u64::MAX);
        assert_eq!(decode(&raw), None);
    }

    #[test]
    fn display_and_from_str_agree() {
        let id: ConversationId = "booking_42_5_9".parse().unwrap();
        assert_eq!(id, ConversationId::new(42, 5, 9));
        assert_eq!(id.to_string(), "booking_42_5_9");
        assert!(id.is_participant(5));
        assert!(id.is_participant(9));
        assert!(!id.is_participant(42));

        let err = "nope".parse::<ConversationId>().unwrap_err();
        assert_eq!(err, InvalidConversationId("nope".into()));
    }
}
