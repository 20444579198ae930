use std::fmt;

use serde::{Serialize, Serializer};

use crate::{
    booking::{Booking, BookingStatus},
    conversation::{self, ConversationId},
};

/// Why a user was refused access to a booking conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDenial {
    NotBookingOwner,
    BookingStatus(BookingStatus),
    InvalidConversationId,
    NotParticipant,
}

impl AccessDenial {
    pub fn code(&self) -> &'static str {
        match self {
            AccessDenial::NotBookingOwner => "not_booking_owner",
            AccessDenial::BookingStatus(_) => "booking_status",
            AccessDenial::InvalidConversationId => "invalid_conversation_id",
            AccessDenial::NotParticipant => "not_participant",
        }
    }
}

impl fmt::Display for AccessDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessDenial::NotBookingOwner => f.write_str("user is not the booking owner"),
            AccessDenial::BookingStatus(status) => {
                let state = match status {
                    BookingStatus::Cancelled => "has been cancelled",
                    BookingStatus::Rejected => "was rejected",
                    BookingStatus::NoShow => "was marked as a no-show",
                    other => return write!(f, "booking status {other} does not allow messaging"),
                };
                write!(f, "booking {state}; messaging is closed")
            }
            AccessDenial::InvalidConversationId => f.write_str("invalid conversation id format"),
            AccessDenial::NotParticipant => {
                f.write_str("user is not a participant in this conversation")
            }
        }
    }
}

impl Serialize for AccessDenial {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnershipCheck {
    pub is_owner: bool,
    pub is_captain: bool,
    pub is_customer: bool,
    pub has_access: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<AccessDenial>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationAccess {
    pub has_access: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<AccessDenial>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ConversationId>,
}

impl ConversationAccess {
    pub(crate) fn denied(reason: AccessDenial) -> Self {
        Self {
            has_access: false,
            reason: Some(reason),
            metadata: None,
        }
    }
}

/// Decides whether `user_id` owns `booking` as its customer or captain and
/// whether the booking's status still allows messaging.
///
/// `captain_id` is never inferred here; callers resolve it through
/// [`crate::booking::resolve_captain_id`]. Without it the user can only match
/// as the customer.
pub fn validate_booking_ownership(
    booking: &Booking,
    user_id: u64,
    captain_id: Option<u64>,
) -> OwnershipCheck {
    let is_customer = user_id == booking.customer_id;
    let is_captain = captain_id == Some(user_id);
    let is_owner = is_customer || is_captain;

    let reason = if !is_owner {
        Some(AccessDenial::NotBookingOwner)
    } else if !booking.status.allows_messaging() {
        Some(AccessDenial::BookingStatus(booking.status))
    } else {
        None
    };

    OwnershipCheck {
        is_owner,
        is_captain,
        is_customer,
        has_access: reason.is_none(),
        reason,
    }
}

/// Checks that `user_id` is a party to `conversation_id` and that the
/// ownership check for the underlying booking granted access. Both must hold.
pub fn validate_conversation_access(
    conversation_id: &str,
    user_id: u64,
    ownership: &OwnershipCheck,
) -> ConversationAccess {
    let Some(id) = conversation::decode(conversation_id) else {
        return ConversationAccess::denied(AccessDenial::InvalidConversationId);
    };

    if !id.is_participant(user_id) {
        return ConversationAccess::denied(AccessDenial::NotParticipant);
    }

    if !ownership.has_access {
        return ConversationAccess::denied(
            ownership.reason.unwrap_or(AccessDenial::NotBookingOwner),
        );
    }

    ConversationAccess {
        has_access: true,
        reason: None,
        metadata: Some(id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(status: BookingStatus) -> Booking {
        Booking {
            id: 42,
            customer_id: 5,
            boat_id: 7,
            status,
        }
    }

    #[test]
    fn customer_of_confirmed_booking_has_access() {
        let check = validate_booking_ownership(&booking(BookingStatus::Confirmed), 5, None);
        assert!(check.has_access);
        assert!(check.is_customer);
        assert!(!check.is_captain);
        assert_eq!(check.reason, None);
    }

    #[test]
    fn stranger_is_denied() {
        let check = validate_booking_ownership(&booking(BookingStatus::Confirmed), 99, Some(9));
        assert!(!check.has_access);
        assert!(!check.is_owner);
        assert_eq!(check.reason, Some(AccessDenial::NotBookingOwner));
        assert_eq!(
            check.reason.unwrap().to_string(),
            "user is not the booking owner"
        );
    }

    #[test]
    fn captain_needs_resolved_id() {
        let booking = booking(BookingStatus::Pending);
        assert!(validate_booking_ownership(&booking, 9, Some(9)).is_captain);
        assert!(validate_booking_ownership(&booking, 9, Some(9)).has_access);
        assert!(!validate_booking_ownership(&booking, 9, None).is_captain);
    }

    #[test]
    fn closed_statuses_deny_even_owners() {
        for status in [
            BookingStatus::Cancelled,
            BookingStatus::Rejected,
            BookingStatus::NoShow,
        ] {
            let check = validate_booking_ownership(&booking(status), 5, None);
            assert!(check.is_owner);
            assert!(!check.has_access);
            assert_eq!(check.reason, Some(AccessDenial::BookingStatus(status)));
        }

        let reason = AccessDenial::BookingStatus(BookingStatus::Cancelled);
        assert_eq!(reason.to_string(), "booking has been cancelled; messaging is closed");
    }

    #[test]
    fn conversation_access_returns_metadata() {
        let ownership = validate_booking_ownership(&booking(BookingStatus::Confirmed), 5, Some(9));
        let access = validate_conversation_access("booking_42_5_9", 5, &ownership);

        assert!(access.has_access);
        assert_eq!(access.metadata, Some(ConversationId::new(42, 5, 9)));
    }

    #[test]
    fn malformed_conversation_is_denied() {
        let ownership = validate_booking_ownership(&booking(BookingStatus::Confirmed), 5, Some(9));
        let access = validate_conversation_access("booking_42_5", 5, &ownership);

        assert!(!access.has_access);
        assert_eq!(access.reason, Some(AccessDenial::InvalidConversationId));
        assert_eq!(access.metadata, None);
    }

    #[test]
    fn participant_of_cancelled_booking_is_denied() {
        let ownership = validate_booking_ownership(&booking(BookingStatus::Cancelled), 5, Some(9));
        let access = validate_conversation_access("booking_42_5_9", 5, &ownership);

        assert!(!access.has_access);
        assert_eq!(
            access.reason,
            Some(AccessDenial::BookingStatus(BookingStatus::Cancelled))
        );
    }

    #[test]
    fn non_participant_is_denied_despite_ownership() {
        let ownership = validate_booking_ownership(&booking(BookingStatus::Confirmed), 5, Some(9));
        let access = validate_conversation_access("booking_42_6_9", 5, &ownership);

        assert_eq!(access.reason, Some(AccessDenial::NotParticipant));
    }

    #[test]
    fn denial_serializes_as_message() {
        let value = serde_json::to_value(AccessDenial::InvalidConversationId).unwrap();
        assert_eq!(value, serde_json::json!("invalid conversation id format"));
    }
}
