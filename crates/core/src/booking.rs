use std::{fmt, str::FromStr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle states a booking can be in. Transitions are owned by the
/// booking service; this crate only reads the current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    Rejected,
    NoShow,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 6] = [
        BookingStatus::Pending,
        BookingStatus::Confirmed,
        BookingStatus::Completed,
        BookingStatus::Cancelled,
        BookingStatus::Rejected,
        BookingStatus::NoShow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Completed => "COMPLETED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::Rejected => "REJECTED",
            BookingStatus::NoShow => "NO_SHOW",
        }
    }

    /// Whether participants may exchange messages while the booking is in
    /// this state.
    pub fn allows_messaging(&self) -> bool {
        matches!(
            self,
            BookingStatus::Pending | BookingStatus::Confirmed | BookingStatus::Completed
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        BookingStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| format!("unsupported booking status '{s}'"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: u64,
    pub customer_id: u64,
    pub boat_id: u64,
    pub status: BookingStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Boat {
    pub id: u64,
    pub owner_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("boat {0} not found")]
    BoatNotFound(u64),
    #[error("booking {0} not found")]
    BookingNotFound(u64),
    #[error("lookup backend unavailable: {0}")]
    Unavailable(#[from] anyhow::Error),
}

/// Resolves boats for captain identity checks.
///
/// Implementations must return [`LookupError::BoatNotFound`] instead of a
/// placeholder boat when the id is unknown.
#[async_trait]
pub trait BoatLookup: Send + Sync {
    async fn boat_by_id(&self, boat_id: u64) -> Result<Boat, LookupError>;
}

/// Returns the owner of the boat attached to `booking`.
pub async fn resolve_captain_id(
    lookup: &dyn BoatLookup,
    booking: &Booking,
) -> Result<u64, LookupError> {
    let boat = lookup.boat_by_id(booking.boat_id).await?;
    Ok(boat.owner_id)
}
