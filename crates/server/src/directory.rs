use std::collections::HashMap;

use anyhow::anyhow;
use async_trait::async_trait;
use dockside_core::{Boat, BoatLookup, Booking, LookupError};
use dockside_storage::{BookingRepository, StoragePool};

use crate::config::DirectoryFixtures;

/// Source of bookings and boats for the gateway. Every directory also acts
/// as the boat lookup used for captain resolution.
#[async_trait]
pub trait BookingDirectory: BoatLookup {
    async fn booking_by_id(&self, booking_id: u64) -> Result<Booking, LookupError>;
}

/// Fixed set of boats and bookings loaded from configuration. Later entries
/// with a repeated id replace earlier ones.
#[derive(Default)]
pub struct InMemoryDirectory {
    boats: HashMap<u64, Boat>,
    bookings: HashMap<u64, Booking>,
}

impl InMemoryDirectory {
    pub fn from_fixtures(fixtures: &DirectoryFixtures) -> Self {
        Self {
            boats: fixtures
                .boats
                .iter()
                .map(|boat| (boat.id, boat.clone()))
                .collect(),
            bookings: fixtures
                .bookings
                .iter()
                .map(|booking| (booking.id, booking.clone()))
                .collect(),
        }
    }

    pub fn boat_count(&self) -> usize {
        self.boats.len()
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }
}

#[async_trait]
impl BoatLookup for InMemoryDirectory {
    async fn boat_by_id(&self, boat_id: u64) -> Result<Boat, LookupError> {
        self.boats
            .get(&boat_id)
            .cloned()
            .ok_or(LookupError::BoatNotFound(boat_id))
    }
}

#[async_trait]
impl BookingDirectory for InMemoryDirectory {
    async fn booking_by_id(&self, booking_id: u64) -> Result<Booking, LookupError> {
        self.bookings
            .get(&booking_id)
            .cloned()
            .ok_or(LookupError::BookingNotFound(booking_id))
    }
}

/// Stands in for the database when one is configured but could not be
/// reached at startup. Every lookup fails as unavailable.
pub struct UnavailableDirectory {
    reason: String,
}

impl UnavailableDirectory {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn error(&self) -> LookupError {
        LookupError::Unavailable(anyhow!("booking database unavailable: {}", self.reason))
    }
}

#[async_trait]
impl BoatLookup for UnavailableDirectory {
    async fn boat_by_id(&self, _boat_id: u64) -> Result<Boat, LookupError> {
        Err(self.error())
    }
}

#[async_trait]
impl BookingDirectory for UnavailableDirectory {
    async fn booking_by_id(&self, _booking_id: u64) -> Result<Booking, LookupError> {
        Err(self.error())
    }
}

pub struct PostgresDirectory {
    repository: BookingRepository,
}

impl PostgresDirectory {
    pub fn new(pool: StoragePool) -> Self {
        Self {
            repository: BookingRepository::new(pool),
        }
    }
}

#[async_trait]
impl BoatLookup for PostgresDirectory {
    async fn boat_by_id(&self, boat_id: u64) -> Result<Boat, LookupError> {
        self.repository
            .fetch_boat(boat_id)
            .await?
            .ok_or(LookupError::BoatNotFound(boat_id))
    }
}

#[async_trait]
impl BookingDirectory for PostgresDirectory {
    async fn booking_by_id(&self, booking_id: u64) -> Result<Booking, LookupError> {
        self.repository
            .fetch_booking(booking_id)
            .await?
            .ok_or(LookupError::BookingNotFound(booking_id))
    }
}
