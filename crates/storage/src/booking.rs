use anyhow::{Context, Result};
use dockside_core::{Boat, Booking, BookingStatus};
use sqlx::FromRow;
use thiserror::Error;

use crate::StoragePool;

/// Raised when a stored row cannot be represented as a domain value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CorruptRow {
    #[error("column {column} holds negative id {value}")]
    NegativeId { column: &'static str, value: i64 },
    #[error("unknown booking status '{0}'")]
    UnknownStatus(String),
    #[error("unknown security event type '{0}'")]
    UnknownEventType(String),
    #[error("unknown severity '{0}'")]
    UnknownSeverity(String),
    #[error("id {0} does not fit in a BIGINT column")]
    IdOutOfRange(u64),
}

#[derive(Debug, Clone, FromRow)]
struct BoatRow {
    boat_id: i64,
    owner_id: i64,
    name: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
struct BookingRow {
    booking_id: i64,
    customer_id: i64,
    boat_id: i64,
    status: String,
}

pub(crate) fn to_domain_id(column: &'static str, value: i64) -> Result<u64, CorruptRow> {
    u64::try_from(value).map_err(|_| CorruptRow::NegativeId { column, value })
}

pub(crate) fn to_column_id(value: u64) -> Result<i64, CorruptRow> {
    i64::try_from(value).map_err(|_| CorruptRow::IdOutOfRange(value))
}

impl TryFrom<BoatRow> for Boat {
    type Error = CorruptRow;

    fn try_from(row: BoatRow) -> Result<Self, Self::Error> {
        Ok(Boat {
            id: to_domain_id("boat_id", row.boat_id)?,
            owner_id: to_domain_id("owner_id", row.owner_id)?,
            name: row.name,
        })
    }
}

impl TryFrom<BookingRow> for Booking {
    type Error = CorruptRow;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<BookingStatus>()
            .map_err(|_| CorruptRow::UnknownStatus(row.status.clone()))?;
        Ok(Booking {
            id: to_domain_id("booking_id", row.booking_id)?,
            customer_id: to_domain_id("customer_id", row.customer_id)?,
            boat_id: to_domain_id("boat_id", row.boat_id)?,
            status,
        })
    }
}

/// Read access to bookings and boats, plus upserts used by seeding commands.
#[derive(Clone)]
pub struct BookingRepository {
    pool: StoragePool,
}

impl BookingRepository {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }

    pub async fn fetch_booking(&self, booking_id: u64) -> Result<Option<Booking>> {
        let row = sqlx::query_as::<_, BookingRow>(
            r#"
            SELECT booking_id, customer_id, boat_id, status
            FROM bookings
            WHERE booking_id = $1
            "#,
        )
        .bind(to_column_id(booking_id)?)
        .fetch_optional(self.pool.pool())
        .await
        .with_context(|| format!("querying booking {booking_id}"))?;

        row.map(Booking::try_from).transpose().map_err(Into::into)
    }

    pub async fn fetch_boat(&self, boat_id: u64) -> Result<Option<Boat>> {
        let row = sqlx::query_as::<_, BoatRow>(
            r#"
            SELECT boat_id, owner_id, name
            FROM boats
            WHERE boat_id = $1
            "#,
        )
        .bind(to_column_id(boat_id)?)
        .fetch_optional(self.pool.pool())
        .await
        .with_context(|| format!("querying boat {boat_id}"))?;

        row.map(Boat::try_from).transpose().map_err(Into::into)
    }

    pub async fn upsert_boat(&self, boat: &Boat) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO boats (boat_id, owner_id, name)
            VALUES ($1, $2, $3)
            ON CONFLICT (boat_id) DO UPDATE
            SET owner_id = EXCLUDED.owner_id,
                name = EXCLUDED.name
            "#,
        )
        .bind(to_column_id(boat.id)?)
        .bind(to_column_id(boat.owner_id)?)
        .bind(boat.name.as_deref())
        .execute(self.pool.pool())
        .await
        .with_context(|| format!("upserting boat {}", boat.id))?;
        Ok(())
    }

    pub async fn upsert_booking(&self, booking: &Booking) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bookings (booking_id, customer_id, boat_id, status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (booking_id) DO UPDATE
            SET customer_id = EXCLUDED.customer_id,
                boat_id = EXCLUDED.boat_id,
                status = EXCLUDED.status,
                updated_at = NOW()
            "#,
        )
        .bind(to_column_id(booking.id)?)
        .bind(to_column_id(booking.customer_id)?)
        .bind(to_column_id(booking.boat_id)?)
        .bind(booking.status.as_str())
        .execute(self.pool.pool())
        .await
        .with_context(|| format!("upserting booking {}", booking.id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{connect, migrate};
    use std::env;

    #[test]
    fn negative_ids_are_reported() {
        let row = BookingRow {
            booking_id: 1,
            customer_id: -5,
            boat_id: 7,
            status: "CONFIRMED".into(),
        };
        assert_eq!(
            Booking::try_from(row).unwrap_err(),
            CorruptRow::NegativeId {
                column: "customer_id",
                value: -5
            }
        );
    }

    #[test]
    fn unknown_status_is_reported() {
        let row = BookingRow {
            booking_id: 1,
            customer_id: 5,
            boat_id: 7,
            status: "ARCHIVED".into(),
        };
        assert_eq!(
            Booking::try_from(row).unwrap_err(),
            CorruptRow::UnknownStatus("ARCHIVED".into())
        );
    }

    #[test]
    fn oversized_ids_cannot_be_bound() {
        assert_eq!(
            to_column_id(u64::MAX).unwrap_err(),
            CorruptRow::IdOutOfRange(u64::MAX)
        );
        assert_eq!(to_column_id(42), Ok(42));
    }

    #[tokio::test]
    async fn round_trips_booking_when_database_available() -> anyhow::Result<()> {
        let database_url = match env::var("DOCKSIDE_TEST_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
        {
            Ok(url) => url,
            Err(_) => {
                eprintln!(
                    "skipping booking repository test: set DOCKSIDE_TEST_DATABASE_URL or DATABASE_URL"
                );
                return Ok(());
            }
        };

        let pool = connect(&database_url).await?;
        migrate(&pool).await?;
        let repo = BookingRepository::new(pool.clone());

        let boat = Boat {
            id: 9_000_007,
            owner_id: 9,
            name: Some("Sea Breeze".into()),
        };
        let booking = Booking {
            id: 9_000_042,
            customer_id: 5,
            boat_id: boat.id,
            status: BookingStatus::Confirmed,
        };
        repo.upsert_boat(&boat).await?;
        repo.upsert_booking(&booking).await?;

        assert_eq!(repo.fetch_boat(boat.id).await?, Some(boat.clone()));
        assert_eq!(repo.fetch_booking(booking.id).await?, Some(booking.clone()));
        assert_eq!(repo.fetch_boat(9_000_999).await?, None);

        sqlx::query("DELETE FROM bookings WHERE booking_id = $1")
            .bind(9_000_042_i64)
            .execute(pool.pool())
            .await?;
        sqlx::query("DELETE FROM boats WHERE boat_id = $1")
            .bind(9_000_007_i64)
            .execute(pool.pool())
            .await?;
        Ok(())
    }
}
