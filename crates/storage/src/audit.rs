use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dockside_core::{SecurityEvent, SecurityEventType, Severity};
use sqlx::FromRow;
use uuid::Uuid;

use crate::{
    booking::{to_column_id, to_domain_id, CorruptRow},
    StoragePool,
};

/// Durable copy of the in-memory security log.
#[derive(Clone)]
pub struct SecurityEventRepository {
    pool: StoragePool,
}

#[derive(Debug, Clone, FromRow)]
struct SecurityEventRow {
    event_id: Uuid,
    event_type: String,
    user_id: i64,
    booking_id: Option<i64>,
    severity: String,
    details: serde_json::Value,
    occurred_at: DateTime<Utc>,
}

impl TryFrom<SecurityEventRow> for SecurityEvent {
    type Error = CorruptRow;

    fn try_from(row: SecurityEventRow) -> Result<Self, Self::Error> {
        let event_type = row
            .event_type
            .parse::<SecurityEventType>()
            .map_err(|_| CorruptRow::UnknownEventType(row.event_type.clone()))?;
        let severity = row
            .severity
            .parse::<Severity>()
            .map_err(|_| CorruptRow::UnknownSeverity(row.severity.clone()))?;
        Ok(SecurityEvent {
            event_id: row.event_id,
            event_type,
            user_id: to_domain_id("user_id", row.user_id)?,
            booking_id: row
                .booking_id
                .map(|id| to_domain_id("booking_id", id))
                .transpose()?,
            details: row.details,
            timestamp: row.occurred_at,
            severity,
        })
    }
}

impl SecurityEventRepository {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, event: &SecurityEvent) -> Result<()> {
        let user_id = to_column_id(event.user_id)?;
        let booking_id = event.booking_id.map(to_column_id).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO security_events
                (event_id, event_type, user_id, booking_id, severity, details, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event.event_id)
        .bind(event.event_type.as_str())
        .bind(user_id)
        .bind(booking_id)
        .bind(event.severity.as_str())
        .bind(&event.details)
        .bind(event.timestamp)
        .execute(self.pool.pool())
        .await
        .with_context(|| format!("storing security event {}", event.event_id))?;
        Ok(())
    }

    /// Up to `limit` stored events about `user_id`, newest first.
    pub async fn recent_for_user(&self, user_id: u64, limit: usize) -> Result<Vec<SecurityEvent>> {
        let rows = sqlx::query_as::<_, SecurityEventRow>(
            r#"
            SELECT event_id, event_type, user_id, booking_id, severity, details, occurred_at
            FROM security_events
            WHERE user_id = $1
            ORDER BY occurred_at DESC
            LIMIT $2
            "#,
        )
        .bind(to_column_id(user_id)?)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(self.pool.pool())
        .await
        .with_context(|| format!("loading security events for user {user_id}"))?;

        rows.into_iter()
            .map(|row| SecurityEvent::try_from(row).map_err(anyhow::Error::from))
            .collect()
    }
}
