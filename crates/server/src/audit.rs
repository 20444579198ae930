use anyhow::{anyhow, Result};
use dockside_core::{SecurityEvent, SecurityEventSink};
use dockside_storage::{SecurityEventRepository, StoragePool};
use tokio::runtime::Handle;

/// Writes security events to Postgres in the background. A failed insert
/// only produces a warning; the request that raised the event is unaffected.
pub struct PostgresEventSink {
    repository: SecurityEventRepository,
}

impl PostgresEventSink {
    pub fn new(pool: StoragePool) -> Self {
        Self {
            repository: SecurityEventRepository::new(pool),
        }
    }
}

impl SecurityEventSink for PostgresEventSink {
    fn persist(&self, event: &SecurityEvent) -> Result<()> {
        let handle = Handle::try_current()
            .map_err(|err| anyhow!("no async runtime to persist security event: {err}"))?;
        let repository = self.repository.clone();
        let event = event.clone();
        handle.spawn(async move {
            if let Err(err) = repository.insert(&event).await {
                tracing::warn!(?err, event_id = %event.event_id, "security event insert failed");
            }
        });
        Ok(())
    }
}
