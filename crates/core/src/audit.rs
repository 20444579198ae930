//! Bounded, append-only audit trail of security events.

use std::{
    collections::VecDeque,
    str::FromStr,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const DEFAULT_AUDIT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    UnauthorizedAccess,
    InvalidConversation,
    SuspiciousContent,
    RateLimitExceeded,
    LookupFailure,
}

impl SecurityEventType {
    pub const ALL: [SecurityEventType; 5] = [
        SecurityEventType::UnauthorizedAccess,
        SecurityEventType::InvalidConversation,
        SecurityEventType::SuspiciousContent,
        SecurityEventType::RateLimitExceeded,
        SecurityEventType::LookupFailure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventType::UnauthorizedAccess => "unauthorized_access",
            SecurityEventType::InvalidConversation => "invalid_conversation",
            SecurityEventType::SuspiciousContent => "suspicious_content",
            SecurityEventType::RateLimitExceeded => "rate_limit_exceeded",
            SecurityEventType::LookupFailure => "lookup_failure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl FromStr for SecurityEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SecurityEventType::ALL
            .into_iter()
            .find(|event_type| event_type.as_str() == s)
            .ok_or_else(|| format!("unknown security event type '{s}'"))
    }
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Severity::ALL
            .into_iter()
            .find(|severity| severity.as_str() == s)
            .ok_or_else(|| format!("unknown severity '{s}'"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_id: Uuid,
    pub event_type: SecurityEventType,
    pub user_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<u64>,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
}

impl SecurityEvent {
    pub fn new(event_type: SecurityEventType, user_id: u64, severity: Severity) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            user_id,
            booking_id: None,
            details: Value::Null,
            timestamp: Utc::now(),
            severity,
        }
    }

    pub fn booking(mut self, booking_id: u64) -> Self {
        self.booking_id = Some(booking_id);
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Secondary destination for security events (database, SIEM forwarder).
///
/// Errors are reported back to [`SecurityLog`], which logs and drops them.
pub trait SecurityEventSink: Send + Sync {
    fn persist(&self, event: &SecurityEvent) -> anyhow::Result<()>;
}

pub struct SecurityLog {
    capacity: usize,
    events: Mutex<VecDeque<SecurityEvent>>,
    sink: Option<Arc<dyn SecurityEventSink>>,
}

impl Default for SecurityLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_AUDIT_CAPACITY)
    }
}

impl SecurityLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn SecurityEventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends `event`, evicting the oldest entry once the log is full.
    ///
    /// Never fails: sink errors are logged and discarded.
    pub fn log_event(&self, event: SecurityEvent) {
        trace_event(&event);

        if let Some(sink) = &self.sink {
            if let Err(err) = sink.persist(&event) {
                tracing::warn!(
                    ?err,
                    event_id = %event.event_id,
                    "failed to persist security event"
                );
            }
        }

        let mut events = self.lock();
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Up to `limit` events, newest first.
    pub fn recent(&self, limit: usize) -> Vec<SecurityEvent> {
        self.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Up to `limit` events about `user_id`, newest first.
    pub fn recent_for_user(&self, user_id: u64, limit: usize) -> Vec<SecurityEvent> {
        self.lock()
            .iter()
            .rev()
            .filter(|event| event.user_id == user_id)
            .take(limit)
            .cloned()
            .collect()
    }

    /// All retained events, oldest first.
    pub fn snapshot(&self) -> Vec<SecurityEvent> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<SecurityEvent>> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn trace_event(event: &SecurityEvent) {
    macro_rules! emit {
        ($level:ident) => {
            tracing::$level!(
                event_id = %event.event_id,
                event_type = event.event_type.as_str(),
                user_id = event.user_id,
                booking_id = ?event.booking_id,
                severity = event.severity.as_str(),
                details = %event.details,
                "security event"
            )
        };
    }

    match event.severity {
        Severity::Low => emit!(info),
        Severity::Medium => emit!(warn),
        Severity::High | Severity::Critical => emit!(error),
    }
}
