//! Orchestrates the full send-message check for a booking conversation.

use std::{fmt, sync::Arc, time::Duration};

use serde::{Serialize, Serializer};
use serde_json::json;

use crate::{
    access::{self, AccessDenial, ConversationAccess},
    analysis::{self, RiskLevel, SecurityAnalysis},
    audit::{SecurityEvent, SecurityEventType, SecurityLog, Severity},
    booking::{self, BoatLookup, Booking, LookupError},
    content::{self, ContentError},
    conversation::{self, ConversationId},
    policy::SecurityPolicy,
    rate_limit::{
        AttemptStore, Clock, InMemoryAttemptStore, MessageRateLimiter, RateLimited,
        SlidingWindowLimiter, SystemClock,
    },
};

/// One reason a message was refused. A verdict may carry several.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Access(AccessDenial),
    RateLimited(RateLimited),
    Content(ContentError),
}

impl Rejection {
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::Access(denial) => denial.code(),
            Rejection::RateLimited(_) => "rate_limited",
            Rejection::Content(error) => error.code(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Access(denial) => fmt::Display::fmt(denial, f),
            Rejection::RateLimited(limited) => fmt::Display::fmt(limited, f),
            Rejection::Content(error) => fmt::Display::fmt(error, f),
        }
    }
}

impl Serialize for Rejection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("Rejection", 2)?;
        state.serialize_field("code", self.code())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageVerdict {
    pub conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sanitized_content: Option<String>,
    pub analysis: SecurityAnalysis,
    pub rejections: Vec<Rejection>,
}

impl MessageVerdict {
    pub fn is_accepted(&self) -> bool {
        self.rejections.is_empty()
    }

    pub fn rate_limit(&self) -> Option<&RateLimited> {
        self.rejections.iter().find_map(|rejection| match rejection {
            Rejection::RateLimited(limited) => Some(limited),
            _ => None,
        })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.rate_limit().map(|limited| limited.retry_after)
    }
}

/// Send-message gatekeeper. Each instance owns its own rate-limit state and
/// audit log unless they are injected.
#[derive(Clone)]
pub struct MessageGuard {
    boats: Arc<dyn BoatLookup>,
    policy: SecurityPolicy,
    store: Arc<dyn AttemptStore>,
    clock: Arc<dyn Clock>,
    limiter: MessageRateLimiter,
    log: Arc<SecurityLog>,
}

impl MessageGuard {
    pub fn new(boats: Arc<dyn BoatLookup>, policy: SecurityPolicy) -> Self {
        let store: Arc<dyn AttemptStore> = Arc::new(InMemoryAttemptStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let log = Arc::new(SecurityLog::with_capacity(policy.audit_capacity));
        let limiter = MessageRateLimiter::new(
            SlidingWindowLimiter::new(store.clone(), clock.clone()),
            policy.rate_limit,
        );
        Self {
            boats,
            policy,
            store,
            clock,
            limiter,
            log,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self.rebuild_limiter();
        self
    }

    pub fn with_attempt_store(mut self, store: Arc<dyn AttemptStore>) -> Self {
        self.store = store;
        self.rebuild_limiter();
        self
    }

    pub fn with_log(mut self, log: Arc<SecurityLog>) -> Self {
        self.log = log;
        self
    }

    fn rebuild_limiter(&mut self) {
        self.limiter = MessageRateLimiter::new(
            SlidingWindowLimiter::new(self.store.clone(), self.clock.clone()),
            self.policy.rate_limit,
        );
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    pub fn log(&self) -> &Arc<SecurityLog> {
        &self.log
    }

    async fn captain_for(&self, booking: &Booking, user_id: u64) -> Result<u64, LookupError> {
        match booking::resolve_captain_id(self.boats.as_ref(), booking).await {
            Ok(captain_id) => Ok(captain_id),
            Err(err) => {
                self.log.log_event(
                    SecurityEvent::new(SecurityEventType::LookupFailure, user_id, Severity::High)
                        .booking(booking.id)
                        .details(json!({
                            "boat_id": booking.boat_id,
                            "error": err.to_string(),
                        })),
                );
                Err(err)
            }
        }
    }

    /// Runs every check for a message `user_id` wants to post on `booking`.
    ///
    /// Failing checks are collected rather than short-circuited. Only a
    /// failure to resolve the captain is returned as `Err`. An accepted
    /// message consumes one rate-limit slot; rejected ones do not.
    pub async fn validate_message(
        &self,
        booking: &Booking,
        user_id: u64,
        content: &str,
    ) -> Result<MessageVerdict, LookupError> {
        let captain_id = self.captain_for(booking, user_id).await?;
        let conversation_id = conversation::encode(booking.id, booking.customer_id, captain_id);
        let mut rejections = Vec::new();

        let ownership = access::validate_booking_ownership(booking, user_id, Some(captain_id));
        if let Some(reason) = ownership.reason {
            self.log.log_event(
                SecurityEvent::new(
                    SecurityEventType::UnauthorizedAccess,
                    user_id,
                    Severity::Medium,
                )
                .booking(booking.id)
                .details(json!({
                    "reason": reason.code(),
                    "status": booking.status,
                    "conversation_id": conversation_id,
                })),
            );
            rejections.push(Rejection::Access(reason));
        }

        // Reserved atomically; released below if any other check fails.
        let reservation = match self.limiter.acquire(user_id) {
            Ok(reservation) => Some(reservation),
            Err(limited) => {
                self.log.log_event(
                    SecurityEvent::new(SecurityEventType::RateLimitExceeded, user_id, Severity::Low)
                        .booking(booking.id)
                        .details(json!({
                            "scope": limited.scope,
                            "retry_after_ms": limited.retry_after.as_millis() as u64,
                        })),
                );
                rejections.push(Rejection::RateLimited(limited));
                None
            }
        };

        let validation = content::validate_content(content, &self.policy.content);
        let analysis = analysis::analyze_security(content, &self.policy.content);

        let security_errors: Vec<_> = validation
            .errors
            .iter()
            .filter(|error| error.is_security_related())
            .map(ContentError::to_string)
            .collect();
        if !security_errors.is_empty() || analysis.risk_level == RiskLevel::High {
            let severity = if analysis.risk_level == RiskLevel::High {
                Severity::High
            } else {
                Severity::Medium
            };
            self.log.log_event(
                SecurityEvent::new(SecurityEventType::SuspiciousContent, user_id, severity)
                    .booking(booking.id)
                    .details(json!({
                        "errors": security_errors,
                        "risk_level": analysis.risk_level,
                        "issues": analysis.issues,
                    })),
            );
        }
        rejections.extend(validation.errors.into_iter().map(Rejection::Content));

        if !rejections.is_empty() {
            if let Some(reservation) = reservation {
                self.limiter.release(reservation);
            }
        } else {
            tracing::debug!(
                user_id,
                booking_id = booking.id,
                %conversation_id,
                risk_level = analysis.risk_level.as_str(),
                "message accepted"
            );
        }

        Ok(MessageVerdict {
            conversation_id,
            sanitized_content: if rejections.is_empty() {
                validation.sanitized_content
            } else {
                None
            },
            analysis,
            rejections,
        })
    }

    /// Decides whether `user_id` may open `conversation_id`, which must be the
    /// id of `booking`'s own conversation.
    pub async fn authorize_conversation(
        &self,
        conversation_id: &str,
        booking: &Booking,
        user_id: u64,
    ) -> Result<ConversationAccess, LookupError> {
        let captain_id = self.captain_for(booking, user_id).await?;
        let ownership = access::validate_booking_ownership(booking, user_id, Some(captain_id));
        let mut result = access::validate_conversation_access(conversation_id, user_id, &ownership);

        // A well-formed id naming other parties must not unlock this booking.
        let canonical = ConversationId::new(booking.id, booking.customer_id, captain_id);
        if result.has_access && result.metadata != Some(canonical) {
            result = ConversationAccess::denied(AccessDenial::NotParticipant);
        }

        if let Some(reason) = result.reason {
            let event_type = match reason {
                AccessDenial::InvalidConversationId => SecurityEventType::InvalidConversation,
                _ => SecurityEventType::UnauthorizedAccess,
            };
            self.log.log_event(
                SecurityEvent::new(event_type, user_id, Severity::Medium)
                    .booking(booking.id)
                    .details(json!({
                        "reason": reason.code(),
                        "conversation_id": conversation_id,
                    })),
            );
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        booking::{Boat, BookingStatus},
        rate_limit::ManualClock,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct Boats(HashMap<u64, Boat>);

    #[async_trait]
    impl BoatLookup for Boats {
        async fn boat_by_id(&self, boat_id: u64) -> Result<Boat, LookupError> {
            self.0
                .get(&boat_id)
                .cloned()
                .ok_or(LookupError::BoatNotFound(boat_id))
        }
    }

    struct DownBoats;

    #[async_trait]
    impl BoatLookup for DownBoats {
        async fn boat_by_id(&self, _boat_id: u64) -> Result<Boat, LookupError> {
            Err(LookupError::Unavailable(anyhow::anyhow!("connection refused")))
        }
    }

    fn marina() -> Arc<dyn BoatLookup> {
        Arc::new(Boats(HashMap::from([(
            7,
            Boat {
                id: 7,
                owner_id: 9,
                name: Some("Sea Breeze".into()),
            },
        )])))
    }

    fn booking(status: BookingStatus) -> Booking {
        Booking {
            id: 42,
            customer_id: 5,
            boat_id: 7,
            status,
        }
    }

    fn guard() -> (MessageGuard, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_at(1_700_000_000_000));
        let guard = MessageGuard::new(marina(), SecurityPolicy::default()).with_clock(clock.clone());
        (guard, clock)
    }

    #[tokio::test]
    async fn customer_message_is_accepted() {
        let (guard, _) = guard();
        let verdict = guard
            .validate_message(&booking(BookingStatus::Confirmed), 5, "Hi there")
            .await
            .unwrap();

        assert!(verdict.is_accepted());
        assert_eq!(verdict.conversation_id, "booking_42_5_9");
        assert_eq!(verdict.sanitized_content.as_deref(), Some("Hi there"));
        assert_eq!(verdict.analysis.risk_level, RiskLevel::Low);
        assert!(guard.log().is_empty());
    }

    #[tokio::test]
    async fn captain_resolved_through_boat_may_reply() {
        let (guard, _) = guard();
        let verdict = guard
            .validate_message(&booking(BookingStatus::Pending), 9, "Welcome aboard")
            .await
            .unwrap();
        assert!(verdict.is_accepted());
    }

    #[tokio::test]
    async fn end_to_end_conversation_access() {
        let (guard, _) = guard();
        let access = guard
            .authorize_conversation("booking_42_5_9", &booking(BookingStatus::Confirmed), 5)
            .await
            .unwrap();

        assert!(access.has_access);
        assert_eq!(access.metadata, Some(ConversationId::new(42, 5, 9)));
    }

    #[tokio::test]
    async fn errors_accumulate_across_checks() {
        let (guard, _) = guard();
        let verdict = guard
            .validate_message(
                &booking(BookingStatus::Cancelled),
                99,
                "<script>alert(1)</script>hello",
            )
            .await
            .unwrap();

        assert!(!verdict.is_accepted());
        assert!(verdict.sanitized_content.is_none());
        assert_eq!(
            verdict.rejections[0],
            Rejection::Access(AccessDenial::NotBookingOwner)
        );
        assert!(verdict
            .rejections
            .contains(&Rejection::Content(ContentError::FailedSanitization)));
        assert_eq!(verdict.analysis.risk_level, RiskLevel::High);

        let logged: Vec<_> = guard
            .log()
            .snapshot()
            .into_iter()
            .map(|event| event.event_type)
            .collect();
        assert_eq!(
            logged,
            vec![
                SecurityEventType::UnauthorizedAccess,
                SecurityEventType::SuspiciousContent
            ]
        );
    }

    #[tokio::test]
    async fn rejected_messages_do_not_consume_rate_limit() {
        let (guard, _) = guard();
        let booking = booking(BookingStatus::Confirmed);

        for _ in 0..5 {
            let verdict = guard.validate_message(&booking, 5, "").await.unwrap();
            assert_eq!(
                verdict.rejections,
                vec![Rejection::Content(ContentError::Required)]
            );
        }

        let verdict = guard.validate_message(&booking, 5, "still here").await.unwrap();
        assert!(verdict.is_accepted());
    }

    #[tokio::test]
    async fn burst_limit_reports_cooldown_and_recovers() {
        let (guard, clock) = guard();
        let booking = booking(BookingStatus::Confirmed);

        for n in 0..3 {
            let verdict = guard
                .validate_message(&booking, 5, &format!("message {n}"))
                .await
                .unwrap();
            assert!(verdict.is_accepted());
        }

        clock.advance(Duration::from_secs(4));
        let verdict = guard.validate_message(&booking, 5, "one more").await.unwrap();
        assert_eq!(verdict.retry_after(), Some(Duration::from_secs(6)));
        assert_eq!(verdict.rejections.len(), 1);
        assert_eq!(verdict.rejections[0].code(), "rate_limited");
        assert_eq!(
            guard.log().recent(1)[0].event_type,
            SecurityEventType::RateLimitExceeded
        );

        clock.advance(Duration::from_secs(7));
        let verdict = guard.validate_message(&booking, 5, "one more").await.unwrap();
        assert!(verdict.is_accepted());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_sends_never_exceed_burst_cap() {
        for _ in 0..25 {
            let (guard, _) = guard();
            let booking = booking(BookingStatus::Confirmed);

            let sends: Vec<_> = (0..16)
                .map(|n| {
                    let guard = guard.clone();
                    let booking = booking.clone();
                    tokio::spawn(async move {
                        guard
                            .validate_message(&booking, 5, &format!("ahoy number {n}"))
                            .await
                            .unwrap()
                            .is_accepted()
                    })
                })
                .collect();

            let mut accepted = 0;
            for send in sends {
                if send.await.unwrap() {
                    accepted += 1;
                }
            }
            assert_eq!(accepted, 3);
        }
    }

    #[tokio::test]
    async fn forged_conversation_id_is_refused() {
        let (guard, _) = guard();
        let confirmed = booking(BookingStatus::Confirmed);

        for (forged, user_id) in [("booking_42_666_9", 9), ("booking_42_5_666", 5)] {
            let access = guard
                .authorize_conversation(forged, &confirmed, user_id)
                .await
                .unwrap();
            assert!(!access.has_access, "{forged} opened for user {user_id}");
            assert_eq!(access.reason, Some(AccessDenial::NotParticipant));
            assert_eq!(access.metadata, None);
        }

        let events = guard.log().snapshot();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|event| event.event_type == SecurityEventType::UnauthorizedAccess));
    }

    #[tokio::test]
    async fn lookup_failure_propagates_and_is_audited() {
        let guard = MessageGuard::new(Arc::new(DownBoats), SecurityPolicy::default());
        let err = guard
            .validate_message(&booking(BookingStatus::Confirmed), 9, "hello")
            .await
            .unwrap_err();

        assert!(matches!(err, LookupError::Unavailable(_)));
        let events = guard.log().snapshot();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, SecurityEventType::LookupFailure);
        assert_eq!(events[0].severity, Severity::High);
    }

    #[tokio::test]
    async fn missing_boat_is_not_treated_as_denial() {
        let guard = MessageGuard::new(
            Arc::new(Boats(HashMap::new())),
            SecurityPolicy::default(),
        );
        let err = guard
            .authorize_conversation("booking_42_5_9", &booking(BookingStatus::Confirmed), 9)
            .await
            .unwrap_err();
        assert!(matches!(err, LookupError::BoatNotFound(7)));
    }

    #[tokio::test]
    async fn malformed_conversation_is_audited() {
        let (guard, _) = guard();
        let access = guard
            .authorize_conversation("chat_42", &booking(BookingStatus::Confirmed), 5)
            .await
            .unwrap();

        assert!(!access.has_access);
        assert_eq!(access.reason, Some(AccessDenial::InvalidConversationId));
        assert_eq!(
            guard.log().snapshot()[0].event_type,
            SecurityEventType::InvalidConversation
        );
    }

    #[test]
    fn rejection_serializes_code_and_message() {
        let value =
            serde_json::to_value(Rejection::Content(ContentError::TooLong { max: 1000 })).unwrap();
        assert_eq!(value["code"], "content_too_long");
        assert_eq!(value["message"], "content must be at most 1000 characters");
    }
}
