use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use dockside_core::{
    conversation, AccessDenial, ConversationAccess, LookupError, MessageGuard, MessageVerdict,
    Rejection, SecurityEvent, SecurityEventType, SecurityLog, SecurityPolicy, Severity,
};
use dockside_storage::{SecurityEventRepository, StoragePool};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    audit::PostgresEventSink,
    config::ServerConfig,
    directory::{BookingDirectory, InMemoryDirectory, PostgresDirectory, UnavailableDirectory},
    AppState,
};

const DEFAULT_EVENT_PAGE: usize = 50;

pub struct MessagingService {
    directory: Arc<dyn BookingDirectory>,
    guard: MessageGuard,
    history: Option<SecurityEventRepository>,
}

impl MessagingService {
    pub fn new<D>(directory: Arc<D>, policy: SecurityPolicy) -> Self
    where
        D: BookingDirectory + 'static,
    {
        let guard = MessageGuard::new(directory.clone(), policy);
        Self {
            directory,
            guard,
            history: None,
        }
    }

    pub fn with_log(mut self, log: Arc<SecurityLog>) -> Self {
        self.guard = self.guard.with_log(log);
        self
    }

    /// Per-user event queries read from `history` instead of the bounded
    /// in-memory log.
    pub fn with_history(mut self, history: SecurityEventRepository) -> Self {
        self.history = Some(history);
        self
    }

    pub async fn check_message(
        &self,
        booking_id: u64,
        sender_id: u64,
        content: &str,
    ) -> Result<MessageVerdict, LookupError> {
        let booking = self.directory.booking_by_id(booking_id).await?;
        self.guard.validate_message(&booking, sender_id, content).await
    }

    pub async fn conversation_access(
        &self,
        conversation_id: &str,
        user_id: u64,
    ) -> Result<ConversationAccess, LookupError> {
        let Some(id) = conversation::decode(conversation_id) else {
            self.guard.log().log_event(
                SecurityEvent::new(SecurityEventType::InvalidConversation, user_id, Severity::Medium)
                    .details(json!({ "conversation_id": conversation_id })),
            );
            return Ok(ConversationAccess {
                has_access: false,
                reason: Some(AccessDenial::InvalidConversationId),
                metadata: None,
            });
        };

        let booking = self.directory.booking_by_id(id.booking_id).await?;
        self.guard
            .authorize_conversation(conversation_id, &booking, user_id)
            .await
    }

    pub fn recent_events(&self, limit: usize) -> Vec<SecurityEvent> {
        self.guard.log().recent(limit)
    }

    pub async fn events_for_user(
        &self,
        user_id: u64,
        limit: usize,
    ) -> anyhow::Result<Vec<SecurityEvent>> {
        match &self.history {
            Some(history) => history.recent_for_user(user_id, limit).await,
            None => Ok(self.guard.log().recent_for_user(user_id, limit)),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub sender_id: u64,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct PostMessageResponse {
    pub conversation_id: String,
    pub content: String,
    pub risk_level: &'static str,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Serialize)]
struct RejectedMessageBody {
    error: &'static str,
    conversation_id: String,
    rejections: Vec<Rejection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct AccessQuery {
    pub user_id: u64,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
    pub user_id: Option<u64>,
}

fn lookup_failure_response(err: &LookupError) -> Response {
    match err {
        LookupError::BookingNotFound(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "booking_not_found", "message": err.to_string() })),
        )
            .into_response(),
        _ => {
            tracing::error!(?err, "booking lookup failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "error": "lookup_failed",
                    "message": "booking details are unavailable; try again later",
                })),
            )
                .into_response()
        }
    }
}

/// Access problems outrank rate limits, which outrank content problems.
fn rejection_status(rejections: &[Rejection]) -> StatusCode {
    if rejections.iter().any(|r| matches!(r, Rejection::Access(_))) {
        StatusCode::FORBIDDEN
    } else if rejections
        .iter()
        .any(|r| matches!(r, Rejection::RateLimited(_)))
    {
        StatusCode::TOO_MANY_REQUESTS
    } else {
        StatusCode::BAD_REQUEST
    }
}

fn verdict_response(verdict: MessageVerdict) -> Response {
    if verdict.is_accepted() {
        return Json(PostMessageResponse {
            conversation_id: verdict.conversation_id,
            content: verdict.sanitized_content.unwrap_or_default(),
            risk_level: verdict.analysis.risk_level.as_str(),
            issues: verdict.analysis.issues,
            recommendations: verdict.analysis.recommendations,
        })
        .into_response();
    }

    let status = rejection_status(&verdict.rejections);
    let retry_after = verdict.rate_limit().copied();
    let body = RejectedMessageBody {
        error: "message_rejected",
        conversation_id: verdict.conversation_id,
        rejections: verdict.rejections,
        retry_after_ms: retry_after.map(|limited| limited.retry_after.as_millis() as u64),
    };

    let mut response = (status, Json(body)).into_response();
    if let Some(limited) = retry_after {
        if let Ok(value) = HeaderValue::from_str(&limited.retry_after_secs().to_string()) {
            response.headers_mut().insert(RETRY_AFTER, value);
        }
    }
    response
}

pub async fn post_message(
    State(state): State<AppState>,
    Path(booking_id): Path<u64>,
    Json(body): Json<PostMessageRequest>,
) -> Response {
    #[cfg(feature = "metrics")]
    let route = "messages.check";
    let messaging = state.messaging();

    let response = match messaging
        .check_message(booking_id, body.sender_id, &body.content)
        .await
    {
        Ok(verdict) => {
            for rejection in &verdict.rejections {
                state.record_messaging_rejection(rejection.code());
            }
            verdict_response(verdict)
        }
        Err(err) => lookup_failure_response(&err),
    };

    #[cfg(feature = "metrics")]
    state.record_http_request(route, response.status().as_u16());
    response
}

pub async fn conversation_access(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Query(query): Query<AccessQuery>,
) -> Response {
    #[cfg(feature = "metrics")]
    let route = "conversations.access";
    let messaging = state.messaging();

    let response = match messaging
        .conversation_access(&conversation_id, query.user_id)
        .await
    {
        Ok(access) => {
            let status = match access.reason {
                None => StatusCode::OK,
                Some(AccessDenial::InvalidConversationId) => StatusCode::BAD_REQUEST,
                Some(_) => StatusCode::FORBIDDEN,
            };
            if let Some(reason) = access.reason {
                state.record_messaging_rejection(reason.code());
            }
            (status, Json(access)).into_response()
        }
        Err(err) => lookup_failure_response(&err),
    };

    #[cfg(feature = "metrics")]
    state.record_http_request(route, response.status().as_u16());
    response
}

pub async fn security_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_PAGE);
    let messaging = state.messaging();

    let events = match query.user_id {
        Some(user_id) => messaging.events_for_user(user_id, limit).await,
        None => Ok(messaging.recent_events(limit)),
    };
    let response = match events {
        Ok(events) => Json(events).into_response(),
        Err(err) => {
            tracing::error!(?err, user_id = ?query.user_id, "failed to load security events");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "error": "events_unavailable",
                    "message": "stored security events are unavailable; try again later",
                })),
            )
                .into_response()
        }
    };

    #[cfg(feature = "metrics")]
    state.record_http_request("security.events", response.status().as_u16());
    response
}

/// Picks the booking source. A configured database that is not reachable
/// yields a directory whose lookups fail as unavailable, never an empty one.
pub fn init_messaging_service(config: &ServerConfig, pool: Option<StoragePool>) -> MessagingService {
    let policy = config.messaging.clone();
    match (pool, config.database_url.is_some()) {
        (Some(pool), _) => {
            let log = SecurityLog::with_capacity(policy.audit_capacity)
                .with_sink(Arc::new(PostgresEventSink::new(pool.clone())));
            MessagingService::new(Arc::new(PostgresDirectory::new(pool.clone())), policy)
                .with_log(Arc::new(log))
                .with_history(SecurityEventRepository::new(pool))
        }
        (None, true) => {
            tracing::warn!(
                "database configured but not connected; booking lookups will report unavailable"
            );
            MessagingService::new(
                Arc::new(UnavailableDirectory::new("not connected at startup")),
                policy,
            )
        }
        (None, false) => {
            let directory = InMemoryDirectory::from_fixtures(&config.fixtures);
            tracing::info!(
                boats = directory.boat_count(),
                bookings = directory.booking_count(),
                "no database configured; serving bookings from configured fixtures"
            );
            MessagingService::new(Arc::new(directory), policy)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DirectoryFixtures;
    use dockside_core::{Boat, Booking, BookingStatus, ContentError, RateLimitScope, RateLimited};
    use std::time::Duration;

    fn harbour_fixtures() -> DirectoryFixtures {
        DirectoryFixtures {
            boats: vec![Boat {
                id: 7,
                owner_id: 9,
                name: Some("Sea Breeze".into()),
            }],
            bookings: vec![Booking {
                id: 42,
                customer_id: 5,
                boat_id: 7,
                status: BookingStatus::Confirmed,
            }],
        }
    }

    #[tokio::test]
    async fn unreachable_database_is_reported_as_unavailable() {
        let config = ServerConfig {
            database_url: Some("postgres://db.invalid/dockside".into()),
            fixtures: harbour_fixtures(),
            ..ServerConfig::default()
        };
        let service = init_messaging_service(&config, None);

        let err = service.check_message(42, 5, "Hi there").await.unwrap_err();
        assert!(matches!(err, LookupError::Unavailable(_)));

        let err = service
            .conversation_access("booking_42_5_9", 5)
            .await
            .unwrap_err();
        assert!(matches!(err, LookupError::Unavailable(_)));
    }

    #[tokio::test]
    async fn fixtures_back_the_in_memory_directory() {
        let config = ServerConfig {
            fixtures: harbour_fixtures(),
            ..ServerConfig::default()
        };
        let service = init_messaging_service(&config, None);

        let verdict = service.check_message(42, 5, "Hi there").await.unwrap();
        assert!(verdict.is_accepted());
        assert_eq!(verdict.conversation_id, "booking_42_5_9");
        assert!(matches!(
            service.check_message(1, 5, "Hi there").await,
            Err(LookupError::BookingNotFound(1))
        ));
    }

    #[tokio::test]
    async fn user_events_come_from_the_log_without_history() {
        let service = init_messaging_service(
            &ServerConfig {
                fixtures: harbour_fixtures(),
                ..ServerConfig::default()
            },
            None,
        );
        service.check_message(42, 77, "Hi").await.unwrap();
        service.check_message(42, 88, "Hi").await.unwrap();

        let events = service.events_for_user(77, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].user_id, 77);
        assert_eq!(events[0].event_type, SecurityEventType::UnauthorizedAccess);
    }

    #[test]
    fn status_precedence_prefers_access_then_rate_limit() {
        let access = Rejection::Access(AccessDenial::NotBookingOwner);
        let limited = Rejection::RateLimited(RateLimited {
            scope: RateLimitScope::Burst,
            retry_after: Duration::from_secs(3),
        });
        let content = Rejection::Content(ContentError::Required);

        assert_eq!(
            rejection_status(&[content.clone(), limited.clone(), access]),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            rejection_status(&[content.clone(), limited]),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(rejection_status(&[content]), StatusCode::BAD_REQUEST);
    }
}
