//! Access control and message security for booking conversations.

pub mod access;
pub mod analysis;
pub mod audit;
pub mod booking;
pub mod content;
pub mod conversation;
pub mod guard;
pub mod policy;
pub mod rate_limit;

pub use access::{AccessDenial, ConversationAccess, OwnershipCheck};
pub use analysis::{RiskLevel, SecurityAnalysis};
pub use audit::{SecurityEvent, SecurityEventSink, SecurityEventType, SecurityLog, Severity};
pub use booking::{Boat, BoatLookup, Booking, BookingStatus, LookupError};
pub use content::{ContentError, ContentPolicy, ContentValidation};
pub use conversation::ConversationId;
pub use guard::{MessageGuard, MessageVerdict, Rejection};
pub use policy::{PolicyError, SecurityPolicy};
pub use rate_limit::{RateLimitPolicy, RateLimitScope, RateLimited, Reservation, WindowLimit};
