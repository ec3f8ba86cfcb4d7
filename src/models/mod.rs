pub mod booking;
pub mod document;
pub mod event;
pub mod hold;
pub mod host;
pub mod meeting_type;
pub mod rule;
pub mod webhook;

pub use booking::{Booking, BookingStatus};
pub use document::{Document, DocumentStatus};
pub use event::{subjects, Envelope, Stream};
pub use hold::{Hold, HoldStatus};
pub use host::Host;
pub use meeting_type::MeetingType;
pub use rule::{AvailabilityRule, BlackoutDate};
pub use webhook::{ProcessedWebhook, WebhookStatus};
