pub mod event;
pub mod projection;

pub use event::{AggregateType, Event, EventType, NewEvent, Sequence};
pub use projection::{Cursor, FailedEvent, LeaseInfo};
