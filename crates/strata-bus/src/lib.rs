//! Strata Bus: in-process live event delivery
//!
//! The event log publishes every appended event here; projection
//! subscribers receive the events of the aggregate types they reduce.
//! Delivery is best effort: the scheduler's catch-up recovers anything a
//! subscriber misses.

pub mod bus;
pub mod error;

pub use bus::{EventBus, Subscription};
pub use error::{BusError, Result};
