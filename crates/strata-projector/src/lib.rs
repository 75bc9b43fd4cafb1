//! Strata Projector: keeps projections current
//!
//! - [`pusher`]: applies statements transactionally and advances cursors
//! - [`escalation`]: counts statement failures and skips poisoned events
//! - [`lease`]: instance leases with renewal and fencing
//! - [`subscriber`]: low-latency live path fed by the event bus
//! - [`scheduler`]: lease-protected bulk catch-up
//! - [`projection`]: the façade wiring them to one reducer set

mod blocking;
pub mod escalation;
pub mod lease;
pub mod projection;
pub mod pusher;
pub mod scheduler;
pub mod subscriber;

pub use escalation::{Escalated, Escalation, EscalationAction};
pub use lease::{cancel_on_err, Lease};
pub use projection::{Projection, ProjectionHandle};
pub use pusher::{Halt, PushOutcome, Pusher};
pub use scheduler::{Scheduler, TickReport, MILESTONE_AGGREGATE_TYPE, MILESTONE_FIRST_RUN};
pub use subscriber::Subscriber;
