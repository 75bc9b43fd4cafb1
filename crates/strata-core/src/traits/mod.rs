pub mod lease;
pub mod projection;

pub use lease::LeaseStore;
pub use projection::{Executor, ProjectionStore, ProjectionTxn};
