pub mod projection;
pub mod store;

pub use projection::ProjectionConfig;
pub use store::{StoreConfig, SynchronousMode};
