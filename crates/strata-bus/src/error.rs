use strata_core::StrataError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("Subscription needs at least one aggregate type")]
    NoAggregateTypes,
}

impl From<BusError> for StrataError {
    fn from(err: BusError) -> Self {
        StrataError::Bus(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BusError>;
