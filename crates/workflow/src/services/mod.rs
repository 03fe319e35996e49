//! Business service contracts called by the order placement steps, with
//! in-memory implementations.

pub mod inventory;
pub mod orders;
pub mod payment;

pub use inventory::{InMemoryInventoryService, InventoryService, OrderLine, Reservation};
pub use orders::{InMemoryOrderService, NewOrder, OrderService};
pub use payment::{Authorization, InMemoryPaymentService, PaymentService};

use thiserror::Error;

use crate::step::StepError;

/// Errors raised by business services.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The service could not be reached or timed out.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// The service refused the request.
    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl From<ServiceError> for StepError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unavailable(_) => StepError::transient(err.to_string()),
            ServiceError::Rejected(_) => StepError::permanent(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_errors_map_to_step_retryability() {
        let transient: StepError = ServiceError::Unavailable("gateway timeout".to_string()).into();
        let permanent: StepError = ServiceError::Rejected("card declined".to_string()).into();

        assert!(transient.retryable);
        assert!(!permanent.retryable);
        assert_eq!(permanent.message, "Request rejected: card declined");
    }
}
