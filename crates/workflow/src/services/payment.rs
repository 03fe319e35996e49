//! Payment service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::ServiceError;

/// Result of a successful payment authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    /// The authorization ID assigned by the payment service.
    pub authorization_id: String,
    pub amount_cents: i64,
}

/// Trait for payment processing operations.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Places a hold on the customer's funds.
    async fn authorize(
        &self,
        customer_id: &str,
        amount_cents: i64,
    ) -> Result<Authorization, ServiceError>;

    /// Voids a previously placed hold.
    async fn void(&self, authorization_id: &str) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    authorizations: HashMap<String, (String, i64)>,
    next_id: u32,
    decline: bool,
    unavailable_for: u32,
    void_calls: usize,
}

/// In-memory payment service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<RwLock<InMemoryPaymentState>>,
}

impl InMemoryPaymentService {
    /// Creates a new in-memory payment service.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, InMemoryPaymentState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, InMemoryPaymentState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declines every authorization while set.
    pub fn set_fail_on_authorize(&self, fail: bool) {
        self.write().decline = fail;
    }

    /// Fails the next `count` authorizations as if the gateway timed out.
    pub fn fail_next_authorizations(&self, count: u32) {
        self.write().unavailable_for = count;
    }

    /// Returns the number of active authorizations.
    pub fn authorization_count(&self) -> usize {
        self.read().authorizations.len()
    }

    /// Returns true if an authorization exists with the given ID.
    pub fn has_authorization(&self, authorization_id: &str) -> bool {
        self.read().authorizations.contains_key(authorization_id)
    }

    /// Number of void calls received.
    pub fn void_calls(&self) -> usize {
        self.read().void_calls
    }
}

#[async_trait]
impl PaymentService for InMemoryPaymentService {
    async fn authorize(
        &self,
        customer_id: &str,
        amount_cents: i64,
    ) -> Result<Authorization, ServiceError> {
        let mut state = self.write();

        if state.unavailable_for > 0 {
            state.unavailable_for -= 1;
            return Err(ServiceError::Unavailable("Payment gateway timeout".to_string()));
        }
        if state.decline {
            return Err(ServiceError::Rejected("Payment declined".to_string()));
        }

        state.next_id += 1;
        let authorization_id = format!("AUTH-{:04}", state.next_id);
        state.authorizations.insert(
            authorization_id.clone(),
            (customer_id.to_string(), amount_cents),
        );

        Ok(Authorization {
            authorization_id,
            amount_cents,
        })
    }

    async fn void(&self, authorization_id: &str) -> Result<(), ServiceError> {
        let mut state = self.write();
        state.void_calls += 1;
        state.authorizations.remove(authorization_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_authorize_and_void() {
        let service = InMemoryPaymentService::new();

        let result = service.authorize("cust-1", 5000).await.unwrap();
        assert!(result.authorization_id.starts_with("AUTH-"));
        assert_eq!(result.amount_cents, 5000);
        assert!(service.has_authorization(&result.authorization_id));

        service.void(&result.authorization_id).await.unwrap();
        assert_eq!(service.authorization_count(), 0);
        assert_eq!(service.void_calls(), 1);
    }

    #[tokio::test]
    async fn test_decline_is_permanent() {
        let service = InMemoryPaymentService::new();
        service.set_fail_on_authorize(true);

        let result = service.authorize("cust-1", 5000).await;
        assert!(matches!(result, Err(ServiceError::Rejected(_))));
        assert_eq!(service.authorization_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_run_out() {
        let service = InMemoryPaymentService::new();
        service.fail_next_authorizations(2);

        assert!(matches!(
            service.authorize("cust-1", 100).await,
            Err(ServiceError::Unavailable(_))
        ));
        assert!(service.authorize("cust-1", 100).await.is_err());
        assert!(service.authorize("cust-1", 100).await.is_ok());
    }
}
