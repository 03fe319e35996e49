//! Order service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{OrderLine, ServiceError};

/// Everything needed to record a placed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrder {
    pub cart_id: String,
    pub customer_id: String,
    pub lines: Vec<OrderLine>,
    pub reservation_id: String,
    pub authorization_id: String,
    pub total_cents: i64,
}

/// Trait for order bookkeeping.
#[async_trait]
pub trait OrderService: Send + Sync {
    /// Records the order and returns its ID.
    async fn create_order(&self, order: &NewOrder) -> Result<String, ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryOrderState {
    orders: HashMap<String, NewOrder>,
    next_id: u32,
    fail_on_create: bool,
}

/// In-memory order service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderService {
    state: Arc<RwLock<InMemoryOrderState>>,
}

impl InMemoryOrderService {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, InMemoryOrderState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, InMemoryOrderState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configures the service to reject create_order calls.
    pub fn set_fail_on_create(&self, fail: bool) {
        self.write().fail_on_create = fail;
    }

    pub fn order_count(&self) -> usize {
        self.read().orders.len()
    }

    pub fn get_order(&self, order_id: &str) -> Option<NewOrder> {
        self.read().orders.get(order_id).cloned()
    }
}

#[async_trait]
impl OrderService for InMemoryOrderService {
    async fn create_order(&self, order: &NewOrder) -> Result<String, ServiceError> {
        let mut state = self.write();

        if state.fail_on_create {
            return Err(ServiceError::Rejected("Order could not be created".to_string()));
        }

        state.next_id += 1;
        let order_id = format!("ORD-{:04}", state.next_id);
        state.orders.insert(order_id.clone(), order.clone());
        Ok(order_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_order() -> NewOrder {
        NewOrder {
            cart_id: "cart-1".to_string(),
            customer_id: "cust-1".to_string(),
            lines: vec![OrderLine::new("SKU-001", 1, 999)],
            reservation_id: "RES-0001".to_string(),
            authorization_id: "AUTH-0001".to_string(),
            total_cents: 999,
        }
    }

    #[tokio::test]
    async fn test_create_order() {
        let service = InMemoryOrderService::new();

        let order_id = service.create_order(&new_order()).await.unwrap();
        assert_eq!(order_id, "ORD-0001");
        assert_eq!(service.order_count(), 1);
        assert_eq!(service.get_order(&order_id).unwrap().total_cents, 999);
    }

    #[tokio::test]
    async fn test_fail_on_create() {
        let service = InMemoryOrderService::new();
        service.set_fail_on_create(true);

        assert!(service.create_order(&new_order()).await.is_err());
        assert_eq!(service.order_count(), 0);
    }
}
