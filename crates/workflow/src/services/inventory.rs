//! Inventory service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::ServiceError;

/// One line of a cart being placed as an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub sku: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

impl OrderLine {
    pub fn new(sku: impl Into<String>, quantity: u32, unit_price_cents: i64) -> Self {
        Self {
            sku: sku.into(),
            quantity,
            unit_price_cents,
        }
    }

    pub fn total_cents(&self) -> i64 {
        self.unit_price_cents * i64::from(self.quantity)
    }
}

/// Result of a successful inventory reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// The reservation ID assigned by the inventory service.
    pub reservation_id: String,
}

/// Trait for inventory management operations.
#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Returns the quantity on hand for a SKU. Read-only.
    async fn available(&self, sku: &str) -> Result<u32, ServiceError>;

    /// Reserves stock for every line of a cart.
    async fn reserve(&self, cart_id: &str, lines: &[OrderLine])
    -> Result<Reservation, ServiceError>;

    /// Releases a previously made reservation, returning its stock.
    async fn release(&self, reservation_id: &str) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryInventoryState {
    stock: HashMap<String, u32>,
    reservations: HashMap<String, (String, Vec<OrderLine>)>,
    next_id: u32,
    fail_on_reserve: bool,
    fail_on_release: bool,
    release_calls: usize,
}

/// In-memory inventory service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<RwLock<InMemoryInventoryState>>,
}

impl InMemoryInventoryService {
    /// Creates a new in-memory inventory service with no stock.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, InMemoryInventoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, InMemoryInventoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the quantity on hand for a SKU.
    pub fn set_stock(&self, sku: impl Into<String>, quantity: u32) {
        self.write().stock.insert(sku.into(), quantity);
    }

    pub fn stock(&self, sku: &str) -> u32 {
        self.read().stock.get(sku).copied().unwrap_or(0)
    }

    /// Makes reserve calls fail as if the service were down.
    pub fn set_fail_on_reserve(&self, fail: bool) {
        self.write().fail_on_reserve = fail;
    }

    /// Makes release calls fail as if the service were down.
    pub fn set_fail_on_release(&self, fail: bool) {
        self.write().fail_on_release = fail;
    }

    /// Returns the number of active reservations.
    pub fn reservation_count(&self) -> usize {
        self.read().reservations.len()
    }

    /// Returns true if a reservation exists with the given ID.
    pub fn has_reservation(&self, reservation_id: &str) -> bool {
        self.read().reservations.contains_key(reservation_id)
    }

    /// Number of release calls received, failed ones included.
    pub fn release_calls(&self) -> usize {
        self.read().release_calls
    }
}

#[async_trait]
impl InventoryService for InMemoryInventoryService {
    async fn available(&self, sku: &str) -> Result<u32, ServiceError> {
        Ok(self.stock(sku))
    }

    async fn reserve(
        &self,
        cart_id: &str,
        lines: &[OrderLine],
    ) -> Result<Reservation, ServiceError> {
        let mut state = self.write();

        if state.fail_on_reserve {
            return Err(ServiceError::Unavailable(
                "Inventory service unavailable".to_string(),
            ));
        }

        for line in lines {
            let on_hand = state.stock.get(&line.sku).copied().unwrap_or(0);
            if on_hand < line.quantity {
                return Err(ServiceError::Rejected(format!(
                    "Insufficient stock for {}: requested {}, available {}",
                    line.sku, line.quantity, on_hand
                )));
            }
        }
        for line in lines {
            if let Some(on_hand) = state.stock.get_mut(&line.sku) {
                *on_hand -= line.quantity;
            }
        }

        state.next_id += 1;
        let reservation_id = format!("RES-{:04}", state.next_id);
        state
            .reservations
            .insert(reservation_id.clone(), (cart_id.to_string(), lines.to_vec()));

        Ok(Reservation { reservation_id })
    }

    async fn release(&self, reservation_id: &str) -> Result<(), ServiceError> {
        let mut state = self.write();
        state.release_calls += 1;

        if state.fail_on_release {
            return Err(ServiceError::Unavailable(
                "Inventory service unavailable".to_string(),
            ));
        }

        if let Some((_, lines)) = state.reservations.remove(reservation_id) {
            for line in lines {
                *state.stock.entry(line.sku).or_insert(0) += line.quantity;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widget(quantity: u32) -> Vec<OrderLine> {
        vec![OrderLine::new("SKU-001", quantity, 1250)]
    }

    #[tokio::test]
    async fn test_reserve_and_release() {
        let service = InMemoryInventoryService::new();
        service.set_stock("SKU-001", 5);

        let result = service.reserve("cart-1", &widget(2)).await.unwrap();
        assert!(result.reservation_id.starts_with("RES-"));
        assert_eq!(service.reservation_count(), 1);
        assert_eq!(service.stock("SKU-001"), 3);

        service.release(&result.reservation_id).await.unwrap();
        assert_eq!(service.reservation_count(), 0);
        assert_eq!(service.stock("SKU-001"), 5);
        assert_eq!(service.release_calls(), 1);
    }

    #[tokio::test]
    async fn test_insufficient_stock_is_rejected() {
        let service = InMemoryInventoryService::new();
        service.set_stock("SKU-001", 1);

        let result = service.reserve("cart-1", &widget(2)).await;
        assert!(matches!(result, Err(ServiceError::Rejected(_))));
        assert_eq!(service.stock("SKU-001"), 1);
    }

    #[tokio::test]
    async fn test_failure_toggles() {
        let service = InMemoryInventoryService::new();
        service.set_stock("SKU-001", 10);
        service.set_fail_on_reserve(true);

        let result = service.reserve("cart-1", &widget(1)).await;
        assert!(matches!(result, Err(ServiceError::Unavailable(_))));
        assert_eq!(service.reservation_count(), 0);

        service.set_fail_on_reserve(false);
        let reservation = service.reserve("cart-1", &widget(1)).await.unwrap();
        service.set_fail_on_release(true);
        assert!(service.release(&reservation.reservation_id).await.is_err());
        assert!(service.has_reservation(&reservation.reservation_id));
    }

    #[tokio::test]
    async fn test_sequential_reservation_ids() {
        let service = InMemoryInventoryService::new();

        let r1 = service.reserve("cart-1", &[]).await.unwrap();
        let r2 = service.reserve("cart-2", &[]).await.unwrap();

        assert_eq!(r1.reservation_id, "RES-0001");
        assert_eq!(r2.reservation_id, "RES-0002");
    }

    #[test]
    fn test_line_total() {
        assert_eq!(OrderLine::new("SKU-001", 3, 1250).total_cents(), 3750);
    }
}
