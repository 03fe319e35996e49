//! Order placement: the reference workflow.
//!
//! Stock is checked for every line in parallel (read-only), then the cart's
//! stock is reserved, payment is authorized and the order is created. A
//! failure releases the reservation and voids the authorization, newest
//! first.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::WorkflowContext;
use crate::error::Result;
use crate::registry::Workflow;
use crate::services::{
    Authorization, InventoryService, NewOrder, OrderLine, OrderService, PaymentService,
    Reservation,
};
use crate::step::{Step, StepError, StepOutput};

/// Registered workflow name.
pub const ORDER_PLACEMENT: &str = "order-placement";

pub const STEP_CHECK_STOCK: &str = "check-stock";
pub const STEP_RESERVE_INVENTORY: &str = "reserve-inventory";
pub const STEP_AUTHORIZE_PAYMENT: &str = "authorize-payment";
pub const STEP_CREATE_ORDER: &str = "create-order";

/// Workflow input: a cart to turn into an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub cart_id: String,
    pub customer_id: String,
    pub lines: Vec<OrderLine>,
}

impl PlaceOrder {
    pub fn total_cents(&self) -> i64 {
        self.lines.iter().map(OrderLine::total_cents).sum()
    }

    /// Lock key serializing placements of the same cart.
    pub fn lock_key(&self) -> String {
        format!("cart:complete:{}", self.cart_id)
    }
}

/// Workflow output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub order_id: String,
    pub reservation_id: String,
    pub authorization_id: String,
    pub total_cents: i64,
}

/// Verifies one line is in stock. No side effects.
pub struct CheckStockStep {
    inventory: Arc<dyn InventoryService>,
}

#[async_trait]
impl Step for CheckStockStep {
    type Input = OrderLine;
    type Output = u32;

    fn name(&self) -> &str {
        STEP_CHECK_STOCK
    }

    async fn execute(
        &self,
        line: &OrderLine,
        _ctx: &WorkflowContext,
    ) -> std::result::Result<StepOutput<u32>, StepError> {
        let available = self.inventory.available(&line.sku).await?;
        if available < line.quantity {
            return Err(StepError::permanent(format!(
                "{} has {} in stock, {} requested",
                line.sku, available, line.quantity
            )));
        }
        Ok(StepOutput::new(available))
    }
}

/// Input of [`ReserveInventoryStep`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveRequest {
    pub cart_id: String,
    pub lines: Vec<OrderLine>,
}

/// Reserves the cart's stock; compensated by releasing the reservation.
pub struct ReserveInventoryStep {
    inventory: Arc<dyn InventoryService>,
}

#[async_trait]
impl Step for ReserveInventoryStep {
    type Input = ReserveRequest;
    type Output = Reservation;

    fn name(&self) -> &str {
        STEP_RESERVE_INVENTORY
    }

    async fn execute(
        &self,
        request: &ReserveRequest,
        _ctx: &WorkflowContext,
    ) -> std::result::Result<StepOutput<Reservation>, StepError> {
        let reservation = self
            .inventory
            .reserve(&request.cart_id, &request.lines)
            .await?;
        Ok(StepOutput::new(reservation))
    }

    fn compensates(&self) -> bool {
        true
    }

    async fn compensate(
        &self,
        _request: &ReserveRequest,
        reservation: &Reservation,
        _data: Option<&serde_json::Value>,
        _ctx: &WorkflowContext,
    ) -> std::result::Result<(), StepError> {
        self.inventory
            .release(&reservation.reservation_id)
            .await
            .map_err(StepError::from)
    }
}

/// Input of [`AuthorizePaymentStep`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub customer_id: String,
    pub amount_cents: i64,
}

/// Places a hold on the customer's funds; compensated by voiding it.
pub struct AuthorizePaymentStep {
    payment: Arc<dyn PaymentService>,
}

#[async_trait]
impl Step for AuthorizePaymentStep {
    type Input = PaymentRequest;
    type Output = Authorization;

    fn name(&self) -> &str {
        STEP_AUTHORIZE_PAYMENT
    }

    async fn execute(
        &self,
        request: &PaymentRequest,
        _ctx: &WorkflowContext,
    ) -> std::result::Result<StepOutput<Authorization>, StepError> {
        let authorization = self
            .payment
            .authorize(&request.customer_id, request.amount_cents)
            .await?;
        let hold = serde_json::json!({ "authorization_id": authorization.authorization_id });
        Ok(StepOutput::new(authorization).with_compensation_data(hold))
    }

    fn compensates(&self) -> bool {
        true
    }

    async fn compensate(
        &self,
        _request: &PaymentRequest,
        authorization: &Authorization,
        data: Option<&serde_json::Value>,
        _ctx: &WorkflowContext,
    ) -> std::result::Result<(), StepError> {
        let authorization_id = data
            .and_then(|hold| hold["authorization_id"].as_str())
            .unwrap_or(&authorization.authorization_id);
        self.payment
            .void(authorization_id)
            .await
            .map_err(StepError::from)
    }
}

/// Records the order. Last step, so it has nothing to compensate.
pub struct CreateOrderStep {
    orders: Arc<dyn OrderService>,
}

#[async_trait]
impl Step for CreateOrderStep {
    type Input = NewOrder;
    type Output = String;

    fn name(&self) -> &str {
        STEP_CREATE_ORDER
    }

    async fn execute(
        &self,
        order: &NewOrder,
        _ctx: &WorkflowContext,
    ) -> std::result::Result<StepOutput<String>, StepError> {
        Ok(StepOutput::new(self.orders.create_order(order).await?))
    }
}

/// The order placement workflow.
pub struct OrderPlacementWorkflow {
    check_stock: Arc<CheckStockStep>,
    reserve_inventory: Arc<ReserveInventoryStep>,
    authorize_payment: Arc<AuthorizePaymentStep>,
    create_order: Arc<CreateOrderStep>,
}

impl OrderPlacementWorkflow {
    pub fn new(
        inventory: Arc<dyn InventoryService>,
        payment: Arc<dyn PaymentService>,
        orders: Arc<dyn OrderService>,
    ) -> Self {
        Self {
            check_stock: Arc::new(CheckStockStep {
                inventory: Arc::clone(&inventory),
            }),
            reserve_inventory: Arc::new(ReserveInventoryStep { inventory }),
            authorize_payment: Arc::new(AuthorizePaymentStep { payment }),
            create_order: Arc::new(CreateOrderStep { orders }),
        }
    }
}

#[async_trait]
impl Workflow for OrderPlacementWorkflow {
    type Input = PlaceOrder;
    type Output = PlacedOrder;

    async fn run(&self, input: PlaceOrder, ctx: &WorkflowContext) -> Result<PlacedOrder> {
        for chunk in input.lines.chunks(ctx.parallel_limit().max(1)) {
            let checks = chunk
                .iter()
                .map(|line| ctx.run_step(&self.check_stock, line.clone()))
                .collect();
            ctx.parallel(checks).await?;
        }

        let reservation = ctx
            .run_step(
                &self.reserve_inventory,
                ReserveRequest {
                    cart_id: input.cart_id.clone(),
                    lines: input.lines.clone(),
                },
            )
            .await?;

        let total_cents = input.total_cents();
        let authorization = ctx
            .run_step(
                &self.authorize_payment,
                PaymentRequest {
                    customer_id: input.customer_id.clone(),
                    amount_cents: total_cents,
                },
            )
            .await?;

        let order_id = ctx
            .run_step(
                &self.create_order,
                NewOrder {
                    cart_id: input.cart_id,
                    customer_id: input.customer_id,
                    lines: input.lines,
                    reservation_id: reservation.reservation_id.clone(),
                    authorization_id: authorization.authorization_id.clone(),
                    total_cents,
                },
            )
            .await?;

        Ok(PlacedOrder {
            order_id,
            reservation_id: reservation.reservation_id,
            authorization_id: authorization.authorization_id,
            total_cents,
        })
    }
}
