use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Cloneable handle services use to publish events after commit.
///
/// Publishing is best effort: a full or closed channel never fails the
/// business operation that produced the event.
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

// Events emitted by the sale and inventory services once their transaction
// has committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    SaleCompleted {
        sale_id: Uuid,
        sale_number: String,
        total_amount: Decimal,
        line_count: usize,
        cashier_id: Uuid,
    },
    SaleVoided {
        sale_id: Uuid,
        sale_number: String,
        reason: String,
        voided_by: Uuid,
    },
    StockReceived {
        product_id: Uuid,
        quantity: i32,
        new_on_hand: i32,
    },
    StockAdjusted {
        product_id: Uuid,
        quantity_change: i32,
        old_on_hand: i32,
        new_on_hand: i32,
        movement_id: Uuid,
    },
    StockReserved {
        product_id: Uuid,
        quantity: i32,
        reference_id: Uuid,
    },
    StockReleased {
        product_id: Uuid,
        quantity: i32,
        reference_id: Uuid,
    },
    LowStock {
        product_id: Uuid,
        quantity_on_hand: i32,
        reorder_point: i32,
    },
}

// Drains the event channel and dispatches each event to its handler.
// Runs until every sender has been dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match event {
            Event::SaleCompleted {
                sale_id,
                sale_number,
                total_amount,
                line_count,
                cashier_id,
            } => {
                if let Err(e) = handle_sale_completed(
                    sale_id,
                    &sale_number,
                    total_amount,
                    line_count,
                    cashier_id,
                )
                .await
                {
                    error!(
                        "Failed to handle sale completed event: sale_id={}, error={}",
                        sale_id, e
                    );
                }
            }
            Event::SaleVoided {
                sale_id,
                sale_number,
                reason,
                voided_by,
            } => {
                if let Err(e) = handle_sale_voided(sale_id, &sale_number, &reason, voided_by).await
                {
                    error!(
                        "Failed to handle sale voided event: sale_id={}, error={}",
                        sale_id, e
                    );
                }
            }
            Event::StockReceived {
                product_id,
                quantity,
                new_on_hand,
            } => {
                info!(
                    "Stock received: product={}, quantity={}, on_hand={}",
                    product_id, quantity, new_on_hand
                );
            }
            Event::StockAdjusted {
                product_id,
                quantity_change,
                old_on_hand,
                new_on_hand,
                movement_id,
            } => {
                info!(
                    "Stock adjusted: product={}, change={}, {} -> {}, movement={}",
                    product_id, quantity_change, old_on_hand, new_on_hand, movement_id
                );
            }
            Event::StockReserved {
                product_id,
                quantity,
                reference_id,
            } => {
                info!(
                    "Stock reserved: product={}, quantity={}, reference={}",
                    product_id, quantity, reference_id
                );
            }
            Event::StockReleased {
                product_id,
                quantity,
                reference_id,
            } => {
                info!(
                    "Stock released: product={}, quantity={}, reference={}",
                    product_id, quantity, reference_id
                );
            }
            Event::LowStock {
                product_id,
                quantity_on_hand,
                reorder_point,
            } => {
                if let Err(e) =
                    handle_low_stock(product_id, quantity_on_hand, reorder_point).await
                {
                    error!(
                        "Failed to handle low stock event: product_id={}, error={}",
                        product_id, e
                    );
                }
            }
        }
    }

    warn!("Event processing loop has ended");
}

// Handler functions for specific events

async fn handle_sale_completed(
    sale_id: Uuid,
    sale_number: &str,
    total_amount: Decimal,
    line_count: usize,
    cashier_id: Uuid,
) -> Result<(), String> {
    // Receipt printing or till display integration would hang off this.
    info!(
        "Sale completed: id={}, number={}, total={}, lines={}, cashier={}",
        sale_id, sale_number, total_amount, line_count, cashier_id
    );
    Ok(())
}

async fn handle_sale_voided(
    sale_id: Uuid,
    sale_number: &str,
    reason: &str,
    voided_by: Uuid,
) -> Result<(), String> {
    info!(
        "Sale voided: id={}, number={}, reason={}, by={}",
        sale_id, sale_number, reason, voided_by
    );
    Ok(())
}

async fn handle_low_stock(
    product_id: Uuid,
    quantity_on_hand: i32,
    reorder_point: i32,
) -> Result<(), String> {
    warn!(
        "Low stock: product={}, on_hand={}, reorder_point={}",
        product_id, quantity_on_hand, reorder_point
    );
    Ok(())
}
