use lazy_static::lazy_static;
use prometheus::{IntCounterVec, Opts};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::db::DbPool;
use crate::entities::inventory_level;
use crate::entities::stock_movement::{self, MovementKind, MovementReference};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::ledger::{self, NewMovement};

lazy_static! {
    static ref INVENTORY_OPERATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "inventory_operations_total",
            "Total inventory operations by type"
        ),
        &["operation"]
    )
    .expect("metric can be created");
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SetInitialStockRequest {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    #[validate(range(min = 1, message = "Initial stock quantity must be positive"))]
    pub quantity: i32,
    pub reorder_point: Option<i32>,
    pub reorder_quantity: Option<i32>,
    pub minimum_stock_level: Option<i32>,
    pub maximum_stock_level: Option<i32>,
    #[validate(length(max = 500))]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReceiveStockRequest {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    #[validate(range(min = 1, message = "Received quantity must be positive"))]
    pub quantity: i32,
    /// Receipt or purchase order this delivery belongs to, when known.
    pub purchase_receipt_id: Option<Uuid>,
    #[validate(length(max = 500))]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AdjustStockRequest {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    /// Signed correction applied to on-hand.
    pub quantity_change: i32,
    #[validate(length(min = 1, max = 500, message = "Adjustment reason is required"))]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ShrinkageRequest {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    #[validate(range(min = 1, message = "Shrinkage quantity must be positive"))]
    pub quantity: i32,
    /// One of the loss kinds: damaged, expired or theft.
    pub kind: MovementKind,
    #[validate(length(max = 500))]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReserveStockRequest {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    #[validate(range(min = 1, message = "Reservation quantity must be positive"))]
    pub quantity: i32,
    /// Record the hold is for, e.g. an order awaiting payment.
    pub reference_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LevelListResponse {
    pub levels: Vec<inventory_level::Model>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MovementListResponse {
    pub movements: Vec<stock_movement::Model>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

/// Stock operations outside the sale path: receiving, corrections,
/// shrinkage and reservation holds. Every mutation goes through the ledger.
#[derive(Clone)]
pub struct InventoryService {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
    allow_negative_stock: bool,
}

impl InventoryService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        allow_negative_stock: bool,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            allow_negative_stock,
        }
    }

    /// Seeds the opening balance for a product and optionally its reorder
    /// thresholds. Posts an initial_stock movement so the chain starts with
    /// an auditable entry.
    #[instrument(skip(self, request), fields(product_id = %request.product_id))]
    pub async fn set_initial_stock(
        &self,
        request: SetInitialStockRequest,
        actor_id: Option<Uuid>,
    ) -> Result<inventory_level::Model, ServiceError> {
        request.validate()?;

        let allow_negative = self.allow_negative_stock;
        let (movement, level) = self
            .db_pool
            .transaction::<_, (stock_movement::Model, inventory_level::Model), ServiceError>(
                move |txn| {
                    Box::pin(async move {
                        // An opening balance only makes sense on a product with
                        // no ledger history; later corrections are adjustments.
                        let mut existing = stock_movement::Entity::find()
                            .filter(stock_movement::Column::ProductId.eq(request.product_id));
                        existing = match request.variant_id {
                            Some(variant) => existing
                                .filter(stock_movement::Column::VariantId.eq(variant)),
                            None => {
                                existing.filter(stock_movement::Column::VariantId.is_null())
                            }
                        };
                        if existing.count(txn).await? > 0 {
                            return Err(ServiceError::InvalidOperation(format!(
                                "Product {} already has stock movements; use an adjustment instead",
                                request.product_id
                            )));
                        }

                        let (movement, level) = ledger::post_movement(
                            txn,
                            NewMovement {
                                product_id: request.product_id,
                                variant_id: request.variant_id,
                                kind: MovementKind::InitialStock,
                                quantity: request.quantity,
                                reference: MovementReference::InitialStock,
                                actor_id,
                                notes: request.notes.clone(),
                            },
                            allow_negative,
                        )
                        .await?;

                        let has_thresholds = request.reorder_point.is_some()
                            || request.reorder_quantity.is_some()
                            || request.minimum_stock_level.is_some()
                            || request.maximum_stock_level.is_some();
                        let level = if has_thresholds {
                            let mut active: inventory_level::ActiveModel = level.into();
                            if let Some(reorder_point) = request.reorder_point {
                                active.reorder_point = Set(reorder_point);
                            }
                            if let Some(reorder_quantity) = request.reorder_quantity {
                                active.reorder_quantity = Set(reorder_quantity);
                            }
                            if let Some(minimum) = request.minimum_stock_level {
                                active.minimum_stock_level = Set(minimum);
                            }
                            if let Some(maximum) = request.maximum_stock_level {
                                active.maximum_stock_level = Set(Some(maximum));
                            }
                            active.update(txn).await?
                        } else {
                            level
                        };

                        Ok((movement, level))
                    })
                },
            )
            .await
            .map_err(|e| {
                error!("Transaction failed while setting initial stock: {}", e);
                ServiceError::from(e)
            })?;

        INVENTORY_OPERATIONS
            .with_label_values(&["set_initial_stock"])
            .inc();
        info!(
            product_id = %level.product_id,
            quantity = movement.quantity,
            on_hand = level.quantity_on_hand,
            "Initial stock recorded"
        );
        self.emit(Event::StockReceived {
            product_id: level.product_id,
            quantity: movement.quantity,
            new_on_hand: level.quantity_on_hand,
        })
        .await;
        self.maybe_emit_low_stock(&level).await;

        Ok(level)
    }

    /// Books received goods into stock against an optional purchase receipt.
    #[instrument(skip(self, request), fields(product_id = %request.product_id))]
    pub async fn receive_stock(
        &self,
        request: ReceiveStockRequest,
        actor_id: Option<Uuid>,
    ) -> Result<stock_movement::Model, ServiceError> {
        request.validate()?;

        // Deliveries without a known receipt still get a receipt-shaped
        // reference, so later paperwork can be attached to the minted id.
        let receipt_id = request.purchase_receipt_id.unwrap_or_else(Uuid::new_v4);
        let reference = MovementReference::PurchaseReceipt(receipt_id);
        let allow_negative = self.allow_negative_stock;
        let (movement, level) = self
            .db_pool
            .transaction::<_, (stock_movement::Model, inventory_level::Model), ServiceError>(
                move |txn| {
                    Box::pin(async move {
                        ledger::post_movement(
                            txn,
                            NewMovement {
                                product_id: request.product_id,
                                variant_id: request.variant_id,
                                kind: MovementKind::Purchase,
                                quantity: request.quantity,
                                reference,
                                actor_id,
                                notes: request.notes.clone(),
                            },
                            allow_negative,
                        )
                        .await
                    })
                },
            )
            .await
            .map_err(|e| {
                error!("Transaction failed while receiving stock: {}", e);
                ServiceError::from(e)
            })?;

        INVENTORY_OPERATIONS
            .with_label_values(&["receive_stock"])
            .inc();
        info!(
            product_id = %movement.product_id,
            quantity = movement.quantity,
            on_hand = level.quantity_on_hand,
            "Stock received"
        );
        self.emit(Event::StockReceived {
            product_id: movement.product_id,
            quantity: movement.quantity,
            new_on_hand: level.quantity_on_hand,
        })
        .await;

        Ok(movement)
    }

    /// Applies a signed manual correction, e.g. after a cycle count.
    #[instrument(skip(self, request), fields(product_id = %request.product_id))]
    pub async fn adjust_stock(
        &self,
        request: AdjustStockRequest,
        actor_id: Option<Uuid>,
    ) -> Result<stock_movement::Model, ServiceError> {
        request.validate()?;

        let allow_negative = self.allow_negative_stock;
        let (movement, level) = self
            .db_pool
            .transaction::<_, (stock_movement::Model, inventory_level::Model), ServiceError>(
                move |txn| {
                    Box::pin(async move {
                        ledger::post_movement(
                            txn,
                            NewMovement {
                                product_id: request.product_id,
                                variant_id: request.variant_id,
                                kind: MovementKind::Adjustment,
                                quantity: request.quantity_change,
                                reference: MovementReference::ManualAdjustment,
                                actor_id,
                                notes: Some(request.reason.clone()),
                            },
                            allow_negative,
                        )
                        .await
                    })
                },
            )
            .await
            .map_err(|e| {
                error!("Transaction failed while adjusting stock: {}", e);
                ServiceError::from(e)
            })?;

        INVENTORY_OPERATIONS
            .with_label_values(&["adjust_stock"])
            .inc();
        info!(
            product_id = %movement.product_id,
            quantity_change = movement.quantity_change,
            on_hand = level.quantity_on_hand,
            "Stock adjusted"
        );
        self.emit(Event::StockAdjusted {
            product_id: movement.product_id,
            quantity_change: movement.quantity_change,
            old_on_hand: movement.quantity_before,
            new_on_hand: movement.quantity_after,
            movement_id: movement.id,
        })
        .await;
        self.maybe_emit_low_stock(&level).await;

        Ok(movement)
    }

    /// Writes off lost goods under one of the shrinkage kinds.
    #[instrument(skip(self, request), fields(product_id = %request.product_id, kind = %request.kind))]
    pub async fn record_shrinkage(
        &self,
        request: ShrinkageRequest,
        actor_id: Option<Uuid>,
    ) -> Result<stock_movement::Model, ServiceError> {
        request.validate()?;
        match request.kind {
            MovementKind::Damaged | MovementKind::Expired | MovementKind::Theft => {}
            other => {
                return Err(ServiceError::InvalidOperation(format!(
                    "{} is not a shrinkage movement type",
                    other
                )));
            }
        }

        let allow_negative = self.allow_negative_stock;
        let (movement, level) = self
            .db_pool
            .transaction::<_, (stock_movement::Model, inventory_level::Model), ServiceError>(
                move |txn| {
                    Box::pin(async move {
                        ledger::post_movement(
                            txn,
                            NewMovement {
                                product_id: request.product_id,
                                variant_id: request.variant_id,
                                kind: request.kind,
                                quantity: -request.quantity,
                                reference: MovementReference::ManualAdjustment,
                                actor_id,
                                notes: request.notes.clone(),
                            },
                            allow_negative,
                        )
                        .await
                    })
                },
            )
            .await
            .map_err(|e| {
                error!("Transaction failed while recording shrinkage: {}", e);
                ServiceError::from(e)
            })?;

        INVENTORY_OPERATIONS
            .with_label_values(&["record_shrinkage"])
            .inc();
        info!(
            product_id = %movement.product_id,
            kind = %movement.movement_type,
            quantity = movement.quantity,
            on_hand = level.quantity_on_hand,
            "Shrinkage recorded"
        );
        self.emit(Event::StockAdjusted {
            product_id: movement.product_id,
            quantity_change: movement.quantity_change,
            old_on_hand: movement.quantity_before,
            new_on_hand: movement.quantity_after,
            movement_id: movement.id,
        })
        .await;
        self.maybe_emit_low_stock(&level).await;

        Ok(movement)
    }

    /// Earmarks stock for an external record without taking it off hand.
    #[instrument(skip(self, request), fields(product_id = %request.product_id))]
    pub async fn reserve_stock(
        &self,
        request: ReserveStockRequest,
        actor_id: Option<Uuid>,
    ) -> Result<stock_movement::Model, ServiceError> {
        request.validate()?;
        self.post_reservation(request, actor_id, MovementKind::Reservation)
            .await
    }

    /// Returns previously reserved stock to the available pool.
    #[instrument(skip(self, request), fields(product_id = %request.product_id))]
    pub async fn release_stock(
        &self,
        request: ReserveStockRequest,
        actor_id: Option<Uuid>,
    ) -> Result<stock_movement::Model, ServiceError> {
        request.validate()?;
        self.post_reservation(request, actor_id, MovementKind::ReleaseReservation)
            .await
    }

    async fn post_reservation(
        &self,
        request: ReserveStockRequest,
        actor_id: Option<Uuid>,
        kind: MovementKind,
    ) -> Result<stock_movement::Model, ServiceError> {
        let allow_negative = self.allow_negative_stock;
        let reference_id = request.reference_id;
        let (movement, _level) = self
            .db_pool
            .transaction::<_, (stock_movement::Model, inventory_level::Model), ServiceError>(
                move |txn| {
                    Box::pin(async move {
                        ledger::post_movement(
                            txn,
                            NewMovement {
                                product_id: request.product_id,
                                variant_id: request.variant_id,
                                kind,
                                quantity: request.quantity,
                                reference: MovementReference::Reservation(request.reference_id),
                                actor_id,
                                notes: None,
                            },
                            allow_negative,
                        )
                        .await
                    })
                },
            )
            .await
            .map_err(|e| {
                error!("Transaction failed while posting reservation: {}", e);
                ServiceError::from(e)
            })?;

        let operation = match kind {
            MovementKind::Reservation => "reserve_stock",
            _ => "release_stock",
        };
        INVENTORY_OPERATIONS.with_label_values(&[operation]).inc();
        info!(
            product_id = %movement.product_id,
            quantity = movement.quantity,
            kind = %movement.movement_type,
            reference_id = %reference_id,
            "Reservation movement posted"
        );
        let event = match kind {
            MovementKind::Reservation => Event::StockReserved {
                product_id: movement.product_id,
                quantity: movement.quantity,
                reference_id,
            },
            _ => Event::StockReleased {
                product_id: movement.product_id,
                quantity: movement.quantity,
                reference_id,
            },
        };
        self.emit(event).await;

        Ok(movement)
    }

    /// Current level for a product, `Ok(None)` if it has never had stock.
    pub async fn get_level(
        &self,
        product_id: Uuid,
        variant_id: Option<Uuid>,
    ) -> Result<Option<inventory_level::Model>, ServiceError> {
        let mut query = inventory_level::Entity::find()
            .filter(inventory_level::Column::ProductId.eq(product_id));
        query = match variant_id {
            Some(variant) => query.filter(inventory_level::Column::VariantId.eq(variant)),
            None => query.filter(inventory_level::Column::VariantId.is_null()),
        };
        Ok(query.one(self.db_pool.as_ref()).await?)
    }

    pub async fn list_levels(
        &self,
        page: u64,
        per_page: u64,
    ) -> Result<LevelListResponse, ServiceError> {
        let page = page.max(1);
        let paginator = inventory_level::Entity::find()
            .order_by_asc(inventory_level::Column::ProductId)
            .paginate(self.db_pool.as_ref(), per_page);

        let total = paginator.num_items().await?;
        let levels = paginator.fetch_page(page - 1).await?;

        Ok(LevelListResponse {
            levels,
            total,
            page,
            per_page,
        })
    }

    /// Confirmed ledger entries for a product, newest first.
    pub async fn movement_history(
        &self,
        product_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<MovementListResponse, ServiceError> {
        let page = page.max(1);
        let paginator = stock_movement::Entity::find()
            .filter(stock_movement::Column::ProductId.eq(product_id))
            .filter(stock_movement::Column::IsConfirmed.eq(true))
            .order_by_desc(stock_movement::Column::CreatedAt)
            .paginate(self.db_pool.as_ref(), per_page);

        let total = paginator.num_items().await?;
        let movements = paginator.fetch_page(page - 1).await?;

        Ok(MovementListResponse {
            movements,
            total,
            page,
            per_page,
        })
    }

    /// Levels at or below their reorder point. Untracked products
    /// (reorder_point zero) are excluded.
    pub async fn low_stock_levels(&self) -> Result<Vec<inventory_level::Model>, ServiceError> {
        let levels = inventory_level::Entity::find()
            .filter(inventory_level::Column::ReorderPoint.gt(0))
            .filter(
                Expr::col(inventory_level::Column::QuantityOnHand)
                    .lte(Expr::col(inventory_level::Column::ReorderPoint)),
            )
            .order_by_asc(inventory_level::Column::QuantityOnHand)
            .all(self.db_pool.as_ref())
            .await?;
        Ok(levels)
    }

    async fn emit(&self, event: Event) {
        if let Err(e) = self.event_sender.send(event).await {
            warn!("Failed to send inventory event: {}", e);
        }
    }

    async fn maybe_emit_low_stock(&self, level: &inventory_level::Model) {
        if level.reorder_point > 0 && level.needs_reorder() {
            self.emit(Event::LowStock {
                product_id: level.product_id,
                quantity_on_hand: level.quantity_on_hand,
                reorder_point: level.reorder_point,
            })
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::DatabaseConnection;
    use tokio::sync::mpsc;

    fn disconnected_service() -> InventoryService {
        let (tx, _rx) = mpsc::channel(8);
        InventoryService::new(
            Arc::new(DatabaseConnection::Disconnected),
            Arc::new(EventSender::new(tx)),
            false,
        )
    }

    #[tokio::test]
    async fn shrinkage_rejects_non_loss_kinds() {
        let service = disconnected_service();
        let err = service
            .record_shrinkage(
                ShrinkageRequest {
                    product_id: Uuid::new_v4(),
                    variant_id: None,
                    quantity: 1,
                    kind: MovementKind::Sale,
                    notes: None,
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn requests_with_non_positive_quantities_fail_validation() {
        let service = disconnected_service();

        let err = service
            .receive_stock(
                ReceiveStockRequest {
                    product_id: Uuid::new_v4(),
                    variant_id: None,
                    quantity: 0,
                    purchase_receipt_id: None,
                    notes: None,
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::ValidationError(_)));

        let err = service
            .reserve_stock(
                ReserveStockRequest {
                    product_id: Uuid::new_v4(),
                    variant_id: None,
                    quantity: -2,
                    reference_id: Uuid::new_v4(),
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::ValidationError(_)));
    }

    #[tokio::test]
    async fn adjustment_requires_a_reason() {
        let service = disconnected_service();
        let err = service
            .adjust_stock(
                AdjustStockRequest {
                    product_id: Uuid::new_v4(),
                    variant_id: None,
                    quantity_change: 3,
                    reason: String::new(),
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::ValidationError(_)));
    }
}
