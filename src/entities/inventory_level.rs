use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ServiceError;

/// Per-product (optionally per-variant) quantity state.
///
/// `quantity_on_hand = quantity_available + quantity_reserved` holds at rest.
/// Rows are created lazily on the first stock event for a product and are
/// mutated only through the ledger posting path, so every change has a
/// matching movement row.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "inventory_levels")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub product_id: Uuid,
    #[sea_orm(nullable)]
    pub variant_id: Option<Uuid>,
    pub quantity_on_hand: i32,
    pub quantity_available: i32,
    pub quantity_reserved: i32,
    pub minimum_stock_level: i32,
    #[sea_orm(nullable)]
    pub maximum_stock_level: Option<i32>,
    pub reorder_point: i32,
    pub reorder_quantity: i32,
    #[sea_orm(nullable)]
    pub last_movement_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::product::Entity",
        from = "Column::ProductId",
        to = "super::product::Column::Id"
    )]
    Product,
}

impl Related<super::product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Product.def()
    }
}

impl Model {
    /// Zero baseline for a product that has never had a stock event.
    pub fn new(product_id: Uuid, variant_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            product_id,
            variant_id,
            quantity_on_hand: 0,
            quantity_available: 0,
            quantity_reserved: 0,
            minimum_stock_level: 0,
            maximum_stock_level: None,
            reorder_point: 0,
            reorder_quantity: 0,
            last_movement_at: None,
            created_at: now,
            updated_at: Some(now),
        }
    }

    /// Moves `quantity` from available to reserved.
    pub fn reserve(&mut self, quantity: i32) -> Result<(), ServiceError> {
        if self.quantity_available < quantity {
            return Err(ServiceError::InsufficientStock {
                product_id: self.product_id,
                requested: quantity,
                available: self.quantity_available,
            });
        }
        self.quantity_reserved += quantity;
        self.recalculate_available();
        self.last_movement_at = Some(Utc::now());
        Ok(())
    }

    /// Moves `quantity` back from reserved to available.
    pub fn release(&mut self, quantity: i32) -> Result<(), ServiceError> {
        if self.quantity_reserved < quantity {
            return Err(ServiceError::InvalidReservationState {
                product_id: self.product_id,
                requested: quantity,
                reserved: self.quantity_reserved,
            });
        }
        self.quantity_reserved -= quantity;
        self.recalculate_available();
        self.last_movement_at = Some(Utc::now());
        Ok(())
    }

    /// Decrements reserved and on-hand together once goods leave the building.
    pub fn fulfill(&mut self, quantity: i32) -> Result<(), ServiceError> {
        if self.quantity_reserved < quantity {
            return Err(ServiceError::InvalidReservationState {
                product_id: self.product_id,
                requested: quantity,
                reserved: self.quantity_reserved,
            });
        }
        self.quantity_reserved -= quantity;
        self.quantity_on_hand -= quantity;
        self.recalculate_available();
        self.last_movement_at = Some(Utc::now());
        Ok(())
    }

    /// Adds a signed delta to on-hand without touching reserved.
    ///
    /// Used for receipts, adjustments and void restores. Rejects a delta
    /// that would drive on-hand negative unless `allow_negative` is set.
    pub fn apply_direct(&mut self, delta: i32, allow_negative: bool) -> Result<(), ServiceError> {
        let next = self.quantity_on_hand + delta;
        if next < 0 && !allow_negative {
            return Err(ServiceError::NegativeStockRejected {
                product_id: self.product_id,
                on_hand: self.quantity_on_hand,
                change: delta,
            });
        }
        self.quantity_on_hand = next;
        self.recalculate_available();
        self.last_movement_at = Some(Utc::now());
        Ok(())
    }

    pub fn needs_reorder(&self) -> bool {
        self.quantity_on_hand <= self.reorder_point
    }

    fn recalculate_available(&mut self) {
        self.quantity_available = self.quantity_on_hand - self.quantity_reserved;
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        let now = Utc::now();

        if insert {
            if let ActiveValue::NotSet = active_model.created_at {
                active_model.created_at = Set(now);
            }
        }

        active_model.updated_at = Set(Some(now));

        Ok(active_model)
    }
}
