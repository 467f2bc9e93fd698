use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, Set};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Ledger entry recording a single quantity change for a product.
///
/// Rows are immutable once confirmed; only the confirmation flag may flip
/// before an entry is applied. `quantity_after = quantity_before +
/// quantity_change` always, and consecutive confirmed entries for a product
/// chain: each `quantity_before` equals the previous `quantity_after`.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "stock_movements")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub product_id: Uuid,
    #[sea_orm(nullable)]
    pub variant_id: Option<Uuid>,
    pub movement_type: MovementKind,
    /// Magnitude of the movement, always positive.
    pub quantity: i32,
    /// Signed effect on on-hand. Zero for reservation bookkeeping entries.
    pub quantity_change: i32,
    pub quantity_before: i32,
    pub quantity_after: i32,
    pub reference_type: String,
    #[sea_orm(nullable)]
    pub reference_id: Option<Uuid>,
    pub movement_date: DateTime<Utc>,
    #[sea_orm(nullable)]
    pub user_id: Option<Uuid>,
    pub is_confirmed: bool,
    #[sea_orm(nullable)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
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

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;

        if insert {
            if let ActiveValue::NotSet = active_model.created_at {
                active_model.created_at = Set(Utc::now());
            }
        }

        Ok(active_model)
    }
}

/// Semantic cause of a stock movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum MovementKind {
    #[sea_orm(string_value = "initial_stock")]
    InitialStock,
    #[sea_orm(string_value = "purchase")]
    Purchase,
    #[sea_orm(string_value = "sale")]
    Sale,
    #[sea_orm(string_value = "return_from_customer")]
    ReturnFromCustomer,
    #[sea_orm(string_value = "adjustment")]
    Adjustment,
    #[sea_orm(string_value = "transfer_in")]
    TransferIn,
    #[sea_orm(string_value = "transfer_out")]
    TransferOut,
    #[sea_orm(string_value = "damaged")]
    Damaged,
    #[sea_orm(string_value = "expired")]
    Expired,
    #[sea_orm(string_value = "theft")]
    Theft,
    #[sea_orm(string_value = "reservation")]
    Reservation,
    #[sea_orm(string_value = "release_reservation")]
    ReleaseReservation,
    #[sea_orm(string_value = "void_restore")]
    VoidRestore,
}

impl fmt::Display for MovementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MovementKind::InitialStock => "initial_stock",
            MovementKind::Purchase => "purchase",
            MovementKind::Sale => "sale",
            MovementKind::ReturnFromCustomer => "return_from_customer",
            MovementKind::Adjustment => "adjustment",
            MovementKind::TransferIn => "transfer_in",
            MovementKind::TransferOut => "transfer_out",
            MovementKind::Damaged => "damaged",
            MovementKind::Expired => "expired",
            MovementKind::Theft => "theft",
            MovementKind::Reservation => "reservation",
            MovementKind::ReleaseReservation => "release_reservation",
            MovementKind::VoidRestore => "void_restore",
        };
        write!(f, "{}", s)
    }
}

/// Typed pointer to the record that caused a movement.
///
/// Persisted as the `reference_type`/`reference_id` column pair. Variants
/// without a causing record store a NULL id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovementReference {
    Sale(Uuid),
    SaleVoid(Uuid),
    PurchaseReceipt(Uuid),
    Reservation(Uuid),
    ManualAdjustment,
    InitialStock,
}

impl MovementReference {
    pub fn as_columns(&self) -> (&'static str, Option<Uuid>) {
        match self {
            MovementReference::Sale(id) => ("sale", Some(*id)),
            MovementReference::SaleVoid(id) => ("sale_void", Some(*id)),
            MovementReference::PurchaseReceipt(id) => ("purchase_receipt", Some(*id)),
            MovementReference::Reservation(id) => ("reservation", Some(*id)),
            MovementReference::ManualAdjustment => ("manual_adjustment", None),
            MovementReference::InitialStock => ("initial_stock", None),
        }
    }

    /// Rebuilds the typed reference from its persisted columns. Returns
    /// `None` for an unknown type tag or a tagged variant missing its id.
    pub fn from_columns(reference_type: &str, reference_id: Option<Uuid>) -> Option<Self> {
        match (reference_type, reference_id) {
            ("sale", Some(id)) => Some(MovementReference::Sale(id)),
            ("sale_void", Some(id)) => Some(MovementReference::SaleVoid(id)),
            ("purchase_receipt", Some(id)) => Some(MovementReference::PurchaseReceipt(id)),
            ("reservation", Some(id)) => Some(MovementReference::Reservation(id)),
            ("manual_adjustment", _) => Some(MovementReference::ManualAdjustment),
            ("initial_stock", _) => Some(MovementReference::InitialStock),
            _ => None,
        }
    }
}

impl Model {
    pub fn reference(&self) -> Option<MovementReference> {
        MovementReference::from_columns(&self.reference_type, self.reference_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn movement_reference_round_trips_through_columns() {
        let sale_id = Uuid::new_v4();
        for reference in [
            MovementReference::Sale(sale_id),
            MovementReference::SaleVoid(sale_id),
            MovementReference::PurchaseReceipt(sale_id),
            MovementReference::Reservation(sale_id),
            MovementReference::ManualAdjustment,
            MovementReference::InitialStock,
        ] {
            let (reference_type, reference_id) = reference.as_columns();
            assert_eq!(
                MovementReference::from_columns(reference_type, reference_id),
                Some(reference)
            );
        }
    }

    #[test]
    fn unknown_reference_type_reads_as_none() {
        assert_eq!(
            MovementReference::from_columns("warehouse_transfer", Some(Uuid::new_v4())),
            None
        );
        // a tagged variant without its id is unusable
        assert_eq!(MovementReference::from_columns("sale", None), None);
    }

    #[test]
    fn movement_kind_display_matches_stored_value() {
        assert_eq!(MovementKind::Sale.to_string(), "sale");
        assert_eq!(MovementKind::VoidRestore.to_string(), "void_restore");
        assert_eq!(
            MovementKind::ReleaseReservation.to_string(),
            "release_reservation"
        );
    }
}
