use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue, ActiveValue::Set, ConnectionTrait};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Catalog product row backing the SQL catalog adapter.
///
/// Sales never read price or tax from this table after the fact; line items
/// carry their own snapshot taken when the sale was created.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize, Validate)]
#[sea_orm(table_name = "products")]
pub struct Model {
    /// Primary key
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// SKU (Stock Keeping Unit)
    #[sea_orm(unique)]
    #[validate(length(
        min = 1,
        max = 100,
        message = "SKU must be between 1 and 100 characters"
    ))]
    pub sku: String,

    /// Product name
    #[validate(length(
        min = 1,
        max = 255,
        message = "Product name must be between 1 and 255 characters"
    ))]
    pub name: String,

    #[validate(length(max = 2000, message = "Description cannot exceed 2000 characters"))]
    pub description: Option<String>,

    /// Category label snapshotted onto sale lines
    pub category: Option<String>,

    /// Unit sale price
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub unit_price: Decimal,

    /// Tax rate as a decimal (e.g., 0.07 for 7%)
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub tax_rate: Decimal,

    /// Inactive products cannot be sold
    pub is_active: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::inventory_level::Entity")]
    InventoryLevels,
    #[sea_orm(has_many = "super::stock_movement::Entity")]
    StockMovements,
    #[sea_orm(has_many = "super::sale_line::Entity")]
    SaleLines,
}

impl Related<super::inventory_level::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::InventoryLevels.def()
    }
}

impl Related<super::stock_movement::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::StockMovements.def()
    }
}

impl Related<super::sale_line::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SaleLines.def()
    }
}

#[async_trait::async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;

        if insert {
            if let ActiveValue::NotSet = active_model.is_active {
                active_model.is_active = Set(true);
            }

            active_model.created_at = Set(Utc::now());
        }

        active_model.updated_at = Set(Some(Utc::now()));

        let model: Model = active_model.clone().try_into().map_err(|_| {
            DbErr::Custom("Failed to convert ActiveModel to Model for validation".to_string())
        })?;

        if let Err(err) = model.validate() {
            return Err(DbErr::Custom(format!("Validation error: {}", err)));
        }

        Ok(active_model)
    }
}
