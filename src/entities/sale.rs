use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, Set};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Sale transaction header.
///
/// Totals are always recomputed from the line items inside the creating
/// transaction; `total_amount = subtotal + tax_amount` holds for every
/// persisted row. Voiding is terminal and keeps the row plus its lines.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sales")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub sale_number: String,
    pub receipt_number: String,
    pub status: SaleStatus,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub subtotal: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub tax_amount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub total_amount: Decimal,
    pub payment_method: String,
    #[sea_orm(column_type = "Json", nullable)]
    pub customer_info: Option<Json>,
    pub cashier_id: Uuid,
    #[sea_orm(nullable)]
    pub voided_at: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub voided_by: Option<Uuid>,
    #[sea_orm(nullable)]
    pub void_reason: Option<String>,
    #[sea_orm(nullable)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::sale_line::Entity")]
    SaleLines,
}

impl Related<super::sale_line::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SaleLines.def()
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

/// Sale lifecycle. Transitions only run pending to completed to voided;
/// a pending sale that fails is rolled back, never persisted as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
pub enum SaleStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "voided")]
    Voided,
}

impl SaleStatus {
    /// Only completed sales may be voided.
    pub fn can_be_voided(&self) -> bool {
        matches!(self, SaleStatus::Completed)
    }
}

impl fmt::Display for SaleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SaleStatus::Pending => "pending",
            SaleStatus::Completed => "completed",
            SaleStatus::Voided => "voided",
        };
        write!(f, "{}", s)
    }
}
