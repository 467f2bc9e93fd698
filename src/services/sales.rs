use chrono::{NaiveDate, Utc};
use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, Opts};
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseTransaction, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, SqlErr, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::catalog::{CatalogAdapter, ProductSnapshot};
use crate::db::DbPool;
use crate::entities::sale::{self, SaleStatus};
use crate::entities::sale_line;
use crate::entities::stock_movement::{MovementKind, MovementReference};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::ledger::{self, NewMovement};

const SALE_NUMBER_PREFIX: &str = "TXN";
const RECEIPT_NUMBER_PREFIX: &str = "RCP";
/// Attempts per create before a retryable failure surfaces to the caller.
const MAX_CREATE_ATTEMPTS: u32 = 3;

lazy_static! {
    static ref SALES_CREATED: IntCounter =
        IntCounter::new("sales_created_total", "Total sales completed")
            .expect("metric can be created");
    static ref SALES_VOIDED: IntCounter =
        IntCounter::new("sales_voided_total", "Total sales voided")
            .expect("metric can be created");
    static ref SALE_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("sale_failures_total", "Total failed sale operations"),
        &["error_type"]
    )
    .expect("metric can be created");
    static ref SALE_RETRIES: IntCounter = IntCounter::new(
        "sale_create_retries_total",
        "Sale creations retried after a retryable failure"
    )
    .expect("metric can be created");
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SaleLineRequest {
    pub product_id: Uuid,
    #[validate(range(min = 1, message = "Line quantity must be positive"))]
    pub quantity: i32,
    /// Price charged at the till. May differ from the catalog price.
    pub unit_price: Decimal,
}

/// Free-form customer snapshot stored on the sale.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CustomerInfo {
    #[validate(length(max = 255))]
    pub name: Option<String>,
    #[validate(email)]
    pub email: Option<String>,
    #[validate(length(max = 50))]
    pub phone: Option<String>,
    /// Opaque reference into the surrounding school records.
    pub school_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateSaleRequest {
    #[validate(length(min = 1, message = "Sale must contain at least one line"))]
    pub lines: Vec<SaleLineRequest>,
    #[validate(length(min = 1, max = 50))]
    pub payment_method: String,
    pub customer_info: Option<CustomerInfo>,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
}

/// A sale header together with its ordered line items.
#[derive(Debug, Serialize, Deserialize)]
pub struct SaleDetail {
    pub sale: sale::Model,
    pub lines: Vec<sale_line::Model>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SaleListResponse {
    pub sales: Vec<sale::Model>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

/// Coordinates sale creation and voiding as single units of work.
///
/// Creation validates the cart against the catalog, writes the sale with
/// its lines, posts one ledger movement per line and finalizes totals and
/// status before commit. Any failure rolls the whole unit back. Voiding
/// restores stock through new ledger entries and never deletes history.
#[derive(Clone)]
pub struct SaleService {
    db_pool: Arc<DbPool>,
    catalog: Arc<dyn CatalogAdapter>,
    event_sender: Arc<EventSender>,
    allow_negative_stock: bool,
}

impl SaleService {
    pub fn new(
        db_pool: Arc<DbPool>,
        catalog: Arc<dyn CatalogAdapter>,
        event_sender: Arc<EventSender>,
        allow_negative_stock: bool,
    ) -> Self {
        Self {
            db_pool,
            catalog,
            event_sender,
            allow_negative_stock,
        }
    }

    #[instrument(skip(self, request), fields(lines = request.lines.len(), cashier_id = %cashier_id))]
    pub async fn create_sale(
        &self,
        request: CreateSaleRequest,
        cashier_id: Uuid,
    ) -> Result<SaleDetail, ServiceError> {
        request.validate().map_err(|e| {
            SALE_FAILURES
                .with_label_values(&["validation_error"])
                .inc();
            ServiceError::from(e)
        })?;
        for line in &request.lines {
            line.validate().map_err(|e| {
                SALE_FAILURES
                    .with_label_values(&["validation_error"])
                    .inc();
                ServiceError::from(e)
            })?;
            if line.unit_price < Decimal::ZERO {
                SALE_FAILURES
                    .with_label_values(&["validation_error"])
                    .inc();
                return Err(ServiceError::ValidationError(format!(
                    "Unit price for product {} cannot be negative",
                    line.product_id
                )));
            }
        }
        if let Some(info) = &request.customer_info {
            info.validate().map_err(|e| {
                SALE_FAILURES
                    .with_label_values(&["validation_error"])
                    .inc();
                ServiceError::from(e)
            })?;
        }

        let snapshots = match self.pre_validate(&request).await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                SALE_FAILURES.with_label_values(&[failure_label(&e)]).inc();
                return Err(e);
            }
        };

        let mut attempt = 1;
        loop {
            match self
                .try_create_sale(&request, &snapshots, cashier_id, attempt)
                .await
            {
                Ok(detail) => {
                    SALES_CREATED.inc();
                    info!(
                        sale_id = %detail.sale.id,
                        sale_number = %detail.sale.sale_number,
                        total_amount = %detail.sale.total_amount,
                        lines = detail.lines.len(),
                        "Sale completed"
                    );
                    if let Err(e) = self
                        .event_sender
                        .send(Event::SaleCompleted {
                            sale_id: detail.sale.id,
                            sale_number: detail.sale.sale_number.clone(),
                            total_amount: detail.sale.total_amount,
                            line_count: detail.lines.len(),
                            cashier_id,
                        })
                        .await
                    {
                        warn!("Failed to send sale completed event: {}", e);
                    }
                    return Ok(detail);
                }
                Err(e) if e.is_retryable() && attempt < MAX_CREATE_ATTEMPTS => {
                    SALE_RETRIES.inc();
                    warn!(attempt, "Sale creation lost to a concurrent writer, retrying: {}", e);
                    attempt += 1;
                }
                Err(e) => {
                    SALE_FAILURES.with_label_values(&[failure_label(&e)]).inc();
                    return Err(e);
                }
            }
        }
    }

    // Read-only fast-fail pass. The ledger post inside the transaction
    // remains the authoritative stock check; a cart can still lose the
    // race between this pass and commit and gets rolled back there.
    async fn pre_validate(
        &self,
        request: &CreateSaleRequest,
    ) -> Result<Vec<ProductSnapshot>, ServiceError> {
        let mut snapshots = Vec::with_capacity(request.lines.len());
        for line in &request.lines {
            let snapshot = self
                .catalog
                .lookup(line.product_id)
                .await?
                .ok_or(ServiceError::ProductNotFound(line.product_id))?;
            if !snapshot.is_active {
                return Err(ServiceError::ProductInactive(line.product_id));
            }
            let available = self.catalog.available_quantity(line.product_id).await?;
            if available < line.quantity {
                return Err(ServiceError::InsufficientStock {
                    product_id: line.product_id,
                    requested: line.quantity,
                    available,
                });
            }
            snapshots.push(snapshot);
        }
        Ok(snapshots)
    }

    async fn try_create_sale(
        &self,
        request: &CreateSaleRequest,
        snapshots: &[ProductSnapshot],
        cashier_id: Uuid,
        attempt: u32,
    ) -> Result<SaleDetail, ServiceError> {
        let txn = self.db_pool.begin().await.map_err(|e| {
            error!("Failed to open sale transaction: {}", e);
            ServiceError::DatabaseError(e)
        })?;

        let today = Utc::now().date_naive();
        let sale_number = next_sale_number(&txn, today, attempt).await?;
        let receipt_number = receipt_number_for(&sale_number);

        let customer_info = match &request.customer_info {
            Some(info) => Some(serde_json::to_value(info).map_err(|e| {
                ServiceError::ValidationError(format!("Could not serialize customer info: {}", e))
            })?),
            None => None,
        };

        let sale_id = Uuid::new_v4();
        let pending = sale::ActiveModel {
            id: Set(sale_id),
            sale_number: Set(sale_number.clone()),
            receipt_number: Set(receipt_number),
            status: Set(SaleStatus::Pending),
            subtotal: Set(Decimal::ZERO),
            tax_amount: Set(Decimal::ZERO),
            total_amount: Set(Decimal::ZERO),
            payment_method: Set(request.payment_method.clone()),
            customer_info: Set(customer_info),
            cashier_id: Set(cashier_id),
            voided_at: Set(None),
            voided_by: Set(None),
            void_reason: Set(None),
            notes: Set(request.notes.clone()),
            ..Default::default()
        };
        let sale_row = pending.insert(&txn).await.map_err(|e| {
            if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
                ServiceError::SaleNumberCollision(sale_number.clone())
            } else {
                ServiceError::DatabaseError(e)
            }
        })?;

        let mut subtotal = Decimal::ZERO;
        let mut tax_total = Decimal::ZERO;
        let mut lines = Vec::with_capacity(request.lines.len());
        for (index, (line, snapshot)) in request.lines.iter().zip(snapshots).enumerate() {
            ledger::post_movement(
                &txn,
                NewMovement {
                    product_id: line.product_id,
                    variant_id: None,
                    kind: MovementKind::Sale,
                    quantity: -line.quantity,
                    reference: MovementReference::Sale(sale_id),
                    actor_id: Some(cashier_id),
                    notes: None,
                },
                self.allow_negative_stock,
            )
            .await?;

            let (line_total, tax_amount) =
                compute_line_amounts(line.quantity, line.unit_price, snapshot.tax_rate);
            let line_row = sale_line::ActiveModel {
                id: Set(Uuid::new_v4()),
                sale_id: Set(sale_id),
                line_number: Set((index + 1) as i32),
                product_id: Set(line.product_id),
                sku: Set(snapshot.sku.clone()),
                name: Set(snapshot.name.clone()),
                category: Set(snapshot.category.clone()),
                quantity: Set(line.quantity),
                unit_price: Set(line.unit_price),
                line_total: Set(line_total),
                tax_rate: Set(snapshot.tax_rate),
                tax_amount: Set(tax_amount),
                inventory_updated: Set(true),
                inventory_updated_at: Set(Some(Utc::now())),
                ..Default::default()
            };
            let stored = line_row.insert(&txn).await?;
            subtotal += line_total;
            tax_total += tax_amount;
            lines.push(stored);
        }

        // Totals come from the rows just written, never from the caller.
        let mut finalize: sale::ActiveModel = sale_row.into();
        finalize.subtotal = Set(subtotal);
        finalize.tax_amount = Set(tax_total);
        finalize.total_amount = Set(subtotal + tax_total);
        finalize.status = Set(SaleStatus::Completed);
        let completed = finalize.update(&txn).await?;

        txn.commit().await.map_err(|e| {
            error!("Failed to commit sale transaction: {}", e);
            ServiceError::DatabaseError(e)
        })?;

        Ok(SaleDetail {
            sale: completed,
            lines,
        })
    }

    #[instrument(skip(self, reason), fields(sale_id = %sale_id, actor_id = %actor_id))]
    pub async fn void_sale(
        &self,
        sale_id: Uuid,
        reason: String,
        actor_id: Uuid,
    ) -> Result<SaleDetail, ServiceError> {
        if reason.trim().is_empty() {
            SALE_FAILURES
                .with_label_values(&["validation_error"])
                .inc();
            return Err(ServiceError::ValidationError(
                "Void reason is required".to_string(),
            ));
        }

        match self.try_void_sale(sale_id, &reason, actor_id).await {
            Ok(detail) => {
                SALES_VOIDED.inc();
                info!(
                    sale_id = %detail.sale.id,
                    sale_number = %detail.sale.sale_number,
                    "Sale voided"
                );
                if let Err(e) = self
                    .event_sender
                    .send(Event::SaleVoided {
                        sale_id: detail.sale.id,
                        sale_number: detail.sale.sale_number.clone(),
                        reason,
                        voided_by: actor_id,
                    })
                    .await
                {
                    warn!("Failed to send sale voided event: {}", e);
                }
                Ok(detail)
            }
            Err(e) => {
                SALE_FAILURES.with_label_values(&[failure_label(&e)]).inc();
                Err(e)
            }
        }
    }

    async fn try_void_sale(
        &self,
        sale_id: Uuid,
        reason: &str,
        actor_id: Uuid,
    ) -> Result<SaleDetail, ServiceError> {
        let txn = self.db_pool.begin().await.map_err(|e| {
            error!("Failed to open void transaction: {}", e);
            ServiceError::DatabaseError(e)
        })?;

        let sale_row = sale::Entity::find_by_id(sale_id)
            .one(&txn)
            .await?
            .ok_or(ServiceError::SaleNotFound(sale_id))?;

        match sale_row.status {
            SaleStatus::Voided => return Err(ServiceError::AlreadyVoided(sale_id)),
            SaleStatus::Completed => {}
            other => {
                return Err(ServiceError::NotVoidable {
                    sale_id,
                    status: other.to_string(),
                });
            }
        }

        let line_rows = sale_line::Entity::find()
            .filter(sale_line::Column::SaleId.eq(sale_id))
            .order_by_asc(sale_line::Column::LineNumber)
            .all(&txn)
            .await?;

        let now = Utc::now();
        let mut lines = Vec::with_capacity(line_rows.len());
        for line in line_rows {
            if !line.inventory_updated {
                lines.push(line);
                continue;
            }

            ledger::post_movement(
                &txn,
                NewMovement {
                    product_id: line.product_id,
                    variant_id: None,
                    kind: MovementKind::VoidRestore,
                    quantity: line.quantity,
                    reference: MovementReference::SaleVoid(sale_id),
                    actor_id: Some(actor_id),
                    notes: None,
                },
                self.allow_negative_stock,
            )
            .await?;

            let mut active: sale_line::ActiveModel = line.into();
            active.inventory_updated = Set(false);
            active.inventory_updated_at = Set(Some(now));
            lines.push(active.update(&txn).await?);
        }

        let mut active: sale::ActiveModel = sale_row.into();
        active.status = Set(SaleStatus::Voided);
        active.voided_at = Set(Some(now));
        active.voided_by = Set(Some(actor_id));
        active.void_reason = Set(Some(reason.to_string()));
        let voided = active.update(&txn).await?;

        txn.commit().await.map_err(|e| {
            error!("Failed to commit void transaction: {}", e);
            ServiceError::DatabaseError(e)
        })?;

        Ok(SaleDetail {
            sale: voided,
            lines,
        })
    }

    pub async fn get_sale(&self, sale_id: Uuid) -> Result<Option<sale::Model>, ServiceError> {
        let sale = sale::Entity::find_by_id(sale_id)
            .one(self.db_pool.as_ref())
            .await?;
        if sale.is_none() {
            info!(sale_id = %sale_id, "Sale not found");
        }
        Ok(sale)
    }

    pub async fn get_sale_with_lines(
        &self,
        sale_id: Uuid,
    ) -> Result<Option<SaleDetail>, ServiceError> {
        let sale = match sale::Entity::find_by_id(sale_id)
            .one(self.db_pool.as_ref())
            .await?
        {
            Some(sale) => sale,
            None => return Ok(None),
        };
        let lines = self.lines_for(sale.id).await?;
        Ok(Some(SaleDetail { sale, lines }))
    }

    pub async fn get_sale_by_number(
        &self,
        sale_number: &str,
    ) -> Result<Option<SaleDetail>, ServiceError> {
        let sale = match sale::Entity::find()
            .filter(sale::Column::SaleNumber.eq(sale_number))
            .one(self.db_pool.as_ref())
            .await?
        {
            Some(sale) => sale,
            None => return Ok(None),
        };
        let lines = self.lines_for(sale.id).await?;
        Ok(Some(SaleDetail { sale, lines }))
    }

    pub async fn list_sales(
        &self,
        page: u64,
        per_page: u64,
        status: Option<SaleStatus>,
    ) -> Result<SaleListResponse, ServiceError> {
        let page = page.max(1);
        let mut query = sale::Entity::find().order_by_desc(sale::Column::CreatedAt);
        if let Some(status) = status {
            query = query.filter(sale::Column::Status.eq(status));
        }
        let paginator = query.paginate(self.db_pool.as_ref(), per_page);

        let total = paginator.num_items().await?;
        let sales = paginator.fetch_page(page - 1).await?;

        Ok(SaleListResponse {
            sales,
            total,
            page,
            per_page,
        })
    }

    async fn lines_for(&self, sale_id: Uuid) -> Result<Vec<sale_line::Model>, ServiceError> {
        Ok(sale_line::Entity::find()
            .filter(sale_line::Column::SaleId.eq(sale_id))
            .order_by_asc(sale_line::Column::LineNumber)
            .all(self.db_pool.as_ref())
            .await?)
    }
}

/// Line total and tax for one cart line. Tax rounds half away from zero
/// to cents, matching what gets printed on the receipt.
pub fn compute_line_amounts(
    quantity: i32,
    unit_price: Decimal,
    tax_rate: Decimal,
) -> (Decimal, Decimal) {
    let line_total = unit_price * Decimal::from(quantity);
    let tax_amount =
        (line_total * tax_rate).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    (line_total, tax_amount)
}

pub fn format_sale_number(date: NaiveDate, sequence: u32) -> String {
    format!(
        "{}{}{:04}",
        SALE_NUMBER_PREFIX,
        date.format("%Y%m%d"),
        sequence
    )
}

/// Receipt numbers mirror the sale number under their own prefix.
pub fn receipt_number_for(sale_number: &str) -> String {
    format!(
        "{}{}",
        RECEIPT_NUMBER_PREFIX,
        sale_number.trim_start_matches(SALE_NUMBER_PREFIX)
    )
}

// Next number in the day's sequence, derived from the highest number
// already taken for that date. The unique index on sale_number catches
// concurrent callers that drew the same value; later attempts skip
// further ahead so a retry cannot redraw the number it just lost.
async fn next_sale_number(
    txn: &DatabaseTransaction,
    date: NaiveDate,
    attempt: u32,
) -> Result<String, ServiceError> {
    let prefix = format!("{}{}", SALE_NUMBER_PREFIX, date.format("%Y%m%d"));
    let last = sale::Entity::find()
        .filter(sale::Column::SaleNumber.like(format!("{}%", prefix)))
        .order_by_desc(sale::Column::SaleNumber)
        .one(txn)
        .await?;

    let taken = match last {
        Some(sale) => sale
            .sale_number
            .get(prefix.len()..)
            .and_then(|suffix| suffix.parse::<u32>().ok())
            .unwrap_or(0),
        None => 0,
    };
    Ok(format_sale_number(date, taken + attempt))
}

fn failure_label(error: &ServiceError) -> &'static str {
    match error {
        ServiceError::ProductNotFound(_) => "product_not_found",
        ServiceError::ProductInactive(_) => "product_inactive",
        ServiceError::InsufficientStock { .. } => "insufficient_stock",
        ServiceError::NegativeStockRejected { .. } => "negative_stock",
        ServiceError::SaleNumberCollision(_) => "sale_number_collision",
        ServiceError::InventoryConflict(_) => "inventory_conflict",
        ServiceError::SaleNotFound(_) => "sale_not_found",
        ServiceError::AlreadyVoided(_) => "already_voided",
        ServiceError::NotVoidable { .. } => "not_voidable",
        ServiceError::ValidationError(_) => "validation_error",
        ServiceError::DatabaseError(_) => "database_error",
        _ => "other",
    }
}
