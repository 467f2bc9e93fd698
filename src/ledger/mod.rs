/*!
 * # Stock Ledger
 *
 * Append-mostly log of every quantity change, and the only write path into
 * inventory levels. `post_movement` runs inside the caller's open
 * transaction: the movement row and the level mutation commit or roll back
 * together, which is what keeps the ledger authoritative.
 */

use chrono::Utc;
use lazy_static::lazy_static;
use prometheus::{IntCounterVec, Opts};
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::inventory_level;
use crate::entities::stock_movement::{self, MovementKind, MovementReference};
use crate::errors::ServiceError;

lazy_static! {
    static ref STOCK_MOVEMENTS_POSTED: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "stock_movements_posted_total",
            "Total stock movements posted to the ledger"
        ),
        &["movement_type"]
    )
    .expect("metric can be created");
    static ref STOCK_MOVEMENT_REJECTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "stock_movement_rejections_total",
            "Total stock movements rejected before posting"
        ),
        &["reason"]
    )
    .expect("metric can be created");
}

/// Reload-and-reapply attempts when the guarded level write loses to a
/// concurrent movement before the post gives up.
const MAX_LEVEL_WRITE_ATTEMPTS: u32 = 3;

/// A movement to be posted. `quantity` is signed for kinds that move
/// on-hand (negative for outbound kinds) and a positive magnitude for the
/// reservation bookkeeping kinds, which leave on-hand untouched.
#[derive(Debug, Clone)]
pub struct NewMovement {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub kind: MovementKind,
    pub quantity: i32,
    pub reference: MovementReference,
    pub actor_id: Option<Uuid>,
    pub notes: Option<String>,
}

/// Posts one movement inside the caller's transaction.
///
/// Reads (or lazily creates) the inventory level, applies the mutator
/// matching the movement kind, writes the level back through the guarded
/// update and persists the movement row with its before/after chain
/// values. The guard keeps the chain serial under concurrent writers: the
/// level row is only touched while it still carries the quantities this
/// computation was based on, so a racing movement forces a reload and a
/// fresh computation instead of a lost update. Returns the stored
/// movement and the updated level.
pub async fn post_movement<C: ConnectionTrait>(
    txn: &C,
    movement: NewMovement,
    allow_negative_stock: bool,
) -> Result<(stock_movement::Model, inventory_level::Model), ServiceError> {
    validate_direction(movement.kind, movement.quantity).map_err(|e| {
        STOCK_MOVEMENT_REJECTIONS
            .with_label_values(&["validation_error"])
            .inc();
        e
    })?;

    let mut stored = find_or_create_level(txn, movement.product_id, movement.variant_id).await?;

    let mut attempt = 1;
    let (level, quantity_before, quantity_after) = loop {
        let mut level = stored.clone();
        let quantity_before = level.quantity_on_hand;
        let reserved_before = level.quantity_reserved;
        apply_kind(
            &mut level,
            movement.kind,
            movement.quantity,
            allow_negative_stock,
        )
        .map_err(|e| {
            STOCK_MOVEMENT_REJECTIONS
                .with_label_values(&[rejection_label(&e)])
                .inc();
            e
        })?;
        level.updated_at = Some(Utc::now());
        let quantity_after = level.quantity_on_hand;

        if store_level_guarded(txn, &level, quantity_before, reserved_before).await? {
            break (level, quantity_before, quantity_after);
        }

        if attempt >= MAX_LEVEL_WRITE_ATTEMPTS {
            STOCK_MOVEMENT_REJECTIONS
                .with_label_values(&["conflict"])
                .inc();
            return Err(ServiceError::InventoryConflict(movement.product_id));
        }
        attempt += 1;
        warn!(
            product_id = %movement.product_id,
            attempt,
            "Level changed under a movement post, reloading"
        );
        stored = load_level(txn, movement.product_id, movement.variant_id)
            .await?
            .ok_or(ServiceError::InventoryConflict(movement.product_id))?;
    };

    let now = Utc::now();
    let (reference_type, reference_id) = movement.reference.as_columns();
    let movement_row = stock_movement::ActiveModel {
        id: Set(Uuid::new_v4()),
        product_id: Set(movement.product_id),
        variant_id: Set(movement.variant_id),
        movement_type: Set(movement.kind),
        quantity: Set(movement.quantity.abs()),
        quantity_change: Set(quantity_after - quantity_before),
        quantity_before: Set(quantity_before),
        quantity_after: Set(quantity_after),
        reference_type: Set(reference_type.to_string()),
        reference_id: Set(reference_id),
        movement_date: Set(now),
        user_id: Set(movement.actor_id),
        is_confirmed: Set(true),
        notes: Set(movement.notes),
        created_at: Set(now),
    };
    let saved = movement_row.insert(txn).await?;

    STOCK_MOVEMENTS_POSTED
        .with_label_values(&[&movement.kind.to_string()])
        .inc();
    info!(
        product_id = %movement.product_id,
        movement_type = %movement.kind,
        quantity_change = quantity_after - quantity_before,
        quantity_before,
        quantity_after,
        "Posted stock movement"
    );

    Ok((saved, level))
}

/// Writes a mutated level back, guarded on the quantities the mutation
/// was computed from. Returns false without touching the row when a
/// concurrent movement got there first.
pub async fn store_level_guarded<C: ConnectionTrait>(
    txn: &C,
    level: &inventory_level::Model,
    expected_on_hand: i32,
    expected_reserved: i32,
) -> Result<bool, ServiceError> {
    let result = inventory_level::Entity::update_many()
        .col_expr(
            inventory_level::Column::QuantityOnHand,
            Expr::value(level.quantity_on_hand),
        )
        .col_expr(
            inventory_level::Column::QuantityAvailable,
            Expr::value(level.quantity_available),
        )
        .col_expr(
            inventory_level::Column::QuantityReserved,
            Expr::value(level.quantity_reserved),
        )
        .col_expr(
            inventory_level::Column::LastMovementAt,
            Expr::value(level.last_movement_at),
        )
        .col_expr(
            inventory_level::Column::UpdatedAt,
            Expr::value(level.updated_at),
        )
        .filter(inventory_level::Column::Id.eq(level.id))
        .filter(inventory_level::Column::QuantityOnHand.eq(expected_on_hand))
        .filter(inventory_level::Column::QuantityReserved.eq(expected_reserved))
        .exec(txn)
        .await?;
    Ok(result.rows_affected == 1)
}

async fn load_level<C: ConnectionTrait>(
    txn: &C,
    product_id: Uuid,
    variant_id: Option<Uuid>,
) -> Result<Option<inventory_level::Model>, ServiceError> {
    let mut query =
        inventory_level::Entity::find().filter(inventory_level::Column::ProductId.eq(product_id));
    query = match variant_id {
        Some(variant) => query.filter(inventory_level::Column::VariantId.eq(variant)),
        None => query.filter(inventory_level::Column::VariantId.is_null()),
    };
    Ok(query.one(txn).await?)
}

/// Loads the level row for (product, variant), inserting a zero baseline
/// on first contact so the product's chain starts at zero.
pub async fn find_or_create_level<C: ConnectionTrait>(
    txn: &C,
    product_id: Uuid,
    variant_id: Option<Uuid>,
) -> Result<inventory_level::Model, ServiceError> {
    if let Some(level) = load_level(txn, product_id, variant_id).await? {
        return Ok(level);
    }

    let baseline = inventory_level::Model::new(product_id, variant_id);
    let active = inventory_level::ActiveModel {
        id: Set(baseline.id),
        product_id: Set(baseline.product_id),
        variant_id: Set(baseline.variant_id),
        quantity_on_hand: Set(baseline.quantity_on_hand),
        quantity_available: Set(baseline.quantity_available),
        quantity_reserved: Set(baseline.quantity_reserved),
        minimum_stock_level: Set(baseline.minimum_stock_level),
        maximum_stock_level: Set(baseline.maximum_stock_level),
        reorder_point: Set(baseline.reorder_point),
        reorder_quantity: Set(baseline.reorder_quantity),
        last_movement_at: Set(baseline.last_movement_at),
        created_at: Set(baseline.created_at),
        updated_at: Set(baseline.updated_at),
    };
    let created = active.insert(txn).await?;
    info!(product_id = %product_id, "Created zero baseline inventory level");
    Ok(created)
}

// Sign conventions per kind, checked before any row is touched.
fn validate_direction(kind: MovementKind, quantity: i32) -> Result<(), ServiceError> {
    let ok = match kind {
        MovementKind::InitialStock
        | MovementKind::Purchase
        | MovementKind::ReturnFromCustomer
        | MovementKind::TransferIn
        | MovementKind::VoidRestore
        | MovementKind::Reservation
        | MovementKind::ReleaseReservation => quantity > 0,
        MovementKind::Sale
        | MovementKind::TransferOut
        | MovementKind::Damaged
        | MovementKind::Expired
        | MovementKind::Theft => quantity < 0,
        MovementKind::Adjustment => quantity != 0,
    };
    if ok {
        Ok(())
    } else {
        Err(ServiceError::ValidationError(format!(
            "{} movement cannot carry quantity {}",
            kind, quantity
        )))
    }
}

// Applies the level mutator matching the movement kind. Reservation kinds
// keep on-hand flat; a sale consumes availability via reserve then fulfill
// so shortfalls surface as InsufficientStock.
fn apply_kind(
    level: &mut inventory_level::Model,
    kind: MovementKind,
    quantity: i32,
    allow_negative_stock: bool,
) -> Result<(), ServiceError> {
    match kind {
        MovementKind::InitialStock
        | MovementKind::Purchase
        | MovementKind::ReturnFromCustomer
        | MovementKind::TransferIn
        | MovementKind::VoidRestore
        | MovementKind::TransferOut
        | MovementKind::Damaged
        | MovementKind::Expired
        | MovementKind::Theft
        | MovementKind::Adjustment => level.apply_direct(quantity, allow_negative_stock),
        MovementKind::Sale => {
            let magnitude = -quantity;
            level.reserve(magnitude)?;
            level.fulfill(magnitude)
        }
        MovementKind::Reservation => level.reserve(quantity),
        MovementKind::ReleaseReservation => level.release(quantity),
    }
}

fn rejection_label(error: &ServiceError) -> &'static str {
    match error {
        ServiceError::InsufficientStock { .. } => "insufficient_stock",
        ServiceError::NegativeStockRejected { .. } => "negative_stock",
        ServiceError::InvalidReservationState { .. } => "invalid_reservation",
        _ => "other",
    }
}
