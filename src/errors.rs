use sea_orm::TransactionError;
use serde::Serialize;
use uuid::Uuid;

/// Unified error type for catalog, ledger and sale operations.
///
/// Stock and sale failures carry the identifiers and quantities a caller
/// needs to act on the failure without parsing message strings.
#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error("Product {0} not found in catalog")]
    ProductNotFound(Uuid),

    #[error("Product {0} is inactive and cannot be sold")]
    ProductInactive(Uuid),

    #[error(
        "Insufficient stock for product {product_id}: requested {requested}, available {available}"
    )]
    InsufficientStock {
        product_id: Uuid,
        requested: i32,
        available: i32,
    },

    #[error("Movement rejected for product {product_id}: on hand {on_hand}, change {change}")]
    NegativeStockRejected {
        product_id: Uuid,
        on_hand: i32,
        change: i32,
    },

    #[error(
        "Cannot release {requested} units for product {product_id}: only {reserved} reserved"
    )]
    InvalidReservationState {
        product_id: Uuid,
        requested: i32,
        reserved: i32,
    },

    #[error("Sale {0} not found")]
    SaleNotFound(Uuid),

    #[error("Sale {0} is already voided")]
    AlreadyVoided(Uuid),

    #[error("Sale {sale_id} cannot be voided from status {status}")]
    NotVoidable { sale_id: Uuid, status: String },

    #[error("Sale number {0} already assigned")]
    SaleNumberCollision(String),

    #[error("Stock for product {0} changed mid-post; movement not applied")]
    InventoryConflict(Uuid),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

/// Unwraps the closure-style transaction wrapper so callers see either the
/// connection failure or the error their closure returned.
impl From<TransactionError<ServiceError>> for ServiceError {
    fn from(err: TransactionError<ServiceError>) -> Self {
        match err {
            TransactionError::Connection(db_err) => ServiceError::DatabaseError(db_err),
            TransactionError::Transaction(service_err) => service_err,
        }
    }
}

impl ServiceError {
    /// Whether retrying the same unit of work can be expected to succeed.
    ///
    /// Sale number collisions and inventory conflicts both qualify: the
    /// state that invalidated the attempt was committed by a concurrent
    /// writer, so a fresh attempt reads the advanced value.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::SaleNumberCollision(_) | ServiceError::InventoryConflict(_)
        )
    }
}
