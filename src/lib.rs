//! Tillbook
//!
//! Sale transaction and stock ledger engine for point-of-sale systems.
//! Sales and voids run as atomic units of work against an append-only
//! stock movement ledger, so cash drawer history and inventory counts
//! can always be reconciled against each other.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod catalog;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod ledger;
pub mod migrator;
pub mod services;

use std::sync::Arc;

use crate::catalog::{CatalogAdapter, SqlCatalog};
use crate::db::DbPool;
use crate::events::EventSender;
use crate::services::inventory::InventoryService;
use crate::services::sales::SaleService;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbPool>,
    pub config: config::AppConfig,
    pub event_sender: Arc<EventSender>,
    pub inventory_service: InventoryService,
    pub sale_service: SaleService,
}

impl AppState {
    /// Wires the services against a shared pool and event channel. The
    /// sale service reads product data through the SQL-backed catalog
    /// adapter so embedders can swap in their own source.
    pub fn new(db: Arc<DbPool>, config: config::AppConfig, event_sender: Arc<EventSender>) -> Self {
        let catalog: Arc<dyn CatalogAdapter> = Arc::new(SqlCatalog::new(db.clone()));
        let inventory_service = InventoryService::new(
            db.clone(),
            event_sender.clone(),
            config.allow_negative_stock,
        );
        let sale_service = SaleService::new(
            db.clone(),
            catalog,
            event_sender.clone(),
            config.allow_negative_stock,
        );

        Self {
            db,
            config,
            event_sender,
            inventory_service,
            sale_service,
        }
    }
}

pub mod prelude {
    pub use crate::catalog::{CatalogAdapter, ProductSnapshot, SqlCatalog};
    pub use crate::db::*;
    pub use crate::errors::*;
    pub use crate::events::*;
    pub use crate::ledger::{post_movement, NewMovement};
    pub use crate::services::inventory::InventoryService;
    pub use crate::services::sales::SaleService;
    pub use crate::AppState;
}
