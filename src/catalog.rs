/*!
 * # Catalog Adapter
 *
 * Read-only product lookup consumed by the sale coordinator. The engine
 * does not own product or category data; it reads a snapshot at sale time
 * and copies it onto the sale line so receipts survive catalog edits.
 */

use async_trait::async_trait;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::{inventory_level, product};
use crate::errors::ServiceError;

/// Point-in-time view of a catalog product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub product_id: Uuid,
    pub sku: String,
    pub name: String,
    pub category: Option<String>,
    pub unit_price: Decimal,
    pub tax_rate: Decimal,
    pub is_active: bool,
}

impl From<&product::Model> for ProductSnapshot {
    fn from(model: &product::Model) -> Self {
        Self {
            product_id: model.id,
            sku: model.sku.clone(),
            name: model.name.clone(),
            category: model.category.clone(),
            unit_price: model.unit_price,
            tax_rate: model.tax_rate,
            is_active: model.is_active,
        }
    }
}

/// Read-only catalog contract required by sale creation.
#[async_trait]
pub trait CatalogAdapter: Send + Sync {
    /// Looks up a product by id. `Ok(None)` means the product does not exist.
    async fn lookup(&self, product_id: Uuid) -> Result<Option<ProductSnapshot>, ServiceError>;

    /// Currently available (unreserved) quantity for a product. Products
    /// with no stock record yet report zero.
    async fn available_quantity(&self, product_id: Uuid) -> Result<i32, ServiceError>;
}

/// Catalog adapter backed by the local products and inventory tables.
#[derive(Clone)]
pub struct SqlCatalog {
    db_pool: Arc<DbPool>,
}

impl SqlCatalog {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl CatalogAdapter for SqlCatalog {
    async fn lookup(&self, product_id: Uuid) -> Result<Option<ProductSnapshot>, ServiceError> {
        let model = product::Entity::find_by_id(product_id)
            .one(self.db_pool.as_ref())
            .await?;
        Ok(model.as_ref().map(ProductSnapshot::from))
    }

    async fn available_quantity(&self, product_id: Uuid) -> Result<i32, ServiceError> {
        // Sales draw from the product-level stock record, not variant rows.
        let level = inventory_level::Entity::find()
            .filter(inventory_level::Column::ProductId.eq(product_id))
            .filter(inventory_level::Column::VariantId.is_null())
            .one(self.db_pool.as_ref())
            .await?;
        Ok(level.map(|l| l.quantity_available).unwrap_or(0))
    }
}

/// Fixed in-memory catalog for tests and demos.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    products: Mutex<HashMap<Uuid, (ProductSnapshot, i32)>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self {
            products: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, snapshot: ProductSnapshot, available: i32) {
        self.products
            .lock()
            .unwrap()
            .insert(snapshot.product_id, (snapshot, available));
    }

    pub fn set_available(&self, product_id: Uuid, available: i32) {
        if let Some(entry) = self.products.lock().unwrap().get_mut(&product_id) {
            entry.1 = available;
        }
    }
}

#[async_trait]
impl CatalogAdapter for StaticCatalog {
    async fn lookup(&self, product_id: Uuid) -> Result<Option<ProductSnapshot>, ServiceError> {
        Ok(self
            .products
            .lock()
            .unwrap()
            .get(&product_id)
            .map(|(snapshot, _)| snapshot.clone()))
    }

    async fn available_quantity(&self, product_id: Uuid) -> Result<i32, ServiceError> {
        Ok(self
            .products
            .lock()
            .unwrap()
            .get(&product_id)
            .map(|(_, available)| *available)
            .unwrap_or(0))
    }
}

/// Seed-side input for creating or refreshing a catalog product.
#[derive(Debug, Clone)]
pub struct ProductInput {
    pub sku: String,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub unit_price: Decimal,
    pub tax_rate: Decimal,
    pub is_active: bool,
}

/// Inserts a product or updates the existing row with the same SKU.
///
/// Only the seed path and tests write products; the engine itself treats
/// the catalog as read-only.
pub async fn upsert_product<C: ConnectionTrait>(
    db: &C,
    input: ProductInput,
) -> Result<product::Model, ServiceError> {
    let existing = product::Entity::find()
        .filter(product::Column::Sku.eq(input.sku.clone()))
        .one(db)
        .await?;

    let model = match existing {
        Some(found) => {
            let mut active: product::ActiveModel = found.into();
            active.name = Set(input.name);
            active.description = Set(input.description);
            active.category = Set(input.category);
            active.unit_price = Set(input.unit_price);
            active.tax_rate = Set(input.tax_rate);
            active.is_active = Set(input.is_active);
            active.update(db).await?
        }
        None => {
            let active = product::ActiveModel {
                id: Set(Uuid::new_v4()),
                sku: Set(input.sku),
                name: Set(input.name),
                description: Set(input.description),
                category: Set(input.category),
                unit_price: Set(input.unit_price),
                tax_rate: Set(input.tax_rate),
                is_active: Set(input.is_active),
                ..Default::default()
            };
            active.insert(db).await?
        }
    };

    Ok(model)
}
