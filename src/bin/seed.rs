//! Seed script - populates the database with a demo catalog and stock.
//!
//! Run with: cargo run --bin tillbook-seed
//!
//! This creates:
//! - a small school-shop product catalog
//! - an opening stock position for each product, posted through the ledger

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use tillbook::catalog::{upsert_product, ProductInput};
use tillbook::events::{process_events, EventSender};
use tillbook::services::inventory::{InventoryService, SetInitialStockRequest};

struct SeedProduct {
    sku: &'static str,
    name: &'static str,
    description: &'static str,
    category: &'static str,
    unit_price: Decimal,
    tax_rate: Decimal,
    opening_stock: i32,
    reorder_point: i32,
    reorder_quantity: i32,
}

fn seed_products() -> Vec<SeedProduct> {
    vec![
        SeedProduct {
            sku: "NOTEBOOK-A5",
            name: "A5 Spiral Notebook",
            description: "80-page ruled notebook with spiral binding.",
            category: "Stationery",
            unit_price: dec!(3.50),
            tax_rate: dec!(0.10),
            opening_stock: 120,
            reorder_point: 20,
            reorder_quantity: 60,
        },
        SeedProduct {
            sku: "PEN-BLUE",
            name: "Blue Ballpoint Pen",
            description: "Medium-tip ballpoint pen, blue ink.",
            category: "Stationery",
            unit_price: dec!(1.20),
            tax_rate: dec!(0.10),
            opening_stock: 300,
            reorder_point: 50,
            reorder_quantity: 200,
        },
        SeedProduct {
            sku: "CALC-SCI",
            name: "Scientific Calculator",
            description: "Two-line scientific calculator, exam approved.",
            category: "Electronics",
            unit_price: dec!(18.90),
            tax_rate: dec!(0.10),
            opening_stock: 25,
            reorder_point: 5,
            reorder_quantity: 15,
        },
        SeedProduct {
            sku: "HOODIE-M",
            name: "School Hoodie (M)",
            description: "Crest-embroidered hoodie, size medium.",
            category: "Apparel",
            unit_price: dec!(32.00),
            tax_rate: dec!(0.10),
            opening_stock: 40,
            reorder_point: 8,
            reorder_quantity: 20,
        },
        SeedProduct {
            sku: "WATER-750",
            name: "Water Bottle 750ml",
            description: "Insulated stainless bottle with logo.",
            category: "Accessories",
            unit_price: dec!(12.50),
            tax_rate: dec!(0.10),
            opening_stock: 60,
            reorder_point: 12,
            reorder_quantity: 30,
        },
    ]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    info!("=== Tillbook Seed Data ===");

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite://tillbook.db?mode=rwc".to_string());

    info!("Connecting to database: {}", database_url);
    let db = Arc::new(tillbook::db::establish_connection(&database_url).await?);
    tillbook::db::run_migrations(&db).await?;

    let (tx, rx) = mpsc::channel(64);
    let event_task = tokio::spawn(process_events(rx));
    let inventory = InventoryService::new(db.clone(), Arc::new(EventSender::new(tx)), false);

    info!("Creating products and opening stock...");
    let mut count = 0;
    for seed in seed_products() {
        let product = upsert_product(
            db.as_ref(),
            ProductInput {
                sku: seed.sku.to_string(),
                name: seed.name.to_string(),
                description: Some(seed.description.to_string()),
                category: Some(seed.category.to_string()),
                unit_price: seed.unit_price,
                tax_rate: seed.tax_rate,
                is_active: true,
            },
        )
        .await?;

        // Re-running the seed must not double the opening balances. A level
        // row only exists once the product has ledger history.
        let already_stocked = inventory.get_level(product.id, None).await?.is_some();
        if already_stocked {
            info!("  {} ({}) already stocked, skipping", product.name, product.sku);
            continue;
        }

        let level = inventory
            .set_initial_stock(
                SetInitialStockRequest {
                    product_id: product.id,
                    variant_id: None,
                    quantity: seed.opening_stock,
                    reorder_point: Some(seed.reorder_point),
                    reorder_quantity: Some(seed.reorder_quantity),
                    minimum_stock_level: None,
                    maximum_stock_level: None,
                    notes: Some("Opening stock".to_string()),
                },
                None,
            )
            .await?;

        info!(
            "  {} ({}) stocked at {}",
            product.name, product.sku, level.quantity_on_hand
        );
        count += 1;
    }

    info!("Seeded {} products", count);

    // Dropping the service closes the event channel so the worker drains and exits.
    drop(inventory);
    event_task.await?;

    info!("=== Seed Data Complete ===");
    Ok(())
}
