use std::path::PathBuf;
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::mpsc;
use uuid::Uuid;

use tillbook::{
    catalog::{upsert_product, ProductInput},
    config::AppConfig,
    db,
    entities::product,
    events::{Event, EventSender},
    services::inventory::SetInitialStockRequest,
    AppState,
};

/// Helper harness backed by a throwaway SQLite database file.
///
/// The event receiver stays on the harness instead of feeding a worker
/// task, so tests can assert on exactly what the services emitted.
pub struct TestContext {
    pub state: AppState,
    pub events: mpsc::Receiver<Event>,
    db_file: PathBuf,
}

impl TestContext {
    /// Construct a new context with fresh database state.
    pub async fn new() -> Self {
        let db_file = std::env::temp_dir().join(format!("tillbook_test_{}.db", Uuid::new_v4()));

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_file.display()),
            "test".to_string(),
        );
        cfg.auto_migrate = true;
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");

        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let (event_tx, event_rx) = mpsc::channel(256);
        let state = AppState::new(Arc::new(pool), cfg, Arc::new(EventSender::new(event_tx)));

        Self {
            state,
            events: event_rx,
            db_file,
        }
    }

    /// Insert a catalog product ready for sale.
    #[allow(dead_code)]
    pub async fn seed_product(
        &self,
        sku: &str,
        unit_price: Decimal,
        tax_rate: Decimal,
    ) -> product::Model {
        upsert_product(
            self.state.db.as_ref(),
            ProductInput {
                sku: sku.to_string(),
                name: format!("Test Product {}", sku),
                description: None,
                category: Some("Test".to_string()),
                unit_price,
                tax_rate,
                is_active: true,
            },
        )
        .await
        .expect("seed product for tests")
    }

    /// Seed a product and post its opening stock through the ledger.
    #[allow(dead_code)]
    pub async fn seed_stocked_product(
        &self,
        sku: &str,
        unit_price: Decimal,
        tax_rate: Decimal,
        quantity: i32,
    ) -> product::Model {
        let product = self.seed_product(sku, unit_price, tax_rate).await;
        self.state
            .inventory_service
            .set_initial_stock(
                SetInitialStockRequest {
                    product_id: product.id,
                    variant_id: None,
                    quantity,
                    reorder_point: None,
                    reorder_quantity: None,
                    minimum_stock_level: None,
                    maximum_stock_level: None,
                    notes: None,
                },
                None,
            )
            .await
            .expect("seed opening stock for tests");
        product
    }

    /// Collect every event currently queued on the channel.
    #[allow(dead_code)]
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.db_file);
        // SQLite runs in WAL mode under sqlx; sweep the side files too.
        for suffix in ["-wal", "-shm"] {
            let mut side = self.db_file.clone().into_os_string();
            side.push(suffix);
            let _ = std::fs::remove_file(PathBuf::from(side));
        }
    }
}
