//! Integration tests for the sale transaction flow.
//!
//! Tests cover:
//! - Sale creation with totals, snapshots and ledger postings
//! - Insufficient stock rejection and atomic rollback
//! - Voiding with stock restoration and double-void protection
//! - Concurrent sales competing for the same stock
//! - Line snapshots surviving later catalog edits

mod common;

use chrono::Utc;
use common::TestContext;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set};
use uuid::Uuid;

use tillbook::catalog::{upsert_product, ProductInput};
use tillbook::entities::sale::SaleStatus;
use tillbook::entities::stock_movement::{self, MovementKind};
use tillbook::entities::{sale, sale_line};
use tillbook::errors::ServiceError;
use tillbook::events::Event;
use tillbook::services::sales::{CreateSaleRequest, CustomerInfo, SaleLineRequest};

fn one_line_cart(product_id: Uuid, quantity: i32, unit_price: Decimal) -> CreateSaleRequest {
    CreateSaleRequest {
        lines: vec![SaleLineRequest {
            product_id,
            quantity,
            unit_price,
        }],
        payment_method: "cash".to_string(),
        customer_info: None,
        notes: None,
    }
}

// ==================== Sale Creation ====================

#[tokio::test]
async fn completed_sale_writes_totals_snapshot_and_ledger() {
    let mut ctx = TestContext::new().await;
    let product = ctx
        .seed_stocked_product("NOTEBOOK-A5", dec!(10.00), dec!(0.10), 5)
        .await;
    ctx.drain_events();

    let cashier = Uuid::new_v4();
    let detail = ctx
        .state
        .sale_service
        .create_sale(one_line_cart(product.id, 2, dec!(10.00)), cashier)
        .await
        .expect("sale should complete");

    // Header totals are recomputed from the stored lines.
    assert_eq!(detail.sale.status, SaleStatus::Completed);
    assert_eq!(detail.sale.subtotal, dec!(20.00));
    assert_eq!(detail.sale.tax_amount, dec!(2.00));
    assert_eq!(detail.sale.total_amount, dec!(22.00));
    assert_eq!(detail.sale.cashier_id, cashier);

    // Sale and receipt numbers follow the dated format.
    assert!(detail.sale.sale_number.starts_with("TXN"));
    assert_eq!(detail.sale.sale_number.len(), 15);
    assert!(detail.sale.sale_number[3..].chars().all(|c| c.is_ascii_digit()));
    assert_eq!(
        detail.sale.receipt_number,
        format!("RCP{}", &detail.sale.sale_number[3..])
    );

    // The line carries a catalog snapshot and the inventory flag.
    assert_eq!(detail.lines.len(), 1);
    let line = &detail.lines[0];
    assert_eq!(line.line_number, 1);
    assert_eq!(line.sku, "NOTEBOOK-A5");
    assert_eq!(line.name, "Test Product NOTEBOOK-A5");
    assert_eq!(line.quantity, 2);
    assert_eq!(line.line_total, dec!(20.00));
    assert_eq!(line.tax_amount, dec!(2.00));
    assert!(line.inventory_updated);

    // Stock moved 5 -> 3 and the ledger recorded the deduction.
    let level = ctx
        .state
        .inventory_service
        .get_level(product.id, None)
        .await
        .expect("level query")
        .expect("level exists");
    assert_eq!(level.quantity_on_hand, 3);
    assert_eq!(level.quantity_available, 3);

    let movements = stock_movement::Entity::find()
        .filter(stock_movement::Column::ProductId.eq(product.id))
        .order_by_asc(stock_movement::Column::CreatedAt)
        .all(ctx.state.db.as_ref())
        .await
        .expect("movement query");
    assert_eq!(movements.len(), 2);
    let sale_movement = &movements[1];
    assert_eq!(sale_movement.movement_type, MovementKind::Sale);
    assert_eq!(sale_movement.quantity_change, -2);
    assert_eq!(sale_movement.quantity_before, 5);
    assert_eq!(sale_movement.quantity_after, 3);
    assert_eq!(sale_movement.reference_type, "sale");
    assert_eq!(sale_movement.reference_id, Some(detail.sale.id));

    // Completion event went out after commit.
    let events = ctx.drain_events();
    assert!(events.iter().any(|event| matches!(
        event,
        Event::SaleCompleted { sale_id, .. } if *sale_id == detail.sale.id
    )));
}

#[tokio::test]
async fn multi_line_sale_numbers_lines_and_sums_totals() {
    let ctx = TestContext::new().await;
    let pen = ctx
        .seed_stocked_product("PEN-BLUE", dec!(1.20), dec!(0.10), 50)
        .await;
    let calc = ctx
        .seed_stocked_product("CALC-SCI", dec!(18.90), dec!(0.10), 10)
        .await;

    let request = CreateSaleRequest {
        lines: vec![
            SaleLineRequest {
                product_id: pen.id,
                quantity: 3,
                unit_price: dec!(1.20),
            },
            SaleLineRequest {
                product_id: calc.id,
                quantity: 1,
                unit_price: dec!(18.90),
            },
        ],
        payment_method: "card".to_string(),
        customer_info: Some(CustomerInfo {
            name: Some("Jordan Lee".to_string()),
            email: Some("jordan@example.com".to_string()),
            phone: None,
            school_id: None,
        }),
        notes: None,
    };

    let detail = ctx
        .state
        .sale_service
        .create_sale(request, Uuid::new_v4())
        .await
        .expect("multi line sale");

    assert_eq!(detail.lines.len(), 2);
    assert_eq!(detail.lines[0].line_number, 1);
    assert_eq!(detail.lines[1].line_number, 2);

    // 3 * 1.20 = 3.60 (tax 0.36) plus 18.90 (tax 1.89)
    assert_eq!(detail.sale.subtotal, dec!(22.50));
    assert_eq!(detail.sale.tax_amount, dec!(2.25));
    assert_eq!(detail.sale.total_amount, dec!(24.75));

    // Customer info round-trips through the JSON column.
    let stored = ctx
        .state
        .sale_service
        .get_sale(detail.sale.id)
        .await
        .expect("get sale")
        .expect("sale exists");
    let info = stored.customer_info.expect("customer info stored");
    assert_eq!(info["name"], "Jordan Lee");
    assert_eq!(info["email"], "jordan@example.com");
}

#[tokio::test]
async fn sale_numbers_increment_within_the_day() {
    let ctx = TestContext::new().await;
    let product = ctx
        .seed_stocked_product("WATER-750", dec!(12.50), dec!(0.10), 20)
        .await;

    let first = ctx
        .state
        .sale_service
        .create_sale(one_line_cart(product.id, 1, dec!(12.50)), Uuid::new_v4())
        .await
        .expect("first sale");
    let second = ctx
        .state
        .sale_service
        .create_sale(one_line_cart(product.id, 1, dec!(12.50)), Uuid::new_v4())
        .await
        .expect("second sale");

    assert_ne!(first.sale.sale_number, second.sale.sale_number);
    let (first_prefix, first_seq) = first.sale.sale_number.split_at(11);
    let (second_prefix, second_seq) = second.sale.sale_number.split_at(11);
    if first_prefix == second_prefix {
        let first_seq: u32 = first_seq.parse().expect("numeric suffix");
        let second_seq: u32 = second_seq.parse().expect("numeric suffix");
        assert_eq!(second_seq, first_seq + 1);
    }
}

#[tokio::test]
async fn a_taken_sale_number_is_retried_to_the_next_sequence() {
    let ctx = TestContext::new().await;
    let product = ctx
        .seed_stocked_product("NOTEBOOK-A5", dec!(10.00), dec!(0.10), 10)
        .await;

    let first = ctx
        .state
        .sale_service
        .create_sale(one_line_cart(product.id, 1, dec!(10.00)), Uuid::new_v4())
        .await
        .expect("first sale");
    assert!(first.sale.sale_number.ends_with("0001"));

    // Plant a header whose number sorts above every numeric suffix but
    // does not parse as one. The generator then re-draws 0001, trips the
    // unique index on the row above, and must land on 0002.
    let day_prefix = format!("TXN{}", Utc::now().date_naive().format("%Y%m%d"));
    sale::ActiveModel {
        id: Set(Uuid::new_v4()),
        sale_number: Set(format!("{}ZZZZ", day_prefix)),
        receipt_number: Set(format!("RCP{}ZZZZ", &day_prefix[3..])),
        status: Set(SaleStatus::Completed),
        subtotal: Set(dec!(0)),
        tax_amount: Set(dec!(0)),
        total_amount: Set(dec!(0)),
        payment_method: Set("cash".to_string()),
        customer_info: Set(None),
        cashier_id: Set(Uuid::new_v4()),
        voided_at: Set(None),
        voided_by: Set(None),
        void_reason: Set(None),
        notes: Set(None),
        ..Default::default()
    }
    .insert(ctx.state.db.as_ref())
    .await
    .expect("plant blocking header");

    let retried = ctx
        .state
        .sale_service
        .create_sale(one_line_cart(product.id, 2, dec!(10.00)), Uuid::new_v4())
        .await
        .expect("sale completes past the collision");
    assert_eq!(retried.sale.sale_number, format!("{}0002", day_prefix));
    assert_eq!(retried.sale.status, SaleStatus::Completed);

    // The losing first attempt left no deduction behind.
    let level = ctx
        .state
        .inventory_service
        .get_level(product.id, None)
        .await
        .expect("level query")
        .expect("level exists");
    assert_eq!(level.quantity_on_hand, 7);
}

// ==================== Failure Atomicity ====================

#[tokio::test]
async fn insufficient_stock_rolls_the_whole_sale_back() {
    let ctx = TestContext::new().await;
    let product = ctx
        .seed_stocked_product("HOODIE-M", dec!(32.00), dec!(0.10), 1)
        .await;

    let err = ctx
        .state
        .sale_service
        .create_sale(one_line_cart(product.id, 2, dec!(32.00)), Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::InsufficientStock {
            requested: 2,
            available: 1,
            ..
        }
    ));

    // Nothing persisted: no sale header, no lines, stock untouched.
    let sales = sale::Entity::find()
        .all(ctx.state.db.as_ref())
        .await
        .expect("sales query");
    assert!(sales.is_empty());
    let lines = sale_line::Entity::find()
        .all(ctx.state.db.as_ref())
        .await
        .expect("lines query");
    assert!(lines.is_empty());

    let level = ctx
        .state
        .inventory_service
        .get_level(product.id, None)
        .await
        .expect("level query")
        .expect("level exists");
    assert_eq!(level.quantity_on_hand, 1);
}

#[tokio::test]
async fn mid_cart_shortfall_rolls_back_earlier_lines() {
    let ctx = TestContext::new().await;
    let product = ctx
        .seed_stocked_product("CALC-SCI", dec!(18.90), dec!(0.10), 5)
        .await;

    // Each line passes the per-line catalog pre-check (3 <= 5), but the
    // duplicated product exhausts stock at posting time inside the
    // transaction, so the ledger check is the one that decides.
    let request = CreateSaleRequest {
        lines: vec![
            SaleLineRequest {
                product_id: product.id,
                quantity: 3,
                unit_price: dec!(18.90),
            },
            SaleLineRequest {
                product_id: product.id,
                quantity: 3,
                unit_price: dec!(18.90),
            },
        ],
        payment_method: "cash".to_string(),
        customer_info: None,
        notes: None,
    };

    let err = ctx
        .state
        .sale_service
        .create_sale(request, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::InsufficientStock {
            requested: 3,
            available: 2,
            ..
        }
    ));

    // The first line's deduction must not survive the rollback.
    let level = ctx
        .state
        .inventory_service
        .get_level(product.id, None)
        .await
        .expect("level query")
        .expect("level exists");
    assert_eq!(level.quantity_on_hand, 5);

    let sale_movements = stock_movement::Entity::find()
        .filter(stock_movement::Column::MovementType.eq(MovementKind::Sale))
        .all(ctx.state.db.as_ref())
        .await
        .expect("movement query");
    assert!(sale_movements.is_empty());

    let sales = sale::Entity::find()
        .all(ctx.state.db.as_ref())
        .await
        .expect("sales query");
    assert!(sales.is_empty());
}

// ==================== Voiding ====================

#[tokio::test]
async fn void_restores_stock_through_a_new_ledger_entry() {
    let mut ctx = TestContext::new().await;
    let product = ctx
        .seed_stocked_product("NOTEBOOK-A5", dec!(10.00), dec!(0.10), 5)
        .await;

    let cashier = Uuid::new_v4();
    let detail = ctx
        .state
        .sale_service
        .create_sale(one_line_cart(product.id, 2, dec!(10.00)), cashier)
        .await
        .expect("sale");
    ctx.drain_events();

    let manager = Uuid::new_v4();
    let voided = ctx
        .state
        .sale_service
        .void_sale(detail.sale.id, "Customer returned order".to_string(), manager)
        .await
        .expect("void");

    assert_eq!(voided.sale.status, SaleStatus::Voided);
    assert_eq!(voided.sale.voided_by, Some(manager));
    assert!(voided.sale.voided_at.is_some());
    assert_eq!(
        voided.sale.void_reason.as_deref(),
        Some("Customer returned order")
    );
    assert!(voided.lines.iter().all(|line| !line.inventory_updated));

    // The void refreshed the update stamps on the header and its lines.
    assert!(voided.sale.updated_at > detail.sale.updated_at);
    assert!(voided.lines[0].updated_at > detail.lines[0].updated_at);

    // Stock is back to 5 and history shows -2 then +2, never an edit.
    let level = ctx
        .state
        .inventory_service
        .get_level(product.id, None)
        .await
        .expect("level query")
        .expect("level exists");
    assert_eq!(level.quantity_on_hand, 5);

    let movements = stock_movement::Entity::find()
        .filter(stock_movement::Column::ProductId.eq(product.id))
        .order_by_asc(stock_movement::Column::CreatedAt)
        .all(ctx.state.db.as_ref())
        .await
        .expect("movement query");
    assert_eq!(movements.len(), 3);
    assert_eq!(movements[1].movement_type, MovementKind::Sale);
    assert_eq!(movements[1].quantity_change, -2);
    assert_eq!(movements[2].movement_type, MovementKind::VoidRestore);
    assert_eq!(movements[2].quantity_change, 2);
    assert_eq!(movements[2].quantity_before, 3);
    assert_eq!(movements[2].quantity_after, 5);
    assert_eq!(movements[2].reference_type, "sale_void");
    assert_eq!(movements[2].reference_id, Some(detail.sale.id));

    let events = ctx.drain_events();
    assert!(events.iter().any(|event| matches!(
        event,
        Event::SaleVoided { sale_id, .. } if *sale_id == detail.sale.id
    )));

    // Voiding twice is rejected without touching stock again.
    let err = ctx
        .state
        .sale_service
        .void_sale(detail.sale.id, "again".to_string(), manager)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::AlreadyVoided(id) if id == detail.sale.id));

    let level = ctx
        .state
        .inventory_service
        .get_level(product.id, None)
        .await
        .expect("level query")
        .expect("level exists");
    assert_eq!(level.quantity_on_hand, 5);
}

#[tokio::test]
async fn voiding_an_unknown_sale_reports_not_found() {
    let ctx = TestContext::new().await;
    let missing = Uuid::new_v4();
    let err = ctx
        .state
        .sale_service
        .void_sale(missing, "no such sale".to_string(), Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::SaleNotFound(id) if id == missing));
}

// ==================== Concurrency ====================

#[tokio::test]
async fn concurrent_sales_cannot_oversell_shared_stock() {
    let ctx = TestContext::new().await;
    let product = ctx
        .seed_stocked_product("CALC-SCI", dec!(18.90), dec!(0.10), 5)
        .await;

    let service_a = ctx.state.sale_service.clone();
    let service_b = ctx.state.sale_service.clone();
    let product_id = product.id;

    let task_a = tokio::spawn(async move {
        service_a
            .create_sale(one_line_cart(product_id, 3, dec!(18.90)), Uuid::new_v4())
            .await
    });
    let task_b = tokio::spawn(async move {
        service_b
            .create_sale(one_line_cart(product_id, 3, dec!(18.90)), Uuid::new_v4())
            .await
    });

    let results = vec![
        task_a.await.expect("task a join"),
        task_b.await.expect("task b join"),
    ];

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 1, "exactly one sale should win the stock");
    assert!(results.iter().any(|r| matches!(
        r,
        Err(ServiceError::InsufficientStock { .. })
    )));

    let level = ctx
        .state
        .inventory_service
        .get_level(product.id, None)
        .await
        .expect("level query")
        .expect("level exists");
    assert_eq!(level.quantity_on_hand, 2);
}

// ==================== Snapshot Immutability ====================

#[tokio::test]
async fn line_snapshots_survive_catalog_edits() {
    let ctx = TestContext::new().await;
    let product = ctx
        .seed_stocked_product("HOODIE-M", dec!(32.00), dec!(0.10), 10)
        .await;

    let detail = ctx
        .state
        .sale_service
        .create_sale(one_line_cart(product.id, 1, dec!(32.00)), Uuid::new_v4())
        .await
        .expect("sale");

    // Reprice and rename the product after the sale completed.
    upsert_product(
        ctx.state.db.as_ref(),
        ProductInput {
            sku: "HOODIE-M".to_string(),
            name: "School Hoodie (Medium) v2".to_string(),
            description: None,
            category: Some("Apparel".to_string()),
            unit_price: dec!(39.00),
            tax_rate: dec!(0.12),
            is_active: true,
        },
    )
    .await
    .expect("catalog edit");

    let stored = ctx
        .state
        .sale_service
        .get_sale_with_lines(detail.sale.id)
        .await
        .expect("get sale")
        .expect("sale exists");
    let line = &stored.lines[0];
    assert_eq!(line.name, "Test Product HOODIE-M");
    assert_eq!(line.unit_price, dec!(32.00));
    assert_eq!(line.tax_rate, dec!(0.10));
}

// ==================== Reads ====================

#[tokio::test]
async fn sales_can_be_fetched_by_number_and_listed_by_status() {
    let ctx = TestContext::new().await;
    let product = ctx
        .seed_stocked_product("PEN-BLUE", dec!(1.20), dec!(0.10), 30)
        .await;

    let first = ctx
        .state
        .sale_service
        .create_sale(one_line_cart(product.id, 2, dec!(1.20)), Uuid::new_v4())
        .await
        .expect("first sale");
    let second = ctx
        .state
        .sale_service
        .create_sale(one_line_cart(product.id, 1, dec!(1.20)), Uuid::new_v4())
        .await
        .expect("second sale");
    ctx.state
        .sale_service
        .void_sale(second.sale.id, "mis-ring".to_string(), Uuid::new_v4())
        .await
        .expect("void second");

    let by_number = ctx
        .state
        .sale_service
        .get_sale_by_number(&first.sale.sale_number)
        .await
        .expect("lookup by number")
        .expect("sale found");
    assert_eq!(by_number.sale.id, first.sale.id);
    assert_eq!(by_number.lines.len(), 1);

    let voided = ctx
        .state
        .sale_service
        .list_sales(1, 10, Some(SaleStatus::Voided))
        .await
        .expect("list voided");
    assert_eq!(voided.total, 1);
    assert_eq!(voided.sales[0].id, second.sale.id);

    let all = ctx
        .state
        .sale_service
        .list_sales(1, 10, None)
        .await
        .expect("list all");
    assert_eq!(all.total, 2);
}
