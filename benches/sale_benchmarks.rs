use chrono::NaiveDate;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rust_decimal::Decimal;
use std::time::Duration;
use uuid::Uuid;

use tillbook::entities::inventory_level;
use tillbook::entities::stock_movement::MovementReference;
use tillbook::services::sales::{compute_line_amounts, format_sale_number, receipt_number_for};

// Benchmark for receipt arithmetic across cart sizes
fn cart_totals_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("cart_totals");

    let unit_price = Decimal::new(1099, 2);
    let tax_rate = Decimal::new(825, 4);

    for size in [1, 5, 10, 20].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let mut subtotal = Decimal::ZERO;
                let mut tax_total = Decimal::ZERO;
                for quantity in 1..=size {
                    let (line_total, tax) = compute_line_amounts(
                        black_box(quantity),
                        black_box(unit_price),
                        black_box(tax_rate),
                    );
                    subtotal += line_total;
                    tax_total += tax;
                }
                black_box(subtotal + tax_total)
            });
        });
    }

    group.finish();
}

// Benchmark for sale and receipt number formatting
fn number_formatting_benchmark(c: &mut Criterion) {
    let date = NaiveDate::from_ymd_opt(2025, 3, 7).unwrap();

    c.bench_function("format_sale_number", |b| {
        b.iter(|| {
            let number = format_sale_number(black_box(date), black_box(42));
            black_box(number)
        });
    });

    c.bench_function("receipt_number_for", |b| {
        let sale_number = format_sale_number(date, 42);
        b.iter(|| {
            let receipt = receipt_number_for(black_box(&sale_number));
            black_box(receipt)
        });
    });
}

// Benchmark for the inventory record mutators on the sale path
fn inventory_mutation_benchmark(c: &mut Criterion) {
    c.bench_function("reserve_then_fulfill", |b| {
        b.iter(|| {
            let mut level = inventory_level::Model::new(Uuid::new_v4(), None);
            level.apply_direct(black_box(100), false).unwrap();
            level.reserve(black_box(3)).unwrap();
            level.fulfill(black_box(3)).unwrap();
            black_box(level.quantity_on_hand)
        });
    });

    c.bench_function("apply_direct", |b| {
        let mut level = inventory_level::Model::new(Uuid::new_v4(), None);
        level.apply_direct(100, false).unwrap();
        b.iter(|| {
            // Paired so on-hand stays flat no matter how long the run is.
            level.apply_direct(black_box(1), false).unwrap();
            level.apply_direct(black_box(-1), false).unwrap();
            black_box(level.quantity_on_hand)
        });
    });
}

// Benchmark for movement reference column round-trips
fn movement_reference_benchmark(c: &mut Criterion) {
    let sale_id = Uuid::new_v4();

    c.bench_function("movement_reference_round_trip", |b| {
        b.iter(|| {
            let (reference_type, reference_id) =
                black_box(MovementReference::Sale(sale_id)).as_columns();
            let parsed = MovementReference::from_columns(reference_type, reference_id);
            black_box(parsed)
        });
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(100);
    targets =
        cart_totals_benchmark,
        number_formatting_benchmark,
        inventory_mutation_benchmark,
        movement_reference_benchmark
}

criterion_main!(benches);
