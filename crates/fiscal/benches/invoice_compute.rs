use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::Utc;
use rust_decimal::Decimal;
use shopdesk_core::{ClientId, CompanyId, ServiceOrderId};
use shopdesk_fiscal::{ClientSnapshot, InvoiceComputer, LineItem, ServiceOrder, ServiceOrderStatus};

fn order_with_lines(lines: usize) -> ServiceOrder {
    ServiceOrder {
        id: ServiceOrderId::new(1),
        company_id: CompanyId::new(1),
        client: ClientSnapshot {
            id: ClientId::new(1),
            name: "Bench".to_string(),
            document: None,
            email: None,
            address: None,
        },
        status: ServiceOrderStatus::Finalized,
        recorded_total: Decimal::ZERO,
        products: (0..lines)
            .map(|i| LineItem::product("p", Decimal::from(i as i64 + 1), Decimal::new(1999, 2)))
            .collect(),
        services: (0..lines)
            .map(|_| LineItem::service("s", Decimal::ONE, Decimal::new(15050, 2)))
            .collect(),
        invoice_id: None,
    }
}

fn bench_prepare(c: &mut Criterion) {
    let computer = InvoiceComputer::default();
    let mut group = c.benchmark_group("invoice_prepare");

    for lines in [1usize, 10, 100] {
        let order = order_with_lines(lines);
        group.throughput(Throughput::Elements((lines * 2) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lines), &order, |b, order| {
            b.iter(|| {
                computer
                    .prepare(black_box(order), None, None, Utc::now())
                    .map(|n| n.amounts.total)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_prepare);
criterion_main!(benches);
