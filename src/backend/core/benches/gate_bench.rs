//! Benchmarks for capability gate checks and scope filtering.
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use keystone_core::prelude::*;
use std::sync::Arc;

fn widget_schema() -> ResourceSchema {
    ResourceSchema::new("widget")
        .attribute(AttributeDef::new("title", AttributeType::String))
        .attribute(AttributeDef::new("status", AttributeType::String))
        .attribute(AttributeDef::new("owner_id", AttributeType::Reference).immutable())
        .parent(ParentRef::new("owner", "owner_id", "principal"))
}

fn registry() -> Arc<PolicyRegistry> {
    let catalog = Arc::new(SchemaCatalog::from_schemas([widget_schema()]).unwrap());
    let registry = PolicyRegistry::builder(catalog)
        .with_predefined_roles()
        .register(
            PolicyBuilder::resource("member", "widget")
                .deny(Action::Update, ["status"])
                .condition(
                    Verb::Update,
                    Condition::attribute_equals("status", "draft", "only drafts can be edited"),
                ),
        )
        .build()
        .unwrap();
    Arc::new(registry)
}

struct NullSink;

impl AuditSink for NullSink {
    fn record(&self, record: &AuditRecord) {
        black_box(record);
    }
}

fn bench_gate_record_check(c: &mut Criterion) {
    let mut group = c.benchmark_group("gate_record_check");
    let registry = registry();
    let gate = CapabilityGate::new(registry.catalog().clone(), Arc::new(NullSink));
    let widget = ResourceType::new("widget");
    let principal = Principal::new("alice").with_role("member").with_role("viewer");
    let effective = registry.resolve_principal(Some(&principal), &widget);

    let owned = Record::new("widget", "w1").with("owner_id", "alice").with("status", "draft");
    let foreign = Record::new("widget", "w2").with("owner_id", "bob").with("status", "draft");

    for (label, record) in [("owned", &owned), ("foreign", &foreign)] {
        group.bench_with_input(BenchmarkId::from_parameter(label), record, |b, r| {
            b.iter(|| {
                black_box(
                    gate.check(&effective, &Verb::Update, RecordTarget::Found(r), &NoRelations)
                        .is_ok(),
                )
            });
        });
    }
    group.finish();
}

fn bench_resolve_principal(c: &mut Criterion) {
    let registry = registry();
    let widget = ResourceType::new("widget");
    let principal = Principal::new("alice").with_role("member").with_role("viewer");
    c.bench_function("resolve_principal", |b| {
        b.iter(|| black_box(registry.resolve_principal(Some(&principal), &widget)));
    });
}

fn bench_scope_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("scope_filter");
    let registry = registry();
    let resolver = ScopeResolver::new(registry);
    let widget = ResourceType::new("widget");
    let principal = Principal::new("alice").with_role("member");
    let filter = resolver.scope(Some(&principal), &widget);

    for size in [100usize, 1_000] {
        let mut data = Dataset::new();
        for i in 0..size {
            let owner = if i % 3 == 0 { "alice" } else { "bob" };
            data.insert(Record::new("widget", format!("w{}", i)).with("owner_id", owner));
        }
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, d| {
            b.iter(|| black_box(d.select(&widget, &filter).len()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_gate_record_check, bench_resolve_principal, bench_scope_filter);
criterion_main!(benches);
