// benches/chain_bench.rs
//! Throughput of next-function chains and parallel fan-out per team kind

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use office_engine::{arg, EngineConfig, FunctionSpec, Office, TeamKind, WiringTable};

const CHAIN_LENGTH: usize = 16;

fn chain_office(kind: TeamKind) -> Office {
    let wiring = WiringTable::new()
        .team("t", kind)
        .function("step", FunctionSpec::on("t").flow("again", "step"))
        .flow("chain", "step");
    let office = Office::builder(wiring)
        .config(EngineConfig::default())
        .function("step", |ctx| {
            let remaining = ctx.parameter::<usize>().copied().unwrap_or(0);
            if remaining > 0 {
                ctx.invoke_flow("again", arg(remaining - 1))?;
            }
            Ok(())
        })
        .build()
        .expect("bench wiring links");
    office.open().expect("office opens");
    office
}

fn fan_out_office() -> Office {
    let wiring = WiringTable::new()
        .team("t", TeamKind::Pool { size: Some(4), max: None })
        .function("root", FunctionSpec::on("t").flow("leaf", "leaf"))
        .function("leaf", FunctionSpec::on("t"))
        .flow("fan", "root");
    let office = Office::builder(wiring)
        .function("root", |ctx| {
            let width = ctx.parameter::<usize>().copied().unwrap_or(0);
            for _ in 0..width {
                ctx.spawn_flow("leaf", None, None)?;
            }
            ctx.join_parallel();
            Ok(())
        })
        .function("leaf", |_| Ok(()))
        .build()
        .expect("bench wiring links");
    office.open().expect("office opens");
    office
}

fn chain_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain");
    group.throughput(Throughput::Elements(CHAIN_LENGTH as u64 + 1));

    let kinds = [
        ("passive", TeamKind::Passive),
        ("dedicated", TeamKind::Dedicated),
        ("pool", TeamKind::Pool { size: Some(4), max: None }),
    ];
    for (label, kind) in kinds {
        let office = chain_office(kind);
        group.bench_function(BenchmarkId::new("invoke_and_wait", label), |b| {
            b.iter(|| {
                let result = office.invoke_and_wait("chain", arg(CHAIN_LENGTH), None);
                black_box(result.is_ok());
            });
        });
        office.close();
    }

    group.finish();
}

fn fan_out_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");
    let office = fan_out_office();

    for width in [8_usize, 64, 512] {
        group.throughput(Throughput::Elements(width as u64));
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, &width| {
            b.iter(|| {
                let result = office.invoke_and_wait("fan", arg(width), None);
                black_box(result.is_ok());
            });
        });
    }

    group.finish();
    office.close();
}

criterion_group!(benches, chain_benchmark, fan_out_benchmark);
criterion_main!(benches);
