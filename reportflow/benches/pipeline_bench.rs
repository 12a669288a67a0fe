//! Benchmarks for pipeline execution.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::io::Cursor;
use std::sync::Arc;

use reportflow::pipeline::{JsonArraySource, MemorySource, PipelineBuilder, RecordSource};
use reportflow::stages::{Bindings, EnrichStage, LookupTable, RemapStage, TemplateExpression};
use reportflow::testing::{course_records, lookup_entry, MemorySink};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn source_benchmark(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("json_array_source");

    for count in [100u32, 1_000, 10_000] {
        let bytes = serde_json::to_vec(&course_records(count)).unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &bytes, |b, bytes| {
            b.iter(|| {
                rt.block_on(async {
                    let mut source = JsonArraySource::new(Cursor::new(bytes.clone()));
                    let mut read = 0u32;
                    while let Some(record) = source.next_record().await.unwrap() {
                        black_box(record);
                        read += 1;
                    }
                    read
                })
            });
        });
    }

    group.finish();
}

fn transform_benchmark(c: &mut Criterion) {
    let rt = runtime();
    let lookup: Vec<_> = (1..=500).map(lookup_entry).collect();
    let lookup = Arc::new(LookupTable::from_entries(lookup).unwrap());
    let template = Arc::new(TemplateExpression::new(serde_json::json!({
        "id": "{{xapistatementid}}",
        "actor": {
            "name": "{{firstName}} {{lastName}}",
            "mbox": "mailto:{{emailAddress}}",
            "account": {"homePage": "{{$homepage}}", "name": "{{userId}}"},
        },
        "object": "{{xapiobject}}",
        "timestamp": "{{completedDate}}",
    })));
    let mut bindings = Bindings::new();
    bindings.insert(
        "homepage".to_string(),
        serde_json::json!("https://lms.example.com"),
    );

    let mut group = c.benchmark_group("enrich_remap");
    for count in [100u32, 1_000] {
        let records = course_records(count);
        group.throughput(Throughput::Elements(u64::from(count)));
        group.bench_with_input(BenchmarkId::from_parameter(count), &records, |b, records| {
            b.iter(|| {
                rt.block_on(async {
                    let pipeline = PipelineBuilder::new("bench")
                        .stage(EnrichStage::new(Arc::clone(&lookup)))
                        .stage(RemapStage::new(template.clone(), bindings.clone()))
                        .build()
                        .unwrap();
                    let mut source = MemorySource::new(records.clone());
                    let mut sink = MemorySink::new();
                    black_box(pipeline.run(&mut source, &mut sink).await.unwrap())
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, source_benchmark, transform_benchmark);
criterion_main!(benches);
