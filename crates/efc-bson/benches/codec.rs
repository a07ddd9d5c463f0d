use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use efc_bson::{BsonDocument, BsonParser};

fn build(records: usize) -> BsonDocument {
    let mut doc = BsonDocument::new();
    for i in 0..records {
        let rec = doc.add("batch/rec", i as i64).unwrap();
        doc.add_child(rec, "name", format!("record-{}", i)).unwrap();
        doc.add_child(rec, "score", i as f64 * 0.5).unwrap();
        doc.add_child(rec, "blob", vec![i as u8; 32]).unwrap();
    }
    doc
}

fn bench_codec(c: &mut Criterion) {
    let doc = build(1000);
    let bytes = doc.to_bytes("batch", true).unwrap();

    let mut group = c.benchmark_group("bson");
    group.throughput(Throughput::Bytes(bytes.len() as u64));

    group.bench_function("export", |b| {
        let mut out = Vec::with_capacity(bytes.len());
        b.iter(|| {
            out.clear();
            doc.export(black_box("batch"), true, &mut out).unwrap();
        })
    });

    group.bench_function("import", |b| {
        b.iter(|| BsonDocument::import(black_box(&bytes)).unwrap())
    });

    group.bench_function("stream", |b| {
        let mut out = BsonDocument::new();
        b.iter(|| {
            let mut parser = BsonParser::new(black_box(&bytes[..]));
            parser.next_bson(&mut out).unwrap()
        })
    });

    group.finish();
}

criterion_group!(benches, bench_codec);
criterion_main!(benches);
