use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use gink_core::{AsOf, Bundle, Bundler, Muid, StorageKey};
use gink_store::Index;
use gink_testkit::fixtures::ChainFixture;

const MEDALLION: i64 = 1 << 40;

fn directory_bundles(count: usize) -> Vec<Bundle> {
    let mut chain = ChainFixture::new(MEDALLION, 1_000);
    (0..count)
        .map(|i| {
            let mut bundler = Bundler::new();
            bundler
                .set(Muid::ROOT, (i % 64) as i64, i.to_le_bytes().to_vec())
                .unwrap();
            chain.seal(bundler).unwrap()
        })
        .collect()
}

fn bench_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest");
    for count in [100, 1_000] {
        let bundles = directory_bundles(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &bundles, |b, bundles| {
            b.iter(|| {
                let mut index = Index::default();
                for bundle in bundles {
                    index.add_bundle(black_box(bundle)).unwrap();
                }
                index
            })
        });
    }
    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut index = Index::default();
    for bundle in directory_bundles(1_000) {
        index.add_bundle(&bundle).unwrap();
    }
    let key = StorageKey::Scalar(7i64.into());

    c.bench_function("get_entry_by_key/latest", |b| {
        b.iter(|| index.get_entry_by_key(Muid::ROOT, black_box(&key), AsOf::Latest).unwrap())
    });
    c.bench_function("get_entry_by_key/bundles_ago", |b| {
        b.iter(|| index.get_entry_by_key(Muid::ROOT, black_box(&key), AsOf::BundlesAgo(500)).unwrap())
    });
    c.bench_function("get_keyed_entries/latest", |b| {
        b.iter(|| index.get_keyed_entries(Muid::ROOT, AsOf::Latest).unwrap())
    });
}

criterion_group!(benches, bench_ingest, bench_lookup);
criterion_main!(benches);
