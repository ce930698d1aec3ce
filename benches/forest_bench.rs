use criterion::{criterion_group, criterion_main, Criterion};
use v2f::{Forest, MarkovForestParams, MarlinMarkovForest, Source, TreeBuilder};

fn bench_builders(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_builders");
    let source = Source::laplacian(16, 0.5, 7).unwrap();
    let size = 1 << 10;

    for builder in [
        TreeBuilder::Tunstall,
        TreeBuilder::MarlinBase,
        TreeBuilder::Yamamoto {
            first_allowed_symbol_index: 0,
        },
        TreeBuilder::FastYamamoto {
            first_allowed_symbol_index: 0,
        },
    ] {
        group.bench_function(builder.name(), |b| {
            b.iter(|| builder.build(size, &source).unwrap())
        });
    }
    group.finish();
}

fn bench_coding(c: &mut Criterion) {
    let mut group = c.benchmark_group("forest_coding");
    let source = Source::laplacian(16, 0.5, 7).unwrap();
    let input = source.generate_symbols(10_000);

    let forest = Forest::fast_yamamoto(1 << 10, None, &source).unwrap();
    group.bench_function("code", |b| b.iter(|| forest.code(&input).unwrap()));

    let coded = forest.code(&input).unwrap();
    group.bench_function("decode", |b| {
        b.iter(|| forest.decode(&coded.nodes).unwrap())
    });

    let markov = MarlinMarkovForest::new(MarkovForestParams::new(8, 2, 0), &source).unwrap();
    group.bench_function("markov_code", |b| b.iter(|| markov.code(&input).unwrap()));
    group.finish();
}

criterion_group!(benches, bench_builders, bench_coding);
criterion_main!(benches);
