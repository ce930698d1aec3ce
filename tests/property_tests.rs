use proptest::prelude::*;
use v2f::{
    Forest, MarkovForestParams, MarlinMarkovForest, RefinementConfig, Source, TreeBuilder,
};

fn source_from_weights(mut weights: Vec<u32>) -> Source {
    weights.sort_unstable_by(|a, b| b.cmp(a));
    let total: u32 = weights.iter().sum();
    let probabilities: Vec<f64> = weights.iter().map(|&w| w as f64 / total as f64).collect();
    Source::from_probabilities(&probabilities).unwrap()
}

fn source_and_input() -> impl Strategy<Value = (Source, Vec<u32>)> {
    prop::collection::vec(1u32..100, 2..7).prop_flat_map(|weights| {
        let alphabet = weights.len() as u32;
        (
            Just(source_from_weights(weights)),
            prop::collection::vec(0..alphabet, 0..200),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_plain_forests_roundtrip(
        (source, input) in source_and_input(),
        extra in 0usize..40,
    ) {
        let size = source.len() + extra;
        let forests = vec![
            Forest::trivial(&[source.len(), source.len()], &source).unwrap(),
            Forest::tunstall(size, 2, &source).unwrap(),
            Forest::yamamoto(size, None, &source).unwrap(),
            Forest::fast_yamamoto(size, None, &source).unwrap(),
            Forest::from_tree(TreeBuilder::MarlinBase.build(size, &source).unwrap()).unwrap(),
            Forest::from_tree(
                TreeBuilder::MarlinMarkov { refinement: RefinementConfig::default() }
                    .build(size, &source)
                    .unwrap(),
            )
            .unwrap(),
        ];
        for forest in forests {
            let coded = forest.code(&input).unwrap();
            prop_assert_eq!(forest.decode(&coded.nodes).unwrap(), input.clone(), "{}", forest);
            prop_assert_eq!(
                coded.bit_length,
                coded.nodes.len() as u64 * u64::from(forest.word_length_bits())
            );
        }
    }

    #[test]
    fn test_markov_forest_roundtrip(
        (source, input) in source_and_input(),
        o in 0u32..3,
        s in 0u32..2,
        threshold in prop::sample::select(vec![0.0, 0.05, 0.2]),
    ) {
        let params = MarkovForestParams {
            symbol_p_threshold: threshold,
            ..MarkovForestParams::new(4, o, s)
        };
        let forest = MarlinMarkovForest::new(params, &source).unwrap();
        let coded = forest.code(&input).unwrap();
        prop_assert_eq!(forest.decode(&coded).unwrap(), input);
    }

    #[test]
    fn test_builders_respect_size(
        weights in prop::collection::vec(1u32..100, 2..7),
        extra in 0usize..80,
    ) {
        let source = source_from_weights(weights);
        let size = source.len() + extra;
        for builder in [
            TreeBuilder::Trivial,
            TreeBuilder::Tunstall,
            TreeBuilder::MarlinBase,
            TreeBuilder::Yamamoto { first_allowed_symbol_index: 0 },
            TreeBuilder::FastYamamoto { first_allowed_symbol_index: source.len() - 2 },
        ] {
            let tree = builder.build(size, &source).unwrap();
            prop_assert!(tree.included_count() <= size, "{}", builder.name());
        }
    }

    #[test]
    fn test_probability_conservation(
        weights in prop::collection::vec(1u32..100, 2..7),
        extra in 0usize..80,
    ) {
        let source = source_from_weights(weights);
        let size = source.len() + extra;
        // Every builder here keeps a child for every symbol under the root.
        for builder in [
            TreeBuilder::Trivial,
            TreeBuilder::Tunstall,
            TreeBuilder::MarlinBase,
            TreeBuilder::Yamamoto { first_allowed_symbol_index: 0 },
            TreeBuilder::FastYamamoto { first_allowed_symbol_index: source.len() - 2 },
        ] {
            let tree = builder.build(size, &source).unwrap();
            prop_assert!((tree.probability_sum() - 1.0).abs() < 1e-6, "{}", builder.name());
        }
    }

    #[test]
    fn test_builders_are_deterministic(
        weights in prop::collection::vec(1u32..100, 2..7),
        extra in 0usize..80,
    ) {
        let source = source_from_weights(weights);
        let size = source.len() + extra;
        for builder in [
            TreeBuilder::Trivial,
            TreeBuilder::Tunstall,
            TreeBuilder::MarlinBase,
            TreeBuilder::FastYamamoto { first_allowed_symbol_index: 0 },
        ] {
            let a = builder.build(size, &source).unwrap();
            let b = builder.build(size, &source).unwrap();
            prop_assert_eq!(a.word_set(), b.word_set());
        }
    }
}

fn efficiency(builder: TreeBuilder, size: usize, source: &Source) -> f64 {
    let tree = builder.build(size, source).unwrap();
    source.entropy() * tree.average_length() / f64::from(tree.word_length_bits())
}

#[test]
fn test_efficiency_grows_with_size() {
    let source = Source::from_probabilities(&[0.5, 0.25, 0.125, 0.125]).unwrap();
    for builder in [TreeBuilder::Tunstall, TreeBuilder::MarlinBase] {
        let rates: Vec<f64> = [8, 64, 1024]
            .into_iter()
            .map(|size| efficiency(builder, size, &source))
            .collect();
        assert!(rates.windows(2).all(|pair| pair[0] <= pair[1]), "{rates:?}");
        assert!(rates.iter().all(|&rate| rate <= 1.0 + 1e-9), "{rates:?}");
    }
}

#[test]
fn test_tunstall_scenario() {
    let source = Source::from_probabilities(&[0.5, 0.25, 0.125, 0.125]).unwrap();
    let tree = TreeBuilder::Tunstall.build(8, &source).unwrap();
    let words: Vec<Vec<u32>> = tree.word_set().into_iter().collect();
    assert_eq!(
        words,
        vec![
            vec![0, 0],
            vec![0, 1],
            vec![0, 2],
            vec![0, 3],
            vec![1],
            vec![2],
            vec![3],
        ]
    );
}
