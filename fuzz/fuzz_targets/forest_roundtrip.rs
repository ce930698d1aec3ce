#![no_main]
use libfuzzer_sys::fuzz_target;
use v2f::{header, Forest, Source};

fuzz_target!(|data: (Vec<u8>, u8)| {
    let (input_bytes, size) = data;
    let source = match Source::from_probabilities(&[0.5, 0.25, 0.125, 0.0625, 0.0625]) {
        Ok(source) => source,
        Err(_) => return,
    };
    let size = usize::from(size).max(source.len());

    // Arbitrary bytes must never panic the header parser.
    let _ = header::parse_header(&input_bytes, &source);

    let forest = match Forest::tunstall(size, 2, &source) {
        Ok(forest) => forest,
        Err(_) => return,
    };
    let input: Vec<u32> = input_bytes.iter().map(|&b| u32::from(b % 5)).collect();
    let coded = forest.code(&input).unwrap();
    assert_eq!(forest.decode(&coded.nodes).unwrap(), input);

    let reloaded = header::parse_header(&header::header_bytes(&forest).unwrap(), &source).unwrap();
    assert_eq!(reloaded.code(&input).unwrap().nodes.len(), coded.nodes.len());
});
