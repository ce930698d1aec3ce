use v2f::{archive, header, AnyForest, Forest, Source};

fn main() -> v2f::Result<()> {
    env_logger::init();

    let source = Source::laplacian(64, 0.4, 0x5eed)?;
    let input = source.generate_symbols(100_000);

    for round in 0..20 {
        let forest = Forest::fast_yamamoto(1 << 12, Some(4), &source)?;
        let coded = forest.code(&input)?;
        let decoded = forest.decode(&coded.nodes)?;
        debug_assert_eq!(decoded, input);

        let header = header::header_bytes(&forest)?;
        let mut json = Vec::new();
        archive::dump(&AnyForest::Plain(forest), &mut json)?;
        log::info!(
            "round {round}: {} bits, header {} bytes, archive {} bytes",
            coded.bit_length,
            header.len(),
            json.len()
        );
    }
    Ok(())
}
