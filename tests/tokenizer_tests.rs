use anyhow::Result;
use multiqg::formatter::HIGHLIGHT_TOKEN;
use multiqg::QgTokenizer;
use unicode_categories::UnicodeCategories;

fn corpus() -> Vec<String> {
    [
        "generate question: <hl> Paris <hl> is the capital of France.",
        "What is the capital of France?",
        "question: What is the capital of France?, context: Paris is the capital of France.",
        "Paris",
        "extract answers: <hl> Paris is the capital of France. <hl>",
        "Hello, world!",
        "This is a test.",
        "UPPERCASE lowercase MixedCase",
        "Multiple    spaces and\ttabs",
        "Special characters: !@#$%^&*()_+-=[]{}|;:,.<>?",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[test]
fn test_tokenizer_creation() -> Result<()> {
    let tokenizer = QgTokenizer::train(&corpus(), 500)?;
    let vocab = tokenizer.vocab();

    assert!(tokenizer.get_vocab_size() > 0);
    assert_eq!(vocab.size, tokenizer.get_vocab_size());
    let mut ids = vec![vocab.pad_id, vocab.bos_id, vocab.eos_id, vocab.highlight_id];
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 4, "special tokens must have distinct ids");

    Ok(())
}

#[test]
fn test_tokenizer_encode_decode() -> Result<()> {
    let tokenizer = QgTokenizer::train(&corpus(), 500)?;

    let test_cases = vec![
        "Hello, world!",
        "This is a test.",
        "What is the capital of France?",
        "UPPERCASE lowercase MixedCase",
        "Special characters: !@#$%^&*()_+-=[]{}|;:,.<>?",
    ];

    for test_text in test_cases {
        let encoded = tokenizer.encode(test_text)?;
        assert!(!encoded.is_empty());

        let decoded = tokenizer.decode(&encoded)?;
        assert_eq!(
            normalized_text(&decoded),
            normalized_text(test_text),
            "Failed to correctly encode and decode: {}",
            test_text
        );
    }

    Ok(())
}

#[test]
fn test_highlight_is_a_single_token() -> Result<()> {
    let tokenizer = QgTokenizer::train(&corpus(), 500)?;
    let highlight = tokenizer.vocab().highlight_id;

    let encoded = tokenizer.encode(HIGHLIGHT_TOKEN)?;
    assert_eq!(encoded, vec![highlight]);

    let encoded = tokenizer.encode("generate question: <hl> Paris <hl> is the capital of France.")?;
    assert_eq!(encoded.iter().filter(|&&id| id == highlight).count(), 2);

    // special tokens never leak into decoded text
    let decoded = tokenizer.decode(&encoded)?;
    assert!(!decoded.contains(HIGHLIGHT_TOKEN));
    assert!(decoded.contains("Paris"));

    Ok(())
}

#[test]
fn test_target_ends_with_eos() -> Result<()> {
    let tokenizer = QgTokenizer::train(&corpus(), 500)?;
    let target = tokenizer.encode_target("What is the capital of France?")?;

    assert_eq!(target.last(), Some(&tokenizer.vocab().eos_id));
    assert_eq!(
        tokenizer.decode(&target)?,
        tokenizer.decode(&target[..target.len() - 1])?
    );

    Ok(())
}

#[test]
fn test_tokenizer_whitespace_handling() -> Result<()> {
    let tokenizer = QgTokenizer::train(&corpus(), 500)?;

    let test_cases = vec![
        ("This   is  a    test", "This is a test"),
        ("Multiple    spaces and\ttabs", "Multiple spaces and tabs"),
        ("UPPERCASE lowercase MixedCase", "UPPERCASE lowercase MixedCase"),
    ];

    for (input, expected) in test_cases {
        let encoded = tokenizer.encode(input)?;
        assert!(!encoded.is_empty());

        let decoded = tokenizer.decode(&encoded)?;
        assert_eq!(
            decoded.trim(),
            expected,
            "Failed to handle whitespace correctly in: {}",
            input
        );
    }

    Ok(())
}

#[test]
fn test_json_snapshot_round_trip() -> Result<()> {
    let tokenizer = QgTokenizer::train(&corpus(), 500)?;
    let restored = QgTokenizer::from_json(&tokenizer.to_json()?)?;

    assert_eq!(restored.vocab(), tokenizer.vocab());
    let text = "question: What is the capital of France?, context: Paris is the capital of France.";
    assert_eq!(restored.encode(text)?, tokenizer.encode(text)?);

    assert!(QgTokenizer::from_json("{not json").is_err());

    Ok(())
}

fn normalized_text(text: &str) -> String {
    text.chars()
        .filter(|&c| !c.is_whitespace() && !c.is_punctuation())
        .collect::<String>()
        .to_lowercase()
}
