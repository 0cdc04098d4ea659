use std::str::FromStr;

use tokenizers::decoders::wordpiece::WordPiece as WordPieceDecoder;
use tokenizers::models::wordpiece::{WordPiece, WordPieceTrainer};
use tokenizers::normalizers::{Sequence as NormalizerSequence, StripAccents, NFD};
use tokenizers::pre_tokenizers::{
    punctuation::Punctuation, sequence::Sequence as PreTokenizerSequence, whitespace::Whitespace,
    PreTokenizerWrapper,
};
use tokenizers::processors::PostProcessorWrapper;
use tokenizers::{AddedToken, Tokenizer, TokenizerBuilder, TokenizerImpl};
use tracing::debug;

use crate::error::{QgError, Result};
use crate::formatter::HIGHLIGHT_TOKEN;
use crate::runtime::VocabSpec;

pub const PAD_TOKEN: &str = "[PAD]";
pub const UNK_TOKEN: &str = "[UNK]";
pub const BOS_TOKEN: &str = "[BOS]";
pub const EOS_TOKEN: &str = "[EOS]";

pub const DEFAULT_VOCAB_SIZE: usize = 30000;

type WordPieceTokenizer = TokenizerImpl<
    WordPiece,
    NormalizerSequence,
    PreTokenizerSequence,
    PostProcessorWrapper,
    WordPieceDecoder,
>;

/// WordPiece tokenizer shared by every task, with the highlight marker and
/// decoder control tokens registered as special tokens.
#[derive(Clone)]
pub struct QgTokenizer {
    tokenizer: Tokenizer,
    vocab: VocabSpec,
}

impl QgTokenizer {
    /// Trains a fresh vocabulary over the formatted training texts.
    pub fn train<S>(texts: &[S], vocab_size: usize) -> Result<Self>
    where
        S: AsRef<str> + Sync,
    {
        let normalizer = NormalizerSequence::new(vec![NFD.into(), StripAccents.into()]);
        let decoder = WordPieceDecoder::default();

        let pre_tokenizer = PreTokenizerSequence::new(vec![
            PreTokenizerWrapper::Whitespace(Whitespace::default()),
            PreTokenizerWrapper::Punctuation(Punctuation::default()),
        ]);

        let mut tokenizer: WordPieceTokenizer = TokenizerBuilder::new()
            .with_model(WordPiece::default())
            .with_normalizer(Some(normalizer))
            .with_pre_tokenizer(Some(pre_tokenizer))
            .with_post_processor(None)
            .with_decoder(Some(decoder))
            .build()
            .map_err(|e| QgError::Tokenizer(format!("failed to build tokenizer: {e}")))?;

        let mut trainer = WordPieceTrainer::builder()
            .vocab_size(vocab_size)
            .min_frequency(2)
            .show_progress(false)
            .special_tokens(vec![
                AddedToken::from(PAD_TOKEN, true),
                AddedToken::from(UNK_TOKEN, true),
                AddedToken::from(BOS_TOKEN, true),
                AddedToken::from(EOS_TOKEN, true),
                AddedToken::from(HIGHLIGHT_TOKEN, true),
            ])
            .continuing_subword_prefix("##".to_string())
            .build();

        tokenizer
            .train(&mut trainer, texts.iter())
            .map_err(|e| QgError::Tokenizer(format!("failed to train tokenizer: {e}")))?;

        let tokenizer: Tokenizer = tokenizer.into();
        let vocab = resolve_vocab(&tokenizer)?;
        debug!(
            "trained tokenizer over {} texts, vocabulary size {}",
            texts.len(),
            vocab.size
        );

        Ok(Self { tokenizer, vocab })
    }

    /// Restores a tokenizer from its JSON snapshot.
    pub fn from_json(json: &str) -> Result<Self> {
        let tokenizer = Tokenizer::from_str(json)
            .map_err(|e| QgError::Tokenizer(format!("failed to parse tokenizer: {e}")))?;
        let vocab = resolve_vocab(&tokenizer)?;
        Ok(Self { tokenizer, vocab })
    }

    pub fn to_json(&self) -> Result<String> {
        self.tokenizer
            .to_string(false)
            .map_err(|e| QgError::Tokenizer(format!("failed to serialize tokenizer: {e}")))
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| QgError::Tokenizer(format!("failed to encode: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Encodes a decoder target, terminated by `[EOS]`.
    pub fn encode_target(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = self.encode(text)?;
        ids.push(self.vocab.eos_id);
        Ok(ids)
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        let decoded = self
            .tokenizer
            .decode(ids, true)
            .map_err(|e| QgError::Tokenizer(format!("failed to decode: {e}")))?;

        Ok(decoded.trim().to_string())
    }

    pub fn vocab(&self) -> VocabSpec {
        self.vocab
    }

    pub fn get_vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}

fn resolve_vocab(tokenizer: &Tokenizer) -> Result<VocabSpec> {
    let id = |token: &str| {
        tokenizer
            .token_to_id(token)
            .ok_or_else(|| QgError::Tokenizer(format!("special token {token} missing from vocabulary")))
    };
    Ok(VocabSpec {
        size: tokenizer.get_vocab_size(true),
        pad_id: id(PAD_TOKEN)?,
        bos_id: id(BOS_TOKEN)?,
        eos_id: id(EOS_TOKEN)?,
        highlight_id: id(HIGHLIGHT_TOKEN)?,
    })
}
