//! Byte-pair-encoding tokenizer adapter.
//!
//! The chunking engine only needs `encode` and `decode`, so it depends on
//! the [`Tokenizer`] trait; [`Cl100kTokenizer`] is the production
//! implementation backed by `tiktoken-rs`.

use anyhow::{anyhow, Result};
use tiktoken_rs::CoreBPE;

pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u32>;

    /// Decode tokens to text. Never fails: a token run that cannot be
    /// decoded yields a shorter (possibly empty) string.
    fn decode(&self, tokens: &[u32]) -> String;
}

/// Longest run of tokens trimmed at either edge when a window splits a
/// multi-byte character. A UTF-8 scalar is at most four bytes and every
/// token covers at least one.
const MAX_EDGE_TRIM: usize = 3;

/// `cl100k_base` encoding, as used by the OpenAI embedding models.
pub struct Cl100kTokenizer {
    bpe: CoreBPE,
}

impl Cl100kTokenizer {
    pub fn new() -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|e| anyhow!("Failed to load cl100k_base encoding: {}", e))?;
        Ok(Self { bpe })
    }

    fn try_decode(&self, tokens: &[u32]) -> Option<String> {
        self.bpe.decode(tokens.to_vec()).ok()
    }
}

impl Tokenizer for Cl100kTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        self.bpe.encode_ordinary(text)
    }

    fn decode(&self, tokens: &[u32]) -> String {
        if let Some(text) = self.try_decode(tokens) {
            return text;
        }

        for head in 0..=MAX_EDGE_TRIM.min(tokens.len()) {
            for tail in 0..=MAX_EDGE_TRIM.min(tokens.len() - head) {
                if head == 0 && tail == 0 {
                    continue;
                }
                let slice = &tokens[head..tokens.len() - tail];
                if slice.is_empty() {
                    continue;
                }
                if let Some(text) = self.try_decode(slice) {
                    tracing::debug!(head, tail, "decoded window after trimming split character");
                    return text;
                }
            }
        }

        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_ascii() {
        let tok = Cl100kTokenizer::new().unwrap();
        let tokens = tok.encode("Hello world. How are you?");
        assert!(!tokens.is_empty());
        assert_eq!(tok.decode(&tokens), "Hello world. How are you?");
    }

    #[test]
    fn test_split_multibyte_window_decodes_lossy() {
        let tok = Cl100kTokenizer::new().unwrap();
        let tokens = tok.encode("日本語のテキスト");
        for end in 1..=tokens.len() {
            let text = tok.decode(&tokens[..end]);
            assert!("日本語のテキスト".contains(&text));
        }
    }

    #[test]
    fn test_empty_input() {
        let tok = Cl100kTokenizer::new().unwrap();
        assert!(tok.encode("").is_empty());
        assert_eq!(tok.decode(&[]), "");
    }
}
