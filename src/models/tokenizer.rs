// Text codecs - question/answer tokenization
//
// `TextTokenizer` wraps a HuggingFace tokenizer.json (the LXMERT/BERT vocab in
// practice). `WordCodec` is a whitespace word-level vocabulary for small runs.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::path::Path;

/// Ids the decoder and the loss need to know about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub pad: u32,
    pub bos: u32,
    pub eos: u32,
}

impl SpecialTokens {
    pub fn is_special(&self, id: u32) -> bool {
        id == self.pad || id == self.bos || id == self.eos
    }
}

pub trait TextCodec: Send + Sync {
    /// Encode without special tokens
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode, dropping special tokens
    fn decode(&self, ids: &[u32]) -> Result<String>;

    fn vocab_size(&self) -> usize;

    fn special_tokens(&self) -> SpecialTokens;
}

/// HuggingFace tokenizer with BERT-style or BPE-style special tokens
pub struct TextTokenizer {
    inner: tokenizers::Tokenizer,
    special: SpecialTokens,
}

impl TextTokenizer {
    /// Load a tokenizer.json file
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| anyhow!("Failed to load tokenizer {:?}: {}", path, e))?;

        let lookup = |candidates: &[&str]| {
            candidates
                .iter()
                .find_map(|token| inner.token_to_id(token))
                .with_context(|| format!("Tokenizer has none of the tokens {:?}", candidates))
        };
        let special = SpecialTokens {
            pad: lookup(&["[PAD]", "<pad>"])?,
            bos: lookup(&["[CLS]", "<s>", "<bos>"])?,
            eos: lookup(&["[SEP]", "</s>", "<eos>"])?,
        };

        tracing::info!(
            path = %path.display(),
            vocab_size = inner.get_vocab_size(true),
            "Loaded tokenizer"
        );

        Ok(Self { inner, special })
    }
}

impl TextCodec for TextTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| anyhow!("Failed to encode {:?}: {}", text, e))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| anyhow!("Failed to decode {} ids: {}", ids.len(), e))
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn special_tokens(&self) -> SpecialTokens {
        self.special
    }
}

/// Lowercased whitespace vocabulary; ids 0..=3 are pad, bos, eos, unk
#[derive(Debug, Clone)]
pub struct WordCodec {
    words: Vec<String>,
    index: HashMap<String, u32>,
}

impl WordCodec {
    pub const PAD: u32 = 0;
    pub const BOS: u32 = 1;
    pub const EOS: u32 = 2;
    pub const UNK: u32 = 3;

    /// Build from every word seen in `texts`, in first-seen order
    pub fn from_texts<'a>(texts: impl IntoIterator<Item = &'a str>) -> Self {
        let mut words: Vec<String> = ["[PAD]", "[CLS]", "[SEP]", "[UNK]"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut index: HashMap<String, u32> = words
            .iter()
            .enumerate()
            .map(|(i, w)| (w.clone(), i as u32))
            .collect();

        for text in texts {
            for word in normalize(text) {
                if !index.contains_key(&word) {
                    index.insert(word.clone(), words.len() as u32);
                    words.push(word);
                }
            }
        }

        Self { words, index }
    }
}

fn normalize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
}

impl TextCodec for WordCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(normalize(text)
            .map(|w| self.index.get(&w).copied().unwrap_or(Self::UNK))
            .collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let special = self.special_tokens();
        let words: Vec<&str> = ids
            .iter()
            .filter(|&&id| !special.is_special(id))
            .map(|&id| {
                self.words
                    .get(id as usize)
                    .map(String::as_str)
                    .unwrap_or("[UNK]")
            })
            .collect();
        Ok(words.join(" "))
    }

    fn vocab_size(&self) -> usize {
        self.words.len()
    }

    fn special_tokens(&self) -> SpecialTokens {
        SpecialTokens {
            pad: Self::PAD,
            bos: Self::BOS,
            eos: Self::EOS,
        }
    }
}
