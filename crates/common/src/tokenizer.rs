//! Tokeniser wrapper with batch padding and truncation.
//!
//! Wraps a HuggingFace `tokenizer.json` or, for mock runs and tests, a plain
//! byte-level vocabulary (256 byte ids + one EOS id). Padding is done here,
//! not by the backend, so both backends pad identically.

use std::path::Path;

use anyhow::{Context, Result as AnyhowResult};
use candle_core::{Device, Result, Tensor};
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

/// EOS id of the byte-level vocabulary.
pub const BYTE_EOS_ID: u32 = 256;
/// Vocabulary size of the byte-level tokeniser.
pub const BYTE_VOCAB_SIZE: usize = 257;

const META_FILE: &str = "tokenizer_meta.json";
const HF_FILE: &str = "tokenizer.json";

const EOS_CANDIDATES: &[&str] = &["</s>", "<|endoftext|>", "<eos>", "[SEP]"];
const PAD_CANDIDATES: &[&str] = &["<pad>", "[PAD]", "<|pad|>"];

/// Which end of a sequence receives pad tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaddingSide {
    /// Generation: prompts end at the same column.
    Left,
    /// Scoring and fine-tuning: sequences start at column 0.
    Right,
}

enum Backend {
    Hf(Box<Tokenizer>),
    Bytes,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenizerMeta {
    kind: String,
    pad_token_id: Option<u32>,
    eos_token_id: u32,
    padding_side: PaddingSide,
}

/// Padded batch of token ids and its attention mask (1 = real token).
#[derive(Debug, Clone)]
pub struct EncodedBatch {
    pub input_ids: Vec<Vec<u32>>,
    pub attention_mask: Vec<Vec<u32>>,
}

impl EncodedBatch {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.first().map_or(0, Vec::len)
    }

    /// `(input_ids: u32 (b, t), attention_mask: f32 (b, t))`.
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let (b, t) = (self.len(), self.seq_len());
        let ids: Vec<u32> = self.input_ids.iter().flatten().copied().collect();
        let mask: Vec<f32> = self
            .attention_mask
            .iter()
            .flatten()
            .map(|&m| m as f32)
            .collect();
        let ids = Tensor::from_vec(ids, (b, t), device)?;
        let mask = Tensor::from_vec(mask, (b, t), device)?;
        Ok((ids, mask))
    }
}

pub struct TextTokenizer {
    backend: Backend,
    pad_token_id: Option<u32>,
    eos_token_id: u32,
    padding_side: PaddingSide,
}

impl TextTokenizer {
    /// Load a HuggingFace `tokenizer.json`.
    pub fn from_file(path: &Path) -> AnyhowResult<Self> {
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| anyhow::anyhow!("load tokenizer {}: {e}", path.display()))?;
        let eos_token_id = EOS_CANDIDATES
            .iter()
            .find_map(|t| tokenizer.token_to_id(t))
            .with_context(|| format!("no end-of-sequence token in {}", path.display()))?;
        let pad_token_id = PAD_CANDIDATES.iter().find_map(|t| tokenizer.token_to_id(t));
        Ok(Self {
            backend: Backend::Hf(Box::new(tokenizer)),
            pad_token_id,
            eos_token_id,
            padding_side: PaddingSide::Right,
        })
    }

    /// Byte-level tokeniser. Has no pad token until [`ensure_pad_token`](Self::ensure_pad_token).
    pub fn byte_level() -> Self {
        Self {
            backend: Backend::Bytes,
            pad_token_id: None,
            eos_token_id: BYTE_EOS_ID,
            padding_side: PaddingSide::Right,
        }
    }

    /// Assign EOS as the pad token when none is defined.
    pub fn ensure_pad_token(&mut self) {
        if self.pad_token_id.is_none() {
            self.pad_token_id = Some(self.eos_token_id);
        }
    }

    pub fn with_padding_side(mut self, side: PaddingSide) -> Self {
        self.padding_side = side;
        self
    }

    pub fn set_padding_side(&mut self, side: PaddingSide) {
        self.padding_side = side;
    }

    pub fn padding_side(&self) -> PaddingSide {
        self.padding_side
    }

    pub fn pad_token_id(&self) -> Option<u32> {
        self.pad_token_id
    }

    pub fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    pub fn vocab_size(&self) -> usize {
        match &self.backend {
            Backend::Hf(t) => t.get_vocab_size(true),
            Backend::Bytes => BYTE_VOCAB_SIZE,
        }
    }

    /// Encode without special tokens.
    pub fn encode(&self, text: &str) -> AnyhowResult<Vec<u32>> {
        match &self.backend {
            Backend::Hf(t) => {
                let encoding = t
                    .encode(text, false)
                    .map_err(|e| anyhow::anyhow!("encode: {e}"))?;
                Ok(encoding.get_ids().to_vec())
            }
            Backend::Bytes => Ok(text.bytes().map(u32::from).collect()),
        }
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> AnyhowResult<String> {
        let ids: Vec<u32> = if skip_special_tokens {
            ids.iter()
                .copied()
                .filter(|&id| id != self.eos_token_id && Some(id) != self.pad_token_id)
                .collect()
        } else {
            ids.to_vec()
        };
        match &self.backend {
            Backend::Hf(t) => t
                .decode(&ids, skip_special_tokens)
                .map_err(|e| anyhow::anyhow!("decode: {e}")),
            Backend::Bytes => {
                let bytes: Vec<u8> = ids
                    .iter()
                    .filter_map(|&id| u8::try_from(id).ok())
                    .collect();
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
        }
    }

    pub fn batch_decode(
        &self,
        sequences: &[Vec<u32>],
        skip_special_tokens: bool,
    ) -> AnyhowResult<Vec<String>> {
        sequences
            .iter()
            .map(|ids| self.decode(ids, skip_special_tokens))
            .collect()
    }

    /// Encode, truncate each sequence to `max_length` tokens (keeping the
    /// start), and pad to the longest sequence on the configured side.
    pub fn encode_batch(
        &self,
        texts: &[String],
        max_length: Option<usize>,
    ) -> AnyhowResult<EncodedBatch> {
        self.encode_batch_with_side(texts, max_length, self.padding_side)
    }

    /// [`encode_batch`](Self::encode_batch) with an explicit padding side,
    /// for callers that share one tokeniser between generation and scoring.
    pub fn encode_batch_with_side(
        &self,
        texts: &[String],
        max_length: Option<usize>,
        side: PaddingSide,
    ) -> AnyhowResult<EncodedBatch> {
        let pad = self
            .pad_token_id
            .context("tokenizer has no pad token; call ensure_pad_token first")?;
        let mut encoded = Vec::with_capacity(texts.len());
        for text in texts {
            let mut ids = self.encode(text)?;
            if let Some(max) = max_length {
                ids.truncate(max);
            }
            encoded.push(ids);
        }
        let width = encoded.iter().map(Vec::len).max().unwrap_or(0);

        let mut input_ids = Vec::with_capacity(encoded.len());
        let mut attention_mask = Vec::with_capacity(encoded.len());
        for ids in encoded {
            let n_pad = width - ids.len();
            let mut row = Vec::with_capacity(width);
            let mut mask = Vec::with_capacity(width);
            if side == PaddingSide::Left {
                row.extend(std::iter::repeat(pad).take(n_pad));
                mask.extend(std::iter::repeat(0).take(n_pad));
            }
            mask.extend(std::iter::repeat(1).take(ids.len()));
            row.extend(ids);
            if side == PaddingSide::Right {
                row.extend(std::iter::repeat(pad).take(n_pad));
                mask.extend(std::iter::repeat(0).take(n_pad));
            }
            input_ids.push(row);
            attention_mask.push(mask);
        }
        Ok(EncodedBatch {
            input_ids,
            attention_mask,
        })
    }

    /// Write the tokeniser (and its pad/EOS/padding-side settings) to `dir`.
    pub fn save(&self, dir: &Path) -> AnyhowResult<()> {
        std::fs::create_dir_all(dir)?;
        let kind = match &self.backend {
            Backend::Hf(t) => {
                t.save(dir.join(HF_FILE), false)
                    .map_err(|e| anyhow::anyhow!("save tokenizer: {e}"))?;
                "hf"
            }
            Backend::Bytes => "bytes",
        };
        let meta = TokenizerMeta {
            kind: kind.to_string(),
            pad_token_id: self.pad_token_id,
            eos_token_id: self.eos_token_id,
            padding_side: self.padding_side,
        };
        std::fs::write(dir.join(META_FILE), serde_json::to_string_pretty(&meta)?)?;
        Ok(())
    }

    /// Load from a directory written by [`save`](Self::save), or from a bare
    /// `tokenizer.json` directory.
    pub fn load(dir: &Path) -> AnyhowResult<Self> {
        let meta_path = dir.join(META_FILE);
        if !meta_path.exists() {
            return Self::from_file(&dir.join(HF_FILE));
        }
        let meta: TokenizerMeta = serde_json::from_str(
            &std::fs::read_to_string(&meta_path)
                .with_context(|| format!("read {}", meta_path.display()))?,
        )?;
        let mut tokenizer = match meta.kind.as_str() {
            "bytes" => Self::byte_level(),
            _ => Self::from_file(&dir.join(HF_FILE))?,
        };
        tokenizer.pad_token_id = meta.pad_token_id;
        tokenizer.eos_token_id = meta.eos_token_id;
        tokenizer.padding_side = meta.padding_side;
        Ok(tokenizer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tok(side: PaddingSide) -> TextTokenizer {
        let mut t = TextTokenizer::byte_level().with_padding_side(side);
        t.ensure_pad_token();
        t
    }

    #[test]
    fn pad_defaults_to_eos() {
        let t = tok(PaddingSide::Right);
        assert_eq!(t.pad_token_id(), Some(BYTE_EOS_ID));
    }

    #[test]
    fn encode_batch_requires_pad() {
        let t = TextTokenizer::byte_level();
        assert!(t.encode_batch(&["a".to_string()], None).is_err());
    }

    #[test]
    fn right_padding_and_truncation() {
        let t = tok(PaddingSide::Right);
        let batch = t
            .encode_batch(&["abcdef".to_string(), "ab".to_string()], Some(4))
            .unwrap();
        assert_eq!(batch.seq_len(), 4);
        assert_eq!(batch.input_ids[0], vec![97, 98, 99, 100]);
        assert_eq!(batch.input_ids[1], vec![97, 98, BYTE_EOS_ID, BYTE_EOS_ID]);
        assert_eq!(batch.attention_mask[1], vec![1, 1, 0, 0]);
    }

    #[test]
    fn left_padding() {
        let t = tok(PaddingSide::Left);
        let batch = t
            .encode_batch(&["abc".to_string(), "a".to_string()], None)
            .unwrap();
        assert_eq!(batch.input_ids[1], vec![BYTE_EOS_ID, BYTE_EOS_ID, 97]);
        assert_eq!(batch.attention_mask[1], vec![0, 0, 1]);
        let (ids, mask) = batch.to_tensors(&Device::Cpu).unwrap();
        assert_eq!(ids.dims(), &[2, 3]);
        assert_eq!(mask.to_vec2::<f32>().unwrap()[1], vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn decode_skips_special_tokens() {
        let t = tok(PaddingSide::Right);
        let text = t.decode(&[BYTE_EOS_ID, 104, 105, BYTE_EOS_ID], true).unwrap();
        assert_eq!(text, "hi");
    }

    #[test]
    fn save_and_load_byte_level() {
        let dir = tempfile::tempdir().unwrap();
        let t = tok(PaddingSide::Left);
        t.save(dir.path()).unwrap();
        let loaded = TextTokenizer::load(dir.path()).unwrap();
        assert_eq!(loaded.pad_token_id(), Some(BYTE_EOS_ID));
        assert_eq!(loaded.padding_side(), PaddingSide::Left);
        assert_eq!(loaded.vocab_size(), BYTE_VOCAB_SIZE);
    }
}
