//! Batch collation for seq2seq training

use candle_core::{Device, Tensor};
use sumtune_core::error::{Error, Result};
use sumtune_core::training::TokenizedExample;
use sumtune_models::{Seq2SeqConfig, ToTuneResult, IGNORE_INDEX};

/// Padded batch as plain vectors
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaddedBatch {
    /// Inputs padded with the pad id
    pub input_ids: Vec<Vec<u32>>,
    /// 1 for real tokens, 0 for padding
    pub attention_mask: Vec<Vec<u32>>,
    /// Labels padded with -100
    pub labels: Vec<Vec<i64>>,
    /// Labels shifted right behind the decoder start token
    pub decoder_input_ids: Vec<Vec<u32>>,
}

/// Batch of tensors ready for a forward pass
#[derive(Clone, Debug)]
pub struct Seq2SeqBatch {
    /// (batch, src_len) u32
    pub input_ids: Tensor,
    /// (batch, src_len) u32
    pub attention_mask: Tensor,
    /// (batch, tgt_len) i64
    pub labels: Tensor,
    /// (batch, tgt_len) u32
    pub decoder_input_ids: Tensor,
}

impl Seq2SeqBatch {
    /// Number of rows
    pub fn len(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or(0)
    }

    /// Check if the batch has no rows
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pads examples to the longest member of each batch and derives decoder inputs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Seq2SeqCollator {
    pad_token_id: u32,
    decoder_start_token_id: u32,
    label_pad_token_id: i64,
}

impl Seq2SeqCollator {
    /// Create a collator
    pub fn new(pad_token_id: u32, decoder_start_token_id: u32) -> Self {
        Self {
            pad_token_id,
            decoder_start_token_id,
            label_pad_token_id: IGNORE_INDEX,
        }
    }

    /// Take the pad and decoder start ids from a model configuration
    pub fn from_config(config: &Seq2SeqConfig) -> Self {
        Self::new(config.pad_token_id, config.decoder_start_token_id)
    }

    /// Padding id for inputs
    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    /// Pad a batch of examples
    pub fn pad(&self, examples: &[&TokenizedExample]) -> Result<PaddedBatch> {
        if examples.is_empty() {
            return Err(Error::Training("cannot collate an empty batch".to_string()));
        }
        let src_len = examples.iter().map(|e| e.input_ids.len()).max().unwrap_or(0);
        let tgt_len = examples.iter().map(|e| e.labels.len()).max().unwrap_or(0);
        if src_len == 0 || tgt_len == 0 {
            return Err(Error::Training("batch contains an empty sequence".to_string()));
        }

        let mut batch = PaddedBatch {
            input_ids: Vec::with_capacity(examples.len()),
            attention_mask: Vec::with_capacity(examples.len()),
            labels: Vec::with_capacity(examples.len()),
            decoder_input_ids: Vec::with_capacity(examples.len()),
        };

        for example in examples {
            let mut ids = example.input_ids.clone();
            let mut mask = example.attention_mask.clone();
            ids.resize(src_len, self.pad_token_id);
            mask.resize(src_len, 0);

            let mut labels = example.labels.clone();
            labels.resize(tgt_len, self.label_pad_token_id);
            let decoder_input_ids = self.shift_right(&labels);

            batch.input_ids.push(ids);
            batch.attention_mask.push(mask);
            batch.labels.push(labels);
            batch.decoder_input_ids.push(decoder_input_ids);
        }
        Ok(batch)
    }

    /// Decoder inputs: start token followed by all labels but the last,
    /// with ignored positions replaced by the pad id
    pub fn shift_right(&self, labels: &[i64]) -> Vec<u32> {
        std::iter::once(self.decoder_start_token_id)
            .chain(labels.iter().take(labels.len().saturating_sub(1)).map(|&id| {
                if id == self.label_pad_token_id || id < 0 {
                    self.pad_token_id
                } else {
                    id as u32
                }
            }))
            .collect()
    }

    /// Pad a batch and move it to `device`
    pub fn collate(&self, examples: &[&TokenizedExample], device: &Device) -> Result<Seq2SeqBatch> {
        let padded = self.pad(examples)?;
        let b = padded.input_ids.len();
        let src = padded.input_ids[0].len();
        let tgt = padded.labels[0].len();

        let flat_u32 = |rows: Vec<Vec<u32>>, cols: usize| {
            Tensor::from_vec(rows.into_iter().flatten().collect::<Vec<_>>(), (b, cols), device)
        };

        Ok(Seq2SeqBatch {
            input_ids: flat_u32(padded.input_ids, src).tune_result()?,
            attention_mask: flat_u32(padded.attention_mask, src).tune_result()?,
            labels: Tensor::from_vec(
                padded.labels.into_iter().flatten().collect::<Vec<i64>>(),
                (b, tgt),
                device,
            )
            .tune_result()?,
            decoder_input_ids: flat_u32(padded.decoder_input_ids, tgt).tune_result()?,
        })
    }
}
