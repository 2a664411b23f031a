//! Greedy sequence generation for encoder/decoder models

use candle_core::{DType, Tensor};
use sumtune_core::error::{Error, Result};
use sumtune_models::{GenerationConfig, Seq2SeqLM, ToTuneResult};

/// Greedy generator driven by a [`GenerationConfig`]
#[derive(Clone, Debug)]
pub struct Generator {
    /// Limit on tokens generated after the decoder start token
    max_new_tokens: usize,

    /// Minimum total length, start token included, before eos may be chosen
    min_length: usize,

    decoder_start_token_id: u32,
    eos_token_id: u32,
    pad_token_id: u32,
    forced_bos_token_id: Option<u32>,
    forced_eos_token_id: Option<u32>,
}

impl Generator {
    /// Create a generator from a generation config
    pub fn new(config: &GenerationConfig) -> Self {
        Self {
            max_new_tokens: config.new_token_budget(),
            min_length: config.min_length.unwrap_or(0),
            decoder_start_token_id: config.decoder_start_token_id,
            eos_token_id: config.eos_token_id,
            pad_token_id: config.pad_token_id,
            forced_bos_token_id: config.forced_bos_token_id,
            forced_eos_token_id: config.forced_eos_token_id,
        }
    }

    /// Override the new-token limit
    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    /// Limit on generated tokens
    pub fn max_new_tokens(&self) -> usize {
        self.max_new_tokens
    }

    /// Pick the next token for one row.
    ///
    /// `cur_len` counts the tokens already in the row, decoder start included.
    pub fn next_token(&self, logits: &[f32], cur_len: usize) -> Result<u32> {
        if cur_len == 1 {
            if let Some(bos) = self.forced_bos_token_id {
                return Ok(bos);
            }
        }
        if cur_len == self.max_new_tokens {
            if let Some(eos) = self.forced_eos_token_id {
                return Ok(eos);
            }
        }

        let suppress_eos = cur_len < self.min_length;
        logits
            .iter()
            .enumerate()
            .filter(|(id, _)| !(suppress_eos && *id as u32 == self.eos_token_id))
            .fold(None, |best: Option<(usize, f32)>, (id, &score)| match best {
                Some((_, best_score)) if best_score >= score => best,
                _ => Some((id, score)),
            })
            .map(|(id, _)| id as u32)
            .ok_or_else(|| Error::Generation("empty logits row".to_string()))
    }

    /// Generate token ids for a padded batch.
    ///
    /// Every returned row starts with the decoder start token. Rows that hit
    /// eos early are filled with the pad id up to the batch's longest row.
    pub fn generate(
        &self,
        model: &dyn Seq2SeqLM,
        input_ids: &Tensor,
        attention_mask: &Tensor,
    ) -> Result<Vec<Vec<u32>>> {
        let (batch, _) = input_ids.dims2().tune_result()?;
        let device = model.device();
        let encoder_states = model
            .encode(input_ids, attention_mask, false)
            .tune_result()?;

        let mut sequences = vec![vec![self.decoder_start_token_id]; batch];
        let mut finished = vec![false; batch];

        for step in 0..self.max_new_tokens {
            let cur_len = step + 1;
            let flat: Vec<u32> = sequences.iter().flatten().copied().collect();
            let decoder_input_ids = Tensor::from_vec(flat, (batch, cur_len), device).tune_result()?;

            let logits = model
                .decode(&decoder_input_ids, &encoder_states, attention_mask, false)
                .and_then(|l| l.narrow(1, cur_len - 1, 1)?.squeeze(1)?.to_dtype(DType::F32))
                .tune_result()?;
            let rows = logits.to_vec2::<f32>().tune_result()?;

            for (row, (sequence, done)) in sequences.iter_mut().zip(finished.iter_mut()).enumerate() {
                if *done {
                    sequence.push(self.pad_token_id);
                    continue;
                }
                let token = self.next_token(&rows[row], cur_len)?;
                sequence.push(token);
                *done = token == self.eos_token_id;
            }

            if finished.iter().all(|&done| done) {
                break;
            }
        }

        tracing::debug!(
            "Generated batch of {} with length {}",
            batch,
            sequences.first().map(Vec::len).unwrap_or(0)
        );
        Ok(sequences)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use sumtune_models::{Seq2SeqConfig, Seq2SeqModel};

    fn generator(max_new_tokens: usize) -> Generator {
        let config = GenerationConfig::from_model_config(&Seq2SeqConfig::tiny(8));
        Generator::new(&config).with_max_new_tokens(max_new_tokens)
    }

    #[test]
    fn test_forced_bos_on_first_step() {
        let g = generator(5);
        assert_eq!(g.next_token(&[0.0, 0.0, 0.0, 9.0], 1).unwrap(), 0);
        assert_eq!(g.next_token(&[0.0, 0.0, 0.0, 9.0], 2).unwrap(), 3);
    }

    #[test]
    fn test_forced_eos_on_last_step() {
        let g = generator(5);
        assert_eq!(g.next_token(&[0.0, 0.0, 0.0, 9.0], 5).unwrap(), 2);
    }

    #[test]
    fn test_min_length_suppresses_eos() {
        let mut config = GenerationConfig::from_model_config(&Seq2SeqConfig::tiny(8));
        config.min_length = Some(4);
        let g = Generator::new(&config).with_max_new_tokens(10);
        let logits = [0.0, 0.0, 9.0, 1.0];
        assert_eq!(g.next_token(&logits, 3).unwrap(), 3);
        assert_eq!(g.next_token(&logits, 4).unwrap(), 2);
    }

    #[test]
    fn test_empty_logits_error() {
        let g = generator(10);
        assert!(g.next_token(&[], 3).is_err());
    }

    #[test]
    fn test_generate_with_tiny_model() {
        let device = Device::Cpu;
        let model = Seq2SeqModel::random(Seq2SeqConfig::tiny(16), &device).unwrap();
        let ids = Tensor::new(&[[0u32, 5, 6, 2], [0, 7, 2, 1]], &device).unwrap();
        let mask = Tensor::new(&[[1u32, 1, 1, 1], [1, 1, 1, 0]], &device).unwrap();

        let g = Generator::new(&GenerationConfig::from_model_config(model.config())).with_max_new_tokens(6);
        let out = g.generate(&model, &ids, &mask).unwrap();

        assert_eq!(out.len(), 2);
        for row in &out {
            assert_eq!(row.len(), out[0].len());
            assert!(row.len() <= 7);
            assert_eq!(row[0], 2);
            assert_eq!(row[1], 0);
            assert!(row.contains(&2));
        }
    }
}
