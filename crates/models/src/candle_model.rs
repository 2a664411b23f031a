//! Candle glue: error mapping, device/dtype conversion and the seq2seq model trait

use crate::config::Seq2SeqConfig;
use candle_core::{Device as CandleDevice, DType as CandleDType, Result as CandleResult, Tensor};
use sumtune_core::error::{DType as TuneDType, Device as TuneDevice, Error, Result};

/// Convert a CandleResult to a sumtune Result
pub trait ToTuneResult<T> {
    /// Map a candle error into [`Error::Training`]
    fn tune_result(self) -> Result<T>;

    /// Map a candle error into [`Error::ModelLoading`]
    fn loading_result(self) -> Result<T>;
}

impl<T> ToTuneResult<T> for CandleResult<T> {
    fn tune_result(self) -> Result<T> {
        self.map_err(|e| Error::Training(e.to_string()))
    }

    fn loading_result(self) -> Result<T> {
        self.map_err(|e| Error::ModelLoading(e.to_string()))
    }
}

/// Convert a sumtune device to a Candle device, falling back to the CPU
pub fn to_candle_device(device: &TuneDevice) -> CandleDevice {
    match device {
        TuneDevice::Cpu => CandleDevice::Cpu,
        TuneDevice::Gpu(id) => CandleDevice::new_cuda(*id as usize).unwrap_or_else(|e| {
            tracing::warn!("CUDA device {} unavailable ({}), using CPU", id, e);
            CandleDevice::Cpu
        }),
        TuneDevice::Metal => CandleDevice::new_metal(0).unwrap_or_else(|e| {
            tracing::warn!("Metal device unavailable ({}), using CPU", e);
            CandleDevice::Cpu
        }),
    }
}

/// Convert a sumtune dtype to a Candle dtype
pub fn to_candle_dtype(dtype: &TuneDType) -> CandleDType {
    match dtype {
        TuneDType::F32 => CandleDType::F32,
        TuneDType::F16 => CandleDType::F16,
        TuneDType::BF16 => CandleDType::BF16,
    }
}

/// Encoder/decoder language model
pub trait Seq2SeqLM {
    /// Model configuration
    fn config(&self) -> &Seq2SeqConfig;

    /// Device holding the weights
    fn device(&self) -> &CandleDevice;

    /// Encode `input_ids` (batch, src_len) into hidden states (batch, src_len, d_model)
    fn encode(&self, input_ids: &Tensor, attention_mask: &Tensor, train: bool) -> CandleResult<Tensor>;

    /// Decoder logits (batch, tgt_len, vocab) for `decoder_input_ids` given encoder states
    fn decode(
        &self,
        decoder_input_ids: &Tensor,
        encoder_hidden_states: &Tensor,
        encoder_attention_mask: &Tensor,
        train: bool,
    ) -> CandleResult<Tensor>;

    /// Full forward pass
    fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        decoder_input_ids: &Tensor,
        train: bool,
    ) -> CandleResult<Tensor> {
        let encoder_hidden_states = self.encode(input_ids, attention_mask, train)?;
        self.decode(decoder_input_ids, &encoder_hidden_states, attention_mask, train)
    }
}
