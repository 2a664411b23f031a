//! Loss functions for seq2seq fine-tuning

use candle_core::{DType, Result as CandleResult, Tensor, D};

/// Label value excluded from the loss
pub const IGNORE_INDEX: i64 = -100;

/// Mean token cross-entropy, skipping positions labelled [`IGNORE_INDEX`].
///
/// * `logits` - (batch, seq_len, vocab_size)
/// * `labels` - (batch, seq_len), `i64`
///
/// Returns a scalar tensor. When every position is ignored the loss is zero.
pub fn masked_cross_entropy(logits: &Tensor, labels: &Tensor) -> CandleResult<Tensor> {
    let (b, t, vocab) = logits.dims3()?;
    let logits = logits.reshape((b * t, vocab))?.to_dtype(DType::F32)?;
    let labels = labels.flatten_all()?.to_dtype(DType::I64)?;

    let keep = labels.ge(0i64)?.to_dtype(DType::F32)?;
    let targets = labels.maximum(0i64)?.to_dtype(DType::U32)?.unsqueeze(1)?;

    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let picked = log_probs.gather(&targets, 1)?.squeeze(1)?;

    let count = keep.sum_all()?.maximum(1f32)?;
    (picked * keep)?.sum_all()?.neg()?.broadcast_div(&count)
}

/// Perplexity for a mean cross-entropy value
pub fn perplexity(loss: f32) -> f32 {
    loss.exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_uniform_logits() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 2, 4), DType::F32, &device).unwrap();
        let labels = Tensor::new(&[[1i64, 3]], &device).unwrap();

        let loss = masked_cross_entropy(&logits, &labels)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_ignored_positions_do_not_count() {
        let device = Device::Cpu;
        let logits = Tensor::new(
            &[[[10f32, 0., 0.], [0., 0., 0.]]],
            &device,
        )
        .unwrap();

        let only_first = Tensor::new(&[[0i64, IGNORE_INDEX]], &device).unwrap();
        let loss = masked_cross_entropy(&logits, &only_first)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(loss < 1e-3);

        let both = Tensor::new(&[[0i64, 1]], &device).unwrap();
        let loss_both = masked_cross_entropy(&logits, &both)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(loss_both > loss);
    }

    #[test]
    fn test_all_ignored_is_zero() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((2, 2, 3), DType::F32, &device).unwrap();
        let labels = Tensor::new(&[[-100i64, -100], [-100, -100]], &device).unwrap();
        let loss = masked_cross_entropy(&logits, &labels)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(loss, 0.0);
    }

    #[test]
    fn test_perplexity() {
        assert!((perplexity(0.0) - 1.0).abs() < 1e-6);
    }
}
