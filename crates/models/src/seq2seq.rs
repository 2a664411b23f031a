//! BART-style encoder/decoder on candle
//!
//! Post-layer-norm transformer with learned position embeddings (offset by 2),
//! token embeddings shared between encoder, decoder and the LM head, and a
//! `final_logits_bias`. Tensor names follow the Hugging Face BART layout
//! (`model.encoder.layers.0.self_attn.q_proj.weight`, ...), so checkpoints load
//! without renaming.

use crate::candle_model::{Seq2SeqLM, ToTuneResult};
use crate::config::{Activation, Seq2SeqConfig};
use crate::lora_layer::LoraLinear;
use candle_core::{DType, Device, Module, ModuleT, Result as CandleResult, Tensor};
use candle_nn::{Dropout, Embedding, LayerNorm, VarBuilder, VarMap};
use std::collections::HashMap;
use std::path::Path;
use sumtune_core::error::{Error, Result};

/// Weights file written by [`Seq2SeqModel::save_pretrained`]
pub const WEIGHTS_FILE: &str = "model.safetensors";
/// Config file written by [`Seq2SeqModel::save_pretrained`]
pub const CONFIG_FILE: &str = "config.json";

const MASK_VALUE: f64 = -1e9;

/// Additive padding mask (batch, 1, 1, src_len): 0 where attended, a large negative value elsewhere
pub fn padding_mask(attention_mask: &Tensor, dtype: DType) -> CandleResult<Tensor> {
    let (b, s) = attention_mask.dims2()?;
    attention_mask
        .to_dtype(DType::F32)?
        .affine(-MASK_VALUE, MASK_VALUE)?
        .reshape((b, 1, 1, s))?
        .to_dtype(dtype)
}

/// Additive causal mask (1, 1, len, len)
pub fn causal_mask(len: usize, dtype: DType, device: &Device) -> CandleResult<Tensor> {
    let mask: Vec<f32> = (0..len)
        .flat_map(|i| (0..len).map(move |j| if j > i { MASK_VALUE as f32 } else { 0.0 }))
        .collect();
    Tensor::from_vec(mask, (1, 1, len, len), device)?.to_dtype(dtype)
}

#[derive(Clone, Debug)]
struct Attention {
    q_proj: LoraLinear,
    k_proj: LoraLinear,
    v_proj: LoraLinear,
    out_proj: LoraLinear,
    num_heads: usize,
    head_dim: usize,
    dropout: Dropout,
}

impl Attention {
    fn load(d_model: usize, num_heads: usize, dropout: f32, vb: VarBuilder) -> CandleResult<Self> {
        Ok(Self {
            q_proj: LoraLinear::load(d_model, d_model, vb.pp("q_proj"))?,
            k_proj: LoraLinear::load(d_model, d_model, vb.pp("k_proj"))?,
            v_proj: LoraLinear::load(d_model, d_model, vb.pp("v_proj"))?,
            out_proj: LoraLinear::load(d_model, d_model, vb.pp("out_proj"))?,
            num_heads,
            head_dim: d_model / num_heads,
            dropout: Dropout::new(dropout),
        })
    }

    fn split_heads(&self, xs: &Tensor) -> CandleResult<Tensor> {
        let (b, t, _) = xs.dims3()?;
        xs.reshape((b, t, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// `kv` is `None` for self-attention
    fn forward(
        &self,
        xs: &Tensor,
        kv: Option<&Tensor>,
        mask: Option<&Tensor>,
        train: bool,
    ) -> CandleResult<Tensor> {
        let (b, t, d) = xs.dims3()?;
        let kv = kv.unwrap_or(xs);
        let scale = (self.head_dim as f64).powf(-0.5);

        let q = self.split_heads(&self.q_proj.forward_t(xs, train)?.affine(scale, 0.0)?)?;
        let k = self.split_heads(&self.k_proj.forward_t(kv, train)?)?;
        let v = self.split_heads(&self.v_proj.forward_t(kv, train)?)?;

        let mut scores = q.matmul(&k.t()?)?;
        if let Some(mask) = mask {
            scores = scores.broadcast_add(mask)?;
        }
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        let probs = self.dropout.forward_t(&probs, train)?;

        let out = probs.matmul(&v)?.transpose(1, 2)?.reshape((b, t, d))?;
        self.out_proj.forward_t(&out, train)
    }

    fn projections_mut(&mut self, prefix: &str) -> Vec<(String, &mut LoraLinear)> {
        vec![
            (format!("{}.q_proj", prefix), &mut self.q_proj),
            (format!("{}.k_proj", prefix), &mut self.k_proj),
            (format!("{}.v_proj", prefix), &mut self.v_proj),
            (format!("{}.out_proj", prefix), &mut self.out_proj),
        ]
    }

    fn projections(&self) -> [&LoraLinear; 4] {
        [&self.q_proj, &self.k_proj, &self.v_proj, &self.out_proj]
    }
}

#[derive(Clone, Debug)]
struct FeedForward {
    fc1: LoraLinear,
    fc2: LoraLinear,
    activation: Activation,
    activation_dropout: Dropout,
}

impl FeedForward {
    fn load(
        d_model: usize,
        ffn_dim: usize,
        config: &Seq2SeqConfig,
        vb: &VarBuilder,
    ) -> CandleResult<Self> {
        Ok(Self {
            fc1: LoraLinear::load(d_model, ffn_dim, vb.pp("fc1"))?,
            fc2: LoraLinear::load(ffn_dim, d_model, vb.pp("fc2"))?,
            activation: config.activation_function,
            activation_dropout: Dropout::new(config.activation_dropout),
        })
    }

    fn forward(&self, xs: &Tensor, train: bool) -> CandleResult<Tensor> {
        let xs = self.activation.apply(&self.fc1.forward_t(xs, train)?)?;
        let xs = self.activation_dropout.forward_t(&xs, train)?;
        self.fc2.forward_t(&xs, train)
    }
}

#[derive(Clone, Debug)]
struct EncoderLayer {
    self_attn: Attention,
    self_attn_layer_norm: LayerNorm,
    ffn: FeedForward,
    final_layer_norm: LayerNorm,
    dropout: Dropout,
}

impl EncoderLayer {
    fn load(config: &Seq2SeqConfig, vb: VarBuilder) -> CandleResult<Self> {
        let d = config.d_model;
        Ok(Self {
            self_attn: Attention::load(
                d,
                config.encoder_attention_heads,
                config.attention_dropout,
                vb.pp("self_attn"),
            )?,
            self_attn_layer_norm: candle_nn::layer_norm(d, 1e-5, vb.pp("self_attn_layer_norm"))?,
            ffn: FeedForward::load(d, config.encoder_ffn_dim, config, &vb)?,
            final_layer_norm: candle_nn::layer_norm(d, 1e-5, vb.pp("final_layer_norm"))?,
            dropout: Dropout::new(config.dropout),
        })
    }

    fn forward(&self, xs: &Tensor, mask: &Tensor, train: bool) -> CandleResult<Tensor> {
        let h = self.self_attn.forward(xs, None, Some(mask), train)?;
        let xs = self
            .self_attn_layer_norm
            .forward(&(xs + self.dropout.forward_t(&h, train)?)?)?;

        let h = self.ffn.forward(&xs, train)?;
        self.final_layer_norm
            .forward(&(xs + self.dropout.forward_t(&h, train)?)?)
    }
}

#[derive(Clone, Debug)]
struct DecoderLayer {
    self_attn: Attention,
    self_attn_layer_norm: LayerNorm,
    encoder_attn: Attention,
    encoder_attn_layer_norm: LayerNorm,
    ffn: FeedForward,
    final_layer_norm: LayerNorm,
    dropout: Dropout,
}

impl DecoderLayer {
    fn load(config: &Seq2SeqConfig, vb: VarBuilder) -> CandleResult<Self> {
        let d = config.d_model;
        let heads = config.decoder_attention_heads;
        Ok(Self {
            self_attn: Attention::load(d, heads, config.attention_dropout, vb.pp("self_attn"))?,
            self_attn_layer_norm: candle_nn::layer_norm(d, 1e-5, vb.pp("self_attn_layer_norm"))?,
            encoder_attn: Attention::load(d, heads, config.attention_dropout, vb.pp("encoder_attn"))?,
            encoder_attn_layer_norm: candle_nn::layer_norm(
                d,
                1e-5,
                vb.pp("encoder_attn_layer_norm"),
            )?,
            ffn: FeedForward::load(d, config.decoder_ffn_dim, config, &vb)?,
            final_layer_norm: candle_nn::layer_norm(d, 1e-5, vb.pp("final_layer_norm"))?,
            dropout: Dropout::new(config.dropout),
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        encoder_states: &Tensor,
        self_mask: &Tensor,
        cross_mask: &Tensor,
        train: bool,
    ) -> CandleResult<Tensor> {
        let h = self.self_attn.forward(xs, None, Some(self_mask), train)?;
        let xs = self
            .self_attn_layer_norm
            .forward(&(xs + self.dropout.forward_t(&h, train)?)?)?;

        let h = self
            .encoder_attn
            .forward(&xs, Some(encoder_states), Some(cross_mask), train)?;
        let xs = self
            .encoder_attn_layer_norm
            .forward(&(xs + self.dropout.forward_t(&h, train)?)?)?;

        let h = self.ffn.forward(&xs, train)?;
        self.final_layer_norm
            .forward(&(xs + self.dropout.forward_t(&h, train)?)?)
    }
}

/// Token embedding + learned positions + embedding layer norm
#[derive(Clone, Debug)]
struct EmbeddingStack {
    embed_positions: Embedding,
    layernorm_embedding: LayerNorm,
    embed_scale: f64,
    dropout: Dropout,
}

impl EmbeddingStack {
    fn load(config: &Seq2SeqConfig, vb: &VarBuilder) -> CandleResult<Self> {
        Ok(Self {
            embed_positions: candle_nn::embedding(
                config.max_position_embeddings + Seq2SeqConfig::POSITION_OFFSET,
                config.d_model,
                vb.pp("embed_positions"),
            )?,
            layernorm_embedding: candle_nn::layer_norm(
                config.d_model,
                1e-5,
                vb.pp("layernorm_embedding"),
            )?,
            embed_scale: if config.scale_embedding {
                (config.d_model as f64).sqrt()
            } else {
                1.0
            },
            dropout: Dropout::new(config.dropout),
        })
    }

    fn forward(&self, shared: &Embedding, ids: &Tensor, train: bool) -> CandleResult<Tensor> {
        let (_, len) = ids.dims2()?;
        let offset = Seq2SeqConfig::POSITION_OFFSET as u32;
        let positions = Tensor::arange(offset, offset + len as u32, ids.device())?;

        let tokens = shared.forward(ids)?.affine(self.embed_scale, 0.0)?;
        let xs = tokens.broadcast_add(&self.embed_positions.forward(&positions)?)?;
        let xs = self.layernorm_embedding.forward(&xs)?;
        self.dropout.forward_t(&xs, train)
    }
}

/// Encoder/decoder summarization model
#[derive(Clone, Debug)]
pub struct Seq2SeqModel {
    config: Seq2SeqConfig,
    shared: Embedding,
    encoder_embeddings: EmbeddingStack,
    encoder_layers: Vec<EncoderLayer>,
    decoder_embeddings: EmbeddingStack,
    decoder_layers: Vec<DecoderLayer>,
    lm_head: candle_nn::Linear,
    final_logits_bias: Tensor,
    weights: HashMap<String, Tensor>,
    device: Device,
    dtype: DType,
}

impl Seq2SeqModel {
    /// Build the model from named tensors
    pub fn from_weights(
        config: Seq2SeqConfig,
        weights: HashMap<String, Tensor>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let weights = weights
            .into_iter()
            .map(|(name, t)| Ok((name, t.to_dtype(dtype)?.to_device(device)?)))
            .collect::<CandleResult<HashMap<_, _>>>()
            .loading_result()?;

        let vb = VarBuilder::from_tensors(weights.clone(), dtype, device);
        Self::load(config, vb, weights, dtype, device).loading_result()
    }

    /// Load safetensors files (one file or all shards of a checkpoint)
    pub fn from_safetensors(
        config: Seq2SeqConfig,
        files: &[impl AsRef<Path>],
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        if files.is_empty() {
            return Err(Error::ModelLoading("no weight files given".to_string()));
        }
        let mut weights = HashMap::new();
        for file in files {
            let file = file.as_ref();
            let tensors = candle_core::safetensors::load(file, device).map_err(|e| {
                Error::ModelLoading(format!("Failed to read {}: {}", file.display(), e))
            })?;
            weights.extend(tensors);
        }
        Self::from_weights(config, weights, dtype, device)
    }

    /// Randomly initialised model
    pub fn random(config: Seq2SeqConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let std = config.init_std;

        // create every tensor with a BART-like initialisation before loading
        let d = config.d_model;
        let init_normal = candle_nn::Init::Randn { mean: 0.0, stdev: std };
        vb.get_with_hints((config.vocab_size, d), "model.shared.weight", init_normal)
            .loading_result()?;
        for side in ["encoder", "decoder"] {
            vb.get_with_hints(
                (config.max_position_embeddings + Seq2SeqConfig::POSITION_OFFSET, d),
                &format!("model.{}.embed_positions.weight", side),
                init_normal,
            )
            .loading_result()?;
        }
        let init_vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        Self::load(config.clone(), init_vb, HashMap::new(), DType::F32, device).loading_result()?;

        let data = varmap
            .data()
            .lock()
            .map_err(|e| Error::ModelLoading(format!("variable store poisoned: {}", e)))?;
        let weights = data
            .iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
            .collect::<CandleResult<HashMap<_, _>>>()
            .loading_result()?;
        drop(data);

        Self::from_weights(config, weights, DType::F32, device)
    }

    fn load(
        config: Seq2SeqConfig,
        vb: VarBuilder,
        mut weights: HashMap<String, Tensor>,
        dtype: DType,
        device: &Device,
    ) -> CandleResult<Self> {
        let d = config.d_model;
        let model_vb = vb.pp("model");

        let shared_name = if model_vb.contains_tensor("shared.weight") {
            "shared"
        } else {
            "encoder.embed_tokens"
        };
        let shared = candle_nn::embedding(config.vocab_size, d, model_vb.pp(shared_name))?;

        let enc_vb = model_vb.pp("encoder");
        let encoder_embeddings = EmbeddingStack::load(&config, &enc_vb)?;
        let encoder_layers = (0..config.encoder_layers)
            .map(|i| EncoderLayer::load(&config, enc_vb.pp("layers").pp(i)))
            .collect::<CandleResult<Vec<_>>>()?;

        let dec_vb = model_vb.pp("decoder");
        let decoder_embeddings = EmbeddingStack::load(&config, &dec_vb)?;
        let decoder_layers = (0..config.decoder_layers)
            .map(|i| DecoderLayer::load(&config, dec_vb.pp("layers").pp(i)))
            .collect::<CandleResult<Vec<_>>>()?;

        let final_logits_bias = if vb.contains_tensor("final_logits_bias") {
            vb.get((1, config.vocab_size), "final_logits_bias")?
        } else {
            let bias = Tensor::zeros((1, config.vocab_size), dtype, device)?;
            weights.insert("final_logits_bias".to_string(), bias.clone());
            bias
        };
        let lm_head = candle_nn::Linear::new(shared.embeddings().clone(), None);

        Ok(Self {
            config,
            shared,
            encoder_embeddings,
            encoder_layers,
            decoder_embeddings,
            decoder_layers,
            lm_head,
            final_logits_bias,
            weights,
            device: device.clone(),
            dtype,
        })
    }

    /// Write `model.safetensors` and `config.json` into `dir`
    pub fn save_pretrained(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        candle_core::safetensors::save(&self.weights, dir.join(WEIGHTS_FILE)).tune_result()?;
        self.config.save_json(dir.join(CONFIG_FILE))?;
        tracing::info!("Saved model weights to {}", dir.display());
        Ok(())
    }

    /// Base weights by name
    pub fn weights(&self) -> &HashMap<String, Tensor> {
        &self.weights
    }

    /// Tensor dtype
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Number of base parameters
    pub fn num_parameters(&self) -> usize {
        self.weights.values().map(Tensor::elem_count).sum()
    }

    /// Every projection with its module path
    pub fn projections_mut(&mut self) -> Vec<(String, &mut LoraLinear)> {
        let mut out = Vec::new();
        for (i, layer) in self.encoder_layers.iter_mut().enumerate() {
            let prefix = format!("model.encoder.layers.{}", i);
            out.extend(layer.self_attn.projections_mut(&format!("{}.self_attn", prefix)));
            out.push((format!("{}.fc1", prefix), &mut layer.ffn.fc1));
            out.push((format!("{}.fc2", prefix), &mut layer.ffn.fc2));
        }
        for (i, layer) in self.decoder_layers.iter_mut().enumerate() {
            let prefix = format!("model.decoder.layers.{}", i);
            out.extend(layer.self_attn.projections_mut(&format!("{}.self_attn", prefix)));
            out.extend(
                layer
                    .encoder_attn
                    .projections_mut(&format!("{}.encoder_attn", prefix)),
            );
            out.push((format!("{}.fc1", prefix), &mut layer.ffn.fc1));
            out.push((format!("{}.fc2", prefix), &mut layer.ffn.fc2));
        }
        out
    }

    /// Number of projections that carry an adapter
    pub fn num_adapted(&self) -> usize {
        let enc = self.encoder_layers.iter().flat_map(|l| {
            l.self_attn
                .projections()
                .into_iter()
                .chain([&l.ffn.fc1, &l.ffn.fc2])
        });
        let dec = self.decoder_layers.iter().flat_map(|l| {
            l.self_attn
                .projections()
                .into_iter()
                .chain(l.encoder_attn.projections())
                .chain([&l.ffn.fc1, &l.ffn.fc2])
        });
        enc.chain(dec).filter(|p| p.has_adapter()).count()
    }

    /// Remove every adapter
    pub fn detach_adapters(&mut self) {
        for (_, projection) in self.projections_mut() {
            projection.detach_adapter();
        }
    }
}

impl Seq2SeqLM for Seq2SeqModel {
    fn config(&self) -> &Seq2SeqConfig {
        &self.config
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn encode(&self, input_ids: &Tensor, attention_mask: &Tensor, train: bool) -> CandleResult<Tensor> {
        let mask = padding_mask(attention_mask, self.dtype)?;
        let mut xs = self.encoder_embeddings.forward(&self.shared, input_ids, train)?;
        for layer in &self.encoder_layers {
            xs = layer.forward(&xs, &mask, train)?;
        }
        Ok(xs)
    }

    fn decode(
        &self,
        decoder_input_ids: &Tensor,
        encoder_hidden_states: &Tensor,
        encoder_attention_mask: &Tensor,
        train: bool,
    ) -> CandleResult<Tensor> {
        let (_, len) = decoder_input_ids.dims2()?;
        let self_mask = causal_mask(len, self.dtype, &self.device)?;
        let cross_mask = padding_mask(encoder_attention_mask, self.dtype)?;

        let mut xs = self
            .decoder_embeddings
            .forward(&self.shared, decoder_input_ids, train)?;
        for layer in &self.decoder_layers {
            xs = layer.forward(&xs, encoder_hidden_states, &self_mask, &cross_mask, train)?;
        }

        self.lm_head
            .forward(&xs)?
            .broadcast_add(&self.final_logits_bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::D;

    fn inputs(device: &Device) -> (Tensor, Tensor, Tensor) {
        let ids = Tensor::new(&[[0u32, 5, 6, 7, 2], [0, 8, 2, 1, 1]], device).unwrap();
        let mask = Tensor::new(&[[1u32, 1, 1, 1, 1], [1, 1, 1, 0, 0]], device).unwrap();
        let dec = Tensor::new(&[[2u32, 0, 5], [2, 0, 8]], device).unwrap();
        (ids, mask, dec)
    }

    #[test]
    fn test_forward_shape() {
        let device = Device::Cpu;
        let model = Seq2SeqModel::random(Seq2SeqConfig::tiny(16), &device).unwrap();
        let (ids, mask, dec) = inputs(&device);

        let logits = model.forward(&ids, &mask, &dec, false).unwrap();
        assert_eq!(logits.dims(), &[2, 3, 16]);
    }

    #[test]
    fn test_projection_paths() {
        let device = Device::Cpu;
        let mut model = Seq2SeqModel::random(Seq2SeqConfig::tiny(16), &device).unwrap();
        let paths: Vec<String> = model.projections_mut().into_iter().map(|(p, _)| p).collect();

        assert_eq!(paths.len(), 6 + 10);
        assert!(paths.contains(&"model.encoder.layers.0.self_attn.q_proj".to_string()));
        assert!(paths.contains(&"model.decoder.layers.0.encoder_attn.q_proj".to_string()));
        assert_eq!(model.num_adapted(), 0);
    }

    #[test]
    fn test_random_weights_use_hf_names() {
        let device = Device::Cpu;
        let model = Seq2SeqModel::random(Seq2SeqConfig::tiny(16), &device).unwrap();
        let weights = model.weights();
        assert!(weights.contains_key("model.shared.weight"));
        assert!(weights.contains_key("model.encoder.layers.0.self_attn.q_proj.weight"));
        assert!(weights.contains_key("model.decoder.layers.0.encoder_attn_layer_norm.bias"));
        assert!(weights.contains_key("final_logits_bias"));
        assert_eq!(
            weights["model.encoder.embed_positions.weight"].dims(),
            &[66, 16]
        );
    }

    #[test]
    fn test_padding_does_not_leak() {
        let device = Device::Cpu;
        let model = Seq2SeqModel::random(Seq2SeqConfig::tiny(16), &device).unwrap();

        let short = Tensor::new(&[[0u32, 8, 2]], &device).unwrap();
        let short_mask = Tensor::new(&[[1u32, 1, 1]], &device).unwrap();
        let padded = Tensor::new(&[[0u32, 8, 2, 1, 1]], &device).unwrap();
        let padded_mask = Tensor::new(&[[1u32, 1, 1, 0, 0]], &device).unwrap();
        let dec = Tensor::new(&[[2u32, 0]], &device).unwrap();

        let a = model.forward(&short, &short_mask, &dec, false).unwrap();
        let b = model.forward(&padded, &padded_mask, &dec, false).unwrap();
        let diff = (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_keepdim(D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-4, "diff {}", diff);
    }

    #[test]
    fn test_save_and_reload() {
        let device = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let model = Seq2SeqModel::random(Seq2SeqConfig::tiny(16), &device).unwrap();
        model.save_pretrained(dir.path()).unwrap();

        let config = Seq2SeqConfig::load_json(dir.path().join(CONFIG_FILE)).unwrap();
        let reloaded = Seq2SeqModel::from_safetensors(
            config,
            &[dir.path().join(WEIGHTS_FILE)],
            DType::F32,
            &device,
        )
        .unwrap();

        let (ids, mask, dec) = inputs(&device);
        let a = model.forward(&ids, &mask, &dec, false).unwrap();
        let b = reloaded.forward(&ids, &mask, &dec, false).unwrap();
        let diff = (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }
}
