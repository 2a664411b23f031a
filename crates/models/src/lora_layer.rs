//! LoRA (Low-Rank Adaptation) linear layer
//!
//! A frozen base projection `W x + b` plus an optional trainable low-rank update
//! `scaling * B (A (dropout(x)))`, with `A` of shape (rank, in_features) and `B`
//! of shape (out_features, rank). `B` starts at zero so an adapter that was just
//! attached leaves the model output unchanged.

use candle_core::{Module, ModuleT, Result as CandleResult, Tensor};
use candle_nn::{init, Dropout, Linear, VarBuilder};
use sumtune_core::training::LoRAConfig;

/// Name of the down-projection inside an adapter
pub const LORA_A: &str = "lora_A";
/// Name of the up-projection inside an adapter
pub const LORA_B: &str = "lora_B";

/// Trainable low-rank update
#[derive(Clone, Debug)]
pub struct LoraAdapter {
    /// Down-projection (rank × in_features)
    a: Linear,
    /// Up-projection (out_features × rank)
    b: Linear,
    scaling: f64,
    dropout: Dropout,
}

impl LoraAdapter {
    /// Create adapter weights through `vb`, which should be backed by a `VarMap`
    pub fn new(
        in_features: usize,
        out_features: usize,
        config: &LoRAConfig,
        vb: VarBuilder,
    ) -> CandleResult<Self> {
        let rank = config.rank;
        let a = vb.pp(LORA_A).get_with_hints(
            (rank, in_features),
            "weight",
            init::DEFAULT_KAIMING_NORMAL,
        )?;
        let b = vb
            .pp(LORA_B)
            .get_with_hints((out_features, rank), "weight", init::ZERO)?;

        Ok(Self {
            a: Linear::new(a, None),
            b: Linear::new(b, None),
            scaling: config.scaling() as f64,
            dropout: Dropout::new(config.dropout),
        })
    }

    /// Scaled low-rank update for `x`
    pub fn forward_t(&self, x: &Tensor, train: bool) -> CandleResult<Tensor> {
        let x = self.dropout.forward_t(x, train)?;
        let update = self.b.forward(&self.a.forward(&x)?)?;
        update.affine(self.scaling, 0.0)
    }
}

/// Linear projection that can carry a LoRA adapter
#[derive(Clone, Debug)]
pub struct LoraLinear {
    base: Linear,
    adapter: Option<LoraAdapter>,
}

impl LoraLinear {
    /// Wrap a base projection
    pub fn new(base: Linear) -> Self {
        Self {
            base,
            adapter: None,
        }
    }

    /// Load `weight` (out × in) and `bias` from `vb`
    pub fn load(in_features: usize, out_features: usize, vb: VarBuilder) -> CandleResult<Self> {
        Ok(Self::new(candle_nn::linear(in_features, out_features, vb)?))
    }

    /// Input width
    pub fn in_features(&self) -> usize {
        self.base.weight().dims().get(1).copied().unwrap_or(0)
    }

    /// Output width
    pub fn out_features(&self) -> usize {
        self.base.weight().dims().first().copied().unwrap_or(0)
    }

    /// Attached adapter, if any
    pub fn adapter(&self) -> Option<&LoraAdapter> {
        self.adapter.as_ref()
    }

    /// Whether an adapter is attached
    pub fn has_adapter(&self) -> bool {
        self.adapter.is_some()
    }

    /// Create and attach an adapter; an existing one is replaced
    pub fn attach_adapter(&mut self, config: &LoRAConfig, vb: VarBuilder) -> CandleResult<()> {
        let adapter = LoraAdapter::new(self.in_features(), self.out_features(), config, vb)?;
        self.adapter = Some(adapter);
        Ok(())
    }

    /// Drop the adapter, returning to the base projection
    pub fn detach_adapter(&mut self) -> Option<LoraAdapter> {
        self.adapter.take()
    }

    /// Forward pass; dropout inside the adapter is active only when `train` is set
    pub fn forward_t(&self, x: &Tensor, train: bool) -> CandleResult<Tensor> {
        let out = self.base.forward(x)?;
        match &self.adapter {
            Some(adapter) => out.add(&adapter.forward_t(x, train)?),
            None => Ok(out),
        }
    }
}

impl Module for LoraLinear {
    fn forward(&self, x: &Tensor) -> CandleResult<Tensor> {
        self.forward_t(x, false)
    }
}
