//! Slot Attention projector.
//!
//! Learned slots compete for input tokens: the softmax runs over the slot
//! axis, then each slot takes a weighted mean of the values it won.

use candle_core::{Result, Tensor};
use candle_nn::{linear, Init, Linear, Module, VarBuilder};

use crate::layers::{LayerNorm, Mlp};

/// Attention coefficients from `[batch, num_slots, num_inputs]` logits.
///
/// Softmax runs over the slot axis, so slots compete for each input token;
/// `eps` is added and every slot's row is renormalized to sum to one.
fn slot_competition(dots: &Tensor, eps: f64) -> Result<Tensor> {
    let attn = (candle_nn::ops::softmax(dots, 1)? + eps)?;
    attn.broadcast_div(&attn.sum_keepdim(2)?)
}

/// Slot Attention module.
#[derive(Debug, Clone)]
pub struct SlotAttention {
    slots_embedding: Tensor,
    project_q: Linear,
    project_k: Linear,
    project_v: Linear,
    mlp: Mlp,
    head: Linear,
    norm_input: LayerNorm,
    norm_slots: LayerNorm,
    norm_pre_ff: LayerNorm,
    num_slots: usize,
    iters: usize,
    eps: f64,
    scale: f64,
    out_dim: usize,
}

impl SlotAttention {
    /// Create a new Slot Attention module.
    ///
    /// # Arguments
    /// * `num_slots` - Number of output slots
    /// * `encoder_dims` - Width of the input features and of the slots
    /// * `iters` - Number of attention rounds
    /// * `hidden_dim` - MLP hidden width (raised to `encoder_dims` if smaller)
    /// * `out_dim` - Output width of the head
    /// * `eps` - Offset added to attention coefficients before normalization
    /// * `vb` - Variable builder for loading weights
    pub fn new(
        num_slots: usize,
        encoder_dims: usize,
        iters: usize,
        hidden_dim: usize,
        out_dim: usize,
        eps: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        if iters == 0 {
            candle_core::bail!("Slot Attention needs at least one iteration");
        }

        let slots_embedding = vb.get_with_hints(
            (1, num_slots, encoder_dims),
            "slots_embedding",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;

        let project_q = linear(encoder_dims, encoder_dims, vb.pp("project_q"))?;
        let project_k = linear(encoder_dims, encoder_dims, vb.pp("project_k"))?;
        let project_v = linear(encoder_dims, encoder_dims, vb.pp("project_v"))?;

        let hidden_dim = hidden_dim.max(encoder_dims);
        let mlp = Mlp::from_widths(&[encoder_dims, hidden_dim, encoder_dims], vb.pp("mlp"))?;
        let head = linear(encoder_dims, out_dim, vb.pp("head"))?;

        let eps_ln = LayerNorm::DEFAULT_EPS;
        let norm_input = LayerNorm::new(encoder_dims, eps_ln, vb.pp("norm_input"))?;
        let norm_slots = LayerNorm::new(encoder_dims, eps_ln, vb.pp("norm_slots"))?;
        let norm_pre_ff = LayerNorm::new(encoder_dims, eps_ln, vb.pp("norm_pre_ff"))?;

        Ok(Self {
            slots_embedding,
            project_q,
            project_k,
            project_v,
            mlp,
            head,
            norm_input,
            norm_slots,
            norm_pre_ff,
            num_slots,
            iters,
            eps,
            scale: (encoder_dims as f64).powf(-0.5),
            out_dim,
        })
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// Forward pass: `[batch, num_inputs, dims]` -> `[batch, num_slots, out_dim]`.
    pub fn forward(&self, inputs: &Tensor) -> Result<Tensor> {
        let (b, _n, d) = inputs.dims3()?;

        let inputs = self.norm_input.forward(inputs)?;
        let k = self.project_k.forward(&inputs)?;
        let v = self.project_v.forward(&inputs)?;
        let k_t = k.transpose(1, 2)?.contiguous()?;

        let init_slots = self
            .slots_embedding
            .to_dtype(inputs.dtype())?
            .broadcast_as((b, self.num_slots, d))?
            .contiguous()?;
        let mut slots = init_slots.clone();

        for t in 0..self.iters {
            let slots_prev = slots.clone();
            let normed = self.norm_slots.forward(&slots)?;

            // [b, num_slots, n]
            let q = self.project_q.forward(&normed)?;
            let dots = (q.matmul(&k_t)? * self.scale)?;
            let attn = slot_competition(&dots, self.eps)?;

            let updates = attn.matmul(&v)?;

            slots = (slots_prev + updates)?;
            let refined = self.mlp.forward(&self.norm_pre_ff.forward(&slots)?)?;
            slots = (&slots + refined)?;

            // Cut the gradient through earlier rounds, keep the init trainable.
            if self.iters >= 2 && t == self.iters - 2 {
                slots = ((slots.detach() - init_slots.detach())? + &init_slots)?;
            }
        }

        self.head.forward(&slots)
    }
}
