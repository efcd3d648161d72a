//! Neural network layers shared by the projectors.
//!
//! - LayerNorm with learnable weight and bias (computed in f32)
//! - GELU MLP laid out like `nn.Sequential` (weights at `0`, `2`, `4`, ...)
//! - Multi-head attention with a packed in-projection (`nn.MultiheadAttention`)

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{init, Init, Linear, Module, VarBuilder};

/// Truncated normal with std 0.02. The ±2 cutoff lies 100σ out, so a plain
/// normal draws the same distribution.
pub const TRUNC_NORMAL: Init = Init::Randn {
    mean: 0.0,
    stdev: 0.02,
};

/// Linear layer initialized with [`TRUNC_NORMAL`] weights and zero bias.
pub fn linear_trunc_normal(
    in_dim: usize,
    out_dim: usize,
    bias: bool,
    vb: VarBuilder,
) -> Result<Linear> {
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", TRUNC_NORMAL)?;
    let bias = if bias {
        Some(vb.get_with_hints(out_dim, "bias", init::ZERO)?)
    } else {
        None
    };
    Ok(Linear::new(weight, bias))
}

/// LayerNorm layer with learnable weight and bias.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    /// Default epsilon of `nn.LayerNorm`.
    pub const DEFAULT_EPS: f64 = 1e-5;

    /// Create a new LayerNorm layer (weight one, bias zero when freshly allocated).
    pub fn new(hidden_size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(hidden_size, "weight", init::ONE)?;
        let bias = vb.get_with_hints(hidden_size, "bias", init::ZERO)?;
        Ok(Self { weight, bias, eps })
    }

    /// Apply LayerNorm over the last dimension.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // Statistics in f32, then cast back.
        let input_dtype = x.dtype();
        let x_f32 = x.to_dtype(DType::F32)?;

        let mean = x_f32.mean_keepdim(D::Minus1)?;
        let x_centered = x_f32.broadcast_sub(&mean)?;
        let variance = x_centered.sqr()?.mean_keepdim(D::Minus1)?;
        let x_normed = x_centered.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        let x_normed = x_normed.to_dtype(input_dtype)?;

        let w = self.weight.to_dtype(input_dtype)?;
        let b = self.bias.to_dtype(input_dtype)?;
        x_normed.broadcast_mul(&w)?.broadcast_add(&b)
    }
}

/// Stack of linear layers with exact GELU between them.
///
/// Layer `i` lives under `vb.pp(2 * i)`, matching `nn.Sequential` checkpoints
/// where the odd indices are the parameter-free activations.
#[derive(Debug, Clone)]
pub struct Mlp {
    layers: Vec<Linear>,
    in_dim: usize,
    out_dim: usize,
}

impl Mlp {
    /// `mlp{depth}x_gelu`: first layer `in_dim -> out_dim`, the rest `out_dim -> out_dim`.
    pub fn new(depth: usize, in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        if depth == 0 {
            candle_core::bail!("MLP depth must be at least 1");
        }
        let mut widths = vec![in_dim];
        widths.extend(std::iter::repeat(out_dim).take(depth));
        Self::from_widths(&widths, vb)
    }

    /// Build from explicit widths: `widths[i] -> widths[i + 1]` for each layer.
    pub fn from_widths(widths: &[usize], vb: VarBuilder) -> Result<Self> {
        if widths.len() < 2 {
            candle_core::bail!("MLP needs at least two widths, got {}", widths.len());
        }
        let layers = widths
            .windows(2)
            .enumerate()
            .map(|(i, w)| candle_nn::linear(w[0], w[1], vb.pp(2 * i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            layers,
            in_dim: widths[0],
            out_dim: widths[widths.len() - 1],
        })
    }

    /// Number of linear layers.
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }
}

impl Module for Mlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut hidden = self.layers[0].forward(x)?;
        for layer in &self.layers[1..] {
            hidden = layer.forward(&hidden.gelu_erf()?)?;
        }
        Ok(hidden)
    }
}

/// Scaled dot-product attention over `[batch, len, heads * head_dim]` tensors.
///
/// `mask` is additive and broadcast over batch and heads, shape `[q_len, kv_len]`.
pub fn multi_head_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    num_heads: usize,
    mask: Option<&Tensor>,
) -> Result<Tensor> {
    let (batch_size, q_len, hidden) = q.dims3()?;
    let kv_len = k.dim(1)?;
    let head_dim = hidden / num_heads;

    // Reshape to [batch, num_heads, seq_len, head_dim]
    let q = q
        .reshape((batch_size, q_len, num_heads, head_dim))?
        .transpose(1, 2)?
        .contiguous()?;
    let k = k
        .reshape((batch_size, kv_len, num_heads, head_dim))?
        .transpose(1, 2)?
        .contiguous()?;
    let v = v
        .reshape((batch_size, kv_len, num_heads, head_dim))?
        .transpose(1, 2)?
        .contiguous()?;

    let scale = (head_dim as f64).sqrt();
    let mut attn_weights = (q.matmul(&k.transpose(2, 3)?)? / scale)?;
    if let Some(mask) = mask {
        attn_weights = attn_weights.broadcast_add(&mask.to_dtype(attn_weights.dtype())?)?;
    }

    // Softmax in f32.
    let attn_f32 = attn_weights.to_dtype(DType::F32)?;
    let attn_weights =
        candle_nn::ops::softmax_last_dim(&attn_f32)?.to_dtype(attn_weights.dtype())?;

    let attn_output = attn_weights.matmul(&v)?;

    // Reshape back to [batch, seq_len, hidden]
    attn_output
        .transpose(1, 2)?
        .contiguous()?
        .reshape((batch_size, q_len, hidden))
}

/// Multi-head attention with `nn.MultiheadAttention` parameter layout.
///
/// - `in_proj_weight` `[3 * embed_dim, embed_dim]`, `in_proj_bias` `[3 * embed_dim]`
/// - `out_proj` linear with bias
#[derive(Debug, Clone)]
pub struct MultiheadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
}

impl MultiheadAttention {
    /// Create the attention layer. `embed_dim` must be divisible by `num_heads`.
    pub fn new(embed_dim: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        if num_heads == 0 || embed_dim % num_heads != 0 {
            candle_core::bail!(
                "embed_dim {} is not divisible by num_heads {}",
                embed_dim,
                num_heads
            );
        }

        // Xavier-uniform over the packed [3E, E] matrix.
        let bound = (6.0 / (4 * embed_dim) as f64).sqrt();
        let in_proj_weight = vb.get_with_hints(
            (3 * embed_dim, embed_dim),
            "in_proj_weight",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        let in_proj_bias = vb.get_with_hints(3 * embed_dim, "in_proj_bias", init::ZERO)?;

        let slice = |i: usize| -> Result<Linear> {
            Ok(Linear::new(
                in_proj_weight.narrow(0, i * embed_dim, embed_dim)?,
                Some(in_proj_bias.narrow(0, i * embed_dim, embed_dim)?),
            ))
        };
        let q_proj = slice(0)?;
        let k_proj = slice(1)?;
        let v_proj = slice(2)?;
        let out_proj = linear_trunc_normal(embed_dim, embed_dim, true, vb.pp("out_proj"))?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            num_heads,
        })
    }

    /// Forward pass, batch-first: query `[b, l, e]`, key/value `[b, s, e]` -> `[b, l, e]`.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attn_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let q = self.q_proj.forward(query)?;
        let k = self.k_proj.forward(key)?;
        let v = self.v_proj.forward(value)?;
        let out = multi_head_attention(&q, &k, &v, self.num_heads, attn_mask)?;
        self.out_proj.forward(&out)
    }
}

/// `[n, t, k, c]` -> `[n, t * k, c]`; 3D tensors pass through.
pub fn flatten_time(x: &Tensor) -> Result<Tensor> {
    match x.rank() {
        3 => Ok(x.clone()),
        4 => {
            let (n, t, k, c) = x.dims4()?;
            x.reshape((n, t * k, c))
        }
        r => candle_core::bail!("expected a 3D or 4D feature tensor, got rank {}", r),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn test_layer_norm_normalizes() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let ln = LayerNorm::new(4, LayerNorm::DEFAULT_EPS, vb).unwrap();

        let x = Tensor::new(&[[1.0f32, 2.0, 3.0, 4.0]], &device).unwrap();
        let y = ln.forward(&x).unwrap();
        let mean = y.mean_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(mean.abs() < 1e-5);
        let values = y.to_vec2::<f32>().unwrap();
        assert!(values[0][0] < values[0][3]);
    }

    #[test]
    fn test_mlp_shapes_and_names() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mlp = Mlp::new(3, 8, 16, vb).unwrap();
        assert_eq!(mlp.depth(), 3);

        let mut names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        names.sort();
        assert_eq!(
            names,
            vec!["0.bias", "0.weight", "2.bias", "2.weight", "4.bias", "4.weight"]
        );

        let x = Tensor::ones((2, 5, 8), DType::F32, &device).unwrap();
        assert_eq!(mlp.forward(&x).unwrap().dims(), &[2, 5, 16]);
    }

    #[test]
    fn test_mha_uniform_values() {
        // Zero weights: attention output is just the out_proj bias (zero).
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let attn = MultiheadAttention::new(8, 2, vb).unwrap();
        let q = Tensor::ones((2, 3, 8), DType::F32, &device).unwrap();
        let kv = Tensor::ones((2, 5, 8), DType::F32, &device).unwrap();
        let out = attn.forward(&q, &kv, &kv, None).unwrap();
        assert_eq!(out.dims(), &[2, 3, 8]);
        assert_eq!(out.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_attention_mask_blocks_keys() {
        let device = Device::Cpu;
        let q = Tensor::ones((1, 1, 2), DType::F32, &device).unwrap();
        let k = Tensor::ones((1, 2, 2), DType::F32, &device).unwrap();
        let v = Tensor::new(&[[[1.0f32, 1.0], [5.0, 5.0]]], &device).unwrap();
        let mask = Tensor::new(&[[0.0f32, f32::NEG_INFINITY]], &device).unwrap();
        let out = multi_head_attention(&q, &k, &v, 1, Some(&mask)).unwrap();
        let values = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(values, vec![1.0, 1.0]);
    }
}
