//! 2D perceiver-resampler: `grid_size^2` learned queries with 2D sincos
//! position embeddings and one cross-attention layer.

use candle_core::{Result, Tensor};
use candle_nn::{Init, Linear, Module, VarBuilder};

use crate::layers::{linear_trunc_normal, LayerNorm, MultiheadAttention, TRUNC_NORMAL};
use crate::position::{get_2d_sincos_pos_embed, get_abs_pos};

/// Resampler producing `grid_size^2` tokens.
///
/// - `Resampler::new`: output width equals `embed_dim`, optional `kv_proj`
/// - `Resampler::qwen`: extra `src_kv_proj` from the source width and a
///   distinct target output width
#[derive(Debug, Clone)]
pub struct Resampler {
    pos_embed: Tensor,
    query: Tensor,
    src_kv_proj: Option<Linear>,
    kv_proj: Option<Linear>,
    attn: MultiheadAttention,
    ln_q: LayerNorm,
    ln_kv: LayerNorm,
    ln_post: LayerNorm,
    proj: Tensor,
    num_queries: usize,
    out_dim: usize,
}

impl Resampler {
    /// Create a resampler whose output width equals `embed_dim`.
    ///
    /// `kv_proj` (no bias) is created only when `kv_dim` is given and differs
    /// from `embed_dim`.
    pub fn new(
        grid_size: usize,
        embed_dim: usize,
        num_heads: usize,
        kv_dim: Option<usize>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let kv_proj = match kv_dim {
            Some(kv) if kv != embed_dim => {
                Some(linear_trunc_normal(kv, embed_dim, false, vb.pp("kv_proj"))?)
            }
            _ => None,
        };
        Self::build(grid_size, embed_dim, num_heads, None, kv_proj, embed_dim, vb)
    }

    /// Create the Qwen variant.
    ///
    /// # Arguments
    /// * `grid_size` - Side of the query grid
    /// * `embed_dim` - Attention width
    /// * `num_heads` - Attention heads
    /// * `kv_dim` - Intermediate key/value width
    /// * `tgt_embed_dim` - Output width
    /// * `src_kv_dim` - Width of the incoming features
    /// * `vb` - Variable builder for loading weights
    pub fn qwen(
        grid_size: usize,
        embed_dim: usize,
        num_heads: usize,
        kv_dim: usize,
        tgt_embed_dim: usize,
        src_kv_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let src_kv_proj = linear_trunc_normal(src_kv_dim, kv_dim, false, vb.pp("src_kv_proj"))?;
        let kv_proj = if kv_dim != embed_dim {
            Some(linear_trunc_normal(kv_dim, embed_dim, false, vb.pp("kv_proj"))?)
        } else {
            None
        };
        Self::build(
            grid_size,
            embed_dim,
            num_heads,
            Some(src_kv_proj),
            kv_proj,
            tgt_embed_dim,
            vb,
        )
    }

    fn build(
        grid_size: usize,
        embed_dim: usize,
        num_heads: usize,
        src_kv_proj: Option<Linear>,
        kv_proj: Option<Linear>,
        out_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let num_queries = grid_size * grid_size;

        // Fixed table, never read from the checkpoint.
        let pos_embed = get_2d_sincos_pos_embed(embed_dim, grid_size, false, vb.device())?
            .to_dtype(vb.dtype())?;

        let query = vb.get_with_hints((num_queries, embed_dim), "query", TRUNC_NORMAL)?;
        let attn = MultiheadAttention::new(embed_dim, num_heads, vb.pp("attn"))?;

        let eps = LayerNorm::DEFAULT_EPS;
        let ln_q = LayerNorm::new(embed_dim, eps, vb.pp("ln_q"))?;
        let ln_kv = LayerNorm::new(embed_dim, eps, vb.pp("ln_kv"))?;
        let ln_post = LayerNorm::new(embed_dim, eps, vb.pp("ln_post"))?;

        let proj = vb.get_with_hints(
            (embed_dim, out_dim),
            "proj",
            Init::Randn {
                mean: 0.0,
                stdev: (out_dim as f64).powf(-0.5),
            },
        )?;

        Ok(Self {
            pos_embed,
            query,
            src_kv_proj,
            kv_proj,
            attn,
            ln_q,
            ln_kv,
            ln_post,
            proj,
            num_queries,
            out_dim,
        })
    }

    pub fn num_queries(&self) -> usize {
        self.num_queries
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// Forward pass: `[batch, tokens, kv_width]` -> `[batch, grid_size^2, out_dim]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_with_mask(x, None)
    }

    /// Forward pass with an additive attention mask `[grid_size^2, tokens]`.
    pub fn forward_with_mask(&self, x: &Tensor, attn_mask: Option<&Tensor>) -> Result<Tensor> {
        let (b, n, _) = x.dims3()?;
        let dtype = x.dtype();
        let pos_embed = get_abs_pos(&self.pos_embed, n)?.to_dtype(dtype)?;

        let mut x = x.clone();
        if let Some(src_kv_proj) = &self.src_kv_proj {
            x = src_kv_proj.forward(&x)?;
        }
        if let Some(kv_proj) = &self.kv_proj {
            x = kv_proj.forward(&x)?;
        }
        let x = self.ln_kv.forward(&x)?;

        let q = self.ln_q.forward(&self.query.to_dtype(dtype)?)?;
        let q = q.broadcast_add(&self.pos_embed.to_dtype(dtype)?)?;
        let q = q.unsqueeze(0)?.broadcast_as((b, self.num_queries, q.dim(1)?))?.contiguous()?;

        let keys = x.broadcast_add(&pos_embed)?;
        let out = self.attn.forward(&q, &keys, &x, attn_mask)?;

        let out = self.ln_post.forward(&out)?;
        out.broadcast_matmul(&self.proj.to_dtype(dtype)?)
    }
}

/// Qwen-VL flavored resampler, built with [`Resampler::qwen`].
pub type QwenResampler = Resampler;

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_resampler_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let resampler = Resampler::new(2, 8, 2, Some(12), vb).unwrap();
        assert_eq!(resampler.num_queries(), 4);

        // 9 tokens: position table is interpolated from 2x2 to 3x3.
        let x = Tensor::randn(0f32, 1f32, (3, 9, 12), &device).unwrap();
        let out = resampler.forward(&x).unwrap();
        assert_eq!(out.dims(), &[3, 4, 8]);
    }

    #[test]
    fn test_resampler_without_kv_proj() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let resampler = Resampler::new(2, 8, 2, Some(8), vb).unwrap();
        assert!(!varmap.data().lock().unwrap().contains_key("kv_proj.weight"));

        let x = Tensor::randn(0f32, 1f32, (1, 4, 8), &device).unwrap();
        assert_eq!(resampler.forward(&x).unwrap().dims(), &[1, 4, 8]);
    }

    #[test]
    fn test_qwen_resampler_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let resampler = Resampler::qwen(3, 16, 4, 12, 24, 10, vb).unwrap();

        let x = Tensor::randn(0f32, 1f32, (2, 16, 10), &device).unwrap();
        let out = resampler.forward(&x).unwrap();
        assert_eq!(out.dims(), &[2, 9, 24]);

        let data = varmap.data().lock().unwrap();
        assert_eq!(data.get("src_kv_proj.weight").unwrap().dims(), &[12, 10]);
        assert_eq!(data.get("kv_proj.weight").unwrap().dims(), &[16, 12]);
        assert_eq!(data.get("proj").unwrap().dims(), &[16, 24]);
        assert_eq!(data.get("attn.in_proj_weight").unwrap().dims(), &[48, 16]);
    }

    #[test]
    fn test_key_positions_break_permutation_symmetry() {
        // Without position offsets on the keys, cross-attention would not see
        // token order and reversing the tokens would leave the output unchanged.
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let resampler = Resampler::new(2, 8, 2, None, vb).unwrap();

        let x = Tensor::randn(0f32, 1f32, (1, 9, 8), &device).unwrap();
        let order = Tensor::new(&[8u32, 7, 6, 5, 4, 3, 2, 1, 0], &device).unwrap();
        let reversed = x.index_select(&order, 1).unwrap();

        let out = resampler.forward(&x).unwrap();
        let out_rev = resampler.forward(&reversed).unwrap();
        let diff = (out - out_rev).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() > 1e-4);
    }

    #[test]
    fn test_masked_forward() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let resampler = Resampler::new(2, 8, 2, None, vb).unwrap();
        let x = Tensor::ones((1, 4, 8), DType::F32, &device).unwrap();
        let mask = Tensor::zeros((4, 4), DType::F32, &device).unwrap();
        let out = resampler.forward_with_mask(&x, Some(&mask)).unwrap();
        assert_eq!(out.dims(), &[1, 4, 8]);
    }
}
