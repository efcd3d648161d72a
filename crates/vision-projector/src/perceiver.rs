//! Perceiver sampler: learned query tokens read vision features through a
//! BERT-style cross-attention stack.
//!
//! Weight layout follows the BLIP-2 Q-Former checkpoints
//! (`Qformer.bert.encoder.layer.{i}.*`), restricted to the parts the query
//! path uses: there are no word/position embeddings and no text feed-forward.

use candle_core::{Result, Tensor};
use candle_nn::{init, Init, Linear, Module, VarBuilder};

use projector_core::PerceiverConfig;

use crate::layers::{multi_head_attention, LayerNorm};

fn bert_linear(in_dim: usize, out_dim: usize, std: f64, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        Init::Randn {
            mean: 0.0,
            stdev: std,
        },
    )?;
    let bias = vb.get_with_hints(out_dim, "bias", init::ZERO)?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Attention block: Q/K/V projections, output dense, residual + LayerNorm.
///
/// For cross-attention the keys and values come from `kv_width` features.
#[derive(Debug, Clone)]
struct AttentionBlock {
    query: Linear,
    key: Linear,
    value: Linear,
    dense: Linear,
    layer_norm: LayerNorm,
    num_heads: usize,
}

impl AttentionBlock {
    fn new(config: &PerceiverConfig, kv_width: usize, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let std = config.initializer_range;
        let vb_self = vb.pp("self");
        let vb_out = vb.pp("output");
        Ok(Self {
            query: bert_linear(hidden, hidden, std, vb_self.pp("query"))?,
            key: bert_linear(kv_width, hidden, std, vb_self.pp("key"))?,
            value: bert_linear(kv_width, hidden, std, vb_self.pp("value"))?,
            dense: bert_linear(hidden, hidden, std, vb_out.pp("dense"))?,
            layer_norm: LayerNorm::new(hidden, config.layer_norm_eps, vb_out.pp("LayerNorm"))?,
            num_heads: config.num_attention_heads,
        })
    }

    fn forward(&self, hidden_states: &Tensor, context: &Tensor) -> Result<Tensor> {
        let q = self.query.forward(hidden_states)?;
        let k = self.key.forward(context)?;
        let v = self.value.forward(context)?;
        // Every encoder token is visible, so no mask.
        let attn = multi_head_attention(&q, &k, &v, self.num_heads, None)?;
        let out = self.dense.forward(&attn)?;
        self.layer_norm.forward(&(out + hidden_states)?)
    }
}

/// Query feed-forward block: dense + GELU, dense, residual + LayerNorm.
#[derive(Debug, Clone)]
struct QueryFeedForward {
    intermediate: Linear,
    output: Linear,
    layer_norm: LayerNorm,
}

impl QueryFeedForward {
    fn new(config: &PerceiverConfig, vb: VarBuilder) -> Result<Self> {
        let std = config.initializer_range;
        let intermediate = bert_linear(
            config.hidden_size,
            config.intermediate_size,
            std,
            vb.pp("intermediate_query").pp("dense"),
        )?;
        let vb_out = vb.pp("output_query");
        let output = bert_linear(
            config.intermediate_size,
            config.hidden_size,
            std,
            vb_out.pp("dense"),
        )?;
        let layer_norm =
            LayerNorm::new(config.hidden_size, config.layer_norm_eps, vb_out.pp("LayerNorm"))?;
        Ok(Self {
            intermediate,
            output,
            layer_norm,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.intermediate.forward(x)?.gelu_erf()?;
        let hidden = self.output.forward(&hidden)?;
        self.layer_norm.forward(&(hidden + x)?)
    }
}

/// One layer: self-attention, optional cross-attention, query feed-forward.
#[derive(Debug, Clone)]
struct CrossAttentionLayer {
    attention: AttentionBlock,
    crossattention: Option<AttentionBlock>,
    feed_forward: QueryFeedForward,
}

impl CrossAttentionLayer {
    fn new(config: &PerceiverConfig, idx: usize, encoder_width: usize, vb: VarBuilder) -> Result<Self> {
        let attention = AttentionBlock::new(config, config.hidden_size, vb.pp("attention"))?;
        let crossattention = if config.has_cross_attention(idx) {
            Some(AttentionBlock::new(config, encoder_width, vb.pp("crossattention"))?)
        } else {
            None
        };
        let feed_forward = QueryFeedForward::new(config, vb)?;
        Ok(Self {
            attention,
            crossattention,
            feed_forward,
        })
    }

    fn forward(&self, queries: &Tensor, encoder_hidden_states: &Tensor) -> Result<Tensor> {
        let mut hidden = self.attention.forward(queries, queries)?;
        if let Some(cross) = &self.crossattention {
            hidden = cross.forward(&hidden, encoder_hidden_states)?;
        }
        self.feed_forward.forward(&hidden)
    }
}

/// Perceiver sampler.
///
/// Structure:
/// 1. `ln_vision` over the input features
/// 2. `query_tokens` expanded to the batch, LayerNorm'ed
/// 3. `num_hidden_layers` cross-attention layers
/// 4. `head` to the output width
#[derive(Debug, Clone)]
pub struct PerceiverSampler {
    query_tokens: Tensor,
    embeddings_norm: LayerNorm,
    layers: Vec<CrossAttentionLayer>,
    ln_vision: LayerNorm,
    head: Linear,
    num_query_token: usize,
    out_size: usize,
}

impl PerceiverSampler {
    /// Create a new Perceiver sampler.
    ///
    /// # Arguments
    /// * `num_query_token` - Number of learned query tokens (output length)
    /// * `num_vision_features` - Width of the vision features
    /// * `out_size` - Output width
    /// * `config` - Query transformer widths
    /// * `vb` - Variable builder for loading weights
    pub fn new(
        num_query_token: usize,
        num_vision_features: usize,
        out_size: usize,
        config: &PerceiverConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        if config.num_attention_heads == 0 || config.hidden_size % config.num_attention_heads != 0 {
            candle_core::bail!(
                "perceiver hidden_size {} is not divisible by num_attention_heads {}",
                config.hidden_size,
                config.num_attention_heads
            );
        }

        let query_tokens = vb.get_with_hints(
            (1, num_query_token, config.hidden_size),
            "query_tokens",
            Init::Randn {
                mean: 0.0,
                stdev: config.initializer_range,
            },
        )?;

        let vb_bert = vb.pp("Qformer").pp("bert");
        let embeddings_norm = LayerNorm::new(
            config.hidden_size,
            config.layer_norm_eps,
            vb_bert.pp("embeddings").pp("LayerNorm"),
        )?;

        let vb_layers = vb_bert.pp("encoder").pp("layer");
        let layers = (0..config.num_hidden_layers)
            .map(|i| CrossAttentionLayer::new(config, i, num_vision_features, vb_layers.pp(i)))
            .collect::<Result<Vec<_>>>()?;

        let ln_vision = LayerNorm::new(num_vision_features, LayerNorm::DEFAULT_EPS, vb.pp("ln_vision"))?;
        let head = candle_nn::linear(config.hidden_size, out_size, vb.pp("head"))?;

        Ok(Self {
            query_tokens,
            embeddings_norm,
            layers,
            ln_vision,
            head,
            num_query_token,
            out_size,
        })
    }

    pub fn num_query_token(&self) -> usize {
        self.num_query_token
    }

    pub fn out_size(&self) -> usize {
        self.out_size
    }

    /// Number of layers carrying a cross-attention block.
    pub fn num_cross_attention_layers(&self) -> usize {
        self.layers
            .iter()
            .filter(|l| l.crossattention.is_some())
            .count()
    }

    /// Forward pass: `[batch, tokens, num_vision_features]` -> `[batch, num_query_token, out_size]`.
    pub fn forward(&self, inputs: &Tensor) -> Result<Tensor> {
        let image_embeds = self.ln_vision.forward(inputs)?;
        let (b, _, _) = image_embeds.dims3()?;

        let (_, n, h) = self.query_tokens.dims3()?;
        let queries = self
            .query_tokens
            .to_dtype(image_embeds.dtype())?
            .broadcast_as((b, n, h))?
            .contiguous()?;
        let mut hidden = self.embeddings_norm.forward(&queries)?;

        for layer in &self.layers {
            hidden = layer.forward(&hidden, &image_embeds)?;
        }

        self.head.forward(&hidden)
    }
}
