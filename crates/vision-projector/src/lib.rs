//! # vision-projector
//!
//! Multimodal projectors that map vision-encoder features into the embedding
//! space of a language model.
//!
//! Supported `mm_projector_type` values:
//! - `linear`, `mlp{N}x_gelu`, `identity`
//! - `slot` (Slot Attention), `perceiver` (Q-Former sampler), `resampler`
//! - `mlpslot` (MLP / Slot Attention mix)
//! - `compress`, `pool`, `base`, `base_mix` (image/video composites)
//!
//! Use [`build_vision_projector`] to construct one from a [`ProjectorConfig`].
//!
//! [`ProjectorConfig`]: projector_core::ProjectorConfig

pub mod batching;
pub mod builder;
pub mod layers;
pub mod multi;
pub mod perceiver;
pub mod pooling;
pub mod position;
pub mod resampler;
pub mod slot;

pub use builder::{build_vision_projector, LeafProjector};
pub use layers::{LayerNorm, Mlp, MultiheadAttention};
pub use multi::{rebalance_assignment, MultiProjector};
pub use perceiver::PerceiverSampler;
pub use pooling::{BaseMixProjector, BaseProjector, CompressProjector, PoolProjector};
pub use position::{get_2d_sincos_pos_embed, get_abs_pos};
pub use resampler::{QwenResampler, Resampler};
pub use slot::SlotAttention;
