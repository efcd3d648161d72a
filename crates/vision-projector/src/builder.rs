//! Projector factory.
//!
//! [`build_vision_projector`] reads `mm_projector_type` from the config and
//! constructs the matching projector from a `VarBuilder` rooted at the
//! projector's checkpoint prefix (e.g. `model.mm_projector`).

use candle_core::Tensor;
use candle_nn::{Linear, Module, VarBuilder};
use tracing::info;

use projector_core::{
    ProjectorConfig, ProjectorInput, ProjectorKind, ProjectorOutput, ProjectorResult,
    VisionProjector,
};

use crate::batching::map_streams;
use crate::layers::{flatten_time, Mlp};
use crate::multi::MultiProjector;
use crate::perceiver::PerceiverSampler;
use crate::pooling::{BaseMixProjector, BaseProjector, CompressProjector, PoolProjector};
use crate::resampler::Resampler;
use crate::slot::SlotAttention;

/// Depth of the MLP inside the composite projectors.
const COMPOSITE_MLP_DEPTH: usize = 2;

/// Modules that map every stream independently.
#[derive(Debug, Clone)]
enum LeafModule {
    Linear(Linear),
    Mlp(Mlp),
    Identity,
    Slot(SlotAttention),
    Perceiver(PerceiverSampler),
    Resampler(Resampler),
}

/// Projector wrapping one [`LeafModule`].
#[derive(Debug, Clone)]
pub struct LeafProjector {
    kind: ProjectorKind,
    module: LeafModule,
    output_dim: usize,
}

impl LeafProjector {
    fn apply(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match &self.module {
            LeafModule::Linear(linear) => linear.forward(x),
            LeafModule::Mlp(mlp) => mlp.forward(x),
            LeafModule::Identity => Ok(x.clone()),
            LeafModule::Slot(sa) => sa.forward(&flatten_time(x)?),
            LeafModule::Perceiver(sampler) => sampler.forward(&flatten_time(x)?),
            LeafModule::Resampler(resampler) => resampler.forward(&flatten_time(x)?),
        }
    }
}

impl VisionProjector for LeafProjector {
    fn kind(&self) -> ProjectorKind {
        self.kind
    }

    fn output_dim(&self) -> usize {
        self.output_dim
    }

    fn forward(
        &self,
        input: &ProjectorInput,
        _assignment: Option<&Tensor>,
    ) -> ProjectorResult<ProjectorOutput> {
        map_streams(input, |x| self.apply(x))
    }
}

/// Build the projector described by `config`.
///
/// # Errors
/// `UnknownProjectorType` for an unrecognized `mm_projector_type`, `Config`
/// when a required field (`n_slot`, `resolution`) is missing or invalid.
pub fn build_vision_projector(
    config: &ProjectorConfig,
    vb: VarBuilder,
) -> ProjectorResult<Box<dyn VisionProjector>> {
    let kind = config.kind()?;
    let mm_hidden = config.mm_hidden_size;
    let hidden = config.hidden_size;

    info!(
        projector = %kind,
        mm_hidden_size = mm_hidden,
        hidden_size = hidden,
        "building vision projector"
    );

    let leaf = |module: LeafModule, output_dim: usize| -> Box<dyn VisionProjector> {
        Box::new(LeafProjector {
            kind,
            module,
            output_dim,
        })
    };

    let projector: Box<dyn VisionProjector> = match kind {
        ProjectorKind::Linear => leaf(
            LeafModule::Linear(candle_nn::linear(mm_hidden, hidden, vb)?),
            hidden,
        ),
        ProjectorKind::MlpGelu(depth) => {
            // The first layer always exists, so depth 0 builds a single linear.
            let mlp = Mlp::new(depth.max(1), mm_hidden, hidden, vb)?;
            leaf(LeafModule::Mlp(mlp), hidden)
        }
        ProjectorKind::Identity => leaf(LeafModule::Identity, mm_hidden),
        ProjectorKind::Slot => {
            let sa = slot_attention(config, vb)?;
            leaf(LeafModule::Slot(sa), hidden)
        }
        ProjectorKind::Perceiver => {
            let sampler = PerceiverSampler::new(
                config.require_slots()?,
                mm_hidden,
                hidden,
                &config.perceiver,
                vb,
            )?;
            leaf(LeafModule::Perceiver(sampler), hidden)
        }
        ProjectorKind::MlpSlot => {
            let mlp = Mlp::new(COMPOSITE_MLP_DEPTH, mm_hidden, hidden, vb.pp("mlp"))?;
            let sa = slot_attention(config, vb.pp("sa"))?;
            Box::new(MultiProjector::new(mlp, sa, config.seed))
        }
        ProjectorKind::Compress => {
            let num_slot = config.require_slots()?;
            let mlp = Mlp::new(COMPOSITE_MLP_DEPTH, 4 * mm_hidden, hidden, vb.pp("mlp"))?;
            Box::new(CompressProjector::new(mlp, num_slot, hidden, vb)?)
        }
        ProjectorKind::Pool => {
            let resolution = config.require_resolution()?;
            let mlp = Mlp::new(COMPOSITE_MLP_DEPTH, 4 * mm_hidden, hidden, vb.pp("mlp"))?;
            Box::new(PoolProjector::new(mlp, resolution, config.pool_num())?)
        }
        ProjectorKind::Base => {
            let mlp = Mlp::new(COMPOSITE_MLP_DEPTH, mm_hidden, hidden, vb.pp("mlp"))?;
            Box::new(BaseProjector::new(mlp))
        }
        ProjectorKind::BaseMix => {
            let mlp = Mlp::new(COMPOSITE_MLP_DEPTH, 4 * mm_hidden, hidden, vb.pp("mlp"))?;
            Box::new(BaseMixProjector::new(mlp))
        }
        ProjectorKind::Resampler => {
            let n_slot = config.require_slots()?;
            let grid_size = (n_slot as f64).sqrt() as usize;
            let widths = &config.resampler;
            let resampler = Resampler::qwen(
                grid_size,
                widths.embed_dim,
                widths.num_heads,
                widths.kv_dim,
                hidden,
                mm_hidden,
                vb,
            )?;
            leaf(LeafModule::Resampler(resampler), hidden)
        }
    };

    Ok(projector)
}

fn slot_attention(config: &ProjectorConfig, vb: VarBuilder) -> ProjectorResult<SlotAttention> {
    Ok(SlotAttention::new(
        config.require_slots()?,
        config.mm_hidden_size,
        config.slot_iters,
        config.hidden_size,
        config.hidden_size,
        config.slot_eps,
        vb,
    )?)
}
