//! MLP projectors with token pooling, compression and video mixing.
//!
//! All of them accept a single tensor or an image/video pair; the pair is
//! projected in one MLP call and split back per stream.

use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;
use tracing::debug;

use projector_core::{
    ProjectorError, ProjectorInput, ProjectorKind, ProjectorOutput, ProjectorResult,
    VisionProjector,
};

use crate::batching::{check_batch, project_pair, project_rows};
use crate::layers::{flatten_time, Mlp, TRUNC_NORMAL};

fn unsupported(kind: ProjectorKind, input: &ProjectorInput) -> ProjectorError {
    ProjectorError::UnsupportedInput(format!(
        "{} projector does not accept {} input",
        kind,
        input.variant_name()
    ))
}

// ---------------------------------------------------------------------------
// Compress
// ---------------------------------------------------------------------------

/// MLP projection followed by `num_slot` learned query rows appended to every
/// sequence.
#[derive(Debug, Clone)]
pub struct CompressProjector {
    mlp: Mlp,
    query: Tensor,
    num_slot: usize,
}

impl CompressProjector {
    pub fn new(mlp: Mlp, num_slot: usize, embed_dim: usize, vb: VarBuilder) -> Result<Self> {
        let query = vb.get_with_hints((num_slot, embed_dim), "query", TRUNC_NORMAL)?;
        Ok(Self {
            mlp,
            query,
            num_slot,
        })
    }

    /// `[b, k, hidden]` -> `[b, k + num_slot, hidden]`.
    fn append_query(&self, x: &Tensor) -> Result<Tensor> {
        let (b, _, hidden) = x.dims3()?;
        let query = self
            .query
            .to_dtype(x.dtype())?
            .unsqueeze(0)?
            .broadcast_as((b, self.num_slot, hidden))?
            .contiguous()?;
        Tensor::cat(&[x, &query], 1)
    }
}

impl VisionProjector for CompressProjector {
    fn kind(&self) -> ProjectorKind {
        ProjectorKind::Compress
    }

    fn output_dim(&self) -> usize {
        self.mlp.out_dim()
    }

    fn forward(
        &self,
        input: &ProjectorInput,
        _assignment: Option<&Tensor>,
    ) -> ProjectorResult<ProjectorOutput> {
        let output = match input {
            ProjectorInput::Tensor(x) => {
                let projected = self.mlp.forward(&flatten_time(x)?)?;
                ProjectorOutput::Tensor(self.append_query(&projected)?)
            }
            ProjectorInput::Pair { images, videos } => {
                let (images, videos) = project_pair(&self.mlp, images, &flatten_time(videos)?)?;
                ProjectorOutput::Pair {
                    images: self.append_query(&images)?,
                    videos: self.append_query(&videos)?,
                }
            }
            ProjectorInput::Batch(_) => return Err(unsupported(self.kind(), input)),
        };
        check_batch(input.batch_size()?, &output)?;
        Ok(output)
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Block-mean pooling of square token grids.
///
/// `frames` is `[f, resolution, c]` with each frame a row-major
/// `sqrt(resolution)` square grid; the grid is split into a
/// `sqrt(pool_num)` square macro grid and every block is averaged.
/// Returns `[f, pool_num, c]`, blocks in row-major macro-grid order.
pub fn block_pool(frames: &Tensor, resolution: usize, pool_num: usize) -> Result<Tensor> {
    let (f, res, c) = frames.dims3()?;
    if res != resolution {
        candle_core::bail!("expected {resolution} tokens per frame, got {res}");
    }
    let (side, grid) = pool_geometry(resolution, pool_num)?;
    let block = side / grid;

    frames
        .reshape(vec![f, grid, block, grid, block, c])?
        .permute([0usize, 1, 3, 2, 4, 5])?
        .contiguous()?
        .reshape((f, pool_num, block * block, c))?
        .mean(2)
}

fn exact_sqrt(n: usize) -> Option<usize> {
    let root = (n as f64).sqrt().round() as usize;
    (root * root == n).then_some(root)
}

/// `(grid side, macro-grid side)` for a valid pooling geometry.
fn pool_geometry(resolution: usize, pool_num: usize) -> Result<(usize, usize)> {
    let side = exact_sqrt(resolution)
        .ok_or_else(|| candle_core::Error::Msg(format!("resolution {resolution} is not a perfect square")))?;
    let grid = exact_sqrt(pool_num)
        .ok_or_else(|| candle_core::Error::Msg(format!("pool_num {pool_num} is not a perfect square")))?;
    if grid == 0 || side % grid != 0 {
        candle_core::bail!("grid side {side} is not divisible by pool side {grid}");
    }
    Ok((side, grid))
}

/// MLP projection over the original tokens, `pool_num` block-pooled tokens
/// per frame and one global mean token.
#[derive(Debug, Clone)]
pub struct PoolProjector {
    mlp: Mlp,
    resolution: usize,
    pool_num: usize,
}

impl PoolProjector {
    /// Create the projector; `resolution` and `pool_num` must be perfect
    /// squares with the grid side divisible by the pool side.
    pub fn new(mlp: Mlp, resolution: usize, pool_num: usize) -> ProjectorResult<Self> {
        pool_geometry(resolution, pool_num).map_err(|e| ProjectorError::Config(e.to_string()))?;
        Ok(Self {
            mlp,
            resolution,
            pool_num,
        })
    }

    pub fn resolution(&self) -> usize {
        self.resolution
    }

    pub fn pool_num(&self) -> usize {
        self.pool_num
    }

    fn frames_in(&self, tokens: usize) -> Result<usize> {
        if tokens == 0 || tokens % self.resolution != 0 {
            candle_core::bail!(
                "{tokens} tokens is not a whole number of {}-token frames",
                self.resolution
            );
        }
        Ok(tokens / self.resolution)
    }

    /// `[n, t * res, c]` -> `[n, t * res + t * pool_num + 1, c]`.
    pub fn augment(&self, x: &Tensor) -> Result<Tensor> {
        let (n, k, c) = x.dims3()?;
        let t = self.frames_in(k)?;
        let slot = block_pool(&x.reshape((n * t, self.resolution, c))?, self.resolution, self.pool_num)?
            .reshape((n, t * self.pool_num, c))?;
        let global = x.mean_keepdim(1)?;
        Tensor::cat(&[x, &slot, &global], 1)
    }

    /// Clip `[t * res, c]` -> `[t * res + t * pool_num + 1, c]`.
    pub fn augment_clip(&self, item: &Tensor) -> Result<Tensor> {
        let (k, c) = item.dims2()?;
        let t = self.frames_in(k)?;
        let slot = block_pool(&item.reshape((t, self.resolution, c))?, self.resolution, self.pool_num)?
            .reshape((t * self.pool_num, c))?;
        let global = item.mean_keepdim(0)?;
        Tensor::cat(&[item, &slot, &global], 0)
    }
}

impl VisionProjector for PoolProjector {
    fn kind(&self) -> ProjectorKind {
        ProjectorKind::Pool
    }

    fn output_dim(&self) -> usize {
        self.mlp.out_dim()
    }

    fn forward(
        &self,
        input: &ProjectorInput,
        _assignment: Option<&Tensor>,
    ) -> ProjectorResult<ProjectorOutput> {
        let output = match input {
            ProjectorInput::Tensor(x) => {
                let tokens = self.augment(&flatten_time(x)?)?;
                ProjectorOutput::Tensor(self.mlp.forward(&tokens)?)
            }
            ProjectorInput::Batch(items) => {
                let clips = items
                    .iter()
                    .map(|item| self.augment_clip(item))
                    .collect::<Result<Vec<_>>>()?;
                if projector_core::debug::enabled() {
                    let lens: Vec<usize> = clips.iter().map(|c| c.dim(0).unwrap_or(0)).collect();
                    debug!(clip_tokens = ?lens, "pool projector clips");
                }
                ProjectorOutput::Batch(project_rows(&self.mlp, &clips)?)
            }
            ProjectorInput::Pair { images, videos } => {
                let images = self.augment(images)?;
                let videos = self.augment(&flatten_time(videos)?)?;
                let (images, videos) = project_pair(&self.mlp, &images, &videos)?;
                ProjectorOutput::Pair { images, videos }
            }
        };
        check_batch(input.batch_size()?, &output)?;
        Ok(output)
    }
}

// ---------------------------------------------------------------------------
// Base / BaseMix
// ---------------------------------------------------------------------------

/// `[n, t, k, c]` -> `[n, t + k, c]`: mean over space, then mean over time.
pub fn time_space_tokens(x: &Tensor) -> Result<Tensor> {
    let time_token = x.mean(2)?;
    let spatial_token = x.mean(1)?;
    Tensor::cat(&[&time_token, &spatial_token], 1)
}

/// MLP projector; videos collapse into per-frame and per-position means.
#[derive(Debug, Clone)]
pub struct BaseProjector {
    mlp: Mlp,
}

impl BaseProjector {
    pub fn new(mlp: Mlp) -> Self {
        Self { mlp }
    }
}

impl VisionProjector for BaseProjector {
    fn kind(&self) -> ProjectorKind {
        ProjectorKind::Base
    }

    fn output_dim(&self) -> usize {
        self.mlp.out_dim()
    }

    fn forward(
        &self,
        input: &ProjectorInput,
        _assignment: Option<&Tensor>,
    ) -> ProjectorResult<ProjectorOutput> {
        let output = match input {
            ProjectorInput::Tensor(x) => match x.rank() {
                3 => ProjectorOutput::Tensor(self.mlp.forward(x)?),
                4 => ProjectorOutput::Tensor(self.mlp.forward(&time_space_tokens(x)?)?),
                r => {
                    return Err(ProjectorError::UnsupportedInput(format!(
                        "base projector expects a 3D or 4D tensor, got rank {r}"
                    )))
                }
            },
            ProjectorInput::Pair { images, videos } => {
                if videos.rank() != 4 {
                    return Err(ProjectorError::UnsupportedInput(format!(
                        "base projector expects [n, t, k, c] videos, got rank {}",
                        videos.rank()
                    )));
                }
                let (images, videos) =
                    project_pair(&self.mlp, images, &time_space_tokens(videos)?)?;
                ProjectorOutput::Pair { images, videos }
            }
            ProjectorInput::Batch(_) => return Err(unsupported(self.kind(), input)),
        };
        check_batch(input.batch_size()?, &output)?;
        Ok(output)
    }
}

/// MLP projector; videos flatten `t * k` into one token sequence.
#[derive(Debug, Clone)]
pub struct BaseMixProjector {
    mlp: Mlp,
}

impl BaseMixProjector {
    pub fn new(mlp: Mlp) -> Self {
        Self { mlp }
    }
}

impl VisionProjector for BaseMixProjector {
    fn kind(&self) -> ProjectorKind {
        ProjectorKind::BaseMix
    }

    fn output_dim(&self) -> usize {
        self.mlp.out_dim()
    }

    fn forward(
        &self,
        input: &ProjectorInput,
        _assignment: Option<&Tensor>,
    ) -> ProjectorResult<ProjectorOutput> {
        let output = match input {
            ProjectorInput::Tensor(x) => ProjectorOutput::Tensor(self.mlp.forward(&flatten_time(x)?)?),
            ProjectorInput::Pair { images, videos } => {
                let (images, videos) = project_pair(&self.mlp, images, &flatten_time(videos)?)?;
                ProjectorOutput::Pair { images, videos }
            }
            ProjectorInput::Batch(_) => return Err(unsupported(self.kind(), input)),
        };
        check_batch(input.batch_size()?, &output)?;
        Ok(output)
    }
}
