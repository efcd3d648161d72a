//! Helpers for heterogeneous batches: per-stream mapping, the shared
//! image/video projection and output cardinality checks.

use candle_core::{Module, Result, Tensor};

use projector_core::{ProjectorError, ProjectorInput, ProjectorOutput, ProjectorResult};

use crate::layers::Mlp;

/// Apply `f` to every stream of the input, keeping the input layout.
///
/// 2D batch items get a temporary leading batch axis.
pub fn map_streams<F>(input: &ProjectorInput, f: F) -> ProjectorResult<ProjectorOutput>
where
    F: Fn(&Tensor) -> Result<Tensor>,
{
    let output = match input {
        ProjectorInput::Tensor(t) => ProjectorOutput::Tensor(f(t)?),
        ProjectorInput::Pair { images, videos } => ProjectorOutput::Pair {
            images: f(images)?,
            videos: f(videos)?,
        },
        ProjectorInput::Batch(items) => {
            let outputs = items
                .iter()
                .map(|item| {
                    if item.rank() == 2 {
                        f(&item.unsqueeze(0)?)?.squeeze(0)
                    } else {
                        f(item)
                    }
                })
                .collect::<Result<Vec<_>>>()?;
            ProjectorOutput::Batch(outputs)
        }
    };
    check_batch(input.batch_size()?, &output)?;
    Ok(output)
}

/// Project images `[n, k, c]` and videos `[m, k2, c]` with a single MLP call.
///
/// Rows are concatenated, projected, then split at `n * k` and restored to
/// `[n, k, hidden]` / `[m, k2, hidden]`.
pub fn project_pair(mlp: &Mlp, images: &Tensor, videos: &Tensor) -> Result<(Tensor, Tensor)> {
    let (n, k, c) = images.dims3()?;
    let (m, k2, c2) = videos.dims3()?;
    if c != c2 {
        candle_core::bail!("image width {c} differs from video width {c2}");
    }

    let combined = Tensor::cat(
        &[&images.reshape((n * k, c))?, &videos.reshape((m * k2, c))?],
        0,
    )?;
    let projected = mlp.forward(&combined)?;
    let hidden = mlp.out_dim();

    let split = n * k;
    let images = projected.narrow(0, 0, split)?.reshape((n, k, hidden))?;
    let videos = projected.narrow(0, split, m * k2)?.reshape((m, k2, hidden))?;
    Ok((images, videos))
}

/// Run one MLP call over row-stacked items and split the result back.
pub fn project_rows(mlp: &Mlp, items: &[Tensor]) -> Result<Vec<Tensor>> {
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let refs: Vec<&Tensor> = items.iter().collect();
    let projected = mlp.forward(&Tensor::cat(&refs, 0)?)?;

    let mut offset = 0;
    let mut outputs = Vec::with_capacity(items.len());
    for item in items {
        let rows = item.dim(0)?;
        outputs.push(projected.narrow(0, offset, rows)?);
        offset += rows;
    }
    Ok(outputs)
}

/// Output cardinality must match the input batch.
pub fn check_batch(expected: usize, output: &ProjectorOutput) -> ProjectorResult<()> {
    let actual = output.batch_size()?;
    if actual != expected {
        return Err(ProjectorError::BatchMismatch { expected, actual });
    }
    Ok(())
}
