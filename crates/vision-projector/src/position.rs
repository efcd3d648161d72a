//! 2D sin/cos position embeddings and their resizing for the resampler.

use candle_core::{DType, Device, Result, Tensor};

/// Cubic convolution coefficient used by bicubic interpolation.
const CUBIC_A: f64 = -0.75;

/// 1D sin/cos embedding of `positions` into `embed_dim` channels.
///
/// Row layout: `[sin(pos * omega), cos(pos * omega)]`,
/// `omega_i = 1 / 10000^(i / (embed_dim / 2))`.
fn sincos_1d(embed_dim: usize, positions: &[f64]) -> Vec<Vec<f32>> {
    let half = embed_dim / 2;
    let omega: Vec<f64> = (0..half)
        .map(|i| 1.0 / 10000f64.powf(i as f64 / half as f64))
        .collect();

    positions
        .iter()
        .map(|&pos| {
            let mut row = Vec::with_capacity(embed_dim);
            row.extend(omega.iter().map(|w| (pos * w).sin() as f32));
            row.extend(omega.iter().map(|w| (pos * w).cos() as f32));
            row
        })
        .collect()
}

/// 2D sin/cos position table of shape `[grid_size^2 (+1), embed_dim]`.
///
/// The first half of the channels encodes the column index, the second half
/// the row index. `cls_token` prepends an all-zero row.
pub fn get_2d_sincos_pos_embed(
    embed_dim: usize,
    grid_size: usize,
    cls_token: bool,
    device: &Device,
) -> Result<Tensor> {
    if embed_dim % 4 != 0 {
        candle_core::bail!("2D sincos embedding needs embed_dim divisible by 4, got {embed_dim}");
    }

    let num_positions = grid_size * grid_size;
    let cols: Vec<f64> = (0..num_positions).map(|i| (i % grid_size) as f64).collect();
    let rows: Vec<f64> = (0..num_positions).map(|i| (i / grid_size) as f64).collect();
    let emb_w = sincos_1d(embed_dim / 2, &cols);
    let emb_h = sincos_1d(embed_dim / 2, &rows);

    let extra = usize::from(cls_token);
    let mut data = vec![0f32; (num_positions + extra) * embed_dim];
    for i in 0..num_positions {
        let offset = (i + extra) * embed_dim;
        data[offset..offset + embed_dim / 2].copy_from_slice(&emb_w[i]);
        data[offset + embed_dim / 2..offset + embed_dim].copy_from_slice(&emb_h[i]);
    }

    Tensor::from_vec(data, (num_positions + extra, embed_dim), device)
}

fn cubic_weights(t: f64) -> [f64; 4] {
    let a = CUBIC_A;
    // |x| in (1, 2)
    let outer = |x: f64| ((a * x - 5.0 * a) * x + 8.0 * a) * x - 4.0 * a;
    // |x| <= 1
    let inner = |x: f64| ((a + 2.0) * x - (a + 3.0)) * x * x + 1.0;
    [outer(t + 1.0), inner(t), inner(1.0 - t), outer(2.0 - t)]
}

/// Source taps and weights for each output index along one axis
/// (`align_corners = false`, taps clamped to the border).
fn cubic_taps(in_size: usize, out_size: usize) -> Vec<([usize; 4], [f64; 4])> {
    let scale = in_size as f64 / out_size as f64;
    let last = in_size as i64 - 1;
    (0..out_size)
        .map(|dst| {
            let src = (dst as f64 + 0.5) * scale - 0.5;
            let floor = src.floor();
            let base = floor as i64;
            let weights = cubic_weights(src - floor);
            let mut idx = [0usize; 4];
            for (j, slot) in idx.iter_mut().enumerate() {
                *slot = (base - 1 + j as i64).clamp(0, last) as usize;
            }
            (idx, weights)
        })
        .collect()
}

/// Bicubic resize of a `[src, src, channels]` grid (row-major) to `[dst, dst, channels]`.
fn bicubic_resize(data: &[f32], src: usize, dst: usize, channels: usize) -> Vec<f32> {
    let taps = cubic_taps(src, dst);
    let mut out = vec![0f32; dst * dst * channels];
    let mut acc = vec![0f64; channels];

    for (oy, (iy, wy)) in taps.iter().enumerate() {
        for (ox, (ix, wx)) in taps.iter().enumerate() {
            acc.iter_mut().for_each(|v| *v = 0.0);
            for (r, &y) in iy.iter().enumerate() {
                for (c, &x) in ix.iter().enumerate() {
                    let w = wy[r] * wx[c];
                    let base = (y * src + x) * channels;
                    for (ch, v) in acc.iter_mut().enumerate() {
                        *v += w * data[base + ch] as f64;
                    }
                }
            }
            let base = (oy * dst + ox) * channels;
            for (ch, v) in acc.iter().enumerate() {
                out[base + ch] = *v as f32;
            }
        }
    }
    out
}

/// Resize a square position table `[L, C]` to `tgt_size` rows.
///
/// When `isqrt(tgt_size)` equals the source side the table is returned
/// unchanged; otherwise it is bicubically interpolated (in f32) to a
/// `isqrt(tgt_size)` square grid and cast back to the source dtype.
pub fn get_abs_pos(abs_pos: &Tensor, tgt_size: usize) -> Result<Tensor> {
    let (len, channels) = abs_pos.dims2()?;
    let src_size = (len as f64).sqrt() as usize;
    let tgt_side = (tgt_size as f64).sqrt() as usize;

    if src_size == tgt_side {
        return Ok(abs_pos.clone());
    }
    if src_size == 0 || tgt_side == 0 {
        candle_core::bail!("cannot resize a {len}-row position table to {tgt_size} rows");
    }

    let dtype = abs_pos.dtype();
    let data = abs_pos
        .narrow(0, 0, src_size * src_size)?
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    let resized = bicubic_resize(&data, src_size, tgt_side, channels);

    Tensor::from_vec(resized, (tgt_side * tgt_side, channels), abs_pos.device())?.to_dtype(dtype)
}
