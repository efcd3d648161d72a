//! Общие типы входов и выходов проекторов.
//!
//! Проектор принимает либо один тензор признаков, либо пару
//! «изображения + видео» (гетерогенный батч), либо список клипов
//! переменной длины.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{ProjectorError, ProjectorResult};

// ---------------------------------------------------------------------------
// Вход
// ---------------------------------------------------------------------------

/// Признаки vision-энкодера.
#[derive(Debug, Clone)]
pub enum ProjectorInput {
    /// `[batch, tokens, channels]` или `[batch, time, tokens, channels]`.
    Tensor(Tensor),

    /// Изображения `[n, k, c]` и видео `[m, t*k, c]` / `[m, t, k, c]` одного шага.
    Pair { images: Tensor, videos: Tensor },

    /// Клипы переменной длины или отдельные сэмплы.
    Batch(Vec<Tensor>),
}

impl ProjectorInput {
    /// Размер батча (для `Pair`: изображения + видео).
    pub fn batch_size(&self) -> ProjectorResult<usize> {
        Ok(match self {
            ProjectorInput::Tensor(t) => t.dim(0)?,
            ProjectorInput::Pair { images, videos } => images.dim(0)? + videos.dim(0)?,
            ProjectorInput::Batch(items) => items.len(),
        })
    }

    /// Короткое имя варианта для сообщений об ошибках.
    pub fn variant_name(&self) -> &'static str {
        match self {
            ProjectorInput::Tensor(_) => "tensor",
            ProjectorInput::Pair { .. } => "image/video pair",
            ProjectorInput::Batch(_) => "batch",
        }
    }
}

impl From<Tensor> for ProjectorInput {
    fn from(t: Tensor) -> Self {
        ProjectorInput::Tensor(t)
    }
}

impl From<Vec<Tensor>> for ProjectorInput {
    fn from(items: Vec<Tensor>) -> Self {
        ProjectorInput::Batch(items)
    }
}

// ---------------------------------------------------------------------------
// Выход
// ---------------------------------------------------------------------------

/// Эмбеддинги в пространстве LLM.
#[derive(Debug, Clone)]
pub enum ProjectorOutput {
    /// Один тензор `[batch, tokens, hidden]`.
    Tensor(Tensor),

    /// Изображения и видео, раскладка как на входе.
    Pair { images: Tensor, videos: Tensor },

    /// По одному тензору на клип / сэмпл, порядок как на входе.
    Batch(Vec<Tensor>),
}

impl ProjectorOutput {
    /// Количество выходных элементов (строк батча).
    pub fn batch_size(&self) -> ProjectorResult<usize> {
        Ok(match self {
            ProjectorOutput::Tensor(t) => t.dim(0)?,
            ProjectorOutput::Pair { images, videos } => images.dim(0)? + videos.dim(0)?,
            ProjectorOutput::Batch(items) => items.len(),
        })
    }

    /// Забрать единственный тензор.
    pub fn into_tensor(self) -> ProjectorResult<Tensor> {
        match self {
            ProjectorOutput::Tensor(t) => Ok(t),
            other => Err(ProjectorError::UnsupportedInput(format!(
                "expected a single tensor output, got {}",
                other.variant_name()
            ))),
        }
    }

    /// Забрать пару изображений и видео.
    pub fn into_pair(self) -> ProjectorResult<(Tensor, Tensor)> {
        match self {
            ProjectorOutput::Pair { images, videos } => Ok((images, videos)),
            other => Err(ProjectorError::UnsupportedInput(format!(
                "expected an image/video pair output, got {}",
                other.variant_name()
            ))),
        }
    }

    /// Забрать список тензоров.
    pub fn into_batch(self) -> ProjectorResult<Vec<Tensor>> {
        match self {
            ProjectorOutput::Batch(items) => Ok(items),
            other => Err(ProjectorError::UnsupportedInput(format!(
                "expected a batch output, got {}",
                other.variant_name()
            ))),
        }
    }

    /// Размер последней оси (ширина эмбеддинга).
    pub fn channels(&self) -> ProjectorResult<usize> {
        let t = match self {
            ProjectorOutput::Tensor(t) => t,
            ProjectorOutput::Pair { images, .. } => images,
            ProjectorOutput::Batch(items) => items.first().ok_or_else(|| {
                ProjectorError::UnsupportedInput("empty batch output".to_string())
            })?,
        };
        Ok(t.dim(candle_core::D::Minus1)?)
    }

    fn variant_name(&self) -> &'static str {
        match self {
            ProjectorOutput::Tensor(_) => "tensor",
            ProjectorOutput::Pair { .. } => "image/video pair",
            ProjectorOutput::Batch(_) => "batch",
        }
    }
}

// ---------------------------------------------------------------------------
// Ветки MultiProjector
// ---------------------------------------------------------------------------

/// Ветка, выбранная для сэмпла при обучении `mlpslot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Branch {
    /// MLP-ветка (значение 0 во внешнем тензоре).
    Mlp,
    /// Slot Attention (значение 1).
    Slot,
}

impl Branch {
    /// Противоположная ветка.
    pub fn flipped(self) -> Self {
        match self {
            Branch::Mlp => Branch::Slot,
            Branch::Slot => Branch::Mlp,
        }
    }

    /// Числовой код ветки.
    pub fn code(self) -> u32 {
        match self {
            Branch::Mlp => 0,
            Branch::Slot => 1,
        }
    }

    /// Разобрать тензор назначений `[batch]` или `[batch, 1]` со значениями 0/1.
    pub fn from_tensor(assignment: &Tensor) -> ProjectorResult<Vec<Branch>> {
        let values = assignment
            .flatten_all()?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?;
        values
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                if v == 0.0 {
                    Ok(Branch::Mlp)
                } else if v == 1.0 {
                    Ok(Branch::Slot)
                } else {
                    Err(ProjectorError::InvalidAssignment(format!(
                        "entry {} has value {}, expected 0 or 1",
                        i, v
                    )))
                }
            })
            .collect()
    }

    /// Собрать тензор `[batch, 1]` (u32) из назначений.
    pub fn to_tensor(branches: &[Branch], device: &candle_core::Device) -> ProjectorResult<Tensor> {
        let codes: Vec<u32> = branches.iter().map(|b| b.code()).collect();
        Ok(Tensor::from_vec(codes, (branches.len(), 1), device)?)
    }
}
