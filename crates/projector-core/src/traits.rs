//! Унифицированный trait для всех проекторов.
//!
//! Каждый вариант (linear, MLP, Slot Attention, resampler, pool, ...)
//! реализует [`VisionProjector`], фабрика возвращает `Box<dyn VisionProjector>`.

use candle_core::Tensor;

use crate::error::ProjectorResult;
use crate::registry::ProjectorKind;
use crate::types::{Branch, ProjectorInput, ProjectorOutput};

/// Унифицированный trait для всех проекторов.
///
/// # Пример
/// ```ignore
/// let projector = build_vision_projector(&config, vb)?;
/// let out = projector.forward(&ProjectorInput::Tensor(features), None)?;
/// let embeds = out.into_tensor()?;
/// ```
pub trait VisionProjector: Send + Sync {
    /// Тип проектора.
    fn kind(&self) -> ProjectorKind;

    /// Ширина выходных эмбеддингов.
    fn output_dim(&self) -> usize;

    /// Прямой проход.
    ///
    /// # Аргументы
    /// * `input`: признаки vision-энкодера.
    /// * `assignment`: назначение веток `[batch, 1]` (0 = MLP, 1 = slot);
    ///   используется только `mlpslot` в режиме обучения. Ребалансированное
    ///   назначение здесь не возвращается, для этого есть [`Self::forward_assigned`].
    fn forward(
        &self,
        input: &ProjectorInput,
        assignment: Option<&Tensor>,
    ) -> ProjectorResult<ProjectorOutput>;

    /// Прямой проход с назначением веток, которое проектор может изменить.
    ///
    /// `mlpslot` в режиме обучения ребалансирует `assignment` на месте, так что
    /// вызывающий видит, какой сэмпл перенесён в другую ветку. Остальные
    /// проекторы назначение игнорируют.
    fn forward_assigned(
        &self,
        input: &ProjectorInput,
        assignment: &mut [Branch],
    ) -> ProjectorResult<ProjectorOutput> {
        let _ = assignment;
        self.forward(input, None)
    }

    /// Краткое описание конфигурации (`{"mm_projector_type": ...}`).
    fn config(&self) -> serde_json::Value {
        serde_json::json!({ "mm_projector_type": self.kind().as_str() })
    }

    /// Переключить режим обучения. Большинство проекторов его не различают.
    fn set_training(&mut self, _training: bool) {}

    /// Включён ли режим обучения.
    fn is_training(&self) -> bool {
        false
    }
}
