//! Реестр поддерживаемых типов проекторов.
//!
//! Строка `mm_projector_type` из конфигурации разбирается в [`ProjectorKind`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ProjectorError;

/// Тип мультимодального проектора.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProjectorKind {
    /// Один линейный слой `mm_hidden_size -> hidden_size`.
    Linear,
    /// `mlp{N}x_gelu`: N линейных слоёв с GELU между ними; `mlp0x_gelu` даёт один слой.
    MlpGelu(usize),
    /// Проход без изменений.
    Identity,
    /// Slot Attention.
    Slot,
    /// Perceiver-сэмплер на cross-attention.
    Perceiver,
    /// MLP + Slot Attention со случайным выбором ветки при обучении.
    MlpSlot,
    /// MLP + добавленные обучаемые query-токены.
    Compress,
    /// MLP + блочный пулинг по пространственной сетке.
    Pool,
    /// MLP + усреднение видео по времени и пространству.
    Base,
    /// MLP + разворачивание видео `t*k` в одну последовательность.
    BaseMix,
    /// Qwen-style resampler с 2D sincos позиционкой.
    Resampler,
}

impl ProjectorKind {
    /// Все типы с фиксированным именем (плюс `mlp2x_gelu` как пример семейства MLP).
    pub fn all() -> &'static [ProjectorKind] {
        &[
            ProjectorKind::Linear,
            ProjectorKind::MlpGelu(2),
            ProjectorKind::Identity,
            ProjectorKind::Slot,
            ProjectorKind::Perceiver,
            ProjectorKind::MlpSlot,
            ProjectorKind::Compress,
            ProjectorKind::Pool,
            ProjectorKind::Base,
            ProjectorKind::BaseMix,
            ProjectorKind::Resampler,
        ]
    }

    /// Строковый идентификатор, как в `mm_projector_type`.
    pub fn as_str(&self) -> String {
        match self {
            ProjectorKind::Linear => "linear".to_string(),
            ProjectorKind::MlpGelu(depth) => format!("mlp{}x_gelu", depth),
            ProjectorKind::Identity => "identity".to_string(),
            ProjectorKind::Slot => "slot".to_string(),
            ProjectorKind::Perceiver => "perceiver".to_string(),
            ProjectorKind::MlpSlot => "mlpslot".to_string(),
            ProjectorKind::Compress => "compress".to_string(),
            ProjectorKind::Pool => "pool".to_string(),
            ProjectorKind::Base => "base".to_string(),
            ProjectorKind::BaseMix => "base_mix".to_string(),
            ProjectorKind::Resampler => "resampler".to_string(),
        }
    }

    /// Человекочитаемое описание.
    pub fn display_name(&self) -> &'static str {
        match self {
            ProjectorKind::Linear => "Linear projector",
            ProjectorKind::MlpGelu(_) => "MLP projector (GELU)",
            ProjectorKind::Identity => "Identity map",
            ProjectorKind::Slot => "Slot Attention",
            ProjectorKind::Perceiver => "Perceiver sampler",
            ProjectorKind::MlpSlot => "MLP / Slot Attention mix",
            ProjectorKind::Compress => "Compress projector",
            ProjectorKind::Pool => "Pool projector",
            ProjectorKind::Base => "Base projector",
            ProjectorKind::BaseMix => "Base-mix projector",
            ProjectorKind::Resampler => "Qwen resampler",
        }
    }

    /// Требует ли тип параметр `n_slot`.
    pub fn needs_slots(&self) -> bool {
        matches!(
            self,
            ProjectorKind::Slot
                | ProjectorKind::Perceiver
                | ProjectorKind::MlpSlot
                | ProjectorKind::Compress
                | ProjectorKind::Resampler
        )
    }
}

/// `mlp{N}x_gelu` -> `Some(N)`.
fn parse_mlp_depth(s: &str) -> Option<usize> {
    let digits = s.strip_prefix("mlp")?.strip_suffix("x_gelu")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

impl FromStr for ProjectorKind {
    type Err = ProjectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "linear" => ProjectorKind::Linear,
            "identity" => ProjectorKind::Identity,
            "slot" => ProjectorKind::Slot,
            "perceiver" => ProjectorKind::Perceiver,
            "mlpslot" => ProjectorKind::MlpSlot,
            "compress" => ProjectorKind::Compress,
            "pool" => ProjectorKind::Pool,
            "base" => ProjectorKind::Base,
            "base_mix" => ProjectorKind::BaseMix,
            "resampler" => ProjectorKind::Resampler,
            other => match parse_mlp_depth(other) {
                Some(depth) => ProjectorKind::MlpGelu(depth),
                None => return Err(ProjectorError::UnknownProjectorType(other.to_string())),
            },
        };
        Ok(kind)
    }
}

impl fmt::Display for ProjectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
