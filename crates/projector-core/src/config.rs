//! Конфигурационные структуры для проекторов.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ProjectorError, ProjectorResult};
use crate::registry::ProjectorKind;

fn default_projector_type() -> String {
    "linear".to_string()
}

fn default_slot_iters() -> usize {
    3
}

fn default_slot_eps() -> f64 {
    1e-4
}

/// Конфигурация мультимодального проектора.
///
/// Поля совпадают с ключами `config.json` LLaVA-подобных моделей, поэтому
/// один и тот же файл можно читать целиком: лишние ключи игнорируются.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectorConfig {
    /// Тип проектора (`linear`, `mlp2x_gelu`, `slot`, ...).
    #[serde(default = "default_projector_type")]
    pub mm_projector_type: String,

    /// Размерность признаков vision-энкодера.
    pub mm_hidden_size: usize,

    /// Размерность эмбеддингов LLM.
    pub hidden_size: usize,

    /// Количество слотов / query-токенов.
    #[serde(default)]
    pub n_slot: Option<usize>,

    /// Количество токенов одного кадра (квадрат стороны сетки).
    #[serde(default)]
    pub resolution: Option<usize>,

    /// Количество ячеек пулинга на кадр (квадрат стороны макро-сетки).
    #[serde(default)]
    pub pool_num: Option<usize>,

    /// Итерации Slot Attention.
    #[serde(default = "default_slot_iters")]
    pub slot_iters: usize,

    /// Смещение attention-коэффициентов перед нормализацией в Slot Attention.
    #[serde(default = "default_slot_eps")]
    pub slot_eps: f64,

    /// Seed для выбора ветки в `mlpslot` (`None`: из энтропии).
    #[serde(default)]
    pub seed: Option<u64>,

    /// Параметры Perceiver-сэмплера.
    #[serde(default)]
    pub perceiver: PerceiverConfig,

    /// Параметры Qwen-resampler.
    #[serde(default)]
    pub resampler: ResamplerConfig,
}

impl ProjectorConfig {
    /// Минимальная конфигурация для заданного типа.
    pub fn new(mm_projector_type: impl Into<String>, mm_hidden_size: usize, hidden_size: usize) -> Self {
        Self {
            mm_projector_type: mm_projector_type.into(),
            mm_hidden_size,
            hidden_size,
            n_slot: None,
            resolution: None,
            pool_num: None,
            slot_iters: default_slot_iters(),
            slot_eps: default_slot_eps(),
            seed: None,
            perceiver: PerceiverConfig::default(),
            resampler: ResamplerConfig::default(),
        }
    }

    /// Установить количество слотов.
    pub fn with_slots(mut self, n_slot: usize) -> Self {
        self.n_slot = Some(n_slot);
        self
    }

    /// Установить геометрию пулинга.
    pub fn with_pooling(mut self, resolution: usize, pool_num: usize) -> Self {
        self.resolution = Some(resolution);
        self.pool_num = Some(pool_num);
        self
    }

    /// Установить seed для случайного выбора ветки.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Разобрать `mm_projector_type`.
    pub fn kind(&self) -> ProjectorResult<ProjectorKind> {
        self.mm_projector_type.parse()
    }

    /// `n_slot`, обязательный для slot/perceiver/mlpslot/compress/resampler.
    pub fn require_slots(&self) -> ProjectorResult<usize> {
        match self.n_slot {
            Some(n) if n > 0 => Ok(n),
            _ => Err(ProjectorError::Config(format!(
                "projector '{}' requires a positive n_slot",
                self.mm_projector_type
            ))),
        }
    }

    /// `resolution`, обязательный для pool.
    pub fn require_resolution(&self) -> ProjectorResult<usize> {
        match self.resolution {
            Some(r) if r > 0 => Ok(r),
            _ => Err(ProjectorError::Config(format!(
                "projector '{}' requires a positive resolution",
                self.mm_projector_type
            ))),
        }
    }

    /// `pool_num`, по умолчанию 1.
    pub fn pool_num(&self) -> usize {
        self.pool_num.unwrap_or(1)
    }

    /// Загрузить конфигурацию из JSON-файла.
    pub fn from_json_file(path: impl AsRef<Path>) -> ProjectorResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Загрузить конфигурацию из HuggingFace `config.json` модели.
    ///
    /// Ключи проектора лежат на верхнем уровне; если есть `text_config`,
    /// `hidden_size` берётся оттуда, когда на верхнем уровне его нет.
    pub fn from_hf_config(path: impl AsRef<Path>) -> ProjectorResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut value: serde_json::Value = serde_json::from_str(&content)?;

        if value.get("hidden_size").is_none() {
            let inner = value
                .get("text_config")
                .and_then(|v| v.get("hidden_size"))
                .cloned()
                .ok_or_else(|| ProjectorError::Config("Missing hidden_size".to_string()))?;
            if let Some(obj) = value.as_object_mut() {
                obj.insert("hidden_size".to_string(), inner);
            }
        }

        Ok(serde_json::from_value(value)?)
    }
}

/// Конфигурация cross-attention стека Perceiver-сэмплера (BERT-base по умолчанию).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerceiverConfig {
    /// Hidden size of the query transformer.
    pub hidden_size: usize,

    /// Number of transformer layers.
    pub num_hidden_layers: usize,

    /// Number of attention heads.
    pub num_attention_heads: usize,

    /// Feed-forward intermediate dimension.
    pub intermediate_size: usize,

    /// Insert a cross-attention block every `cross_attention_freq` layers.
    pub cross_attention_freq: usize,

    /// Layer normalization epsilon.
    pub layer_norm_eps: f64,

    /// Std of the query token initialization.
    pub initializer_range: f64,
}

impl Default for PerceiverConfig {
    fn default() -> Self {
        Self::bert_base()
    }
}

impl PerceiverConfig {
    /// BERT-base widths.
    pub fn bert_base() -> Self {
        Self {
            hidden_size: 768,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            intermediate_size: 3072,
            cross_attention_freq: 2,
            layer_norm_eps: 1e-12,
            initializer_range: 0.02,
        }
    }

    /// Head dimension (hidden_size / num_heads).
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Whether layer `idx` carries a cross-attention block.
    pub fn has_cross_attention(&self, idx: usize) -> bool {
        self.cross_attention_freq > 0 && idx % self.cross_attention_freq == 0
    }
}

/// Конфигурация Qwen-resampler (фиксированные ширины Qwen-VL).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResamplerConfig {
    /// Attention width.
    pub embed_dim: usize,

    /// Number of attention heads.
    pub num_heads: usize,

    /// Intermediate key/value width bridging the source features.
    pub kv_dim: usize,
}

impl Default for ResamplerConfig {
    fn default() -> Self {
        Self::qwen_vl()
    }
}

impl ResamplerConfig {
    /// Qwen-VL widths: 4096 hidden, 4096/128 heads, kv_dim 1664.
    pub fn qwen_vl() -> Self {
        Self {
            embed_dim: 4096,
            num_heads: 4096 / 128,
            kv_dim: 1664,
        }
    }
}
