//! # projector-core
//!
//! Базовые типы, трейты и определения ошибок для мультимодальных проекторов.
//!
//! Этот крейт предоставляет фундаментальные абстракции для остальных
//! крейтов в workspace:
//!
//! - Конфигурация проектора (`ProjectorConfig`, `PerceiverConfig`, `ResamplerConfig`)
//! - Реестр типов [`ProjectorKind`] (разбор `mm_projector_type`)
//! - Унифицированная обработка ошибок через `ProjectorError`
//! - Входы/выходы (`ProjectorInput`, `ProjectorOutput`, `Branch`)
//! - Trait [`VisionProjector`]: единый интерфейс для всех проекторов

pub mod config;
pub mod debug;
pub mod error;
pub mod registry;
pub mod traits;
pub mod types;

pub use config::{PerceiverConfig, ProjectorConfig, ResamplerConfig};
pub use error::{ProjectorError, ProjectorResult};
pub use registry::ProjectorKind;
pub use traits::VisionProjector;
pub use types::{Branch, ProjectorInput, ProjectorOutput};
