//!
//! CLI для мультимодальных проекторов: список типов, разбор конфигурации,
//! прогон forward на случайных признаках.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

use projector_core::{ProjectorConfig, ProjectorInput, ProjectorKind, ProjectorOutput};
use vision_projector::build_vision_projector;

#[derive(Parser)]
#[command(name = "projector")]
#[command(author, version, about = "Vision projectors: map vision features into LLM space", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List recognized projector types
    Kinds,

    /// Parse a config and print the resolved projector
    Inspect {
        /// Path to config.json (projector config or full HuggingFace config)
        #[arg(long)]
        config: PathBuf,
    },

    /// Build a projector and run one forward pass on random features
    Forward {
        /// Path to config.json
        #[arg(long)]
        config: PathBuf,

        /// Размер батча
        #[arg(long, default_value_t = 2)]
        batch: usize,

        /// Токенов на кадр (по умолчанию `resolution` из конфига или 16)
        #[arg(long)]
        tokens: Option<usize>,

        /// Количество кадров: вход `[batch, frames, tokens, c]` вместо `[batch, tokens, c]`
        #[arg(long)]
        frames: Option<usize>,

        /// Device to use (cpu, metal, cuda)
        #[arg(long, default_value = "cpu")]
        device: String,

        /// Safetensors-файл с весами проектора (без него веса нулевые)
        #[arg(long)]
        weights: Option<PathBuf>,

        /// Префикс весов проектора внутри файла (например, `model.mm_projector`)
        #[arg(long)]
        prefix: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Kinds => {
            for kind in ProjectorKind::all() {
                let slots = if kind.needs_slots() { "  (n_slot)" } else { "" };
                println!("{:<12} {}{}", kind.as_str(), kind.display_name(), slots);
            }
            println!("{:<12} {}", "mlp{N}x_gelu", "MLP with N linear layers (0 builds one layer)");
            Ok(())
        }

        Commands::Inspect { config } => {
            let config = load_config(&config)?;
            let kind = config.kind()?;
            println!("Projector: {} ({})", kind, kind.display_name());
            println!("mm_hidden_size: {}", config.mm_hidden_size);
            println!("hidden_size: {}", config.hidden_size);
            println!("input width: {}", input_width(kind, config.mm_hidden_size));
            if let Some(n_slot) = config.n_slot {
                println!("n_slot: {}", n_slot);
            }
            if kind == ProjectorKind::Pool {
                println!("resolution: {:?}", config.resolution);
                println!("pool_num: {}", config.pool_num());
            }
            Ok(())
        }

        Commands::Forward {
            config,
            batch,
            tokens,
            frames,
            device,
            weights,
            prefix,
        } => run_forward(
            &config,
            batch,
            tokens,
            frames,
            &device,
            weights.as_deref(),
            prefix.as_deref(),
        ),
    }
}

/// Конфиг проектора или полный HuggingFace `config.json`.
fn load_config(path: &Path) -> Result<ProjectorConfig> {
    ProjectorConfig::from_hf_config(path)
        .with_context(|| format!("failed to read config {}", path.display()))
}

/// compress/pool/base_mix получают признаки после слияния 2x2 соседних токенов.
fn input_width(kind: ProjectorKind, mm_hidden_size: usize) -> usize {
    match kind {
        ProjectorKind::Compress | ProjectorKind::Pool | ProjectorKind::BaseMix => {
            4 * mm_hidden_size
        }
        _ => mm_hidden_size,
    }
}

fn run_forward(
    config_path: &Path,
    batch: usize,
    tokens: Option<usize>,
    frames: Option<usize>,
    device: &str,
    weights: Option<&Path>,
    prefix: Option<&str>,
) -> Result<()> {
    let config = load_config(config_path)?;
    let kind = config.kind()?;
    let device = create_device(device)?;

    let vb = match weights {
        Some(path) => {
            info!("Загрузка весов проектора из {:?}", path);
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, &device)? };
            match prefix {
                Some(p) => vb.pp(p),
                None => vb,
            }
        }
        None => VarBuilder::zeros(DType::F32, &device),
    };

    let start = Instant::now();
    let projector = build_vision_projector(&config, vb)?;
    println!("Projector: {} -> width {}", kind, projector.output_dim());
    println!("   Built in {:.2?}", start.elapsed());

    let tokens = tokens.or(config.resolution).unwrap_or(16);
    let width = input_width(kind, config.mm_hidden_size);
    let features = match frames {
        Some(t) => Tensor::randn(0f32, 1f32, (batch, t, tokens, width), &device)?,
        None => Tensor::randn(0f32, 1f32, (batch, tokens, width), &device)?,
    };
    println!("Input: {:?}", features.dims());

    let start = Instant::now();
    let output = projector.forward(&ProjectorInput::Tensor(features), None)?;
    println!("Output width: {}", output.channels()?);
    match output {
        ProjectorOutput::Tensor(t) => println!("Output: {:?}", t.dims()),
        ProjectorOutput::Pair { images, videos } => {
            println!("Output images: {:?}", images.dims());
            println!("Output videos: {:?}", videos.dims());
        }
        ProjectorOutput::Batch(items) => {
            for (i, item) in items.iter().enumerate() {
                println!("Output[{}]: {:?}", i, item.dims());
            }
        }
    }
    println!("   Forward in {:.2?}", start.elapsed());
    Ok(())
}

fn create_device(device: &str) -> Result<Device> {
    match device {
        "metal" => {
            // candle может panic при инициализации Metal, если устройство недоступно.
            let prev_hook = std::panic::take_hook();
            std::panic::set_hook(Box::new(|_| {}));
            let res = std::panic::catch_unwind(|| Device::new_metal(0));
            std::panic::set_hook(prev_hook);

            match res {
                Ok(Ok(dev)) => Ok(dev),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(anyhow::anyhow!(
                    "Инициализация Metal недоступна в этом окружении. Попробуйте --device cpu."
                )),
            }
        }
        "cuda" => Ok(Device::new_cuda(0)?),
        _ => Ok(Device::Cpu),
    }
}
