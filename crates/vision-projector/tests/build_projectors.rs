//! Integration tests for the projector factory.

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use projector_core::{
    Branch, PerceiverConfig, ProjectorConfig, ProjectorError, ProjectorInput, ProjectorKind,
    ResamplerConfig, VisionProjector,
};
use vision_projector::build_vision_projector;

const MM_HIDDEN: usize = 8;
const HIDDEN: usize = 12;

/// Small widths so the heavyweight variants build quickly.
fn small_config(projector_type: &str) -> ProjectorConfig {
    let mut config = ProjectorConfig::new(projector_type, MM_HIDDEN, HIDDEN)
        .with_slots(4)
        .with_pooling(16, 4)
        .with_seed(42);
    config.perceiver = PerceiverConfig {
        hidden_size: 16,
        num_hidden_layers: 2,
        num_attention_heads: 2,
        intermediate_size: 32,
        ..PerceiverConfig::bert_base()
    };
    config.resampler = ResamplerConfig {
        embed_dim: 16,
        num_heads: 4,
        kv_dim: 12,
    };
    config
}

fn build(config: &ProjectorConfig) -> Box<dyn VisionProjector> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    build_vision_projector(config, vb).unwrap()
}

/// Feature width the variant consumes.
fn input_width(kind: ProjectorKind) -> usize {
    match kind {
        ProjectorKind::Compress | ProjectorKind::Pool | ProjectorKind::BaseMix => 4 * MM_HIDDEN,
        _ => MM_HIDDEN,
    }
}

#[test]
fn test_every_kind_projects_to_hidden() {
    let device = Device::Cpu;
    let types = [
        "linear",
        "mlp2x_gelu",
        "mlp3x_gelu",
        "slot",
        "perceiver",
        "mlpslot",
        "compress",
        "pool",
        "base",
        "base_mix",
        "resampler",
    ];

    for projector_type in types {
        let config = small_config(projector_type);
        let projector = build(&config);
        let kind = projector.kind();
        assert_eq!(kind.as_str(), projector_type);
        assert_eq!(projector.output_dim(), HIDDEN, "{projector_type}");

        let x = Tensor::randn(0f32, 1f32, (2, 16, input_width(kind)), &device).unwrap();
        let out = projector
            .forward(&ProjectorInput::Tensor(x), None)
            .unwrap()
            .into_tensor()
            .unwrap();
        assert_eq!(out.dim(0).unwrap(), 2, "{projector_type}");
        assert_eq!(out.dim(2).unwrap(), HIDDEN, "{projector_type}");
    }
}

#[test]
fn test_token_counts() {
    let device = Device::Cpu;
    let cases = [
        ("linear", 16),
        ("slot", 4),
        ("perceiver", 4),
        ("compress", 16 + 4),
        ("pool", 16 + 4 + 1),
        ("resampler", 4),
    ];

    for (projector_type, tokens) in cases {
        let config = small_config(projector_type);
        let projector = build(&config);
        let kind = config.kind().unwrap();
        let x = Tensor::randn(0f32, 1f32, (1, 16, input_width(kind)), &device).unwrap();
        let out = projector
            .forward(&ProjectorInput::Tensor(x), None)
            .unwrap()
            .into_tensor()
            .unwrap();
        assert_eq!(out.dim(1).unwrap(), tokens, "{projector_type}");
    }
}

#[test]
fn test_unknown_type_names_offender() {
    let config = ProjectorConfig::new("mlp2x_relu", MM_HIDDEN, HIDDEN);
    let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
    let err = build_vision_projector(&config, vb).err().unwrap();
    assert!(matches!(err, ProjectorError::UnknownProjectorType(_)));
    assert_eq!(err.to_string(), "Unknown projector type: mlp2x_relu");
}

#[test]
fn test_missing_slots_is_config_error() {
    for projector_type in ["slot", "perceiver", "mlpslot", "compress", "resampler"] {
        let config = ProjectorConfig::new(projector_type, MM_HIDDEN, HIDDEN);
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let err = build_vision_projector(&config, vb).err().unwrap();
        assert!(matches!(err, ProjectorError::Config(_)), "{projector_type}");
    }
}

#[test]
fn test_invalid_pool_geometry() {
    let config = ProjectorConfig::new("pool", MM_HIDDEN, HIDDEN).with_pooling(16, 9);
    let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
    let err = build_vision_projector(&config, vb).err().unwrap();
    assert!(matches!(err, ProjectorError::Config(_)));
}

#[test]
fn test_identity_passthrough() {
    let device = Device::Cpu;
    let projector = build(&ProjectorConfig::new("identity", MM_HIDDEN, MM_HIDDEN));
    assert_eq!(
        projector.config(),
        serde_json::json!({"mm_projector_type": "identity"})
    );

    let x = Tensor::randn(0f32, 1f32, (2, 5, MM_HIDDEN), &device).unwrap();
    let out = projector
        .forward(&ProjectorInput::Tensor(x.clone()), None)
        .unwrap()
        .into_tensor()
        .unwrap();
    let diff = (out - x).unwrap().abs().unwrap().max_all().unwrap();
    assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
}

#[test]
fn test_pool_video_clips() {
    let device = Device::Cpu;
    let projector = build(&small_config("pool"));
    let width = 4 * MM_HIDDEN;

    // Clips of 1 and 3 frames, 16 tokens per frame, 4 pooled tokens per frame.
    let clips = vec![
        Tensor::randn(0f32, 1f32, (16, width), &device).unwrap(),
        Tensor::randn(0f32, 1f32, (48, width), &device).unwrap(),
    ];
    let out = projector
        .forward(&ProjectorInput::Batch(clips), None)
        .unwrap()
        .into_batch()
        .unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].dims(), &[16 + 4 + 1, HIDDEN]);
    assert_eq!(out[1].dims(), &[48 + 12 + 1, HIDDEN]);
}

#[test]
fn test_pool_image_video_pair() {
    let device = Device::Cpu;
    let projector = build(&small_config("pool"));
    let width = 4 * MM_HIDDEN;

    let images = Tensor::randn(0f32, 1f32, (3, 16, width), &device).unwrap();
    let videos = Tensor::randn(0f32, 1f32, (2, 2, 16, width), &device).unwrap();
    let (images, videos) = projector
        .forward(&ProjectorInput::Pair { images, videos }, None)
        .unwrap()
        .into_pair()
        .unwrap();
    assert_eq!(images.dims(), &[3, 16 + 4 + 1, HIDDEN]);
    assert_eq!(videos.dims(), &[2, 32 + 8 + 1, HIDDEN]);
}

#[test]
fn test_base_video_tokens() {
    let device = Device::Cpu;
    let projector = build(&small_config("base"));

    let videos = Tensor::randn(0f32, 1f32, (2, 3, 10, MM_HIDDEN), &device).unwrap();
    let out = projector
        .forward(&ProjectorInput::Tensor(videos), None)
        .unwrap()
        .into_tensor()
        .unwrap();
    assert_eq!(out.dims(), &[2, 3 + 10, HIDDEN]);
}

#[test]
fn test_slot_on_video_tensor() {
    let device = Device::Cpu;
    let projector = build(&small_config("slot"));
    let videos = Tensor::randn(0f32, 1f32, (2, 3, 5, MM_HIDDEN), &device).unwrap();
    let out = projector
        .forward(&ProjectorInput::Tensor(videos), None)
        .unwrap()
        .into_tensor()
        .unwrap();
    assert_eq!(out.dims(), &[2, 4, HIDDEN]);
}

#[test]
fn test_mlpslot_training_rebalances() {
    let device = Device::Cpu;
    let mut projector = build(&small_config("mlpslot"));
    assert!(!projector.is_training());
    projector.set_training(true);

    let x = Tensor::randn(0f32, 1f32, (3, 6, MM_HIDDEN), &device).unwrap();
    let assignment = Tensor::ones((3, 1), DType::F32, &device).unwrap();
    let out = projector
        .forward(&ProjectorInput::Tensor(x), Some(&assignment))
        .unwrap()
        .into_batch()
        .unwrap();

    assert_eq!(out.len(), 3);
    let mlp_rows = out.iter().filter(|t| t.dims() == [6, HIDDEN]).count();
    let slot_rows = out.iter().filter(|t| t.dims() == [4, HIDDEN]).count();
    assert_eq!(mlp_rows, 1);
    assert_eq!(slot_rows, 2);
}

#[test]
fn test_mlpslot_flip_visible_to_caller() {
    let device = Device::Cpu;
    // Token count equals n_slot, so output shapes alone cannot tell branches apart.
    let mut projector = build(&small_config("mlpslot"));
    let x = Tensor::randn(0f32, 1f32, (3, 4, MM_HIDDEN), &device).unwrap();
    let input = ProjectorInput::Tensor(x);

    let eval = projector
        .forward(&input, None)
        .unwrap()
        .into_tensor()
        .unwrap();

    projector.set_training(true);
    let mut assignment = vec![Branch::Mlp; 3];
    let out = projector
        .forward_assigned(&input, &mut assignment)
        .unwrap()
        .into_batch()
        .unwrap();
    assert_eq!(out.len(), 3);

    let flipped: Vec<usize> = (0..3).filter(|&i| assignment[i] == Branch::Slot).collect();
    assert_eq!(flipped.len(), 1);

    // Samples left on the MLP branch match the evaluation output.
    for (i, sample) in out.iter().enumerate() {
        assert_eq!(sample.dims(), &[4, HIDDEN]);
        let diff = (sample - eval.get(i).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        if i == flipped[0] {
            assert!(diff > 0.0);
        } else {
            assert_eq!(diff, 0.0);
        }
    }
}

#[test]
fn test_output_channels() {
    let device = Device::Cpu;
    let projector = build(&small_config("base"));
    let x = Tensor::randn(0f32, 1f32, (2, 5, MM_HIDDEN), &device).unwrap();
    let out = projector.forward(&ProjectorInput::Tensor(x), None).unwrap();
    assert_eq!(out.channels().unwrap(), HIDDEN);
}

#[test]
fn test_mlpslot_eval_is_mlp() {
    let device = Device::Cpu;
    let projector = build(&small_config("mlpslot"));
    let x = Tensor::randn(0f32, 1f32, (3, 6, MM_HIDDEN), &device).unwrap();
    let out = projector
        .forward(&ProjectorInput::Tensor(x), None)
        .unwrap()
        .into_tensor()
        .unwrap();
    assert_eq!(out.dims(), &[3, 6, HIDDEN]);
}

#[test]
fn test_batch_cardinality_preserved() {
    let device = Device::Cpu;
    let projector = build(&small_config("mlp2x_gelu"));
    let items = vec![
        Tensor::randn(0f32, 1f32, (3, MM_HIDDEN), &device).unwrap(),
        Tensor::randn(0f32, 1f32, (7, MM_HIDDEN), &device).unwrap(),
        Tensor::randn(0f32, 1f32, (1, MM_HIDDEN), &device).unwrap(),
    ];
    let out = projector
        .forward(&ProjectorInput::Batch(items), None)
        .unwrap()
        .into_batch()
        .unwrap();
    assert_eq!(out.len(), 3);
    assert_eq!(out[1].dims(), &[7, HIDDEN]);
}
