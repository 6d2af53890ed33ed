use std::sync::Arc;

use anyhow::Result;
use attention::{
    masks::build_prefill_mask, AttentionError, DifferentialAttention,
    DifferentialAttentionConfig, DifferentialAttentionWeights, IncrementalCache, KeyValueCache,
    LambdaParameters, ProjectionWeights,
};
use candle_core::{DType, Device, Tensor};
use layers::PrecisionPolicy;
use paligemma::{
    ConditionalGenerationInput, ModelError, PaliGemmaConfig, PaliGemmaForConditionalGeneration,
    VisionEncoder,
};
use static_assertions::assert_impl_all;

assert_impl_all!(PaliGemmaForConditionalGeneration: Send, Sync);

const IMAGE_TOKEN: i64 = 15;
const PAD_TOKEN: i64 = 0;

/// Emits four patches per image, each filled with the image's mean pixel.
struct MeanPatchEncoder {
    width: usize,
}

impl VisionEncoder for MeanPatchEncoder {
    fn hidden_size(&self) -> usize {
        self.width
    }

    fn encode_image(&self, pixel_values: &Tensor) -> candle_core::Result<Tensor> {
        let (batch, _, _, _) = pixel_values.dims4()?;
        let means = pixel_values.flatten_from(1)?.mean_keepdim(1)?;
        means.reshape((batch, 1, 1))?.broadcast_as((batch, 4, self.width))?.contiguous()
    }
}

fn config_json(tie: bool) -> String {
    format!(
        r#"{{
            "text_config": {{
                "vocab_size": 16,
                "hidden_size": 8,
                "intermediate_size": 16,
                "num_hidden_layers": 2,
                "num_attention_heads": 2,
                "num_key_value_heads": 1,
                "max_position_embeddings": 128,
                "tie_word_embeddings": {tie}
            }},
            "vision_config": {{
                "hidden_size": 6,
                "image_size": 28,
                "patch_size": 14,
                "projection_dim": 8
            }},
            "image_token_index": {IMAGE_TOKEN},
            "pad_token_id": {PAD_TOKEN},
            "vocab_size": 16,
            "hidden_size": 8,
            "projection_dim": 8
        }}"#
    )
}

fn build_model(tie: bool) -> Result<PaliGemmaForConditionalGeneration> {
    let config = PaliGemmaConfig::from_json_str(&config_json(tie))?;
    let vision = Arc::new(MeanPatchEncoder { width: 6 });
    Ok(PaliGemmaForConditionalGeneration::new(
        config,
        vision,
        &Device::Cpu,
        DType::F32,
    )?)
}

fn pixels(batch: usize, device: &Device) -> Result<Tensor> {
    Ok(Tensor::randn(0f32, 1.0, (batch, 3, 28, 28), device)?)
}

#[test]
fn prefill_then_one_step_grows_cache_to_six() -> Result<()> {
    let device = Device::Cpu;
    let model = build_model(true)?;
    let policy = model.default_policy();
    let mut cache = model.new_cache();

    let ids = Tensor::from_slice(
        &[IMAGE_TOKEN, IMAGE_TOKEN, IMAGE_TOKEN, IMAGE_TOKEN, 3],
        (1, 5),
        &device,
    )?;
    let mask = Tensor::ones((1, 5), DType::I64, &device)?;
    let prefill = model.forward(
        ConditionalGenerationInput {
            token_ids: &ids,
            pixel_values: Some(&pixels(1, &device)?),
            attention_mask: &mask,
            cache: Some(&mut cache),
            labels: None,
        },
        &policy,
    )?;
    assert_eq!(prefill.logits.dims(), &[1, 5, 16]);
    assert_eq!(prefill.logits.dtype(), DType::F32);
    assert_eq!(cache.seen_len(), 5);

    let next = Tensor::from_slice(&[7i64], (1, 1), &device)?;
    let mask = Tensor::ones((1, 6), DType::I64, &device)?;
    let step = model.forward(
        ConditionalGenerationInput {
            token_ids: &next,
            pixel_values: None,
            attention_mask: &mask,
            cache: Some(&mut cache),
            labels: None,
        },
        &policy,
    )?;
    assert_eq!(step.logits.dims(), &[1, 1, 16]);
    for layer in 0..cache.num_layers() {
        assert_eq!(cache.size(layer), 6);
    }
    Ok(())
}

#[test]
fn continuation_with_two_tokens_is_rejected() -> Result<()> {
    let device = Device::Cpu;
    let model = build_model(true)?;
    let policy = model.default_policy();
    let mut cache = model.new_cache();

    let ids = Tensor::from_slice(&[2i64, 3, 4], (1, 3), &device)?;
    let mask = Tensor::ones((1, 3), DType::I64, &device)?;
    model.forward(
        ConditionalGenerationInput {
            token_ids: &ids,
            pixel_values: None,
            attention_mask: &mask,
            cache: Some(&mut cache),
            labels: None,
        },
        &policy,
    )?;

    let two = Tensor::from_slice(&[5i64, 6], (1, 2), &device)?;
    let mask = Tensor::ones((1, 5), DType::I64, &device)?;
    let result = model.forward(
        ConditionalGenerationInput {
            token_ids: &two,
            pixel_values: None,
            attention_mask: &mask,
            cache: Some(&mut cache),
            labels: None,
        },
        &policy,
    );
    assert!(matches!(
        result,
        Err(ModelError::Attention(AttentionError::ShapeContract { .. }))
    ));
    Ok(())
}

#[test]
fn cache_survives_a_rejected_call() -> Result<()> {
    let device = Device::Cpu;
    let model = build_model(true)?;
    let policy = model.default_policy();
    let mut cache = model.new_cache();

    let ids = Tensor::from_slice(&[2i64, 3, 4], (1, 3), &device)?;
    let mask = Tensor::ones((1, 3), DType::I64, &device)?;
    model.forward(
        ConditionalGenerationInput {
            token_ids: &ids,
            pixel_values: None,
            attention_mask: &mask,
            cache: Some(&mut cache),
            labels: None,
        },
        &policy,
    )?;

    let two = Tensor::from_slice(&[5i64, 6], (1, 2), &device)?;
    let wide = Tensor::ones((1, 5), DType::I64, &device)?;
    let rejected = model.forward(
        ConditionalGenerationInput {
            token_ids: &two,
            pixel_values: None,
            attention_mask: &wide,
            cache: Some(&mut cache),
            labels: None,
        },
        &policy,
    );
    assert!(rejected.is_err());
    assert_eq!(cache.seen_len(), 3);

    let next = Tensor::from_slice(&[5i64], (1, 1), &device)?;
    let mask = Tensor::ones((1, 4), DType::I64, &device)?;
    let step = model.forward(
        ConditionalGenerationInput {
            token_ids: &next,
            pixel_values: None,
            attention_mask: &mask,
            cache: Some(&mut cache),
            labels: None,
        },
        &policy,
    )?;
    assert_eq!(step.logits.dims(), &[1, 1, 16]);
    for layer in 0..cache.num_layers() {
        assert_eq!(cache.size(layer), 4);
    }
    Ok(())
}

#[test]
fn continuation_mask_must_cover_cache_and_new_token() -> Result<()> {
    let device = Device::Cpu;
    let model = build_model(true)?;
    let policy = model.default_policy();
    let mut cache = model.new_cache();

    let ids = Tensor::from_slice(&[2i64, 3, 4], (1, 3), &device)?;
    let mask = Tensor::ones((1, 3), DType::I64, &device)?;
    model.forward(
        ConditionalGenerationInput {
            token_ids: &ids,
            pixel_values: None,
            attention_mask: &mask,
            cache: Some(&mut cache),
            labels: None,
        },
        &policy,
    )?;

    let next = Tensor::from_slice(&[5i64], (1, 1), &device)?;
    for width in [3usize, 5] {
        let mask = Tensor::ones((1, width), DType::I64, &device)?;
        let result = model.forward(
            ConditionalGenerationInput {
                token_ids: &next,
                pixel_values: None,
                attention_mask: &mask,
                cache: Some(&mut cache),
                labels: None,
            },
            &policy,
        );
        assert!(
            matches!(result, Err(ModelError::ShapeContract(_))),
            "mask width {width} accepted"
        );
    }
    assert_eq!(cache.seen_len(), 3);
    Ok(())
}

#[test]
fn labels_produce_a_finite_loss() -> Result<()> {
    let device = Device::Cpu;
    let model = build_model(true)?;
    let policy = model.default_policy();

    let ids = Tensor::from_slice(
        &[IMAGE_TOKEN, IMAGE_TOKEN, IMAGE_TOKEN, IMAGE_TOKEN, 3, 4, 5, PAD_TOKEN],
        (1, 8),
        &device,
    )?;
    let mask = Tensor::from_slice(&[1i64, 1, 1, 1, 1, 1, 1, 0], (1, 8), &device)?;
    let labels = Tensor::from_slice(
        &[-100i64, -100, -100, -100, 3, 4, 5, -100],
        (1, 8),
        &device,
    )?;
    let output = model.forward(
        ConditionalGenerationInput {
            token_ids: &ids,
            pixel_values: Some(&pixels(1, &device)?),
            attention_mask: &mask,
            cache: None,
            labels: Some(&labels),
        },
        &policy,
    )?;

    let loss = output.loss.expect("labels were supplied").to_vec0::<f32>()?;
    assert!(loss.is_finite() && loss > 0.0);
    Ok(())
}

#[test]
fn image_slots_without_pixels_are_rejected() -> Result<()> {
    let device = Device::Cpu;
    let model = build_model(true)?;
    let ids = Tensor::from_slice(&[IMAGE_TOKEN, 3], (1, 2), &device)?;
    let mask = Tensor::ones((1, 2), DType::I64, &device)?;
    let result = model.forward(
        ConditionalGenerationInput {
            token_ids: &ids,
            pixel_values: None,
            attention_mask: &mask,
            cache: None,
            labels: None,
        },
        &model.default_policy(),
    );
    assert!(matches!(result, Err(ModelError::ShapeContract(_))));
    Ok(())
}

#[test]
fn tied_head_shares_the_embedding_table() -> Result<()> {
    let tied = build_model(true)?;
    let untied = build_model(false)?;
    assert!(tied.language_model().is_tied());
    assert!(!untied.language_model().is_tied());

    let has_head = |model: &PaliGemmaForConditionalGeneration| {
        model
            .named_parameters()
            .iter()
            .any(|(name, _)| name == "language_model.lm_head.weight")
    };
    assert!(!has_head(&tied));
    assert!(has_head(&untied));

    // With a tied head the logits of a single token are `norm(h) . E^T`.
    let device = Device::Cpu;
    let stack = tied.language_model();
    let ids = Tensor::from_slice(&[4i64], (1, 1), &device)?;
    let hidden = Tensor::randn(0f32, 1.0, (1, 1, 8), &device)?;
    let direct = stack.embed_tokens().linear_out(&hidden)?;
    let manual = hidden
        .reshape((1, 8))?
        .matmul(&stack.embed_tokens().weight().t()?)?
        .reshape((1, 1, 16))?;
    let diff = (direct - manual)?.abs()?.max_all()?.to_vec0::<f32>()?;
    assert!(diff < 1e-5);
    assert_eq!(stack.embed(&ids)?.dims(), &[1, 1, 8]);
    Ok(())
}

#[test]
fn config_loads_from_json_and_toml_files() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let json_path = dir.path().join("config.json");
    std::fs::write(&json_path, config_json(true))?;
    let from_json = PaliGemmaConfig::from_path(&json_path)?;

    let toml_path = dir.path().join("config.toml");
    std::fs::write(
        &toml_path,
        r#"
image_token_index = 15
pad_token_id = 0
vocab_size = 16
hidden_size = 8
projection_dim = 8
compute_dtype = "f32"

[text_config]
vocab_size = 16
hidden_size = 8
intermediate_size = 16
num_hidden_layers = 2
num_attention_heads = 2
num_key_value_heads = 1
max_position_embeddings = 128

[vision_config]
hidden_size = 6
image_size = 28
patch_size = 14
projection_dim = 8
"#,
    )?;
    let from_toml = PaliGemmaConfig::from_path(&toml_path)?;
    assert_eq!(from_json.text_config, from_toml.text_config);
    assert_eq!(from_json.vision_config, from_toml.vision_config);
    assert_eq!(from_toml.compute_dtype(), Some(DType::F32));

    let yaml_path = dir.path().join("config.yaml");
    std::fs::write(&yaml_path, "text_config: {}")?;
    assert!(matches!(
        PaliGemmaConfig::from_path(&yaml_path),
        Err(ModelError::ConfigFormat(_))
    ));
    Ok(())
}

#[test]
fn inconsistent_geometry_is_rejected_at_construction() -> Result<()> {
    let mut config = PaliGemmaConfig::from_json_str(&config_json(true))?;
    config.text_config.num_key_value_heads = 3;
    let vision = Arc::new(MeanPatchEncoder { width: 6 });
    let result = PaliGemmaForConditionalGeneration::new(config, vision, &Device::Cpu, DType::F32);
    assert!(matches!(result, Err(ModelError::Configuration(_))));

    let config = PaliGemmaConfig::from_json_str(&config_json(true))?;
    let narrow = Arc::new(MeanPatchEncoder { width: 5 });
    let result = PaliGemmaForConditionalGeneration::new(config, narrow, &Device::Cpu, DType::F32);
    assert!(matches!(result, Err(ModelError::Configuration(_))));
    Ok(())
}

/// hidden 8, two query heads of width 4 sharing one kv head, first layer.
/// Zero lambdas give `lambda_full == lambda_init == 0.2`, so the output must be
/// exactly `0.8` times the normalised, unscaled attention result.
#[test]
fn first_layer_output_is_scaled_by_one_minus_lambda_init() -> Result<()> {
    let device = Device::Cpu;
    let config = DifferentialAttentionConfig::new(8, 2, 1, 4);

    let mut select = vec![0f32; 4 * 8];
    for i in 0..4 {
        select[i * 8 + i] = 1.0;
    }
    let weights = DifferentialAttentionWeights {
        q_proj: ProjectionWeights::new(Tensor::zeros((8, 8), DType::F32, &device)?),
        k_proj: ProjectionWeights::new(Tensor::zeros((4, 8), DType::F32, &device)?),
        v_proj: ProjectionWeights::new(Tensor::from_vec(select, (4, 8), &device)?),
        o_proj: ProjectionWeights::new(Tensor::eye(8, DType::F32, &device)?),
        lambdas: LambdaParameters::zeros(4, &device)?,
        subln: Tensor::ones(4, DType::F32, &device)?,
    };
    let attention = DifferentialAttention::from_weights(0, config, weights)?;
    assert!((attention.lambda_init() - 0.2).abs() < 1e-12);
    assert!((attention.lambda_full()? - 0.2).abs() < 1e-6);

    let values: Vec<f32> = (0..24).map(|i| (i as f32 * 0.37).sin() + 0.5).collect();
    let hidden = Tensor::from_vec(values.clone(), (1, 3, 8), &device)?;
    let positions = Tensor::from_slice(&[1i64, 2, 3], (1, 3), &device)?;
    let mask = build_prefill_mask(1, 3, DType::F32, &device)?;
    let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
    let mut cache = IncrementalCache::new(1);

    let output = attention.forward(&hidden, Some(&mask), &positions, Some(&mut cache), &policy)?;
    assert_eq!(cache.size(0), 3);

    // Zero queries and keys give uniform weights; each head sees the mean value row,
    // shrunk by `1 - lambda_full` before the sub-layer norm.
    let mean: Vec<f32> = (0..4)
        .map(|d| (0..3).map(|t| values[t * 8 + d]).sum::<f32>() / 3.0)
        .collect();
    let shrunk: Vec<f32> = mean.iter().map(|m| m * 0.8).collect();
    let rms = (shrunk.iter().map(|v| v * v).sum::<f32>() / 4.0 + 1e-5).sqrt();
    let unscaled: Vec<f32> = shrunk.iter().map(|v| v / rms).collect();

    for row in output.hidden.squeeze(0)?.to_vec2::<f32>()? {
        for (d, value) in row.iter().enumerate() {
            let expected = 0.8 * unscaled[d % 4];
            assert!((value - expected).abs() < 1e-5, "{value} vs {expected}");
        }
    }

    let row_sums = output.weights.sum(3)?.flatten_all()?.to_vec1::<f32>()?;
    assert!(row_sums.iter().all(|s| (s - 0.8).abs() < 1e-5));
    Ok(())
}

#[test]
fn compute_override_flows_into_the_default_policy() -> Result<()> {
    let mut config = PaliGemmaConfig::from_json_str(&config_json(true))?;
    config.compute_dtype = Some("f16".into());
    let vision = Arc::new(MeanPatchEncoder { width: 6 });
    let model = PaliGemmaForConditionalGeneration::new(config, vision, &Device::Cpu, DType::F32)?;
    let policy = model.default_policy();
    assert_eq!(policy.storage(), DType::F32);
    assert_eq!(policy.compute(), DType::F16);
    assert_eq!(policy.reduction(), DType::F32);
    assert_eq!(model.new_cache().num_layers(), 2);
    Ok(())
}

#[test]
fn bf16_compute_is_rejected_on_cpu() -> Result<()> {
    let mut config = PaliGemmaConfig::from_json_str(&config_json(true))?;
    config.compute_dtype = Some("bf16".into());
    let vision = Arc::new(MeanPatchEncoder { width: 6 });
    let result = PaliGemmaForConditionalGeneration::new(config, vision, &Device::Cpu, DType::F32);
    match result {
        Err(ModelError::Configuration(errors)) => {
            assert!(errors.iter().any(|e| e.contains("bf16")), "{errors:?}");
        }
        other => panic!("expected a configuration error, got {other:?}"),
    }
    Ok(())
}
