use std::collections::HashMap;
use std::path::Path;

use lorafuse_adapter::{load_adapter, merge_adapter};
use lorafuse_backend_cpu::CpuBackend;
use lorafuse_core::{DType, DevicePlacement, LorafuseError, QuantConfig, TrustPolicy};
use lorafuse_loader::{load_quantized_model, QuantizedModel, SafeTensorsLoader, ShardOptions};
use safetensors::tensor::TensorView;
use safetensors::Dtype;

const Q_PROJ: &str = "model.layers.0.self_attn.q_proj";
const Q_PROJ_WEIGHT: &str = "model.layers.0.self_attn.q_proj.weight";

fn write_f32_safetensors(path: &Path, tensors: &[(&str, Vec<usize>, Vec<f32>)]) {
    let bytes: Vec<Vec<u8>> = tensors
        .iter()
        .map(|(_, _, data)| bytemuck::cast_slice::<f32, u8>(data).to_vec())
        .collect();
    let views: Vec<(&str, TensorView<'_>)> = tensors
        .iter()
        .zip(&bytes)
        .map(|((name, shape, _), raw)| {
            (*name, TensorView::new(Dtype::F32, shape.clone(), raw).unwrap())
        })
        .collect();
    let mut metadata = HashMap::new();
    metadata.insert("format".to_string(), "pt".to_string());
    std::fs::write(path, safetensors::serialize(views, Some(metadata)).unwrap()).unwrap();
}

fn identity(n: usize) -> Vec<f32> {
    (0..n * n)
        .map(|i| if i / n == i % n { 1.0 } else { 0.0 })
        .collect()
}

/// Base whose quantized weights sit exactly on NF4 levels, so merges are exact.
fn base_model(dir: &Path) -> QuantizedModel<CpuBackend> {
    std::fs::write(
        dir.join("config.json"),
        r#"{"model_type":"llama","num_hidden_layers":1,"torch_dtype":"float32"}"#,
    )
    .unwrap();
    write_f32_safetensors(
        &dir.join("model.safetensors"),
        &[
            ("model.embed_tokens.weight", vec![6, 4], vec![0.0; 24]),
            (Q_PROJ_WEIGHT, vec![4, 4], identity(4)),
            ("model.norm.weight", vec![4], vec![1.0; 4]),
            ("lm_head.weight", vec![6, 4], vec![0.5; 24]),
        ],
    );
    load_quantized_model(
        dir,
        &QuantConfig {
            compute_dtype: Some(DType::F32),
            ..QuantConfig::default()
        },
        DevicePlacement::Auto,
        TrustPolicy::default(),
        &CpuBackend::new(),
    )
    .unwrap()
}

fn write_adapter(dir: &Path, config: &str, tensors: &[(&str, Vec<usize>, Vec<f32>)]) {
    std::fs::write(dir.join("adapter_config.json"), config).unwrap();
    write_f32_safetensors(&dir.join("adapter_model.safetensors"), tensors);
}

const LORA_CONFIG: &str =
    r#"{"peft_type":"LORA","r":2,"lora_alpha":4,"target_modules":["q_proj"]}"#;

fn lora_key(module: &str, half: &str) -> String {
    format!("base_model.model.{module}.{half}.weight")
}

fn dense(model: &QuantizedModel<CpuBackend>, name: &str) -> Vec<f32> {
    model.materialize(name).unwrap().data().to_vec()
}

#[test]
fn test_merge_adds_scaled_delta() {
    let base_dir = tempfile::tempdir().unwrap();
    let adapter_dir = tempfile::tempdir().unwrap();
    let model = base_model(base_dir.path());
    write_adapter(
        adapter_dir.path(),
        LORA_CONFIG,
        &[
            (
                &*lora_key(Q_PROJ, "lora_A"),
                vec![2, 4],
                vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0],
            ),
            (
                &*lora_key(Q_PROJ, "lora_B"),
                vec![4, 2],
                vec![1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0],
            ),
        ],
    );

    let adapter = load_adapter(adapter_dir.path()).unwrap();
    let merged = merge_adapter(model, &adapter).unwrap();
    assert_eq!(merged.report().modules_merged, 1);
    assert!(merged.report().untargeted.is_empty());

    // I + (4 / 2) * diag(1, 1, 0, 0)
    let mut expected = identity(4);
    expected[0] = 3.0;
    expected[5] = 3.0;
    assert_eq!(dense(merged.model(), Q_PROJ_WEIGHT), expected);
    assert!(!merged.model().tensor(Q_PROJ_WEIGHT).unwrap().is_quantized());
}

#[test]
fn test_fan_in_fan_out_transposes_delta() {
    let base_dir = tempfile::tempdir().unwrap();
    let adapter_dir = tempfile::tempdir().unwrap();
    let model = base_model(base_dir.path());
    write_adapter(
        adapter_dir.path(),
        r#"{"r":1,"lora_alpha":1,"fan_in_fan_out":true}"#,
        &[
            (&*lora_key(Q_PROJ, "lora_A"), vec![1, 4], vec![0.0, 1.0, 0.0, 0.0]),
            (&*lora_key(Q_PROJ, "lora_B"), vec![4, 1], vec![1.0, 0.0, 0.0, 0.0]),
        ],
    );
    let merged = merge_adapter(model, &load_adapter(adapter_dir.path()).unwrap()).unwrap();
    let values = dense(merged.model(), Q_PROJ_WEIGHT);
    // B @ A puts 1 at (0, 1); stored transposed it lands at (1, 0)
    assert_eq!(values[4], 1.0);
    assert_eq!(values[1], 0.0);
}

#[test]
fn test_embedding_adapter() {
    let base_dir = tempfile::tempdir().unwrap();
    let adapter_dir = tempfile::tempdir().unwrap();
    let model = base_model(base_dir.path());
    // A: [r, vocab], B: [dim, r]
    let mut a = vec![0.0; 6];
    a[5] = 1.0;
    let b = vec![1.0, 2.0, 3.0, 4.0];
    write_adapter(
        adapter_dir.path(),
        r#"{"r":1,"lora_alpha":1,"target_modules":["embed_tokens"]}"#,
        &[
            ("base_model.model.model.embed_tokens.lora_embedding_A", vec![1, 6], a),
            ("base_model.model.model.embed_tokens.lora_embedding_B", vec![4, 1], b),
        ],
    );
    let merged = merge_adapter(model, &load_adapter(adapter_dir.path()).unwrap()).unwrap();
    let values = dense(merged.model(), "model.embed_tokens.weight");
    // row of token 5 becomes B^T
    assert_eq!(&values[20..24], &[1.0, 2.0, 3.0, 4.0]);
    assert!(values[..20].iter().all(|&v| v == 0.0));
}

#[test]
fn test_shape_mismatch_is_merge_error() {
    let base_dir = tempfile::tempdir().unwrap();
    let adapter_dir = tempfile::tempdir().unwrap();
    let model = base_model(base_dir.path());
    write_adapter(
        adapter_dir.path(),
        LORA_CONFIG,
        &[
            (&*lora_key(Q_PROJ, "lora_A"), vec![2, 5], vec![0.1; 10]),
            (&*lora_key(Q_PROJ, "lora_B"), vec![4, 2], vec![0.1; 8]),
        ],
    );
    let adapter = load_adapter(adapter_dir.path()).unwrap();
    let err = merge_adapter(model, &adapter).err().unwrap();
    assert!(matches!(err, LorafuseError::Merge(_)), "{err}");
    assert!(err.to_string().contains(Q_PROJ));
}

#[test]
fn test_unknown_module_is_merge_error() {
    let base_dir = tempfile::tempdir().unwrap();
    let adapter_dir = tempfile::tempdir().unwrap();
    let model = base_model(base_dir.path());
    let k_proj = "model.layers.0.self_attn.k_proj";
    write_adapter(
        adapter_dir.path(),
        LORA_CONFIG,
        &[
            (&*lora_key(k_proj, "lora_A"), vec![2, 4], vec![0.1; 8]),
            (&*lora_key(k_proj, "lora_B"), vec![4, 2], vec![0.1; 8]),
        ],
    );
    let adapter = load_adapter(adapter_dir.path()).unwrap();
    assert!(matches!(
        merge_adapter(model, &adapter),
        Err(LorafuseError::Merge(_))
    ));
}

#[test]
fn test_modules_to_save_replace_base() {
    let base_dir = tempfile::tempdir().unwrap();
    let adapter_dir = tempfile::tempdir().unwrap();
    let model = base_model(base_dir.path());
    write_adapter(
        adapter_dir.path(),
        LORA_CONFIG,
        &[
            (
                "base_model.model.lm_head.modules_to_save.default.weight",
                vec![6, 4],
                vec![2.0; 24],
            ),
            (
                "base_model.model.lm_head.original_module.weight",
                vec![6, 4],
                vec![0.5; 24],
            ),
        ],
    );
    let adapter = load_adapter(adapter_dir.path()).unwrap();
    assert_eq!(adapter.replaced_tensors().collect::<Vec<_>>(), vec!["lm_head.weight"]);
    let merged = merge_adapter(model, &adapter).unwrap();
    assert_eq!(merged.report().tensors_replaced, 1);
    assert_eq!(dense(merged.model(), "lm_head.weight"), vec![2.0; 24]);
}

#[test]
fn test_pickle_adapter_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("adapter_config.json"), LORA_CONFIG).unwrap();
    std::fs::write(dir.path().join("adapter_model.bin"), b"pickle").unwrap();
    assert!(matches!(
        load_adapter(dir.path()),
        Err(LorafuseError::Load(_))
    ));
}

#[test]
fn test_missing_adapter_config() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        load_adapter(dir.path()),
        Err(LorafuseError::Load(_))
    ));
}

#[test]
fn test_saved_checkpoint_holds_merged_weights() {
    let base_dir = tempfile::tempdir().unwrap();
    let adapter_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let model = base_model(base_dir.path());
    write_adapter(
        adapter_dir.path(),
        LORA_CONFIG,
        &[
            (&*lora_key(Q_PROJ, "lora_A"), vec![2, 4], vec![0.0; 8]),
            (&*lora_key(Q_PROJ, "lora_B"), vec![4, 2], vec![0.0; 8]),
        ],
    );
    let merged = merge_adapter(model, &load_adapter(adapter_dir.path()).unwrap()).unwrap();
    let saved = merged.save(out.path(), &ShardOptions::default()).unwrap();
    assert_eq!(saved.tensor_count, 4);

    let reloaded = SafeTensorsLoader::new(out.path()).unwrap();
    let q = reloaded.load_host(Q_PROJ_WEIGHT).unwrap();
    assert_eq!(q.data, identity(4));
    assert_eq!(q.shape, vec![4, 4]);
}
