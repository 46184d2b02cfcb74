//! merge-lora: base model + LoRA adapter -> merged checkpoint.

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lorafuse_backend_cpu::CpuBackend;
use lorafuse_cli::cli::Cli;
use lorafuse_cli::pipeline::Pipeline;
use lorafuse_core::Backend;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.into_run_config()?;

    let backend = CpuBackend::with_devices(config.devices.unwrap_or(1));
    info!(
        "Merging {} into {} ({} device(s), placement {:?})",
        config.lora_adapter,
        config.base_model,
        backend.device_count(),
        config.placement,
    );

    let mut pipeline = Pipeline::new(config, backend)?;
    let report = pipeline.run()?;
    info!(
        "{} tensors quantized, {} modules merged, {} shard(s), {} tokenizer file(s)",
        report.tensors_quantized,
        report.modules_merged,
        report.shards.len(),
        report.tokenizer_files.len(),
    );
    println!("Merged model saved to {}", report.output_dir.display());

    Ok(())
}
