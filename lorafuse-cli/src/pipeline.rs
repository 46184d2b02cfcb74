//! The linear merge run: fetch, export tokenizer, load base, merge, save.

use std::path::PathBuf;

use lorafuse_adapter::{load_adapter, merge_adapter, ADAPTER_FILES};
use lorafuse_core::{Backend, LorafuseError, Result, Stage, StageMachine};
use lorafuse_hub::{AllowList, Fetcher, ModelSource, Snapshot};
use lorafuse_loader::{load_quantized_model, QuantizedModel};
use tracing::info;

use crate::cli::RunConfig;
use crate::tokenizer::{export_tokenizer, TOKENIZER_FILES};

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub output_dir: PathBuf,
    pub tokenizer_files: Vec<PathBuf>,
    pub shards: Vec<PathBuf>,
    pub tensors_quantized: usize,
    pub modules_merged: usize,
}

pub struct Pipeline<B: Backend + Clone> {
    config: RunConfig,
    backend: B,
    fetcher: Fetcher,
    stages: StageMachine,
}

impl<B: Backend + Clone> Pipeline<B> {
    pub fn new(config: RunConfig, backend: B) -> Result<Self> {
        let fetcher = Fetcher::new(config.cache.clone(), config.hf_token.clone())?;
        Ok(Self {
            config,
            backend,
            fetcher,
            stages: StageMachine::new(),
        })
    }

    /// Swap the fetcher, e.g. to force offline mode.
    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Fetcher) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn stage(&self) -> Stage {
        self.stages.current()
    }

    /// Run every stage in order. The first error stops the run.
    pub fn run(&mut self) -> Result<RunReport> {
        let result = self.run_stages();
        if let Err(err) = &result {
            self.stages.fail(err);
        }
        result
    }

    fn run_stages(&mut self) -> Result<RunReport> {
        let output_dir = self.config.output_dir.clone();
        std::fs::create_dir_all(&output_dir)?;

        self.stages.advance(Stage::Fetching)?;
        let base_source = ModelSource::resolve(&self.config.base_model, &self.config.revision)?;
        let base = self
            .fetcher
            .fetch_snapshot(&base_source, &AllowList::base_model()?)?;
        self.check_python(&base_source, &base)?;

        let tokenizer_files = self.fetcher.fetch_named(&base_source, &TOKENIZER_FILES)?;
        let tokenizer = export_tokenizer(&tokenizer_files, &output_dir, self.config.trust)?;
        self.stages.advance(Stage::TokenizerExported)?;

        let model = load_quantized_model(
            &base.dir,
            &self.config.quant,
            self.config.placement,
            self.config.trust,
            &self.backend,
        )?;
        let tensors_quantized = model.quantized_count();
        self.stages.advance(Stage::BaseLoaded)?;

        let (shards, modules_merged) = self.merge_and_save(model)?;
        self.stages.advance(Stage::Merged)?;

        Ok(RunReport {
            output_dir,
            tokenizer_files: tokenizer.files,
            shards,
            tensors_quantized,
            modules_merged,
        })
    }

    /// Adapter fetch, load and merge all count as the merge stage.
    fn merge_and_save(&self, model: QuantizedModel<B>) -> Result<(Vec<PathBuf>, usize)> {
        let adapter_source =
            ModelSource::resolve(&self.config.lora_adapter, &self.config.adapter_revision)?;
        let snapshot = self.fetcher.fetch_named(&adapter_source, &ADAPTER_FILES)?;
        if snapshot.files.is_empty() {
            return Err(LorafuseError::Fetch(format!(
                "{adapter_source} holds none of {ADAPTER_FILES:?}"
            )));
        }
        let adapter = load_adapter(&snapshot.dir)?;
        let merged = merge_adapter(model, &adapter)?;
        let saved = merged.save(&self.config.output_dir, &self.config.shard)?;
        info!(
            "Saved {} tensors ({} bytes, {}) in {} shard(s)",
            saved.tensor_count,
            saved.total_size,
            saved.dtype,
            saved.shards.len()
        );
        Ok((saved.shards, merged.report().modules_merged))
    }

    fn check_python(&self, source: &ModelSource, snapshot: &Snapshot) -> Result<()> {
        self.config
            .trust
            .check(&source.to_string(), snapshot.ships_python())
    }
}
