use std::path::{Path, PathBuf};

use lorafuse_core::{LorafuseError, Result, TrustPolicy};
use lorafuse_hub::Snapshot;
use tokenizers::Tokenizer as HfTokenizer;
use tracing::{debug, info};

pub const TOKENIZER_JSON: &str = "tokenizer.json";
pub const TOKENIZER_CONFIG: &str = "tokenizer_config.json";

/// Files that together make up a saved tokenizer.
pub const TOKENIZER_FILES: [&str; 9] = [
    TOKENIZER_JSON,
    TOKENIZER_CONFIG,
    "special_tokens_map.json",
    "added_tokens.json",
    "tokenizer.model",
    "vocab.json",
    "merges.txt",
    "vocab.txt",
    "chat_template.jinja",
];

/// A fast tokenizer plus the end-of-sequence id it resolves to.
pub struct MergeTokenizer {
    inner: HfTokenizer,
    eos_token_id: u32,
}

impl MergeTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner =
            HfTokenizer::from_file(path).map_err(|e| LorafuseError::Tokenizer(e.to_string()))?;
        let config = path.parent().and_then(|dir| read_tokenizer_config(dir).ok().flatten());
        let eos_token_id = resolve_eos(&inner, config.as_ref());
        Ok(Self {
            inner,
            eos_token_id,
        })
    }

    pub fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.inner
            .save(path, true)
            .map_err(|e| LorafuseError::Tokenizer(format!("{}: {e}", path.display())))
    }
}

/// Tokenizer files written next to the merged weights.
#[derive(Debug, Clone)]
pub struct TokenizerExport {
    pub files: Vec<PathBuf>,
    pub eos_token_id: Option<u32>,
}

/// Copy the tokenizer found in `snapshot` into `output_dir`.
///
/// `tokenizer.json` is parsed and re-serialized; the other files are copied
/// byte for byte.
pub fn export_tokenizer(
    snapshot: &Snapshot,
    output_dir: &Path,
    trust: TrustPolicy,
) -> Result<TokenizerExport> {
    if snapshot.files.is_empty() {
        return Err(LorafuseError::Tokenizer(format!(
            "no tokenizer files in {}",
            snapshot.dir.display()
        )));
    }

    let config = read_tokenizer_config(&snapshot.dir)?;
    let declares_code = config
        .as_ref()
        .is_some_and(|c| c.get("auto_map").is_some())
        || snapshot.ships_python();
    trust.check(TOKENIZER_CONFIG, declares_code)?;
    remove_stale_tokenizer(output_dir)?;

    let mut files = Vec::with_capacity(snapshot.files.len());
    let mut eos_token_id = None;
    for src in &snapshot.files {
        let Some(name) = src.file_name() else {
            continue;
        };
        let dest = output_dir.join(name);
        if name == TOKENIZER_JSON {
            let tokenizer = MergeTokenizer::from_file(src)?;
            tokenizer.save(&dest)?;
            info!(
                "Tokenizer exported (vocab {}, eos_token_id={})",
                tokenizer.vocab_size(),
                tokenizer.eos_token_id()
            );
            eos_token_id = Some(tokenizer.eos_token_id());
        } else {
            std::fs::copy(src, &dest).map_err(|e| {
                LorafuseError::Tokenizer(format!("copying {}: {e}", src.display()))
            })?;
            debug!("Copied {}", dest.display());
        }
        files.push(dest);
    }

    Ok(TokenizerExport {
        files,
        eos_token_id,
    })
}

/// Drop tokenizer files an earlier run left in `output_dir`.
fn remove_stale_tokenizer(output_dir: &Path) -> Result<()> {
    for name in TOKENIZER_FILES {
        let path = output_dir.join(name);
        if path.is_file() {
            std::fs::remove_file(&path)?;
            debug!("Removed stale {}", path.display());
        }
    }
    Ok(())
}

fn read_tokenizer_config(dir: &Path) -> Result<Option<serde_json::Value>> {
    let path = dir.join(TOKENIZER_CONFIG);
    if !path.is_file() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)?;
    let value = serde_json::from_str(&text)
        .map_err(|e| LorafuseError::Tokenizer(format!("{}: {e}", path.display())))?;
    Ok(Some(value))
}

/// `eos_token_id`, then `eos_token` (string or `{"content": ...}`), then
/// common literals, then id 2.
fn resolve_eos(inner: &HfTokenizer, config: Option<&serde_json::Value>) -> u32 {
    let config_eos = config.and_then(|value| {
        if let Some(id) = value.get("eos_token_id").and_then(|v| v.as_u64()) {
            return Some(id as u32);
        }
        let eos_str = value.get("eos_token").and_then(|v| {
            v.as_str()
                .map(String::from)
                .or_else(|| v.get("content").and_then(|c| c.as_str()).map(String::from))
        })?;
        inner.token_to_id(&eos_str)
    });

    config_eos
        .or_else(|| inner.token_to_id("</s>"))
        .or_else(|| inner.token_to_id("<|endoftext|>"))
        .or_else(|| inner.token_to_id("<|im_end|>"))
        .or_else(|| inner.token_to_id("<|eot_id|>"))
        .unwrap_or(2)
}
