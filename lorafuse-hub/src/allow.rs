use regex::Regex;

use lorafuse_core::{LorafuseError, Result};

/// Weight files fetched for a base model.
pub const WEIGHT_PATTERNS: [&str; 3] = ["*.safetensors", "*.bin", "*.pt"];

/// Metadata needed to load the weights.
pub const METADATA_PATTERNS: [&str; 3] = ["config.json", "generation_config.json", "*.index.json"];

/// Glob patterns (`*` and `?`) matched against repository file names.
#[derive(Debug, Clone)]
pub struct AllowList {
    patterns: Vec<(String, Regex)>,
}

impl AllowList {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                let p = p.as_ref();
                Regex::new(&glob_to_regex(p))
                    .map(|re| (p.to_string(), re))
                    .map_err(|e| LorafuseError::Internal(format!("bad pattern '{p}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Weights plus the metadata files that describe them.
    pub fn base_model() -> Result<Self> {
        let all: Vec<&str> = WEIGHT_PATTERNS
            .iter()
            .chain(METADATA_PATTERNS.iter())
            .copied()
            .collect();
        Self::new(&all)
    }

    pub fn matches(&self, file_name: &str) -> bool {
        self.patterns.iter().any(|(_, re)| re.is_match(file_name))
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|(p, _)| p.as_str())
    }
}

/// Whether a file name is one of the weight formats the fetcher downloads.
pub fn is_weight_file(file_name: &str) -> bool {
    WEIGHT_PATTERNS
        .iter()
        .any(|p| file_name.ends_with(p.trim_start_matches('*')))
}

fn glob_to_regex(glob: &str) -> String {
    let mut re = String::with_capacity(glob.len() + 8);
    re.push('^');
    for c in glob.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    re
}
