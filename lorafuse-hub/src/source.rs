use std::fmt;
use std::path::{Path, PathBuf};

use lorafuse_core::{LorafuseError, Result};

pub const DEFAULT_REVISION: &str = "main";

/// Where a model or adapter is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// Existing directory, used in place.
    Local(PathBuf),
    Hub { repo_id: String, revision: String },
}

impl ModelSource {
    /// Interpret a CLI identifier.
    ///
    /// An existing directory wins over a Hub id of the same spelling.
    /// Anything else must be a well-formed repo id; no network access
    /// happens here.
    pub fn resolve(identifier: &str, revision: &str) -> Result<Self> {
        let path = Path::new(identifier);
        if path.is_dir() {
            return Ok(ModelSource::Local(path.to_path_buf()));
        }
        validate_repo_id(identifier)?;
        Ok(ModelSource::Hub {
            repo_id: identifier.to_string(),
            revision: revision.to_string(),
        })
    }

    pub fn is_local(&self) -> bool {
        matches!(self, ModelSource::Local(_))
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Local(path) => write!(f, "{}", path.display()),
            ModelSource::Hub { repo_id, revision } if revision == DEFAULT_REVISION => {
                f.write_str(repo_id)
            }
            ModelSource::Hub { repo_id, revision } => write!(f, "{repo_id}@{revision}"),
        }
    }
}

/// Check the shape of a Hub repository id: `name` or `owner/name`.
pub fn validate_repo_id(repo_id: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(LorafuseError::Fetch(format!(
            "'{repo_id}' is neither a local directory nor a valid repo id ({reason})"
        )))
    };
    if repo_id.is_empty() {
        return invalid("empty");
    }
    if repo_id.contains("..") {
        return invalid("contains '..'");
    }
    let parts: Vec<&str> = repo_id.split('/').collect();
    if parts.len() > 2 || parts.iter().any(|p| p.is_empty()) {
        return invalid("expected 'name' or 'owner/name'");
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-');
    if !parts.iter().all(|p| p.chars().all(allowed)) {
        return invalid("allowed characters are A-Z a-z 0-9 . _ -");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_repo_ids() {
        for id in ["gpt2", "meta-llama/Llama-2-7b-hf", "org_x/model.v1"] {
            assert!(validate_repo_id(id).is_ok(), "{id}");
        }
    }

    #[test]
    fn test_invalid_repo_ids() {
        for id in ["", "/model", "org/", "a/b/c", "org/../x", "org/mo del", "org/m@v"] {
            assert!(
                matches!(validate_repo_id(id), Err(LorafuseError::Fetch(_))),
                "{id}"
            );
        }
    }

    #[test]
    fn test_existing_directory_is_local() {
        let dir = tempfile::tempdir().unwrap();
        let id = dir.path().to_str().unwrap();
        let source = ModelSource::resolve(id, "main").unwrap();
        assert_eq!(source, ModelSource::Local(dir.path().to_path_buf()));
        assert!(source.is_local());
    }

    #[test]
    fn test_hub_source_keeps_revision() {
        let source = ModelSource::resolve("org/model", "v2").unwrap();
        assert_eq!(source.to_string(), "org/model@v2");
        assert!(!source.is_local());
    }
}
