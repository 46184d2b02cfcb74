use std::path::{Path, PathBuf};

use hf_hub::api::sync::{Api, ApiBuilder, ApiError, ApiRepo};
use hf_hub::{Repo, RepoType};
use lorafuse_core::{LorafuseError, Result};
use tempfile::TempDir;
use tracing::{debug, info};

use crate::allow::{is_weight_file, AllowList};
use crate::source::ModelSource;

const HF_HUB_OFFLINE: &str = "HF_HUB_OFFLINE";

/// Lifetime of downloaded files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheScope {
    /// Persistent directory reused across runs.
    Shared(PathBuf),
    /// Fresh directory removed when the fetcher is dropped.
    PerRun,
}

/// Files of one source available on local disk.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub dir: PathBuf,
    pub files: Vec<PathBuf>,
    /// Python modules the repository ships. Listed, never downloaded.
    pub python_files: Vec<String>,
}

impl Snapshot {
    pub fn weight_files(&self) -> impl Iterator<Item = &PathBuf> {
        self.files.iter().filter(|f| {
            f.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(is_weight_file)
        })
    }

    pub fn ships_python(&self) -> bool {
        !self.python_files.is_empty()
    }
}

/// `HF_HUB_OFFLINE=1|true` restricts fetching to the local cache.
pub fn offline_from_env() -> bool {
    std::env::var(HF_HUB_OFFLINE)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

pub struct Fetcher {
    cache_dir: PathBuf,
    token: Option<String>,
    offline: bool,
    // Keeps a per-run cache alive until the fetcher goes away.
    _scratch: Option<TempDir>,
}

impl Fetcher {
    pub fn new(scope: CacheScope, token: Option<String>) -> Result<Self> {
        let (cache_dir, scratch) = match scope {
            CacheScope::Shared(dir) => (dir, None),
            CacheScope::PerRun => {
                let tmp = tempfile::Builder::new().prefix("lorafuse-cache-").tempdir()?;
                (tmp.path().to_path_buf(), Some(tmp))
            }
        };
        Ok(Self {
            cache_dir,
            token: token.filter(|t| !t.is_empty()),
            offline: offline_from_env(),
            _scratch: scratch,
        })
    }

    #[must_use]
    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    /// Make every file matched by `allow` available locally.
    ///
    /// Fails when no weight file matched.
    pub fn fetch_snapshot(&self, source: &ModelSource, allow: &AllowList) -> Result<Snapshot> {
        let snapshot = match source {
            ModelSource::Local(dir) => local_snapshot(dir, |name| allow.matches(name))?,
            ModelSource::Hub { repo_id, revision } if self.offline => {
                self.cached_snapshot(repo_id, revision, |name| allow.matches(name))?
            }
            ModelSource::Hub { repo_id, revision } => {
                self.download(repo_id, revision, |name| allow.matches(name))?
            }
        };
        let weights = snapshot.weight_files().count();
        if weights == 0 {
            return Err(LorafuseError::Fetch(format!(
                "{source} has no files matching {:?}",
                allow.patterns().collect::<Vec<_>>()
            )));
        }
        info!(
            "Fetched {source}: {} file(s), {weights} weight file(s) in {}",
            snapshot.files.len(),
            snapshot.dir.display()
        );
        Ok(snapshot)
    }

    /// Fetch whichever of `names` the source has. Missing names are skipped.
    pub fn fetch_named(&self, source: &ModelSource, names: &[&str]) -> Result<Snapshot> {
        let wanted = |name: &str| names.contains(&name);
        let snapshot = match source {
            ModelSource::Local(dir) => local_snapshot(dir, wanted)?,
            ModelSource::Hub { repo_id, revision } if self.offline => {
                self.cached_snapshot(repo_id, revision, wanted)?
            }
            ModelSource::Hub { repo_id, revision } => self.download(repo_id, revision, wanted)?,
        };
        debug!(
            "{source}: {} of {} requested file(s) present",
            snapshot.files.len(),
            names.len()
        );
        Ok(snapshot)
    }

    fn build_api(&self) -> Result<Api> {
        ApiBuilder::new()
            .with_cache_dir(self.cache_dir.clone())
            .with_token(self.token.clone())
            .with_progress(false)
            .build()
            .map_err(|e| LorafuseError::Fetch(format!("Failed to initialize HF API: {e}")))
    }

    fn download(
        &self,
        repo_id: &str,
        revision: &str,
        wanted: impl Fn(&str) -> bool,
    ) -> Result<Snapshot> {
        let api = self.build_api()?;
        let repo = api.repo(Repo::with_revision(
            repo_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));
        let info = repo
            .info()
            .map_err(|e| map_api_error(repo_id, "repository listing", e))?;

        let listed: Vec<String> = info.siblings.into_iter().map(|s| s.rfilename).collect();
        let python_files: Vec<String> = listed
            .iter()
            .filter(|name| name.ends_with(".py"))
            .cloned()
            .collect();

        let mut files = Vec::new();
        let mut dir = None;
        for name in listed.iter().filter(|name| wanted(name.as_str())) {
            let path = download_file(&repo, repo_id, name)?;
            if dir.is_none() {
                dir = snapshot_root(&path, name);
            }
            files.push(path);
        }
        let dir = dir.unwrap_or_else(|| self.cache_dir.clone());
        Ok(Snapshot {
            dir,
            files,
            python_files,
        })
    }

    /// Resolve files from the on-disk cache only.
    fn cached_snapshot(
        &self,
        repo_id: &str,
        revision: &str,
        wanted: impl Fn(&str) -> bool,
    ) -> Result<Snapshot> {
        let dir = cached_snapshot_dir(&self.cache_dir, repo_id, revision).ok_or_else(|| {
            LorafuseError::Fetch(format!(
                "offline mode: {repo_id}@{revision} is not in cache {}",
                self.cache_dir.display()
            ))
        })?;
        info!("Offline mode: using cached snapshot of {repo_id} at {}", dir.display());
        local_snapshot(&dir, wanted)
    }
}

fn download_file(repo: &ApiRepo, repo_id: &str, file: &str) -> Result<PathBuf> {
    debug!("Downloading {repo_id}/{file}");
    repo.get(file).map_err(|e| map_api_error(repo_id, file, e))
}

fn map_api_error(repo_id: &str, what: &str, err: ApiError) -> LorafuseError {
    let message = match err {
        ApiError::RequestError(inner) => match *inner {
            ureq::Error::Status(404, _) => format!("{repo_id}: {what} not found"),
            ureq::Error::Status(401 | 403, _) => {
                format!("{repo_id}: access denied for {what}; a token may be required")
            }
            other => format!("{repo_id}: download of {what} failed: {other}"),
        },
        other => format!("{repo_id}: download of {what} failed: {other}"),
    };
    LorafuseError::Fetch(message)
}

/// Snapshot directory of `repo_id` at `revision` in a hub cache.
///
/// `revision` is looked up in `refs/` first; a commit hash is used as is.
fn cached_snapshot_dir(cache_dir: &Path, repo_id: &str, revision: &str) -> Option<PathBuf> {
    let repo_dir = cache_dir.join(Repo::new(repo_id.to_string(), RepoType::Model).folder_name());
    let commit = std::fs::read_to_string(repo_dir.join("refs").join(revision))
        .map(|hash| hash.trim().to_string())
        .unwrap_or_else(|_| revision.to_string());
    let dir = repo_dir.join("snapshots").join(commit);
    dir.is_dir().then_some(dir)
}

/// Directory that `rfilename` paths are relative to.
fn snapshot_root(path: &Path, rfilename: &str) -> Option<PathBuf> {
    let depth = Path::new(rfilename).components().count();
    path.ancestors().nth(depth).map(Path::to_path_buf)
}

fn local_snapshot(dir: &Path, wanted: impl Fn(&str) -> bool) -> Result<Snapshot> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| LorafuseError::Fetch(format!("cannot read {}: {e}", dir.display())))?;
    let mut files = Vec::new();
    let mut python_files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.ends_with(".py") {
            python_files.push(name.to_string());
        }
        if wanted(name) {
            files.push(path);
        }
    }
    files.sort();
    if !python_files.is_empty() {
        debug!("{} ships Python modules: {:?}", dir.display(), python_files);
    }
    Ok(Snapshot {
        dir: dir.to_path_buf(),
        files,
        python_files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_root_strips_relative_path() {
        let path = Path::new("/c/models--a--b/snapshots/abc/sub/model.safetensors");
        assert_eq!(
            snapshot_root(path, "sub/model.safetensors"),
            Some(PathBuf::from("/c/models--a--b/snapshots/abc"))
        );
        assert_eq!(
            snapshot_root(path, "model.safetensors"),
            Some(PathBuf::from("/c/models--a--b/snapshots/abc/sub"))
        );
    }

    #[test]
    fn test_per_run_cache_is_removed_on_drop() {
        let fetcher = Fetcher::new(CacheScope::PerRun, None).unwrap();
        let dir = fetcher.cache_dir().to_path_buf();
        assert!(dir.is_dir());
        drop(fetcher);
        assert!(!dir.exists());
    }

    fn status_error(code: u16) -> ApiError {
        let response = ureq::Response::new(code, "status", "").unwrap();
        ApiError::RequestError(Box::new(ureq::Error::Status(code, response)))
    }

    #[test]
    fn test_api_status_codes() {
        let not_found = map_api_error("org/m", "config.json", status_error(404)).to_string();
        assert!(not_found.contains("not found"), "{not_found}");
        for code in [401, 403] {
            let denied = map_api_error("org/m", "config.json", status_error(code)).to_string();
            assert!(denied.contains("access denied"), "{denied}");
        }
        let other = map_api_error("org/m", "config.json", status_error(500)).to_string();
        assert!(other.contains("download of config.json failed"), "{other}");
    }

    #[test]
    fn test_cached_snapshot_dir_accepts_commit_hash() {
        let cache = tempfile::tempdir().unwrap();
        let snapshot = cache.path().join("models--org--m/snapshots/0123abcd");
        std::fs::create_dir_all(&snapshot).unwrap();
        assert_eq!(
            cached_snapshot_dir(cache.path(), "org/m", "0123abcd"),
            Some(snapshot)
        );
        assert_eq!(cached_snapshot_dir(cache.path(), "org/m", "main"), None);
    }

    #[test]
    fn test_empty_token_is_anonymous() {
        let fetcher = Fetcher::new(CacheScope::Shared("/tmp/x".into()), Some(String::new())).unwrap();
        assert!(fetcher.token.is_none());
    }
}
