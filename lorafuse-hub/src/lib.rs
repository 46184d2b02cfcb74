//! Lorafuse hub: where model files come from.
//!
//! A source is either a local directory used in place or a HuggingFace Hub
//! repository downloaded through `hf-hub` into a shared or per-run cache.

pub mod allow;
pub mod fetcher;
pub mod source;

pub use allow::AllowList;
pub use fetcher::{offline_from_env, CacheScope, Fetcher, Snapshot};
pub use source::{validate_repo_id, ModelSource};
