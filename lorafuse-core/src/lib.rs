//! Lorafuse core types, traits, and error definitions.

pub mod backend;
pub mod error;
pub mod stage;
pub mod tensor;
pub mod types;

pub use backend::Backend;
pub use error::{LorafuseError, Result};
pub use stage::{FailedDuring, Stage, StageMachine};
pub use tensor::Tensor;
pub use types::*;
