use thiserror::Error;

use crate::config::ConfigError;
use crate::eval::evaluator::EvalError;
use crate::memory::MemoryError;
use crate::pipeline::IndexError;
use crate::provider::ProviderError;
use crate::runtime::RuntimeError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("Eval error: {0}")]
    Eval(#[from] EvalError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("Index error: {0}")]
    Index(#[from] IndexError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

pub type InternalResult<T> = Result<T, Error>;
