pub mod types;

pub use types::{AppError, ExplorerError, RepositoryError};

/// Convenience alias for results carrying an [`AppError`].
pub type AppResult<T> = Result<T, AppError>;
