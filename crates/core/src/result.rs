//! Result alias and logging combinators.

use crate::error::Error;

/// The standard Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait providing logging combinators for Results.
pub trait ResultExt<T> {
    /// Inspect the error without consuming the Result.
    fn inspect_error<F: FnOnce(&Error)>(self, f: F) -> Self;

    /// Log the error at `warn` level with the given context and pass it on.
    fn warn_on_error(self, context: &str) -> Self;
}

impl<T> ResultExt<T> for Result<T> {
    fn inspect_error<F: FnOnce(&Error)>(self, f: F) -> Self {
        if let Err(ref e) = self {
            f(e);
        }
        self
    }

    fn warn_on_error(self, context: &str) -> Self {
        self.inspect_error(|e| tracing::warn!(context, error = %e, "Operation failed"))
    }
}
