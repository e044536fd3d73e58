//! Application-wide error types.
//!
//! Subsystems define their own error enums (`StoreError`, `HookError`, …)
//! and convert into [`AppError`] at the wiring boundary in `main`.

use thiserror::Error;

use crate::hooks::HookError;
use crate::storage::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("hook error: {0}")]
    Hook(#[from] HookError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn config_error_display() {
        let e = AppError::Config("missing field".into());
        assert!(e.to_string().contains("missing field"));
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let e: AppError = io_err.into();
        assert!(e.to_string().contains("io error"));
        let _: &dyn Error = &e;
    }
}
