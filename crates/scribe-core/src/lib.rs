//! Scribe Core - shared services for model benchmarking
//!
//! This crate provides the pieces the benchmark orchestration is built on:
//! structured errors, data-directory resolution, progress tracking, the
//! model-loading seam with its cache, and process memory sampling.

pub mod config;
pub mod memory;
pub mod model;
pub mod progress;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// Missing or inconsistent configuration
    #[error("Configuration error [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    Configuration {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
        config_path: Option<std::path::PathBuf>,
    },

    /// A referenced template, batch, result or model does not exist
    #[error("Not found [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    NotFound {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
        kind: &'static str,
        id: String,
    },

    /// Input validation and parameter errors
    #[error("Invalid input [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    InvalidInput {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
        parameter_name: Option<String>,
        value: Option<String>,
        valid_range: Option<String>,
    },

    /// Model resolution or loading errors
    #[error("Model error [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    Model {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
        model_id: Option<String>,
    },

    /// Text generation errors raised by a backend
    #[error("Generation error [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    Generation {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
        model_id: Option<String>,
    },

    /// File system errors while persisting or reading state
    #[error("IO error [{code}]: {message}\nPath: {path:?}\nSuggestion: {suggestion}")]
    Persistence {
        code: &'static str,
        message: String,
        path: Option<std::path::PathBuf>,
        suggestion: String,
        #[source]
        source: std::io::Error,
    },

    /// JSON encoding or decoding errors
    #[error("Serialization error [{code}]: {message}")]
    Serialization {
        code: &'static str,
        message: String,
        #[source]
        source: serde_json::Error,
    },

    /// Work stopped because cancellation was requested
    #[error("Cancelled [{code}]: {message}")]
    Cancelled { code: &'static str, message: String },

    /// Other unexpected errors
    #[error("Internal error [{code}]: {message}\nContext: {context}")]
    Internal {
        code: &'static str,
        message: String,
        context: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Create a configuration error
    pub fn configuration<S1, S2, S3>(
        code: &'static str,
        message: S1,
        context: S2,
        suggestion: S3,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self::Configuration {
            code,
            message: message.into(),
            context: context.into(),
            suggestion: suggestion.into(),
            config_path: None,
        }
    }

    /// Create a not-found error for an entity of the given kind
    pub fn not_found<S>(code: &'static str, kind: &'static str, id: S) -> Self
    where
        S: Into<String>,
    {
        let id = id.into();
        Self::NotFound {
            code,
            message: format!("Unknown {} '{}'", kind, id),
            context: format!("Lookup of {} by id", kind),
            suggestion: format!("List the registered {}s and check the id", kind),
            kind,
            id,
        }
    }

    /// Create an invalid input error
    pub fn invalid_input<S1, S2, S3>(
        code: &'static str,
        message: S1,
        context: S2,
        suggestion: S3,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self::InvalidInput {
            code,
            message: message.into(),
            context: context.into(),
            suggestion: suggestion.into(),
            parameter_name: None,
            value: None,
            valid_range: None,
        }
    }

    /// Create an invalid input error with parameter validation details
    pub fn invalid_parameter<S1, S2, S3, S4>(
        code: &'static str,
        message: S1,
        param_name: S2,
        value: S3,
        valid_range: S4,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
        S4: Into<String>,
    {
        let param_name = param_name.into();
        let valid_range = valid_range.into();
        Self::InvalidInput {
            code,
            message: message.into(),
            context: format!("Validation of parameter '{}'", param_name),
            suggestion: format!("Use a value in {}", valid_range),
            parameter_name: Some(param_name),
            value: Some(value.into()),
            valid_range: Some(valid_range),
        }
    }

    /// Create a model error for the given model id
    pub fn model<S1, S2, S3>(code: &'static str, model_id: S1, message: S2, suggestion: S3) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        let model_id = model_id.into();
        Self::Model {
            code,
            message: message.into(),
            context: format!("Loading model '{}'", model_id),
            suggestion: suggestion.into(),
            model_id: Some(model_id),
        }
    }

    /// Create a generation error for the given model id
    pub fn generation<S1, S2, S3>(
        code: &'static str,
        model_id: S1,
        message: S2,
        suggestion: S3,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        let model_id = model_id.into();
        Self::Generation {
            code,
            message: message.into(),
            context: format!("Generating text with model '{}'", model_id),
            suggestion: suggestion.into(),
            model_id: Some(model_id),
        }
    }

    /// Wrap an I/O error with the path it happened on
    pub fn persistence<P>(err: std::io::Error, path: P) -> Self
    where
        P: Into<std::path::PathBuf>,
    {
        match Self::from(err) {
            Self::Persistence {
                code,
                message,
                suggestion,
                source,
                ..
            } => Self::Persistence {
                code,
                message,
                path: Some(path.into()),
                suggestion,
                source,
            },
            other => other,
        }
    }

    /// Create a cancellation error
    pub fn cancelled<S: Into<String>>(message: S) -> Self {
        Self::Cancelled {
            code: "OPERATION_CANCELLED",
            message: message.into(),
        }
    }

    /// Get the error code for programmatic handling
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration { code, .. } => code,
            Self::NotFound { code, .. } => code,
            Self::InvalidInput { code, .. } => code,
            Self::Model { code, .. } => code,
            Self::Generation { code, .. } => code,
            Self::Persistence { code, .. } => code,
            Self::Serialization { code, .. } => code,
            Self::Cancelled { code, .. } => code,
            Self::Internal { code, .. } => code,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        let (code, suggestion) = match err.kind() {
            std::io::ErrorKind::NotFound => (
                "IO_FILE_NOT_FOUND",
                "Check that the file path is correct and the file exists",
            ),
            std::io::ErrorKind::PermissionDenied => (
                "IO_PERMISSION_DENIED",
                "Check permissions on the data directory",
            ),
            std::io::ErrorKind::InvalidData => (
                "IO_INVALID_DATA",
                "The file may be corrupted or in an unexpected format",
            ),
            _ => (
                "IO_UNKNOWN",
                "Check the file system and try the operation again",
            ),
        };

        Self::Persistence {
            code,
            message: err.to_string(),
            path: None,
            suggestion: suggestion.to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            code: "JSON_INVALID",
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal {
            code: "INTERNAL_UNKNOWN",
            message: err.to_string(),
            context: "An unexpected error occurred".to_string(),
            source: Some(err),
        }
    }
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::{
        config::{data_dir, models_dir, registry_path, DATA_DIR_ENV},
        memory::{MemoryProbe, ProcessMemoryProbe},
        model::{
            CommandLoader, CommandSpec, Generation, GenerationParams, ModelCache,
            ModelCacheStats, ModelLoader, TextGenerator,
        },
        progress::{
            OperationStatus, OperationType, ProgressCallback, ProgressInfo, ProgressTracker,
        },
        CoreError, Result,
    };
}

pub mod error {
    pub use super::{CoreError, Result};
}
