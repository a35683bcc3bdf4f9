// src/error.rs

//! Error types shared by every pipeline stage

use std::path::PathBuf;
use thiserror::Error;

use crate::variant::VariantId;

/// Errors produced while selecting, building, fixing up or packaging
#[derive(Debug, Error)]
pub enum Error {
    /// Bad whitelist, missing paths, inconsistent project configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Compiler or linker failure for one variant
    #[error("Build failed for variant {variant}: {message}")]
    Build { variant: VariantId, message: String },

    /// Produced binary is missing or not patchable
    #[error("Fixup failed for {}: {reason}", path.display())]
    Fixup { path: PathBuf, reason: String },

    /// Layer count bound cannot be satisfied
    #[error("Layering failed for image {image}: {reason}")]
    Layering { image: String, reason: String },

    /// External command could not be run or reported failure
    #[error("Command failed: {0}")]
    Command(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid project file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Shorthand for a build error attributed to a variant
    pub fn build(variant: VariantId, msg: impl Into<String>) -> Self {
        Self::Build {
            variant,
            message: msg.into(),
        }
    }

    /// Shorthand for a fixup error on a binary
    pub fn fixup(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Fixup {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_origin() {
        let err = Error::build(VariantId::Debug, "linker exited with 1");
        assert_eq!(
            err.to_string(),
            "Build failed for variant debug: linker exited with 1"
        );

        let err = Error::fixup("/out/release/bin/mayastor", "binary not found");
        assert!(err.to_string().contains("/out/release/bin/mayastor"));
    }
}
