use std::path::PathBuf;
use thiserror::Error;

use crate::pipeline::ClipState;

/// The main error type for autotrack operations.
#[derive(Debug, Error)]
pub enum AutotrackError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed sparse model at {path}: {message}")]
    MalformedModel { path: PathBuf, message: String },

    #[error("Schema mismatch: {message}")]
    SchemaMismatch { message: String },

    #[error("Camera {camera_id} uses unsupported model {model}")]
    UnsupportedCameraModel { camera_id: u32, model: String },

    #[error("Required tool '{program}' is not reachable ({hint})")]
    MissingCollaborator { program: String, hint: String },

    #[error("'{program}' exited abnormally ({status})")]
    CollaboratorExit {
        program: String,
        status: String,
        diagnostic: String,
    },

    #[error("'{program}' did not finish within {timeout:?} and was terminated")]
    CollaboratorTimeout {
        program: String,
        timeout: std::time::Duration,
        diagnostic: String,
    },

    #[error("'{program}' was cancelled by the user")]
    Cancelled { program: String },

    #[error("Stage {stage} cannot start: missing artifact {path}")]
    MissingArtifact { stage: ClipState, path: PathBuf },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to parse transforms JSON from {path}: {source}")]
    TransformsParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write JSON to {path}: {source}")]
    JsonWrite {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to read image {path}: {source}")]
    ImageRead {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Failed to write image {path}: {source}")]
    ImageWrite {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Failed to read image dimensions from {path}: {source}")]
    ImageDimensionRead {
        path: PathBuf,
        #[source]
        source: imagesize::ImageError,
    },

    #[error("Image remap failed: {0}")]
    Remap(#[from] kornia_image::ImageError),

    #[error("{failed} of {total} clip(s) failed")]
    BatchFailed { failed: usize, total: usize },
}

/// How far an error reaches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorScope {
    /// Only the clip being processed is affected; the batch continues.
    Clip,
    /// Nothing can proceed; the run aborts before (or instead of) the next clip.
    Run,
}

impl AutotrackError {
    /// Classify the error for batch-level propagation.
    pub fn scope(&self) -> ErrorScope {
        match self {
            AutotrackError::MissingCollaborator { .. }
            | AutotrackError::InvalidConfig(_)
            | AutotrackError::Cancelled { .. } => ErrorScope::Run,
            _ => ErrorScope::Clip,
        }
    }

    /// Captured collaborator output, if the error carries any.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            AutotrackError::CollaboratorExit { diagnostic, .. }
            | AutotrackError::CollaboratorTimeout { diagnostic, .. } => Some(diagnostic.as_str()),
            _ => None,
        }
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        AutotrackError::MalformedModel {
            path: path.into(),
            message: message.into(),
        }
    }

    pub(crate) fn schema(message: impl Into<String>) -> Self {
        AutotrackError::SchemaMismatch {
            message: message.into(),
        }
    }
}
