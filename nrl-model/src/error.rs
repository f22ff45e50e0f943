use std::path::PathBuf;

#[derive(Debug, PartialEq)]
pub enum ModelError {
    AllocationFailed {
        what: String,
        requested: usize,
    },
    ChecksumMismatch {
        key: String,
        expected: usize,
        actual: usize,
    },
    DimensionMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },
    ExperimentDisabled,
    InvalidConfig {
        key: String,
        reason: String,
    },
    InvalidDataset {
        reason: String,
    },
    InvalidParameterFile {
        path: PathBuf,
        reason: String,
    },
    InvalidSequence {
        index: usize,
        num_sequences: usize,
    },
    InvalidTimeStep {
        time: usize,
        length: usize,
    },
    Io {
        path: PathBuf,
        reason: String,
    },
    MissingParameterFile {
        path: PathBuf,
    },
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelError::AllocationFailed { what, requested } => write!(
                f,
                "Failed to allocate {} bytes for {}",
                requested, what
            ),
            ModelError::ChecksumMismatch {
                key,
                expected,
                actual,
            } => write!(
                f,
                "'{}' lists {} entries but the network has {} layers",
                key, actual, expected
            ),
            ModelError::DimensionMismatch {
                what,
                expected,
                actual,
            } => write!(
                f,
                "Dimension mismatch for {}. Expected: {}, Actual: {}",
                what, expected, actual
            ),
            ModelError::ExperimentDisabled => {
                write!(f, "Experiment mode is not enabled")
            }
            ModelError::InvalidConfig { key, reason } => {
                write!(f, "Invalid configuration '{}': {}", key, reason)
            }
            ModelError::InvalidDataset { reason } => write!(f, "Invalid dataset: {}", reason),
            ModelError::InvalidParameterFile { path, reason } => write!(
                f,
                "Parameter file '{}' is invalid: {}",
                path.display(),
                reason
            ),
            ModelError::InvalidSequence {
                index,
                num_sequences,
            } => write!(
                f,
                "Sequence '{}' does not exist. The model holds {} sequences",
                index, num_sequences
            ),
            ModelError::InvalidTimeStep { time, length } => write!(
                f,
                "Time step '{}' is outside a sequence of {} steps",
                time, length
            ),
            ModelError::Io { path, reason } => {
                write!(f, "I/O error on '{}': {}", path.display(), reason)
            }
            ModelError::MissingParameterFile { path } => {
                write!(f, "Parameter file '{}' is missing", path.display())
            }
        }
    }
}

impl std::error::Error for ModelError {}

pub type ModelResult<T> = std::result::Result<T, ModelError>;
