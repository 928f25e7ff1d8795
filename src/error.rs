//! Error taxonomy for a build.
//!
//! Every variant is fatal: the build stops at the first error and the
//! partially written image is discarded by the pipeline.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Fixed-capacity areas of the image that a build can overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// Concatenated module code, bytes 0..2560.
    CodeRegion,
    /// The single 512-byte directory sector.
    DirectoryTable,
    /// The whole 1,474,560-byte floppy.
    Image,
    /// A 32-bit size or sector field in a directory record.
    RecordField,
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CodeRegion => write!(f, "code region"),
            Self::DirectoryTable => write!(f, "directory table"),
            Self::Image => write!(f, "image"),
            Self::RecordField => write!(f, "directory record field"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no manifest at {0:?}")]
    ManifestMissing(PathBuf),

    #[error("manifest line {line}: {reason}")]
    ManifestParse { line: usize, reason: String },

    #[error("assembler failed on {module:?}:\n{diagnostics}")]
    Assembly { module: PathBuf, diagnostics: String },

    #[error("assembler reported success for {module:?} but wrote no {artifact:?}")]
    ArtifactMissing { module: PathBuf, artifact: PathBuf },

    #[error("could not run assembler `{program}`: {source}")]
    AssemblerUnavailable {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("source file {0:?} does not exist")]
    SourceFileMissing(PathBuf),

    #[error("{region} overflow: needs {required} bytes, only {available} available")]
    CapacityExceeded {
        region: Region,
        required: u64,
        available: u64,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, BuildError>;
