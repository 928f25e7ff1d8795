/// Flat-binary assembler adapter.
///
/// Modules are assembled one at a time by an external program invoked as
/// `<program> [args..] -f bin -o <out> <in>`. The adapter waits for it,
/// captures stderr, and reads the produced blob back on success.
use crate::error::{BuildError, Result};
use crate::manifest::ModuleEntry;
use log::debug;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub const DEFAULT_ASSEMBLER: &str = "yasm";

/// Turns one module source into a raw binary blob.
pub trait Assembler {
    fn assemble(&self, source: &Path) -> Result<Vec<u8>>;
}

/// A module entry together with its assembled bytes.
#[derive(Debug, Clone)]
pub struct AssembledModule {
    pub entry: ModuleEntry,
    pub blob: Vec<u8>,
}

/// Runs a yasm/nasm-compatible assembler as a child process.
pub struct ExternalAssembler {
    program: String,
    args: Vec<String>,
    artifact_dir: PathBuf,
}

impl ExternalAssembler {
    pub fn new(program: impl Into<String>, artifact_dir: impl Into<PathBuf>) -> Self {
        ExternalAssembler {
            program: program.into(),
            args: Vec::new(),
            artifact_dir: artifact_dir.into(),
        }
    }

    /// Arguments placed before `-f bin`, e.g. when the program is a wrapper.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Where the blob for `source` is written: `<artifact_dir>/<stem>.bin`.
    pub fn artifact_path(&self, source: &Path) -> PathBuf {
        let stem = source.file_stem().unwrap_or(source.as_os_str());
        let mut name = stem.to_os_string();
        name.push(".bin");
        self.artifact_dir.join(name)
    }
}

impl Assembler for ExternalAssembler {
    fn assemble(&self, source: &Path) -> Result<Vec<u8>> {
        if !source.is_file() {
            return Err(BuildError::SourceFileMissing(source.to_path_buf()));
        }

        let output = self.artifact_path(source);
        // a blob left by an earlier run must never stand in for this one
        match fs::remove_file(&output) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("-f")
            .arg("bin")
            .arg("-o")
            .arg(&output)
            .arg(source)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        debug!("Running {:?}", cmd);

        let result = cmd
            .output()
            .map_err(|err| BuildError::AssemblerUnavailable {
                program: self.program.clone(),
                source: err,
            })?;

        if !result.status.success() {
            return Err(BuildError::Assembly {
                module: source.to_path_buf(),
                diagnostics: String::from_utf8_lossy(&result.stderr).into_owned(),
            });
        }

        let blob = fs::read(&output).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => BuildError::ArtifactMissing {
                module: source.to_path_buf(),
                artifact: output.clone(),
            },
            _ => BuildError::Io(e),
        })?;
        debug!("{:?} -> {:?} ({} bytes)", source, output, blob.len());
        Ok(blob)
    }
}
