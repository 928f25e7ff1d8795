/// Build manifest parser.
///
/// The manifest is line oriented:
///
/// ```text
/// # comment
/// boot/stage1.asm
/// boot/stage2.asm --no-append
/// .fs
/// docs/readme.txt>readme.txt
/// ```
///
/// Lines before `.fs` declare modules to assemble, lines after it declare
/// files to embed in the filesystem. Parsing is strict: blank or malformed
/// lines are errors, never skipped.
use crate::error::{BuildError, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const COMMENT_PREFIX: &str = "#";
const FS_SECTION: &str = ".fs";
const NO_APPEND_FLAG: &str = "--no-append";
const FILE_DELIMITER: char = '>';

/// A source module to assemble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleEntry {
    pub source: PathBuf,
    /// When false the module is assembled but its blob stays out of the image.
    pub append: bool,
}

/// A host file to embed in the filesystem under `dest_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub source: PathBuf,
    pub dest_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub modules: Vec<ModuleEntry>,
    pub files: Vec<FileEntry>,
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    Modules,
    Files,
}

impl Manifest {
    /// Read and parse the manifest at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => BuildError::ManifestMissing(path.to_path_buf()),
            _ => BuildError::Io(e),
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut manifest = Manifest::default();
        let mut section = Section::Modules;

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim_end_matches('\r');

            if line.starts_with(COMMENT_PREFIX) {
                continue;
            }
            if line.trim().is_empty() {
                return Err(parse_error(line_no, "blank line"));
            }

            if line == FS_SECTION {
                if section == Section::Files {
                    return Err(parse_error(line_no, "duplicate `.fs` section switch"));
                }
                section = Section::Files;
                continue;
            }

            match section {
                Section::Modules => manifest.modules.push(parse_module(line_no, line)?),
                Section::Files => manifest.files.push(parse_file(line_no, line)?),
            }
        }

        Ok(manifest)
    }
}

fn parse_module(line_no: usize, line: &str) -> Result<ModuleEntry> {
    let mut tokens = line.split_whitespace();
    let source = tokens
        .next()
        .ok_or_else(|| parse_error(line_no, "missing module path"))?;

    let mut append = true;
    for flag in tokens {
        if flag == NO_APPEND_FLAG && append {
            append = false;
        } else {
            return Err(parse_error(
                line_no,
                format!("unexpected token {flag:?} after module path"),
            ));
        }
    }

    Ok(ModuleEntry {
        source: PathBuf::from(source),
        append,
    })
}

fn parse_file(line_no: usize, line: &str) -> Result<FileEntry> {
    let fields: Vec<&str> = line.split(FILE_DELIMITER).collect();
    let [source, dest] = fields[..] else {
        return Err(parse_error(
            line_no,
            format!(
                "expected `<source>{FILE_DELIMITER}<name>`, found {} field(s)",
                fields.len()
            ),
        ));
    };

    if source.is_empty() || dest.is_empty() {
        return Err(parse_error(line_no, "empty source path or file name"));
    }
    if !dest.is_ascii() {
        return Err(parse_error(
            line_no,
            format!("file name {dest:?} is not ASCII"),
        ));
    }

    Ok(FileEntry {
        source: PathBuf::from(source),
        dest_name: dest.to_string(),
    })
}

fn parse_error(line: usize, reason: impl Into<String>) -> BuildError {
    BuildError::ManifestParse {
        line,
        reason: reason.into(),
    }
}
