/// Build orchestration: manifest -> assembled modules -> nFS image.
///
/// Everything is sequential. The image is written to `<output>.tmp` and only
/// renamed into place once every phase succeeded, so a failed build never
/// leaves a partial image at the output path.
use crate::assembler::{AssembledModule, Assembler, ExternalAssembler};
use crate::cli::Args;
use crate::error::{BuildError, Region};
use crate::manifest::{FileEntry, Manifest, ModuleEntry};
use crate::nfs::{self, ImageSummary, ResolvedFile};
use crate::sink::ImageWriter;
use anyhow::{Context, Result};
use log::{debug, info};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

const DEFAULT_BUILD_DIR: &str = "build";
const DEFAULT_IMAGE_NAME: &str = "Neutron.ima";

/// Entry point for the command line.
pub fn run(args: &Args) -> Result<()> {
    let manifest = Manifest::load(&args.manifest)?;
    let base_dir = manifest_dir(&args.manifest);

    let build_dir = args
        .build_dir
        .clone()
        .unwrap_or_else(|| base_dir.join(DEFAULT_BUILD_DIR));
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| build_dir.join(DEFAULT_IMAGE_NAME));

    fs::create_dir_all(&build_dir)
        .with_context(|| format!("Failed to create build directory {build_dir:?}"))?;

    let assembler = ExternalAssembler::new(args.assembler.clone(), &build_dir)
        .with_args(args.assembler_args.clone());

    let summary = build_to_path(&assembler, &base_dir, &manifest, &output)?;
    info!(
        "Build complete: {:?} ({} code bytes, {} files in {} sectors, {} bytes)",
        output, summary.code_bytes, summary.file_count, summary.data_sectors, summary.image_size
    );
    Ok(())
}

/// Directory that relative manifest paths are resolved against.
fn manifest_dir(manifest: &Path) -> PathBuf {
    match manifest.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Build the image described by `manifest` and atomically write it to `output`.
pub fn build_to_path<A: Assembler>(
    assembler: &A,
    base_dir: &Path,
    manifest: &Manifest,
    output: &Path,
) -> Result<ImageSummary> {
    let tmp_path = tmp_path_for(output);
    let result = write_tmp(assembler, base_dir, manifest, &tmp_path);

    match result {
        Ok(summary) => {
            fs::rename(&tmp_path, output)
                .with_context(|| format!("Failed to move image into place at {output:?}"))?;
            Ok(summary)
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            Err(e)
        }
    }
}

fn write_tmp<A: Assembler>(
    assembler: &A,
    base_dir: &Path,
    manifest: &Manifest,
    tmp_path: &Path,
) -> Result<ImageSummary> {
    let file = File::create(tmp_path)
        .with_context(|| format!("Failed to create image file {tmp_path:?}"))?;
    let mut out = ImageWriter::new(BufWriter::new(file));

    let summary = build_image(assembler, base_dir, manifest, &mut out)?;

    let file = out
        .into_inner()
        .and_then(|w| w.into_inner().map_err(io::IntoInnerError::into_error))
        .context("Failed to flush image file")?;
    file.sync_all().context("Failed to sync image file")?;
    Ok(summary)
}

/// Assemble modules, read files and lay out the full image into `out`.
pub fn build_image<A: Assembler, W: Write>(
    assembler: &A,
    base_dir: &Path,
    manifest: &Manifest,
    out: &mut ImageWriter<W>,
) -> Result<ImageSummary> {
    info!("--- Assembling {} module(s) ---", manifest.modules.len());
    let modules = assemble_modules(assembler, base_dir, &manifest.modules)?;
    let code_bytes = nfs::check_code_region(&modules)?;
    debug!("Code region: {} of {} bytes", code_bytes, nfs::CODE_REGION_END);

    info!("--- Building file system ({} file(s)) ---", manifest.files.len());
    let files = resolve_files(base_dir, &manifest.files)?;
    for file in &files {
        debug!("{:?}: {} bytes", file.entry.source, file.data.len());
    }

    Ok(nfs::write_image(out, &modules, &files)?)
}

pub fn assemble_modules<A: Assembler>(
    assembler: &A,
    base_dir: &Path,
    entries: &[ModuleEntry],
) -> Result<Vec<AssembledModule>> {
    let mut modules = Vec::with_capacity(entries.len());
    for entry in entries {
        let source = base_dir.join(&entry.source);
        info!("Assembling {:?}", entry.source);
        let blob = assembler
            .assemble(&source)
            .with_context(|| format!("Failed to assemble {:?}", entry.source))?;
        modules.push(AssembledModule {
            entry: entry.clone(),
            blob,
        });
    }
    Ok(modules)
}

/// Read every file's contents once, in manifest order.
///
/// Sizes come from metadata first, so a file that cannot fit in the data
/// region is rejected before anything is loaded.
pub fn resolve_files(base_dir: &Path, entries: &[FileEntry]) -> Result<Vec<ResolvedFile>> {
    let mut data_bytes = 0u64;
    for entry in entries {
        let source = base_dir.join(&entry.source);
        let metadata = fs::metadata(&source)
            .map_err(|e| missing_or_io(e, &source))
            .with_context(|| format!("Failed to stat {source:?}"))?;
        data_bytes += nfs::sectors_for(metadata.len()) * nfs::SECTOR_SIZE;
        if data_bytes > nfs::DATA_REGION_CAPACITY {
            return Err(BuildError::CapacityExceeded {
                region: Region::Image,
                required: nfs::IMAGE_SIZE - nfs::DATA_REGION_CAPACITY + data_bytes,
                available: nfs::IMAGE_SIZE,
            })
            .with_context(|| format!("{source:?} does not fit in the image"));
        }
    }

    entries
        .iter()
        .map(|entry| -> Result<ResolvedFile> {
            let source = base_dir.join(&entry.source);
            let data = fs::read(&source)
                .map_err(|e| missing_or_io(e, &source))
                .with_context(|| format!("Failed to read {source:?}"))?;
            Ok(ResolvedFile {
                entry: entry.clone(),
                data,
            })
        })
        .collect()
}

fn missing_or_io(err: io::Error, path: &Path) -> BuildError {
    match err.kind() {
        io::ErrorKind::NotFound => BuildError::SourceFileMissing(path.to_path_buf()),
        _ => BuildError::Io(err),
    }
}

/// `<output>.tmp`, next to the output and never equal to it.
fn tmp_path_for(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as BuildResult;
    use crate::nfs::{CODE_REGION_END, IMAGE_SIZE};
    use crate::testutil::scratch_dir;
    use std::cell::RefCell;

    /// Returns a blob derived from the file contents and records each call.
    #[derive(Default)]
    struct FakeAssembler {
        calls: RefCell<Vec<PathBuf>>,
    }

    impl Assembler for FakeAssembler {
        fn assemble(&self, source: &Path) -> BuildResult<Vec<u8>> {
            self.calls.borrow_mut().push(source.to_path_buf());
            let text = fs::read(source)
                .map_err(|_| BuildError::SourceFileMissing(source.to_path_buf()))?;
            if text.starts_with(b"error") {
                return Err(BuildError::Assembly {
                    module: source.to_path_buf(),
                    diagnostics: String::from_utf8_lossy(&text).into_owned(),
                });
            }
            // "<byte> <count>" -> count copies of byte
            let text = String::from_utf8_lossy(&text);
            let mut parts = text.split_whitespace();
            let byte: u8 = parts.next().unwrap().parse().unwrap();
            let count: usize = parts.next().unwrap().parse().unwrap();
            Ok(vec![byte; count])
        }
    }

    fn build_error(err: &anyhow::Error) -> &BuildError {
        err.downcast_ref::<BuildError>()
            .or_else(|| err.chain().find_map(|e| e.downcast_ref::<BuildError>()))
            .expect("not a build error")
    }

    fn project(name: &str) -> PathBuf {
        let dir = scratch_dir(name);
        fs::create_dir_all(dir.join("boot")).unwrap();
        fs::write(dir.join("boot/stage1.asm"), "144 32").unwrap();
        fs::write(dir.join("boot/stage2.asm"), "204 700").unwrap();
        fs::write(dir.join("readme.txt"), "Neutron test disk").unwrap();
        dir
    }

    const MANIFEST: &str = "# Neutron\n\
                            boot/stage1.asm\n\
                            boot/stage2.asm --no-append\n\
                            .fs\n\
                            readme.txt>readme.txt\n";

    #[test]
    fn test_end_to_end() {
        let dir = project("pipeline-e2e");
        let manifest = Manifest::parse(MANIFEST).unwrap();
        let output = dir.join("Neutron.ima");
        let asm = FakeAssembler::default();

        let summary = build_to_path(&asm, &dir, &manifest, &output).unwrap();
        assert_eq!(summary.code_bytes, 32);
        assert_eq!(summary.file_count, 1);
        assert_eq!(summary.image_size, IMAGE_SIZE);

        // both modules assembled, in order, even the no-append one
        assert_eq!(
            *asm.calls.borrow(),
            vec![dir.join("boot/stage1.asm"), dir.join("boot/stage2.asm")]
        );

        let image = fs::read(&output).unwrap();
        assert_eq!(image.len(), 1_474_560);
        assert!(image[..32].iter().all(|&b| b == 144));
        assert!(image[32..2560].iter().all(|&b| b == 0));
        assert_eq!(&image[2560..2564], &0xDEADF500u32.to_le_bytes());
        assert_eq!(&image[3072..3082], b"readme.txt");
        assert_eq!(&image[3096..3100], &17u32.to_le_bytes());
        assert_eq!(&image[3100..3104], &7u32.to_le_bytes());
        assert_eq!(&image[3584..3601], b"Neutron test disk");
        assert!(image[3601..].iter().all(|&b| b == 0));
        assert!(!tmp_path_for(&output).exists());
    }

    #[test]
    fn test_rebuild_is_identical() {
        let dir = project("pipeline-idempotent");
        let manifest = Manifest::parse(MANIFEST).unwrap();
        let first = dir.join("first.ima");
        let second = dir.join("second.ima");
        build_to_path(&FakeAssembler::default(), &dir, &manifest, &first).unwrap();
        build_to_path(&FakeAssembler::default(), &dir, &manifest, &second).unwrap();
        assert_eq!(fs::read(first).unwrap(), fs::read(second).unwrap());
    }

    #[test]
    fn test_failed_build_leaves_no_output() {
        let dir = project("pipeline-overflow");
        fs::write(dir.join("boot/big.asm"), "1 2600").unwrap();
        let manifest = Manifest::parse("boot/big.asm\n").unwrap();
        let output = dir.join("Neutron.ima");

        let err = build_to_path(&FakeAssembler::default(), &dir, &manifest, &output).unwrap_err();
        assert!(matches!(
            build_error(&err),
            BuildError::CapacityExceeded { region: Region::CodeRegion, required: 2600, available }
                if *available == CODE_REGION_END
        ));
        assert!(!output.exists());
        assert!(!tmp_path_for(&output).exists());
    }

    #[test]
    fn test_assembly_error_stops_build() {
        let dir = project("pipeline-asm-error");
        fs::write(dir.join("boot/bad.asm"), "error: bad operand").unwrap();
        let manifest = Manifest::parse("boot/bad.asm\nboot/stage1.asm\n").unwrap();
        let asm = FakeAssembler::default();

        let err = build_to_path(&asm, &dir, &manifest, &dir.join("out.ima")).unwrap_err();
        match build_error(&err) {
            BuildError::Assembly { diagnostics, .. } => assert!(diagnostics.contains("bad operand")),
            other => panic!("expected assembly error, got {other:?}"),
        }
        assert_eq!(asm.calls.borrow().len(), 1);
    }

    #[test]
    fn test_missing_fs_source() {
        let dir = project("pipeline-missing-file");
        let manifest = Manifest::parse("boot/stage1.asm\n.fs\nnope.txt>nope.txt\n").unwrap();

        let err = build_to_path(&FakeAssembler::default(), &dir, &manifest, &dir.join("out.ima"))
            .unwrap_err();
        assert!(matches!(
            build_error(&err),
            BuildError::SourceFileMissing(p) if *p == dir.join("nope.txt")
        ));
    }

    #[test]
    fn test_existing_output_replaced() {
        let dir = project("pipeline-replace");
        let output = dir.join("Neutron.ima");
        fs::write(&output, "stale").unwrap();

        let manifest = Manifest::parse(MANIFEST).unwrap();
        build_to_path(&FakeAssembler::default(), &dir, &manifest, &output).unwrap();
        assert_eq!(fs::metadata(&output).unwrap().len(), IMAGE_SIZE);
    }

    #[test]
    fn test_tmp_path_appends() {
        assert_eq!(
            tmp_path_for(Path::new("build/Neutron.ima")),
            PathBuf::from("build/Neutron.ima.tmp")
        );
        assert_eq!(tmp_path_for(Path::new("disk.tmp")), PathBuf::from("disk.tmp.tmp"));
        assert_eq!(tmp_path_for(Path::new("disk")), PathBuf::from("disk.tmp"));
    }

    #[test]
    fn test_failed_build_keeps_previous_tmp_named_image() {
        let dir = project("pipeline-keep-tmp-output");
        fs::write(dir.join("boot/bad.asm"), "error: bad operand").unwrap();
        let manifest = Manifest::parse("boot/bad.asm\n").unwrap();
        let output = dir.join("disk.tmp");
        fs::write(&output, "previous good image").unwrap();

        build_to_path(&FakeAssembler::default(), &dir, &manifest, &output).unwrap_err();
        assert_eq!(fs::read(&output).unwrap(), b"previous good image");
    }

    #[test]
    fn test_failed_build_keeps_sibling_file() {
        let dir = project("pipeline-keep-sibling");
        fs::write(dir.join("boot/bad.asm"), "error: bad operand").unwrap();
        let manifest = Manifest::parse("boot/bad.asm\n").unwrap();
        let sibling = dir.join("disk.tmp");
        fs::write(&sibling, "user notes").unwrap();

        build_to_path(&FakeAssembler::default(), &dir, &manifest, &dir.join("disk.ima"))
            .unwrap_err();
        assert_eq!(fs::read(&sibling).unwrap(), b"user notes");
        assert!(!dir.join("disk.ima").exists());
    }

    #[test]
    fn test_oversized_file_rejected_before_read() {
        let dir = project("pipeline-sparse");
        // sparse: reports the full length without occupying disk space
        let big = File::create(dir.join("huge.bin")).unwrap();
        big.set_len(4 * 1024 * 1024 * 1024).unwrap();
        drop(big);
        let manifest = Manifest::parse("boot/stage1.asm\n.fs\nhuge.bin>huge\n").unwrap();
        let output = dir.join("out.ima");

        let err = build_to_path(&FakeAssembler::default(), &dir, &manifest, &output).unwrap_err();
        assert!(matches!(
            build_error(&err),
            BuildError::CapacityExceeded { region: Region::Image, available, .. }
                if *available == IMAGE_SIZE
        ));
        assert!(format!("{err:#}").contains("huge.bin"));
        assert!(!output.exists());
    }

    #[test]
    fn test_files_together_exceed_image() {
        let dir = project("pipeline-cumulative");
        let half = nfs::DATA_REGION_CAPACITY / 2 + 1;
        for name in ["a.bin", "b.bin"] {
            File::create(dir.join(name)).unwrap().set_len(half).unwrap();
        }

        let one = Manifest::parse(".fs\na.bin>a\n").unwrap();
        build_to_path(&FakeAssembler::default(), &dir, &one, &dir.join("one.ima")).unwrap();

        let both = Manifest::parse(".fs\na.bin>a\nb.bin>b\n").unwrap();
        let err = build_to_path(&FakeAssembler::default(), &dir, &both, &dir.join("both.ima"))
            .unwrap_err();
        assert!(matches!(
            build_error(&err),
            BuildError::CapacityExceeded { region: Region::Image, .. }
        ));
        assert!(format!("{err:#}").contains("b.bin"));
    }

    #[test]
    fn test_unreadable_file_names_path() {
        let dir = project("pipeline-dir-entry");
        fs::create_dir_all(dir.join("docs")).unwrap();
        let manifest = Manifest::parse(".fs\ndocs>docs\n").unwrap();

        let err = build_to_path(&FakeAssembler::default(), &dir, &manifest, &dir.join("out.ima"))
            .unwrap_err();
        assert!(format!("{err:#}").contains("docs"));
        assert!(matches!(build_error(&err), BuildError::Io(_)));
    }

    #[test]
    fn test_code_overflow_reported_before_files() {
        let dir = project("pipeline-phase-order");
        fs::write(dir.join("boot/big.asm"), "1 2600").unwrap();
        let manifest = Manifest::parse("boot/big.asm\n.fs\nnope.txt>nope\n").unwrap();

        let err = build_to_path(&FakeAssembler::default(), &dir, &manifest, &dir.join("out.ima"))
            .unwrap_err();
        assert!(matches!(
            build_error(&err),
            BuildError::CapacityExceeded { region: Region::CodeRegion, .. }
        ));
    }

    #[test]
    fn test_manifest_dir() {
        assert_eq!(manifest_dir(Path::new("neutron.nbuild")), PathBuf::from("."));
        assert_eq!(
            manifest_dir(Path::new("os/neutron.nbuild")),
            PathBuf::from("os")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_run_with_external_assembler() {
        let dir = project("pipeline-run");
        fs::write(dir.join("neutron.nbuild"), MANIFEST).unwrap();
        let script = dir.join("fake-asm.sh");
        // `$4` is the output path, `$5` the input: emit 10 bytes per module
        fs::write(&script, "printf '0123456789' > \"$4\"\n").unwrap();

        let args = Args {
            manifest: dir.join("neutron.nbuild"),
            output: None,
            build_dir: None,
            assembler: "sh".to_string(),
            assembler_args: vec![script.to_string_lossy().into_owned()],
            verbose: false,
        };
        run(&args).unwrap();

        let image = fs::read(dir.join("build/Neutron.ima")).unwrap();
        assert_eq!(&image[..10], b"0123456789");
        assert_eq!(image[10], 0);
        assert_eq!(image.len() as u64, IMAGE_SIZE);
        assert!(dir.join("build/stage2.bin").is_file());
    }

    #[test]
    fn test_run_without_manifest() {
        let dir = scratch_dir("pipeline-no-manifest");
        let args = Args {
            manifest: dir.join("neutron.nbuild"),
            output: None,
            build_dir: None,
            assembler: "yasm".to_string(),
            assembler_args: Vec::new(),
            verbose: false,
        };
        let err = run(&args).unwrap_err();
        assert!(matches!(build_error(&err), BuildError::ManifestMissing(_)));
        assert!(!dir.join("build").exists());
    }
}
