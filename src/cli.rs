use crate::assembler::DEFAULT_ASSEMBLER;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "nbuild",
    about = "Build the Neutron floppy image",
    long_about = "Assemble the modules listed in the build manifest, append an nFS filesystem with the listed files, and write a 1.44 MB floppy image"
)]
pub struct Args {
    /// Build manifest
    #[arg(short = 'm', long = "manifest", default_value = "neutron.nbuild")]
    pub manifest: PathBuf,

    /// Output image path [default: <build-dir>/Neutron.ima]
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Directory for assembled module blobs [default: build/ next to the manifest]
    #[arg(short = 'b', long = "build-dir")]
    pub build_dir: Option<PathBuf>,

    /// Flat-binary assembler to run for each module
    #[arg(short = 'a', long = "assembler", default_value = DEFAULT_ASSEMBLER)]
    pub assembler: String,

    /// Extra argument passed to the assembler before `-f bin` (repeatable)
    #[arg(long = "assembler-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub assembler_args: Vec<String>,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}
