//! # corescope
//!
//! Offline forensic analyzer for ELF process core dumps: rebuilds the
//! dumped address space, discovers the allocators the process used (glibc
//! malloc, PyMalloc, the Go runtime, tcmalloc), enumerates every heap
//! allocation with a used/free verdict, and answers low-level queries over
//! the frozen image.

mod analysis;
mod commands;

use clap::Parser;
use corescope_elf::{CoreImage, ElfClass, FileImage, sniff_class};
use corescope_map::{Width32, Width64};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// Offline forensic analyzer for ELF core dumps.
#[derive(Parser)]
#[command(name = "corescope", version)]
struct Args {
    /// Only check whether the core is truncated; exit 1 if it is.
    #[arg(short = 't')]
    truncation_check: bool,
    /// Path of the core file to analyze.
    core: PathBuf,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp(None)
        .init();
    let args = Args::parse();
    match run(&args) {
        Ok(code) => code,
        Err(error) => {
            report(error.as_ref());
            ExitCode::FAILURE
        }
    }
}

fn report(error: &dyn Error) {
    eprintln!("corescope: {error}");
    let mut source = error.source();
    while let Some(cause) = source {
        eprintln!("  caused by: {cause}");
        source = cause.source();
    }
}

fn run(args: &Args) -> Result<ExitCode, Box<dyn Error>> {
    let file = FileImage::open(&args.core)?;
    match sniff_class(file.bytes())? {
        1 => analyze::<Width32>(&file, &args.core, args.truncation_check),
        _ => analyze::<Width64>(&file, &args.core, args.truncation_check),
    }
}

fn analyze<W: ElfClass>(
    file: &FileImage,
    core_path: &Path,
    truncation_check: bool,
) -> Result<ExitCode, Box<dyn Error>> {
    let core = CoreImage::<W>::parse(file.bytes())?;
    if core.is_truncated() {
        eprintln!("{} is truncated.", core_path.display());
        eprintln!(
            "It has size {} which is smaller than minimum expected size {}.",
            core.file_size(),
            core.minimum_expected_file_size()
        );
        if truncation_check {
            return Ok(ExitCode::FAILURE);
        }
        eprintln!("Many commands may be disabled or inaccurate as a result.");
    }
    if truncation_check {
        return Ok(ExitCode::SUCCESS);
    }

    let analysis = analysis::ProcessAnalysis::resolve(&core, core_path);
    log::info!(
        "{} modules, {} allocations ({} used, {} free), {} stacks, {} claims",
        analysis.modules.len(),
        analysis.allocations.len(),
        analysis.allocations.used_count(),
        analysis.allocations.len() - analysis.allocations.used_count(),
        analysis.stacks.len(),
        analysis.partition.iter().count()
    );
    log::info!(
        "{} vtable signatures ({} pending a name), {} named anchors, {} type_info records",
        analysis.signatures.len(),
        analysis.signatures.pending().count(),
        analysis.anchors.len(),
        analysis.typeinfo.records().len()
    );

    commands::run_command_loop(core.address_map());
    Ok(ExitCode::SUCCESS)
}
