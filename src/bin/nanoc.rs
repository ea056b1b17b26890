//! the main compiler binary. takes a source file, a destination directory,
//! a register-allocation strategy, and a verbose flag.
//!
//! run with `--help` for more info.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use nanoc::classfile::ClassFile;
use nanoc::pipeline::{self, PipelineOptions};
use nanoc::regalloc::Strategy;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// the input class file (nanoc's own minimal text notation)
    file: PathBuf,
    /// directory the assembly output is written into
    #[arg(short, long, default_value = ".")]
    out_dir: PathBuf,
    /// register-allocation strategy
    #[arg(value_enum, short, long, default_value_t = AllocStrategy::Graph)]
    strategy: AllocStrategy,
    /// dump tuples, HIR, LIR, liveness sets and intervals to stdout
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
enum AllocStrategy {
    Naive,
    Graph,
}

impl From<AllocStrategy> for Strategy {
    fn from(s: AllocStrategy) -> Self {
        match s {
            AllocStrategy::Naive => Strategy::Naive,
            AllocStrategy::Graph => Strategy::Graph,
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let text = match std::fs::read_to_string(&args.file) {
        Ok(text) => text,
        Err(err) => {
            eprintln!("Error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let class_file = match ClassFile::parse_text(&text) {
        Some(class_file) => class_file,
        None => {
            eprintln!("Error: could not parse {}", args.file.display());
            return ExitCode::FAILURE;
        }
    };

    let options = PipelineOptions { strategy: args.strategy.into(), verbose: args.verbose };
    let (assembly, had_error) = pipeline::compile(&class_file, &options);

    let stem = args.file.file_stem().and_then(|s| s.to_str()).unwrap_or("out");
    let out_path = args.out_dir.join(format!("{stem}.asm"));
    if let Err(err) = std::fs::write(&out_path, assembly) {
        eprintln!("Error: {err}");
        return ExitCode::FAILURE;
    }

    if had_error {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
