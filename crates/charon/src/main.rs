use anyhow::{Context, Result};
use charon_compiler::compiler;
use charon_compiler::disasm;
use clap::Parser;
use std::path::PathBuf;
use supports_color::Stream;
use tracing_subscriber::EnvFilter;

/// Compile a Charon source file and report diagnostics.
#[derive(Parser)]
#[command(name = "charon", version, about)]
struct Cli {
    /// Source file to compile.
    file: PathBuf,

    /// Print a disassembly listing of the compiled chunk.
    #[arg(short, long)]
    list: bool,

    /// Suppress compiler warnings.
    #[arg(long)]
    no_warn: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    let source = std::fs::read(&cli.file)
        .with_context(|| format!("cannot read {}", cli.file.display()))?;
    let name = cli.file.display().to_string();

    let chunk = match compiler::compile(&source, &name) {
        Ok(chunk) => chunk,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    if !cli.no_warn {
        for w in &chunk.warnings {
            eprintln!("{name}:{}: warning: {w}", w.line);
        }
    }

    if cli.list {
        print!("{}", disasm::disassemble(&chunk.proto, &chunk.strings));
    }
    Ok(())
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let ansi = std::env::var_os("NO_COLOR").is_none()
        && supports_color::on_cached(Stream::Stderr).is_some();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    Ok(())
}
