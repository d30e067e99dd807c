#![forbid(unsafe_code)]

mod config;

use std::{
    fs,
    path::{Path, PathBuf},
};

use clap::{Parser, Subcommand};
use miette::{Diagnostic, IntoDiagnostic, NamedSource};
use thiserror::Error;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use lockstep_ast::{LockMode, Program};
use lockstep_backend_cpp::emit_program;
use lockstep_core::{check_program, lower};

#[derive(Parser, Debug)]
#[command(name = "lockstep", version, about = "Lock-discipline checker and message reifier")]
struct Cli {
    /// Verbose logging (`-v` debug, `-vv` trace). `RUST_LOG` takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Source text the tree's spans point into, used to render diagnostics.
    #[arg(long, global = true)]
    source: Option<PathBuf>,

    /// Use this config file instead of searching for `lockstep.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Lock mode for classes that do not declare one. Overrides `lockstep.toml`.
    #[arg(long, global = true, value_enum)]
    default_lock_mode: Option<LockModeArg>,

    /// Stop after this many diagnostics (0 = unlimited). Overrides `lockstep.toml`.
    #[arg(long, global = true)]
    max_diagnostics: Option<usize>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LockModeArg {
    Nolock,
    Checklock,
    Autolock,
}

impl From<LockModeArg> for LockMode {
    fn from(v: LockModeArg) -> Self {
        match v {
            LockModeArg::Nolock => LockMode::NoLock,
            LockModeArg::Checklock => LockMode::CheckLock,
            LockModeArg::Autolock => LockMode::AutoLock,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the lock-discipline check
    Check {
        /// Input tree (JSON)
        path: PathBuf,
    },

    /// Check, insert locks, reify messages and render C++
    Emit {
        /// Input tree (JSON)
        path: PathBuf,

        /// Output module (defaults to the input with a `.cpp` extension)
        #[arg(short = 'o', long = "output")]
        out: Option<PathBuf>,

        /// Do not write the runtime header next to the module
        #[arg(long, default_value_t = false)]
        no_runtime_header: bool,

        /// Skip the locked accessor wrappers
        #[arg(long, default_value_t = false)]
        no_wrappers: bool,

        /// Runtime header name used by the module's `#include`
        #[arg(long)]
        header_name: Option<String>,
    },

    /// Print the message and wrapper plans as JSON
    Plan {
        /// Input tree (JSON)
        path: PathBuf,
    },
}

#[derive(Debug, Error, Diagnostic)]
#[error("invalid tree {path}: {message}")]
#[diagnostic(code(lockstep::tree), help("the input must be a serialized lockstep program"))]
struct TreeError {
    path: String,
    message: String,
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.cmd {
        Cmd::Check { path } => {
            let resolved = resolve_config(&cli, path)?;
            let program = read_tree(path)?;
            let source = diagnostic_source(&cli, path)?;
            let checked = check_program(program, &resolved.checker)
                .map_err(|e| with_source(miette::Report::new(e), source))?;
            for lock in &checked.inserted {
                debug!(binding = %lock.binding, kind = lock.kind.display(), "inserted lock");
            }
            println!("ok: {} ({} inserted lock(s))", display_path(path), checked.inserted.len());
            Ok(())
        }
        Cmd::Emit {
            path,
            out,
            no_runtime_header,
            no_wrappers,
            header_name,
        } => {
            let mut resolved = resolve_config(&cli, path)?;
            if *no_runtime_header {
                resolved.emit.runtime_header = false;
            }
            if *no_wrappers {
                resolved.emit.wrappers = false;
            }
            if let Some(name) = header_name {
                resolved.emit.header_name = name.clone();
            }

            let program = read_tree(path)?;
            let source = diagnostic_source(&cli, path)?;
            let lowered = lower(program, &resolved.checker)
                .map_err(|e| with_source(miette::Report::new(e), source.clone()))?;
            let artifacts = emit_program(&lowered, &resolved.emit)
                .map_err(|e| with_source(miette::Report::new(e), source))?;

            let out = out.clone().unwrap_or_else(|| path.with_extension("cpp"));
            write_file(&out, &artifacts.module_cpp)?;
            println!("wrote {}", display_path(&out));

            if let Some(header) = &artifacts.runtime_h {
                let dir = out.parent().unwrap_or_else(|| Path::new("."));
                let header_path = dir.join(&resolved.emit.header_name);
                write_file(&header_path, header)?;
                println!("wrote {}", display_path(&header_path));
            }
            Ok(())
        }
        Cmd::Plan { path } => {
            let resolved = resolve_config(&cli, path)?;
            let program = read_tree(path)?;
            let source = diagnostic_source(&cli, path)?;
            let lowered = lower(program, &resolved.checker)
                .map_err(|e| with_source(miette::Report::new(e), source))?;
            let json = serde_json::to_string_pretty(&lowered.plan).into_diagnostic()?;
            println!("{json}");
            Ok(())
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// File config first, then command-line overrides.
fn resolve_config(cli: &Cli, input: &Path) -> miette::Result<config::ResolvedConfig> {
    let mut resolved = match &cli.config {
        Some(path) => config::load_config_file(path),
        None => config::load_config(input),
    }
    .map_err(miette::Report::new)?;

    match &resolved.config_path {
        Some(p) => info!(config = %display_path(p), "loaded config"),
        None => debug!("no lockstep.toml found; using defaults"),
    }

    if let Some(mode) = cli.default_lock_mode {
        resolved.checker.default_lock_mode = mode.into();
    }
    if let Some(max) = cli.max_diagnostics {
        resolved.checker.max_diagnostics = max;
    }
    Ok(resolved)
}

fn read_tree(path: &Path) -> miette::Result<Program> {
    let raw = fs::read_to_string(path).into_diagnostic()?;
    let program: Program = serde_json::from_str(&raw).map_err(|e| TreeError {
        path: display_path(path),
        message: e.to_string(),
    })?;
    debug!(
        classes = program.classes.len(),
        functions = program.functions.len(),
        "read tree"
    );
    Ok(program)
}

fn diagnostic_source(cli: &Cli, tree: &Path) -> miette::Result<Option<NamedSource<String>>> {
    match &cli.source {
        Some(path) => {
            let src = fs::read_to_string(path).into_diagnostic()?;
            Ok(Some(NamedSource::new(display_path(path), src)))
        }
        None => {
            debug!(tree = %display_path(tree), "no --source given; diagnostics render without snippets");
            Ok(None)
        }
    }
}

fn with_source(report: miette::Report, source: Option<NamedSource<String>>) -> miette::Report {
    match source {
        Some(source) => report.with_source_code(source),
        None => report,
    }
}

fn write_file(path: &Path, contents: &str) -> miette::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).into_diagnostic()?;
    }
    if path.exists() {
        warn!(path = %display_path(path), "overwriting existing file");
    }
    fs::write(path, contents).into_diagnostic()
}

fn display_path(p: &Path) -> String {
    p.to_string_lossy().to_string()
}
