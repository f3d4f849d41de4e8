mod commands;

use clap::{Parser, Subcommand};
use commands::build::BuildArgs;
use commands::{EXIT_DESCRIPTION_ERROR, EXIT_FAILURE, EXIT_STORE_ERROR};
use std::path::PathBuf;
use std::process::ExitCode;
use strata_runtime::{select_backend, RuntimeConfig, DEFAULT_RUNTIME_DIR};

#[derive(Debug, Parser)]
#[command(
    name = "strata",
    version,
    about = "Build operating system images from content-addressed pipelines"
)]
struct Cli {
    /// Path to the tree store directory.
    #[arg(long, default_value = "/var/lib/strata", global = true)]
    store: String,

    /// Scratch directory for sandbox roots.
    #[arg(long, default_value = DEFAULT_RUNTIME_DIR, global = true)]
    runtime_dir: PathBuf,

    /// Execution backend: "nspawn" or "mock".
    #[arg(long, default_value = "nspawn", global = true)]
    backend: String,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a pipeline, reusing cached trees from the store.
    Build {
        /// Pipeline description (JSON, or TOML with a .toml extension).
        description: PathBuf,
        /// Directory receiving the assembler's artifact.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Use stage and assembler executables from this directory.
        #[arg(long)]
        libdir: Option<PathBuf>,
        /// Description of a pipeline to build the environment in.
        #[arg(long)]
        build_env: Option<PathBuf>,
        /// Stream step output to the terminal instead of capturing it.
        #[arg(long, default_value_t = false)]
        interactive: bool,
        /// Report failing steps in the result instead of aborting with an error.
        #[arg(long, default_value_t = false)]
        no_check: bool,
    },
    /// Print stage identities without running anything.
    Id {
        description: PathBuf,
        #[arg(long)]
        build_env: Option<PathBuf>,
    },
    /// Print the canonical form of a pipeline description.
    Describe {
        description: PathBuf,
        #[arg(long)]
        build_env: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("STRATA_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Build {
            description,
            output,
            libdir,
            build_env,
            interactive,
            no_check,
        } => {
            let backend = match select_backend(&cli.backend, RuntimeConfig::new(&cli.runtime_dir)) {
                Ok(b) => b,
                Err(e) => {
                    eprintln!("error: {e}");
                    return ExitCode::from(EXIT_FAILURE);
                }
            };
            if backend.name() == "nspawn"
                && std::env::var("STRATA_SKIP_PREREQS").as_deref() != Ok("1")
            {
                let missing = strata_runtime::check_sandbox_prereqs();
                if !missing.is_empty() {
                    eprintln!("error: {}", strata_runtime::format_missing(&missing));
                    return ExitCode::from(EXIT_FAILURE);
                }
            }
            commands::build::run(
                &backend,
                &expand_tilde(&cli.store),
                &BuildArgs {
                    description: &description,
                    build_env: build_env.as_deref(),
                    output: output.as_deref(),
                    libdir,
                    interactive,
                    check: !no_check,
                },
                cli.json,
            )
        }
        Commands::Id {
            description,
            build_env,
        } => commands::id::run(&description, build_env.as_deref(), cli.json),
        Commands::Describe {
            description,
            build_env,
        } => commands::describe::run(&description, build_env.as_deref()),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("description error:") {
                EXIT_DESCRIPTION_ERROR
            } else if msg.starts_with("store error:") {
                EXIT_STORE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
