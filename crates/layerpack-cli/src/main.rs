mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{EXIT_CONFIG_ERROR, EXIT_FAILURE, EXIT_WORKDIR_ERROR};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "layerpack",
    version,
    about = "Assemble self-contained application bundles from native Linux packages"
)]
struct Cli {
    /// Working directory holding layers, downloads and progress.
    #[arg(long, default_value = "layerpack-work", global = true)]
    workdir: String,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging and trace generated scripts.
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Assemble a bundle, resuming from the last completed stage.
    Build {
        /// Path to the build configuration.
        #[arg(default_value = "layerpack.toml")]
        config: PathBuf,
    },
    /// Download and verify the configured packages without assembling.
    Fetch {
        /// Path to the build configuration.
        #[arg(default_value = "layerpack.toml")]
        config: PathBuf,
    },
    /// Print the shared-library closure of the ELF objects under a tree.
    Deps {
        /// Root of the tree to analyze.
        root: PathBuf,
        /// Sub-path to scan, relative to the root (repeatable).
        #[arg(long)]
        scan: Vec<String>,
        /// Extra library name to exclude (repeatable).
        #[arg(long)]
        exclude: Vec<String>,
        /// Run the linker inside the tree via chroot instead of on the host.
        #[arg(long, default_value_t = false)]
        sandbox: bool,
    },
    /// Release leftover mounts and remove transient directories.
    Clean {
        /// Also remove downloaded packages and the progress cache.
        #[arg(long, default_value_t = false)]
        all: bool,
    },
    /// Show the recorded progress of the working directory.
    Status,
    /// Check host prerequisites and the state of the working directory.
    Doctor,
    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages.
    ManPages {
        /// Output directory for man pages.
        #[arg(default_value = "man")]
        dir: PathBuf,
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
            tracing_subscriber::EnvFilter::try_from_env("LAYERPACK_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .init();

    let workdir = expand_tilde(&cli.workdir);
    let json_output = cli.json;

    let result = match cli.command {
        Commands::Build { config } => commands::build::run(&workdir, &config, cli.trace, json_output),
        Commands::Fetch { config } => commands::fetch::run(&workdir, &config, json_output),
        Commands::Deps {
            root,
            scan,
            exclude,
            sandbox,
        } => commands::deps::run(
            &root,
            commands::deps::DepsOptions {
                scan,
                exclude,
                sandbox,
                trace: cli.trace,
            },
            json_output,
        ),
        Commands::Clean { all } => commands::clean::run(&workdir, all, json_output),
        Commands::Status => commands::status::run(&workdir, json_output),
        Commands::Doctor => commands::doctor::run(&workdir, json_output),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
        Commands::ManPages { dir } => commands::man_pages::run::<Cli>(&dir),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(exit_code_for(&msg))
        }
    }
}

fn exit_code_for(msg: &str) -> u8 {
    if msg.starts_with("config error:")
        || msg.starts_with("failed to parse config")
        || msg.starts_with("failed to read config")
    {
        EXIT_CONFIG_ERROR
    } else if msg.starts_with("workdir error:") || msg.starts_with("workdir lock:") {
        EXIT_WORKDIR_ERROR
    } else {
        EXIT_FAILURE
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

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn error_prefixes_map_to_exit_codes() {
        assert_eq!(exit_code_for("config error: app.id must not be empty"), 2);
        assert_eq!(exit_code_for("failed to read config file: x"), 2);
        assert_eq!(exit_code_for("workdir lock: /w/.lock is held"), 3);
        assert_eq!(exit_code_for("workdir error: mounts still active"), 3);
        assert_eq!(exit_code_for("runtime error: mount failed"), 1);
    }

    #[test]
    fn tilde_expands_to_home() {
        if let Ok(home) = std::env::var("HOME") {
            assert_eq!(expand_tilde("~/w"), PathBuf::from(home).join("w"));
        }
        assert_eq!(expand_tilde("rel/w"), PathBuf::from("rel/w"));
    }
}
