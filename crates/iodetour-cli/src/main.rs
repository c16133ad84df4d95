//! # iowrapper
//!
//! Runs a build step with the iodetour hooks loaded into it and every
//! process it starts, and writes one `<access><path>` line per file the
//! tree touched:
//!
//! ```text
//! iowrapper [--config FILE] [--ignore OPTION]... out.d cl.exe /c main.c
//! ```
//!
//! The exit code is the build step's own; launcher failures exit with a
//! negative code (see [`LaunchError::exit_code`]).

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use iodetour_config::logging::{init_logging, LogLevel};
use iodetour_config::{log_launcher_error, Config};

#[cfg(windows)]
mod console;
mod error;
mod launcher;
mod request;

use error::LaunchError;
use request::LaunchRequest;

/// Run a command and record the files it reads, writes and executes
#[derive(Parser, Debug)]
#[command(name = "iowrapper")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Project configuration file (default: .iodetour/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Leave matching entries out of the dependency file (e.g. IgnoreSystem);
    /// repeatable, adds to the configured options
    #[arg(long = "ignore", value_name = "OPTION")]
    ignore: Vec<String>,

    /// Log level of the launcher (overridden by IOWRAPPER_LOG)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Where to write the dependency list
    #[arg(value_name = "DEPENDENCY_FILE")]
    dependency_file: PathBuf,

    /// Program to run
    #[arg(value_name = "EXECUTABLE")]
    executable: String,

    /// Arguments passed to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            log_launcher_error!(error = %format!("{e:#}"), "launch failed");
            eprintln!("iowrapper: {e:#}");
            e.downcast_ref::<LaunchError>()
                .map_or(LaunchError::Config(String::new()).exit_code(), LaunchError::exit_code)
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let config = Config::load_with(cli.config.as_deref())
        .map_err(|e| LaunchError::Config(e.to_string()))?;
    let level: LogLevel = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.logging.level)
        .parse()
        .map_err(|e: iodetour_config::ConfigError| LaunchError::Config(e.to_string()))?;
    init_logging(level);

    let launcher_exe = std::env::current_exe().context("locating the launcher executable")?;
    let request = LaunchRequest::new(
        cli.dependency_file,
        cli.executable,
        cli.args,
        &cli.ignore,
        &config,
        &launcher_exe,
    )?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("starting the async runtime")?;
    Ok(rt.block_on(launcher::run_process_with_detours(&request))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let cli = Cli::try_parse_from(["iowrapper", "out.d", "cl.exe"]).unwrap();
        assert_eq!(cli.dependency_file, PathBuf::from("out.d"));
        assert_eq!(cli.executable, "cl.exe");
        assert!(cli.args.is_empty());
        assert!(cli.ignore.is_empty());
    }

    #[test]
    fn test_child_flags_pass_through() {
        let cli = Cli::try_parse_from([
            "iowrapper",
            "--ignore",
            "IgnoreSystem",
            "--ignore",
            "IgnoreTemporary",
            "out.d",
            "cl.exe",
            "/c",
            "--ignore",
            "-O2",
        ])
        .unwrap();
        assert_eq!(cli.ignore, vec!["IgnoreSystem", "IgnoreTemporary"]);
        assert_eq!(cli.args, vec!["/c", "--ignore", "-O2"]);
    }

    #[test]
    fn test_missing_executable_is_rejected() {
        assert!(Cli::try_parse_from(["iowrapper", "out.d"]).is_err());
    }

    #[test]
    fn test_config_file_and_level() {
        let cli = Cli::try_parse_from([
            "iowrapper",
            "--config",
            "ci.toml",
            "--log-level",
            "debug",
            "out.d",
            "link.exe",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("ci.toml")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }
}
