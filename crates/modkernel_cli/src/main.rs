//! CLI smoke entry point.
//!
//! # Responsibility
//! - Boot a kernel against a directory and report the outcome.
//! - Map boot outcomes to exit codes: 0 booted, 1 fatal, 2 usage, 3 redirect.
//!
//! Usage: `modkernel_cli [BASE_PATH] [--flush] [--log-dir ABSOLUTE_DIR]`

use log::info;
use modkernel_core::{default_log_level, init_logging, BootError, Kernel};
use std::path::PathBuf;
use std::process::ExitCode;

struct Args {
    base_path: PathBuf,
    flush: bool,
    log_dir: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut base_path = None;
    let mut flush = false;
    let mut log_dir = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--flush" => flush = true,
            "--log-dir" => {
                log_dir = Some(args.next().ok_or("--log-dir needs a directory")?);
            }
            other if other.starts_with("--") => return Err(format!("unknown flag `{other}`")),
            other if base_path.is_none() => base_path = Some(PathBuf::from(other)),
            other => return Err(format!("unexpected argument `{other}`")),
        }
    }
    let base_path = match base_path {
        Some(path) => path,
        None => std::env::current_dir().map_err(|err| format!("no working directory: {err}"))?,
    };
    Ok(Args {
        base_path,
        flush,
        log_dir,
    })
}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("modkernel: {message}");
            return ExitCode::from(2);
        }
    };
    if let Some(log_dir) = &args.log_dir {
        if let Err(err) = init_logging(default_log_level(), log_dir) {
            eprintln!("modkernel: {err}");
            return ExitCode::from(2);
        }
    }

    println!("modkernel_core version={}", modkernel_core::core_version());
    let kernel = Kernel::new(&args.base_path);
    let outcome = kernel.boot(args.flush);
    println!("environment={}", kernel.environment());
    println!("stage={}", kernel.stage());
    match outcome {
        Ok(()) => {
            info!("event=cli_boot module=cli status=ok kernel_id={}", kernel.id());
            kernel.shutdown();
            ExitCode::SUCCESS
        }
        Err(BootError::ConfigurationRedirect { target }) => {
            println!("redirect={}", target.display());
            ExitCode::from(3)
        }
        Err(err) => {
            eprintln!("modkernel: boot failed: {err}");
            ExitCode::FAILURE
        }
    }
}
