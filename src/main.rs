use std::time::{Instant, SystemTime};
use std::{env, fs};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::DateTime;
use env_logger::Builder;
use log::{LevelFilter, debug, error, info};

use readscrub::cli::{self, Arguments};
use readscrub::config::defs::{PipelineError, RunConfig};
use readscrub::pipelines::decontaminate;
use readscrub::utils::fastx::sample_base;
use readscrub::utils::file::absolute_path;
use readscrub::utils::system::{detect_cores, get_ram_temp_dir};


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = cli::parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n readscrub\n-------------\n");

    let dir = env::current_dir()?;
    info!("The current directory is {:?}", dir);

    let ram_temp_dir = get_ram_temp_dir();
    info!("The RAM temp directory is {:?}", ram_temp_dir);

    let max_cores = detect_cores(args.threads.max(1).saturating_mul(args.processes.max(1)));
    debug!("Using up to {} cores across {} concurrent job(s)", max_cores, args.processes);

    let out_dir = match setup_output_dir(&args, &dir) {
        Ok(out_dir) => out_dir,
        Err(e) => fail(e, run_start),
    };
    info!("Writing outputs to {:?}", out_dir);

    let run_config = Arc::new(RunConfig {
        cwd: dir,
        ram_temp_dir,
        out_dir,
        max_cores,
        args,
    });

    if let Err(e) = decontaminate::run(run_config).await {
        fail(e, run_start);
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}

fn fail(e: PipelineError, run_start: Instant) -> ! {
    error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
    eprintln!("{}", e);
    std::process::exit(e.exit_code());
}

/// Sets up output directory
/// If `out_dir` is specified from args, uses it;
/// otherwise, creates a directory named `<sample_base>_YYYYMMDD`.
/// Ensures the directory exists.
///
/// # Arguments
/// * `args` - The parsed command-line arguments.
/// * `cwd` - The current working directory.
/// # Returns
/// path to the output directory.
fn setup_output_dir(args: &Arguments, cwd: &Path) -> Result<PathBuf, PipelineError> {
    let out_dir = match &args.out_dir {
        Some(out) => absolute_path(Path::new(out), cwd),
        None => {
            let file1_path = absolute_path(Path::new(&args.file1), cwd);
            if !file1_path.exists() {
                return Err(PipelineError::Configuration(format!(
                    "Cannot find file 1 (-i): {}", file1_path.display()
                )));
            }
            let dir_base = args
                .output_prefix
                .clone()
                .unwrap_or_else(|| sample_base(&file1_path));

            let timestamp = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .ok()
                .and_then(|d| DateTime::from_timestamp(d.as_secs() as i64, 0))
                .map(|dt| dt.format("%Y%m%d").to_string())
                .unwrap_or_else(|| "19700101".to_string());
            cwd.join(format!("{}_{}", dir_base, timestamp))
        }
    };
    fs::create_dir_all(&out_dir)?;
    Ok(out_dir)
}
