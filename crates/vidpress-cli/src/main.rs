// crates/vidpress-cli/src/main.rs
//
// `vidpress`: compress one video from the terminal.
//
// The job runs on a CompressWorker thread; this thread only drains the
// worker's result channel, prints progress, and fires the cancel token when
// --cancel-after elapses. Exit status: 0 on success, 1 on failure, 130 when
// the job was cancelled.

mod report;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::{after, never, select};

use vidpress_core::{CompressOptions, CompressResult, QualityTier};
use vidpress_media::{probe, CompressJob, CompressWorker};

/// Compress a video to an H.264/AAC MP4 sized for upload.
#[derive(Parser, Debug)]
#[command(name = "vidpress")]
#[command(version, about)]
struct Cli {
    /// Input video file
    input: PathBuf,

    /// Quality tier: low, medium, high or original (stream copy)
    #[arg(short, long, default_value_t = QualityTier::default())]
    quality: QualityTier,

    /// JSON file with pipeline options (any subset of fields)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for the output file (overrides the config file)
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// Cancel the job after this many seconds
    #[arg(long, value_name = "SECS")]
    cancel_after: Option<f64>,

    /// Probe the input and print per-tier size estimates, then exit
    #[arg(long)]
    estimate: bool,

    /// Print machine-readable JSON instead of progress lines
    #[arg(long)]
    json: bool,

    /// Debug logging (same as RUST_LOG=debug)
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_millis()
        .init();

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e:#}");
            if cli.json {
                println!("{}", report::failure_json("usage", &format!("{e:#}")));
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<ExitCode> {
    let mut options = match &cli.config {
        Some(path) => CompressOptions::from_json_file(path)?,
        None => CompressOptions::default(),
    };
    if let Some(dir) = &cli.temp_dir {
        options.temp_dir = dir.clone();
    }

    if cli.estimate {
        let asset = probe::probe_source(&cli.input).context("probe input")?;
        report::print_estimates(&asset, cli.json);
        return Ok(ExitCode::SUCCESS);
    }

    let worker = CompressWorker::new();
    let (job_id, _token) = worker.start(CompressJob::new(&cli.input, cli.quality).with_options(options));
    log::debug!("[cli] started job {job_id}");

    let deadline = match cli.cancel_after {
        Some(secs) => after(Duration::from_secs_f64(secs.max(0.0))),
        None => never(),
    };

    loop {
        select! {
            recv(worker.rx) -> msg => {
                let msg = msg.context("worker result channel closed")?;
                match msg {
                    CompressResult::Progress { fraction, message, .. } => {
                        if !cli.json {
                            report::print_progress(fraction, &message);
                        }
                    }
                    CompressResult::Done { output, .. } => {
                        report::print_done(&output, cli.json);
                        return Ok(ExitCode::SUCCESS);
                    }
                    CompressResult::Error { error, .. } => {
                        report::print_error(&error, cli.json);
                        return Ok(if error.is_cancelled() { ExitCode::from(130) } else { ExitCode::FAILURE });
                    }
                }
            }
            recv(deadline) -> _ => {
                log::info!("[cli] --cancel-after elapsed, cancelling");
                worker.cancel(job_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_to_medium() {
        let cli = Cli::try_parse_from(["vidpress", "in.mov"]).unwrap();
        assert_eq!(cli.quality, QualityTier::Medium);
        assert!(!cli.json);
        assert!(cli.cancel_after.is_none());
    }

    #[test]
    fn parses_all_flags() {
        let cli = Cli::try_parse_from([
            "vidpress", "in.mov", "--quality", "original", "--cancel-after", "2.5", "--json", "-c", "opts.json",
        ])
        .unwrap();
        assert_eq!(cli.quality, QualityTier::Original);
        assert_eq!(cli.cancel_after, Some(2.5));
        assert_eq!(cli.config, Some(PathBuf::from("opts.json")));
        assert!(cli.json);
    }

    #[test]
    fn rejects_unknown_tier() {
        assert!(Cli::try_parse_from(["vidpress", "in.mov", "--quality", "ultra"]).is_err());
    }
}
