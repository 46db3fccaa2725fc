//! `cogchunk <input_directory> <output_root>`
//!
//! Chunks end up in `<output_root>/$NAME/chunk_<x>_<y>.tif`.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use cogchunk::{parse_band_list, Error, Pipeline, PipelineConfig, ResamplingMethod};

const EXIT_USAGE: u8 = 1;
const EXIT_JOB_FAILED: u8 = 2;
const EXIT_RUN_FAILED: u8 = 3;

#[derive(Debug, Parser)]
#[command(name = "cogchunk", version, about = "Cut large GeoTIFF tiles into sparse COG-style chunks")]
struct Cli {
    /// Directory holding the input rasters
    input_directory: PathBuf,

    /// Root under which the `NAME` output folder is created
    output_root: PathBuf,

    /// Output subfolder name
    #[arg(long, env = "NAME")]
    name: String,

    /// Input file extension
    #[arg(long, env = "EXTENSION", default_value = "tif")]
    extension: String,

    /// Chunk edge length in pixels
    #[arg(long, env = "CHUNK_SIZE", default_value_t = 65536)]
    chunk_size: usize,

    /// Number of parallel workers
    #[arg(long, env = "WORKERS", default_value_t = 2)]
    workers: usize,

    /// Overview resampling: nearest, bilinear or average
    #[arg(long, env = "RESAMPLING", default_value = "bilinear")]
    resampling: ResamplingMethod,

    #[arg(long, env = "OVERVIEW_COUNT", default_value_t = 8)]
    overview_count: usize,

    /// Edge length of the emptiness-probe thumbnail
    #[arg(long, env = "PROBE_RESOLUTION", default_value_t = 1024)]
    probe_resolution: usize,

    /// Internal tile size of the outputs (multiple of 16)
    #[arg(long, env = "BLOCK_SIZE", default_value_t = 512)]
    block_size: usize,

    /// EPSG code assigned to the outputs
    #[arg(long, env = "TARGET_EPSG", default_value_t = 6539)]
    target_epsg: u32,

    /// Comma-separated 1-based bands to keep
    #[arg(long, env = "BANDS", default_value = "1,2,3")]
    bands: String,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<(PathBuf, PipelineConfig)> {
        let bands = parse_band_list(&self.bands).context("parsing BANDS")?;
        let config = PipelineConfig::new(self.output_root.join(&self.name))
            .with_extension(self.extension)
            .with_chunk_size(self.chunk_size)
            .with_workers(self.workers)
            .with_resampling(self.resampling)
            .with_overview_count(self.overview_count)
            .with_probe_resolution(self.probe_resolution)
            .with_block_size(self.block_size)
            .with_target_epsg(self.target_epsg)
            .with_bands(bands);
        config.validate().context("validating configuration")?;
        Ok((self.input_directory, config))
    }
}

fn main() -> ExitCode {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            // Printing can only fail if stderr is gone
            let _ = e.print();
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let (input_dir, config) = match cli.into_config() {
        Ok(parts) => parts,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    match run(&input_dir, config) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(failure_code(&e))
        }
    }
}

/// A bad input directory is a usage error; anything else aborted the run.
fn failure_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<Error>() {
        Some(Error::Config(_)) => EXIT_USAGE,
        _ => EXIT_RUN_FAILED,
    }
}

fn run(input_dir: &Path, config: PipelineConfig) -> anyhow::Result<ExitCode> {
    info!(
        input = %input_dir.display(),
        output = %config.output_dir.display(),
        chunk_size = config.chunk_size,
        workers = config.workers,
        "Starting"
    );
    let summary = match Pipeline::new(config).run_directory(input_dir) {
        Ok(summary) => summary,
        Err(Error::MosaicBuild(reason)) => {
            warn!("{reason}");
            return Ok(ExitCode::SUCCESS);
        }
        Err(e) => return Err(e).with_context(|| format!("processing {}", input_dir.display())),
    };

    info!(
        total = summary.total,
        encoded = summary.encoded,
        skipped_empty = summary.skipped_empty,
        failed = summary.failed,
        skipped_sources = summary.skipped_sources.len(),
        "Run finished"
    );
    if summary.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        for failure in &summary.failures {
            error!(window = %failure.window, reason = %failure.reason, "Chunk failed");
        }
        Ok(ExitCode::from(EXIT_JOB_FAILED))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("cogchunk").chain(args.iter().copied()))
    }

    #[test]
    fn test_cli_maps_onto_config() {
        let cli = parse(&["in", "out", "--name", "site", "--workers", "4", "--bands", "3,2,1"]).unwrap();
        let (input, config) = cli.into_config().unwrap();
        assert_eq!(input, PathBuf::from("in"));
        assert_eq!(config.output_dir, PathBuf::from("out/site"));
        assert_eq!(config.workers, 4);
        assert_eq!(config.encode.bands, vec![3, 2, 1]);
    }

    #[test]
    fn test_bad_arguments_are_rejected() {
        assert!(parse(&["only-one", "--name", "site"]).is_err());
        assert!(parse(&["in", "out", "--name", "site", "--resampling", "cubic"]).is_err());
        let cli = parse(&["in", "out", "--name", "site", "--block-size", "500"]).unwrap();
        assert!(cli.into_config().is_err());
    }

    #[test]
    fn test_failure_codes_stay_apart() {
        let missing_dir = anyhow::Error::new(Error::Config("input directory does not exist: /x".into()))
            .context("processing /x");
        assert_eq!(failure_code(&missing_dir), EXIT_USAGE);

        let io = anyhow::Error::new(Error::Io(std::io::Error::other("read-only filesystem")))
            .context("processing /x");
        let code = failure_code(&io);
        assert_eq!(code, EXIT_RUN_FAILED);
        assert_ne!(code, EXIT_USAGE);
        assert_ne!(code, EXIT_JOB_FAILED);
    }
}
