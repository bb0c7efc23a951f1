//! Benchmark front-end.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::info;

use kmeans_cl::benchmark::{BenchmarkParameters, ClusteringBenchmark};
use kmeans_cl::config::{Config, IntType, PipelineKind, PointType};
use kmeans_cl::error::{Error, Result};
use kmeans_cl::kernels::{ClLabel, ClMass, ClPoint};
use kmeans_cl::pipeline::{FusedPipeline, KmeansPipeline, ThreeStagePipeline};
use kmeans_cl::points::{read_points, PointElement};
use kmeans_cl::{Measurement, RunOutput};

#[derive(Debug, Parser)]
#[command(
    name = "kmeans-cl",
    about = "Buffered heterogeneous K-means clustering on OpenCL devices"
)]
struct Cli {
    /// Show additional information.
    #[arg(long)]
    verbose: bool,

    /// Number of benchmark runs (overrides the configuration file).
    #[arg(long)]
    runs: Option<u32>,

    /// Number of clusters.
    #[arg(long)]
    k: u32,

    /// Iteration limit (overrides the configuration file).
    #[arg(long)]
    iterations: Option<u32>,

    /// Verify the produced labels against the CPU reference.
    #[arg(long)]
    verify: bool,

    /// Write measurements to this CSV file.
    #[arg(long, value_name = "FILE")]
    csv: Option<PathBuf>,

    /// Configuration file.
    #[arg(long, value_name = "FILE")]
    config: PathBuf,

    /// Binary point file.
    input_file: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .init();

    match dispatch(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}: {}", err.category(), err);
            ExitCode::FAILURE
        }
    }
}

/// Instantiates the benchmark for the configured element-type triple.
fn dispatch(cli: &Cli) -> Result<()> {
    let mut config = Config::from_file(&cli.config)?;
    if let Some(runs) = cli.runs {
        config.benchmark.runs = runs;
    }
    if let Some(iterations) = cli.iterations {
        config.kmeans.iterations = iterations;
    }

    let km = &config.kmeans;
    match (km.point_type, km.label_type, km.mass_type) {
        (PointType::Float, IntType::U32, IntType::U32) => bench::<f32, u32, u32>(cli, &config),
        (PointType::Double, IntType::U64, IntType::U64) => bench::<f64, u64, u64>(cli, &config),
        (p, l, m) => Err(Error::TypeMismatch(format!(
            "({}, {}, {}) is not a supported type triple",
            p.name(),
            l.name(),
            m.name()
        ))),
    }
}

fn bench<P, L, M>(cli: &Cli, config: &Config) -> Result<()>
where
    P: ClPoint + PointElement,
    L: ClLabel,
    M: ClMass,
{
    let points = read_points::<P, _>(&cli.input_file)?;
    let k = cli.k as usize;
    info!(
        "loaded {} points with {} features from {}",
        points.rows(),
        points.cols(),
        cli.input_file.display()
    );

    let benchmark: ClusteringBenchmark<P, L, M> = ClusteringBenchmark::new(
        points,
        k,
        config.kmeans.iterations,
        config.benchmark.runs,
    );

    let mut pipeline: Box<dyn KmeansPipeline<P, L, M>> = match config.kmeans.pipeline {
        PipelineKind::ThreeStage => Box::new(ThreeStagePipeline::from_config(config, k)?),
        PipelineKind::Fused => Box::new(FusedPipeline::from_config(config, k)?),
    };

    if cli.verify || config.benchmark.verify {
        let mismatches = benchmark.verify(pipeline.as_mut())?;
        if mismatches == 0 {
            println!("Correct");
        } else {
            println!("{} incorrect labels", mismatches);
        }
        return Ok(());
    }

    let parameters = benchmark_parameters(&benchmark, config, k);
    let (measurements, outcome) = benchmark.run(pipeline.as_mut(), &parameters)?;

    report(&benchmark, &measurements, &outcome, cli.verbose);
    if let Some(csv) = &cli.csv {
        benchmark.to_csv(csv, &measurements, &parameters)?;
        info!("wrote {} measurement(s) to {}", measurements.len(), csv.display());
    }
    Ok(())
}

fn benchmark_parameters<P, L, M>(
    benchmark: &ClusteringBenchmark<P, L, M>,
    config: &Config,
    k: usize,
) -> BenchmarkParameters
where
    P: ClPoint + PointElement,
    L: ClLabel,
    M: ClMass,
{
    let (platform_idx, device_idx) = config.stage_device();
    let platform = ocl::Platform::list().get(platform_idx).map_or_else(
        || format!("platform {}", platform_idx),
        |p| p.name().unwrap_or_else(|_| format!("platform {}", platform_idx)),
    );
    let device = ocl::Platform::list()
        .get(platform_idx)
        .and_then(|p| ocl::Device::list_all(*p).ok())
        .and_then(|devices| devices.get(device_idx).and_then(|d| d.name().ok()))
        .unwrap_or_else(|| format!("device {}", device_idx));

    BenchmarkParameters::new(
        platform,
        device,
        benchmark.points().cols(),
        benchmark.points().rows(),
        k,
        &config.kmeans,
    )
}

fn report<P, L, M>(
    benchmark: &ClusteringBenchmark<P, L, M>,
    measurements: &[Measurement],
    outcome: &RunOutput<P, L, M>,
    verbose: bool,
) where
    P: ClPoint + PointElement,
    L: ClLabel,
    M: ClMass,
{
    benchmark.print_times(measurements);
    if verbose {
        println!("iterations used: {}", outcome.iterations);
        println!("masses: {:?}", outcome.masses);
    }
}
