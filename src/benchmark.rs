//! The clustering benchmark harness.
//!
//! Drives a pipeline over the loaded point set for a configured number of
//! runs, optionally verifies the produced labels against the naive CPU
//! reference, and writes the collected measurement trees as CSV.

use std::path::Path;

use log::info;

use crate::config::KmeansConfig;
use crate::error::Result;
use crate::kernels::{ClLabel, ClMass, ClPoint};
use crate::matrix::Matrix;
use crate::measurement::Measurement;
use crate::naive;
use crate::pipeline::{KmeansPipeline, RunOutput};

/// Static parameters stamped onto every measurement.
#[derive(Debug, Clone, Default)]
pub struct BenchmarkParameters {
    pub platform: String,
    pub device: String,
    pub num_features: usize,
    pub num_points: usize,
    pub num_clusters: usize,
    pub point_type: &'static str,
    pub label_type: &'static str,
    pub mass_type: &'static str,
}

impl BenchmarkParameters {
    /// The element-type columns reuse the configuration vocabulary
    /// (`float`/`double`, `uint32`/`uint64`), matching the tags a config
    /// file selects them by.
    pub fn new(
        platform: String,
        device: String,
        num_features: usize,
        num_points: usize,
        num_clusters: usize,
        kmeans: &KmeansConfig,
    ) -> BenchmarkParameters {
        BenchmarkParameters {
            platform,
            device,
            num_features,
            num_points,
            num_clusters,
            point_type: kmeans.point_type.name(),
            label_type: kmeans.label_type.name(),
            mass_type: kmeans.mass_type.name(),
        }
    }
}

pub struct ClusteringBenchmark<P, L, M> {
    points: Matrix<P>,
    k: usize,
    max_iterations: u32,
    runs: u32,
    _marker: std::marker::PhantomData<(L, M)>,
}

impl<P: ClPoint, L: ClLabel, M: ClMass> ClusteringBenchmark<P, L, M> {
    pub fn new(points: Matrix<P>, k: usize, max_iterations: u32, runs: u32) -> Self {
        ClusteringBenchmark {
            points,
            k,
            max_iterations,
            runs: runs.max(1),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn points(&self) -> &Matrix<P> {
        &self.points
    }

    /// Runs the pipeline once and counts labels that differ from the naive
    /// CPU reference. Zero means the pipeline is label-exact.
    pub fn verify(&self, pipeline: &mut dyn KmeansPipeline<P, L, M>) -> Result<u64> {
        let reference = naive::lloyd::<P, L, M>(&self.points, self.k, self.max_iterations);

        let mut measurement = Measurement::new(0);
        let outcome = pipeline.run(&self.points, &mut measurement)?;

        let mismatches = reference
            .labels
            .iter()
            .zip(outcome.labels.iter())
            .filter(|(a, b)| a.to_usize() != b.to_usize())
            .count() as u64;

        info!(
            "verify: {} of {} labels differ from the reference ({} vs {} iterations)",
            mismatches,
            reference.labels.len(),
            outcome.iterations,
            reference.iterations
        );
        Ok(mismatches)
    }

    /// Runs the pipeline `runs` times, finalizing one measurement per run.
    pub fn run(
        &self,
        pipeline: &mut dyn KmeansPipeline<P, L, M>,
        parameters: &BenchmarkParameters,
    ) -> Result<(Vec<Measurement>, RunOutput<P, L, M>)> {
        let mut measurements = Vec::with_capacity(self.runs as usize);
        let mut last_outcome = None;

        for run in 0..self.runs {
            let mut measurement = Measurement::new(run);
            stamp(&mut measurement, parameters);

            let outcome = pipeline.run(&self.points, &mut measurement)?;
            measurement.finalize()?;

            info!(
                "run {}: {} iterations, {} data points",
                run,
                outcome.iterations,
                measurement.datapoints().len()
            );
            measurements.push(measurement);
            last_outcome = Some(outcome);
        }

        Ok((measurements, last_outcome.expect("at least one run")))
    }

    /// Prints one total-time line per run to stdout.
    pub fn print_times(&self, measurements: &[Measurement]) {
        for m in measurements {
            let total: u64 = m
                .datapoints()
                .iter()
                .filter(|dp| dp.name() == "TotalTime")
                .map(|dp| dp.value_sum())
                .sum();
            println!("run {}: {:.3} ms", m.run(), total as f64 / 1e6);
        }
    }

    /// Writes every measurement record as CSV:
    /// `name, run, iteration, start_ns, end_ns, duration_ns` followed by
    /// the benchmark parameter columns.
    pub fn to_csv<Q: AsRef<Path>>(
        &self,
        path: Q,
        measurements: &[Measurement],
        parameters: &BenchmarkParameters,
    ) -> Result<()> {
        let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;
        writer
            .write_record([
                "name",
                "run",
                "iteration",
                "start_ns",
                "end_ns",
                "duration_ns",
                "platform",
                "device",
                "num_features",
                "num_points",
                "num_clusters",
                "point_type",
                "label_type",
                "mass_type",
            ])
            .map_err(csv_error)?;

        for measurement in measurements {
            for record in measurement.records() {
                let row = vec![
                    record.name.clone(),
                    record.run.to_string(),
                    record.iteration.map(|i| i.to_string()).unwrap_or_default(),
                    record.start_ns.to_string(),
                    record.end_ns.to_string(),
                    record.duration_ns.to_string(),
                    parameters.platform.clone(),
                    parameters.device.clone(),
                    parameters.num_features.to_string(),
                    parameters.num_points.to_string(),
                    parameters.num_clusters.to_string(),
                    parameters.point_type.to_string(),
                    parameters.label_type.to_string(),
                    parameters.mass_type.to_string(),
                ];
                writer.write_record(&row).map_err(csv_error)?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}

fn stamp(measurement: &mut Measurement, parameters: &BenchmarkParameters) {
    measurement.set_parameter("platform", parameters.platform.clone());
    measurement.set_parameter("device", parameters.device.clone());
    measurement.set_parameter("num_features", parameters.num_features.to_string());
    measurement.set_parameter("num_points", parameters.num_points.to_string());
    measurement.set_parameter("num_clusters", parameters.num_clusters.to_string());
    measurement.set_parameter("point_type", parameters.point_type);
    measurement.set_parameter("label_type", parameters.label_type);
    measurement.set_parameter("mass_type", parameters.mass_type);
}

fn csv_error(err: csv::Error) -> crate::error::Error {
    match err.into_kind() {
        csv::ErrorKind::Io(io) => crate::error::Error::Io(io),
        other => crate::error::Error::InvalidArgument(format!("csv: {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IntType, PipelineKind, PointType};
    use crate::measurement::DataPoint;

    #[test]
    fn parameters_carry_the_config_type_vocabulary() {
        let kmeans = KmeansConfig {
            pipeline: PipelineKind::ThreeStage,
            iterations: 10,
            point_type: PointType::Double,
            label_type: IntType::U64,
            mass_type: IntType::U32,
        };
        let parameters =
            BenchmarkParameters::new("p".into(), "d".into(), 3, 100, 5, &kmeans);

        // The CSV columns must spell types the way the config tags do,
        // not the way the kernels do (`double` stays, but never `ulong`).
        assert_eq!(parameters.point_type, "double");
        assert_eq!(parameters.label_type, "uint64");
        assert_eq!(parameters.mass_type, "uint32");
        assert_eq!(parameters.num_features, 3);
        assert_eq!(parameters.num_points, 100);
        assert_eq!(parameters.num_clusters, 5);
    }

    #[test]
    fn csv_has_one_row_per_record_plus_header() {
        let bench: ClusteringBenchmark<f32, u32, u32> =
            ClusteringBenchmark::new(Matrix::from_vec(vec![0.0f32, 1.0], 2, 1), 1, 1, 1);

        let mut measurement = Measurement::new(0);
        let mut dp = DataPoint::with_iteration("Labeling", 0);
        dp.add_value(42);
        measurement.push(dp);
        let mut total = DataPoint::new("TotalTime");
        total.add_value(1000);
        measurement.push(total);

        let parameters = BenchmarkParameters {
            platform: "p".into(),
            device: "d".into(),
            num_features: 1,
            num_points: 2,
            num_clusters: 1,
            point_type: "float",
            label_type: "uint32",
            mass_type: "uint32",
        };

        let mut path = std::env::temp_dir();
        path.push(format!("kmeans-cl-bench-{}.csv", std::process::id()));
        bench.to_csv(&path, &[measurement], &parameters).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("name,run,iteration,start_ns"));
        assert!(lines[1].starts_with("Labeling,0,0,"));
        assert!(lines[2].starts_with("TotalTime,0,,0,1000,1000,"));
        std::fs::remove_file(&path).ok();
    }
}
