//! Benchmark and kernel configuration.
//!
//! The configuration file is keyed text with sections (TOML). `[benchmark]`
//! and `[kmeans]` select the run parameters and pipeline; each pipeline
//! stage has its own section carrying the target device, the kernel
//! strategy and the launch geometry.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub benchmark: BenchmarkConfig,
    pub kmeans: KmeansConfig,
    pub labeling: Option<KernelConfig>,
    pub mass_update: Option<KernelConfig>,
    pub centroid_update: Option<KernelConfig>,
    pub fused: Option<KernelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BenchmarkConfig {
    #[serde(default = "default_runs")]
    pub runs: u32,
    #[serde(default)]
    pub verify: bool,
}

impl Default for BenchmarkConfig {
    fn default() -> BenchmarkConfig {
        BenchmarkConfig { runs: default_runs(), verify: false }
    }
}

fn default_runs() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct KmeansConfig {
    pub pipeline: PipelineKind,
    pub iterations: u32,
    pub point_type: PointType,
    pub label_type: IntType,
    pub mass_type: IntType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum PipelineKind {
    #[serde(rename = "three_stage")]
    ThreeStage,
    #[serde(rename = "fused")]
    Fused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum PointType {
    #[serde(rename = "float")]
    Float,
    #[serde(rename = "double")]
    Double,
}

impl PointType {
    pub fn name(self) -> &'static str {
        match self {
            PointType::Float => "float",
            PointType::Double => "double",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum IntType {
    #[serde(rename = "uint32")]
    U32,
    #[serde(rename = "uint64")]
    U64,
}

impl IntType {
    pub fn name(self) -> &'static str {
        match self {
            IntType::U32 => "uint32",
            IntType::U64 => "uint64",
        }
    }
}

/// Launch parameters of one pipeline stage.
#[derive(Debug, Clone, Deserialize)]
pub struct KernelConfig {
    #[serde(default)]
    pub platform: usize,
    #[serde(default)]
    pub device: usize,
    pub strategy: String,
    #[serde(default = "default_global_size")]
    pub global_size: [usize; 3],
    #[serde(default = "default_local_size")]
    pub local_size: [usize; 3],
    #[serde(default = "default_vector_length")]
    pub vector_length: usize,
    #[serde(default = "default_one")]
    pub local_features: usize,
    #[serde(default = "default_one")]
    pub thread_features: usize,
}

impl KernelConfig {
    pub fn with_strategy(strategy: &str) -> KernelConfig {
        KernelConfig {
            platform: 0,
            device: 0,
            strategy: strategy.to_string(),
            global_size: default_global_size(),
            local_size: default_local_size(),
            vector_length: default_vector_length(),
            local_features: 1,
            thread_features: 1,
        }
    }
}

fn default_global_size() -> [usize; 3] {
    [1024, 1, 1]
}

fn default_local_size() -> [usize; 3] {
    [64, 1, 1]
}

fn default_vector_length() -> usize {
    4
}

fn default_one() -> usize {
    1
}

impl Config {
    pub fn from_str(text: &str) -> Result<Config> {
        let config: Config =
            toml::from_str(text).map_err(|e| Error::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
        let text = std::fs::read_to_string(path)?;
        Config::from_str(&text)
    }

    /// The kernel sections the selected pipeline requires, in stage order.
    pub fn stages(&self) -> Vec<&KernelConfig> {
        match self.kmeans.pipeline {
            PipelineKind::ThreeStage => [&self.labeling, &self.mass_update, &self.centroid_update]
                .iter()
                .filter_map(|s| s.as_ref())
                .collect(),
            PipelineKind::Fused => self.fused.iter().collect(),
        }
    }

    /// The `(platform, device)` every stage agreed on.
    pub fn stage_device(&self) -> (usize, usize) {
        let first = self.stages()[0];
        (first.platform, first.device)
    }

    fn validate(&self) -> Result<()> {
        let required: &[(&str, &Option<KernelConfig>)] = match self.kmeans.pipeline {
            PipelineKind::ThreeStage => &[
                ("labeling", &self.labeling),
                ("mass_update", &self.mass_update),
                ("centroid_update", &self.centroid_update),
            ],
            PipelineKind::Fused => &[("fused", &self.fused)],
        };

        let mut device = None;
        for (name, section) in required {
            let section = section
                .as_ref()
                .ok_or_else(|| Error::ConfigParse(format!("missing section `{}`", name)))?;
            if section.local_size[0] == 0 || section.global_size[0] == 0 {
                return Err(Error::ConfigParse(format!(
                    "section `{}`: global and local sizes must be non-zero",
                    name
                )));
            }
            if section.global_size[0] % section.local_size[0] != 0 {
                return Err(Error::ConfigParse(format!(
                    "section `{}`: local size {} does not divide global size {}",
                    name, section.local_size[0], section.global_size[0]
                )));
            }
            let this = (section.platform, section.device);
            match device {
                None => device = Some(this),
                Some(prev) if prev != this => {
                    return Err(Error::ConfigParse(
                        "all stages of one run must target the same platform and device".into(),
                    ))
                }
                _ => {}
            }
        }
        Ok(())
    }
}
