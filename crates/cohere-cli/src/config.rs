//! TOML configuration deserialisation for reconstruction jobs.

use cohere_core::losses::LossKind;
use cohere_optim::{OptimizerConfig, ReconstructionSettings};
use serde::Deserialize;

/// Top-level job configuration.
#[derive(Debug, Deserialize)]
pub struct JobConfig {
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub reconstruction: ReconstructionSettings,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Synthetic ptychography scan to simulate.
#[derive(Debug, Deserialize)]
pub struct SimulationConfig {
    /// Wavelength in metres.
    pub wavelength: f64,
    /// Sample-to-detector distance in metres.
    pub distance: f64,
    /// Detector pixel pitch in metres.
    pub pixel_pitch: f64,
    /// Detector shape in pixels (also the probe shape).
    #[serde(default = "default_pattern_size")]
    pub pattern_size: [usize; 2],
    /// Gaussian probe width as a fraction of the probe window.
    #[serde(default = "default_probe_width")]
    pub probe_width: f64,
    /// Peak-to-peak phase variation of the random object, in radians.
    #[serde(default = "default_phase_range")]
    pub phase_range: f64,
    #[serde(default)]
    pub seed: u64,
    pub scan: ScanSpec,
}

fn default_pattern_size() -> [usize; 2] {
    [32, 32]
}
fn default_probe_width() -> f64 {
    0.2
}
fn default_phase_range() -> f64 {
    1.0
}

/// Scan positions in probe-plane pixels: either a raster or an explicit list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ScanSpec {
    Grid { grid: [usize; 2], step: f64 },
    List { positions: Vec<[f64; 2]> },
}

impl ScanSpec {
    pub fn positions(&self) -> Vec<[f64; 2]> {
        match self {
            ScanSpec::Grid { grid, step } => (0..grid[0])
                .flat_map(|i| (0..grid[1]).map(move |j| [i as f64 * step, j as f64 * step]))
                .collect(),
            ScanSpec::List { positions } => positions.clone(),
        }
    }
}

/// How the reconstruction model is set up.
#[derive(Debug, Default, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub loss: LossKind,
    /// Start from the simulated probe and keep it fixed, fitting only the
    /// object. Otherwise the probe is initialized from the mean pattern.
    #[serde(default)]
    pub known_probe: bool,
}

/// Output configuration.
#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    /// Output directory (default: "./output").
    #[serde(default = "default_output_dir")]
    pub directory: String,
    /// Whether to save the loss history as CSV (default: true).
    #[serde(default = "default_true")]
    pub save_loss: bool,
    /// Whether to save the fitted parameters as JSON (default: true).
    #[serde(default = "default_true")]
    pub save_results: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_dir(),
            save_loss: true,
            save_results: true,
        }
    }
}

fn default_output_dir() -> String {
    "./output".into()
}
fn default_true() -> bool {
    true
}

/// Load and parse a TOML job configuration file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<JobConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> anyhow::Result<JobConfig> {
    let config: JobConfig = toml::from_str(content)?;
    Ok(config)
}
