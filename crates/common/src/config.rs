//! Run and model configuration.
//!
//! [`TrainConfig`] is built once at startup (from CLI flags) and handed to every
//! component by reference. [`ModelConfig`] is serialised as JSON next to the
//! weights so a sampling runtime can rebuild the exact network.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use candle_core::Device;
use serde::{Deserialize, Serialize};

// ── Dataset ─────────────────────────────────────────────────────────────────

/// Image datasets the data provider knows how to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Mnist,
    Cifar10,
}

impl DatasetKind {
    /// Name used in output file names (`ct_{name}.safetensors`).
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mnist => "mnist",
            Self::Cifar10 => "cifar10",
        }
    }

    /// Grayscale for mnist, RGB for everything else.
    pub fn channels(&self) -> usize {
        match self {
            Self::Mnist => 1,
            _ => 3,
        }
    }

    /// Random horizontal flips are only meaningful for natural images.
    pub fn hflip(&self) -> bool {
        matches!(self, Self::Cifar10)
    }
}

impl FromStr for DatasetKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mnist" => Ok(Self::Mnist),
            "cifar10" | "cifar" | "cifar-10" => Ok(Self::Cifar10),
            other => anyhow::bail!("unknown dataset '{other}' (expected mnist or cifar10)"),
        }
    }
}

// ── Device ──────────────────────────────────────────────────────────────────

/// Compute device selection. `Auto` picks CUDA device 0 when available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceChoice {
    Auto,
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceChoice {
    pub fn resolve(&self) -> candle_core::Result<Device> {
        match *self {
            Self::Auto => Device::cuda_if_available(0),
            Self::Cpu => Ok(Device::Cpu),
            Self::Cuda(ordinal) => Device::new_cuda(ordinal),
            Self::Metal(ordinal) => Device::new_metal(ordinal),
        }
    }
}

impl FromStr for DeviceChoice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let s = s.to_ascii_lowercase();
        let (kind, ordinal) = match s.split_once(':') {
            Some((kind, ord)) => (kind.to_string(), ord.parse::<usize>()?),
            None => (s.clone(), 0),
        };
        match kind.as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda(ordinal)),
            "metal" => Ok(Self::Metal(ordinal)),
            _ => anyhow::bail!("unknown device '{s}' (expected auto, cpu, cuda[:N] or metal[:N])"),
        }
    }
}

impl std::fmt::Display for DeviceChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(i) => write!(f, "cuda:{i}"),
            Self::Metal(i) => write!(f, "metal:{i}"),
        }
    }
}

// ── Run configuration ───────────────────────────────────────────────────────

/// All options of a training run. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct TrainConfig {
    pub img_size: usize,
    pub batch_size: usize,
    /// Depth of the batch prefetch queue; 0 loads batches on the training thread.
    pub num_workers: usize,
    pub dataset: DatasetKind,
    /// Peak learning rate of the one-cycle schedule.
    pub lr: f64,
    pub n_epochs: usize,
    pub sample_every_n_epoch: usize,
    #[serde(serialize_with = "serialize_display")]
    pub device: DeviceChoice,
    /// Log metrics, sample galleries and model artifacts to a tracking run.
    pub track: bool,
    pub seed: u64,
    /// Local copy of the dataset; `None` downloads mnist from the hub.
    pub data_dir: Option<PathBuf>,
    pub sample_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub tracking_dir: PathBuf,
    pub project: String,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            img_size: 32,
            batch_size: 64,
            num_workers: 4,
            dataset: DatasetKind::Mnist,
            lr: 1e-3,
            n_epochs: 10,
            sample_every_n_epoch: 1,
            device: DeviceChoice::Auto,
            track: true,
            seed: 0,
            data_dir: None,
            sample_dir: PathBuf::from("contents"),
            checkpoint_dir: PathBuf::from("."),
            tracking_dir: PathBuf::from("runs"),
            project: "consistency-model".to_string(),
        }
    }
}

impl TrainConfig {
    /// Reject values the training loop cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.n_epochs == 0 {
            anyhow::bail!("n_epochs must be at least 1");
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be at least 1");
        }
        if self.img_size < 2 {
            anyhow::bail!("img_size must be at least 2, got {}", self.img_size);
        }
        if !(self.lr.is_finite() && self.lr >= 0.0) {
            anyhow::bail!("lr must be a finite non-negative number, got {}", self.lr);
        }
        Ok(())
    }

    /// Whether sample grids and weights are written after `epoch`.
    /// The last epoch always checkpoints.
    pub fn is_sample_epoch(&self, epoch: usize) -> bool {
        epoch == self.n_epochs
            || (self.sample_every_n_epoch > 0 && epoch % self.sample_every_n_epoch == 0)
    }

    pub fn sample_path(&self, steps: usize, epoch: usize) -> PathBuf {
        self.sample_dir.join(format!(
            "ct_{}_sample_{steps}step_{epoch}.png",
            self.dataset.name()
        ))
    }

    pub fn weights_path(&self) -> PathBuf {
        self.checkpoint_dir
            .join(format!("ct_{}.safetensors", self.dataset.name()))
    }

    pub fn model_config_path(&self) -> PathBuf {
        self.checkpoint_dir
            .join(format!("ct_{}.json", self.dataset.name()))
    }
}

fn serialize_display<T: std::fmt::Display, S: serde::Serializer>(
    value: &T,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

// ── Model configuration ─────────────────────────────────────────────────────

/// Hyper-parameters of the consistency network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Image channels (1 for mnist, 3 for cifar10).
    pub in_channels: usize,
    /// Width of the half-resolution level and of the time embedding.
    /// The full-resolution level uses half of it.
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,
    /// GroupNorm groups; must divide `hidden_dim / 2`.
    #[serde(default = "default_norm_groups")]
    pub norm_groups: usize,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    /// Smallest noise level ε; `f(x, ε) = x`.
    #[serde(default = "default_sigma_min")]
    pub sigma_min: f64,
    /// Data standard deviation σ_d of the skip/output scalings.
    #[serde(default = "default_sigma_data")]
    pub sigma_data: f64,
}

fn default_hidden_dim() -> usize {
    256
}
fn default_norm_groups() -> usize {
    8
}
fn default_dropout() -> f32 {
    0.1
}
fn default_sigma_min() -> f64 {
    0.002
}
fn default_sigma_data() -> f64 {
    0.5
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            hidden_dim: default_hidden_dim(),
            norm_groups: default_norm_groups(),
            dropout: default_dropout(),
            sigma_min: default_sigma_min(),
            sigma_data: default_sigma_data(),
        }
    }
}

impl ModelConfig {
    pub fn for_dataset(dataset: DatasetKind) -> Self {
        Self {
            in_channels: dataset.channels(),
            ..Default::default()
        }
    }

    /// Channels at full resolution.
    pub fn base_channels(&self) -> usize {
        self.hidden_dim / 2
    }

    /// Reject layouts the network cannot be built with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.in_channels == 0 {
            anyhow::bail!("in_channels must be at least 1");
        }
        if self.norm_groups == 0 {
            anyhow::bail!("norm_groups must be at least 1");
        }
        let base = self.base_channels();
        if base == 0 || base % self.norm_groups != 0 || self.hidden_dim % self.norm_groups != 0 {
            anyhow::bail!(
                "hidden_dim ({}) and hidden_dim / 2 ({base}) must be positive multiples of norm_groups ({})",
                self.hidden_dim,
                self.norm_groups,
            );
        }
        if !(0.0..1.0).contains(&self.dropout) {
            anyhow::bail!("dropout must lie in [0, 1), got {}", self.dropout);
        }
        if !(self.sigma_min > 0.0 && self.sigma_data > 0.0) {
            anyhow::bail!(
                "sigma_min ({}) and sigma_data ({}) must be positive",
                self.sigma_min,
                self.sigma_data
            );
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read model config {}", path.display()))?;
        let config: Self = serde_json::from_str(&json)?;
        config
            .validate()
            .with_context(|| format!("invalid model config {}", path.display()))?;
        Ok(config)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
