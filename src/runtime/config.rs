use crate::driver::device::DEFAULT_DEVICE_PATH;
use crate::driver::sim::SimConfig;
use crate::error::{CxlError, CxlResult};
use crate::runtime::command::WaitPolicy;
use crate::runtime::memory::DEFAULT_ALIGNMENT;
use crate::utils::is_valid_alignment;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default mapping size, matching the simulator's 1 GiB window.
pub const DEFAULT_REGION_SIZE: usize = 1 << 30;

/// Runtime settings.
///
/// `from_env` starts from the defaults and applies any of these overrides:
///
/// | Variable | Field |
/// |---|---|
/// | `CXL_DEVICE_PATH` | `device_path` |
/// | `CXL_REGION_SIZE` | `region_size` (bytes; `0x` hex and `K`/`M`/`G` suffixes accepted) |
/// | `CXL_DEFAULT_ALIGN` | `default_align` |
/// | `CXL_WAIT_TIMEOUT_MS` | `wait.timeout` |
/// | `CXL_SIM_LATENCY_US` | `sim.latency` |
#[derive(Debug, Clone)]
pub struct CxlConfig {
    pub device_path: PathBuf,
    pub region_size: usize,
    pub default_align: usize,
    pub wait: WaitPolicy,
    pub sim: SimConfig,
}

impl Default for CxlConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from(DEFAULT_DEVICE_PATH),
            region_size: DEFAULT_REGION_SIZE,
            default_align: DEFAULT_ALIGNMENT,
            wait: WaitPolicy::default(),
            sim: SimConfig::default(),
        }
    }
}

impl CxlConfig {
    /// Defaults overridden from the process environment.
    ///
    /// # Errors
    /// `InvalidArgument` naming the variable whose value cannot be used.
    pub fn from_env() -> CxlResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> CxlResult<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup("CXL_DEVICE_PATH") {
            config.device_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup("CXL_REGION_SIZE") {
            config.region_size = parse_size("CXL_REGION_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("CXL_DEFAULT_ALIGN") {
            config.default_align = parse_size("CXL_DEFAULT_ALIGN", &raw)?;
        }
        if let Some(raw) = lookup("CXL_WAIT_TIMEOUT_MS") {
            config.wait.timeout = Duration::from_millis(parse_u64("CXL_WAIT_TIMEOUT_MS", &raw)?);
        }
        if let Some(raw) = lookup("CXL_SIM_LATENCY_US") {
            config.sim.latency = Duration::from_micros(parse_u64("CXL_SIM_LATENCY_US", &raw)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// `InvalidArgument` for a zero region size, a bad alignment or inverted backoff bounds.
    pub fn validate(&self) -> CxlResult<()> {
        if self.region_size == 0 {
            return Err(CxlError::InvalidArgument(
                "region size must be non-zero".into(),
            ));
        }
        if !is_valid_alignment(self.default_align) {
            return Err(CxlError::InvalidArgument(format!(
                "default alignment {} is not a power of two",
                self.default_align
            )));
        }
        if self.wait.initial_backoff > self.wait.max_backoff {
            return Err(CxlError::InvalidArgument(format!(
                "initial backoff {:?} exceeds max backoff {:?}",
                self.wait.initial_backoff, self.wait.max_backoff
            )));
        }
        Ok(())
    }
}

fn parse_u64(var: &str, raw: &str) -> CxlResult<u64> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse::<u64>(),
    };
    parsed.map_err(|e| CxlError::InvalidArgument(format!("{var}={raw:?}: {e}")))
}

fn parse_size(var: &str, raw: &str) -> CxlResult<usize> {
    let raw = raw.trim();
    let (digits, shift) = match raw.chars().last() {
        Some('k' | 'K') => (&raw[..raw.len() - 1], 10),
        Some('m' | 'M') => (&raw[..raw.len() - 1], 20),
        Some('g' | 'G') => (&raw[..raw.len() - 1], 30),
        _ => (raw, 0),
    };

    let value = parse_u64(var, digits)?;
    value
        .checked_mul(1u64 << shift)
        .and_then(|v| usize::try_from(v).ok())
        .ok_or_else(|| CxlError::InvalidArgument(format!("{var}={raw:?} is too large")))
}
