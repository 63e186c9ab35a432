//! Configuration of a [`crate::PmemVfs`].
//!
//! Everything has a default matching the conventional deployment: an 8 KiB initial mapping,
//! doubling growth, a 32 KiB shared index and no locking. The location of the log and the shared
//! index, the medium and the locking mode can be overridden from the environment.
use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;

use pm_region::{GrowthPolicy, MediumDetect, RegionOptions};

/// Directory on persistent memory receiving log and shared index files.
pub const ENV_DIR: &str = "PMEM_VFS_DIR";
pub const ENV_INITIAL_CAPACITY: &str = "PMEM_VFS_INITIAL_CAPACITY";
/// `1` to treat every mapping as persistent memory, `0` to treat none as such.
pub const ENV_FORCE_PMEM: &str = "PMEM_IS_PMEM_FORCE";
pub const ENV_LOCKING: &str = "PMEM_VFS_LOCKING";

/// How file and shared index locks are implemented.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum LockingMode {
    /// Every lock request succeeds and nothing is excluded.
    ///
    /// Correct only while at most one connection uses a database at a time.
    #[default]
    Noop,
    /// Locks are tracked in a table keyed by path, shared by every handle of one provider.
    ///
    /// Connections of one process exclude each other. Other processes are not seen.
    InProcess,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VfsConfig {
    /// The name under which the provider registers.
    pub name: String,
    pub max_pathname: usize,
    /// Mapped capacity of new or empty files.
    pub initial_capacity: usize,
    /// Mapped capacity of a new shared index.
    pub shm_base_size: usize,
    pub growth_factor: usize,
    /// Alignment hint for the host engine.
    pub sector_size: u32,
    /// Place log and shared index files here, instead of next to the database.
    pub pm_dir: Option<PathBuf>,
    pub medium: MediumDetect,
    pub locking: LockingMode,
}

pub struct VfsConfigBuilder {
    config: VfsConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: invalid value {value:?}")]
    InvalidVar { var: &'static str, value: String },
    #[error("growth factor must be at least 2, got {0}")]
    GrowthFactor(usize),
    #[error("{0} must not be zero")]
    Zero(&'static str),
    #[error("unknown locking mode {0:?}, expected `noop` or `in-process`")]
    Locking(String),
}

impl VfsConfig {
    pub const DEFAULT_NAME: &'static str = "pmem";
    pub const DEFAULT_MAX_PATHNAME: usize = 512;
    pub const DEFAULT_INITIAL_CAPACITY: usize = RegionOptions::DEFAULT_INITIAL_CAPACITY;
    pub const DEFAULT_SHM_BASE_SIZE: usize = 1 << 15;
    pub const DEFAULT_SECTOR_SIZE: u32 = 4096;

    pub fn builder() -> VfsConfigBuilder {
        VfsConfigBuilder {
            config: VfsConfig::default(),
        }
    }

    /// The default configuration with overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var_os(var))
    }

    /// The default configuration with overrides from `lookup`, called with variable names.
    pub fn from_lookup(
        lookup: impl Fn(&'static str) -> Option<OsString>,
    ) -> Result<Self, ConfigError> {
        let mut config = VfsConfig::default();

        if let Some(dir) = lookup(ENV_DIR).filter(|dir| !dir.is_empty()) {
            config.pm_dir = Some(PathBuf::from(dir));
        }

        if let Some(value) = lookup(ENV_INITIAL_CAPACITY) {
            config.initial_capacity = parse_var(ENV_INITIAL_CAPACITY, value)?;
        }

        if let Some(value) = lookup(ENV_FORCE_PMEM) {
            config.medium = match value.to_str() {
                Some("1") => MediumDetect::Persistent,
                Some("0") => MediumDetect::Emulated,
                _ => return Err(invalid(ENV_FORCE_PMEM, value)),
            };
        }

        if let Some(value) = lookup(ENV_LOCKING) {
            config.locking = value
                .to_str()
                .ok_or_else(|| invalid(ENV_LOCKING, value.clone()))?
                .parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.growth_factor < GrowthPolicy::DEFAULT_FACTOR {
            return Err(ConfigError::GrowthFactor(self.growth_factor));
        }

        for (name, value) in [
            ("initial capacity", self.initial_capacity),
            ("shared index base size", self.shm_base_size),
            ("maximum path name length", self.max_pathname),
            ("sector size", self.sector_size as usize),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        if self.name.is_empty() {
            return Err(ConfigError::Zero("name length"));
        }

        Ok(())
    }

    pub fn growth(&self) -> Result<GrowthPolicy, ConfigError> {
        GrowthPolicy::new(self.growth_factor)
            .map_err(|_| ConfigError::GrowthFactor(self.growth_factor))
    }
}

impl Default for VfsConfig {
    fn default() -> Self {
        VfsConfig {
            name: Self::DEFAULT_NAME.to_owned(),
            max_pathname: Self::DEFAULT_MAX_PATHNAME,
            initial_capacity: Self::DEFAULT_INITIAL_CAPACITY,
            shm_base_size: Self::DEFAULT_SHM_BASE_SIZE,
            growth_factor: GrowthPolicy::DEFAULT_FACTOR,
            sector_size: Self::DEFAULT_SECTOR_SIZE,
            pm_dir: None,
            medium: MediumDetect::Detect,
            locking: LockingMode::Noop,
        }
    }
}

impl VfsConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn max_pathname(mut self, max_pathname: usize) -> Self {
        self.config.max_pathname = max_pathname;
        self
    }

    pub fn initial_capacity(mut self, initial_capacity: usize) -> Self {
        self.config.initial_capacity = initial_capacity;
        self
    }

    pub fn shm_base_size(mut self, shm_base_size: usize) -> Self {
        self.config.shm_base_size = shm_base_size;
        self
    }

    pub fn growth_factor(mut self, growth_factor: usize) -> Self {
        self.config.growth_factor = growth_factor;
        self
    }

    pub fn sector_size(mut self, sector_size: u32) -> Self {
        self.config.sector_size = sector_size;
        self
    }

    pub fn pm_dir(mut self, pm_dir: impl Into<PathBuf>) -> Self {
        self.config.pm_dir = Some(pm_dir.into());
        self
    }

    pub fn medium(mut self, medium: MediumDetect) -> Self {
        self.config.medium = medium;
        self
    }

    pub fn locking(mut self, locking: LockingMode) -> Self {
        self.config.locking = locking;
        self
    }

    pub fn build(self) -> Result<VfsConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl FromStr for LockingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "noop" | "none" => Ok(LockingMode::Noop),
            "in-process" | "process" => Ok(LockingMode::InProcess),
            other => Err(ConfigError::Locking(other.to_owned())),
        }
    }
}

fn invalid(var: &'static str, value: OsString) -> ConfigError {
    ConfigError::InvalidVar {
        var,
        value: value.to_string_lossy().into_owned(),
    }
}

fn parse_var<T: FromStr>(var: &'static str, value: OsString) -> Result<T, ConfigError> {
    value
        .to_str()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| invalid(var, value))
}
