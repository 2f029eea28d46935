//! Loader configuration and validation.

use crate::constants::{
    DEFAULT_MAX_FILE_SIZE, DEFAULT_MAX_IDLE_ITERS, DEFAULT_MIN_DISPATCH, DISPATCH_IMMEDIATE,
    MAX_QUEUE_DEPTH, MAX_REGION_SIZE, MAX_WORKERS, REGION_NAME_PREFIX,
};
use crate::error::{Error, Result};
use crate::layout::RegionLayout;

/// Configuration for one loader region.
///
/// Constructed with [`LoaderConfig::new`] and refined with the `with_*`
/// methods; every step validates, so a config that exists is usable.
///
/// ```no_run
/// use sluice::LoaderConfig;
///
/// let config = LoaderConfig::new(4, 256)?
///     .with_max_file_size(64 * 1024)?
///     .with_min_dispatch(32)
///     .with_max_idle_iters(1024);
/// # Ok::<(), sluice::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Number of worker contexts
    pub n_workers: u32,
    /// Slots per worker; bounds in-flight requests and ring sizes
    pub queue_depth: u32,
    /// Per-slot buffer capacity; larger files are truncated
    pub max_file_size: u64,
    /// Minimum staged reads before a batch submits;
    /// [`DISPATCH_IMMEDIATE`] disables batching
    pub min_dispatch: usize,
    /// Idle iterations before an undersized batch is flushed
    pub max_idle_iters: u32,
    /// Name of the shared region, of the form `/name`
    pub region_name: String,
    /// Pin the dispatch thread to this CPU, if set
    pub loader_cpu: Option<usize>,
}

impl LoaderConfig {
    /// Create a configuration with validated core geometry and defaults
    /// for everything else. The default region name is deterministic per
    /// process, so stale segments from a killed loader can be found and
    /// unlinked by the host.
    pub fn new(n_workers: u32, queue_depth: u32) -> Result<Self> {
        if n_workers == 0 || n_workers > MAX_WORKERS {
            return Err(Error::config(format!(
                "n_workers must be in [1, {MAX_WORKERS}], got {n_workers}"
            )));
        }
        if queue_depth == 0 || queue_depth > MAX_QUEUE_DEPTH {
            return Err(Error::config(format!(
                "queue_depth must be in [1, {MAX_QUEUE_DEPTH}], got {queue_depth}"
            )));
        }
        let config = Self {
            n_workers,
            queue_depth,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            min_dispatch: DEFAULT_MIN_DISPATCH,
            max_idle_iters: DEFAULT_MAX_IDLE_ITERS,
            region_name: format!("{REGION_NAME_PREFIX}-{}", std::process::id()),
            loader_cpu: None,
        };
        config.check_region_size()?;
        Ok(config)
    }

    /// Set the per-slot buffer capacity. Buffer starts stay page aligned
    /// regardless of the value; capacity itself is taken exactly.
    pub fn with_max_file_size(mut self, bytes: u64) -> Result<Self> {
        if bytes == 0 {
            return Err(Error::config("max_file_size must be greater than 0"));
        }
        // One slot is one read; the kernel read length is a u32.
        if bytes > u64::from(u32::MAX) {
            return Err(Error::config(format!(
                "max_file_size {bytes} exceeds the single-read limit of {} bytes",
                u32::MAX
            )));
        }
        self.max_file_size = bytes;
        self.check_region_size()?;
        Ok(self)
    }

    /// Set the minimum batch size. [`DISPATCH_IMMEDIATE`] submits every
    /// staged set on the iteration that staged it.
    pub fn with_min_dispatch(mut self, n: usize) -> Self {
        self.min_dispatch = n;
        self
    }

    /// Set the idle-iteration bound for flushing undersized batches.
    pub fn with_max_idle_iters(mut self, iters: u32) -> Self {
        self.max_idle_iters = iters;
        self
    }

    /// Override the region name. Needed when several loaders coexist in
    /// one process, or when workers attach by name from unrelated
    /// processes.
    pub fn with_region_name(mut self, name: impl Into<String>) -> Self {
        self.region_name = name.into();
        self
    }

    /// Pin the dispatch thread to `cpu` when the loop starts.
    pub fn with_loader_cpu(mut self, cpu: usize) -> Result<Self> {
        let available = num_cpus::get();
        if cpu >= available {
            return Err(Error::config(format!(
                "loader_cpu {cpu} out of range; {available} CPUs available"
            )));
        }
        self.loader_cpu = Some(cpu);
        Ok(self)
    }

    /// True when batching is disabled.
    pub fn dispatch_immediately(&self) -> bool {
        self.min_dispatch == DISPATCH_IMMEDIATE
    }

    /// The region layout this configuration produces.
    pub fn layout(&self) -> RegionLayout {
        RegionLayout::compute(self.n_workers, self.queue_depth, self.max_file_size)
    }

    fn check_region_size(&self) -> Result<()> {
        // Guard the layout arithmetic against absurd geometries before
        // usize math can wrap.
        let n_slots = u64::from(self.n_workers) * u64::from(self.queue_depth);
        let stride = self.max_file_size.saturating_add(4095) & !4095;
        let buffers = n_slots.checked_mul(stride);
        match buffers {
            Some(bytes) if bytes <= MAX_REGION_SIZE => Ok(()),
            _ => Err(Error::config(format!(
                "region would exceed {MAX_REGION_SIZE} bytes ({n_slots} slots of {} bytes)",
                self.max_file_size
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config() {
        let config = LoaderConfig::new(2, 64).unwrap();
        assert_eq!(config.n_workers, 2);
        assert_eq!(config.queue_depth, 64);
        assert_eq!(config.max_file_size, DEFAULT_MAX_FILE_SIZE);
        assert!(config.region_name.starts_with(REGION_NAME_PREFIX));
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(LoaderConfig::new(0, 64).is_err());
    }

    #[test]
    fn test_zero_queue_depth_rejected() {
        assert!(LoaderConfig::new(1, 0).is_err());
    }

    #[test]
    fn test_limits_rejected() {
        assert!(LoaderConfig::new(MAX_WORKERS + 1, 1).is_err());
        assert!(LoaderConfig::new(1, MAX_QUEUE_DEPTH + 1).is_err());
    }

    #[test]
    fn test_zero_file_size_rejected() {
        assert!(LoaderConfig::new(1, 1).unwrap().with_max_file_size(0).is_err());
    }

    #[test]
    fn test_oversized_region_rejected() {
        let err = LoaderConfig::new(256, 4096)
            .unwrap()
            .with_max_file_size(1 << 30);
        assert!(err.is_err());
    }

    #[test]
    fn test_dispatch_sentinel() {
        let config = LoaderConfig::new(1, 1)
            .unwrap()
            .with_min_dispatch(DISPATCH_IMMEDIATE);
        assert!(config.dispatch_immediately());
        assert!(!config.with_min_dispatch(8).dispatch_immediately());
    }

    #[test]
    fn test_loader_cpu_bounds() {
        let config = LoaderConfig::new(1, 1).unwrap();
        assert!(config.clone().with_loader_cpu(0).is_ok());
        assert!(config.with_loader_cpu(usize::MAX).is_err());
    }

    #[test]
    fn test_layout_matches_geometry() {
        let config = LoaderConfig::new(3, 7).unwrap().with_max_file_size(1024).unwrap();
        let layout = config.layout();
        assert_eq!(layout.n_slots(), 21);
        assert_eq!(layout.ring_cap, 8);
    }
}
