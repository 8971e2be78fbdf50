//! Runtime-configurable tuning parameters for the proxy.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `TRIGON_`) or by constructing a custom `ProxyConfig`.

/// Tuning parameters for the trigger fifo and the proxy service loop.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Ring depth in slots. Powers of two keep the producer's index
    /// arithmetic cheap, but any non-zero depth works.
    pub fifo_size: usize,

    /// Dispatched triggers between forced tail publications. The counter
    /// guarantees forward progress for producers even when no trigger
    /// carries `SYNC`.
    pub flush_counter: u64,

    /// Poll iterations between run-state reads in the service loop.
    pub run_state_check_period: u32,

    /// Maximum proxies per communicator.
    pub max_proxies: usize,

    /// Spin budget before a stuck wait emits its jailbreak diagnostic.
    /// Negative disables the diagnostic entirely.
    pub max_spin_count: i64,

    /// Place the fifo slots and device tail in GPU-mapped host memory
    /// when the device supports it, instead of the pinned-host +
    /// async-copy fallback.
    pub gpu_direct: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            fifo_size: 128,
            flush_counter: 4,
            run_state_check_period: 100,
            max_proxies: 8,
            max_spin_count: 1_000_000,
            gpu_direct: false,
        }
    }
}

impl ProxyConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `TRIGON_FIFO_SIZE`
    /// - `TRIGON_FIFO_FLUSH_COUNTER`
    /// - `TRIGON_RUN_STATE_CHECK_PERIOD`
    /// - `TRIGON_MAX_PROXIES`
    /// - `TRIGON_MAX_SPIN_COUNT`
    /// - `TRIGON_GPU_DIRECT` (0/1)
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("TRIGON_FIFO_SIZE") {
            if let Ok(n) = v.parse::<usize>() {
                if n > 0 {
                    cfg.fifo_size = n;
                }
            }
        }
        if let Ok(v) = std::env::var("TRIGON_FIFO_FLUSH_COUNTER") {
            if let Ok(n) = v.parse::<u64>() {
                if n > 0 {
                    cfg.flush_counter = n;
                }
            }
        }
        if let Ok(v) = std::env::var("TRIGON_RUN_STATE_CHECK_PERIOD") {
            if let Ok(n) = v.parse::<u32>() {
                if n > 0 {
                    cfg.run_state_check_period = n;
                }
            }
        }
        if let Ok(v) = std::env::var("TRIGON_MAX_PROXIES") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.max_proxies = n;
            }
        }
        if let Ok(v) = std::env::var("TRIGON_MAX_SPIN_COUNT") {
            if let Ok(n) = v.parse::<i64>() {
                cfg.max_spin_count = n;
            }
        }
        if let Ok(v) = std::env::var("TRIGON_GPU_DIRECT") {
            cfg.gpu_direct = v == "1";
        }

        cfg
    }
}
