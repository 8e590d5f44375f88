//! Host-supplied configuration: a plain struct the host constructs,
//! validated once at [`crate::env::Environment::open`].

use std::time::Duration;

/// Recognized options.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bytes used by the store's page cache / LMDB map size.
    pub cache_size: usize,
    /// Seconds between background checkpoints.
    pub checkpoint_interval: Duration,
    /// Maximum time a caller waits to acquire the write lock before
    /// receiving [`crate::Error::LockTimeout`].
    pub lock_timeout: Duration,
    /// Minimum severity forwarded to the logging channel, as an integer in
    /// `0..=50`: 0 forwards everything, higher values forward only more
    /// severe records. [`LogLevel`] names the tier boundaries, so
    /// `LogLevel::Warn as u8` is a readable way to write `30`.
    pub log_level: u8,
    /// Maximum number of named databases a single `heed::Env` may hold.
    /// Each segment's `_metadata`/`_documents` stores and every field's
    /// `_field.{name}` store count against this.
    pub max_dbs: u32,
}

/// Named tiers of the numeric `0..=50` log-level scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace = 0,
    Debug = 10,
    Info = 20,
    Warn = 30,
    Error = 40,
}

impl LogLevel {
    /// The tier a raw `0..=50` level falls in.
    pub fn from_numeric(level: u8) -> LogLevel {
        match level {
            0..=9 => LogLevel::Trace,
            10..=19 => LogLevel::Debug,
            20..=29 => LogLevel::Info,
            30..=39 => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }

    pub(crate) fn to_tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            // A single segment rarely needs LMDB's default 1TiB map; a few
            // hundred MiB is a sane starting point that grows on resize.
            cache_size: 256 * 1024 * 1024,
            checkpoint_interval: Duration::from_secs(60),
            lock_timeout: Duration::from_micros(5_000_000),
            log_level: LogLevel::Info as u8,
            max_dbs: 4096,
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.cache_size == 0 {
            return Err(crate::Error::msg("cache_size must be non-zero"));
        }
        if self.max_dbs == 0 {
            return Err(crate::Error::msg("max_dbs must be non-zero"));
        }
        if self.log_level > 50 {
            return Err(crate::Error::msg("log_level must be within 0..=50"));
        }
        Ok(())
    }
}
