//! The environment — the single `heed::Env` an on-disk log-indexing
//! store lives in, plus the ambient machinery (write lock, log channel,
//! checkpoint worker) every index and segment inside it shares.
//!
//! Opening one builds `heed::EnvOpenOptions`, calls
//! `unsafe { options.open(path) }`, then hands the `Env` out to callers by
//! value (it is a cheap `Arc`-backed clone).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{Config, LogLevel};
use crate::error::{Error, Result};
use crate::index::Index;
use crate::logging::{self, ChannelLayer, LogReader};
use crate::txn::{Transaction, WriteLock};

/// An open store root. Dropping it without calling [`Environment::close`]
/// still stops the background checkpoint thread; `close` additionally
/// verifies quiescence and flushes.
pub struct Environment {
    env: heed::Env,
    path: PathBuf,
    config: Config,
    write_lock: Arc<WriteLock>,
    log_reader: LogReader,
    indices: Mutex<HashMap<String, Arc<Index>>>,
    checkpoint_stop: Option<crossbeam_channel::Sender<()>>,
    checkpoint_thread: Option<std::thread::JoinHandle<()>>,
}

impl Environment {
    /// Opens (creating if necessary) the store rooted at `path`.
    ///
    /// Installs the `tracing_subscriber::Layer` that forwards internal log
    /// records to the channel [`Environment::log_reader`] hands back, then
    /// spawns the checkpoint worker.
    pub fn open(path: impl AsRef<Path>, config: Config) -> Result<Environment> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        let (sink, log_reader) = logging::channel();
        let min_level = LogLevel::from_numeric(config.log_level).to_tracing_level();
        let layer = ChannelLayer::new(sink, min_level);
        // Installing a global subscriber twice panics; a host embedding more
        // than one Environment in the same process is expected to install
        // its own subscriber. Ignore the "already set" case.
        let _ = tracing_subscriber::registry().with(layer).try_init();

        let mut options = heed::EnvOpenOptions::new();
        options.map_size(config.cache_size);
        options.max_dbs(config.max_dbs);
        let env = unsafe { options.open(&path) }?;

        let write_lock = Arc::new(WriteLock::new());
        let (checkpoint_stop, checkpoint_thread) =
            spawn_checkpoint_worker(env.clone(), config.checkpoint_interval);

        tracing::info!(target: "logdex_core::env", path = %path.display(), "environment opened");
        Ok(Environment {
            env,
            path,
            config,
            write_lock,
            log_reader,
            indices: Mutex::new(HashMap::new()),
            checkpoint_stop: Some(checkpoint_stop),
            checkpoint_thread: Some(checkpoint_thread),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The read end of the log channel. Clonable; every clone observes the
    /// same stream of lines.
    pub fn log_reader(&self) -> LogReader {
        self.log_reader.clone()
    }

    /// Begins a new root transaction, waiting up to `config.lock_timeout`
    /// for the environment's single writer slot.
    pub fn begin_txn(&self) -> Result<Transaction<'_>> {
        Transaction::new_root(&self.env, self.write_lock.clone(), self.config.lock_timeout)
    }

    /// Opens (creating if necessary) the named index, caching the handle
    /// for subsequent calls within this environment's lifetime.
    pub fn open_index(&self, txn: &Transaction<'_>, name: &str) -> Result<Arc<Index>> {
        if let Some(existing) = self.indices.lock().get(name) {
            return Ok(existing.clone());
        }
        let index = Arc::new(Index::open_or_create(
            self.env.clone(),
            self.write_lock.clone(),
            self.config.lock_timeout,
            txn,
            name,
        )?);
        self.indices.lock().insert(name.to_string(), index.clone());
        Ok(index)
    }

    /// Closes the environment: verifies no index handle this environment
    /// handed out is still alive elsewhere, stops the checkpoint worker,
    /// and flushes dirty pages one last time.
    pub fn close(mut self) -> Result<()> {
        for (name, index) in self.indices.lock().iter() {
            if Arc::strong_count(index) > 1 {
                return Err(Error::msg(format!(
                    "cannot close environment: index '{name}' is still open"
                )));
            }
        }
        if let Some(stop) = self.checkpoint_stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.checkpoint_thread.take() {
            let _ = handle.join();
        }
        self.env.force_sync()?;
        tracing::info!(target: "logdex_core::env", path = %self.path.display(), "environment closed");
        Ok(())
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if let Some(stop) = self.checkpoint_stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.checkpoint_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Periodically forces a durability checkpoint of the environment. The
/// worker wakes on either its timer tick or the stop signal, whichever
/// comes first.
fn spawn_checkpoint_worker(
    env: heed::Env,
    interval: Duration,
) -> (crossbeam_channel::Sender<()>, std::thread::JoinHandle<()>) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let handle = std::thread::spawn(move || loop {
        match rx.recv_timeout(interval) {
            Ok(()) => break,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if let Err(e) = env.force_sync() {
                    tracing::warn!(target: "logdex_core::env", error = %e, "checkpoint sync failed");
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    });
    (tx, handle)
}
