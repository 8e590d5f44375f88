//! The transaction tree.
//!
//! heed does not expose LMDB's native nested write transactions, so the
//! tree is built entirely at this layer on top of a single `heed::RwTxn`
//! shared (via `Rc<RefCell<_>>`) by the root and every descendant. Only the
//! root's `commit`/`abort` ever touches the underlying transaction; every
//! other node just buffers its writes in an in-memory overlay
//! (`OverlayMap`) that is merged into its parent on commit and discarded
//! on abort.
//!
//! A `Transaction` is thread-confined: it is `!Send` by construction (`Rc`
//! throughout) and additionally records its owner thread so misuse surfaces
//! as a typed error rather than a hang.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use heed::types::Bytes;

use crate::error::{Error, Result};

pub(crate) type OverlayKey = (String, Vec<u8>);
pub(crate) type OverlayMap = BTreeMap<OverlayKey, Option<Vec<u8>>>;
pub(crate) type StoreHandle = heed::Database<Bytes, Bytes>;

/// The environment's single-writer slot. LMDB is single-writer by
/// construction and blocks forever rather than detecting contention, so the
/// two recoverable error categories the host is promised — `LockTimeout`
/// for a slot that stays busy, `Deadlock` for a thread trying to acquire a
/// slot it already holds — are produced here, before LMDB is ever asked for
/// a write transaction.
pub(crate) struct WriteLock {
    slot: parking_lot::Mutex<()>,
    holder: parking_lot::Mutex<Option<ThreadId>>,
}

impl WriteLock {
    pub(crate) fn new() -> WriteLock {
        WriteLock { slot: parking_lot::Mutex::new(()), holder: parking_lot::Mutex::new(None) }
    }

    fn acquire(&self, timeout: Duration) -> Result<()> {
        let current = std::thread::current().id();
        if *self.holder.lock() == Some(current) {
            // Waiting on a slot this thread already holds can never make
            // forward progress; the only deadlock topology a single-writer
            // engine can produce.
            return Err(Error::Deadlock);
        }
        match self.slot.try_lock_for(timeout) {
            Some(guard) => {
                std::mem::forget(guard);
                *self.holder.lock() = Some(current);
                Ok(())
            }
            None => Err(Error::LockTimeout(timeout)),
        }
    }

    fn release(&self) {
        *self.holder.lock() = None;
        // `force_unlock` is parking_lot's API for releasing a lock whose
        // `MutexGuard` was forgotten at acquisition; the guard cannot be
        // stored here because it would borrow the mutex it guards.
        unsafe { self.slot.force_unlock() };
    }
}

/// Held only by the root node; releases the writer slot when the root
/// commits, aborts, or drops.
struct TxnGuard {
    lock: Arc<WriteLock>,
}

impl Drop for TxnGuard {
    fn drop(&mut self) {
        self.lock.release();
    }
}

pub(crate) struct Inner<'env> {
    /// `None` once the root has committed or aborted the real transaction.
    rw: Rc<RefCell<Option<heed::RwTxn<'env>>>>,
    /// Store-name to `heed::Database` handles, shared by the whole tree so
    /// the root's `commit` can apply buffered writes without every caller
    /// threading handles through again. Filled lazily by `put`/`delete`.
    registry: Rc<RefCell<HashMap<String, StoreHandle>>>,
    parent: Option<Transaction<'env>>,
    /// Weak, so a child handle dropped by the caller does not keep the
    /// subtree alive; pruned on every leaf check.
    children: RefCell<Vec<Weak<Inner<'env>>>>,
    overlay: RefCell<OverlayMap>,
    owner_thread: ThreadId,
    finished: RefCell<bool>,
    _guard: Option<TxnGuard>,
}

/// A node in a transaction tree.
///
/// Cheaply cloneable (an `Rc` handle to shared state); clones refer to the
/// same node, they do not create siblings.
#[derive(Clone)]
pub struct Transaction<'env> {
    inner: Rc<Inner<'env>>,
}

impl<'env> std::fmt::Debug for Transaction<'env> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").finish_non_exhaustive()
    }
}

impl<'env> Transaction<'env> {
    /// Begins a root transaction: acquires the environment's writer slot
    /// (bounded by `timeout`), then opens the real `heed::RwTxn`.
    pub(crate) fn new_root(
        env: &'env heed::Env,
        lock: Arc<WriteLock>,
        timeout: Duration,
    ) -> Result<Transaction<'env>> {
        lock.acquire(timeout)?;
        let guard = TxnGuard { lock };
        // On failure the guard releases the slot on the way out.
        let rw = env.write_txn()?;
        Ok(Transaction {
            inner: Rc::new(Inner {
                rw: Rc::new(RefCell::new(Some(rw))),
                registry: Rc::new(RefCell::new(HashMap::new())),
                parent: None,
                children: RefCell::new(Vec::new()),
                overlay: RefCell::new(BTreeMap::new()),
                owner_thread: std::thread::current().id(),
                finished: RefCell::new(false),
                _guard: Some(guard),
            }),
        })
    }

    /// Begins a child transaction nested under `self`.
    pub fn begin_child(&self) -> Result<Transaction<'env>> {
        self.check_owner()?;
        self.check_open()?;
        let child = Transaction {
            inner: Rc::new(Inner {
                rw: self.inner.rw.clone(),
                registry: self.inner.registry.clone(),
                parent: Some(self.clone()),
                children: RefCell::new(Vec::new()),
                overlay: RefCell::new(BTreeMap::new()),
                owner_thread: self.inner.owner_thread,
                finished: RefCell::new(false),
                _guard: None,
            }),
        };
        self.inner.children.borrow_mut().push(Rc::downgrade(&child.inner));
        Ok(child)
    }

    fn check_owner(&self) -> Result<()> {
        // A transaction handed to a different thread than the one that
        // began it can never make forward progress under the single-writer
        // model; treat it the same as a detected deadlock cycle.
        if std::thread::current().id() != self.inner.owner_thread {
            return Err(Error::Deadlock);
        }
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if *self.inner.finished.borrow() {
            return Err(Error::msg("transaction already committed or aborted"));
        }
        Ok(())
    }

    /// Whether any child of this node is still live and unterminated.
    fn has_live_children(&self) -> bool {
        let mut children = self.inner.children.borrow_mut();
        children.retain(|w| w.strong_count() > 0);
        !children.is_empty()
    }

    fn detach_from_parent(&self) {
        if let Some(parent) = &self.inner.parent {
            let self_ptr = Rc::as_ptr(&self.inner);
            parent.inner.children.borrow_mut().retain(|w| !std::ptr::eq(w.as_ptr(), self_ptr));
        }
    }

    /// Commits this node. Forbidden on a non-leaf node: the child list must
    /// be empty, every child committed or aborted first.
    pub fn commit(&self) -> Result<()> {
        self.check_owner()?;
        self.check_open()?;
        if self.has_live_children() {
            return Err(Error::msg("cannot commit a transaction with open child transactions"));
        }
        *self.inner.finished.borrow_mut() = true;
        self.detach_from_parent();

        match &self.inner.parent {
            Some(parent) => {
                // Merge this node's overlay into the parent's; self wins on
                // key collision (it is the more recent write).
                let mut parent_overlay = parent.inner.overlay.borrow_mut();
                for (k, v) in std::mem::take(&mut *self.inner.overlay.borrow_mut()) {
                    parent_overlay.insert(k, v);
                }
                Ok(())
            }
            None => {
                // Root: flush the fully-merged overlay into the real
                // transaction, then commit it.
                {
                    let overlay = self.inner.overlay.borrow();
                    let registry = self.inner.registry.borrow();
                    let mut rw = self.inner.rw.borrow_mut();
                    let rw = rw
                        .as_mut()
                        .ok_or_else(|| Error::msg("transaction already committed or aborted"))?;
                    for ((store, key), value) in overlay.iter() {
                        let handle = registry.get(store).ok_or_else(|| {
                            Error::msg(format!("no store handle registered for '{store}'"))
                        })?;
                        match value {
                            Some(v) => handle.put(rw, key, v)?,
                            None => {
                                handle.delete(rw, key)?;
                            }
                        }
                    }
                }
                let rw = self
                    .inner
                    .rw
                    .borrow_mut()
                    .take()
                    .ok_or_else(|| Error::msg("transaction already committed or aborted"))?;
                Ok(rw.commit()?)
            }
        }
    }

    /// Aborts this node, discarding its buffered writes.
    pub fn abort(&self) -> Result<()> {
        self.check_owner()?;
        self.check_open()?;
        if self.has_live_children() {
            return Err(Error::msg("cannot abort a transaction with open child transactions"));
        }
        *self.inner.finished.borrow_mut() = true;
        self.detach_from_parent();
        self.inner.overlay.borrow_mut().clear();

        if self.inner.parent.is_none() {
            if let Some(rw) = self.inner.rw.borrow_mut().take() {
                rw.abort();
            }
        }
        Ok(())
    }

    /// Runs `f` against the underlying read view of this transaction tree.
    pub(crate) fn with_read<R>(&self, f: impl FnOnce(&heed::RoTxn<'env>) -> Result<R>) -> Result<R> {
        self.check_owner()?;
        let guard = self.inner.rw.borrow();
        let rw = guard
            .as_ref()
            .ok_or_else(|| Error::msg("transaction already committed or aborted"))?;
        f(rw)
    }

    /// Runs `f` against the underlying write transaction directly. Reserved
    /// for DDL-like steps (store creation, store teardown) that LMDB cannot
    /// express as buffered key writes.
    pub(crate) fn with_write<R>(
        &self,
        f: impl FnOnce(&mut heed::RwTxn<'env>) -> Result<R>,
    ) -> Result<R> {
        self.check_owner()?;
        self.check_open()?;
        let mut guard = self.inner.rw.borrow_mut();
        let rw = guard
            .as_mut()
            .ok_or_else(|| Error::msg("transaction already committed or aborted"))?;
        f(rw)
    }

    fn register_store(&self, name: &str, handle: StoreHandle) {
        self.inner.registry.borrow_mut().entry(name.to_string()).or_insert(handle);
    }

    /// The overlay visible to this node: ancestors' entries overridden by
    /// this node's own, nearer layers winning.
    pub(crate) fn effective_overlay(&self, store: &str) -> BTreeMap<Vec<u8>, Option<Vec<u8>>> {
        let mut chain = Vec::new();
        let mut cur = Some(self.clone());
        while let Some(node) = cur {
            chain.push(node.clone());
            cur = node.inner.parent.clone();
        }
        let mut merged = BTreeMap::new();
        for node in chain.into_iter().rev() {
            for ((s, k), v) in node.inner.overlay.borrow().iter() {
                if s == store {
                    merged.insert(k.clone(), v.clone());
                }
            }
        }
        merged
    }

    fn read_overlay(&self, store: &str, key: &[u8]) -> Option<Option<Vec<u8>>> {
        let mut cur = Some(self.clone());
        while let Some(node) = cur {
            if let Some(v) = node.inner.overlay.borrow().get(&(store.to_string(), key.to_vec())) {
                return Some(v.clone());
            }
            cur = node.inner.parent.clone();
        }
        None
    }

    /// Drops every buffered write against `store` from this node and its
    /// ancestors. Used when a store is physically torn down mid-transaction
    /// so the root's commit does not resurrect keys into it.
    pub(crate) fn purge_store_writes(&self, store: &str) {
        let mut cur = Some(self.clone());
        while let Some(node) = cur {
            node.inner.overlay.borrow_mut().retain(|(s, _), _| s != store);
            cur = node.inner.parent.clone();
        }
    }

    /// Reads `key` from `store`, honoring any buffered write visible to
    /// this node before falling through to the committed state.
    pub(crate) fn get(&self, store: &str, handle: &StoreHandle, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_owner()?;
        if let Some(overlaid) = self.read_overlay(store, key) {
            return Ok(overlaid);
        }
        self.with_read(|rtxn| Ok(handle.get(rtxn, key)?.map(|v| v.to_vec())))
    }

    pub(crate) fn put(&self, store: &str, handle: &StoreHandle, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_owner()?;
        self.check_open()?;
        self.register_store(store, *handle);
        self.inner.overlay.borrow_mut().insert((store.to_string(), key.to_vec()), Some(value.to_vec()));
        Ok(())
    }

    pub(crate) fn delete(&self, store: &str, handle: &StoreHandle, key: &[u8]) -> Result<bool> {
        self.check_owner()?;
        self.check_open()?;
        self.register_store(store, *handle);
        let existed = self.get(store, handle, key)?.is_some();
        self.inner.overlay.borrow_mut().insert((store.to_string(), key.to_vec()), None);
        Ok(existed)
    }
}

impl<'env> Drop for Inner<'env> {
    fn drop(&mut self) {
        if *self.finished.borrow() {
            return;
        }
        match &self.parent {
            None => {
                tracing::warn!(
                    target: "logdex_core::txn",
                    "transaction dropped without commit or abort; aborting"
                );
                if let Some(rw) = self.rw.borrow_mut().take() {
                    rw.abort();
                }
            }
            Some(parent) => {
                tracing::warn!(
                    target: "logdex_core::txn",
                    "child transaction dropped without commit or abort; discarding writes"
                );
                let self_ptr: *const Inner<'env> = self;
                parent.inner.children.borrow_mut().retain(|w| !std::ptr::eq(w.as_ptr(), self_ptr));
            }
        }
    }
}
