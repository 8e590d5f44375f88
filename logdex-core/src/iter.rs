//! The cursor/iteration engine.
//!
//! A single engine backs all four access patterns the rest of the crate
//! needs — full scan, prefix scan, seek-and-scan, and bounded scan — by
//! sharing one merge step between the transaction's buffered overlay and
//! the store's committed bytes, then letting the mode decide which keys
//! survive. Decoding is left to a caller-supplied callback, so each
//! logical store keeps its own key shape without the engine knowing any
//! of them.
//!
//! Resource release is eager rather than cursor-lived: each constructor
//! takes one pass over the store, bounded by mode, and materializes the
//! merged, sorted key/value pairs up front. This sidesteps tying a live
//! `heed` cursor's lifetime to the shared, `RefCell`-guarded `RwTxn` a
//! transaction tree hands out, at the cost of one extra copy of the
//! scanned range — acceptable at the per-segment, per-field store scale
//! this engine targets.

use std::ops::Bound;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::txn::{StoreHandle, Transaction};

/// The four access patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterMode {
    /// Every entry in the store.
    All,
    /// Every entry whose key starts with `prefix`.
    Range { prefix: Vec<u8> },
    /// Every entry whose key is `>= start`.
    From { start: Vec<u8> },
    /// Every entry whose key falls between `start` and `end`, inclusive on
    /// both sides. Byte-string comparison is Rust's native `&[u8]: Ord`,
    /// which already gives the "shorter of two same-prefixed strings sorts
    /// first" rule, so `end` being a strict prefix of a stored key excludes
    /// that key.
    Within { start: Vec<u8>, end: Vec<u8> },
}

/// A positioned, resettable cursor over one store, decoding raw bytes into
/// `V` on the way out.
///
/// Exhaustion is ordinary `None` from [`Iterator::next`] and leaves the
/// cursor restartable via [`Cursor::reset`]; an explicit [`Cursor::close`]
/// makes it permanently inert, after which every operation fails with an
/// "iterator closed" error (`next` records it in the slot drained by
/// [`Cursor::take_error`], since the `Iterator` trait has nowhere to put
/// it).
pub struct Cursor<V> {
    items: Vec<(Vec<u8>, Vec<u8>)>,
    pos: usize,
    mode: IterMode,
    decode: Box<dyn Fn(&[u8], &[u8]) -> Result<V>>,
    closed: bool,
    last_error: Option<Error>,
    /// Keeps the owning Segment/Index alive for as long as this cursor is;
    /// released on close or drop.
    keepalive: Option<Arc<dyn std::any::Any>>,
}

impl<V> Cursor<V> {
    pub(crate) fn open(
        txn: &Transaction<'_>,
        store_name: &str,
        handle: &StoreHandle,
        mode: IterMode,
        decode: impl Fn(&[u8], &[u8]) -> Result<V> + 'static,
        keepalive: Arc<dyn std::any::Any>,
    ) -> Result<Cursor<V>> {
        let items = materialize(txn, store_name, handle, &mode)?;
        Ok(Cursor {
            items,
            pos: 0,
            mode,
            decode: Box::new(decode),
            closed: false,
            last_error: None,
            keepalive: Some(keepalive),
        })
    }

    /// Repositions at the first entry whose key is `>= target` and returns
    /// its decoded value, leaving the cursor just past it so `next()`
    /// continues in order. `Ok(None)` is the out-of-range outcome — the
    /// target lands beyond the cursor's bounded range — distinct from an
    /// error, and parks the cursor at the end.
    pub fn skip(&mut self, target: &[u8]) -> Result<Option<V>> {
        if self.closed {
            return Err(Error::msg("iterator closed"));
        }
        self.pos = self.items.partition_point(|(k, _)| k.as_slice() < target);
        if self.pos >= self.items.len() {
            return Ok(None);
        }
        let (k, v) = &self.items[self.pos];
        self.pos += 1;
        match (self.decode)(k, v) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Rewinds to the first entry of the originally constructed range.
    pub fn reset(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::msg("iterator closed"));
        }
        self.pos = 0;
        Ok(())
    }

    /// Releases the cursor's materialized rows and its hold on the parent
    /// handle. Idempotent; also happens implicitly on drop.
    pub fn close(&mut self) {
        self.closed = true;
        self.items.clear();
        self.pos = 0;
        self.keepalive.take();
    }

    /// The most recent error raised by `next()`, distinct from ordinary
    /// end-of-range (iteration errors are reported out of band from "no
    /// more entries", the carry-the-error pattern of `std::io::Lines`).
    pub fn take_error(&mut self) -> Option<Error> {
        self.last_error.take()
    }

    pub fn mode(&self) -> &IterMode {
        &self.mode
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<V> Iterator for Cursor<V> {
    type Item = V;

    fn next(&mut self) -> Option<V> {
        if self.closed {
            self.last_error = Some(Error::msg("iterator closed"));
            return None;
        }
        if self.pos >= self.items.len() {
            return None;
        }
        let (k, v) = &self.items[self.pos];
        self.pos += 1;
        match (self.decode)(k, v) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!(target: "logdex_core::iter", error = %e, "decode failed, closing cursor");
                self.close();
                self.last_error = Some(e);
                None
            }
        }
    }
}

/// One bounded pass over the committed range, merged with the buffered
/// overlay visible to `txn` (overlay wins on collision; `None` entries are
/// tombstones suppressing a committed key).
fn materialize(
    txn: &Transaction<'_>,
    store_name: &str,
    handle: &StoreHandle,
    mode: &IterMode,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut raw: std::collections::BTreeMap<Vec<u8>, Vec<u8>> = txn.with_read(|rtxn| {
        let mut raw = std::collections::BTreeMap::new();
        match mode {
            IterMode::All => {
                for entry in handle.iter(rtxn)? {
                    let (k, v) = entry?;
                    raw.insert(k.to_vec(), v.to_vec());
                }
            }
            IterMode::Range { prefix } => {
                for entry in handle.prefix_iter(rtxn, prefix.as_slice())? {
                    let (k, v) = entry?;
                    raw.insert(k.to_vec(), v.to_vec());
                }
            }
            IterMode::From { start } => {
                let range: (Bound<&[u8]>, Bound<&[u8]>) =
                    (Bound::Included(start.as_slice()), Bound::Unbounded);
                for entry in handle.range(rtxn, &range)? {
                    let (k, v) = entry?;
                    raw.insert(k.to_vec(), v.to_vec());
                }
            }
            IterMode::Within { start, end } => {
                let range: (Bound<&[u8]>, Bound<&[u8]>) =
                    (Bound::Included(start.as_slice()), Bound::Included(end.as_slice()));
                for entry in handle.range(rtxn, &range)? {
                    let (k, v) = entry?;
                    raw.insert(k.to_vec(), v.to_vec());
                }
            }
        }
        Ok(raw)
    })?;

    for (k, v) in txn.effective_overlay(store_name) {
        match v {
            Some(bytes) => {
                if matches_mode(&k, mode) {
                    raw.insert(k, bytes);
                }
            }
            None => {
                raw.remove(&k);
            }
        }
    }

    Ok(raw.into_iter().collect())
}

fn matches_mode(key: &[u8], mode: &IterMode) -> bool {
    match mode {
        IterMode::All => true,
        IterMode::Range { prefix } => key.starts_with(prefix.as_slice()),
        IterMode::From { start } => key >= start.as_slice(),
        IterMode::Within { start, end } => key >= start.as_slice() && key <= end.as_slice(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::{Transaction, WriteLock};
    use heed::types::Bytes;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(1);

    /// Opens a fresh environment, seeds `store` with `entries` (empty
    /// values, only keys matter for these boundary cases), and commits.
    fn seeded_store(dir: &std::path::Path, entries: &[&str]) -> (heed::Env, String) {
        let mut options = heed::EnvOpenOptions::new();
        options.map_size(10 * 1024 * 1024);
        options.max_dbs(8);
        let env = unsafe { options.open(dir) }.unwrap();
        let store_name = "boundary".to_string();

        {
            let txn = Transaction::new_root(&env, Arc::new(WriteLock::new()), TIMEOUT).unwrap();
            let handle: StoreHandle = txn
                .with_write(|rw| {
                    Ok(env.database_options().types::<Bytes, Bytes>().name(&store_name).create(rw)?)
                })
                .unwrap();
            for key in entries {
                txn.put(&store_name, &handle, key.as_bytes(), b"").unwrap();
            }
            txn.commit().unwrap();
        }
        (env, store_name)
    }

    fn open_cursor<'a>(
        env: &'a heed::Env,
        store_name: &'a str,
        mode: IterMode,
    ) -> (Transaction<'a>, Cursor<String>) {
        let txn = Transaction::new_root(env, Arc::new(WriteLock::new()), TIMEOUT).unwrap();
        let handle: StoreHandle = txn
            .with_write(|rw| {
                Ok(env.database_options().types::<Bytes, Bytes>().name(store_name).create(rw)?)
            })
            .unwrap();
        let cursor = Cursor::open(
            &txn,
            store_name,
            &handle,
            mode,
            |k, _| Ok(String::from_utf8_lossy(k).into_owned()),
            Arc::new(()),
        )
        .unwrap();
        (txn, cursor)
    }

    #[test]
    fn range_prefix_yields_only_matching_keys_then_ends() {
        let dir = tempfile::TempDir::new().unwrap();
        let (env, store) = seeded_store(dir.path(), &["ab", "abc", "abcd", "abd"]);
        let (_txn, cursor) = open_cursor(&env, &store, IterMode::Range { prefix: b"abc".to_vec() });
        let collected: Vec<_> = cursor.collect();
        assert_eq!(collected, vec!["abc".to_string(), "abcd".to_string()]);
    }

    #[test]
    fn within_start_and_end_are_both_inclusive() {
        let dir = tempfile::TempDir::new().unwrap();
        let (env, store) = seeded_store(dir.path(), &["a", "b", "ba", "c", "d", "da", "e"]);
        let (_txn, cursor) =
            open_cursor(&env, &store, IterMode::Within { start: b"b".to_vec(), end: b"d".to_vec() });
        let collected: Vec<_> = cursor.collect();
        assert_eq!(collected, vec!["b", "ba", "c", "d"]);
    }

    #[test]
    fn from_start_yields_everything_at_or_after_it() {
        let dir = tempfile::TempDir::new().unwrap();
        let (env, store) = seeded_store(dir.path(), &["a", "n", "z"]);
        let (_txn, cursor) = open_cursor(&env, &store, IterMode::From { start: b"m".to_vec() });
        let collected: Vec<_> = cursor.collect();
        assert_eq!(collected, vec!["n", "z"]);
    }

    #[test]
    fn all_over_an_empty_store_ends_immediately_and_close_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let (env, store) = seeded_store(dir.path(), &[]);
        let (_txn, mut cursor) = open_cursor(&env, &store, IterMode::All);
        assert_eq!(cursor.next(), None);
        cursor.close();
        cursor.close();
    }

    #[test]
    fn skipping_past_a_prefix_ranges_end_is_out_of_range() {
        let dir = tempfile::TempDir::new().unwrap();
        let (env, store) = seeded_store(dir.path(), &["p1", "p2", "pa"]);
        let (_txn, mut cursor) = open_cursor(&env, &store, IterMode::Range { prefix: b"p".to_vec() });
        assert_eq!(Cursor::skip(&mut cursor, b"q").unwrap(), None);
        assert_eq!(cursor.next(), None);
    }

    #[test]
    fn skip_lands_on_the_first_key_at_or_after_the_target() {
        let dir = tempfile::TempDir::new().unwrap();
        let (env, store) = seeded_store(dir.path(), &["p1", "p3", "p5"]);
        let (_txn, mut cursor) = open_cursor(&env, &store, IterMode::Range { prefix: b"p".to_vec() });
        assert_eq!(Cursor::skip(&mut cursor, b"p2").unwrap().as_deref(), Some("p3"));
        assert_eq!(cursor.next().as_deref(), Some("p5"));
    }

    #[test]
    fn a_closed_cursor_fails_every_operation_deterministically() {
        let dir = tempfile::TempDir::new().unwrap();
        let (env, store) = seeded_store(dir.path(), &["a", "b"]);
        let (_txn, mut cursor) = open_cursor(&env, &store, IterMode::All);
        cursor.close();
        assert_eq!(cursor.next(), None);
        assert!(cursor.take_error().is_some(), "next after close records an error");
        assert!(Cursor::skip(&mut cursor, b"a").is_err());
        assert!(cursor.reset().is_err());
    }

    #[test]
    fn reset_makes_iteration_restartable_and_deterministic() {
        let dir = tempfile::TempDir::new().unwrap();
        let (env, store) = seeded_store(dir.path(), &["a", "b", "c"]);
        let (_txn, mut cursor) = open_cursor(&env, &store, IterMode::All);
        let first: Vec<_> = cursor.by_ref().collect();
        cursor.reset().unwrap();
        let second: Vec<_> = cursor.by_ref().collect();
        assert_eq!(first, second);
    }
}
