//! An index — the named collection of segments a host opens, searches
//! across, and appends new segments to.
//!
//! Field names are assigned small, stable integer ids on first use so
//! postings keys stay short; both directions of the bijection are cached
//! in memory with the `_schema` store as the durable source of truth.
//!
//! Indices are shared across threads (each caller still confined to its
//! own `Transaction`), so the caches are guarded by `parking_lot::Mutex`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use heed::types::Bytes;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::iter::{Cursor, IterMode};
use crate::segment::Segment;
use crate::txn::{StoreHandle, Transaction, WriteLock};

// Bookkeeping keys live under the `0x00` prefix so a plain `From` scan
// starting at `0x01` lists only real field/segment names, with no risk of
// colliding with a user-chosen name. Neither counter ever decreases, so
// removed fields and segments never get their ids reused.
const NEXT_FIELD_KEY: &[u8] = b"\x00next_field";
const NEXT_SEGMENT_KEY: &[u8] = b"\x00next_segment";
const USER_KEYS_START: &[u8] = b"\x01";

/// An open index, handed out as an `Arc` by
/// [`crate::env::Environment::open_index`].
pub struct Index {
    name: String,
    env: heed::Env,
    write_lock: Arc<WriteLock>,
    lock_timeout: Duration,
    metadata_name: String,
    metadata: StoreHandle,
    schema_name: String,
    schema: StoreHandle,
    segments_name: String,
    segments_db: StoreHandle,
    field_to_id: Mutex<HashMap<String, u32>>,
    id_to_field: Mutex<HashMap<u32, String>>,
    open_segments: Mutex<HashMap<String, Arc<Segment>>>,
}

impl Index {
    pub(crate) fn open_or_create(
        env: heed::Env,
        write_lock: Arc<WriteLock>,
        lock_timeout: Duration,
        txn: &Transaction<'_>,
        name: &str,
    ) -> Result<Index> {
        let metadata_name = format!("{name}._metadata");
        let schema_name = format!("{name}._schema");
        let segments_name = format!("{name}._segments");
        let metadata = txn.with_write(|rw| open_store(&env, rw, &metadata_name))?;
        let schema = txn.with_write(|rw| open_store(&env, rw, &schema_name))?;
        let segments_db = txn.with_write(|rw| open_store(&env, rw, &segments_name))?;

        let index = Index {
            name: name.to_string(),
            env,
            write_lock,
            lock_timeout,
            metadata_name,
            metadata,
            schema_name,
            schema,
            segments_name,
            segments_db,
            field_to_id: Mutex::new(HashMap::new()),
            id_to_field: Mutex::new(HashMap::new()),
            open_segments: Mutex::new(HashMap::new()),
        };
        index.load_schema(txn)?;
        Ok(index)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Begins a new root transaction against this index's environment, for
    /// callers holding an `Index` but not the `Environment` it came from.
    pub fn new_txn(&self) -> Result<Transaction<'_>> {
        Transaction::new_root(&self.env, self.write_lock.clone(), self.lock_timeout)
    }

    /// Stores a free-form index-level metadata entry.
    pub fn set_meta(&self, txn: &Transaction<'_>, key: &[u8], value: &[u8]) -> Result<()> {
        txn.put(&self.metadata_name, &self.metadata, key, value)
    }

    pub fn get_meta(&self, txn: &Transaction<'_>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        txn.get(&self.metadata_name, &self.metadata, key)
    }

    pub fn delete_meta(&self, txn: &Transaction<'_>, key: &[u8]) -> Result<bool> {
        txn.delete(&self.metadata_name, &self.metadata, key)
    }

    fn load_schema(&self, txn: &Transaction<'_>) -> Result<()> {
        let mut map = self.field_to_id.lock();
        let mut rev = self.id_to_field.lock();
        map.clear();
        rev.clear();
        let cursor: Cursor<(String, u32)> = Cursor::open(
            txn,
            &self.schema_name,
            &self.schema,
            IterMode::From { start: USER_KEYS_START.to_vec() },
            |k, v| {
                let name = std::str::from_utf8(k).map_err(|e| Error::wrap("field name is not utf8", e))?;
                if v.len() != 4 {
                    return Err(Error::msg("corrupt field id"));
                }
                Ok((name.to_string(), u32::from_be_bytes(v.try_into().unwrap())))
            },
            Arc::new(()),
        )?;
        for (name, id) in cursor {
            map.insert(name.clone(), id);
            rev.insert(id, name);
        }
        Ok(())
    }

    /// Returns the id assigned to `field`, assigning and persisting a fresh
    /// one if this is the first time it has been seen.
    pub fn add_field(&self, txn: &Transaction<'_>, field: &str) -> Result<u32> {
        if let Some(id) = self.field_to_id.lock().get(field) {
            return Ok(*id);
        }
        let next = match txn.get(&self.schema_name, &self.schema, NEXT_FIELD_KEY)? {
            Some(bytes) if bytes.len() == 4 => u32::from_be_bytes(bytes.try_into().unwrap()),
            _ => 0,
        };
        txn.put(&self.schema_name, &self.schema, field.as_bytes(), &next.to_be_bytes())?;
        txn.put(&self.schema_name, &self.schema, NEXT_FIELD_KEY, &(next + 1).to_be_bytes())?;
        self.field_to_id.lock().insert(field.to_string(), next);
        self.id_to_field.lock().insert(next, field.to_string());
        Ok(next)
    }

    pub fn contains_field(&self, field: &str) -> bool {
        self.field_to_id.lock().contains_key(field)
    }

    pub fn field_id(&self, field: &str) -> Option<u32> {
        self.field_to_id.lock().get(field).copied()
    }

    pub fn list_fields(&self) -> Vec<String> {
        let mut fields: Vec<_> = self.field_to_id.lock().keys().cloned().collect();
        fields.sort();
        fields
    }

    pub fn count_fields(&self) -> usize {
        self.field_to_id.lock().len()
    }

    /// Removes a field from the schema. Existing postings under that field
    /// name are left in place in already-written segments, reclaimed only
    /// when those segments are themselves deleted.
    pub fn remove_field(&self, txn: &Transaction<'_>, field: &str) -> Result<bool> {
        let id = match self.field_to_id.lock().remove(field) {
            Some(id) => id,
            None => return Ok(false),
        };
        self.id_to_field.lock().remove(&id);
        txn.delete(&self.schema_name, &self.schema, field.as_bytes())?;
        Ok(true)
    }

    /// Creates and opens the next segment in this index, registering it
    /// under its freshly assigned record number rendered in decimal.
    pub fn new_segment(&self, txn: &Transaction<'_>) -> Result<Arc<Segment>> {
        let next = match txn.get(&self.segments_name, &self.segments_db, NEXT_SEGMENT_KEY)? {
            Some(bytes) if bytes.len() == 4 => u32::from_be_bytes(bytes.try_into().unwrap()),
            _ => 0,
        };
        let seg_name = next.to_string();
        txn.put(&self.segments_name, &self.segments_db, seg_name.as_bytes(), &[])?;
        txn.put(&self.segments_name, &self.segments_db, NEXT_SEGMENT_KEY, &(next + 1).to_be_bytes())?;
        self.open_segment(txn, &seg_name)
    }

    /// Opens a previously-created, still-registered segment by name,
    /// caching the handle. Fails if `seg_name` was never created or has
    /// since been removed, even though its backing stores may still
    /// physically exist pending the last holder's close.
    pub fn open_segment(&self, txn: &Transaction<'_>, seg_name: &str) -> Result<Arc<Segment>> {
        if let Some(existing) = self.open_segments.lock().get(seg_name) {
            return Ok(existing.clone());
        }
        if txn.get(&self.segments_name, &self.segments_db, seg_name.as_bytes())?.is_none() {
            return Err(Error::msg(format!("segment '{seg_name}' not found")));
        }
        let segment = Segment::open_or_create(self.env.clone(), txn, &self.name, seg_name)?;
        self.open_segments.lock().insert(seg_name.to_string(), segment.clone());
        Ok(segment)
    }

    /// Lists the (non-removed) segment names registered to this index.
    /// Names are decimal record numbers, so the byte-lexicographic store
    /// order they come back in is not numeric order past ten segments.
    pub fn iter_segments(&self, txn: &Transaction<'_>) -> Result<Vec<String>> {
        let cursor: Cursor<String> = Cursor::open(
            txn,
            &self.segments_name,
            &self.segments_db,
            IterMode::From { start: USER_KEYS_START.to_vec() },
            |k, _| Ok(String::from_utf8_lossy(k).into_owned()),
            Arc::new(()),
        )?;
        Ok(cursor.collect())
    }

    /// Removes a segment from the index's registry and marks it deleted.
    /// If no caller still holds a handle to it, its stores are emptied
    /// immediately; otherwise the physical teardown is deferred to the last
    /// holder's [`Segment::close`].
    pub fn delete_segment(&self, txn: &Transaction<'_>, seg_name: &str) -> Result<()> {
        let segment = self.open_segment(txn, seg_name)?;
        segment.mark_deleted(txn)?;
        txn.delete(&self.segments_name, &self.segments_db, seg_name.as_bytes())?;
        self.open_segments.lock().remove(seg_name);
        tracing::debug!(target: "logdex_core::index", index = %self.name, segment = %seg_name, "segment removed from registry");
        segment.close(txn)
    }

    /// Closes this index's segment cache. Fails if a caller still holds a
    /// handle to one of its segments.
    pub fn close(&self) -> Result<()> {
        let mut segments = self.open_segments.lock();
        for (seg_name, segment) in segments.iter() {
            if Arc::strong_count(segment) > 1 {
                return Err(Error::msg(format!(
                    "cannot close index '{}': segment '{seg_name}' is still open",
                    self.name
                )));
            }
        }
        segments.clear();
        Ok(())
    }

    /// Aggregate document count across every live segment.
    pub fn stats(&self, txn: &Transaction<'_>) -> Result<IndexStats> {
        let mut total_docs = 0u64;
        let mut segment_count = 0u64;
        for seg_name in self.iter_segments(txn)? {
            let segment = self.open_segment(txn, &seg_name)?;
            if segment.is_deleted(txn)? {
                continue;
            }
            total_docs += segment.doc_count(txn)?;
            segment_count += 1;
        }
        Ok(IndexStats { segment_count, total_docs, field_count: self.count_fields() as u64 })
    }
}

/// Point-in-time observability surface over one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub segment_count: u64,
    pub total_docs: u64,
    pub field_count: u64,
}

fn open_store(env: &heed::Env, rw: &mut heed::RwTxn<'_>, name: &str) -> Result<StoreHandle> {
    Ok(env.database_options().types::<Bytes, Bytes>().name(name).create(rw)?)
}
