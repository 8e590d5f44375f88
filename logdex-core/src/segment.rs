//! A segment — the unit of storage an [`crate::index::Index`] appends
//! new documents into and searches read from.
//!
//! A segment owns two always-open stores (`_metadata`, `_documents`) plus
//! one pair of field stores (postings, and per-term metadata) opened
//! lazily per field name the first time it is touched. A segment's field
//! count is bounded by its index's schema, so the cache never needs to
//! evict and every opened handle stays live until segment close.
//!
//! Deletion is deferred: [`Segment::mark_deleted`] only sets a flag, and
//! the backing stores are physically emptied by [`Segment::close`] once no
//! other handle to the segment is live.
//!
//! Segments are shared across threads (each caller still confined to its
//! own `Transaction`), so the field cache is guarded by
//! `parking_lot::Mutex` rather than `RefCell`.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use heed::types::Bytes;
use parking_lot::Mutex;

use crate::codec::{self, DocId};
use crate::error::{Error, Result};
use crate::iter::{Cursor, IterMode};
use crate::txn::{StoreHandle, Transaction};

// Bookkeeping keys live under the 0x00 prefix, a namespace user metadata
// keys are refused from, so `get_meta`/`set_meta` stay free-form without a
// second store for four counters.
const NEXT_DID_KEY: &[u8] = b"\x00next_did";
const DOC_COUNT_KEY: &[u8] = b"\x00doc_count";
const CREATED_AT_KEY: &[u8] = b"\x00created_at";
const DELETED_KEY: &[u8] = b"\x00deleted";
/// `\x00field.{name}` markers record which field stores this segment ever
/// opened, so teardown can find them without the enclosing schema.
const FIELD_MARK_PREFIX: &[u8] = b"\x00field.";

#[derive(Clone)]
struct FieldStores {
    words_name: String,
    words: StoreHandle,
    word_meta_name: String,
    word_meta: StoreHandle,
}

/// A handle to one segment. `heed::Env` is a cheap, `Arc`-backed clone,
/// so a segment owns one rather than borrowing its environment's lifetime.
pub struct Segment {
    /// Self-reference (set by `Arc::new_cyclic` at construction) handed to
    /// cursors as their keepalive, so an open cursor counts as a live
    /// handle and defers physical teardown.
    me: Weak<Segment>,
    name: String,
    base: String,
    metadata_name: String,
    documents_name: String,
    env: heed::Env,
    metadata: StoreHandle,
    documents: StoreHandle,
    fields: Mutex<HashMap<String, FieldStores>>,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Segment {
    /// Opens a segment, creating its backing stores if this is the first
    /// time `index_name`/`segment_name` has been seen.
    pub(crate) fn open_or_create(
        env: heed::Env,
        txn: &Transaction<'_>,
        index_name: &str,
        segment_name: &str,
    ) -> Result<Arc<Segment>> {
        let base = format!("{index_name}.{segment_name}");
        let metadata_name = format!("{base}._metadata");
        let documents_name = format!("{base}._documents");

        let metadata = txn.with_write(|rw| open_store(&env, rw, &metadata_name))?;
        let documents = txn.with_write(|rw| open_store(&env, rw, &documents_name))?;

        let seg = Arc::new_cyclic(|me| Segment {
            me: me.clone(),
            name: segment_name.to_string(),
            base,
            metadata_name,
            documents_name,
            env,
            metadata,
            documents,
            fields: Mutex::new(HashMap::new()),
        });

        if txn.get(&seg.metadata_name, &seg.metadata, CREATED_AT_KEY)?.is_none() {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64;
            txn.put(&seg.metadata_name, &seg.metadata, CREATED_AT_KEY, &now.to_be_bytes())?;
            txn.put(&seg.metadata_name, &seg.metadata, DOC_COUNT_KEY, &0u64.to_be_bytes())?;
            txn.put(&seg.metadata_name, &seg.metadata, NEXT_DID_KEY, &0u64.to_be_bytes())?;
        }
        Ok(seg)
    }

    fn keepalive(&self) -> Arc<dyn std::any::Any> {
        self.me.upgrade().expect("a live segment always has a self-reference")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self, txn: &Transaction<'_>) -> Result<u64> {
        self.read_u64(txn, CREATED_AT_KEY)
    }

    pub fn doc_count(&self, txn: &Transaction<'_>) -> Result<u64> {
        self.read_u64(txn, DOC_COUNT_KEY)
    }

    pub fn is_deleted(&self, txn: &Transaction<'_>) -> Result<bool> {
        Ok(txn.get(&self.metadata_name, &self.metadata, DELETED_KEY)?.is_some())
    }

    fn read_u64(&self, txn: &Transaction<'_>, key: &[u8]) -> Result<u64> {
        match txn.get(&self.metadata_name, &self.metadata, key)? {
            Some(bytes) if bytes.len() == 8 => Ok(u64::from_be_bytes(bytes.try_into().unwrap())),
            Some(_) => Err(Error::msg("corrupt metadata counter")),
            None => Ok(0),
        }
    }

    /// Stores a free-form metadata entry. Keys beginning with a zero byte
    /// are reserved for the segment's own counters.
    pub fn set_meta(&self, txn: &Transaction<'_>, key: &[u8], value: &[u8]) -> Result<()> {
        if key.first() == Some(&0) {
            return Err(Error::msg("metadata keys may not start with a zero byte"));
        }
        txn.put(&self.metadata_name, &self.metadata, key, value)
    }

    pub fn get_meta(&self, txn: &Transaction<'_>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        txn.get(&self.metadata_name, &self.metadata, key)
    }

    pub fn delete_meta(&self, txn: &Transaction<'_>, key: &[u8]) -> Result<bool> {
        if key.first() == Some(&0) {
            return Err(Error::msg("metadata keys may not start with a zero byte"));
        }
        txn.delete(&self.metadata_name, &self.metadata, key)
    }

    /// Allocates the next document identifier and stores `body` under it.
    /// Atomic allocate-then-insert within the caller's transaction, so a
    /// rolled-back transaction also rolls back the allocation.
    pub fn new_doc(&self, txn: &Transaction<'_>, body: &[u8]) -> Result<DocId> {
        let next = self.read_u64(txn, NEXT_DID_KEY)?;
        self.insert_doc(txn, next, body)?;
        txn.put(&self.metadata_name, &self.metadata, NEXT_DID_KEY, &(next + 1).to_be_bytes())?;
        Ok(next)
    }

    /// Inserts `body` at an explicit document id, failing with
    /// [`Error::DocExists`] if one is already stored there.
    pub fn insert_doc(&self, txn: &Transaction<'_>, did: DocId, body: &[u8]) -> Result<()> {
        let key = codec::encode_did(did);
        if txn.get(&self.documents_name, &self.documents, &key)?.is_some() {
            return Err(Error::DocExists(did));
        }
        txn.put(&self.documents_name, &self.documents, &key, body)?;
        let count = self.read_u64(txn, DOC_COUNT_KEY)?;
        txn.put(&self.metadata_name, &self.metadata, DOC_COUNT_KEY, &(count + 1).to_be_bytes())?;
        Ok(())
    }

    pub fn get_doc(&self, txn: &Transaction<'_>, did: DocId) -> Result<Option<Vec<u8>>> {
        let key = codec::encode_did(did);
        txn.get(&self.documents_name, &self.documents, &key)
    }

    pub fn contains_doc(&self, txn: &Transaction<'_>, did: DocId) -> Result<bool> {
        Ok(self.get_doc(txn, did)?.is_some())
    }

    /// Deletes a document. The posting entries referencing it are left for
    /// a later compaction pass to reclaim, the same deferred approach the
    /// segment itself uses when removed from its index.
    pub fn delete_doc(&self, txn: &Transaction<'_>, did: DocId) -> Result<bool> {
        let key = codec::encode_did(did);
        let existed = txn.delete(&self.documents_name, &self.documents, &key)?;
        if existed {
            let count = self.read_u64(txn, DOC_COUNT_KEY)?;
            txn.put(
                &self.metadata_name,
                &self.metadata,
                DOC_COUNT_KEY,
                &count.saturating_sub(1).to_be_bytes(),
            )?;
        }
        Ok(existed)
    }

    /// Iterates every stored document in ascending id order.
    pub fn documents(&self, txn: &Transaction<'_>) -> Result<Cursor<(DocId, Vec<u8>)>> {
        self.documents_cursor(txn, IterMode::All)
    }

    /// Iterates documents with id `>= start`, to the end of the store.
    pub fn documents_from(
        &self,
        txn: &Transaction<'_>,
        start: DocId,
    ) -> Result<Cursor<(DocId, Vec<u8>)>> {
        self.documents_cursor(txn, IterMode::From { start: codec::encode_did(start).to_vec() })
    }

    /// Iterates documents with `start <= id <= end`, both bounds inclusive.
    pub fn documents_within(
        &self,
        txn: &Transaction<'_>,
        start: DocId,
        end: DocId,
    ) -> Result<Cursor<(DocId, Vec<u8>)>> {
        self.documents_cursor(
            txn,
            IterMode::Within {
                start: codec::encode_did(start).to_vec(),
                end: codec::encode_did(end).to_vec(),
            },
        )
    }

    fn documents_cursor(
        &self,
        txn: &Transaction<'_>,
        mode: IterMode,
    ) -> Result<Cursor<(DocId, Vec<u8>)>> {
        let keepalive = self.keepalive();
        Cursor::open(
            txn,
            &self.documents_name,
            &self.documents,
            mode,
            |k, v| Ok((codec::decode_did(k)?, v.to_vec())),
            keepalive,
        )
    }

    fn field(&self, txn: &Transaction<'_>, field: &str) -> Result<FieldStores> {
        if let Some(existing) = self.fields.lock().get(field) {
            return Ok(existing.clone());
        }
        let words_name = format!("{}._field.{}", self.base, field);
        let meta_name = format!("{}._field.{}.meta", self.base, field);
        let words = txn.with_write(|rw| open_store(&self.env, rw, &words_name))?;
        let word_meta = txn.with_write(|rw| open_store(&self.env, rw, &meta_name))?;

        let marker: Vec<u8> = [FIELD_MARK_PREFIX, field.as_bytes()].concat();
        if txn.get(&self.metadata_name, &self.metadata, &marker)?.is_none() {
            txn.put(&self.metadata_name, &self.metadata, &marker, &[])?;
        }

        let stores = FieldStores { words_name, words, word_meta_name: meta_name, word_meta };
        self.fields.lock().insert(field.to_string(), stores.clone());
        Ok(stores)
    }

    /// Records that `term` occurs in `field` of document `did`, with the
    /// term's serialized positions payload as the value.
    pub fn set_word(
        &self,
        txn: &Transaction<'_>,
        field: &str,
        term: &[u8],
        did: DocId,
        positions: &[u8],
    ) -> Result<()> {
        let stores = self.field(txn, field)?;
        let key = codec::encode_word_key(field, term, did);
        txn.put(&stores.words_name, &stores.words, &key, positions)
    }

    pub fn get_word(
        &self,
        txn: &Transaction<'_>,
        field: &str,
        term: &[u8],
        did: DocId,
    ) -> Result<Option<Vec<u8>>> {
        let stores = self.field(txn, field)?;
        let key = codec::encode_word_key(field, term, did);
        txn.get(&stores.words_name, &stores.words, &key)
    }

    pub fn contains_word(
        &self,
        txn: &Transaction<'_>,
        field: &str,
        term: &[u8],
        did: DocId,
    ) -> Result<bool> {
        Ok(self.get_word(txn, field, term, did)?.is_some())
    }

    pub fn delete_word(
        &self,
        txn: &Transaction<'_>,
        field: &str,
        term: &[u8],
        did: DocId,
    ) -> Result<bool> {
        let stores = self.field(txn, field)?;
        let key = codec::encode_word_key(field, term, did);
        txn.delete(&stores.words_name, &stores.words, &key)
    }

    /// Iterates the postings for `term` within `field` in document-id
    /// order, yielding each document's positions payload alongside its id.
    pub fn postings(
        &self,
        txn: &Transaction<'_>,
        field: &str,
        term: &[u8],
    ) -> Result<Cursor<(DocId, Vec<u8>)>> {
        let stores = self.field(txn, field)?;
        let prefix = codec::encode_word_meta_key(field, term);
        let keepalive = self.keepalive();
        Cursor::open(
            txn,
            &stores.words_name,
            &stores.words,
            IterMode::Range { prefix },
            |k, v| Ok((codec::decode_word_key(k)?.did, v.to_vec())),
            keepalive,
        )
    }

    /// Term statistics (e.g. document frequency), stored once per
    /// `(field, term)` rather than once per posting.
    pub fn set_word_meta(
        &self,
        txn: &Transaction<'_>,
        field: &str,
        term: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let stores = self.field(txn, field)?;
        let key = codec::encode_word_meta_key(field, term);
        txn.put(&stores.word_meta_name, &stores.word_meta, &key, value)
    }

    pub fn get_word_meta(
        &self,
        txn: &Transaction<'_>,
        field: &str,
        term: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let stores = self.field(txn, field)?;
        let key = codec::encode_word_meta_key(field, term);
        txn.get(&stores.word_meta_name, &stores.word_meta, &key)
    }

    pub fn delete_word_meta(&self, txn: &Transaction<'_>, field: &str, term: &[u8]) -> Result<bool> {
        let stores = self.field(txn, field)?;
        let key = codec::encode_word_meta_key(field, term);
        txn.delete(&stores.word_meta_name, &stores.word_meta, &key)
    }

    /// Iterates every `(term, stats)` pair recorded for `field`, in term
    /// order.
    pub fn words(
        &self,
        txn: &Transaction<'_>,
        field: &str,
    ) -> Result<Cursor<(Vec<u8>, Vec<u8>)>> {
        let stores = self.field(txn, field)?;
        let prefix = codec::encode_field_prefix(field);
        let keepalive = self.keepalive();
        Cursor::open(
            txn,
            &stores.word_meta_name,
            &stores.word_meta,
            IterMode::Range { prefix },
            |k, v| Ok((codec::decode_word_meta_key(k)?.term.to_vec(), v.to_vec())),
            keepalive,
        )
    }

    /// Marks the segment deleted. Its stores are physically emptied by
    /// [`Segment::close`] once every other handle has been released, never
    /// while one is live.
    pub fn mark_deleted(&self, txn: &Transaction<'_>) -> Result<()> {
        txn.put(&self.metadata_name, &self.metadata, DELETED_KEY, &[1])
    }

    /// Closes this handle. If it is the last one and the segment is marked
    /// deleted, the backing stores are emptied inside the caller's
    /// transaction; otherwise the physical teardown stays deferred until
    /// the last holder closes.
    pub fn close(self: Arc<Self>, txn: &Transaction<'_>) -> Result<()> {
        if Arc::strong_count(&self) > 1 {
            return Ok(());
        }
        if self.is_deleted(txn)? {
            tracing::debug!(target: "logdex_core::segment", segment = %self.base, "removing deleted segment's stores");
            self.purge(txn)?;
        }
        Ok(())
    }

    /// Empties every store this segment ever opened, including field stores
    /// recorded by their `\x00field.` markers, and drops any still-buffered
    /// writes against them so the root's commit cannot resurrect keys.
    fn purge(&self, txn: &Transaction<'_>) -> Result<()> {
        let markers: Cursor<String> = Cursor::open(
            txn,
            &self.metadata_name,
            &self.metadata,
            IterMode::Range { prefix: FIELD_MARK_PREFIX.to_vec() },
            |k, _| {
                let name = &k[FIELD_MARK_PREFIX.len()..];
                Ok(String::from_utf8_lossy(name).into_owned())
            },
            Arc::new(()),
        )?;
        for field in markers.collect::<Vec<_>>() {
            let stores = self.field(txn, &field)?;
            txn.with_write(|rw| {
                stores.words.clear(rw)?;
                stores.word_meta.clear(rw)?;
                Ok(())
            })?;
            txn.purge_store_writes(&stores.words_name);
            txn.purge_store_writes(&stores.word_meta_name);
        }
        txn.with_write(|rw| {
            self.documents.clear(rw)?;
            self.metadata.clear(rw)?;
            Ok(())
        })?;
        txn.purge_store_writes(&self.documents_name);
        txn.purge_store_writes(&self.metadata_name);
        Ok(())
    }
}

fn open_store(env: &heed::Env, rw: &mut heed::RwTxn<'_>, name: &str) -> Result<StoreHandle> {
    Ok(env.database_options().types::<Bytes, Bytes>().name(name).create(rw)?)
}
