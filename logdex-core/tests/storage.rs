//! Integration tests driving the public surface end to end: a fresh
//! on-disk environment per test, real transactions, no mocking of the
//! storage layer itself.

use std::time::Duration;

use logdex_core::{Config, Environment, Error};
use tempfile::TempDir;

fn open_env() -> (TempDir, Environment) {
    let dir = TempDir::new().expect("tempdir");
    let env = Environment::open(dir.path(), Config::default()).expect("open environment");
    (dir, env)
}

#[test]
fn new_doc_allocates_increasing_ids_and_persists_across_transactions() {
    let (_dir, env) = open_env();

    let txn = env.begin_txn().unwrap();
    let index = env.open_index(&txn, "access-log").unwrap();
    let segment = index.new_segment(&txn).unwrap();
    let first = segment.new_doc(&txn, b"GET /a").unwrap();
    let second = segment.new_doc(&txn, b"GET /b").unwrap();
    txn.commit().unwrap();
    assert_eq!((first, second), (0, 1));

    let txn = env.begin_txn().unwrap();
    let index = env.open_index(&txn, "access-log").unwrap();
    let segment = index.open_segment(&txn, segment.name()).unwrap();
    assert_eq!(segment.get_doc(&txn, 0).unwrap().as_deref(), Some(b"GET /a".as_slice()));
    assert_eq!(segment.get_doc(&txn, 1).unwrap().as_deref(), Some(b"GET /b".as_slice()));
    assert_eq!(segment.doc_count(&txn).unwrap(), 2);
    assert!(segment.contains_doc(&txn, 1).unwrap());
    assert!(!segment.contains_doc(&txn, 2).unwrap());
}

#[test]
fn inserting_an_existing_document_id_fails_with_doc_exists() {
    let (_dir, env) = open_env();
    let txn = env.begin_txn().unwrap();
    let index = env.open_index(&txn, "idx").unwrap();
    let segment = index.new_segment(&txn).unwrap();

    segment.insert_doc(&txn, 5, b"first").unwrap();
    let err = segment.insert_doc(&txn, 5, b"second").unwrap_err();
    assert!(matches!(err, Error::DocExists(5)));
}

#[test]
fn new_doc_never_reuses_an_id_even_after_deletion() {
    let (_dir, env) = open_env();
    let txn = env.begin_txn().unwrap();
    let index = env.open_index(&txn, "idx").unwrap();
    let segment = index.new_segment(&txn).unwrap();

    let a = segment.new_doc(&txn, b"x").unwrap();
    assert!(segment.contains_doc(&txn, a).unwrap());
    segment.delete_doc(&txn, a).unwrap();
    let b = segment.new_doc(&txn, b"y").unwrap();
    assert_ne!(a, b);
}

#[test]
fn child_transaction_writes_are_invisible_until_committed_into_parent() {
    let (_dir, env) = open_env();
    let root = env.begin_txn().unwrap();
    let index = env.open_index(&root, "idx").unwrap();
    let segment = index.new_segment(&root).unwrap();

    let child = root.begin_child().unwrap();
    segment.insert_doc(&child, 1, b"child-write").unwrap();

    // Not yet visible through the root, since the child hasn't committed.
    assert_eq!(segment.get_doc(&root, 1).unwrap(), None);

    child.commit().unwrap();
    assert_eq!(segment.get_doc(&root, 1).unwrap().as_deref(), Some(b"child-write".as_slice()));
    root.commit().unwrap();
}

#[test]
fn aborted_child_transaction_discards_its_writes() {
    let (_dir, env) = open_env();
    let root = env.begin_txn().unwrap();
    let index = env.open_index(&root, "idx").unwrap();
    let segment = index.new_segment(&root).unwrap();

    let child = root.begin_child().unwrap();
    segment.insert_doc(&child, 1, b"will be discarded").unwrap();
    child.abort().unwrap();

    assert_eq!(segment.get_doc(&root, 1).unwrap(), None);
    root.commit().unwrap();
}

#[test]
fn committing_a_transaction_with_open_children_fails() {
    let (_dir, env) = open_env();
    let root = env.begin_txn().unwrap();
    let _child = root.begin_child().unwrap();
    let err = root.commit().unwrap_err();
    assert!(matches!(err, Error::Error { .. }));
}

#[test]
fn aborting_a_child_then_committing_the_parent_succeeds() {
    let (_dir, env) = open_env();
    let root = env.begin_txn().unwrap();
    let index = env.open_index(&root, "idx").unwrap();
    let segment = index.new_segment(&root).unwrap();

    let child = root.begin_child().unwrap();
    segment.insert_doc(&child, 1, b"discarded").unwrap();
    child.abort().unwrap();

    // The parent has no open children left, so it may now commit.
    root.commit().unwrap();
}

#[test]
fn beginning_a_second_root_transaction_on_the_same_thread_is_a_deadlock() {
    let (_dir, env) = open_env();
    let txn = env.begin_txn().unwrap();
    let err = env.begin_txn().unwrap_err();
    assert!(matches!(err, Error::Deadlock));
    txn.abort().unwrap();
}

#[test]
fn a_contended_writer_slot_times_out_with_lock_timeout() {
    let dir = TempDir::new().unwrap();
    let config = Config { lock_timeout: Duration::from_millis(50), ..Config::default() };
    let env = Environment::open(dir.path(), config).unwrap();

    let txn = env.begin_txn().unwrap();
    std::thread::scope(|s| {
        let contender = s.spawn(|| env.begin_txn().map(|_| ()));
        let err = contender.join().unwrap().unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));
        assert!(err.is_retryable());
    });
    txn.abort().unwrap();
}

#[test]
fn field_ids_are_stable_and_persist_across_reopen() {
    let (_dir, env) = open_env();
    let txn = env.begin_txn().unwrap();
    let index = env.open_index(&txn, "idx").unwrap();
    let host_id = index.add_field(&txn, "host").unwrap();
    let second_call = index.add_field(&txn, "host").unwrap();
    assert_eq!(host_id, second_call);
    let message_id = index.add_field(&txn, "message").unwrap();
    assert_ne!(host_id, message_id);
    txn.commit().unwrap();

    let txn = env.begin_txn().unwrap();
    let index = env.open_index(&txn, "idx").unwrap();
    assert_eq!(index.field_id("host"), Some(host_id));
    assert!(index.contains_field("message"));
    assert_eq!(index.count_fields(), 2);
    assert_eq!(index.list_fields(), vec!["host".to_string(), "message".to_string()]);
}

#[test]
fn removing_a_field_forgets_it_without_reusing_its_id() {
    let (_dir, env) = open_env();
    let txn = env.begin_txn().unwrap();
    let index = env.open_index(&txn, "idx").unwrap();
    let host_id = index.add_field(&txn, "host").unwrap();

    assert!(index.remove_field(&txn, "host").unwrap());
    assert!(!index.remove_field(&txn, "host").unwrap());
    assert!(!index.contains_field("host"));
    assert_eq!(index.count_fields(), 0);

    let again = index.add_field(&txn, "host").unwrap();
    assert_ne!(host_id, again, "a removed field's id is never reassigned");
}

#[test]
fn index_metadata_round_trips() {
    let (_dir, env) = open_env();
    let txn = env.begin_txn().unwrap();
    let index = env.open_index(&txn, "idx").unwrap();

    index.set_meta(&txn, b"owner", b"ops").unwrap();
    assert_eq!(index.get_meta(&txn, b"owner").unwrap().as_deref(), Some(b"ops".as_slice()));
    assert!(index.delete_meta(&txn, b"owner").unwrap());
    assert_eq!(index.get_meta(&txn, b"owner").unwrap(), None);
}

#[test]
fn segment_metadata_round_trips_and_reserves_the_zero_prefix() {
    let (_dir, env) = open_env();
    let txn = env.begin_txn().unwrap();
    let index = env.open_index(&txn, "idx").unwrap();
    let segment = index.new_segment(&txn).unwrap();

    segment.set_meta(&txn, b"source", b"syslog").unwrap();
    assert_eq!(segment.get_meta(&txn, b"source").unwrap().as_deref(), Some(b"syslog".as_slice()));
    assert!(segment.delete_meta(&txn, b"source").unwrap());
    assert!(segment.set_meta(&txn, b"\x00next_did", b"0").is_err());
    assert!(segment.created_at(&txn).unwrap() > 0);
}

#[test]
fn word_entries_round_trip_with_their_positions_payload() {
    let (_dir, env) = open_env();
    let txn = env.begin_txn().unwrap();
    let index = env.open_index(&txn, "idx").unwrap();
    let segment = index.new_segment(&txn).unwrap();

    segment.set_word(&txn, "message", b"error", 7, b"[3,19]").unwrap();
    assert!(segment.contains_word(&txn, "message", b"error", 7).unwrap());
    assert_eq!(
        segment.get_word(&txn, "message", b"error", 7).unwrap().as_deref(),
        Some(b"[3,19]".as_slice())
    );
    assert!(segment.delete_word(&txn, "message", b"error", 7).unwrap());
    assert!(!segment.contains_word(&txn, "message", b"error", 7).unwrap());
}

#[test]
fn postings_cursor_stays_within_its_term_and_orders_by_document_id() {
    let (_dir, env) = open_env();
    let txn = env.begin_txn().unwrap();
    let index = env.open_index(&txn, "idx").unwrap();
    let segment = index.new_segment(&txn).unwrap();

    for did in [3u64, 1, 5, 2, 4] {
        segment.set_word(&txn, "host", b"web", did, b"[]").unwrap();
    }
    // A longer term sharing the prefix must not leak into `web`'s range.
    segment.set_word(&txn, "host", b"webhook", 99, b"[]").unwrap();

    let dids: Vec<u64> = segment.postings(&txn, "host", b"web").unwrap().map(|(did, _)| did).collect();
    assert_eq!(dids, vec![1, 2, 3, 4, 5]);
}

#[test]
fn word_meta_round_trips_and_lists_terms_in_order() {
    let (_dir, env) = open_env();
    let txn = env.begin_txn().unwrap();
    let index = env.open_index(&txn, "idx").unwrap();
    let segment = index.new_segment(&txn).unwrap();

    segment.set_word_meta(&txn, "host", b"web", b"df=5").unwrap();
    segment.set_word_meta(&txn, "host", b"api", b"df=2").unwrap();
    assert_eq!(segment.get_word_meta(&txn, "host", b"web").unwrap().as_deref(), Some(b"df=5".as_slice()));

    let terms: Vec<Vec<u8>> = segment.words(&txn, "host").unwrap().map(|(term, _)| term).collect();
    assert_eq!(terms, vec![b"api".to_vec(), b"web".to_vec()]);

    assert!(segment.delete_word_meta(&txn, "host", b"web").unwrap());
    assert_eq!(segment.get_word_meta(&txn, "host", b"web").unwrap(), None);
}

#[test]
fn documents_cursor_skip_and_reset_reposition_without_rescanning() {
    let (_dir, env) = open_env();
    let txn = env.begin_txn().unwrap();
    let index = env.open_index(&txn, "idx").unwrap();
    let segment = index.new_segment(&txn).unwrap();
    for i in 0..5u64 {
        segment.insert_doc(&txn, i, format!("doc-{i}").as_bytes()).unwrap();
    }

    let mut cursor = segment.documents(&txn).unwrap();
    let did_key = |n: u64| logdex_core::codec::encode_did(n);

    let (skipped_to, _) = logdex_core::Cursor::skip(&mut cursor, &did_key(3)).unwrap().expect("in range");
    assert_eq!(skipped_to, 3);
    let (following, _) = cursor.next().unwrap();
    assert_eq!(following, 4);

    cursor.reset().unwrap();
    let (first_after_reset, _) = cursor.next().unwrap();
    assert_eq!(first_after_reset, 0);

    assert!(logdex_core::Cursor::skip(&mut cursor, &did_key(100)).unwrap().is_none(), "past the end is out-of-range");
    assert!(cursor.next().is_none());
}

#[test]
fn documents_within_is_inclusive_of_both_boundaries() {
    let (_dir, env) = open_env();
    let txn = env.begin_txn().unwrap();
    let index = env.open_index(&txn, "idx").unwrap();
    let segment = index.new_segment(&txn).unwrap();
    for did in 0..10u64 {
        segment.insert_doc(&txn, did, b"x").unwrap();
    }

    let within: Vec<u64> = segment.documents_within(&txn, 3, 6).unwrap().map(|(d, _)| d).collect();
    assert_eq!(within, vec![3, 4, 5, 6]);

    let from: Vec<u64> = segment.documents_from(&txn, 7).unwrap().map(|(d, _)| d).collect();
    assert_eq!(from, vec![7, 8, 9]);
}

#[test]
fn a_closed_documents_cursor_reports_iterator_closed() {
    let (_dir, env) = open_env();
    let txn = env.begin_txn().unwrap();
    let index = env.open_index(&txn, "idx").unwrap();
    let segment = index.new_segment(&txn).unwrap();
    segment.insert_doc(&txn, 0, b"x").unwrap();

    let mut cursor = segment.documents(&txn).unwrap();
    cursor.close();
    cursor.close();
    assert!(cursor.next().is_none());
    let err = cursor.take_error().expect("error recorded");
    assert!(err.to_string().contains("iterator closed"));
    assert!(cursor.reset().is_err());
}

#[test]
fn empty_store_all_scan_yields_nothing() {
    let (_dir, env) = open_env();
    let txn = env.begin_txn().unwrap();
    let index = env.open_index(&txn, "idx").unwrap();
    let segment = index.new_segment(&txn).unwrap();

    let mut cursor = segment.documents(&txn).unwrap();
    assert!(cursor.is_empty());
    assert!(cursor.next().is_none());
    cursor.close();
}

#[test]
fn deleting_a_document_removes_it_and_decrements_the_count() {
    let (_dir, env) = open_env();
    let txn = env.begin_txn().unwrap();
    let index = env.open_index(&txn, "idx").unwrap();
    let segment = index.new_segment(&txn).unwrap();
    segment.insert_doc(&txn, 1, b"body").unwrap();

    assert!(segment.delete_doc(&txn, 1).unwrap());
    assert!(!segment.delete_doc(&txn, 1).unwrap(), "deleting twice is a no-op, not an error");
    assert_eq!(segment.get_doc(&txn, 1).unwrap(), None);
    assert_eq!(segment.doc_count(&txn).unwrap(), 0);
}

#[test]
fn index_stats_aggregate_across_live_segments_and_skip_deleted_ones() {
    let (_dir, env) = open_env();
    let txn = env.begin_txn().unwrap();
    let index = env.open_index(&txn, "idx").unwrap();

    let seg_a = index.new_segment(&txn).unwrap();
    seg_a.insert_doc(&txn, 0, b"a").unwrap();
    let seg_b = index.new_segment(&txn).unwrap();
    seg_b.insert_doc(&txn, 0, b"b").unwrap();
    seg_b.insert_doc(&txn, 1, b"c").unwrap();

    let stats = index.stats(&txn).unwrap();
    assert_eq!(stats.segment_count, 2);
    assert_eq!(stats.total_docs, 3);

    index.delete_segment(&txn, seg_b.name()).unwrap();
    let stats = index.stats(&txn).unwrap();
    assert_eq!(stats.segment_count, 1);
    assert_eq!(stats.total_docs, 1);
}

#[test]
fn deleting_a_segment_makes_it_unopenable_while_a_handle_is_still_live() {
    let (_dir, env) = open_env();
    let txn = env.begin_txn().unwrap();
    let index = env.open_index(&txn, "idx").unwrap();
    let segment = index.new_segment(&txn).unwrap();
    let name = segment.name().to_string();

    // `segment` is still held here, so physical teardown stays deferred,
    // but the registry entry is gone immediately.
    index.delete_segment(&txn, &name).unwrap();
    let err = index.open_segment(&txn, &name).unwrap_err();
    assert!(matches!(err, Error::Error { .. }));
    assert!(!index.iter_segments(&txn).unwrap().contains(&name));
}

#[test]
fn deleting_a_segment_with_no_outstanding_handle_purges_it_at_once() {
    let (_dir, env) = open_env();
    let txn = env.begin_txn().unwrap();
    let index = env.open_index(&txn, "idx").unwrap();

    let name = {
        let segment = index.new_segment(&txn).unwrap();
        segment.insert_doc(&txn, 0, b"gone").unwrap();
        segment.set_word(&txn, "host", b"web", 0, b"[]").unwrap();
        segment.name().to_string()
    };

    index.delete_segment(&txn, &name).unwrap();
    assert!(index.iter_segments(&txn).unwrap().is_empty());
    txn.commit().unwrap();
}

#[test]
fn closing_an_index_fails_while_a_segment_handle_is_held() {
    let (_dir, env) = open_env();
    let txn = env.begin_txn().unwrap();
    let index = env.open_index(&txn, "idx").unwrap();
    let segment = index.new_segment(&txn).unwrap();

    assert!(index.close().is_err());
    drop(segment);
    index.close().unwrap();
    txn.commit().unwrap();
}

#[test]
fn closing_the_environment_fails_while_an_index_handle_is_held() {
    let (_dir, env) = open_env();
    let index = {
        let txn = env.begin_txn().unwrap();
        let index = env.open_index(&txn, "idx").unwrap();
        txn.commit().unwrap();
        index
    };

    let err = env.close().unwrap_err();
    assert!(err.to_string().contains("still open"));
    drop(index);
}

#[test]
fn reopening_an_environment_preserves_committed_state() {
    let dir = TempDir::new().unwrap();
    {
        let env = Environment::open(dir.path(), Config::default()).unwrap();
        {
            let txn = env.begin_txn().unwrap();
            let index = env.open_index(&txn, "idx").unwrap();
            let segment = index.new_segment(&txn).unwrap();
            segment.insert_doc(&txn, 0, b"durable").unwrap();
            txn.commit().unwrap();
        }
        env.close().unwrap();
    }
    let env = Environment::open(dir.path(), Config::default()).unwrap();
    let txn = env.begin_txn().unwrap();
    let index = env.open_index(&txn, "idx").unwrap();
    let segment = index.open_segment(&txn, "0").unwrap();
    assert_eq!(segment.get_doc(&txn, 0).unwrap().as_deref(), Some(b"durable".as_slice()));
}

#[test]
fn an_index_can_begin_transactions_without_its_environment() {
    let (_dir, env) = open_env();
    let index = {
        let txn = env.begin_txn().unwrap();
        let index = env.open_index(&txn, "idx").unwrap();
        txn.commit().unwrap();
        index
    };

    let txn = index.new_txn().unwrap();
    index.set_meta(&txn, b"k", b"v").unwrap();
    txn.commit().unwrap();

    let txn = index.new_txn().unwrap();
    assert_eq!(index.get_meta(&txn, b"k").unwrap().as_deref(), Some(b"v".as_slice()));
    txn.abort().unwrap();
}
