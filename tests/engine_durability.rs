//! # Durability and Crash Recovery Tests
//!
//! This suite exercises the journal's guarantees end to end:
//! 1. Committed transactions survive close/reopen, before and after the
//!    journal is applied to the data file
//! 2. Uncommitted transactions never persist
//! 3. A torn journal tail (simulated by truncation at arbitrary offsets)
//!    recovers to an exact prefix of the committed transactions — never a
//!    mixed or partially applied state
//! 4. A transaction split across two journal files recovers whole
//! 5. Recovery is idempotent and oversized transactions are rejected

use std::path::Path;

use tempfile::tempdir;
use vellum::{Environment, Options, TransactionKind};

/// Keeps everything in the journal (no automatic application), with small
/// journal files so the tests copy and corrupt little data.
fn journal_only_options() -> Options {
    Options {
        journal_file_pages: 256,
        flush_interval: usize::MAX,
        ..Options::default()
    }
}

fn put(env: &Environment, tree_name: &str, key: &[u8], value: &[u8]) {
    let mut txn = env.new_transaction(TransactionKind::ReadWrite).unwrap();
    let tree = env.create_tree(&mut txn, tree_name).unwrap();
    tree.add(&mut txn, key, value).unwrap();
    txn.commit().unwrap();
}

fn get(env: &Environment, tree_name: &str, key: &[u8]) -> Option<Vec<u8>> {
    let txn = env.new_transaction(TransactionKind::Read).unwrap();
    let tree = env.get_tree(&txn, tree_name).unwrap()?;
    tree.get(&txn, key).unwrap()
}

fn copy_environment(src: &Path, dst: &Path) {
    std::fs::create_dir_all(dst).unwrap();
    for entry in std::fs::read_dir(src).unwrap() {
        let entry = entry.unwrap();
        std::fs::copy(entry.path(), dst.join(entry.file_name())).unwrap();
    }
}

mod commit_durability {
    use super::*;

    #[test]
    fn committed_data_survives_before_journal_application() {
        let dir = tempdir().unwrap();

        {
            let env = Environment::create_with(dir.path(), journal_only_options()).unwrap();
            put(&env, "kv", b"key", b"value");
        }

        let env = Environment::open_with(dir.path(), journal_only_options()).unwrap();
        assert_eq!(get(&env, "kv", b"key"), Some(b"value".to_vec()));
    }

    #[test]
    fn committed_data_survives_after_journal_application() {
        let dir = tempdir().unwrap();

        {
            let env = Environment::create_with(dir.path(), journal_only_options()).unwrap();
            put(&env, "kv", b"key", b"value");
            assert!(env.flush_journal().unwrap());
        }

        let env = Environment::open_with(dir.path(), journal_only_options()).unwrap();
        assert_eq!(get(&env, "kv", b"key"), Some(b"value".to_vec()));
    }

    #[test]
    fn uncommitted_transaction_does_not_persist() {
        let dir = tempdir().unwrap();

        {
            let env = Environment::create_with(dir.path(), journal_only_options()).unwrap();
            put(&env, "kv", b"stable", b"yes");

            let mut txn = env.new_transaction(TransactionKind::ReadWrite).unwrap();
            let tree = env.get_tree(&txn, "kv").unwrap().unwrap();
            tree.add(&mut txn, b"stable", b"overwritten").unwrap();
            tree.add(&mut txn, b"volatile", b"lost").unwrap();
            drop(txn); // Crash before commit.
        }

        let env = Environment::open_with(dir.path(), journal_only_options()).unwrap();
        assert_eq!(get(&env, "kv", b"stable"), Some(b"yes".to_vec()));
        assert_eq!(get(&env, "kv", b"volatile"), None);
    }

    #[test]
    fn commit_is_visible_to_later_but_not_earlier_read_transactions() {
        let dir = tempdir().unwrap();
        let env = Environment::create(dir.path()).unwrap();
        put(&env, "kv", b"k", b"old");

        let before = env.new_transaction(TransactionKind::Read).unwrap();

        std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let mut txn = env.new_transaction(TransactionKind::ReadWrite).unwrap();
                    let tree = env.get_tree(&txn, "kv").unwrap().unwrap();
                    tree.add(&mut txn, b"k", b"new").unwrap();
                    txn.commit().unwrap();
                })
                .join()
                .unwrap();
        });

        let tree = env.get_tree(&before, "kv").unwrap().unwrap();
        assert_eq!(
            tree.get(&before, b"k").unwrap(),
            Some(b"old".to_vec()),
            "snapshot isolation: the earlier reader keeps its view"
        );

        let after = env.new_transaction(TransactionKind::Read).unwrap();
        assert_eq!(tree.get(&after, b"k").unwrap(), Some(b"new".to_vec()));
    }
}

mod crash_recovery {
    use super::*;

    const TXNS: u32 = 6;

    fn build_journal_heavy_env(dir: &Path) {
        let env = Environment::create_with(dir, journal_only_options()).unwrap();
        for i in 1..=TXNS {
            let key = format!("txn-{:02}", i);
            let value = format!("value-{:02}", i);
            put(&env, "log", key.as_bytes(), value.as_bytes());
        }
    }

    /// The highest `i` whose key is present, verifying along the way that
    /// the present set is exactly `1..=i`.
    fn recovered_prefix(env: &Environment) -> u32 {
        let mut highest = 0;
        for i in 1..=TXNS {
            let key = format!("txn-{:02}", i);
            if get(env, "log", key.as_bytes()).is_some() {
                assert_eq!(
                    highest,
                    i - 1,
                    "recovered state has a gap: txn {} present without txn {}",
                    i,
                    i - 1
                );
                highest = i;
            }
        }
        highest
    }

    #[test]
    fn truncated_journal_recovers_to_a_prefix_of_commits() {
        let dir = tempdir().unwrap();
        build_journal_heavy_env(dir.path());

        let journal_path = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| p.extension().is_some_and(|e| e == "journal"))
            .expect("one journal file exists");

        let mut last_prefix = 0;
        for offset in (4096u64..40 * 4096).step_by(3 * 4096 + 1024) {
            let scratch = tempdir().unwrap();
            copy_environment(dir.path(), scratch.path());

            let truncated = scratch.path().join(journal_path.file_name().unwrap());
            let file = std::fs::OpenOptions::new()
                .write(true)
                .open(&truncated)
                .unwrap();
            file.set_len(offset).unwrap();
            drop(file);

            let env = Environment::open_with(scratch.path(), journal_only_options()).unwrap();
            let prefix = recovered_prefix(&env);

            assert!(
                prefix >= last_prefix,
                "longer journals must not recover less: {} < {}",
                prefix,
                last_prefix
            );
            last_prefix = prefix;
        }

        assert_eq!(
            last_prefix, TXNS,
            "truncating past the journal's end recovers everything"
        );
    }

    #[test]
    fn corrupted_tail_behaves_as_uncommitted() {
        let dir = tempdir().unwrap();
        build_journal_heavy_env(dir.path());

        let journal_path = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| p.extension().is_some_and(|e| e == "journal"))
            .unwrap();

        // Wipe three whole pages in the written region: whichever of them
        // is a transaction header loses its marker, and whichever is data
        // fails its transaction's checksum.
        let mut contents = std::fs::read(&journal_path).unwrap();
        contents[12 * 4096..15 * 4096].fill(0);
        std::fs::write(&journal_path, &contents).unwrap();

        let env = Environment::open_with(dir.path(), journal_only_options()).unwrap();
        let prefix = recovered_prefix(&env);
        assert!(prefix < TXNS, "corruption must cost at least the torn tail");
    }

    #[test]
    fn recovery_is_idempotent() {
        let dir = tempdir().unwrap();
        build_journal_heavy_env(dir.path());

        {
            let env = Environment::open_with(dir.path(), journal_only_options()).unwrap();
            assert_eq!(recovered_prefix(&env), TXNS);
        }
        {
            let env = Environment::open_with(dir.path(), journal_only_options()).unwrap();
            assert_eq!(recovered_prefix(&env), TXNS);
            env.flush_journal().unwrap();
        }
        {
            let env = Environment::open_with(dir.path(), journal_only_options()).unwrap();
            assert_eq!(recovered_prefix(&env), TXNS);
        }
    }

    #[test]
    fn writes_continue_after_recovery_from_truncation() {
        let dir = tempdir().unwrap();
        build_journal_heavy_env(dir.path());

        let journal_path = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| p.extension().is_some_and(|e| e == "journal"))
            .unwrap();
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&journal_path)
            .unwrap();
        file.set_len(9 * 4096 + 7).unwrap();
        drop(file);

        {
            let env = Environment::open_with(dir.path(), journal_only_options()).unwrap();
            let prefix = recovered_prefix(&env);
            assert!(prefix < TXNS);

            put(&env, "log", b"after-crash", b"ok");
        }

        let env = Environment::open_with(dir.path(), journal_only_options()).unwrap();
        assert_eq!(get(&env, "log", b"after-crash"), Some(b"ok".to_vec()));
    }
}

mod split_transactions {
    use super::*;

    fn small_journal_options() -> Options {
        Options {
            journal_file_pages: 64,
            flush_interval: usize::MAX,
            ..Options::default()
        }
    }

    #[test]
    fn transaction_spanning_two_journal_files_recovers_whole() {
        let dir = tempdir().unwrap();
        let big: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();

        {
            let env = Environment::create_with(dir.path(), small_journal_options()).unwrap();
            put(&env, "blobs", b"big", &big);
            // Crash after the commit syncs both journal files, before any
            // data-file flush.
        }

        let journal_count = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .path()
                    .extension()
                    .is_some_and(|x| x == "journal")
            })
            .count();
        assert!(journal_count >= 2, "the transaction spans two files");

        let env = Environment::open_with(dir.path(), small_journal_options()).unwrap();
        assert_eq!(get(&env, "blobs", b"big"), Some(big.clone()));

        // Journal files stay until the background flush retires them.
        assert!(env.flush_journal().unwrap());
        let remaining: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|x| x == "journal"))
            .collect();
        assert!(
            remaining.len() < journal_count,
            "applied journal files are retired"
        );
        drop(env);

        let env = Environment::open_with(dir.path(), small_journal_options()).unwrap();
        assert_eq!(get(&env, "blobs", b"big"), Some(big));
    }

    #[test]
    fn transaction_larger_than_two_journal_files_is_rejected() {
        let dir = tempdir().unwrap();
        let options = Options {
            journal_file_pages: 8,
            flush_interval: usize::MAX,
            ..Options::default()
        };
        let env = Environment::create_with(dir.path(), options).unwrap();

        let huge = vec![0x5A; 120_000];
        let result = {
            let mut txn = env.new_transaction(TransactionKind::ReadWrite).unwrap();
            let tree = env.create_tree(&mut txn, "blobs").unwrap();
            tree.add(&mut txn, b"huge", &huge).unwrap();
            txn.commit()
        };

        let err = result.expect_err("a three-file transaction must be rejected");
        assert!(err.to_string().contains("transaction too large"));

        // The environment stays usable after the rollback.
        put(&env, "blobs", b"small", b"fits");
        assert_eq!(get(&env, "blobs", b"small"), Some(b"fits".to_vec()));
    }
}

mod backup {
    use super::*;

    #[test]
    fn backup_restores_to_an_equivalent_environment() {
        let source_dir = tempdir().unwrap();
        let env = Environment::create(source_dir.path()).unwrap();
        put(&env, "kv", b"alpha", b"1");
        put(&env, "kv", b"bravo", b"2");

        let mut bytes = Vec::new();
        let written = env.backup(&mut bytes).unwrap();
        assert_eq!(written as usize, bytes.len());
        assert_eq!(bytes.len() % 4096, 0);

        // The fence transactions never commit; the environment still works.
        put(&env, "kv", b"charlie", b"3");

        let restore_dir = tempdir().unwrap();
        std::fs::write(restore_dir.path().join("data.vellum"), &bytes).unwrap();

        let restored = Environment::open(restore_dir.path()).unwrap();
        assert_eq!(get(&restored, "kv", b"alpha"), Some(b"1".to_vec()));
        assert_eq!(get(&restored, "kv", b"bravo"), Some(b"2".to_vec()));
        assert_eq!(get(&restored, "kv", b"charlie"), None);

        // The restored copy accepts new writes.
        put(&restored, "kv", b"delta", b"4");
        assert_eq!(get(&restored, "kv", b"delta"), Some(b"4".to_vec()));
    }

    #[test]
    fn snapshot_view_is_stable_across_later_commits() {
        let dir = tempdir().unwrap();
        let env = Environment::create(dir.path()).unwrap();
        put(&env, "kv", b"k", b"v1");

        let snapshot = env.create_snapshot().unwrap();
        let tree = snapshot.tree("kv").unwrap().unwrap();
        assert_eq!(
            tree.get(snapshot.transaction(), b"k").unwrap(),
            Some(b"v1".to_vec())
        );

        std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    put(&env, "kv", b"k", b"v2");
                })
                .join()
                .unwrap();
        });

        assert_eq!(
            tree.get(snapshot.transaction(), b"k").unwrap(),
            Some(b"v1".to_vec())
        );
    }
}

mod accounting {
    use super::*;

    #[test]
    fn stats_reflect_commits_and_reclamation() {
        let dir = tempdir().unwrap();
        let env = Environment::create(dir.path()).unwrap();

        let initial = env.stats();
        assert_eq!(initial.active_transactions, 0);
        assert!(initial.last_committed_txid >= 1, "boot commit happened");

        put(&env, "kv", b"a", &[0u8; 2000]);
        put(&env, "kv", b"b", &[0u8; 2000]);

        let after_writes = env.stats();
        assert!(after_writes.next_page_number > initial.next_page_number);
        assert!(after_writes.last_committed_txid > initial.last_committed_txid);

        // Copy-on-write frees the superseded pages; the next commits drain
        // them into the free-space map.
        put(&env, "kv", b"a", &[1u8; 2000]);
        put(&env, "kv", b"b", &[1u8; 2000]);
        put(&env, "kv", b"c", b"x");

        let after_churn = env.stats();
        assert!(
            after_churn.free_pages + after_churn.pending_free_pages > 0,
            "superseded pages are tracked for reuse"
        );

        {
            let _reader = env.new_transaction(TransactionKind::Read).unwrap();
            assert_eq!(env.stats().active_transactions, 1);
        }
        assert_eq!(env.stats().active_transactions, 0);
    }

    #[test]
    fn freed_pages_are_reused_by_later_transactions() {
        let dir = tempdir().unwrap();
        let env = Environment::create(dir.path()).unwrap();

        for round in 0..10u8 {
            let mut txn = env.new_transaction(TransactionKind::ReadWrite).unwrap();
            let tree = env.create_tree(&mut txn, "churn").unwrap();
            for i in 0..50u32 {
                let key = format!("key{:03}", i);
                tree.add(&mut txn, key.as_bytes(), &[round; 100]).unwrap();
            }
            txn.commit().unwrap();
        }

        let stats = env.stats();
        // Ten rounds of rewriting the same 50 keys churn the same few
        // pages; reuse keeps the allocation frontier far below what
        // write-once allocation would need.
        assert!(
            stats.next_page_number < 200,
            "next page {} suggests freed pages are not being reused",
            stats.next_page_number
        );
    }
}
