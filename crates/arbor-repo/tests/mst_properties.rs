//! Property-style tests for tree shape and diffs
//!
//! Random key sets and shuffled insertion orders, seeded so failures reproduce.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use arbor_repo::codec;
use arbor_repo::mst::{Mst, diff};
use arbor_repo::storage::{BlockStore, MemoryBlockStore};
use cid::Cid as IpldCid;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const EMPTY_ROOT: &str = "bafyreie5737gdxlw5i64vzichcalba3z2v5n6icifvx5xytvske7mr3hpm";

fn random_keys(rng: &mut StdRng, n: usize) -> Vec<String> {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";
    let mut keys = BTreeSet::new();
    while keys.len() < n {
        let rkey: String = (0..13)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        let collection = ["app.example.post", "app.example.like", "com.example.thing"]
            [rng.gen_range(0..3)];
        keys.insert(format!("{}/{}", collection, rkey));
    }
    keys.into_iter().collect()
}

fn value_for(key: &str, version: u32) -> IpldCid {
    codec::cid_for(&format!("{}@{}", key, version)).unwrap().0
}

async fn build(keys: &[String], version: u32) -> Mst<MemoryBlockStore> {
    let mut mst = Mst::new(Arc::new(MemoryBlockStore::new())).await.unwrap();
    for key in keys {
        mst = mst.insert(key, value_for(key, version)).await.unwrap();
    }
    mst
}

/// CIDs of every node and record reachable from the tree's root
async fn closure(mst: &Mst<MemoryBlockStore>) -> HashSet<IpldCid> {
    let mut cids: HashSet<IpldCid> = mst.node_cids().await.unwrap().into_iter().collect();
    cids.extend(mst.leaves().await.unwrap().into_iter().map(|(_, cid)| cid));
    cids
}

#[tokio::test]
async fn empty_tree_block() {
    let mst = Mst::new(Arc::new(MemoryBlockStore::new())).await.unwrap();
    assert_eq!(mst.root().to_string(), EMPTY_ROOT);

    let bytes = mst.storage().get(&mst.root()).await.unwrap().unwrap();
    assert_eq!(hex::encode(&bytes), "a2616580616cf6");
}

#[tokio::test]
async fn root_is_independent_of_insertion_order() {
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for n in [1, 2, 7, 50, 300] {
        let mut keys = random_keys(&mut rng, n);
        let expected = build(&keys, 0).await.root();

        for _ in 0..3 {
            keys.shuffle(&mut rng);
            assert_eq!(build(&keys, 0).await.root(), expected, "{} keys", n);
        }
    }
}

#[tokio::test]
async fn thousand_keys_twice() {
    let mut rng = StdRng::seed_from_u64(1000);
    let mut keys = random_keys(&mut rng, 1000);

    let first = build(&keys, 0).await;
    keys.reverse();
    let second = build(&keys, 0).await;

    assert_eq!(first.root(), second.root());
    assert_eq!(first.leaf_count().await.unwrap(), 1000);
}

#[tokio::test]
async fn deletes_restore_the_smaller_tree() {
    let mut rng = StdRng::seed_from_u64(42);
    let keys = random_keys(&mut rng, 200);
    let (kept, removed) = keys.split_at(120);

    let mut mst = build(&keys, 0).await;
    let mut removed = removed.to_vec();
    removed.shuffle(&mut rng);
    for key in &removed {
        mst = mst.delete(key).await.unwrap();
    }
    assert_eq!(mst.root(), build(kept, 0).await.root());

    for key in kept {
        mst = mst.delete(key).await.unwrap();
    }
    assert_eq!(mst.root().to_string(), EMPTY_ROOT);
}

#[tokio::test]
async fn leaves_come_back_sorted() {
    let mut rng = StdRng::seed_from_u64(7);
    let keys = random_keys(&mut rng, 150);
    let mst = build(&keys, 0).await;

    let mut sorted = keys.clone();
    sorted.sort();
    let listed: Vec<String> = mst
        .leaves()
        .await
        .unwrap()
        .into_iter()
        .map(|(key, _)| key.to_string())
        .collect();
    assert_eq!(listed, sorted);
}

#[tokio::test]
async fn diff_of_a_tree_with_itself_is_empty() {
    let mut rng = StdRng::seed_from_u64(3);
    let mst = build(&random_keys(&mut rng, 100), 0).await;

    let delta = diff(mst.storage(), Some(mst.root()), mst.root()).await.unwrap();
    assert!(delta.is_empty());
    assert!(delta.new_blocks.is_empty());
    assert!(delta.removed_mst_blocks.is_empty());
}

#[tokio::test]
async fn diff_new_blocks_are_exactly_what_the_old_tree_lacks() {
    let mut rng = StdRng::seed_from_u64(99);
    let keys = random_keys(&mut rng, 250);
    let old = build(&keys, 0).await;
    let old_closure = closure(&old).await;

    // same storage, so the old tree's blocks stay resolvable
    let mut new = old.clone();
    for key in keys.iter().take(10) {
        new = new.delete(key).await.unwrap();
    }
    for key in keys.iter().skip(10).take(10) {
        new = new.update(key, value_for(key, 1)).await.unwrap();
    }
    for key in random_keys(&mut rng, 10) {
        if !keys.contains(&key) {
            new = new.insert(&key, value_for(&key, 0)).await.unwrap();
        }
    }

    let delta = old.diff(&new).await.unwrap();
    assert_eq!(delta.deletes.len(), 10);
    assert_eq!(delta.updates.len(), 10);

    let new_closure = closure(&new).await;
    let expected: HashSet<IpldCid> = new_closure.difference(&old_closure).copied().collect();
    let actual: HashSet<IpldCid> = delta.new_blocks.iter().copied().collect();
    assert_eq!(actual, expected);
    assert_eq!(actual.len(), delta.new_blocks.len(), "no duplicates");

    // replaying the diff on the old tree lands on the new root
    let replayed = old.batch(&delta.to_write_ops()).await.unwrap();
    assert_eq!(replayed.root(), new.root());
}

#[tokio::test]
async fn diff_never_resends_records_the_old_tree_holds() {
    let same = codec::cid_for(&"same body").unwrap().0;
    let other = codec::cid_for(&"other body").unwrap().0;

    let old = Mst::new(Arc::new(MemoryBlockStore::new())).await.unwrap();
    let old = old.insert("com.example/aaa", same).await.unwrap();
    let old = old.insert("com.example/ccc", other).await.unwrap();

    // identical bodies under new keys, and a value moving between keys
    let new = old.insert("com.example/bbb", same).await.unwrap();
    let new = new.update("com.example/ccc", same).await.unwrap();
    let new = new.insert("com.example/ddd", other).await.unwrap();

    let delta = old.diff(&new).await.unwrap();
    assert_eq!(delta.creates.len(), 2);
    assert_eq!(delta.updates.len(), 1);

    let old_closure = closure(&old).await;
    let expected: HashSet<IpldCid> = closure(&new)
        .await
        .difference(&old_closure)
        .copied()
        .collect();
    let actual: HashSet<IpldCid> = delta.new_blocks.iter().copied().collect();
    assert_eq!(actual, expected);
    assert!(!actual.contains(&same));
    assert!(!actual.contains(&other));
}

#[tokio::test]
async fn diff_from_nothing_covers_the_whole_tree() {
    let mut rng = StdRng::seed_from_u64(5);
    let mst = build(&random_keys(&mut rng, 80), 0).await;

    let delta = diff(mst.storage(), None, mst.root()).await.unwrap();
    assert_eq!(delta.creates.len(), 80);
    let all: HashSet<IpldCid> = delta.new_blocks.iter().copied().collect();
    assert_eq!(all, closure(&mst).await);
    assert_eq!(delta.new_blocks[0], mst.root());
}
