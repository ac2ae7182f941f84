//! Integration test: queries through the decrypting VFS.
//!
//! Builds encrypted archives on disk, opens them with the archive key and
//! checks routing, merging and pagination end to end:
//! 1. Two shards for one conversation, paged query across both
//! 2. Three consecutive shards, full-range query
//! 3. Page slices concatenate to the unpaged result

use shardlog_catalog::CancelToken;
use shardlog_integration_tests::{rows, seqs, Archive, Row, FAST_PROFILE};
use shardlog_types::MessageQuery;

const T0: i64 = 1_700_000_000;
const T1: i64 = T0 + 86_400;
const T2: i64 = T1 + 86_400;
const T3: i64 = T2 + 86_400;

#[test]
fn paged_query_spans_two_shards() {
    // =========================================================
    // Shard A: alice 1-5 from T0. Shard B: alice 6-9 from T1.
    // =========================================================
    let archive = Archive::new(FAST_PROFILE);
    archive.add_shard(0, T0, &rows("alice", 1..=5, T0 + 60));
    archive.add_shard(1, T1, &rows("alice", 6..=9, T1 + 60));
    let router = archive.router();

    let shards = router.catalog().list_shards();
    assert_eq!(shards.len(), 2);
    assert_eq!(shards[0].end_time, T1);

    // =========================================================
    // Page 2..5 of the combined range.
    // =========================================================
    let query = MessageQuery::new(["alice"]).between(T0, T2).page(3, 2);
    let page = router.get_messages(&query, &CancelToken::new()).expect("query");
    assert_eq!(seqs(&page), vec![3, 4, 5]);
    assert!(page.iter().all(|m| m.talker == "alice" && m.sender == "alice"));
    assert_eq!(page[0].content, "alice message 3");
}

#[test]
fn three_shards_merge_in_sequence_order() {
    let archive = Archive::new(FAST_PROFILE);
    archive.add_shard(0, T0, &rows("alice", 1..=4, T0 + 10));
    archive.add_shard(1, T1, &rows("alice", 5..=8, T1 + 10));
    archive.add_shard(2, T2, &rows("alice", 9..=12, T2 + 10));
    let router = archive.router();

    let all = router
        .get_messages(&MessageQuery::new(["alice"]).between(T0, T3), &CancelToken::new())
        .expect("query");
    assert_eq!(seqs(&all), (1..=12).collect::<Vec<_>>());

    // A range inside the middle shard only reaches that shard's rows.
    let middle = router
        .get_messages(&MessageQuery::new(["alice"]).between(T1, T1 + 3_600), &CancelToken::new())
        .expect("query");
    assert_eq!(seqs(&middle), vec![5, 6, 7, 8]);
}

#[test]
fn pagination_slices_concatenate() {
    let archive = Archive::new(FAST_PROFILE);
    archive.add_shard(0, T0, &rows("alice", 1..=15, T0 + 10));
    archive.add_shard(1, T1, &rows("alice", 16..=30, T1 + 10));
    let router = archive.router();
    let cancel = CancelToken::new();

    let page = |limit, offset| {
        router
            .get_messages(&MessageQuery::new(["alice"]).page(limit, offset), &cancel)
            .expect("page")
    };
    let first = page(10, 0);
    let second = page(10, 10);
    let both = page(20, 0);

    assert_eq!(first.len(), 10);
    assert_eq!(second.len(), 10);
    let joined: Vec<_> = first.iter().chain(second.iter()).cloned().collect();
    assert_eq!(joined, both);
    assert_eq!(seqs(&both), (1..=20).collect::<Vec<_>>());
}

#[test]
fn group_and_direct_conversations_merge() {
    let archive = Archive::new(FAST_PROFILE);
    let mut first = rows("alice", 1..=3, T0 + 10);
    first.push(Row::new("bob", 4, T0 + 500, "bob says hi"));
    first.push(Row::new("alice", 5, T0 + 600, "thanks").from_self());
    archive.add_shard(0, T0, &first);
    archive.add_shard(1, T1, &[Row::new("bob", 6, T1 + 10, "bob again")]);
    let router = archive.router();
    let cancel = CancelToken::new();

    let both = router
        .get_messages(&MessageQuery::new(["alice", "bob"]), &cancel)
        .expect("query");
    assert_eq!(seqs(&both), vec![1, 2, 3, 4, 5, 6]);
    assert!(both[4].is_self);

    let mine = router
        .get_messages(&MessageQuery::new(["alice", "bob"]).senders(["me"]), &cancel)
        .expect("query");
    assert_eq!(seqs(&mine), vec![5]);

    let keyword = router
        .get_messages(&MessageQuery::new(["alice", "bob"]).keyword("^bob"), &cancel)
        .expect("query");
    assert_eq!(seqs(&keyword), vec![4, 6]);

    let stats = router.global_stats(&cancel).expect("stats");
    assert_eq!((stats.total, stats.sent, stats.received), (6, 1, 5));
}
