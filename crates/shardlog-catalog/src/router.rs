//! Fan-out, merge and pagination across shards.

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;
use rusqlite::Connection;
use shardlog_crypto::hash::conversation_hash;
use shardlog_types::{ConversationHash, GlobalStats, Heatmap, Message, MessageQuery, MonthlyTrend};

use crate::cancel::CancelToken;
use crate::catalog::{Shard, ShardCatalog};
use crate::decode::decode_row;
use crate::{queries, CatalogError, Result};

/// Runs logical message queries against a [`ShardCatalog`].
#[derive(Clone)]
pub struct MessageRouter {
    catalog: Arc<ShardCatalog>,
}

/// Tracks shards whose connection could not be used, to tell a wrong key
/// apart from an empty result.
#[derive(Default)]
struct ShardFailures {
    attempted: usize,
    decrypt: Vec<std::path::PathBuf>,
}

impl ShardFailures {
    fn into_error(self) -> Option<CatalogError> {
        if self.attempted > 0 && self.decrypt.len() == self.attempted {
            self.decrypt.into_iter().next().map(CatalogError::CannotDecrypt)
        } else {
            None
        }
    }
}

/// What to do after a per-table statement failed.
enum TableFailure {
    /// Skip this table and keep reading the shard.
    Skip,
    /// A page failed authentication; give up on the whole shard.
    Shard,
}

impl MessageRouter {
    pub fn new(catalog: Arc<ShardCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &Arc<ShardCatalog> {
        &self.catalog
    }

    /// Messages matching `query`, ordered by `sort_seq` and sliced to
    /// `[offset, offset + limit)`.
    ///
    /// A query whose conversations live in no shard in range yields an
    /// empty result. If every candidate shard fails to decrypt, the result
    /// is [`CatalogError::CannotDecrypt`].
    pub fn get_messages(&self, query: &MessageQuery, cancel: &CancelToken) -> Result<Vec<Message>> {
        let talkers = hashed_talkers(&query.talkers);
        if talkers.is_empty() {
            return Err(CatalogError::EmptyTalker);
        }
        let keyword = match query.keyword.as_deref() {
            Some(pattern) if !pattern.is_empty() => Some(Regex::new(pattern)?),
            _ => None,
        };

        let hashes: Vec<ConversationHash> = talkers.iter().map(|(_, hash)| *hash).collect();
        let shards = self.catalog.locate(&hashes, query.start, query.end);
        tracing::debug!(talkers = talkers.len(), shards = shards.len(), start = query.start, end = query.end, "routing message query");
        if shards.is_empty() {
            return Ok(Vec::new());
        }

        // Shards are visited in start-time order, which matches sort_seq
        // order only within a single conversation.
        let early_exit = talkers.len() == 1 && query.limit > 0;
        let wanted = query.offset.saturating_add(query.limit);

        let mut collected = Vec::new();
        let mut failures = ShardFailures::default();
        'shards: for shard in &shards {
            cancel.check()?;
            failures.attempted += 1;
            let conn = match self.catalog.connection(shard) {
                Ok(conn) => conn,
                Err(err) => {
                    record_failure(&mut failures, shard, &err);
                    continue;
                }
            };

            let mut from_shard = Vec::new();
            for (talker, hash) in &talkers {
                if !shard.contains(hash) {
                    continue;
                }
                cancel.check()?;
                let rows = match queries::messages(&conn, hash, query.start, query.end, &query.senders) {
                    Ok(rows) => rows,
                    Err(err) => match self.table_failed(&mut failures, shard, hash, err) {
                        TableFailure::Skip => continue,
                        TableFailure::Shard => continue 'shards,
                    },
                };

                for row in rows {
                    let message = decode_row(row, talker, *hash);
                    if let Some(re) = &keyword {
                        if !re.is_match(&message.plain_text()) {
                            continue;
                        }
                    }
                    from_shard.push(message);
                }
            }
            collected.append(&mut from_shard);

            if early_exit && collected.len() >= wanted {
                tracing::debug!(collected = collected.len(), shard = %shard.id, "enough messages, stopping early");
                break;
            }
        }

        if collected.is_empty() {
            if let Some(err) = failures.into_error() {
                return Err(err);
            }
        }

        collected.sort_by_key(|m| m.seq);
        let page = paginate(collected, query.offset, query.limit);
        tracing::debug!(count = page.len(), "message query done");
        Ok(page)
    }

    /// Stream every message of `talkers`, shard by shard.
    ///
    /// An empty `talkers` list visits every conversation in the catalog;
    /// those messages carry the hex hash as their talker. The connection in
    /// use is checked out of the pool, so other readers of the same shard are
    /// not held up by `handler`.
    pub fn iterate_messages<F>(&self, talkers: &[String], cancel: &CancelToken, mut handler: F) -> Result<()>
    where
        F: FnMut(Message) -> Result<()>,
    {
        let targets = if talkers.is_empty() {
            self.catalog
                .conversation_hashes()
                .into_iter()
                .map(|hash| (hash.to_hex(), hash))
                .collect()
        } else {
            hashed_talkers(talkers)
        };
        if targets.is_empty() {
            return Ok(());
        }

        for shard in self.catalog.shards() {
            cancel.check()?;
            let conn = match self.catalog.connection(&shard) {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::warn!(shard = %shard.id, error = %err, "skipping shard");
                    continue;
                }
            };

            for (talker, hash) in &targets {
                if !shard.contains(hash) {
                    continue;
                }
                cancel.check()?;
                let streamed = queries::for_each_message(&conn, hash, |row| {
                    cancel.check()?;
                    handler(decode_row(row, talker, *hash))
                });
                match streamed {
                    Ok(()) => {}
                    Err(err) if err.is_missing_table() => skip_table(&shard, hash, &err),
                    Err(err) => return Err(self.catalog.classify(&shard, err)),
                }
            }
        }
        Ok(())
    }

    /// Totals across every conversation table of every shard.
    pub fn global_stats(&self, cancel: &CancelToken) -> Result<GlobalStats> {
        let mut stats = GlobalStats::default();
        let failures = self.for_each_table(None, cancel, |conn, hash| {
            stats.merge(&queries::table_stats(conn, hash)?);
            Ok(())
        })?;

        if stats.total == 0 {
            if let Some(err) = failures.into_error() {
                return Err(err);
            }
        }
        Ok(stats)
    }

    /// Message count per group conversation, summed over every shard.
    ///
    /// Groups that appear in no shard are reported with a zero count.
    pub fn group_message_counts(
        &self,
        groups: &[String],
        cancel: &CancelToken,
    ) -> Result<BTreeMap<String, u64>> {
        let targets = hashed_talkers(groups);
        if targets.is_empty() {
            return Err(CatalogError::EmptyTalker);
        }
        let hashes: Vec<ConversationHash> = targets.iter().map(|(_, hash)| *hash).collect();

        let mut by_hash: BTreeMap<ConversationHash, u64> = BTreeMap::new();
        let failures = self.for_each_table(Some(&hashes), cancel, |conn, hash| {
            *by_hash.entry(*hash).or_default() += queries::message_count(conn, hash)?;
            Ok(())
        })?;

        if by_hash.is_empty() {
            if let Some(err) = failures.into_error() {
                return Err(err);
            }
        }
        Ok(targets
            .into_iter()
            .map(|(group, hash)| {
                let count = by_hash.get(&hash).copied().unwrap_or_default();
                (group, count)
            })
            .collect())
    }

    /// Sent/received counts per UTC month across every conversation,
    /// ascending. A non-zero `months` keeps only the most recent months.
    pub fn monthly_trend(&self, months: usize, cancel: &CancelToken) -> Result<Vec<MonthlyTrend>> {
        let mut by_month: BTreeMap<String, (u64, u64)> = BTreeMap::new();
        let failures = self.for_each_table(None, cancel, |conn, hash| {
            for bucket in queries::monthly_counts(conn, hash)? {
                let entry = by_month.entry(bucket.month).or_default();
                entry.0 += bucket.sent;
                entry.1 += bucket.received;
            }
            Ok(())
        })?;

        if by_month.is_empty() {
            if let Some(err) = failures.into_error() {
                return Err(err);
            }
        }
        let skip = if months == 0 { 0 } else { by_month.len().saturating_sub(months) };
        Ok(by_month
            .into_iter()
            .skip(skip)
            .map(|(month, (sent, received))| MonthlyTrend { month, sent, received })
            .collect())
    }

    /// Message counts by UTC hour and weekday across every conversation.
    pub fn heatmap(&self, cancel: &CancelToken) -> Result<Heatmap> {
        let mut grid = Heatmap::default();
        let failures = self.for_each_table(None, cancel, |conn, hash| {
            grid.merge(&queries::hour_weekday_counts(conn, hash)?);
            Ok(())
        })?;

        if grid.total() == 0 {
            if let Some(err) = failures.into_error() {
                return Err(err);
            }
        }
        Ok(grid)
    }

    /// Run `visit` on every conversation table of every shard, or only on
    /// the tables of `only` when given.
    ///
    /// Per-table failures are logged and skipped; a shard whose pages fail
    /// authentication is abandoned and counted in the returned failures.
    fn for_each_table<F>(
        &self,
        only: Option<&[ConversationHash]>,
        cancel: &CancelToken,
        mut visit: F,
    ) -> Result<ShardFailures>
    where
        F: FnMut(&Connection, &ConversationHash) -> Result<()>,
    {
        let mut failures = ShardFailures::default();
        for shard in self.catalog.shards() {
            let mut hashes: Vec<ConversationHash> = match only {
                Some(wanted) => wanted.iter().filter(|h| shard.contains(h)).copied().collect(),
                None => shard.conversations.iter().copied().collect(),
            };
            if hashes.is_empty() {
                continue;
            }
            hashes.sort();

            cancel.check()?;
            failures.attempted += 1;
            let conn = match self.catalog.connection(&shard) {
                Ok(conn) => conn,
                Err(err) => {
                    record_failure(&mut failures, &shard, &err);
                    continue;
                }
            };

            for hash in &hashes {
                cancel.check()?;
                if let Err(err) = visit(&*conn, hash) {
                    if let TableFailure::Shard = self.table_failed(&mut failures, &shard, hash, err) {
                        break;
                    }
                }
            }
        }
        Ok(failures)
    }

    fn table_failed(
        &self,
        failures: &mut ShardFailures,
        shard: &Shard,
        hash: &ConversationHash,
        err: CatalogError,
    ) -> TableFailure {
        let err = self.catalog.classify(shard, err);
        if err.is_decrypt_failure() {
            record_failure(failures, shard, &err);
            TableFailure::Shard
        } else {
            skip_table(shard, hash, &err);
            TableFailure::Skip
        }
    }
}

fn hashed_talkers(talkers: &[String]) -> Vec<(String, ConversationHash)> {
    let mut out: Vec<(String, ConversationHash)> = Vec::with_capacity(talkers.len());
    for talker in talkers.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
        if !out.iter().any(|(seen, _)| seen == talker) {
            out.push((talker.to_string(), conversation_hash(talker)));
        }
    }
    out
}

fn record_failure(failures: &mut ShardFailures, shard: &Shard, err: &CatalogError) {
    tracing::warn!(shard = %shard.id, error = %err, "shard unavailable");
    if err.is_decrypt_failure() {
        failures.decrypt.push(shard.file_path.clone());
    }
}

/// [`CatalogError::SchemaDrift`] for `err` if it reports a missing table.
fn schema_drift(shard: &Shard, hash: &ConversationHash, err: &CatalogError) -> Option<CatalogError> {
    err.is_missing_table().then(|| CatalogError::SchemaDrift {
        shard: shard.file_path.clone(),
        detail: format!("{}: {err}", hash.table_name()),
    })
}

fn skip_table(shard: &Shard, hash: &ConversationHash, err: &CatalogError) {
    match schema_drift(shard, hash, err) {
        Some(drift) => tracing::warn!(error = %drift, "skipping conversation table"),
        None => {
            tracing::warn!(shard = %shard.id, table = %hash.table_name(), error = %err, "conversation table unreadable, skipping")
        }
    }
}

/// `[offset, offset + limit)` of `messages`; a zero limit keeps everything
/// after `offset`.
fn paginate(messages: Vec<Message>, offset: usize, limit: usize) -> Vec<Message> {
    let take = if limit == 0 { usize::MAX } else { limit };
    messages.into_iter().skip(offset).take(take).collect()
}
