//! SQL run against a single shard.
//!
//! Table names always come from [`ConversationHash::table_name`], so they are
//! `Msg_` plus 32 hex digits and safe to splice into statements.

use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection, Row};
use shardlog_types::{ConversationHash, GlobalStats, Heatmap, MessageKind, MonthlyTrend, UnixSeconds};

use crate::Result;

/// Columns selected for every message query, in [`RawMessageRow`] order.
const MESSAGE_COLUMNS: &str = "m.sort_seq, m.server_id, m.local_type, n.user_name, m.create_time, m.message_content, m.status";

/// Read the shard's start-time marker.
pub fn start_time(conn: &Connection) -> Result<UnixSeconds> {
    Ok(conn.query_row("SELECT timestamp FROM Timestamp LIMIT 1", [], |row| row.get(0))?)
}

/// Names of every `Msg_%` table in the shard.
pub fn conversation_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'Msg_%'")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(names)
}

/// Conversation hashes present in the shard. Tables whose suffix is not a
/// 128-bit hex digest are ignored.
pub fn conversations(conn: &Connection) -> Result<Vec<ConversationHash>> {
    Ok(conversation_tables(conn)?
        .iter()
        .filter_map(|name| ConversationHash::from_table_name(name))
        .collect())
}

/// Messages of one conversation in `[start, end]`, optionally restricted to
/// senders, ordered by `sort_seq`.
pub fn messages(
    conn: &Connection,
    hash: &ConversationHash,
    start: UnixSeconds,
    end: UnixSeconds,
    senders: &[String],
) -> Result<Vec<RawMessageRow>> {
    let mut sql = format!(
        "SELECT {MESSAGE_COLUMNS}
         FROM \"{}\" m
         LEFT JOIN Name2Id n ON m.real_sender_id = n.rowid
         WHERE m.create_time >= ?1 AND m.create_time <= ?2",
        hash.table_name()
    );
    let mut args = vec![Value::Integer(start), Value::Integer(end)];
    if !senders.is_empty() {
        let placeholders: Vec<String> = (0..senders.len()).map(|i| format!("?{}", i + 3)).collect();
        sql.push_str(&format!(" AND n.user_name IN ({})", placeholders.join(", ")));
        args.extend(senders.iter().cloned().map(Value::Text));
    }
    sql.push_str(" ORDER BY m.sort_seq ASC");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args.iter()), RawMessageRow::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Stream every message of one conversation in `sort_seq` order.
pub fn for_each_message<F>(conn: &Connection, hash: &ConversationHash, mut f: F) -> Result<()>
where
    F: FnMut(RawMessageRow) -> Result<()>,
{
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS}
         FROM \"{}\" m
         LEFT JOIN Name2Id n ON m.real_sender_id = n.rowid
         ORDER BY m.sort_seq ASC",
        hash.table_name()
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        f(RawMessageRow::from_row(row)?)?;
    }
    Ok(())
}

/// Totals, sent/received split, time bounds and per-kind counts for one
/// conversation table.
pub fn table_stats(conn: &Connection, hash: &ConversationHash) -> Result<GlobalStats> {
    let table = hash.table_name();
    let (total, sent, earliest, latest) = conn.query_row(
        &format!(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 2 THEN 1 ELSE 0 END), 0),
                    MIN(create_time),
                    MAX(create_time)
             FROM \"{table}\""
        ),
        [],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, Option<i64>>(3)?,
            ))
        },
    )?;

    let mut stats = GlobalStats {
        total: total as u64,
        sent: sent as u64,
        received: (total - sent) as u64,
        earliest_time: earliest.filter(|&t| t > 0),
        latest_time: latest,
        ..GlobalStats::default()
    };

    let mut stmt = conn.prepare(&format!("SELECT local_type, COUNT(*) FROM \"{table}\" GROUP BY local_type"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let kind = MessageKind::from_local_type(row.get(0)?);
        *stats.by_kind.entry(kind.label().to_string()).or_default() += row.get::<_, i64>(1)? as u64;
    }
    Ok(stats)
}

/// Number of messages in one conversation table.
pub fn message_count(conn: &Connection, hash: &ConversationHash) -> Result<u64> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM \"{}\"", hash.table_name()), [], |row| {
        row.get(0)
    })?;
    Ok(count as u64)
}

/// Sent/received counts per UTC month of one conversation table, ascending.
pub fn monthly_counts(conn: &Connection, hash: &ConversationHash) -> Result<Vec<MonthlyTrend>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT strftime('%Y-%m', create_time, 'unixepoch') AS ym,
                SUM(CASE WHEN status = 2 THEN 1 ELSE 0 END),
                SUM(CASE WHEN status != 2 OR status IS NULL THEN 1 ELSE 0 END)
         FROM \"{}\"
         WHERE create_time IS NOT NULL
         GROUP BY ym
         ORDER BY ym",
        hash.table_name()
    ))?;
    let months = stmt
        .query_map([], |row| {
            Ok(MonthlyTrend {
                month: row.get(0)?,
                sent: row.get::<_, i64>(1)? as u64,
                received: row.get::<_, i64>(2)? as u64,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(months)
}

/// Message counts of one conversation table by UTC hour and weekday.
pub fn hour_weekday_counts(conn: &Connection, hash: &ConversationHash) -> Result<Heatmap> {
    let mut stmt = conn.prepare(&format!(
        "SELECT CAST(strftime('%H', create_time, 'unixepoch') AS INTEGER) AS h,
                CAST(strftime('%w', create_time, 'unixepoch') AS INTEGER) AS d,
                COUNT(*)
         FROM \"{}\"
         WHERE create_time IS NOT NULL
         GROUP BY h, d",
        hash.table_name()
    ))?;
    let mut grid = Heatmap::default();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        grid.add(row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? as u64);
    }
    Ok(grid)
}

/// A message row as stored, before decoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMessageRow {
    pub sort_seq: i64,
    pub server_id: i64,
    pub local_type: i64,
    /// `Name2Id.user_name`; `None` when the sender id has no entry.
    pub sender: Option<String>,
    pub create_time: UnixSeconds,
    /// Raw `message_content`; text or a zstd frame.
    pub content: Vec<u8>,
    pub status: i64,
}

impl RawMessageRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let content = match row.get_ref(5)? {
            ValueRef::Text(bytes) | ValueRef::Blob(bytes) => bytes.to_vec(),
            ValueRef::Null => Vec::new(),
            ValueRef::Integer(i) => i.to_string().into_bytes(),
            ValueRef::Real(f) => f.to_string().into_bytes(),
        };
        Ok(Self {
            sort_seq: row.get(0)?,
            server_id: row.get::<_, Option<i64>>(1)?.unwrap_or_default(),
            local_type: row.get::<_, Option<i64>>(2)?.unwrap_or_default(),
            sender: row.get(3)?,
            create_time: row.get::<_, Option<i64>>(4)?.unwrap_or_default(),
            content,
            status: row.get::<_, Option<i64>>(6)?.unwrap_or_default(),
        })
    }
}
