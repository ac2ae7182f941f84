//! Plaintext shard fixtures for unit tests.

use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::types::Value;
use rusqlite::{params, Connection};
use shardlog_crypto::hash::conversation_hash;

pub struct FixtureMessage {
    pub talker: String,
    pub seq: i64,
    pub time: i64,
    pub sender: String,
    pub local_type: i64,
    pub status: i64,
    pub content: Vec<u8>,
}

impl FixtureMessage {
    pub fn text(talker: &str, seq: i64, time: i64, sender: &str, content: &str) -> Self {
        Self {
            talker: talker.to_string(),
            seq,
            time,
            sender: sender.to_string(),
            local_type: 1,
            status: 3,
            content: content.as_bytes().to_vec(),
        }
    }

    pub fn sent(mut self) -> Self {
        self.status = 2;
        self
    }

    pub fn kind(mut self, local_type: i64) -> Self {
        self.local_type = local_type;
        self
    }

    pub fn raw_content(mut self, content: Vec<u8>) -> Self {
        self.content = content;
        self
    }
}

/// Write a plaintext shard with a `Timestamp` marker and one `Msg_` table
/// per talker.
pub fn shard_db(path: &Path, start_time: i64, messages: &[FixtureMessage]) {
    let conn = Connection::open(path).expect("open fixture shard");
    conn.execute_batch(
        "CREATE TABLE Timestamp (timestamp INTEGER);
         CREATE TABLE Name2Id (user_name TEXT UNIQUE);",
    )
    .expect("base schema");
    conn.execute("INSERT INTO Timestamp (timestamp) VALUES (?1)", [start_time])
        .expect("timestamp");

    let mut sender_ids = BTreeMap::new();
    for msg in messages {
        if !sender_ids.contains_key(&msg.sender) {
            conn.execute("INSERT INTO Name2Id (user_name) VALUES (?1)", [&msg.sender])
                .expect("name2id");
            sender_ids.insert(msg.sender.clone(), conn.last_insert_rowid());
        }

        let content = match String::from_utf8(msg.content.clone()) {
            Ok(text) => Value::Text(text),
            Err(_) => Value::Blob(msg.content.clone()),
        };
        let table = conversation_hash(&msg.talker).table_name();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{table}\" (
                local_id INTEGER PRIMARY KEY AUTOINCREMENT,
                server_id INTEGER,
                local_type INTEGER,
                sort_seq INTEGER,
                real_sender_id INTEGER,
                create_time INTEGER,
                status INTEGER,
                message_content TEXT,
                packed_info_data BLOB
            );"
        ))
        .expect("message table");
        conn.execute(
            &format!(
                "INSERT INTO \"{table}\" (server_id, local_type, sort_seq, real_sender_id, create_time, status, message_content)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ),
            params![
                msg.seq * 100,
                msg.local_type,
                msg.seq,
                sender_ids[&msg.sender],
                msg.time,
                msg.status,
                content,
            ],
        )
        .expect("message row");
    }
}
