//! Persistence for tracks: console history blocks, turns, and chat entries.
//!
//! The track engine is the only writer of these tables. Writes are single-row
//! inserts/updates except turn-plus-entry creations, which run in one
//! transaction.

mod schema;

pub use schema::*;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, TransactionBehavior};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid (role, message_type) pair: {0} + {1}")]
    InvalidMessagePair(ChatRole, ChatMessageType),
    #[error("duplicate position {position} in track {track_id}")]
    DuplicatePosition { track_id: i64, position: i64 },
    #[error("not found: {0}")]
    NotFound(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Fields of a console history block to persist.
#[derive(Debug, Clone)]
pub struct NewConsoleBlock {
    pub block_type: BlockType,
    pub status: BlockStatus,
    pub command: Option<String>,
    pub output: String,
    pub prompt: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Fields of a tool invocation entry to persist.
#[derive(Debug, Clone)]
pub struct NewToolInvocation {
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub console_prompt: String,
    pub status: ToolStatus,
}

/// Terminal/status update of a tool invocation row.
#[derive(Debug, Clone, Default)]
pub struct ToolUpdate {
    pub result_content: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
    pub denied_reason: Option<String>,
}

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> DbResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("db lock poisoned")
    }

    // ==================== Console history ====================

    pub fn insert_console_block(&self, track_id: i64, block: &NewConsoleBlock) -> DbResult<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO console_history_blocks
                 (track_id, block_type, status, command, output, prompt, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                track_id,
                block.block_type.to_string(),
                block.status.to_string(),
                block.command,
                block.output,
                block.prompt,
                block.started_at.to_rfc3339(),
                block.finished_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_console_blocks(&self, track_id: i64) -> DbResult<Vec<ConsoleBlockRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, track_id, block_type, status, command, output, prompt, started_at, finished_at
             FROM console_history_blocks WHERE track_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![track_id], |row| {
            Ok(ConsoleBlockRow {
                id: row.get(0)?,
                track_id: row.get(1)?,
                block_type: parse_block_type(&row.get::<_, String>(2)?),
                status: parse_block_status(&row.get::<_, String>(3)?),
                command: row.get(4)?,
                output: row.get(5)?,
                prompt: row.get(6)?,
                started_at: parse_datetime(&row.get::<_, String>(7)?),
                finished_at: row.get::<_, Option<String>>(8)?.map(|s| parse_datetime(&s)),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    // ==================== Turns ====================

    pub fn create_turn(
        &self,
        track_id: i64,
        model: &str,
        trigger: &str,
        created_at: DateTime<Utc>,
    ) -> DbResult<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO turns (track_id, model, status, \"trigger\", created_at)
             VALUES (?1, ?2, 'pending', ?3, ?4)",
            params![track_id, model, trigger, created_at.to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_turn_status(&self, turn_id: i64, status: TurnStatus) -> DbResult<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE turns SET status = ?1 WHERE id = ?2",
            params![status.to_string(), turn_id],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound(format!("turn {turn_id}")));
        }
        Ok(())
    }

    pub fn get_turn(&self, turn_id: i64) -> DbResult<TurnRow> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, track_id, model, status, \"trigger\", created_at FROM turns WHERE id = ?1",
            params![turn_id],
            |row| {
                Ok(TurnRow {
                    id: row.get(0)?,
                    track_id: row.get(1)?,
                    model: row.get(2)?,
                    status: parse_turn_status(&row.get::<_, String>(3)?),
                    trigger: row.get(4)?,
                    created_at: parse_datetime(&row.get::<_, String>(5)?),
                })
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::NotFound(format!("turn {turn_id}")),
            other => DbError::Sqlite(other),
        })
    }

    /// Create a turn together with its user prompt entry, atomically.
    pub fn create_turn_with_prompt(
        &self,
        track_id: i64,
        model: &str,
        trigger: &str,
        position: i64,
        prompt: &str,
        created_at: DateTime<Utc>,
    ) -> DbResult<(i64, i64)> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO turns (track_id, model, status, \"trigger\", created_at)
             VALUES (?1, ?2, 'pending', ?3, ?4)",
            params![track_id, model, trigger, created_at.to_rfc3339()],
        )?;
        let turn_id = tx.last_insert_rowid();

        let entry_id = insert_entry(
            &tx,
            track_id,
            Some(turn_id),
            position,
            EntryType::Message,
            created_at,
        )?;
        tx.execute(
            "INSERT INTO chat_messages (entry_id, role, message_type, content)
             VALUES (?1, 'user', 'prompt', ?2)",
            params![entry_id, prompt],
        )?;

        tx.commit()?;
        Ok((turn_id, entry_id))
    }

    // ==================== Chat entries ====================

    pub fn insert_message(
        &self,
        track_id: i64,
        turn_id: Option<i64>,
        position: i64,
        role: ChatRole,
        message_type: ChatMessageType,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> DbResult<i64> {
        if !valid_message_pair(role, message_type) {
            return Err(DbError::InvalidMessagePair(role, message_type));
        }
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let entry_id = insert_entry(
            &tx,
            track_id,
            turn_id,
            position,
            EntryType::Message,
            created_at,
        )?;
        tx.execute(
            "INSERT INTO chat_messages (entry_id, role, message_type, content)
             VALUES (?1, ?2, ?3, ?4)",
            params![entry_id, role.to_string(), message_type.to_string(), content],
        )?;
        tx.commit()?;
        Ok(entry_id)
    }

    pub fn insert_tool_invocation(
        &self,
        track_id: i64,
        turn_id: Option<i64>,
        position: i64,
        tool: &NewToolInvocation,
        created_at: DateTime<Utc>,
    ) -> DbResult<i64> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let entry_id = insert_entry(
            &tx,
            track_id,
            turn_id,
            position,
            EntryType::ToolInvocation,
            created_at,
        )?;
        tx.execute(
            "INSERT INTO chat_tool_invocations
                 (entry_id, tool_call_id, tool_name, arguments, console_prompt, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry_id,
                tool.tool_call_id,
                tool.tool_name,
                tool.arguments.to_string(),
                tool.console_prompt,
                tool.status.to_string(),
            ],
        )?;
        tx.commit()?;
        Ok(entry_id)
    }

    pub fn update_tool_invocation(
        &self,
        entry_id: i64,
        status: ToolStatus,
        update: &ToolUpdate,
    ) -> DbResult<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE chat_tool_invocations
             SET status = ?1,
                 result_content = COALESCE(?2, result_content),
                 error_message = COALESCE(?3, error_message),
                 duration_ms = COALESCE(?4, duration_ms),
                 denied_reason = COALESCE(?5, denied_reason)
             WHERE entry_id = ?6",
            params![
                status.to_string(),
                update.result_content,
                update.error_message,
                update.duration_ms,
                update.denied_reason,
                entry_id,
            ],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound(format!("tool invocation {entry_id}")));
        }
        Ok(())
    }

    pub fn insert_console_context(
        &self,
        track_id: i64,
        position: i64,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> DbResult<i64> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let entry_id = insert_entry(
            &tx,
            track_id,
            None,
            position,
            EntryType::ConsoleContext,
            created_at,
        )?;
        tx.execute(
            "INSERT INTO chat_console_contexts (entry_id, content) VALUES (?1, ?2)",
            params![entry_id, content],
        )?;
        tx.commit()?;
        Ok(entry_id)
    }

    pub fn list_chat_entries(&self, track_id: i64) -> DbResult<Vec<ChatEntryRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT e.id, e.track_id, e.turn_id, e.position, e.entry_type, e.created_at,
                    m.role, m.message_type, m.content,
                    t.tool_call_id, t.tool_name, t.arguments, t.console_prompt, t.status,
                    t.result_content, t.error_message, t.duration_ms, t.denied_reason,
                    c.content
             FROM chat_entries e
             LEFT JOIN chat_messages m ON m.entry_id = e.id
             LEFT JOIN chat_tool_invocations t ON t.entry_id = e.id
             LEFT JOIN chat_console_contexts c ON c.entry_id = e.id
             WHERE e.track_id = ?1
             ORDER BY e.position ASC",
        )?;

        let rows = stmt.query_map(params![track_id], |row| {
            let entry_type = row.get::<_, String>(4)?;
            let content = match entry_type.as_str() {
                "tool_invocation" => ChatEntryContent::ToolInvocation {
                    tool_call_id: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
                    tool_name: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
                    arguments: row
                        .get::<_, Option<String>>(11)?
                        .and_then(|s| serde_json::from_str(&s).ok())
                        .unwrap_or(Value::Null),
                    console_prompt: row.get::<_, Option<String>>(12)?.unwrap_or_default(),
                    status: parse_tool_status(
                        &row.get::<_, Option<String>>(13)?.unwrap_or_default(),
                    ),
                    result_content: row.get(14)?,
                    error_message: row.get(15)?,
                    duration_ms: row.get(16)?,
                    denied_reason: row.get(17)?,
                },
                "console_context" => ChatEntryContent::ConsoleContext {
                    content: row.get::<_, Option<String>>(18)?.unwrap_or_default(),
                },
                _ => ChatEntryContent::Message {
                    role: parse_role(&row.get::<_, Option<String>>(6)?.unwrap_or_default()),
                    message_type: parse_message_type(
                        &row.get::<_, Option<String>>(7)?.unwrap_or_default(),
                    ),
                    content: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
                },
            };
            Ok(ChatEntryRow {
                id: row.get(0)?,
                track_id: row.get(1)?,
                turn_id: row.get(2)?,
                position: row.get(3)?,
                created_at: parse_datetime(&row.get::<_, String>(5)?),
                content,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Highest used position for a track (0 when the track has no entries).
    pub fn max_position(&self, track_id: i64) -> DbResult<i64> {
        let conn = self.lock();
        conn.query_row(
            "SELECT COALESCE(MAX(position), 0) FROM chat_entries WHERE track_id = ?1",
            params![track_id],
            |row| row.get(0),
        )
        .map_err(DbError::from)
    }
}

fn insert_entry(
    tx: &rusqlite::Transaction<'_>,
    track_id: i64,
    turn_id: Option<i64>,
    position: i64,
    entry_type: EntryType,
    created_at: DateTime<Utc>,
) -> DbResult<i64> {
    let result = tx.execute(
        "INSERT INTO chat_entries (track_id, turn_id, position, entry_type, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            track_id,
            turn_id,
            position,
            entry_type.to_string(),
            created_at.to_rfc3339(),
        ],
    );
    match result {
        Ok(_) => Ok(tx.last_insert_rowid()),
        Err(rusqlite::Error::SqliteFailure(e, msg))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            tracing::debug!(track_id, position, error = ?msg, "position conflict");
            Err(DbError::DuplicatePosition { track_id, position })
        }
        Err(e) => Err(DbError::Sqlite(e)),
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
