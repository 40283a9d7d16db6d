use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use rusqlite::backup::Backup;
use rusqlite::types::{Type, Value};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use uuid::Uuid;

use crate::models::{
    BroadcastSession, Category, Channel, ChatMessage, LifecycleError, MetadataUpdate,
    OverlayStyle, RecordedPart,
};
use crate::sqlite::{from_millis, millis, open_connection, open_flags};

use super::{
    CaptureStore, ChannelFilter, PartFilter, SessionFilter, StoreError, StoreResult,
};

const STORE_SCHEMA: &str = include_str!("../../../sql/store.sql");

#[derive(Debug, Clone)]
pub struct SqliteCaptureStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteCaptureStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteCaptureStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> StoreResult<SqliteCaptureStore> {
        let path = self.path.ok_or(StoreError::MissingStore)?;
        let flags = open_flags(self.read_only, self.create_if_missing);
        Ok(SqliteCaptureStore { path, flags })
    }
}

/// SQLite-backed [`CaptureStore`]. Each call opens its own connection so the
/// store can be shared freely between tasks.
#[derive(Debug, Clone)]
pub struct SqliteCaptureStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteCaptureStore {
    pub fn builder() -> SqliteCaptureStoreBuilder {
        SqliteCaptureStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        SqliteCaptureStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> StoreResult<Connection> {
        open_connection(&self.path, self.flags).map_err(|source| StoreError::Open {
            source,
            path: self.path.clone(),
        })
    }

    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(STORE_SCHEMA)?;
        Ok(())
    }

    pub fn backup_to(&self, destination: impl AsRef<Path>) -> StoreResult<()> {
        let destination_path = destination.as_ref();
        let source = self.open()?;
        let mut dest = Connection::open(destination_path)?;
        let backup = Backup::new(&source, &mut dest)?;
        backup.run_to_completion(10, StdDuration::from_millis(50), None)?;
        Ok(())
    }
}

fn uuid_column(row: &Row<'_>, column: &str) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(column)?;
    Uuid::parse_str(&raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err))
    })
}

fn category_columns(row: &Row<'_>) -> rusqlite::Result<Option<Category>> {
    let id: Option<String> = row.get("category_id")?;
    let name: Option<String> = row.get("category_name")?;
    Ok(name.map(|name| Category { id, name }))
}

fn channel_from_row(row: &Row<'_>) -> rusqlite::Result<Channel> {
    let style: String = row.get("overlay_style")?;
    let overlay: OverlayStyle = serde_json::from_str(&style).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err))
    })?;
    Ok(Channel {
        id: row.get("id")?,
        login: row.get("login")?,
        display_name: row.get("display_name")?,
        active: row.get("active")?,
        quality: row.get("quality")?,
        overlay,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<BroadcastSession> {
    Ok(BroadcastSession {
        id: uuid_column(row, "id")?,
        channel_id: row.get("channel_id")?,
        platform_stream_id: row.get("platform_stream_id")?,
        title: row.get("title")?,
        category: category_columns(row)?,
        started_at: from_millis(row.get("started_at_ms")?),
        ended_at: row.get::<_, Option<i64>>("ended_at_ms")?.map(from_millis),
    })
}

fn part_from_row(row: &Row<'_>) -> rusqlite::Result<RecordedPart> {
    Ok(RecordedPart {
        id: uuid_column(row, "id")?,
        session_id: uuid_column(row, "session_id")?,
        channel_id: row.get("channel_id")?,
        part_number: row.get("part_number")?,
        quality: row.get("quality")?,
        path: PathBuf::from(row.get::<_, String>("path")?),
        started_at: from_millis(row.get("started_at_ms")?),
        ended_at: row.get::<_, Option<i64>>("ended_at_ms")?.map(from_millis),
        output_path: row.get::<_, Option<String>>("output_path")?.map(PathBuf::from),
    })
}

fn chat_from_row(row: &Row<'_>) -> rusqlite::Result<ChatMessage> {
    let badges: String = row.get("badges")?;
    let badges: Vec<String> = serde_json::from_str(&badges).unwrap_or_default();
    Ok(ChatMessage {
        id: row.get("id")?,
        channel_id: row.get("channel_id")?,
        author: row.get("author")?,
        text: row.get("text")?,
        color: row.get("color")?,
        badges,
        moderator: row.get("moderator")?,
        subscriber: row.get("subscriber")?,
        first_message: row.get("first_message")?,
        timestamp: from_millis(row.get("timestamp_ms")?),
    })
}

fn query_rows<T>(
    conn: &Connection,
    query: &str,
    params: &[Value],
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> StoreResult<Vec<T>> {
    let mut stmt = conn.prepare(query)?;
    let mut rows = stmt.query(rusqlite::params_from_iter(
        params.iter().map(|value| value as &dyn rusqlite::ToSql),
    ))?;
    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        entries.push(map(row)?);
    }
    Ok(entries)
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl SqliteCaptureStore {
    /// Distinguishes a missing row from one that already ended after a
    /// guarded `UPDATE ... WHERE ended_at_ms IS NULL` touched nothing.
    fn end_failure(
        &self,
        conn: &Connection,
        table: &str,
        kind: &'static str,
        id: Uuid,
    ) -> StoreError {
        let exists = conn
            .query_row(
                &format!("SELECT ended_at_ms FROM {table} WHERE id = ?1"),
                [id.to_string()],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional();
        match exists {
            Ok(Some(Some(_))) if kind == "part" => LifecycleError::PartAlreadyEnded(id).into(),
            Ok(Some(Some(_))) => LifecycleError::SessionAlreadyEnded(id).into(),
            Ok(Some(None)) => LifecycleError::EndBeforeStart(id).into(),
            Ok(None) => StoreError::NotFound {
                kind,
                id: id.to_string(),
            },
            Err(err) => StoreError::Execute(err),
        }
    }
}

impl CaptureStore for SqliteCaptureStore {
    fn get_channel(&self, id: &str) -> StoreResult<Option<Channel>> {
        let conn = self.open()?;
        let channel = conn
            .query_row(
                "SELECT * FROM channels WHERE id = ?1",
                [id],
                channel_from_row,
            )
            .optional()?;
        Ok(channel)
    }

    fn list_channels(&self, filter: &ChannelFilter) -> StoreResult<Vec<Channel>> {
        let conn = self.open()?;
        let query = if filter.active_only {
            "SELECT * FROM channels WHERE active = 1 ORDER BY id"
        } else {
            "SELECT * FROM channels ORDER BY id"
        };
        query_rows(&conn, query, &[], channel_from_row)
    }

    fn save_channel(&self, channel: &Channel) -> StoreResult<()> {
        let conn = self.open()?;
        let style = serde_json::to_string(&channel.overlay)?;
        conn.execute(
            "INSERT INTO channels (id, login, display_name, active, quality, overlay_style)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                login = excluded.login,
                display_name = excluded.display_name,
                active = excluded.active,
                quality = excluded.quality,
                overlay_style = excluded.overlay_style,
                updated_at = CURRENT_TIMESTAMP",
            params![
                &channel.id,
                &channel.login,
                &channel.display_name,
                channel.active,
                &channel.quality,
                style
            ],
        )?;
        Ok(())
    }

    fn delete_channel(&self, id: &str) -> StoreResult<bool> {
        let conn = self.open()?;
        let affected = conn.execute("DELETE FROM channels WHERE id = ?1", [id])?;
        Ok(affected > 0)
    }

    fn create_session(&self, session: &BroadcastSession) -> StoreResult<()> {
        let conn = self.open()?;
        let (category_id, category_name) = match &session.category {
            Some(category) => (category.id.clone(), Some(category.name.clone())),
            None => (None, None),
        };
        conn.execute(
            "INSERT INTO broadcast_sessions (
                id, channel_id, platform_stream_id, title, category_id, category_name,
                started_at_ms, ended_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session.id.to_string(),
                &session.channel_id,
                &session.platform_stream_id,
                &session.title,
                category_id,
                category_name,
                millis(session.started_at),
                session.ended_at.map(millis)
            ],
        )
        .map_err(|err| match err {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::NotFound {
                    kind: "channel",
                    id: session.channel_id.clone(),
                }
            }
            other => StoreError::Execute(other),
        })?;
        Ok(())
    }

    fn get_session(&self, id: Uuid) -> StoreResult<Option<BroadcastSession>> {
        let conn = self.open()?;
        let session = conn
            .query_row(
                "SELECT * FROM broadcast_sessions WHERE id = ?1",
                [id.to_string()],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    fn list_sessions(&self, filter: &SessionFilter) -> StoreResult<Vec<BroadcastSession>> {
        let conn = self.open()?;
        let mut query = String::from("SELECT * FROM broadcast_sessions WHERE 1 = 1");
        let mut params: Vec<Value> = Vec::new();
        if let Some(channel_id) = &filter.channel_id {
            query.push_str(" AND channel_id = ?");
            params.push(Value::Text(channel_id.clone()));
        }
        if filter.open_only {
            query.push_str(" AND ended_at_ms IS NULL");
        }
        query.push_str(" ORDER BY started_at_ms ASC");
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ?");
            params.push(Value::Integer(limit as i64));
        }
        query_rows(&conn, &query, &params, session_from_row)
    }

    fn update_session_metadata(
        &self,
        id: Uuid,
        title: Option<&str>,
        category: Option<&Category>,
    ) -> StoreResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE broadcast_sessions SET
                title = COALESCE(?1, title),
                category_id = CASE WHEN ?3 IS NULL THEN category_id ELSE ?2 END,
                category_name = COALESCE(?3, category_name)
             WHERE id = ?4 AND ended_at_ms IS NULL",
            params![
                title,
                category.and_then(|c| c.id.clone()),
                category.map(|c| c.name.clone()),
                id.to_string()
            ],
        )?;
        if affected == 0 {
            return Err(self.end_failure(&conn, "broadcast_sessions", "session", id));
        }
        Ok(())
    }

    fn end_session(&self, id: Uuid, ended_at: DateTime<Utc>) -> StoreResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE broadcast_sessions SET ended_at_ms = ?1
             WHERE id = ?2 AND ended_at_ms IS NULL AND started_at_ms <= ?1",
            params![millis(ended_at), id.to_string()],
        )?;
        if affected == 0 {
            return Err(self.end_failure(&conn, "broadcast_sessions", "session", id));
        }
        Ok(())
    }

    fn record_metadata_update(&self, update: &MetadataUpdate) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO metadata_updates (id, channel_id, title, category_id, category_name, recorded_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                update.id.to_string(),
                &update.channel_id,
                &update.title,
                update.category.as_ref().and_then(|c| c.id.clone()),
                update.category.as_ref().map(|c| c.name.clone()),
                millis(update.recorded_at)
            ],
        )?;
        Ok(())
    }

    fn create_part(&self, part: &RecordedPart) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO recorded_parts (
                id, session_id, channel_id, part_number, quality, path,
                started_at_ms, ended_at_ms, output_path
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                part.id.to_string(),
                part.session_id.to_string(),
                &part.channel_id,
                part.part_number,
                &part.quality,
                path_text(&part.path),
                millis(part.started_at),
                part.ended_at.map(millis),
                part.output_path.as_deref().map(path_text)
            ],
        )?;
        Ok(())
    }

    fn get_part(&self, id: Uuid) -> StoreResult<Option<RecordedPart>> {
        let conn = self.open()?;
        let part = conn
            .query_row(
                "SELECT * FROM recorded_parts WHERE id = ?1",
                [id.to_string()],
                part_from_row,
            )
            .optional()?;
        Ok(part)
    }

    fn list_parts(&self, filter: &PartFilter) -> StoreResult<Vec<RecordedPart>> {
        let conn = self.open()?;
        let mut query = String::from("SELECT * FROM recorded_parts WHERE 1 = 1");
        let mut params: Vec<Value> = Vec::new();
        if let Some(session_id) = filter.session_id {
            query.push_str(" AND session_id = ?");
            params.push(Value::Text(session_id.to_string()));
        }
        if let Some(channel_id) = &filter.channel_id {
            query.push_str(" AND channel_id = ?");
            params.push(Value::Text(channel_id.clone()));
        }
        if filter.ended_only {
            query.push_str(" AND ended_at_ms IS NOT NULL");
        }
        if filter.unprocessed_only {
            query.push_str(" AND output_path IS NULL");
        }
        query.push_str(" ORDER BY started_at_ms ASC, part_number ASC");
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ?");
            params.push(Value::Integer(limit as i64));
        }
        query_rows(&conn, &query, &params, part_from_row)
    }

    fn end_part(&self, id: Uuid, ended_at: DateTime<Utc>) -> StoreResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE recorded_parts SET ended_at_ms = ?1
             WHERE id = ?2 AND ended_at_ms IS NULL AND started_at_ms <= ?1",
            params![millis(ended_at), id.to_string()],
        )?;
        if affected == 0 {
            return Err(self.end_failure(&conn, "recorded_parts", "part", id));
        }
        Ok(())
    }

    fn set_part_output(&self, id: Uuid, output: &Path) -> StoreResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE recorded_parts SET output_path = ?1 WHERE id = ?2",
            params![path_text(output), id.to_string()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound {
                kind: "part",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    fn delete_part(&self, id: Uuid) -> StoreResult<bool> {
        let conn = self.open()?;
        let affected = conn.execute("DELETE FROM recorded_parts WHERE id = ?1", [id.to_string()])?;
        Ok(affected > 0)
    }

    fn save_chat_message(&self, message: &ChatMessage) -> StoreResult<bool> {
        let conn = self.open()?;
        let badges = serde_json::to_string(&message.badges)?;
        let affected = conn.execute(
            "INSERT INTO chat_messages (
                id, channel_id, author, text, color, badges, moderator, subscriber,
                first_message, timestamp_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO NOTHING",
            params![
                &message.id,
                &message.channel_id,
                &message.author,
                &message.text,
                &message.color,
                badges,
                message.moderator,
                message.subscriber,
                message.first_message,
                millis(message.timestamp)
            ],
        )?;
        Ok(affected > 0)
    }

    fn chat_messages_between(
        &self,
        channel_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<ChatMessage>> {
        let conn = self.open()?;
        query_rows(
            &conn,
            "SELECT * FROM chat_messages
             WHERE channel_id = ?1 AND timestamp_ms >= ?2 AND timestamp_ms <= ?3
             ORDER BY timestamp_ms ASC, id ASC",
            &[
                Value::Text(channel_id.to_string()),
                Value::Integer(millis(start)),
                Value::Integer(millis(end)),
            ],
            chat_from_row,
        )
    }
}
