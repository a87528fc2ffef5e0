use crate::api::models::{Chat, ChatId, ChatKind};
use crate::error::StorageError;
use directories::ProjectDirs;
use log::debug;
use rusqlite::{Connection, OptionalExtension, params};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

fn db_path() -> Option<PathBuf> {
    let proj = ProjectDirs::from("com", "example", "SchoolChat")?;
    Some(proj.data_dir().join("cache.sqlite"))
}

fn kind_name(kind: ChatKind) -> &'static str {
    match kind {
        ChatKind::Private => "private",
        ChatKind::Group => "group",
        ChatKind::Class => "class",
    }
}

fn kind_from(name: &str) -> ChatKind {
    match name {
        "group" => ChatKind::Group,
        "class" => ChatKind::Class,
        _ => ChatKind::Private,
    }
}

/// Chat list cache, so the list can be drawn before the network answers.
/// Message state is never cached here.
pub struct ChatCache {
    conn: Connection,
}

impl ChatCache {
    pub fn open_default() -> Result<Self, StorageError> {
        let path = db_path().ok_or(StorageError::NoDataDir)?;
        Self::open(&path)
    }

    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let cache = Self {
            conn: Connection::open(path)?,
        };
        cache.init()?;
        Ok(cache)
    }

    fn init(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                kind TEXT NOT NULL,
                pinned INTEGER NOT NULL DEFAULT 0,
                muted INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                raw_json TEXT
            );
            "#,
        )?;
        Ok(())
    }

    pub fn upsert_chats(
        &mut self,
        chats: &[Chat],
        raws: Option<&[serde_json::Value]>,
    ) -> Result<(), StorageError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        let tx = self.conn.transaction()?;
        for (idx, c) in chats.iter().enumerate() {
            let raw = match raws.and_then(|r| r.get(idx)) {
                Some(v) => Some(serde_json::to_string(v)?),
                None => None,
            };
            tx.execute(
                r#"
                INSERT INTO chats (id, title, kind, pinned, muted, updated_at, raw_json)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(id) DO UPDATE SET
                    title=excluded.title,
                    kind=excluded.kind,
                    pinned=excluded.pinned,
                    muted=excluded.muted,
                    updated_at=excluded.updated_at,
                    raw_json=COALESCE(excluded.raw_json, chats.raw_json)
                "#,
                params![c.id.0, c.title, kind_name(c.kind), c.pinned, c.muted, now, raw],
            )?;
        }
        tx.commit()?;
        debug!("cached {} chats", chats.len());
        Ok(())
    }

    /// Cached chats, pinned first then most recently refreshed. Raw server rows win over columns.
    pub fn get_chats(&self, limit: Option<usize>) -> Result<Vec<Chat>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, kind, pinned, muted, raw_json FROM chats
             ORDER BY pinned DESC, updated_at DESC, title ASC LIMIT ?1",
        )?;
        let lim = limit.unwrap_or(500) as i64;
        let rows = stmt.query_map(params![lim], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, bool>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;
        let mut out = Vec::new();
        for r in rows {
            let (id, title, kind, pinned, muted, raw) = r?;
            let from_raw = raw.and_then(|json| serde_json::from_str::<Chat>(&json).ok());
            let chat = match from_raw {
                Some(chat) => chat,
                None => {
                    let mut chat = Chat::new(ChatId(id), kind_from(&kind));
                    chat.title = title;
                    chat.pinned = pinned;
                    chat.muted = muted;
                    chat
                }
            };
            out.push(chat);
        }
        Ok(out)
    }

    pub fn last_chat_updated_at(&self, id: &ChatId) -> Result<Option<i64>, StorageError> {
        let ts = self
            .conn
            .query_row(
                "SELECT updated_at FROM chats WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(id: &str, kind: ChatKind, pinned: bool) -> Chat {
        let mut c = Chat::new(ChatId::from(id), kind);
        c.title = format!("chat {id}");
        c.pinned = pinned;
        c
    }

    #[test]
    fn upsert_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ChatCache::open(&dir.path().join("c.sqlite")).unwrap();
        cache
            .upsert_chats(
                &[chat("1", ChatKind::Private, false), chat("2", ChatKind::Class, true)],
                None,
            )
            .unwrap();

        let chats = cache.get_chats(None).unwrap();
        assert_eq!(chats.len(), 2);
        assert_eq!(chats[0].id, ChatId::from("2"));
        assert_eq!(chats[0].kind, ChatKind::Class);
        assert!(cache.last_chat_updated_at(&ChatId::from("1")).unwrap().is_some());
        assert!(cache.last_chat_updated_at(&ChatId::from("9")).unwrap().is_none());
    }

    #[test]
    fn raw_row_is_preferred_and_kept() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ChatCache::open(&dir.path().join("c.sqlite")).unwrap();
        let raw = serde_json::json!({"id": "7", "name": "Parents 5B", "kind": "group",
                                     "participants": ["a", "b"]});
        cache
            .upsert_chats(&[chat("7", ChatKind::Group, false)], Some(&[raw]))
            .unwrap();
        // refresh without raw keeps the earlier row
        cache
            .upsert_chats(&[chat("7", ChatKind::Group, false)], None)
            .unwrap();

        let chats = cache.get_chats(Some(10)).unwrap();
        assert_eq!(chats[0].title, "Parents 5B");
        assert_eq!(chats[0].participants, vec!["a", "b"]);
    }
}
