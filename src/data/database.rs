//! SQLite database operations
//!
//! All database access goes through this module. The schema is created
//! at connect time; the rest of the crate talks to the store through
//! the methods here and never touches SQL directly.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Pool, Row, Sqlite, SqlitePool};
use std::path::Path;
use std::str::FromStr;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper
pub struct Database {
    pool: Pool<Sqlite>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL DEFAULT '',
    about TEXT NOT NULL DEFAULT '',
    url TEXT NOT NULL,
    public_key_pem TEXT NOT NULL,
    private_key_pem TEXT NOT NULL,
    options TEXT NOT NULL DEFAULT '{}'
);
CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    userid INTEGER NOT NULL,
    xid TEXT NOT NULL,
    url TEXT NOT NULL DEFAULT '',
    link TEXT NOT NULL DEFAULT '',
    rid TEXT NOT NULL DEFAULT '',
    convoy TEXT NOT NULL DEFAULT '',
    kind TEXT NOT NULL,
    honker TEXT NOT NULL,
    oonker TEXT NOT NULL DEFAULT '',
    audience TEXT NOT NULL DEFAULT '[]',
    public INTEGER NOT NULL DEFAULT 0,
    noise TEXT NOT NULL DEFAULT '',
    precis TEXT NOT NULL DEFAULT '',
    whofore INTEGER NOT NULL DEFAULT 0,
    flags INTEGER NOT NULL DEFAULT 0,
    date TEXT NOT NULL,
    mentions TEXT NOT NULL DEFAULT '[]',
    onties TEXT NOT NULL DEFAULT '[]',
    place TEXT,
    time TEXT
);
CREATE INDEX IF NOT EXISTS idx_records_user_xid ON records (userid, xid);
CREATE INDEX IF NOT EXISTS idx_records_convoy ON records (userid, convoy);
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    xid TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    url TEXT NOT NULL DEFAULT '',
    media TEXT NOT NULL DEFAULT '',
    local INTEGER NOT NULL DEFAULT 0,
    hash TEXT NOT NULL DEFAULT '',
    length INTEGER NOT NULL DEFAULT 0,
    width INTEGER NOT NULL DEFAULT 0,
    height INTEGER NOT NULL DEFAULT 0,
    content BLOB
);
CREATE INDEX IF NOT EXISTS idx_files_hash ON files (hash, media);
CREATE INDEX IF NOT EXISTS idx_files_url ON files (url);
CREATE TABLE IF NOT EXISTS record_files (
    recordid INTEGER NOT NULL,
    fileid INTEGER NOT NULL,
    ord INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_record_files ON record_files (recordid);
CREATE TABLE IF NOT EXISTS zonks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    userid INTEGER NOT NULL,
    xid TEXT NOT NULL,
    UNIQUE (userid, xid)
);
CREATE TABLE IF NOT EXISTS identity (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    xid TEXT NOT NULL,
    property TEXT NOT NULL,
    value TEXT NOT NULL,
    saved_at TEXT NOT NULL,
    UNIQUE (xid, property)
);
CREATE TABLE IF NOT EXISTS deliveries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    due TEXT NOT NULL,
    userid INTEGER NOT NULL,
    recipient TEXT NOT NULL,
    tries INTEGER NOT NULL DEFAULT 0,
    messages BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_deliveries_rcpt ON deliveries (userid, recipient);
CREATE TABLE IF NOT EXISTS contacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    userid INTEGER NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    xid TEXT NOT NULL,
    flavor TEXT NOT NULL,
    folxid TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_contacts_user ON contacts (userid, xid);
CREATE TABLE IF NOT EXISTS filters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    userid INTEGER NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    json TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS chonks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    userid INTEGER NOT NULL,
    xid TEXT NOT NULL,
    who TEXT NOT NULL,
    target TEXT NOT NULL,
    date TEXT NOT NULL,
    noise TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS tracks (
    xid TEXT PRIMARY KEY,
    fetches TEXT NOT NULL
);
"#;

fn parse_date(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_json_list<T: serde::de::DeserializeOwned>(raw: &str) -> Vec<T> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn content_hash(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(data))
}

impl Database {
    /// Open (or create) the database at `path` and ensure the schema.
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(AppError::Database)?
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let db = Self { pool };
        db.ensure_schema().await?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub async fn connect_memory() -> Result<Self, AppError> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        let db = Self { pool };
        db.ensure_schema().await?;
        Ok(db)
    }

    async fn ensure_schema(&self) -> Result<(), AppError> {
        use sqlx::Executor;
        self.pool.execute(SCHEMA).await?;
        Ok(())
    }

    // =========================================================================
    // Users
    // =========================================================================

    pub async fn save_user(&self, user: &User) -> Result<UserId, AppError> {
        let options = serde_json::to_string(&user.options)
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
        let result = sqlx::query(
            "INSERT INTO users (name, display_name, about, url, public_key_pem, private_key_pem, options)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&user.name)
        .bind(&user.display_name)
        .bind(&user.about)
        .bind(&user.url)
        .bind(&user.public_key_pem)
        .bind(&user.private_key_pem)
        .bind(options)
        .execute(&self.pool)
        .await?;
        Ok(UserId(result.last_insert_rowid()))
    }

    pub async fn update_user_options(
        &self,
        userid: UserId,
        options: &UserOptions,
    ) -> Result<(), AppError> {
        let options =
            serde_json::to_string(options).map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
        sqlx::query("UPDATE users SET options = ? WHERE id = ?")
            .bind(options)
            .bind(userid.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn user_from_row(row: &sqlx::sqlite::SqliteRow) -> User {
        User {
            id: UserId(row.get("id")),
            name: row.get("name"),
            display_name: row.get("display_name"),
            about: row.get("about"),
            url: row.get("url"),
            public_key_pem: row.get("public_key_pem"),
            private_key_pem: row.get("private_key_pem"),
            options: serde_json::from_str(row.get::<String, _>("options").as_str())
                .unwrap_or_default(),
        }
    }

    pub async fn user_by_name(&self, name: &str) -> Result<Option<User>, AppError> {
        let row = sqlx::query("SELECT * FROM users WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(Self::user_from_row))
    }

    pub async fn user_by_id(&self, userid: UserId) -> Result<Option<User>, AppError> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(userid.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(Self::user_from_row))
    }

    /// The account whose key signs system fetches (lowest id).
    pub async fn first_user(&self) -> Result<Option<User>, AppError> {
        let row = sqlx::query("SELECT * FROM users ORDER BY id LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(Self::user_from_row))
    }

    // =========================================================================
    // Records
    // =========================================================================

    fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Record {
        Record {
            id: row.get("id"),
            userid: UserId(row.get("userid")),
            xid: row.get("xid"),
            url: row.get("url"),
            link: row.get("link"),
            rid: row.get("rid"),
            convoy: row.get("convoy"),
            kind: RecordKind::from_str(row.get::<String, _>("kind").as_str()).unwrap_or_default(),
            honker: row.get("honker"),
            oonker: row.get("oonker"),
            audience: parse_json_list(row.get::<String, _>("audience").as_str()),
            public: row.get::<i64, _>("public") != 0,
            noise: row.get("noise"),
            precis: row.get("precis"),
            whofore: Whofore::from_i64(row.get("whofore")),
            flags: row.get("flags"),
            date: parse_date(row.get::<String, _>("date").as_str()),
            mentions: parse_json_list(row.get::<String, _>("mentions").as_str()),
            onties: parse_json_list(row.get::<String, _>("onties").as_str()),
            place: row
                .get::<Option<String>, _>("place")
                .and_then(|raw| serde_json::from_str(&raw).ok()),
            time: row
                .get::<Option<String>, _>("time")
                .and_then(|raw| serde_json::from_str(&raw).ok()),
            attachments: Vec::new(),
        }
    }

    async fn load_attachments(&self, record: &mut Record) -> Result<(), AppError> {
        let rows = sqlx::query(
            "SELECT f.id, f.xid, f.name, f.description, f.url, f.media, f.local,
                    f.length, f.width, f.height
             FROM files f JOIN record_files rf ON rf.fileid = f.id
             WHERE rf.recordid = ? ORDER BY rf.ord",
        )
        .bind(record.id)
        .fetch_all(&self.pool)
        .await?;
        record.attachments = rows
            .iter()
            .map(|row| Attachment {
                file_id: row.get("id"),
                xid: row.get("xid"),
                name: row.get("name"),
                desc: row.get("description"),
                url: row.get("url"),
                media: row.get("media"),
                local: row.get::<i64, _>("local") != 0,
                meta: FileMeta {
                    length: row.get("length"),
                    width: row.get("width"),
                    height: row.get("height"),
                },
            })
            .collect();
        Ok(())
    }

    pub async fn save_record(&self, record: &Record) -> Result<i64, AppError> {
        let result = sqlx::query(
            "INSERT INTO records (userid, xid, url, link, rid, convoy, kind, honker, oonker,
                audience, public, noise, precis, whofore, flags, date, mentions, onties, place, time)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.userid.0)
        .bind(&record.xid)
        .bind(&record.url)
        .bind(&record.link)
        .bind(&record.rid)
        .bind(&record.convoy)
        .bind(record.kind.as_str())
        .bind(&record.honker)
        .bind(&record.oonker)
        .bind(serde_json::to_string(&record.audience).unwrap_or_default())
        .bind(record.public as i64)
        .bind(&record.noise)
        .bind(&record.precis)
        .bind(record.whofore as i64)
        .bind(record.flags)
        .bind(record.date.to_rfc3339())
        .bind(serde_json::to_string(&record.mentions).unwrap_or_default())
        .bind(serde_json::to_string(&record.onties).unwrap_or_default())
        .bind(
            record
                .place
                .as_ref()
                .and_then(|p| serde_json::to_string(p).ok()),
        )
        .bind(
            record
                .time
                .as_ref()
                .and_then(|t| serde_json::to_string(t).ok()),
        )
        .execute(&self.pool)
        .await?;
        let recordid = result.last_insert_rowid();
        self.link_files(recordid, &record.attachments).await?;
        Ok(recordid)
    }

    async fn link_files(&self, recordid: i64, attachments: &[Attachment]) -> Result<(), AppError> {
        sqlx::query("DELETE FROM record_files WHERE recordid = ?")
            .bind(recordid)
            .execute(&self.pool)
            .await?;
        for (ord, att) in attachments.iter().enumerate() {
            sqlx::query("INSERT INTO record_files (recordid, fileid, ord) VALUES (?, ?, ?)")
                .bind(recordid)
                .bind(att.file_id)
                .bind(ord as i64)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Replace an existing record in place; used by Update activities.
    pub async fn update_record(&self, record: &Record) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE records SET url = ?, link = ?, rid = ?, convoy = ?, kind = ?, honker = ?,
                oonker = ?, audience = ?, public = ?, noise = ?, precis = ?, whofore = ?,
                flags = ?, date = ?, mentions = ?, onties = ?, place = ?, time = ?
             WHERE id = ?",
        )
        .bind(&record.url)
        .bind(&record.link)
        .bind(&record.rid)
        .bind(&record.convoy)
        .bind(record.kind.as_str())
        .bind(&record.honker)
        .bind(&record.oonker)
        .bind(serde_json::to_string(&record.audience).unwrap_or_default())
        .bind(record.public as i64)
        .bind(&record.noise)
        .bind(&record.precis)
        .bind(record.whofore as i64)
        .bind(record.flags)
        .bind(record.date.to_rfc3339())
        .bind(serde_json::to_string(&record.mentions).unwrap_or_default())
        .bind(serde_json::to_string(&record.onties).unwrap_or_default())
        .bind(
            record
                .place
                .as_ref()
                .and_then(|p| serde_json::to_string(p).ok()),
        )
        .bind(
            record
                .time
                .as_ref()
                .and_then(|t| serde_json::to_string(t).ok()),
        )
        .bind(record.id)
        .execute(&self.pool)
        .await?;
        self.link_files(record.id, &record.attachments).await?;
        Ok(())
    }

    pub async fn delete_record(&self, userid: UserId, xid: &str) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM records WHERE userid = ? AND xid = ?")
            .bind(userid.0)
            .bind(xid)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn record_by_xid(
        &self,
        userid: UserId,
        xid: &str,
    ) -> Result<Option<Record>, AppError> {
        let row = sqlx::query("SELECT * FROM records WHERE userid = ? AND xid = ?")
            .bind(userid.0)
            .bind(xid)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let mut record = Self::record_from_row(&row);
                self.load_attachments(&mut record).await?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Find a record by xid across users; used by the rendered-object cache.
    pub async fn any_record_by_xid(&self, xid: &str) -> Result<Option<Record>, AppError> {
        let row = sqlx::query("SELECT * FROM records WHERE xid = ? LIMIT 1")
            .bind(xid)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let mut record = Self::record_from_row(&row);
                self.load_attachments(&mut record).await?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// The 20 most recent public records we authored, newest first.
    pub async fn recent_public_records(
        &self,
        userid: UserId,
        limit: i64,
    ) -> Result<Vec<Record>, AppError> {
        let rows = sqlx::query(
            "SELECT * FROM records WHERE userid = ? AND whofore = 2
             ORDER BY date DESC LIMIT ?",
        )
        .bind(userid.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut record = Self::record_from_row(row);
            self.load_attachments(&mut record).await?;
            records.push(record);
        }
        Ok(records)
    }

    /// Convoy members in display order (oldest first).
    pub async fn records_by_convoy(
        &self,
        userid: UserId,
        convoy: &str,
    ) -> Result<Vec<Record>, AppError> {
        let rows = sqlx::query(
            "SELECT * FROM records WHERE userid = ? AND convoy = ? ORDER BY date ASC",
        )
        .bind(userid.0)
        .bind(convoy)
        .fetch_all(&self.pool)
        .await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut record = Self::record_from_row(row);
            self.load_attachments(&mut record).await?;
            records.push(record);
        }
        Ok(records)
    }

    pub async fn set_record_flags(
        &self,
        userid: UserId,
        xid: &str,
        flags: i64,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE records SET flags = ? WHERE userid = ? AND xid = ?")
            .bind(flags)
            .bind(userid.0)
            .bind(xid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Zonks (dead letters)
    // =========================================================================

    pub async fn save_zonk(&self, userid: UserId, xid: &str) -> Result<(), AppError> {
        sqlx::query("INSERT OR IGNORE INTO zonks (userid, xid) VALUES (?, ?)")
            .bind(userid.0)
            .bind(xid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn is_zonked(&self, userid: UserId, xid: &str) -> Result<bool, AppError> {
        let row = sqlx::query("SELECT id FROM zonks WHERE userid = ? AND xid = ?")
            .bind(userid.0)
            .bind(xid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    // =========================================================================
    // Identity key/value
    // =========================================================================

    pub async fn get_identity(&self, xid: &str, property: &str) -> Result<Option<String>, AppError> {
        let row = sqlx::query("SELECT value FROM identity WHERE xid = ? AND property = ?")
            .bind(xid)
            .bind(property)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get("value")))
    }

    pub async fn save_identity(
        &self,
        xid: &str,
        value: &str,
        property: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO identity (xid, property, value, saved_at) VALUES (?, ?, ?, ?)
             ON CONFLICT (xid, property) DO UPDATE SET value = excluded.value, saved_at = excluded.saved_at",
        )
        .bind(xid)
        .bind(property)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop an identity row saved before `when`. Keeps rows a concurrent
    /// re-fetch just wrote.
    pub async fn delete_identity_before(
        &self,
        xid: &str,
        property: &str,
        when: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query("DELETE FROM identity WHERE xid = ? AND property = ? AND saved_at < ?")
            .bind(xid)
            .bind(property)
            .bind(when.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Pending deliveries
    // =========================================================================

    pub async fn pending_delivery(
        &self,
        userid: UserId,
        recipient: &str,
    ) -> Result<Option<(i64, Vec<u8>)>, AppError> {
        let row = sqlx::query(
            "SELECT id, messages FROM deliveries WHERE userid = ? AND recipient = ? LIMIT 1",
        )
        .bind(userid.0)
        .bind(recipient)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| (row.get("id"), row.get("messages"))))
    }

    pub async fn append_pending(&self, id: i64, messages: &[u8]) -> Result<(), AppError> {
        sqlx::query("UPDATE deliveries SET messages = ? WHERE id = ?")
            .bind(messages)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_delivery(
        &self,
        due: DateTime<Utc>,
        userid: UserId,
        recipient: &str,
        tries: i64,
        messages: &[u8],
    ) -> Result<i64, AppError> {
        let result = sqlx::query(
            "INSERT INTO deliveries (due, userid, recipient, tries, messages) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(due.to_rfc3339())
        .bind(userid.0)
        .bind(recipient)
        .bind(tries)
        .bind(messages)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Ids and due times of every parked delivery.
    pub async fn delivery_times(&self) -> Result<Vec<(i64, DateTime<Utc>)>, AppError> {
        let rows = sqlx::query("SELECT id, due FROM deliveries")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("id"), parse_date(row.get::<String, _>("due").as_str())))
            .collect())
    }

    /// Load a delivery row and delete it in one transaction.
    pub async fn extract_delivery(&self, id: i64) -> Result<Option<Delivery>, AppError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM deliveries WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        sqlx::query("DELETE FROM deliveries WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        let blob: Vec<u8> = row.get("messages");
        Ok(Some(Delivery {
            id: row.get("id"),
            due: parse_date(row.get::<String, _>("due").as_str()),
            userid: UserId(row.get("userid")),
            recipient: row.get("recipient"),
            tries: row.get("tries"),
            messages: Delivery::decode_messages(&blob),
        }))
    }

    pub async fn count_pending_deliveries(&self) -> Result<i64, AppError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM deliveries")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    // =========================================================================
    // Files
    // =========================================================================

    pub async fn find_file_by_url(&self, url: &str) -> Result<Option<Attachment>, AppError> {
        let row = sqlx::query(
            "SELECT id, xid, name, description, url, media, local, length, width, height
             FROM files WHERE url = ? LIMIT 1",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| Attachment {
            file_id: row.get("id"),
            xid: row.get("xid"),
            name: row.get("name"),
            desc: row.get("description"),
            url: row.get("url"),
            media: row.get("media"),
            local: row.get::<i64, _>("local") != 0,
            meta: FileMeta {
                length: row.get("length"),
                width: row.get("width"),
                height: row.get("height"),
            },
        }))
    }

    /// Save file bytes, de-duplicating localized content by hash scoped
    /// to media type. Returns the attachment row.
    pub async fn save_file(
        &self,
        xid: &str,
        name: &str,
        desc: &str,
        url: &str,
        media: &str,
        local: bool,
        data: Option<&[u8]>,
        meta: FileMeta,
    ) -> Result<Attachment, AppError> {
        if let Some(data) = data {
            let hash = content_hash(data);
            let existing = sqlx::query(
                "SELECT id, xid, name, description, url, media, local, length, width, height
                 FROM files WHERE hash = ? AND media = ? LIMIT 1",
            )
            .bind(&hash)
            .bind(media)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = existing {
                return Ok(Attachment {
                    file_id: row.get("id"),
                    xid: row.get("xid"),
                    name: row.get("name"),
                    desc: row.get("description"),
                    url: row.get("url"),
                    media: row.get("media"),
                    local: row.get::<i64, _>("local") != 0,
                    meta: FileMeta {
                        length: row.get("length"),
                        width: row.get("width"),
                        height: row.get("height"),
                    },
                });
            }
            let result = sqlx::query(
                "INSERT INTO files (xid, name, description, url, media, local, hash, length, width, height, content)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(xid)
            .bind(name)
            .bind(desc)
            .bind(url)
            .bind(media)
            .bind(local as i64)
            .bind(&hash)
            .bind(meta.length)
            .bind(meta.width)
            .bind(meta.height)
            .bind(data)
            .execute(&self.pool)
            .await?;
            return Ok(Attachment {
                file_id: result.last_insert_rowid(),
                xid: xid.to_string(),
                name: name.to_string(),
                desc: desc.to_string(),
                url: url.to_string(),
                media: media.to_string(),
                local,
                meta,
            });
        }

        // Reference-only attachment; no bytes kept.
        let result = sqlx::query(
            "INSERT INTO files (xid, name, description, url, media, local) VALUES (?, ?, ?, ?, ?, 0)",
        )
        .bind(xid)
        .bind(name)
        .bind(desc)
        .bind(url)
        .bind(media)
        .execute(&self.pool)
        .await?;
        Ok(Attachment {
            file_id: result.last_insert_rowid(),
            xid: xid.to_string(),
            name: name.to_string(),
            desc: desc.to_string(),
            url: url.to_string(),
            media: media.to_string(),
            local: false,
            meta: FileMeta::default(),
        })
    }

    /// Raw bytes for `/d/<xid>`.
    pub async fn file_data(&self, xid: &str) -> Result<Option<(String, Vec<u8>)>, AppError> {
        let row = sqlx::query("SELECT media, content FROM files WHERE xid = ? AND local = 1")
            .bind(xid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|row| {
            row.get::<Option<Vec<u8>>, _>("content")
                .map(|content| (row.get("media"), content))
        }))
    }

    // =========================================================================
    // Contacts
    // =========================================================================

    fn contact_from_row(row: &sqlx::sqlite::SqliteRow) -> Contact {
        Contact {
            id: row.get("id"),
            userid: UserId(row.get("userid")),
            name: row.get("name"),
            xid: row.get("xid"),
            flavor: ContactFlavor::from_str(row.get::<String, _>("flavor").as_str())
                .unwrap_or(ContactFlavor::Peep),
            folxid: row.get("folxid"),
        }
    }

    pub async fn save_contact(&self, contact: &Contact) -> Result<i64, AppError> {
        let result = sqlx::query(
            "INSERT INTO contacts (userid, name, xid, flavor, folxid) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(contact.userid.0)
        .bind(&contact.name)
        .bind(&contact.xid)
        .bind(contact.flavor.as_str())
        .bind(&contact.folxid)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn contact_by_xid(
        &self,
        userid: UserId,
        xid: &str,
    ) -> Result<Option<Contact>, AppError> {
        let row = sqlx::query("SELECT * FROM contacts WHERE userid = ? AND xid = ? LIMIT 1")
            .bind(userid.0)
            .bind(xid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(Self::contact_from_row))
    }

    pub async fn contact_by_folxid(
        &self,
        userid: UserId,
        folxid: &str,
    ) -> Result<Option<Contact>, AppError> {
        let row = sqlx::query("SELECT * FROM contacts WHERE userid = ? AND folxid = ? LIMIT 1")
            .bind(userid.0)
            .bind(folxid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(Self::contact_from_row))
    }

    /// Transition a contact between subscription flavors. An empty
    /// `folxid` keeps the stored follow id.
    pub async fn update_contact_flavor(
        &self,
        userid: UserId,
        xid: &str,
        from: &[ContactFlavor],
        to: ContactFlavor,
        folxid: &str,
    ) -> Result<u64, AppError> {
        // SQLite has no array binds; flavors are a closed set so the IN
        // list is built from constants.
        let in_list = from
            .iter()
            .map(|f| format!("'{}'", f.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let result = if folxid.is_empty() {
            let query = format!(
                "UPDATE contacts SET flavor = ? WHERE userid = ? AND xid = ? AND flavor IN ({})",
                in_list
            );
            sqlx::query(&query)
                .bind(to.as_str())
                .bind(userid.0)
                .bind(xid)
                .execute(&self.pool)
                .await?
        } else {
            let query = format!(
                "UPDATE contacts SET flavor = ?, folxid = ? WHERE userid = ? AND xid = ? AND flavor IN ({})",
                in_list
            );
            sqlx::query(&query)
                .bind(to.as_str())
                .bind(folxid)
                .bind(userid.0)
                .bind(xid)
                .execute(&self.pool)
                .await?
        };
        Ok(result.rows_affected())
    }

    /// Actors who follow us (our subscribers).
    pub async fn subscribers(&self, userid: UserId) -> Result<Vec<Contact>, AppError> {
        let rows = sqlx::query("SELECT * FROM contacts WHERE userid = ? AND flavor = 'dub'")
            .bind(userid.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(Self::contact_from_row).collect())
    }

    /// Actors we follow.
    pub async fn subscriptions(&self, userid: UserId) -> Result<Vec<Contact>, AppError> {
        let rows = sqlx::query("SELECT * FROM contacts WHERE userid = ? AND flavor = 'sub'")
            .bind(userid.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(Self::contact_from_row).collect())
    }

    // =========================================================================
    // Filters
    // =========================================================================

    pub async fn filters_for(&self, userid: UserId) -> Result<Vec<Filter>, AppError> {
        let rows = sqlx::query("SELECT json FROM filters WHERE userid = ?")
            .bind(userid.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| serde_json::from_str(row.get::<String, _>("json").as_str()).ok())
            .collect())
    }

    pub async fn save_filter(&self, filter: &Filter) -> Result<(), AppError> {
        let json =
            serde_json::to_string(filter).map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
        sqlx::query("INSERT INTO filters (userid, name, json) VALUES (?, ?, ?)")
            .bind(filter.userid.0)
            .bind(&filter.name)
            .bind(json)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Chonks
    // =========================================================================

    pub async fn save_chonk(&self, chonk: &Chonk) -> Result<i64, AppError> {
        let result = sqlx::query(
            "INSERT INTO chonks (userid, xid, who, target, date, noise) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(chonk.userid.0)
        .bind(&chonk.xid)
        .bind(&chonk.who)
        .bind(&chonk.target)
        .bind(chonk.date.to_rfc3339())
        .bind(&chonk.noise)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn chonk_by_xid(&self, userid: UserId, xid: &str) -> Result<Option<Chonk>, AppError> {
        let row = sqlx::query("SELECT * FROM chonks WHERE userid = ? AND xid = ? LIMIT 1")
            .bind(userid.0)
            .bind(xid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| Chonk {
            id: row.get("id"),
            userid: UserId(row.get("userid")),
            xid: row.get("xid"),
            who: row.get("who"),
            target: row.get("target"),
            date: parse_date(row.get::<String, _>("date").as_str()),
            noise: row.get("noise"),
            attachments: Vec::new(),
        }))
    }

    // =========================================================================
    // Back-tracker
    // =========================================================================

    pub async fn tracks_for(&self, xid: &str) -> Result<Option<String>, AppError> {
        let row = sqlx::query("SELECT fetches FROM tracks WHERE xid = ?")
            .bind(xid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get("fetches")))
    }

    /// Merge newly observed fetchers into a track row, de-duplicating.
    pub async fn merge_tracks(&self, xid: &str, who: &[String]) -> Result<(), AppError> {
        let mut all: Vec<String> = self
            .tracks_for(xid)
            .await?
            .map(|prev| prev.split(' ').map(str::to_string).collect())
            .unwrap_or_default();
        for w in who {
            if !w.is_empty() && !all.contains(w) {
                all.push(w.clone());
            }
        }
        sqlx::query(
            "INSERT INTO tracks (xid, fetches) VALUES (?, ?)
             ON CONFLICT (xid) DO UPDATE SET fetches = excluded.fetches",
        )
        .bind(xid)
        .bind(all.join(" "))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> Database {
        Database::connect_memory().await.expect("memory db")
    }

    fn sample_record(userid: UserId, xid: &str) -> Record {
        Record {
            userid,
            xid: xid.to_string(),
            kind: RecordKind::Honk,
            honker: "https://remote.example/u/bob".to_string(),
            audience: vec!["https://www.w3.org/ns/activitystreams#Public".to_string()],
            public: true,
            noise: "<p>hello".to_string(),
            date: Utc::now(),
            ..Record::default()
        }
    }

    #[tokio::test]
    async fn record_save_and_load_round_trips() {
        let db = memory_db().await;
        let record = sample_record(UserId(1), "https://remote.example/h/abc");
        db.save_record(&record).await.expect("save");

        let loaded = db
            .record_by_xid(UserId(1), "https://remote.example/h/abc")
            .await
            .expect("query")
            .expect("record exists");
        assert_eq!(loaded.kind, RecordKind::Honk);
        assert_eq!(loaded.honker, record.honker);
        assert!(loaded.public);
        assert_eq!(loaded.audience, record.audience);
    }

    #[tokio::test]
    async fn update_replaces_record_without_duplicate() {
        let db = memory_db().await;
        let mut record = sample_record(UserId(1), "https://remote.example/h/abc");
        let id = db.save_record(&record).await.expect("save");

        record.id = id;
        record.noise = "<p>edited".to_string();
        db.update_record(&record).await.expect("update");

        let rows = db
            .records_by_convoy(UserId(1), "")
            .await
            .expect("convoy query");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].noise, "<p>edited");
    }

    #[tokio::test]
    async fn zonk_insert_and_query() {
        let db = memory_db().await;
        assert!(!db
            .is_zonked(UserId(1), "https://remote.example/h/x")
            .await
            .unwrap());
        db.save_zonk(UserId(1), "https://remote.example/h/x")
            .await
            .unwrap();
        assert!(db
            .is_zonked(UserId(1), "https://remote.example/h/x")
            .await
            .unwrap());
        // idempotent
        db.save_zonk(UserId(1), "https://remote.example/h/x")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn extract_delivery_is_load_and_delete() {
        let db = memory_db().await;
        let blob = Delivery::encode_messages(&[b"one".to_vec(), b"two".to_vec()]);
        let id = db
            .insert_delivery(Utc::now(), UserId(1), "https://dead.example/inbox", 3, &blob)
            .await
            .expect("insert");

        let delivery = db
            .extract_delivery(id)
            .await
            .expect("extract")
            .expect("present");
        assert_eq!(delivery.tries, 3);
        assert_eq!(delivery.messages, vec![b"one".to_vec(), b"two".to_vec()]);

        assert!(db.extract_delivery(id).await.expect("extract").is_none());
    }

    #[tokio::test]
    async fn at_most_one_pending_row_per_recipient() {
        let db = memory_db().await;
        let blob = Delivery::encode_messages(&[b"one".to_vec()]);
        let id = db
            .insert_delivery(Utc::now(), UserId(1), "rcpt", 1, &blob)
            .await
            .unwrap();

        // Append path: the caller finds the existing row and grows it.
        let (found, data) = db
            .pending_delivery(UserId(1), "rcpt")
            .await
            .unwrap()
            .expect("pending row");
        assert_eq!(found, id);
        let mut messages = Delivery::decode_messages(&data);
        messages.push(b"two".to_vec());
        db.append_pending(found, &Delivery::encode_messages(&messages))
            .await
            .unwrap();

        assert_eq!(db.count_pending_deliveries().await.unwrap(), 1);
        let delivery = db.extract_delivery(id).await.unwrap().expect("row");
        assert_eq!(delivery.messages.len(), 2);
    }

    #[tokio::test]
    async fn file_dedupe_by_content_hash_and_media() {
        let db = memory_db().await;
        let first = db
            .save_file(
                "x1",
                "pic",
                "",
                "https://remote.example/a.jpg",
                "image/jpeg",
                true,
                Some(b"bytes"),
                FileMeta {
                    length: 5,
                    ..Default::default()
                },
            )
            .await
            .expect("save");
        let second = db
            .save_file(
                "x2",
                "pic again",
                "",
                "https://other.example/b.jpg",
                "image/jpeg",
                true,
                Some(b"bytes"),
                FileMeta {
                    length: 5,
                    ..Default::default()
                },
            )
            .await
            .expect("save dup");
        assert_eq!(first.file_id, second.file_id);

        // Same bytes under a different media type is a different file.
        let third = db
            .save_file(
                "x3",
                "doc",
                "",
                "https://other.example/b.pdf",
                "application/pdf",
                true,
                Some(b"bytes"),
                FileMeta::default(),
            )
            .await
            .expect("save other media");
        assert_ne!(first.file_id, third.file_id);
    }

    #[tokio::test]
    async fn contact_flavor_transitions() {
        let db = memory_db().await;
        let contact = Contact {
            id: 0,
            userid: UserId(1),
            name: "bob".to_string(),
            xid: "https://remote.example/u/bob".to_string(),
            flavor: ContactFlavor::Presub,
            folxid: "abc".to_string(),
        };
        db.save_contact(&contact).await.unwrap();

        let changed = db
            .update_contact_flavor(
                UserId(1),
                "https://remote.example/u/bob",
                &[ContactFlavor::Presub],
                ContactFlavor::Sub,
                "abc",
            )
            .await
            .unwrap();
        assert_eq!(changed, 1);

        let loaded = db
            .contact_by_xid(UserId(1), "https://remote.example/u/bob")
            .await
            .unwrap()
            .expect("contact");
        assert_eq!(loaded.flavor, ContactFlavor::Sub);

        // Transition from a flavor it is not in does nothing.
        let changed = db
            .update_contact_flavor(
                UserId(1),
                "https://remote.example/u/bob",
                &[ContactFlavor::Presub],
                ContactFlavor::Unsub,
                "abc",
            )
            .await
            .unwrap();
        assert_eq!(changed, 0);
    }

    #[tokio::test]
    async fn merge_tracks_dedupes() {
        let db = memory_db().await;
        db.merge_tracks("xid", &["a.example#key".to_string(), "b.example".to_string()])
            .await
            .unwrap();
        db.merge_tracks("xid", &["a.example#key".to_string(), "c.example".to_string()])
            .await
            .unwrap();
        let tracks = db.tracks_for("xid").await.unwrap().expect("row");
        assert_eq!(tracks, "a.example#key b.example c.example");
    }
}
