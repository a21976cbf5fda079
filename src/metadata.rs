#![forbid(unsafe_code)]

//! Persistence layer for archived videos.
//!
//! A single `videos` table holds one row per submission. Rows start out
//! `pending` with only the source URL known, and are completed (or marked
//! failed) by the download workers using the id returned at insert time.

use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{SecondsFormat, Utc};
use libsql::{Builder, Connection, Database, Row, params};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE: i64 = 1;
pub const DEFAULT_PAGE_SIZE: i64 = 10;
pub const MAX_PAGE_SIZE: i64 = 100;

/// Lifecycle of a record: inserted as `Pending`, then flipped exactly once by
/// the worker that handled its download.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    Pending,
    Ready,
    Failed,
}

impl VideoStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "ready" => Some(Self::Ready),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Row stored in the `videos` table.
///
/// `filename` and `thumbnail` are relative to the asset directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoRecord {
    pub id: i64,
    pub title: Option<String>,
    pub filename: Option<String>,
    pub thumbnail: Option<String>,
    pub url: String,
    pub video_id: Option<String>,
    pub status: VideoStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

/// Fields written once a download has finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub title: Option<String>,
    pub filename: String,
    pub thumbnail: Option<String>,
    pub video_id: String,
}

/// Validated offset/limit window for listing and search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: i64,
    pub page_size: i64,
}

impl Page {
    /// Rejects non-positive values and clamps the page size to
    /// [`MAX_PAGE_SIZE`].
    pub fn new(page: i64, page_size: i64) -> Result<Self> {
        if page < 1 {
            bail!("page must be a positive integer");
        }
        if page_size < 1 {
            bail!("page_size must be a positive integer");
        }
        Ok(Self {
            page,
            page_size: page_size.min(MAX_PAGE_SIZE),
        })
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.page_size)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: DEFAULT_PAGE,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Ceiling division; zero records means zero pages.
pub fn total_pages(total: i64, page_size: i64) -> i64 {
    if total <= 0 || page_size <= 0 {
        return 0;
    }
    (total + page_size - 1) / page_size
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Turns free text into a LIKE pattern that matches it literally as a
/// substring.
fn like_pattern(query: &str) -> String {
    let mut pattern = String::with_capacity(query.len() + 2);
    pattern.push('%');
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Per-connection pragmas. `busy_timeout` goes first so the WAL switch (and
/// everything after it) waits on a busy database instead of failing.
const CONNECTION_PRAGMAS: [&str; 3] = [
    "PRAGMA busy_timeout=5000",
    "PRAGMA journal_mode=WAL",
    "PRAGMA synchronous=NORMAL",
];

async fn configure_connection(conn: &Connection) -> Result<()> {
    // Some of these report a row, which `execute` rejects.
    for pragma in CONNECTION_PRAGMAS {
        let mut rows = conn
            .query(pragma, params![])
            .await
            .with_context(|| format!("running {pragma}"))?;
        while rows.next().await?.is_some() {}
    }
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS videos (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT,
            filename TEXT,
            thumbnail TEXT,
            url TEXT NOT NULL,
            video_id TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            error TEXT,
            created_at TEXT,
            updated_at TEXT
        );
        "#,
    )
    .await?;

    migrate_legacy_schema(conn).await?;

    Ok(())
}

/// Databases created by the original six-column schema lack the status and
/// bookkeeping columns. Add them in place and mark finished rows as ready.
async fn migrate_legacy_schema(conn: &Connection) -> Result<()> {
    let mut rows = conn.query("PRAGMA table_info(videos)", params![]).await?;
    let mut columns = Vec::new();
    while let Some(row) = rows.next().await? {
        let name: String = row.get(1)?;
        columns.push(name);
    }
    let has = |name: &str| columns.iter().any(|column| column == name);

    let added_status = !has("status");
    if added_status {
        conn.execute(
            "ALTER TABLE videos ADD COLUMN status TEXT NOT NULL DEFAULT 'pending'",
            params![],
        )
        .await?;
    }
    for column in ["error", "created_at", "updated_at"] {
        if !has(column) {
            conn.execute(&format!("ALTER TABLE videos ADD COLUMN {column} TEXT"), params![])
                .await?;
        }
    }
    if added_status {
        conn.execute(
            "UPDATE videos SET status = 'ready' WHERE filename IS NOT NULL",
            params![],
        )
        .await?;
    }

    Ok(())
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, title, filename, thumbnail, url, video_id,
           status, error, created_at, updated_at
    FROM videos
"#;

/// Owner of the database handle. Every operation opens its own short-lived
/// connection, so the store can be shared freely between request handlers
/// and download workers.
pub struct VideoStore {
    db: Database,
}

impl VideoStore {
    /// Opens (and if necessary creates) the SQLite DB and ensures the expected
    /// schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening video DB {}", path.display()))?;

        let store = Self { db };
        let conn = store.connect().await?;
        ensure_schema(&conn).await.context("preparing videos schema")?;
        Ok(store)
    }

    async fn connect(&self) -> Result<Connection> {
        let conn = self.db.connect().context("connecting to video DB")?;
        configure_connection(&conn).await?;
        Ok(conn)
    }

    /// Inserts a placeholder row holding only the URL and returns its id.
    pub async fn insert_pending(&self, url: &str) -> Result<i64> {
        let conn = self.connect().await?;
        let now = now_timestamp();
        conn.execute(
            r#"
            INSERT INTO videos (url, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?3)
            "#,
            params![url, VideoStatus::Pending.as_str(), now],
        )
        .await
        .context("inserting pending video")?;
        Ok(conn.last_insert_rowid())
    }

    /// Records a finished download. Returns `false` when the row no longer
    /// exists (it was deleted while the download ran).
    pub async fn mark_ready(&self, id: i64, completion: &Completion) -> Result<bool> {
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                r#"
                UPDATE videos
                SET title = ?1, filename = ?2, thumbnail = ?3, video_id = ?4,
                    status = ?5, error = NULL, updated_at = ?6
                WHERE id = ?7
                "#,
                params![
                    completion.title.as_deref(),
                    completion.filename.as_str(),
                    completion.thumbnail.as_deref(),
                    completion.video_id.as_str(),
                    VideoStatus::Ready.as_str(),
                    now_timestamp(),
                    id,
                ],
            )
            .await
            .with_context(|| format!("completing video {id}"))?;
        Ok(changed > 0)
    }

    pub async fn mark_failed(&self, id: i64, message: &str) -> Result<bool> {
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                "UPDATE videos SET status = ?1, error = ?2, updated_at = ?3 WHERE id = ?4",
                params![VideoStatus::Failed.as_str(), message, now_timestamp(), id],
            )
            .await
            .with_context(|| format!("marking video {id} as failed"))?;
        Ok(changed > 0)
    }

    pub async fn get(&self, id: i64) -> Result<Option<VideoRecord>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(&format!("{SELECT_COLUMNS} WHERE id = ?1"), params![id])
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_record(&row)?)),
            None => Ok(None),
        }
    }

    /// Completed records only, in insertion order.
    pub async fn list_ready(&self, page: Page) -> Result<Vec<VideoRecord>> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                &format!(
                    "{SELECT_COLUMNS} WHERE filename IS NOT NULL ORDER BY id ASC LIMIT ?1 OFFSET ?2"
                ),
                params![page.page_size, page.offset()],
            )
            .await?;
        collect_records(rows).await
    }

    pub async fn count_ready(&self) -> Result<i64> {
        let conn = self.connect().await?;
        count(&conn, "SELECT COUNT(*) FROM videos WHERE filename IS NOT NULL", params![]).await
    }

    /// Substring match on `title`. Rows without a title never match, so an
    /// empty query returns every titled record regardless of status.
    pub async fn search(&self, query: &str, page: Page) -> Result<Vec<VideoRecord>> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                &format!(
                    r"{SELECT_COLUMNS} WHERE title LIKE ?1 ESCAPE '\'
                      ORDER BY id ASC LIMIT ?2 OFFSET ?3"
                ),
                params![like_pattern(query), page.page_size, page.offset()],
            )
            .await?;
        collect_records(rows).await
    }

    pub async fn count_search(&self, query: &str) -> Result<i64> {
        let conn = self.connect().await?;
        count(
            &conn,
            r"SELECT COUNT(*) FROM videos WHERE title LIKE ?1 ESCAPE '\'",
            params![like_pattern(query)],
        )
        .await
    }

    /// Deletes the row. Returns `false` when nothing matched.
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let conn = self.connect().await?;
        let changed = conn
            .execute("DELETE FROM videos WHERE id = ?1", params![id])
            .await
            .with_context(|| format!("deleting video {id}"))?;
        Ok(changed > 0)
    }

    /// Filters `names` down to the assets no row other than `id` points at.
    /// Duplicate submissions of one URL share their files.
    pub async fn unshared_assets(&self, id: i64, names: &[String]) -> Result<Vec<String>> {
        let conn = self.connect().await?;
        let mut unshared = Vec::with_capacity(names.len());
        for name in names {
            let references = count(
                &conn,
                "SELECT COUNT(*) FROM videos WHERE id != ?1 AND (filename = ?2 OR thumbnail = ?2)",
                params![id, name.as_str()],
            )
            .await
            .with_context(|| format!("checking references to {name}"))?;
            if references == 0 {
                unshared.push(name.clone());
            }
        }
        Ok(unshared)
    }

    /// Records still waiting for a worker, oldest first.
    pub async fn pending(&self) -> Result<Vec<VideoRecord>> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                &format!("{SELECT_COLUMNS} WHERE status = ?1 ORDER BY id ASC"),
                params![VideoStatus::Pending.as_str()],
            )
            .await?;
        collect_records(rows).await
    }
}

async fn count(
    conn: &Connection,
    sql: &str,
    params: impl libsql::params::IntoParams,
) -> Result<i64> {
    let mut rows = conn.query(sql, params).await?;
    let row = rows.next().await?.context("missing COUNT row")?;
    Ok(row.get(0)?)
}

async fn collect_records(mut rows: libsql::Rows) -> Result<Vec<VideoRecord>> {
    let mut records = Vec::new();
    while let Some(row) = rows.next().await? {
        records.push(row_to_record(&row)?);
    }
    Ok(records)
}

/// Column order must match `SELECT_COLUMNS`.
fn row_to_record(row: &Row) -> Result<VideoRecord> {
    let status: String = row.get(6)?;
    let status = VideoStatus::parse(&status)
        .with_context(|| format!("unknown video status {status:?}"))?;
    let url: Option<String> = row.get(4)?;

    Ok(VideoRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        filename: row.get(2)?,
        thumbnail: row.get(3)?,
        url: url.unwrap_or_default(),
        video_id: row.get(5)?,
        status,
        error: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}
