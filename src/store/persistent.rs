//! Durable request log backed by embedded SQLite
//!
//! One pool for the process lifetime, WAL journal mode for crash-safety
//! without fsync-per-write cost. Rows are inserted once and deleted only by
//! the pruning routine; insert and prune run in the same transaction so a
//! crash cannot leave the store over its configured bounds by more than the
//! interrupted transaction.

use crate::capture::types::{
    BodySize, CapturedHeaders, MockResponseInfo, RequestId, RequestRecord, StoredRequest,
};
use crate::store::filter::RecordFilter;
use crate::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

const CREATE_TABLE: &str = "\
CREATE TABLE IF NOT EXISTS requests (
    id TEXT PRIMARY KEY,
    captured_at TEXT NOT NULL,
    method TEXT NOT NULL,
    path TEXT NOT NULL,
    query TEXT NOT NULL,
    protocol TEXT NOT NULL,
    remote_addr TEXT NOT NULL,
    user_agent TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    is_binary INTEGER NOT NULL,
    body_size INTEGER NOT NULL,
    mock_rule TEXT NOT NULL,
    mock_status INTEGER NOT NULL
)";

const CREATE_TIME_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_requests_captured_at ON requests (captured_at DESC)";

const CREATE_METHOD_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_requests_method_captured_at \
     ON requests (method, captured_at DESC)";

const SELECT_COLUMNS: &str = "id, captured_at, method, path, query, protocol, remote_addr, \
     user_agent, headers, body, is_binary, mock_rule, mock_status";

/// Bounds applied to the persistent log on every insert
#[derive(Clone, Copy, Debug, Default)]
pub struct RetentionPolicy {
    /// Rows older than this are deleted; `None` disables age-based pruning
    pub max_age: Option<chrono::Duration>,
    /// Maximum row count; `None` disables count-based pruning
    pub max_records: Option<i64>,
}

impl RetentionPolicy {
    /// Build from raw configuration values where zero means "disabled"
    pub fn from_raw(retention_hours: u64, max_records: u64) -> Self {
        Self {
            max_age: (retention_hours > 0).then(|| chrono::Duration::hours(retention_hours as i64)),
            max_records: (max_records > 0).then_some(max_records as i64),
        }
    }
}

/// Durable, size/age-bounded log of captured requests
pub struct PersistentStore {
    pool: SqlitePool,
    retention: RetentionPolicy,
}

impl PersistentStore {
    /// Open (creating if missing) the database at `path` and ensure the schema.
    /// `:memory:` is accepted for tests.
    pub async fn connect(path: &str, retention: RetentionPolicy) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        // An in-memory database exists per connection; pool of one keeps it coherent
        let max_connections = if path.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        for ddl in [CREATE_TABLE, CREATE_TIME_INDEX, CREATE_METHOD_INDEX] {
            sqlx::query(ddl).execute(&pool).await?;
        }

        Ok(Self { pool, retention })
    }

    /// Insert a captured request and apply retention in the same transaction
    pub async fn record(&self, record: &RequestRecord) -> Result<StoredRequest> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO requests (id, captured_at, method, path, query, protocol, \
             remote_addr, user_agent, headers, body, is_binary, body_size, mock_rule, \
             mock_status) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(record.timestamp)
        .bind(&record.method)
        .bind(&record.path)
        .bind(&record.query)
        .bind(&record.protocol)
        .bind(&record.remote_addr)
        .bind(&record.user_agent)
        .bind(record.headers.to_json())
        .bind(record.body.as_ref())
        .bind(record.is_binary)
        .bind(*record.size.as_ref() as i64)
        .bind(&record.mock_response.rule_name)
        .bind(i64::from(record.mock_response.status))
        .execute(&mut *tx)
        .await?;

        if let Some(max_age) = self.retention.max_age {
            let cutoff = Utc::now() - max_age;
            sqlx::query("DELETE FROM requests WHERE captured_at < ?")
                .bind(cutoff)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(max_records) = self.retention.max_records {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM requests")
                .fetch_one(&mut *tx)
                .await?;
            if count > max_records {
                // Oldest excess rows by insertion order
                sqlx::query(
                    "DELETE FROM requests WHERE rowid IN \
                     (SELECT rowid FROM requests ORDER BY rowid ASC LIMIT ?)",
                )
                .bind(count - max_records)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(StoredRequest::new(record.clone()))
    }

    /// Filtered, newest-first page of rows plus the total match count before
    /// pagination
    pub async fn list(&self, filter: &RecordFilter) -> Result<(Vec<StoredRequest>, u64)> {
        let (where_sql, binds) = build_where(filter);

        let count_sql = format!("SELECT COUNT(*) FROM requests{where_sql}");
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        for bind in &binds {
            count_query = count_query.bind(bind);
        }
        let total = count_query.fetch_one(&self.pool).await?;

        let page_sql = format!(
            "SELECT {SELECT_COLUMNS} FROM requests{where_sql} \
             ORDER BY captured_at DESC, rowid DESC LIMIT ? OFFSET ?"
        );
        let mut page_query = sqlx::query(&page_sql);
        for bind in &binds {
            page_query = page_query.bind(bind);
        }
        // SQLite treats LIMIT -1 as unlimited
        let limit = filter.limit.map_or(-1, |limit| limit as i64);
        page_query = page_query.bind(limit).bind(filter.offset as i64);

        let rows = page_query.fetch_all(&self.pool).await?;
        let mut result = Vec::with_capacity(rows.len());
        for row in &rows {
            result.push(row_to_stored(row)?);
        }
        Ok((result, total as u64))
    }

    /// Stream matching rows newest-first to `visit`; the visitor returns
    /// false to stop iteration early. Used for unbounded export without
    /// loading the full result set into memory.
    pub async fn iterate<F>(&self, filter: &RecordFilter, mut visit: F) -> Result<()>
    where
        F: FnMut(&StoredRequest) -> bool,
    {
        let (where_sql, binds) = build_where(filter);
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM requests{where_sql} \
             ORDER BY captured_at DESC, rowid DESC"
        );
        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }

        let mut rows = query.fetch(&self.pool);
        while let Some(row) = rows.try_next().await? {
            let stored = row_to_stored(&row)?;
            if !visit(&stored) {
                break;
            }
        }
        Ok(())
    }

    pub async fn get(&self, id: RequestId) -> Result<Option<StoredRequest>> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM requests WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_stored).transpose()
    }

    pub async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM requests")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Release the database handle; safe to call more than once
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// WHERE clause and bind values shared by list/iterate/count
fn build_where(filter: &RecordFilter) -> (String, Vec<String>) {
    let mut clauses = Vec::new();
    let mut binds = Vec::new();

    if let Some(method) = &filter.method {
        clauses.push("UPPER(method) = UPPER(?)".to_string());
        binds.push(method.clone());
    }
    if let Some(search) = &filter.search {
        clauses.push(
            "(instr(lower(path), ?) > 0 OR instr(lower(query), ?) > 0 \
             OR instr(lower(remote_addr), ?) > 0 OR instr(lower(user_agent), ?) > 0 \
             OR instr(lower(headers), ?) > 0)"
                .to_string(),
        );
        let needle = search.to_lowercase();
        for _ in 0..5 {
            binds.push(needle.clone());
        }
    }

    if clauses.is_empty() {
        (String::new(), binds)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), binds)
    }
}

fn row_to_stored(row: &sqlx::sqlite::SqliteRow) -> Result<StoredRequest> {
    let id: String = row.try_get("id")?;
    let id = Uuid::parse_str(&id)
        .map(RequestId::from)
        .map_err(|e| Error::application(format!("Corrupt request id `{id}`: {e}")))?;
    let captured_at: DateTime<Utc> = row.try_get("captured_at")?;
    let headers_json: String = row.try_get("headers")?;
    let headers = CapturedHeaders::from_json(&headers_json)?;
    let body: Vec<u8> = row.try_get("body")?;
    let size = BodySize::from(body.len());
    let mock_status: i64 = row.try_get("mock_status")?;

    let record = RequestRecord {
        id,
        timestamp: captured_at,
        method: row.try_get("method")?,
        path: row.try_get("path")?,
        query: row.try_get("query")?,
        protocol: row.try_get("protocol")?,
        remote_addr: row.try_get("remote_addr")?,
        user_agent: row.try_get("user_agent")?,
        headers,
        body: Bytes::from(body),
        is_binary: row.try_get("is_binary")?,
        size,
        mock_response: MockResponseInfo {
            rule_name: row.try_get("mock_rule")?,
            status: mock_status as u16,
        },
    };
    Ok(StoredRequest::new(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::types::MockResponseInfo;

    fn record(method: &str, uri: &str, body: &'static [u8]) -> RequestRecord {
        let (parts, ()) = http::Request::builder()
            .method(method)
            .uri(uri)
            .header("user-agent", "reqtap-test")
            .body(())
            .unwrap()
            .into_parts();
        RequestRecord::capture(
            &parts,
            Bytes::from_static(body),
            None,
            MockResponseInfo {
                rule_name: "default".to_string(),
                status: 200,
            },
        )
    }

    async fn open(retention: RetentionPolicy) -> (tempfile::TempDir, PersistentStore) {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("requests.db");
        let store = PersistentStore::connect(path.to_str().unwrap(), retention)
            .await
            .expect("store opens");
        (dir, store)
    }

    #[tokio::test]
    async fn test_round_trip_preserves_record() {
        let (_dir, store) = open(RetentionPolicy::default()).await;
        let record = record("POST", "/hooks/pay?x=1", b"{\"amount\":42}");
        let stored = store.record(&record).await.unwrap();

        let found = store.get(stored.id).await.unwrap().expect("present");
        assert_eq!(found.record.method, record.method);
        assert_eq!(found.record.path, record.path);
        assert_eq!(found.record.query, record.query);
        assert_eq!(found.record.headers, record.headers);
        assert_eq!(found.record.body, record.body);
        assert_eq!(found.record.mock_response, record.mock_response);
        assert_eq!(*found.record.size.as_ref(), record.body.len());
    }

    #[tokio::test]
    async fn test_get_absent_returns_none() {
        let (_dir, store) = open(RetentionPolicy::default()).await;
        assert!(store.get(RequestId::generate()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_max_records_prunes_oldest() {
        let (_dir, store) = open(RetentionPolicy::from_raw(0, 2)).await;
        let first = store.record(&record("GET", "/1", b"")).await.unwrap();
        let second = store.record(&record("GET", "/2", b"")).await.unwrap();
        let third = store.record(&record("GET", "/3", b"")).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 2);
        assert!(store.get(first.id).await.unwrap().is_none());
        assert!(store.get(second.id).await.unwrap().is_some());
        assert!(store.get(third.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retention_age_prunes_old_rows() {
        let (_dir, store) = open(RetentionPolicy::from_raw(1, 0)).await;
        let mut old = record("GET", "/old", b"");
        old.timestamp = Utc::now() - chrono::Duration::hours(48);
        let old = store.record(&old).await.unwrap();

        let fresh = store.record(&record("GET", "/fresh", b"")).await.unwrap();

        assert!(store.get(old.id).await.unwrap().is_none());
        assert!(store.get(fresh.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_list_newest_first_with_pagination() {
        let (_dir, store) = open(RetentionPolicy::default()).await;
        for i in 0..5 {
            let mut r = record("GET", &format!("/{i}"), b"");
            // Spread timestamps so ordering is deterministic
            r.timestamp = Utc::now() - chrono::Duration::seconds(10 - i);
            store.record(&r).await.unwrap();
        }

        let (rows, total) = store
            .list(&RecordFilter::default().with_page(2, 1))
            .await
            .unwrap();
        assert_eq!(total, 5);
        let paths: Vec<_> = rows.into_iter().map(|s| s.record.path).collect();
        assert_eq!(paths, vec!["/3", "/2"]);
    }

    #[tokio::test]
    async fn test_list_method_filter_case_insensitive() {
        let (_dir, store) = open(RetentionPolicy::default()).await;
        store.record(&record("POST", "/a", b"")).await.unwrap();
        store.record(&record("GET", "/b", b"")).await.unwrap();

        let (rows, total) = store
            .list(&RecordFilter::default().with_method("post"))
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].record.method, "POST");
    }

    #[tokio::test]
    async fn test_list_search_spans_fields() {
        let (_dir, store) = open(RetentionPolicy::default()).await;
        store
            .record(&record("GET", "/orders?customer=acme", b""))
            .await
            .unwrap();
        store.record(&record("GET", "/users", b"")).await.unwrap();

        for needle in ["ORDERS", "acme", "reqtap-test"] {
            let (_, total) = store
                .list(&RecordFilter::default().with_search(needle))
                .await
                .unwrap();
            assert!(total >= 1, "search for {needle} should match");
        }

        let (_, total) = store
            .list(&RecordFilter::default().with_search("no-such-thing"))
            .await
            .unwrap();
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_iterate_stops_early() {
        let (_dir, store) = open(RetentionPolicy::default()).await;
        for i in 0..5 {
            store
                .record(&record("GET", &format!("/{i}"), b""))
                .await
                .unwrap();
        }

        let mut visited = 0;
        store
            .iterate(&RecordFilter::default(), |_| {
                visited += 1;
                visited < 3
            })
            .await
            .unwrap();
        assert_eq!(visited, 3);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_dir, store) = open(RetentionPolicy::default()).await;
        store.close().await;
        store.close().await;
    }
}
