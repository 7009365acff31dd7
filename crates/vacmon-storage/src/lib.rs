//! Persisted vacancy store + HTTP fetch utilities for VACMON.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite, SqliteConnection, Transaction};
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};
use vacmon_core::{TechStack, Vacancy, VacancyDraft};

pub const CRATE_NAME: &str = "vacmon-storage";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS vacancies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    company TEXT NOT NULL,
    city TEXT,
    tech_stack TEXT NOT NULL DEFAULT '',
    salary_from REAL,
    salary_to REAL,
    currency TEXT,
    url TEXT NOT NULL UNIQUE,
    source TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_vacancies_created_at ON vacancies(created_at);
CREATE INDEX IF NOT EXISTS idx_vacancies_updated_at ON vacancies(updated_at);
"#;

/// How long a writer waits for the database lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const SELECT_COLUMNS: &str = "id, title, company, city, tech_stack, salary_from, salary_to, \
     currency, url, source, created_at, updated_at";

/// Handle to the relational vacancy table.
#[derive(Debug, Clone)]
pub struct VacancyStore {
    pool: SqlitePool,
}

impl VacancyStore {
    /// Open (creating if missing) the database at `database_url` and apply the schema.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database. One connection, kept alive for the pool lifetime.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("opening in-memory sqlite")?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .context("applying vacancies schema")?;
        Ok(())
    }

    /// Start a unit of work holding the write lock from its first statement, so concurrent
    /// writers queue on the busy timeout instead of failing a read-then-write upgrade.
    /// Dropping the transaction without `commit` rolls it back.
    pub async fn begin(&self) -> anyhow::Result<Transaction<'static, Sqlite>> {
        self.pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .context("beginning transaction")
    }

    pub async fn get_by_url(&self, url: &str) -> anyhow::Result<Option<Vacancy>> {
        let mut conn = self.pool.acquire().await.context("acquiring connection")?;
        find_by_url(&mut conn, url)
            .await
            .with_context(|| format!("looking up vacancy {url}"))
    }

    pub async fn count(&self) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM vacancies")
            .fetch_one(&self.pool)
            .await
            .context("counting vacancies")?;
        Ok(row.try_get("n")?)
    }

    /// Page through rows in insertion order.
    pub async fn list(&self, offset: i64, limit: i64) -> anyhow::Result<Vec<Vacancy>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM vacancies ORDER BY id LIMIT ? OFFSET ?");
        let rows = sqlx::query(&sql)
            .bind(limit.max(0))
            .bind(offset.max(0))
            .fetch_all(&self.pool)
            .await
            .context("listing vacancies")?;
        rows.iter()
            .map(row_to_vacancy)
            .collect::<Result<Vec<_>, _>>()
            .map_err(anyhow::Error::from)
    }

    pub async fn all(&self) -> anyhow::Result<Vec<Vacancy>> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM vacancies ORDER BY id");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("loading vacancies")?;
        rows.iter()
            .map(row_to_vacancy)
            .collect::<Result<Vec<_>, _>>()
            .map_err(anyhow::Error::from)
    }

    /// Rows with `from <= created_at`, and `created_at < until` when `until` is given.
    pub async fn created_between(
        &self,
        from: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<Vacancy>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM vacancies \
             WHERE created_at >= ? AND (? IS NULL OR created_at < ?) ORDER BY id"
        );
        let until_micros = until.map(|t| t.timestamp_micros());
        let rows = sqlx::query(&sql)
            .bind(from.timestamp_micros())
            .bind(until_micros)
            .bind(until_micros)
            .fetch_all(&self.pool)
            .await
            .context("querying vacancy window")?;
        rows.iter()
            .map(row_to_vacancy)
            .collect::<Result<Vec<_>, _>>()
            .map_err(anyhow::Error::from)
    }

    /// Delete every row whose `updated_at` is strictly older than `cutoff`.
    pub async fn purge_updated_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut tx = self.begin().await?;
        let result = sqlx::query("DELETE FROM vacancies WHERE updated_at < ?")
            .bind(cutoff.timestamp_micros())
            .execute(&mut *tx)
            .await
            .context("purging stale vacancies")?;
        tx.commit().await.context("committing purge")?;
        info!(deleted = result.rows_affected(), %cutoff, "purged stale vacancies");
        Ok(result.rows_affected())
    }
}

/// Point lookup by the natural key.
pub async fn find_by_url(conn: &mut SqliteConnection, url: &str) -> sqlx::Result<Option<Vacancy>> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM vacancies WHERE url = ?");
    let row = sqlx::query(&sql).bind(url).fetch_optional(conn).await?;
    row.as_ref().map(row_to_vacancy).transpose()
}

/// Insert a new row with `created_at = updated_at = now`; returns the row id.
pub async fn insert_vacancy(
    conn: &mut SqliteConnection,
    draft: &VacancyDraft,
    now: DateTime<Utc>,
) -> sqlx::Result<i64> {
    let stamp = now.timestamp_micros();
    let result = sqlx::query(
        r#"
        INSERT INTO vacancies
            (title, company, city, tech_stack, salary_from, salary_to, currency, url, source, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&draft.title)
    .bind(&draft.company)
    .bind(&draft.city)
    .bind(tech_stack_to_text(&draft.tech_stack))
    .bind(draft.salary_from)
    .bind(draft.salary_to)
    .bind(&draft.currency)
    .bind(&draft.url)
    .bind(&draft.source)
    .bind(stamp)
    .bind(stamp)
    .execute(conn)
    .await?;
    debug!(url = %draft.url, "inserted vacancy");
    Ok(result.last_insert_rowid())
}

/// Overwrite the mutable fields of row `id` and stamp `updated_at`.
pub async fn update_vacancy(
    conn: &mut SqliteConnection,
    id: i64,
    draft: &VacancyDraft,
    updated_at: DateTime<Utc>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        UPDATE vacancies
           SET title = ?, company = ?, city = ?, tech_stack = ?,
               salary_from = ?, salary_to = ?, currency = ?, updated_at = ?
         WHERE id = ?
        "#,
    )
    .bind(&draft.title)
    .bind(&draft.company)
    .bind(&draft.city)
    .bind(tech_stack_to_text(&draft.tech_stack))
    .bind(draft.salary_from)
    .bind(draft.salary_to)
    .bind(&draft.currency)
    .bind(updated_at.timestamp_micros())
    .bind(id)
    .execute(conn)
    .await?;
    Ok(())
}

/// `true` when `err` is a UNIQUE constraint violation reported by the database.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

fn tech_stack_to_text(stack: &TechStack) -> String {
    stack.iter().collect::<Vec<_>>().join(",")
}

fn tech_stack_from_text(text: Option<String>) -> TechStack {
    text.as_deref()
        .unwrap_or_default()
        .split(',')
        .collect()
}

fn micros_to_utc(micros: i64) -> sqlx::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| sqlx::Error::Decode(format!("timestamp out of range: {micros}").into()))
}

fn row_to_vacancy(row: &SqliteRow) -> sqlx::Result<Vacancy> {
    Ok(Vacancy {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        company: row.try_get("company")?,
        city: row.try_get("city")?,
        tech_stack: tech_stack_from_text(row.try_get("tech_stack")?),
        salary_from: row.try_get("salary_from")?,
        salary_to: row.try_get("salary_to")?,
        currency: row.try_get("currency")?,
        created_at: micros_to_utc(row.try_get("created_at")?)?,
        updated_at: micros_to_utc(row.try_get("updated_at")?)?,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Shared reqwest client with retry/backoff for source APIs.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET `url` with `query` parameters and decode the body as JSON.
    pub async fn get_json(
        &self,
        source_id: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        async move {
            let mut last_request_error: Option<reqwest::Error> = None;

            for attempt in 0..=self.backoff.max_retries {
                match self.client.get(url).query(query).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            let body = resp.bytes().await?;
                            return serde_json::from_slice(&body).map_err(|source| {
                                FetchError::Decode {
                                    url: final_url,
                                    source,
                                }
                            });
                        }

                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            debug!(%status, attempt, "retrying after status");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }

                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            debug!(error = %err, attempt, "retrying after transport error");
                            last_request_error = Some(err);
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }

            match last_request_error {
                Some(err) => Err(FetchError::Request(err)),
                None => Err(FetchError::HttpStatus {
                    status: 0,
                    url: url.to_string(),
                }),
            }
        }
        .instrument(span)
        .await
    }
}
