//! Collection pipeline: source registry, upsert engine, pacing and scheduling.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::{Connection, SqliteConnection};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;
use vacmon_adapters::{
    adapter_for_source, AdapterSettings, PageLimits, Pager, SearchQuery, HH_DEFAULT_BASE_URL,
    HH_SOURCE_ID,
};
use vacmon_core::VacancyDraft;
use vacmon_storage::{
    find_by_url, insert_vacancy, is_unique_violation, update_vacancy, HttpClientConfig,
    HttpFetcher, VacancyStore,
};

pub const CRATE_NAME: &str = "vacmon-sync";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    /// hh.ru area id; 1 is Moscow.
    #[serde(default = "default_area")]
    pub area: u32,
    #[serde(default)]
    pub queries: Vec<String>,
}

fn default_area() -> u32 {
    1
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self {
            sources: vec![SourceConfig {
                source_id: HH_SOURCE_ID.to_string(),
                display_name: "HeadHunter".to_string(),
                enabled: true,
                area: default_area(),
                queries: vec!["python developer".to_string()],
            }],
        }
    }
}

impl SourceRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    /// Read the registry at `path`, falling back to the built-in one when the file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no source registry file; using built-in sources");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub hh_base_url: String,
    pub page_size: u32,
    pub max_pages: u32,
    pub commit_every: usize,
    pub min_delay_secs: u64,
    pub max_delay_secs: u64,
    pub retention_days: i64,
    pub workspace_root: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://vacmon.db?mode=rwc".to_string(),
            scheduler_enabled: false,
            sync_cron: "0 0 0 * * *".to_string(),
            user_agent: "vacmon/0.1 (vacancy market monitor)".to_string(),
            http_timeout_secs: 20,
            hh_base_url: HH_DEFAULT_BASE_URL.to_string(),
            page_size: 100,
            max_pages: 20,
            commit_every: 100,
            min_delay_secs: 2,
            max_delay_secs: 5,
            retention_days: 30,
            workspace_root: PathBuf::from("."),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            scheduler_enabled: std::env::var("VACMON_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            sync_cron: std::env::var("VACMON_SYNC_CRON").unwrap_or(defaults.sync_cron),
            user_agent: std::env::var("VACMON_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("VACMON_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            hh_base_url: std::env::var("VACMON_HH_BASE_URL").unwrap_or(defaults.hh_base_url),
            page_size: env_parse("VACMON_PAGE_SIZE").unwrap_or(defaults.page_size),
            max_pages: env_parse("VACMON_MAX_PAGES").unwrap_or(defaults.max_pages),
            commit_every: env_parse("VACMON_COMMIT_EVERY").unwrap_or(defaults.commit_every),
            min_delay_secs: env_parse("VACMON_MIN_DELAY_SECS").unwrap_or(defaults.min_delay_secs),
            max_delay_secs: env_parse("VACMON_MAX_DELAY_SECS").unwrap_or(defaults.max_delay_secs),
            retention_days: env_parse("VACMON_RETENTION_DAYS").unwrap_or(defaults.retention_days),
            workspace_root: std::env::var("VACMON_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
        }
    }

    pub fn page_limits(&self) -> PageLimits {
        PageLimits {
            page_size: self.page_size,
            max_pages: self.max_pages,
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }
}

/// Counts for one upsert batch. `new + updated + skipped == total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertSummary {
    pub new_count: usize,
    pub updated_count: usize,
    pub skipped_count: usize,
    pub total_count: usize,
    /// Transactions committed while applying the batch.
    pub commits: usize,
}

impl UpsertSummary {
    fn absorb(&mut self, other: &UpsertSummary) {
        self.new_count += other.new_count;
        self.updated_count += other.updated_count;
        self.skipped_count += other.skipped_count;
        self.total_count += other.total_count;
        self.commits += other.commits;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UpsertConfig {
    pub commit_every: usize,
}

impl Default for UpsertConfig {
    fn default() -> Self {
        Self { commit_every: 100 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Insert-or-update by URL with chunked commits and per-record savepoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpsertEngine {
    config: UpsertConfig,
}

impl UpsertEngine {
    pub fn new(config: UpsertConfig) -> Self {
        Self { config }
    }

    pub async fn apply(
        &self,
        store: &VacancyStore,
        batch: &[VacancyDraft],
        now: DateTime<Utc>,
    ) -> Result<UpsertSummary> {
        let commit_every = self.config.commit_every.max(1);
        let mut summary = UpsertSummary {
            total_count: batch.len(),
            ..Default::default()
        };

        let mut tx = store.begin().await?;
        let mut pending = 0usize;

        for draft in batch {
            match upsert_record(&mut tx, draft, now).await {
                Ok(RecordOutcome::Inserted) => {
                    summary.new_count += 1;
                    pending += 1;
                }
                Ok(RecordOutcome::Updated) => {
                    summary.updated_count += 1;
                    pending += 1;
                }
                Ok(RecordOutcome::Unchanged) => summary.skipped_count += 1,
                Err(err) if is_unique_violation(&err) => {
                    warn!(url = %draft.url, error = %err, "unique conflict; skipping record");
                    summary.skipped_count += 1;
                }
                Err(err) => {
                    error!(url = %draft.url, error = %err, "failed to upsert record; skipping");
                    summary.skipped_count += 1;
                }
            }

            if pending >= commit_every {
                tx.commit().await.context("committing upsert chunk")?;
                summary.commits += 1;
                pending = 0;
                tx = store.begin().await?;
            }
        }

        tx.commit().await.context("committing final upsert chunk")?;
        summary.commits += 1;

        info!(
            new = summary.new_count,
            updated = summary.updated_count,
            skipped = summary.skipped_count,
            total = summary.total_count,
            "upsert batch applied"
        );
        Ok(summary)
    }
}

async fn upsert_record(
    conn: &mut SqliteConnection,
    draft: &VacancyDraft,
    now: DateTime<Utc>,
) -> sqlx::Result<RecordOutcome> {
    let mut savepoint = conn.begin().await?;
    match write_record(&mut savepoint, draft, now).await {
        Ok(outcome) => {
            savepoint.commit().await?;
            Ok(outcome)
        }
        Err(err) => {
            if let Err(rollback_err) = savepoint.rollback().await {
                warn!(url = %draft.url, error = %rollback_err, "savepoint rollback failed");
            }
            Err(err)
        }
    }
}

async fn write_record(
    conn: &mut SqliteConnection,
    draft: &VacancyDraft,
    now: DateTime<Utc>,
) -> sqlx::Result<RecordOutcome> {
    let Some(existing) = find_by_url(conn, &draft.url).await? else {
        insert_vacancy(conn, draft, now).await?;
        return Ok(RecordOutcome::Inserted);
    };

    let changed = existing.changed_fields(draft);
    if changed.is_empty() {
        return Ok(RecordOutcome::Unchanged);
    }

    // updated_at must move forward even when the clock has not.
    let stamp = now.max(existing.updated_at + chrono::Duration::microseconds(1));
    update_vacancy(conn, existing.id, draft, stamp).await?;
    debug!(url = %draft.url, ?changed, "updated vacancy");
    Ok(RecordOutcome::Updated)
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceOutcome {
    pub source_id: String,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<UpsertSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub totals: UpsertSummary,
    pub outcomes: Vec<SourceOutcome>,
}

impl CollectRunSummary {
    pub fn failed_sources(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_some()).count()
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: VacancyStore,
    http: HttpFetcher,
    registry: SourceRegistry,
    pager: Pager,
    upsert: UpsertEngine,
    adapter_settings: AdapterSettings,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: VacancyStore) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let registry = SourceRegistry::load_or_default(&config.registry_path())?;
        Ok(Self {
            pager: Pager::new(config.page_limits()),
            upsert: UpsertEngine::new(UpsertConfig {
                commit_every: config.commit_every,
            }),
            adapter_settings: AdapterSettings {
                hh_base_url: config.hh_base_url.clone(),
            },
            config,
            store,
            http,
            registry,
        })
    }

    pub fn with_registry(mut self, registry: SourceRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &VacancyStore {
        &self.store
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// One pagination + upsert cycle for a single source and query.
    pub async fn collect(&self, source_id: &str, query: &SearchQuery) -> Result<UpsertSummary> {
        let adapter = adapter_for_source(source_id, &self.http, &self.adapter_settings)
            .with_context(|| format!("no adapter registered for {source_id}"))?;
        let span = info_span!("collect", source_id, query = %query.text);
        async move {
            let drafts = self.pager.fetch_all(adapter.as_ref(), query).await;
            self.upsert.apply(&self.store, &drafts, Utc::now()).await
        }
        .instrument(span)
        .await
    }

    /// Collect every enabled source/query pair. Failures are recorded per source.
    pub async fn collect_all(&self) -> CollectRunSummary {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let mut totals = UpsertSummary::default();
        let mut outcomes = Vec::new();

        let jobs: Vec<(String, SearchQuery)> = self
            .registry
            .enabled()
            .flat_map(|source| {
                source.queries.iter().map(move |text| {
                    (source.source_id.clone(), SearchQuery::new(text.clone(), source.area))
                })
            })
            .collect();

        for (index, (source_id, query)) in jobs.iter().enumerate() {
            if index > 0 {
                let delay = self.pacing_delay();
                debug!(?delay, "pausing between sources");
                tokio::time::sleep(delay).await;
            }

            let outcome = match self.collect(source_id, query).await {
                Ok(summary) => {
                    totals.absorb(&summary);
                    SourceOutcome {
                        source_id: source_id.clone(),
                        query: query.text.clone(),
                        summary: Some(summary),
                        error: None,
                    }
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(%run_id, %source_id, error = %message, "source collection failed");
                    SourceOutcome {
                        source_id: source_id.clone(),
                        query: query.text.clone(),
                        summary: None,
                        error: Some(message),
                    }
                }
            };
            outcomes.push(outcome);
        }

        let summary = CollectRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            totals,
            outcomes,
        };
        info!(
            %run_id,
            sources = summary.outcomes.len(),
            failed = summary.failed_sources(),
            new = totals.new_count,
            updated = totals.updated_count,
            "collection run finished"
        );
        summary
    }

    /// Delete vacancies not refreshed within `days`.
    pub async fn purge(&self, days: i64) -> Result<u64> {
        self.store.purge_updated_before(purge_cutoff(Utc::now(), days)).await
    }

    fn pacing_delay(&self) -> Duration {
        let min = self.config.min_delay_secs.min(self.config.max_delay_secs);
        let max = self.config.max_delay_secs.max(min);
        if max == 0 {
            return Duration::ZERO;
        }
        let millis = rand::thread_rng().gen_range(min * 1000..=max * 1000);
        Duration::from_millis(millis)
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                info!("scheduled collection triggered");
                let summary = pipeline.collect_all().await;
                if summary.failed_sources() > 0 {
                    warn!(run_id = %summary.run_id, failed = summary.failed_sources(), "scheduled collection had failures");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    /// Build and start the cron scheduler when enabled. Keep the handle alive to keep it running.
    pub async fn start_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        let Some(sched) = self.maybe_build_scheduler().await? else {
            return Ok(None);
        };
        sched.start().await.context("starting scheduler")?;
        info!(cron = %self.config.sync_cron, "collection scheduler started");
        Ok(Some(sched))
    }
}

/// `now - days`, clamped to the earliest representable instant when the window is too large.
fn purge_cutoff(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    chrono::Duration::try_days(days.max(0))
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub async fn pipeline_from_env() -> Result<SyncPipeline> {
    let config = SyncConfig::from_env();
    let store = VacancyStore::connect(&config.database_url).await?;
    SyncPipeline::new(config, store)
}

pub async fn run_collect_once_from_env() -> Result<CollectRunSummary> {
    let pipeline = pipeline_from_env().await?;
    Ok(pipeline.collect_all().await)
}
