//! Aggregation, period-over-period trends and AI market insights.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};
use vacmon_core::Vacancy;
use vacmon_storage::VacancyStore;

pub const CRATE_NAME: &str = "vacmon-analytics";

pub const UNKNOWN_CITY: &str = "Unknown";

const JUNIOR_KEYWORDS: &[&str] = &["junior", "джуниор", "начинающий", "стажер", "intern"];
const MIDDLE_KEYWORDS: &[&str] = &["middle", "миддл"];
const SENIOR_KEYWORDS: &[&str] = &["senior", "сеньор", "ведущий", "lead"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub key: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution {
    pub top: Vec<Bucket>,
    pub distinct: usize,
}

impl Distribution {
    pub fn count_of(&self, key: &str) -> Option<usize> {
        self.top.iter().find(|b| b.key == key).map(|b| b.count)
    }
}

/// Counter that remembers first-seen order for tie breaking.
#[derive(Default)]
struct Tally {
    buckets: Vec<Bucket>,
    index: HashMap<String, usize>,
}

impl Tally {
    fn add(&mut self, key: &str) {
        match self.index.get(key) {
            Some(&i) => self.buckets[i].count += 1,
            None => {
                self.index.insert(key.to_string(), self.buckets.len());
                self.buckets.push(Bucket {
                    key: key.to_string(),
                    count: 1,
                });
            }
        }
    }

    fn ranked(mut self, top_n: usize) -> Distribution {
        let distinct = self.buckets.len();
        // sort_by is stable: equal counts keep discovery order
        self.buckets.sort_by(|a, b| b.count.cmp(&a.count));
        self.buckets.truncate(top_n);
        Distribution {
            top: self.buckets,
            distinct,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SalarySummary {
    pub average_from: f64,
    pub average_to: f64,
    pub min_from: f64,
    pub max_to: f64,
    pub specified: usize,
    pub not_specified: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperienceLevel {
    Junior,
    Middle,
    Senior,
    NotSpecified,
}

/// First matching level wins, checked junior, then middle, then senior.
pub fn classify_experience(title: &str) -> ExperienceLevel {
    let title = title.to_lowercase();
    let hit = |keywords: &[&str]| keywords.iter().any(|k| title.contains(k));
    if hit(JUNIOR_KEYWORDS) {
        ExperienceLevel::Junior
    } else if hit(MIDDLE_KEYWORDS) {
        ExperienceLevel::Middle
    } else if hit(SENIOR_KEYWORDS) {
        ExperienceLevel::Senior
    } else {
        ExperienceLevel::NotSpecified
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperienceCounts {
    pub junior: usize,
    pub middle: usize,
    pub senior: usize,
    pub not_specified: usize,
}

impl ExperienceCounts {
    fn record(&mut self, level: ExperienceLevel) {
        match level {
            ExperienceLevel::Junior => self.junior += 1,
            ExperienceLevel::Middle => self.middle += 1,
            ExperienceLevel::Senior => self.senior += 1,
            ExperienceLevel::NotSpecified => self.not_specified += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.junior + self.middle + self.senior + self.not_specified
    }
}

/// Point-in-time statistics over a set of vacancies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub total: usize,
    pub technologies: Distribution,
    pub locations: Distribution,
    pub companies: Distribution,
    pub salary: SalarySummary,
    pub experience: ExperienceCounts,
}

#[derive(Debug, Clone, Copy)]
pub struct AggregatorConfig {
    pub top_n: usize,
    pub location_top_n: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            top_n: 20,
            location_top_n: 10,
        }
    }
}

impl AggregatorConfig {
    pub fn uniform(top_n: usize) -> Self {
        Self {
            top_n,
            location_top_n: top_n,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Aggregator {
    config: AggregatorConfig,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self { config }
    }

    pub fn aggregate(&self, records: &[Vacancy]) -> Snapshot {
        let mut technologies = Tally::default();
        let mut locations = Tally::default();
        let mut companies = Tally::default();
        let mut experience = ExperienceCounts::default();

        let mut from_values = Vec::new();
        let mut to_values = Vec::new();
        let mut specified = 0usize;

        for record in records {
            for token in record.tech_stack.iter() {
                let token = token.trim().to_lowercase();
                if !token.is_empty() {
                    technologies.add(&token);
                }
            }

            let city = record
                .city
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .unwrap_or(UNKNOWN_CITY);
            locations.add(city);
            companies.add(&record.company);

            let from = stated_salary(record.salary_from);
            let to = stated_salary(record.salary_to);
            from_values.extend(from);
            to_values.extend(to);
            if from.is_some() || to.is_some() {
                specified += 1;
            }

            experience.record(classify_experience(&record.title));
        }

        Snapshot {
            total: records.len(),
            technologies: technologies.ranked(self.config.top_n),
            locations: locations.ranked(self.config.location_top_n),
            companies: companies.ranked(self.config.top_n),
            salary: SalarySummary {
                average_from: mean(&from_values),
                average_to: mean(&to_values),
                min_from: from_values.iter().copied().reduce(f64::min).unwrap_or(0.0),
                max_to: to_values.iter().copied().reduce(f64::max).unwrap_or(0.0),
                specified,
                not_specified: records.len() - specified,
            },
            experience,
        }
    }
}

/// A salary bound of 0 means "not stated".
fn stated_salary(bound: Option<f64>) -> Option<f64> {
    bound.filter(|v| *v != 0.0)
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// `(current - previous) / previous * 100`, or 0 when there is no baseline.
pub fn percent_change(current: f64, previous: f64) -> f64 {
    if previous == 0.0 {
        0.0
    } else {
        (current - previous) / previous * 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeTrend {
    pub current: usize,
    pub previous: usize,
    pub change_percent: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SalaryAverages {
    pub from: f64,
    pub to: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SalaryTrend {
    pub current: SalaryAverages,
    pub previous: SalaryAverages,
    pub change_percent_from: f64,
    pub change_percent_to: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendReport {
    pub total_vacancies: VolumeTrend,
    pub avg_salary: SalaryTrend,
    pub top_techs_current: Vec<Bucket>,
    pub top_techs_previous: Vec<Bucket>,
}

pub struct TrendCalculator;

impl TrendCalculator {
    pub const TOP_TECHS: usize = 10;

    pub fn compare(current: &Snapshot, previous: &Snapshot) -> TrendReport {
        let averages = |s: &Snapshot| SalaryAverages {
            from: s.salary.average_from,
            to: s.salary.average_to,
        };
        let top = |s: &Snapshot| {
            s.technologies
                .top
                .iter()
                .take(Self::TOP_TECHS)
                .cloned()
                .collect::<Vec<_>>()
        };
        let (cur, prev) = (averages(current), averages(previous));

        TrendReport {
            total_vacancies: VolumeTrend {
                current: current.total,
                previous: previous.total,
                change_percent: percent_change(current.total as f64, previous.total as f64),
            },
            avg_salary: SalaryTrend {
                current: cur,
                previous: prev,
                change_percent_from: percent_change(cur.from, prev.from),
                change_percent_to: percent_change(cur.to, prev.to),
            },
            top_techs_current: top(current),
            top_techs_previous: top(previous),
        }
    }

    pub fn compare_records(current: &[Vacancy], previous: &[Vacancy]) -> TrendReport {
        let aggregator = Aggregator::new(AggregatorConfig::uniform(Self::TOP_TECHS));
        Self::compare(&aggregator.aggregate(current), &aggregator.aggregate(previous))
    }
}

pub const PROMPT_SAMPLE_SIZE: usize = 10;

fn format_salary(v: &Vacancy) -> String {
    let bound = |b: Option<f64>| b.map(|x| format!("{x:.0}")).unwrap_or_else(|| "?".into());
    format!(
        "{}-{} {}",
        bound(v.salary_from),
        bound(v.salary_to),
        v.currency.as_deref().unwrap_or("")
    )
    .trim_end()
    .to_string()
}

fn buckets_json(buckets: &[Bucket]) -> String {
    let map: serde_json::Map<String, JsonValue> = buckets
        .iter()
        .map(|b| (b.key.clone(), JsonValue::from(b.count)))
        .collect();
    serde_json::to_string_pretty(&map).unwrap_or_default()
}

/// Render the analysis request from a sample of current listings and the window statistics.
pub fn build_prompt(
    sample: &[Vacancy],
    technologies: &[Bucket],
    regions: &[Bucket],
    trend: &TrendReport,
) -> String {
    let listings = sample
        .iter()
        .take(PROMPT_SAMPLE_SIZE)
        .map(|v| {
            format!(
                "Title: {}\nCompany: {}\nCity: {}\nTechnologies: {}\nSalary: {}\n---",
                v.title,
                v.company,
                v.city.as_deref().unwrap_or(UNKNOWN_CITY),
                v.tech_stack.iter().collect::<Vec<_>>().join(", "),
                format_salary(v),
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let changes = serde_json::to_string_pretty(trend).unwrap_or_default();

    format!(
        "Analyze the following job vacancies and provide insights:\n\n\
         1. Which technologies are trending right now?\n\
         2. In which regions is demand for developers growing?\n\
         3. How have requirements and salaries changed compared to the previous week?\n\
         4. Recommendations for junior and senior developers.\n\n\
         Vacancies:\n{listings}\n\n\
         Technology statistics:\n{}\n\n\
         Regional distribution:\n{}\n\n\
         Changes:\n{changes}\n",
        buckets_json(technologies),
        buckets_json(regions),
    )
}

#[derive(Debug, Error)]
pub enum InsightError {
    #[error("insight api key is not configured")]
    MissingApiKey,
    #[error("insight request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("insight api returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed insight response: {0}")]
    MalformedResponse(String),
}

#[async_trait]
pub trait InsightGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, InsightError>;
}

#[derive(Debug, Clone)]
pub struct InsightConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            api_url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            api_key: None,
            model: "deepseek/deepseek-chat".to_string(),
            timeout_secs: 120,
        }
    }
}

impl InsightConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_url: std::env::var("VACMON_INSIGHT_API_URL").unwrap_or(defaults.api_url),
            api_key: std::env::var("VACMON_INSIGHT_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            model: std::env::var("VACMON_INSIGHT_MODEL").unwrap_or(defaults.model),
            timeout_secs: std::env::var("VACMON_INSIGHT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.timeout_secs),
        }
    }
}

/// OpenAI-compatible chat completions client (OpenRouter, DeepSeek, ...).
#[derive(Debug, Clone)]
pub struct ChatCompletionsGenerator {
    client: reqwest::Client,
    config: InsightConfig,
}

impl ChatCompletionsGenerator {
    pub fn new(config: InsightConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("building insight http client")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl InsightGenerator for ChatCompletionsGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, InsightError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(InsightError::MissingApiKey)?;
        let payload = json!({
            "model": self.config.model,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let span = info_span!("insight_request", model = %self.config.model);
        async move {
            let res = self
                .client
                .post(&self.config.api_url)
                .bearer_auth(api_key)
                .json(&payload)
                .send()
                .await?;

            let status = res.status();
            if !status.is_success() {
                let body = res.text().await.unwrap_or_default();
                return Err(InsightError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            let body: JsonValue = res.json().await?;
            body.get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("message"))
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_str())
                .map(str::to_string)
                .ok_or_else(|| InsightError::MalformedResponse(body.to_string()))
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketAnalysis {
    pub analysis: String,
    pub trend: TrendReport,
}

/// Two-window market analysis: the last week against the week before it.
#[derive(Clone)]
pub struct MarketAnalyst {
    generator: Arc<dyn InsightGenerator>,
}

impl MarketAnalyst {
    pub const WINDOW_DAYS: i64 = 7;

    pub fn new(generator: Arc<dyn InsightGenerator>) -> Self {
        Self { generator }
    }

    /// Prompt for the windows ending at `now`, with the trend report it embeds.
    pub async fn prepare(
        &self,
        store: &VacancyStore,
        now: DateTime<Utc>,
    ) -> anyhow::Result<(String, TrendReport)> {
        let week_ago = now - chrono::Duration::days(Self::WINDOW_DAYS);
        let two_weeks_ago = now - chrono::Duration::days(2 * Self::WINDOW_DAYS);

        let current = store
            .created_between(week_ago, None)
            .await
            .context("loading current window")?;
        let previous = store
            .created_between(two_weeks_ago, Some(week_ago))
            .await
            .context("loading previous window")?;
        debug!(current = current.len(), previous = previous.len(), "loaded analysis windows");

        let full = Aggregator::new(AggregatorConfig::uniform(usize::MAX)).aggregate(&current);
        let trend = TrendCalculator::compare_records(&current, &previous);
        let prompt = build_prompt(&current, &full.technologies.top, &full.locations.top, &trend);
        Ok((prompt, trend))
    }

    /// Generator failures surface as [`InsightError`] inside the returned error.
    pub async fn analyze(
        &self,
        store: &VacancyStore,
        now: DateTime<Utc>,
    ) -> anyhow::Result<MarketAnalysis> {
        let (prompt, trend) = self.prepare(store, now).await?;
        let analysis = self.generator.generate(&prompt).await?;
        info!(chars = analysis.len(), "market analysis generated");
        Ok(MarketAnalysis { analysis, trend })
    }
}
