//! Source adapter contracts, listing normalization and pagination.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};
use vacmon_core::{TechStack, VacancyDraft};
use vacmon_storage::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "vacmon-adapters";

pub const HH_SOURCE_ID: &str = "hh.ru";
pub const HH_DEFAULT_BASE_URL: &str = "https://api.hh.ru/vacancies";

/// Characters of each snippet field that take part in technology matching.
pub const SNIPPET_SCAN_CHARS: usize = 100;

/// Curated technology vocabulary, matched by plain substring containment.
pub const TECH_KEYWORDS: &[&str] = &[
    // languages
    "python", "java", "javascript", "typescript", "go", "golang", "rust", "c++", "c#", "php",
    // frontend
    "react", "vue", "angular", "html", "css", "sass", "less", "tailwind", "bootstrap",
    // backend
    "django", "flask", "fastapi", "spring", "node.js", "express", "laravel",
    // datastores
    "postgresql", "mysql", "mongodb", "redis", "elasticsearch", "sqlite",
    // cloud & devops
    "docker", "kubernetes", "aws", "azure", "gcp", "git",
    // ml
    "tensorflow", "pytorch", "pandas", "numpy", "opencv", "keras",
    // testing
    "pytest", "selenium", "cypress", "postman",
];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub text: String,
    pub area: u32,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>, area: u32) -> Self {
        Self {
            text: text.into(),
            area,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub page_size: u32,
    pub max_pages: u32,
}

impl Default for PageLimits {
    fn default() -> Self {
        // hh.ru never serves more than 2000 results per query.
        Self {
            page_size: 100,
            max_pages: 20,
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Raw listing objects for one page; an empty vec means there are no more pages.
    async fn fetch_page(
        &self,
        query: &SearchQuery,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<JsonValue>, AdapterError>;

    fn normalize(&self, raw: &JsonValue) -> Option<VacancyDraft>;
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    json_at(value, path)?.as_f64()
}

fn non_blank(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn scan_prefix(text: Option<&str>) -> String {
    text.unwrap_or_default()
        .to_lowercase()
        .chars()
        .take(SNIPPET_SCAN_CHARS)
        .collect()
}

/// Match the vocabulary against the leading part of both snippet fields.
pub fn extract_tech_stack(requirement: Option<&str>, responsibility: Option<&str>) -> TechStack {
    let haystack = format!("{} {}", scan_prefix(requirement), scan_prefix(responsibility));
    TECH_KEYWORDS
        .iter()
        .copied()
        .filter(|keyword| haystack.contains(keyword))
        .collect()
}

/// Map one hh.ru search item onto the canonical shape.
///
/// Returns `None` when title, employer name or listing URL is missing or blank.
pub fn normalize_hh_listing(source_id: &str, raw: &JsonValue) -> Option<VacancyDraft> {
    let title = non_blank(json_str(raw, &["name"]));
    let company = non_blank(json_str(raw, &["employer", "name"]));
    let url = non_blank(json_str(raw, &["alternate_url"]));

    let (Some(title), Some(company), Some(url)) = (title, company, url) else {
        debug!(id = ?raw.get("id"), "dropping listing without title/company/url");
        return None;
    };

    Some(VacancyDraft {
        source: source_id.to_string(),
        url,
        title,
        company,
        city: non_blank(json_str(raw, &["area", "name"])),
        tech_stack: extract_tech_stack(
            json_str(raw, &["snippet", "requirement"]),
            json_str(raw, &["snippet", "responsibility"]),
        ),
        salary_from: json_f64(raw, &["salary", "from"]),
        salary_to: json_f64(raw, &["salary", "to"]),
        currency: non_blank(json_str(raw, &["salary", "currency"])),
    })
}

/// Adapter for the public hh.ru vacancy search API.
#[derive(Debug, Clone)]
pub struct HhAdapter {
    http: HttpFetcher,
    base_url: String,
}

impl HhAdapter {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for HhAdapter {
    fn source_id(&self) -> &'static str {
        HH_SOURCE_ID
    }

    async fn fetch_page(
        &self,
        query: &SearchQuery,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<JsonValue>, AdapterError> {
        let params = [
            ("text", query.text.clone()),
            ("area", query.area.to_string()),
            ("per_page", page_size.to_string()),
            ("page", page.to_string()),
            ("only_with_salary", "true".to_string()),
        ];
        let body = self
            .http
            .get_json(self.source_id(), &self.base_url, &params)
            .await?;
        Ok(match body.get("items") {
            Some(JsonValue::Array(items)) => items.clone(),
            Some(other) => {
                return Err(AdapterError::Message(format!(
                    "unexpected `items` payload: {other}"
                )))
            }
            None => Vec::new(),
        })
    }

    fn normalize(&self, raw: &JsonValue) -> Option<VacancyDraft> {
        normalize_hh_listing(self.source_id(), raw)
    }
}

#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub hh_base_url: String,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            hh_base_url: HH_DEFAULT_BASE_URL.to_string(),
        }
    }
}

pub fn adapter_for_source(
    source_id: &str,
    http: &HttpFetcher,
    settings: &AdapterSettings,
) -> Option<Box<dyn SourceAdapter>> {
    match source_id {
        HH_SOURCE_ID => Some(Box::new(HhAdapter::new(
            http.clone(),
            settings.hh_base_url.clone(),
        ))),
        _ => None,
    }
}

/// Drives an adapter page by page until an empty page or the page cap.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pager {
    limits: PageLimits,
}

impl Pager {
    pub fn new(limits: PageLimits) -> Self {
        Self { limits }
    }

    /// Collect every normalized record for `query`.
    ///
    /// A failed page ends pagination; records gathered so far are kept.
    pub async fn fetch_all(
        &self,
        adapter: &dyn SourceAdapter,
        query: &SearchQuery,
    ) -> Vec<VacancyDraft> {
        let mut drafts = Vec::new();
        let mut raw_seen = 0usize;

        for page in 0..self.limits.max_pages {
            let items = match adapter.fetch_page(query, page, self.limits.page_size).await {
                Ok(items) => items,
                Err(err) => {
                    warn!(
                        source_id = adapter.source_id(),
                        page,
                        error = %err,
                        "page fetch failed; keeping partial results"
                    );
                    break;
                }
            };
            if items.is_empty() {
                debug!(source_id = adapter.source_id(), page, "empty page, stopping");
                break;
            }

            raw_seen += items.len();
            drafts.extend(items.iter().filter_map(|raw| adapter.normalize(raw)));
        }

        info!(
            source_id = adapter.source_id(),
            query = %query.text,
            raw_seen,
            normalized = drafts.len(),
            "pagination finished"
        );
        drafts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use vacmon_storage::{BackoffPolicy, HttpClientConfig};
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn listing(n: usize) -> JsonValue {
        json!({
            "id": n.to_string(),
            "name": format!("Python developer #{n}"),
            "employer": { "name": "Acme" },
            "area": { "name": "Москва" },
            "salary": { "from": 1000, "to": 2000, "currency": "RUR" },
            "snippet": { "requirement": "Python, Docker", "responsibility": null },
            "alternate_url": format!("https://hh.ru/vacancy/{n}"),
        })
    }

    /// Serves canned pages; any page past the end is empty.
    struct ScriptedAdapter {
        pages: Vec<Result<Vec<JsonValue>, String>>,
        calls: AtomicU32,
        requested: Mutex<Vec<u32>>,
    }

    impl ScriptedAdapter {
        fn new(pages: Vec<Result<Vec<JsonValue>, String>>) -> Self {
            Self {
                pages,
                calls: AtomicU32::new(0),
                requested: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SourceAdapter for ScriptedAdapter {
        fn source_id(&self) -> &'static str {
            "scripted"
        }

        async fn fetch_page(
            &self,
            _query: &SearchQuery,
            page: u32,
            _page_size: u32,
        ) -> Result<Vec<JsonValue>, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requested.lock().unwrap().push(page);
            match self.pages.get(page as usize) {
                Some(Ok(items)) => Ok(items.clone()),
                Some(Err(msg)) => Err(AdapterError::Message(msg.clone())),
                None => Ok(Vec::new()),
            }
        }

        fn normalize(&self, raw: &JsonValue) -> Option<VacancyDraft> {
            normalize_hh_listing("scripted", raw)
        }
    }

    /// Never runs dry.
    struct EndlessAdapter {
        calls: AtomicU32,
    }

    #[async_trait]
    impl SourceAdapter for EndlessAdapter {
        fn source_id(&self) -> &'static str {
            "endless"
        }

        async fn fetch_page(
            &self,
            _query: &SearchQuery,
            page: u32,
            page_size: u32,
        ) -> Result<Vec<JsonValue>, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let base = (page * page_size) as usize;
            Ok((0..page_size as usize).map(|i| listing(base + i)).collect())
        }

        fn normalize(&self, raw: &JsonValue) -> Option<VacancyDraft> {
            normalize_hh_listing("endless", raw)
        }
    }

    fn query() -> SearchQuery {
        SearchQuery::new("python developer", 1)
    }

    #[test]
    fn missing_required_fields_are_rejected() {
        for field in ["name", "employer", "alternate_url"] {
            let mut raw = listing(1);
            raw.as_object_mut().unwrap().remove(field);
            assert!(normalize_hh_listing(HH_SOURCE_ID, &raw).is_none(), "{field}");
        }

        let mut blank = listing(2);
        blank["name"] = json!("   ");
        assert!(normalize_hh_listing(HH_SOURCE_ID, &blank).is_none());

        let mut null_employer = listing(3);
        null_employer["employer"] = JsonValue::Null;
        assert!(normalize_hh_listing(HH_SOURCE_ID, &null_employer).is_none());
    }

    #[test]
    fn optional_fields_default_to_none() {
        let raw = json!({
            "name": "Rust Engineer",
            "employer": { "name": "Acme" },
            "salary": null,
            "alternate_url": "https://hh.ru/vacancy/9",
        });
        let draft = normalize_hh_listing(HH_SOURCE_ID, &raw).unwrap();
        assert_eq!(draft.city, None);
        assert_eq!(draft.salary_from, None);
        assert_eq!(draft.salary_to, None);
        assert_eq!(draft.currency, None);
        assert!(draft.tech_stack.is_empty());
        assert_eq!(draft.source, "hh.ru");
    }

    #[test]
    fn salary_bounds_are_independent() {
        let mut raw = listing(1);
        raw["salary"] = json!({ "from": null, "to": 5000, "currency": "USD" });
        let draft = normalize_hh_listing(HH_SOURCE_ID, &raw).unwrap();
        assert_eq!(draft.salary_from, None);
        assert_eq!(draft.salary_to, Some(5000.0));
        assert_eq!(draft.currency.as_deref(), Some("USD"));
    }

    #[test]
    fn tech_stack_is_lowercase_vocabulary_subset_without_duplicates() {
        let stack = extract_tech_stack(
            Some("PYTHON, Python and Django; Docker + Kubernetes"),
            Some("React/TypeScript, PostgreSQL, python again"),
        );
        let tokens: Vec<&str> = stack.iter().collect();
        for token in &tokens {
            assert!(TECH_KEYWORDS.contains(token), "{token} not in vocabulary");
            assert_eq!(*token, token.to_lowercase());
        }
        let mut deduped = tokens.clone();
        deduped.sort_unstable();
        deduped.dedup();
        assert_eq!(deduped.len(), tokens.len());
        assert!(stack.contains("python"));
        assert!(stack.contains("postgresql"));
        // "django" contains "go": plain substring semantics
        assert!(stack.contains("go"));
    }

    #[test]
    fn only_the_first_hundred_characters_are_scanned() {
        let padding = "x".repeat(SNIPPET_SCAN_CHARS - 6);
        let inside = format!("{padding}python");
        let outside = format!("{padding}  docker");
        assert_eq!(inside.chars().count(), SNIPPET_SCAN_CHARS);
        let stack = extract_tech_stack(Some(&inside), Some(&outside));
        assert!(stack.contains("python"));
        assert!(!stack.contains("docker"));
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let padding = "я".repeat(SNIPPET_SCAN_CHARS - 5);
        let stack = extract_tech_stack(Some(&format!("{padding}redis")), None);
        assert!(stack.contains("redis"));
    }

    #[tokio::test]
    async fn pager_stops_at_first_empty_page() {
        let adapter = ScriptedAdapter::new(vec![Ok((0..100).map(listing).collect()), Ok(vec![])]);
        let drafts = Pager::default().fetch_all(&adapter, &query()).await;
        assert_eq!(drafts.len(), 100);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
        assert_eq!(*adapter.requested.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn pager_drops_rejected_listings() {
        let mut page: Vec<JsonValue> = (0..10).map(listing).collect();
        page[3]["employer"] = JsonValue::Null;
        page[7].as_object_mut().unwrap().remove("alternate_url");
        let adapter = ScriptedAdapter::new(vec![Ok(page)]);
        let drafts = Pager::default().fetch_all(&adapter, &query()).await;
        assert_eq!(drafts.len(), 8);
    }

    #[tokio::test]
    async fn pager_returns_empty_when_first_page_is_empty() {
        let adapter = ScriptedAdapter::new(vec![Ok(vec![])]);
        let drafts = Pager::default().fetch_all(&adapter, &query()).await;
        assert!(drafts.is_empty());
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pager_keeps_partial_results_on_transport_failure() {
        let adapter = ScriptedAdapter::new(vec![
            Ok((0..5).map(listing).collect()),
            Err("connection reset".into()),
            Ok((5..10).map(listing).collect()),
        ]);
        let drafts = Pager::default().fetch_all(&adapter, &query()).await;
        assert_eq!(drafts.len(), 5);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn pager_respects_page_cap() {
        let adapter = EndlessAdapter {
            calls: AtomicU32::new(0),
        };
        let pager = Pager::new(PageLimits {
            page_size: 3,
            max_pages: 20,
        });
        let drafts = pager.fetch_all(&adapter, &query()).await;
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 20);
        assert_eq!(drafts.len(), 60);
    }

    #[tokio::test]
    async fn hh_adapter_sends_search_parameters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("text", "rust developer"))
            .and(query_param("area", "2"))
            .and(query_param("per_page", "50"))
            .and(query_param("page", "0"))
            .and(query_param("only_with_salary", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": [listing(1)] })))
            .expect(1)
            .mount(&server)
            .await;

        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let adapter = HhAdapter::new(http, server.uri());
        let items = adapter
            .fetch_page(&SearchQuery::new("rust developer", 2), 0, 50)
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert!(adapter.normalize(&items[0]).is_some());
    }

    #[tokio::test]
    async fn hh_adapter_server_error_ends_pagination() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("page", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": [listing(1), listing(2)] })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let http = HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy {
                max_retries: 0,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        let adapter = HhAdapter::new(http, server.uri());
        let drafts = Pager::default().fetch_all(&adapter, &query()).await;
        assert_eq!(drafts.len(), 2);
    }

    #[test]
    fn registry_knows_hh_only() {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let settings = AdapterSettings::default();
        assert!(adapter_for_source("hh.ru", &http, &settings).is_some());
        assert!(adapter_for_source("djinni", &http, &settings).is_none());
    }
}
