//! Paginated job-board fetcher, its HTTP transport, and static reference-file loaders.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hhpg_core::{ApiEmployer, ApiVacancy, Area, EmployerSeed};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, info_span, Instrument};

pub const CRATE_NAME: &str = "hhpg-adapters";

pub const DEFAULT_BASE_URL: &str = "https://api.hh.ru";
pub const DEFAULT_USER_AGENT: &str = "HH-User-Agent";
pub const DEFAULT_MAX_PAGES: u32 = 20;
pub const DEFAULT_PAGE_SIZE: u32 = 10;

pub type QueryParams = Vec<(&'static str, String)>;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("undecodable page from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One GET round trip returning the decoded JSON body.
#[async_trait]
pub trait PageTransport: Send + Sync {
    async fn get_page(
        &self,
        url: &str,
        params: &[(&'static str, String)],
    ) -> Result<JsonValue, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
        }
    }
}

/// reqwest-backed transport. Single attempt per page: no retry, no backoff.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageTransport for HttpFetcher {
    async fn get_page(
        &self,
        url: &str,
        params: &[(&'static str, String)],
    ) -> Result<JsonValue, FetchError> {
        let resp = self.client.get(url).query(params).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
            url: final_url,
            source,
        })
    }
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    items: Option<Vec<T>>,
}

/// Parameters for `/vacancies`. Without `employer_ids` a single query is paged; with them
/// each employer is paged on its own from page 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VacancyQuery {
    pub text: Option<String>,
    pub max_pages: u32,
    pub per_page: u32,
    pub area: Option<String>,
    pub employer_ids: Option<Vec<i64>>,
}

impl Default for VacancyQuery {
    fn default() -> Self {
        Self {
            text: None,
            max_pages: DEFAULT_MAX_PAGES,
            per_page: DEFAULT_PAGE_SIZE,
            area: None,
            employer_ids: None,
        }
    }
}

impl VacancyQuery {
    pub fn base_params(&self) -> QueryParams {
        let mut params = vec![("per_page", self.per_page.to_string())];
        if let Some(text) = self.text.as_deref().filter(|t| !t.is_empty()) {
            params.push(("text", text.to_string()));
        }
        if let Some(area) = &self.area {
            params.push(("area", area.clone()));
        }
        params
    }
}

/// Parameters for `/employers`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmployerQuery {
    pub text: Option<String>,
    pub max_pages: Option<u32>,
    pub per_page: u32,
    pub sort_by_open_vacancies: bool,
    pub area: Option<String>,
}

impl Default for EmployerQuery {
    fn default() -> Self {
        Self {
            text: None,
            max_pages: None,
            per_page: DEFAULT_PAGE_SIZE,
            sort_by_open_vacancies: false,
            area: None,
        }
    }
}

impl EmployerQuery {
    pub fn base_params(&self) -> QueryParams {
        let mut params = vec![
            ("text", self.text.clone().unwrap_or_default()),
            ("per_page", self.per_page.to_string()),
            ("only_with_vacancies", "true".to_string()),
            (
                "sort_by",
                if self.sort_by_open_vacancies {
                    "by_vacancies_open"
                } else {
                    "by_name"
                }
                .to_string(),
            ),
        ];
        if let Some(area) = &self.area {
            params.push(("area", area.clone()));
        }
        params
    }

    pub fn page_cap(&self) -> u32 {
        self.max_pages.unwrap_or(DEFAULT_MAX_PAGES)
    }
}

/// Client for the employers/vacancies endpoints.
///
/// Fetched items land in buffers owned by this instance. Vacancy results accumulate across
/// calls; the employer buffer is cleared when `fetch_employers` starts. Pages are appended
/// as they arrive, so whatever was fetched before an error is still in the buffer. Use a
/// fresh `HhApi` for every aggregation that must not see earlier results.
pub struct HhApi {
    transport: Arc<dyn PageTransport>,
    base_url: String,
    vacancies: Vec<ApiVacancy>,
    employers: Vec<ApiEmployer>,
}

impl HhApi {
    pub fn new(transport: Arc<dyn PageTransport>) -> Self {
        Self {
            transport,
            base_url: DEFAULT_BASE_URL.to_string(),
            vacancies: Vec::new(),
            employers: Vec::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn vacancies_url(&self) -> String {
        format!("{}/vacancies", self.base_url)
    }

    pub fn employers_url(&self) -> String {
        format!("{}/employers", self.base_url)
    }

    pub fn buffered_vacancies(&self) -> &[ApiVacancy] {
        &self.vacancies
    }

    pub fn buffered_employers(&self) -> &[ApiEmployer] {
        &self.employers
    }

    pub fn clear(&mut self) {
        self.vacancies.clear();
        self.employers.clear();
    }

    /// Returns everything in the vacancy buffer, including results of earlier calls.
    pub async fn fetch_vacancies(
        &mut self,
        query: &VacancyQuery,
    ) -> Result<Vec<ApiVacancy>, FetchError> {
        let url = self.vacancies_url();
        let base = query.base_params();
        let span = info_span!("fetch_vacancies", url = %url, text = ?query.text);

        async {
            let mut fetched = 0usize;
            match &query.employer_ids {
                None => {
                    fetched += drain_pages(
                        self.transport.as_ref(),
                        &url,
                        &base,
                        query.max_pages,
                        &mut self.vacancies,
                    )
                    .await?;
                }
                Some(employer_ids) => {
                    for employer_id in employer_ids {
                        let mut params = base.clone();
                        params.push(("employer_id", employer_id.to_string()));
                        let count = drain_pages(
                            self.transport.as_ref(),
                            &url,
                            &params,
                            query.max_pages,
                            &mut self.vacancies,
                        )
                        .await?;
                        debug!(employer_id, count, "employer vacancies fetched");
                        fetched += count;
                    }
                }
            }
            info!(
                fetched,
                buffered = self.vacancies.len(),
                "vacancies fetched"
            );
            Ok::<_, FetchError>(self.vacancies.clone())
        }
        .instrument(span)
        .await
    }

    pub async fn fetch_employers(
        &mut self,
        query: &EmployerQuery,
    ) -> Result<Vec<ApiEmployer>, FetchError> {
        let url = self.employers_url();
        let base = query.base_params();
        let span = info_span!("fetch_employers", url = %url, text = ?query.text);

        async {
            self.employers.clear();
            drain_pages(
                self.transport.as_ref(),
                &url,
                &base,
                query.page_cap(),
                &mut self.employers,
            )
            .await?;
            info!(fetched = self.employers.len(), "employers fetched");
            Ok::<_, FetchError>(self.employers.clone())
        }
        .instrument(span)
        .await
    }
}

/// Requests pages 0.. until an empty page or `max_pages`, appending items to `sink`.
async fn drain_pages<T: DeserializeOwned>(
    transport: &dyn PageTransport,
    url: &str,
    base: &[(&'static str, String)],
    max_pages: u32,
    sink: &mut Vec<T>,
) -> Result<usize, FetchError> {
    let mut total = 0usize;
    let mut page = 0u32;
    while page < max_pages {
        let mut params = base.to_vec();
        params.push(("page", page.to_string()));

        let body = transport.get_page(url, &params).await?;
        let decoded: Page<T> =
            serde_json::from_value(body).map_err(|source| FetchError::Decode {
                url: url.to_string(),
                source,
            })?;
        let items = decoded.items.unwrap_or_default();
        if items.is_empty() {
            debug!(page, "empty page; end of data");
            break;
        }

        debug!(page, items = items.len(), "page fetched");
        total += items.len();
        sink.extend(items);
        page += 1;
    }
    Ok(total)
}

pub fn load_area_tree(path: impl AsRef<Path>) -> Result<Vec<Area>> {
    read_json_file(path)
}

pub fn load_employer_seeds(path: impl AsRef<Path>) -> Result<Vec<EmployerSeed>> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn param<'a>(params: &'a [(&'static str, String)], key: &str) -> Option<&'a str> {
        params
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn vacancy_params_skip_empty_text_and_missing_area() {
        let params = VacancyQuery {
            text: Some(String::new()),
            ..Default::default()
        }
        .base_params();
        assert_eq!(param(&params, "text"), None);
        assert_eq!(param(&params, "area"), None);
        assert_eq!(param(&params, "per_page"), Some("10"));

        let params = VacancyQuery {
            text: Some("rust".into()),
            area: Some("1".into()),
            per_page: 100,
            ..Default::default()
        }
        .base_params();
        assert_eq!(param(&params, "text"), Some("rust"));
        assert_eq!(param(&params, "area"), Some("1"));
        assert_eq!(param(&params, "per_page"), Some("100"));
    }

    #[test]
    fn employer_params_default_to_match_all_sorted_by_name() {
        let query = EmployerQuery::default();
        let params = query.base_params();
        assert_eq!(param(&params, "text"), Some(""));
        assert_eq!(param(&params, "sort_by"), Some("by_name"));
        assert_eq!(param(&params, "only_with_vacancies"), Some("true"));
        assert_eq!(param(&params, "area"), None);
        assert_eq!(query.page_cap(), DEFAULT_MAX_PAGES);

        let sorted = EmployerQuery {
            sort_by_open_vacancies: true,
            area: Some("2".into()),
            max_pages: Some(3),
            ..Default::default()
        };
        let params = sorted.base_params();
        assert_eq!(param(&params, "sort_by"), Some("by_vacancies_open"));
        assert_eq!(param(&params, "area"), Some("2"));
        assert_eq!(sorted.page_cap(), 3);
    }

    #[test]
    fn reference_files_load_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let areas_path = dir.path().join("areas.json");
        let mut file = fs::File::create(&areas_path).unwrap();
        write!(
            file,
            r#"[{{"id": "113", "name": "Россия", "areas": [
                {{"id": "2", "name": "Санкт-Петербург", "areas": []}}
            ]}}]"#
        )
        .unwrap();
        let seeds_path = dir.path().join("employers.json");
        fs::write(&seeds_path, r#"[{"name": "Яндекс"}, {"name": "Ozon"}]"#).unwrap();

        let tree = load_area_tree(&areas_path).unwrap();
        assert_eq!(hhpg_core::find_area_id(&tree, "санкт-петербург"), Some("2"));

        let seeds = load_employer_seeds(&seeds_path).unwrap();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[1].name, "Ozon");

        let err = load_area_tree(dir.path().join("missing.json")).unwrap_err();
        assert!(err.to_string().contains("missing.json"));
    }
}
