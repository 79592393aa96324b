//! Write pipelines end to end: a scripted hh.ru transport feeding a real Postgres schema.
//! Ignored by default because they need Docker or `HHPG_TEST_DATABASE_URL`; run them with
//! `cargo test -- --ignored`.

#[path = "../../hhpg-storage/tests/support/mod.rs"]
mod support;

use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hhpg_adapters::{EmployerQuery, FetchError, PageTransport};
use hhpg_storage::PgStore;
use hhpg_sync::{SyncConfig, SyncPipeline, SyncSummary};
use serde_json::{json, Value};
use support::{drop_scratch, scratch_store};
use tempfile::TempDir;

/// Serves page 0 of `/employers` (substring match on `text`) and of `/vacancies` per
/// `employer_id`; every later page is empty.
struct ScriptedHh {
    employers: Vec<Value>,
    vacancies: HashMap<&'static str, Vec<Value>>,
    requests: Mutex<Vec<String>>,
}

impl ScriptedHh {
    fn new() -> Self {
        let employer = |id: &str, name: &str, open_vacancies: i32| {
            json!({
                "id": id,
                "name": name,
                "alternate_url": format!("https://hh.ru/employer/{id}"),
                "vacancies_url": format!("https://api.hh.ru/vacancies?employer_id={id}"),
                "open_vacancies": open_vacancies
            })
        };
        let vacancy = |id: &str, employer_id: &str, title: &str, from: Value, to: Value| {
            json!({
                "id": id,
                "name": title,
                "alternate_url": format!("https://hh.ru/vacancy/{id}"),
                "published_at": "2024-05-01T12:00:00+0300",
                "employer": {"id": employer_id},
                "area": {"id": "1", "name": "Москва"},
                "salary": {"from": from, "to": to, "currency": "RUR", "gross": false},
                "snippet": {"requirement": "Rust", "responsibility": null}
            })
        };

        let mut vacancies = HashMap::new();
        vacancies.insert(
            "1740",
            vec![
                vacancy("1", "1740", "Rust Developer", json!(100000), json!(200000)),
                vacancy("2", "1740", "Python Developer", json!(120000), json!(null)),
            ],
        );
        vacancies.insert(
            "2180",
            vec![vacancy(
                "3",
                "2180",
                "Senior RUST Engineer",
                json!(null),
                json!(300000),
            )],
        );

        Self {
            employers: vec![
                employer("1740", "Yandex", 1200),
                employer("2180", "Ozon", 900),
                employer("84585", "Avito", 300),
            ],
            vacancies,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageTransport for ScriptedHh {
    async fn get_page(
        &self,
        url: &str,
        params: &[(&'static str, String)],
    ) -> Result<Value, FetchError> {
        let param = |key: &str| {
            params
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.as_str())
        };
        self.requests.lock().unwrap().push(url.to_string());
        if param("page") != Some("0") {
            return Ok(json!({"items": []}));
        }

        let items: Vec<Value> = if url.ends_with("/employers") {
            let text = param("text").unwrap_or_default().to_lowercase();
            self.employers
                .iter()
                .filter(|e| {
                    e["name"]
                        .as_str()
                        .is_some_and(|name| name.to_lowercase().contains(&text))
                })
                .cloned()
                .collect()
        } else {
            param("employer_id")
                .and_then(|id| self.vacancies.get(id))
                .cloned()
                .unwrap_or_default()
        };
        Ok(json!({ "items": items }))
    }
}

/// Pipeline over a scratch schema, with `employers.json` naming the given seeds.
async fn scratch_pipeline(seeds: &[&str]) -> (SyncPipeline, PgStore, Arc<ScriptedHh>, TempDir) {
    let store = scratch_store().await;
    let dir = tempfile::tempdir().unwrap();
    let seed_file: Vec<Value> = seeds.iter().map(|name| json!({ "name": name })).collect();
    fs::write(
        dir.path().join("employers.json"),
        serde_json::to_string(&seed_file).unwrap(),
    )
    .unwrap();

    let config = SyncConfig {
        schema: store.schema().to_string(),
        data_dir: dir.path().to_path_buf(),
        ..SyncConfig::from_lookup(|_| None)
    };
    let transport = Arc::new(ScriptedHh::new());
    let pipeline = SyncPipeline::new(config, store.clone(), transport.clone());
    (pipeline, store, transport, dir)
}

fn summary(fetched: usize, inserted: usize, skipped: usize) -> SyncSummary {
    SyncSummary {
        fetched,
        inserted,
        skipped,
    }
}

#[tokio::test]
#[ignore = "requires Docker or HHPG_TEST_DATABASE_URL"]
async fn employer_pipelines_store_each_employer_once() {
    let (pipeline, store, _transport, _dir) = scratch_pipeline(&["Yandex", "Ozon"]).await;

    let seeded = pipeline.seed_default_employers(1, 1).await.unwrap();
    assert_eq!(seeded, summary(2, 2, 0));

    let query = EmployerQuery {
        max_pages: Some(1),
        per_page: 10,
        ..Default::default()
    };
    let synced = pipeline.sync_employers(query.clone(), None).await.unwrap();
    assert_eq!(synced, summary(3, 1, 2));
    let again = pipeline.sync_employers(query, None).await.unwrap();
    assert_eq!(again, summary(3, 0, 3));

    let narrowed = EmployerQuery {
        text: Some("oZoN".into()),
        ..Default::default()
    };
    assert_eq!(
        pipeline.sync_employers(narrowed, None).await.unwrap(),
        summary(1, 0, 1)
    );

    let names: Vec<String> = pipeline
        .stored_employers()
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.record.name)
        .collect();
    assert_eq!(names, vec!["Yandex", "Ozon", "Avito"]);

    drop_scratch(store).await;
}

#[tokio::test]
#[ignore = "requires Docker or HHPG_TEST_DATABASE_URL"]
async fn vacancy_sync_is_idempotent_and_feeds_the_aggregates() {
    let (pipeline, store, _transport, _dir) = scratch_pipeline(&[]).await;
    let query = EmployerQuery {
        max_pages: Some(1),
        ..Default::default()
    };
    pipeline.sync_employers(query, None).await.unwrap();

    let first = pipeline
        .sync_vacancies_for_stored_employers(5, 100)
        .await
        .unwrap();
    assert_eq!(first, summary(3, 3, 0));
    let second = pipeline
        .sync_vacancies_for_stored_employers(5, 100)
        .await
        .unwrap();
    assert_eq!(second, summary(3, 0, 3));

    let counts: Vec<(u64, String, i64)> = pipeline
        .stored_employers()
        .await
        .unwrap()
        .into_iter()
        .map(|n| (n.ordinal, n.record.name, n.record.vacancies_in_database))
        .collect();
    assert_eq!(
        counts,
        vec![
            (1, "Yandex".to_string(), 2),
            (2, "Ozon".to_string(), 1),
            (3, "Avito".to_string(), 0),
        ]
    );

    let stored: Vec<i64> = pipeline
        .stored_vacancies()
        .await
        .unwrap()
        .iter()
        .map(|v| v.id)
        .collect();
    assert_eq!(stored, vec![2, 1, 3]);

    let rust: Vec<i64> = pipeline
        .keyword_search("rust", None)
        .await
        .unwrap()
        .iter()
        .map(|v| v.id)
        .collect();
    assert_eq!(rust, vec![1, 3]);
    let scoped = pipeline.keyword_search("rust", Some(2180)).await.unwrap();
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].title, "Senior RUST Engineer");

    assert_eq!(pipeline.average_salary().await.unwrap(), Some(190000.0));
    let above: Vec<i64> = pipeline
        .above_average()
        .await
        .unwrap()
        .iter()
        .map(|v| v.id)
        .collect();
    assert_eq!(above, vec![3]);

    drop_scratch(store).await;
}

#[tokio::test]
#[ignore = "requires Docker or HHPG_TEST_DATABASE_URL"]
async fn vacancy_sync_without_stored_employers_skips_the_api() {
    let (pipeline, store, transport, _dir) = scratch_pipeline(&[]).await;

    let summary = pipeline
        .sync_vacancies_for_stored_employers(5, 100)
        .await
        .unwrap();
    assert_eq!(summary, SyncSummary::default());
    assert!(transport.requests().is_empty());
    assert!(pipeline.stored_vacancies().await.unwrap().is_empty());

    drop_scratch(store).await;
}

#[tokio::test]
#[ignore = "requires Docker or HHPG_TEST_DATABASE_URL"]
async fn drop_and_initialize_toggle_existence() {
    let (pipeline, store, _transport, _dir) = scratch_pipeline(&[]).await;

    assert!(pipeline.exists().await.unwrap());
    pipeline.drop_tables().await.unwrap();
    assert!(!pipeline.exists().await.unwrap());
    pipeline.initialize().await.unwrap();
    assert!(pipeline.exists().await.unwrap());

    drop_scratch(store).await;
}
