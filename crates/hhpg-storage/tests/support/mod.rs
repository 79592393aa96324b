//! Postgres for integration tests.
//!
//! `HHPG_TEST_DATABASE_URL` points the tests at an existing server. Without it one
//! Postgres 16 container is started on first use and shared by every test in the binary.
//! Each test gets its own uuid-named schema, dropped again by [`drop_scratch`].

use hhpg_storage::PgStore;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

struct SharedPostgres {
    url: String,
    // Keeps the container alive for the whole test run.
    _container: Option<ContainerAsync<Postgres>>,
}

static SHARED_POSTGRES: OnceCell<SharedPostgres> = OnceCell::const_new();

impl SharedPostgres {
    async fn init() -> Self {
        if let Ok(url) = std::env::var("HHPG_TEST_DATABASE_URL") {
            return Self {
                url,
                _container: None,
            };
        }

        let container = Postgres::default()
            .with_tag("16")
            .start()
            .await
            .expect("start postgres container (is Docker running?)");
        let host = container.get_host().await.expect("container host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("container port");
        Self {
            url: format!("postgresql://postgres:postgres@{host}:{port}/postgres"),
            _container: Some(container),
        }
    }
}

pub async fn database_url() -> String {
    SHARED_POSTGRES
        .get_or_init(SharedPostgres::init)
        .await
        .url
        .clone()
}

/// Store bound to a fresh schema with both tables created.
pub async fn scratch_store() -> PgStore {
    let schema = format!("hhpg_test_{}", Uuid::new_v4().simple());
    let store = PgStore::connect(&database_url().await, &schema)
        .await
        .expect("connect to test database");
    store.initialize_schema().await.expect("initialize schema");
    store
}

pub async fn drop_scratch(store: PgStore) {
    sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", store.schema()))
        .execute(store.pool())
        .await
        .expect("drop test schema");
    store.close().await;
}
