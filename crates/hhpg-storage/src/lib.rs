//! Postgres persistence for employers and vacancies.
//!
//! Every public operation runs in its own transaction: a pooled connection is checked out,
//! `BEGIN` is issued, the statements run, and the transaction is either committed or rolled
//! back before the error is returned. Nothing spans two operations.

use std::time::Duration;

use hhpg_core::{
    Employer, EmployerRow, Vacancy, VacancyRow, EMPLOYER_COLUMNS, VACANCY_COLUMNS,
};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "hhpg-storage";
pub const DEFAULT_SCHEMA: &str = "hh_api";

/// Midpoint of both bounds when present, otherwise whichever bound exists.
const SALARY_BASIS: &str = "CASE \
    WHEN salary_to IS NOT NULL AND salary_from IS NOT NULL \
        THEN (salary_to::float8 + salary_from::float8) / 2 \
    WHEN salary_to IS NOT NULL THEN salary_to::float8 \
    ELSE salary_from::float8 END";

/// Select list in [`VACANCY_COLUMNS`] order. The timestamp comes back as the wall-clock text
/// it was written from.
fn vacancy_select_list() -> String {
    VACANCY_COLUMNS
        .iter()
        .map(|column| match *column {
            "publication_date" => {
                "to_char(publication_date, 'YYYY-MM-DD HH24:MI:SS')".to_string()
            }
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Select list in [`EMPLOYER_COLUMNS`] order over `employers e LEFT JOIN vacancies v`.
fn employer_select_list() -> String {
    EMPLOYER_COLUMNS
        .iter()
        .map(|column| match *column {
            "open_vacancies" => "COALESCE(e.open_vacancies, 0)".to_string(),
            "vacancies_in_database" => "COUNT(v.id)".to_string(),
            other => format!("e.{other}"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// `INSERT ... ON CONFLICT (id) DO NOTHING` binding `columns` positionally as `$1..$n`.
fn insert_ignoring_conflicts(table: &str, columns: &[&str]) -> String {
    let placeholders = columns
        .iter()
        .enumerate()
        .map(|(index, column)| match *column {
            "publication_date" => format!("${}::timestamp", index + 1),
            _ => format!("${}", index + 1),
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {table} ({}) VALUES ({placeholders}) ON CONFLICT (id) DO NOTHING",
        columns.join(", ")
    )
}

/// Employer columns that are stored; the trailing count is computed when listing.
fn stored_employer_columns() -> &'static [&'static str] {
    static COLUMNS: [&str; EMPLOYER_COLUMNS.len()] = EMPLOYER_COLUMNS;
    &COLUMNS[..COLUMNS.len() - 1]
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("connecting to postgres: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("{op} failed: {source}")]
    Query {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("invalid schema name {0:?}")]
    InvalidSchemaName(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub skipped: usize,
}

impl UpsertSummary {
    fn record(&mut self, inserted: bool) {
        if inserted {
            self.inserted += 1;
        } else {
            self.skipped += 1;
        }
    }
}

/// Accepts plain identifiers only; the name is interpolated into DDL.
pub fn validate_schema_name(name: &str) -> StorageResult<()> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid_head && valid_tail && name.len() <= 63 {
        Ok(())
    } else {
        Err(StorageError::InvalidSchemaName(name.to_string()))
    }
}

/// Substring pattern for `ILIKE`, with the keyword's own wildcards escaped.
pub fn like_pattern(keyword: &str) -> String {
    let mut escaped = String::with_capacity(keyword.len() + 2);
    escaped.push('%');
    for c in keyword.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    schema: String,
}

impl PgStore {
    pub async fn connect(database_url: &str, schema: &str) -> StorageResult<Self> {
        validate_schema_name(schema)?;
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;
        debug!(schema, "postgres pool ready");
        Ok(Self {
            pool,
            schema: schema.to_string(),
        })
    }

    /// Builds the pool without opening a connection; the first operation connects.
    pub fn connect_lazy(database_url: &str, schema: &str) -> StorageResult<Self> {
        validate_schema_name(schema)?;
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect_lazy(database_url)
            .map_err(StorageError::Connect)?;
        Ok(Self {
            pool,
            schema: schema.to_string(),
        })
    }

    pub fn with_pool(pool: PgPool, schema: &str) -> StorageResult<Self> {
        validate_schema_name(schema)?;
        Ok(Self {
            pool,
            schema: schema.to_string(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn employers_table(&self) -> String {
        format!("{}.employers", self.schema)
    }

    fn vacancies_table(&self) -> String {
        format!("{}.vacancies", self.schema)
    }

    async fn begin(&self, op: &'static str) -> StorageResult<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|source| StorageError::Query { op, source })
    }

    async fn finish<T>(
        &self,
        tx: Transaction<'static, Postgres>,
        op: &'static str,
        outcome: Result<T, sqlx::Error>,
    ) -> StorageResult<T> {
        match outcome {
            Ok(value) => {
                tx.commit()
                    .await
                    .map_err(|source| StorageError::Query { op, source })?;
                Ok(value)
            }
            Err(source) => {
                error!(op, error = %source, "statement failed, rolling back");
                if let Err(rollback) = tx.rollback().await {
                    warn!(op, error = %rollback, "rollback failed");
                }
                Err(StorageError::Query { op, source })
            }
        }
    }

    /// Creates the schema and recreates both tables. Existing data is discarded.
    pub async fn initialize_schema(&self) -> StorageResult<()> {
        const OP: &str = "initialize_schema";
        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema),
            format!("DROP TABLE IF EXISTS {}", self.vacancies_table()),
            format!("DROP TABLE IF EXISTS {}", self.employers_table()),
            format!(
                "CREATE TABLE {} (
                    id BIGINT PRIMARY KEY,
                    name VARCHAR(255) NOT NULL,
                    url TEXT NOT NULL,
                    vacancies_url TEXT NOT NULL,
                    open_vacancies INTEGER
                )",
                self.employers_table()
            ),
            format!(
                "CREATE TABLE {} (
                    id BIGINT PRIMARY KEY,
                    employer_id BIGINT NOT NULL REFERENCES {}(id),
                    title VARCHAR(255) NOT NULL,
                    url TEXT NOT NULL,
                    address TEXT,
                    publication_date TIMESTAMP,
                    experience VARCHAR(255),
                    schedule VARCHAR(255),
                    employment VARCHAR(255),
                    salary_from INTEGER,
                    salary_to INTEGER,
                    salary_currency VARCHAR(255),
                    salary_gross BOOLEAN,
                    description TEXT,
                    requirement TEXT
                )",
                self.vacancies_table(),
                self.employers_table()
            ),
        ];

        let mut tx = self.begin(OP).await?;
        let outcome = async {
            for statement in &statements {
                sqlx::query(statement).execute(&mut *tx).await?;
            }
            Ok::<(), sqlx::Error>(())
        }
        .await;
        self.finish(tx, OP, outcome).await?;
        info!(schema = %self.schema, "schema initialized");
        Ok(())
    }

    /// Inserts the employer unless its id is already stored. Returns whether a row was added.
    pub async fn upsert_employer(&self, employer: &Employer) -> StorageResult<bool> {
        const OP: &str = "upsert_employer";
        let (id, name, url, vacancies_url, open_vacancies, _) = employer.to_row();
        let sql = insert_ignoring_conflicts(&self.employers_table(), stored_employer_columns());

        let mut tx = self.begin(OP).await?;
        let outcome = sqlx::query(&sql)
            .bind(id)
            .bind(name)
            .bind(url)
            .bind(vacancies_url)
            .bind(open_vacancies)
            .execute(&mut *tx)
            .await;
        let result = self.finish(tx, OP, outcome).await?;
        Ok(result.rows_affected() == 1)
    }

    /// Inserts the vacancy unless its id is already stored. Its employer must exist.
    pub async fn upsert_vacancy(&self, vacancy: &Vacancy) -> StorageResult<bool> {
        const OP: &str = "upsert_vacancy";
        let row = vacancy.to_row();
        let sql = insert_ignoring_conflicts(&self.vacancies_table(), &VACANCY_COLUMNS);

        let mut tx = self.begin(OP).await?;
        let outcome = sqlx::query(&sql)
            .bind(row.0)
            .bind(row.1)
            .bind(row.2)
            .bind(row.3)
            .bind(row.4)
            .bind(row.5)
            .bind(row.6)
            .bind(row.7)
            .bind(row.8)
            .bind(row.9)
            .bind(row.10)
            .bind(row.11)
            .bind(row.12)
            .bind(row.13)
            .bind(row.14)
            .execute(&mut *tx)
            .await;
        let result = self.finish(tx, OP, outcome).await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn upsert_employers(&self, employers: &[Employer]) -> StorageResult<UpsertSummary> {
        let mut summary = UpsertSummary::default();
        for employer in employers {
            summary.record(self.upsert_employer(employer).await?);
        }
        debug!(?summary, "employers upserted");
        Ok(summary)
    }

    pub async fn upsert_vacancies(&self, vacancies: &[Vacancy]) -> StorageResult<UpsertSummary> {
        let mut summary = UpsertSummary::default();
        for vacancy in vacancies {
            summary.record(self.upsert_vacancy(vacancy).await?);
        }
        debug!(?summary, "vacancies upserted");
        Ok(summary)
    }

    /// Employers with the number of their stored vacancies, most open vacancies first.
    pub async fn list_employers_with_counts(&self) -> StorageResult<Vec<EmployerRow>> {
        const OP: &str = "list_employers_with_counts";
        let sql = format!(
            "SELECT {}
             FROM {} e
             LEFT JOIN {} v ON v.employer_id = e.id
             GROUP BY e.id
             ORDER BY e.open_vacancies DESC",
            employer_select_list(),
            self.employers_table(),
            self.vacancies_table()
        );

        let mut tx = self.begin(OP).await?;
        let outcome = sqlx::query_as::<_, EmployerRow>(&sql)
            .fetch_all(&mut *tx)
            .await;
        self.finish(tx, OP, outcome).await
    }

    pub async fn list_vacancies(&self) -> StorageResult<Vec<VacancyRow>> {
        const OP: &str = "list_vacancies";
        let sql = format!(
            "SELECT {} FROM {}",
            vacancy_select_list(),
            self.vacancies_table()
        );

        let mut tx = self.begin(OP).await?;
        let outcome = sqlx::query_as::<_, VacancyRow>(&sql)
            .fetch_all(&mut *tx)
            .await;
        self.finish(tx, OP, outcome).await
    }

    /// `None` when no vacancy has a salary bound.
    pub async fn average_salary(&self) -> StorageResult<Option<f64>> {
        const OP: &str = "average_salary";
        let sql = format!(
            "SELECT AVG({SALARY_BASIS}) FROM {}
             WHERE salary_from IS NOT NULL OR salary_to IS NOT NULL",
            self.vacancies_table()
        );

        let mut tx = self.begin(OP).await?;
        let outcome = sqlx::query_scalar::<_, Option<f64>>(&sql)
            .fetch_one(&mut *tx)
            .await;
        self.finish(tx, OP, outcome).await
    }

    pub async fn vacancies_above_average(&self) -> StorageResult<Vec<VacancyRow>> {
        const OP: &str = "vacancies_above_average";
        let Some(average) = self.average_salary().await? else {
            return Ok(Vec::new());
        };
        let sql = format!(
            "SELECT {} FROM {}
             WHERE (salary_from IS NOT NULL OR salary_to IS NOT NULL)
               AND {SALARY_BASIS} > $1",
            vacancy_select_list(),
            self.vacancies_table()
        );

        let mut tx = self.begin(OP).await?;
        let outcome = sqlx::query_as::<_, VacancyRow>(&sql)
            .bind(average)
            .fetch_all(&mut *tx)
            .await;
        self.finish(tx, OP, outcome).await
    }

    /// Case-insensitive substring match on the title, optionally limited to one employer.
    pub async fn search_vacancies(
        &self,
        keyword: &str,
        employer_id: Option<i64>,
    ) -> StorageResult<Vec<VacancyRow>> {
        const OP: &str = "search_vacancies";
        let sql = format!(
            "SELECT {} FROM {}
             WHERE title ILIKE $1 ESCAPE '\\'
               AND ($2::bigint IS NULL OR employer_id = $2)",
            vacancy_select_list(),
            self.vacancies_table()
        );

        let mut tx = self.begin(OP).await?;
        let outcome = sqlx::query_as::<_, VacancyRow>(&sql)
            .bind(like_pattern(keyword))
            .bind(employer_id)
            .fetch_all(&mut *tx)
            .await;
        self.finish(tx, OP, outcome).await
    }

    pub async fn schema_exists(&self) -> StorageResult<bool> {
        const OP: &str = "schema_exists";
        let mut tx = self.begin(OP).await?;
        let outcome = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = $1 AND table_name = 'employers'
             )",
        )
        .bind(&self.schema)
        .fetch_one(&mut *tx)
        .await;
        self.finish(tx, OP, outcome).await
    }

    /// Drops both tables. The schema itself is left in place.
    pub async fn drop_schema(&self) -> StorageResult<()> {
        const OP: &str = "drop_schema";
        let statements = [
            format!("DROP TABLE IF EXISTS {}", self.vacancies_table()),
            format!("DROP TABLE IF EXISTS {}", self.employers_table()),
        ];

        let mut tx = self.begin(OP).await?;
        let outcome = async {
            for statement in &statements {
                sqlx::query(statement).execute(&mut *tx).await?;
            }
            Ok::<(), sqlx::Error>(())
        }
        .await;
        self.finish(tx, OP, outcome).await?;
        info!(schema = %self.schema, "tables dropped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_names_must_be_plain_identifiers() {
        assert!(validate_schema_name("hh_api").is_ok());
        assert!(validate_schema_name("_scratch2").is_ok());
        for bad in [
            "",
            "1abc",
            "hh-api",
            "hh_api; DROP TABLE x",
            "a.b",
            "schéma",
        ] {
            assert!(
                matches!(
                    validate_schema_name(bad),
                    Err(StorageError::InvalidSchemaName(_))
                ),
                "{bad:?} accepted"
            );
        }
        assert!(validate_schema_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("python"), "%python%");
        assert_eq!(like_pattern("100%"), "%100\\%%");
        assert_eq!(like_pattern("c_d\\e"), "%c\\_d\\\\e%");
        assert_eq!(like_pattern(""), "%%");
    }

    #[test]
    fn vacancy_statements_follow_the_shared_column_order() {
        let select = vacancy_select_list();
        let expressions: Vec<&str> = select.split(", ").collect();
        assert_eq!(expressions.len(), VACANCY_COLUMNS.len());
        assert_eq!(expressions[0], "id");
        assert_eq!(
            expressions[5],
            "to_char(publication_date, 'YYYY-MM-DD HH24:MI:SS')"
        );
        assert_eq!(expressions[14], "requirement");

        let insert = insert_ignoring_conflicts("hh_api.vacancies", &VACANCY_COLUMNS);
        assert!(insert.starts_with(&format!(
            "INSERT INTO hh_api.vacancies ({}) VALUES ($1, $2, $3, $4, $5, $6::timestamp, $7,",
            VACANCY_COLUMNS.join(", ")
        )));
        assert!(insert.ends_with("$15) ON CONFLICT (id) DO NOTHING"));
    }

    #[test]
    fn employer_statements_leave_the_count_to_the_listing() {
        assert_eq!(
            stored_employer_columns(),
            ["id", "name", "url", "vacancies_url", "open_vacancies"]
        );
        assert_eq!(
            insert_ignoring_conflicts("s.employers", stored_employer_columns()),
            "INSERT INTO s.employers (id, name, url, vacancies_url, open_vacancies) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (id) DO NOTHING"
        );
        assert_eq!(
            employer_select_list(),
            "e.id, e.name, e.url, e.vacancies_url, COALESCE(e.open_vacancies, 0), COUNT(v.id)"
        );
    }

    #[test]
    fn upsert_summary_counts_both_outcomes() {
        let mut summary = UpsertSummary::default();
        summary.record(true);
        summary.record(false);
        summary.record(true);
        assert_eq!(
            summary,
            UpsertSummary {
                inserted: 2,
                skipped: 1
            }
        );
    }
}
