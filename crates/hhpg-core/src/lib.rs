//! Employer/vacancy entity model, payload normalization and the storage row layout.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "hhpg-core";

pub const ADDRESS_PLACEHOLDER: &str = "Address not specified";
pub const EXPERIENCE_PLACEHOLDER: &str = "Experience not specified";
pub const SCHEDULE_PLACEHOLDER: &str = "Schedule not specified";
pub const EMPLOYMENT_PLACEHOLDER: &str = "Employment not specified";

/// Column order of `employers` rows as read back by the count-join.
/// Inserts bind the first five; the sixth is the stored vacancy count.
pub const EMPLOYER_COLUMNS: [&str; 6] = [
    "id",
    "name",
    "url",
    "vacancies_url",
    "open_vacancies",
    "vacancies_in_database",
];

/// Column order of `vacancies` rows, shared by inserts and reads.
pub const VACANCY_COLUMNS: [&str; 15] = [
    "id",
    "employer_id",
    "title",
    "url",
    "address",
    "publication_date",
    "experience",
    "schedule",
    "employment",
    "salary_from",
    "salary_to",
    "salary_currency",
    "salary_gross",
    "description",
    "requirement",
];

/// Flat employer tuple in [`EMPLOYER_COLUMNS`] order.
pub type EmployerRow = (i64, String, String, String, i32, i64);

/// Flat vacancy tuple in [`VACANCY_COLUMNS`] order.
pub type VacancyRow = (
    i64,
    i64,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<i32>,
    Option<i32>,
    Option<String>,
    Option<bool>,
    Option<String>,
    Option<String>,
);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("{entity} payload is missing required field `{field}`")]
    MissingField {
        entity: &'static str,
        field: &'static str,
    },
    #[error("{entity} payload has invalid `{field}`: {value}")]
    InvalidField {
        entity: &'static str,
        field: &'static str,
        value: String,
    },
}

/// Identifier as sent by the API: usually a numeric string, sometimes a bare number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Number(i64),
    Text(String),
}

impl RawId {
    fn parse(&self, entity: &'static str, field: &'static str) -> Result<i64, NormalizeError> {
        match self {
            RawId::Number(n) => Ok(*n),
            RawId::Text(s) => s.trim().parse().map_err(|_| NormalizeError::InvalidField {
                entity,
                field,
                value: s.clone(),
            }),
        }
    }
}

/// Employer item from the `/employers` endpoint. Every field is optional on the wire;
/// presence is checked by [`Employer::from_api`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiEmployer {
    pub id: Option<RawId>,
    pub name: Option<String>,
    pub alternate_url: Option<String>,
    pub vacancies_url: Option<String>,
    pub open_vacancies: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiEmployerRef {
    pub id: Option<RawId>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiAddress {
    pub raw: Option<String>,
}

/// Any `{ "name": ... }` dictionary entry (area, experience, schedule, employment).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiNamed {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiSalary {
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub currency: Option<String>,
    pub gross: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiSnippet {
    pub requirement: Option<String>,
    pub responsibility: Option<String>,
}

/// Vacancy item from the `/vacancies` endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiVacancy {
    pub id: Option<RawId>,
    pub name: Option<String>,
    pub alternate_url: Option<String>,
    pub published_at: Option<String>,
    pub employer: Option<ApiEmployerRef>,
    pub address: Option<ApiAddress>,
    pub area: Option<ApiNamed>,
    pub experience: Option<ApiNamed>,
    pub schedule: Option<ApiNamed>,
    pub employment: Option<ApiNamed>,
    pub salary: Option<ApiSalary>,
    pub snippet: Option<ApiSnippet>,
}

fn required<T: Clone>(
    value: &Option<T>,
    entity: &'static str,
    field: &'static str,
) -> Result<T, NormalizeError> {
    value
        .clone()
        .ok_or(NormalizeError::MissingField { entity, field })
}

/// Display ordinal handed out to employers as they are constructed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmployerSequence {
    issued: u64,
}

impl EmployerSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_ordinal(&mut self) -> u64 {
        self.issued += 1;
        self.issued
    }

    pub fn reset(&mut self) {
        self.issued = 0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Numbered<T> {
    pub ordinal: u64,
    pub record: T,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employer {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub vacancies_url: String,
    pub open_vacancies: i32,
    pub vacancies_in_database: i64,
}

impl Employer {
    pub fn from_api(record: &ApiEmployer) -> Result<Self, NormalizeError> {
        const ENTITY: &str = "employer";
        let id = record
            .id
            .as_ref()
            .ok_or(NormalizeError::MissingField {
                entity: ENTITY,
                field: "id",
            })?
            .parse(ENTITY, "id")?;
        Ok(Self {
            id,
            name: required(&record.name, ENTITY, "name")?,
            url: required(&record.alternate_url, ENTITY, "alternate_url")?,
            vacancies_url: required(&record.vacancies_url, ENTITY, "vacancies_url")?,
            open_vacancies: required(&record.open_vacancies, ENTITY, "open_vacancies")?,
            vacancies_in_database: 0,
        })
    }

    /// Normalizes a batch, numbering each employer from `sequence`. The first bad record
    /// fails the whole batch.
    pub fn from_api_batch(
        records: &[ApiEmployer],
        sequence: &mut EmployerSequence,
    ) -> Result<Vec<Numbered<Employer>>, NormalizeError> {
        records
            .iter()
            .map(|record| {
                Self::from_api(record).map(|employer| Numbered {
                    ordinal: sequence.next_ordinal(),
                    record: employer,
                })
            })
            .collect()
    }

    pub fn to_row(&self) -> EmployerRow {
        (
            self.id,
            self.name.clone(),
            self.url.clone(),
            self.vacancies_url.clone(),
            self.open_vacancies,
            self.vacancies_in_database,
        )
    }

    pub fn from_row(row: EmployerRow) -> Self {
        let (id, name, url, vacancies_url, open_vacancies, vacancies_in_database) = row;
        Self {
            id,
            name,
            url,
            vacancies_url,
            open_vacancies,
            vacancies_in_database,
        }
    }

    pub fn from_stored_rows(
        rows: Vec<EmployerRow>,
        sequence: &mut EmployerSequence,
    ) -> Vec<Numbered<Employer>> {
        rows.into_iter()
            .map(|row| Numbered {
                ordinal: sequence.next_ordinal(),
                record: Self::from_row(row),
            })
            .collect()
    }

    pub fn cmp_by_open_vacancies(&self, other: &Self) -> Ordering {
        self.open_vacancies.cmp(&other.open_vacancies)
    }
}

impl fmt::Display for Numbered<Employer> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let e = &self.record;
        writeln!(f, "{:=^80}", format!(" Employer #{} ", self.ordinal))?;
        writeln!(f, "Name: {}", e.name)?;
        writeln!(f, "URL: {}", e.url)?;
        writeln!(f, "Vacancies URL: {}", e.vacancies_url)?;
        writeln!(f, "Open vacancies (API): {}", e.open_vacancies)?;
        writeln!(f, "Stored vacancies: {}", e.vacancies_in_database)?;
        write!(f, "{:=^80}", " End ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salary {
    pub from: Option<i32>,
    pub to: Option<i32>,
    pub currency: Option<String>,
    pub gross: Option<bool>,
}

impl Salary {
    /// Midpoint when both bounds are set, otherwise the single bound. Zero counts as set.
    pub fn basis(&self) -> Option<f64> {
        match (self.from, self.to) {
            (Some(from), Some(to)) => Some((f64::from(to) + f64::from(from)) / 2.0),
            (None, Some(to)) => Some(f64::from(to)),
            (Some(from), None) => Some(f64::from(from)),
            (None, None) => None,
        }
    }

    /// Upper bound if known, else the lower one; what salary-range filters compare.
    pub fn target(&self) -> Option<i32> {
        self.to.or(self.from)
    }
}

impl fmt::Display for Salary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.from, self.to) {
            (None, None) => return f.write_str("not specified"),
            (Some(from), Some(to)) => write!(f, "from {from} to {to}")?,
            (Some(from), None) => write!(f, "from {from}")?,
            (None, Some(to)) => write!(f, "up to {to}")?,
        }
        if let Some(currency) = &self.currency {
            write!(f, " ({currency})")?;
        }
        if self.gross == Some(true) {
            f.write_str(" before tax")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snippet {
    pub requirement: Option<String>,
    pub responsibility: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vacancy {
    pub id: i64,
    pub employer_id: i64,
    pub title: String,
    pub url: String,
    pub address: String,
    pub publication_date: String,
    pub experience: String,
    pub schedule: String,
    pub employment: String,
    pub salary: Salary,
    pub snippet: Snippet,
}

fn named_or(value: &Option<ApiNamed>, placeholder: &str) -> String {
    value
        .as_ref()
        .and_then(|named| named.name.clone())
        .unwrap_or_else(|| placeholder.to_string())
}

fn salary_bound(value: Option<i64>, field: &'static str) -> Result<Option<i32>, NormalizeError> {
    value
        .map(|v| {
            i32::try_from(v).map_err(|_| NormalizeError::InvalidField {
                entity: "vacancy",
                field,
                value: v.to_string(),
            })
        })
        .transpose()
}

/// `2024-05-01T12:00:00+0300` -> `2024-05-01 12:00:00`; anything else is returned as-is.
pub fn format_publication_date(raw: &str) -> String {
    DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z")
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|_| raw.to_string())
}

impl Vacancy {
    pub fn from_api(record: &ApiVacancy) -> Result<Self, NormalizeError> {
        const ENTITY: &str = "vacancy";
        let id = record
            .id
            .as_ref()
            .ok_or(NormalizeError::MissingField {
                entity: ENTITY,
                field: "id",
            })?
            .parse(ENTITY, "id")?;
        let employer_id = record
            .employer
            .as_ref()
            .and_then(|employer| employer.id.as_ref())
            .ok_or(NormalizeError::MissingField {
                entity: ENTITY,
                field: "employer.id",
            })?
            .parse(ENTITY, "employer.id")?;

        let address = record
            .address
            .as_ref()
            .and_then(|address| address.raw.clone())
            .filter(|raw| !raw.is_empty())
            .or_else(|| record.area.as_ref().and_then(|area| area.name.clone()))
            .unwrap_or_else(|| ADDRESS_PLACEHOLDER.to_string());

        let salary = match &record.salary {
            Some(s) => Salary {
                from: salary_bound(s.from, "salary.from")?,
                to: salary_bound(s.to, "salary.to")?,
                currency: s.currency.clone(),
                gross: s.gross,
            },
            None => Salary::default(),
        };
        let snippet = record
            .snippet
            .as_ref()
            .map(|s| Snippet {
                requirement: s.requirement.clone(),
                responsibility: s.responsibility.clone(),
            })
            .unwrap_or_default();

        Ok(Self {
            id,
            employer_id,
            title: required(&record.name, ENTITY, "name")?,
            url: required(&record.alternate_url, ENTITY, "alternate_url")?,
            address,
            publication_date: format_publication_date(&required(
                &record.published_at,
                ENTITY,
                "published_at",
            )?),
            experience: named_or(&record.experience, EXPERIENCE_PLACEHOLDER),
            schedule: named_or(&record.schedule, SCHEDULE_PLACEHOLDER),
            employment: named_or(&record.employment, EMPLOYMENT_PLACEHOLDER),
            salary,
            snippet,
        })
    }

    pub fn from_api_batch(records: &[ApiVacancy]) -> Result<Vec<Vacancy>, NormalizeError> {
        records.iter().map(Self::from_api).collect()
    }

    pub fn to_row(&self) -> VacancyRow {
        (
            self.id,
            self.employer_id,
            self.title.clone(),
            self.url.clone(),
            Some(self.address.clone()),
            Some(self.publication_date.clone()),
            Some(self.experience.clone()),
            Some(self.schedule.clone()),
            Some(self.employment.clone()),
            self.salary.from,
            self.salary.to,
            self.salary.currency.clone(),
            self.salary.gross,
            self.snippet.responsibility.clone(),
            self.snippet.requirement.clone(),
        )
    }

    pub fn from_row(row: VacancyRow) -> Self {
        let (
            id,
            employer_id,
            title,
            url,
            address,
            publication_date,
            experience,
            schedule,
            employment,
            salary_from,
            salary_to,
            salary_currency,
            salary_gross,
            description,
            requirement,
        ) = row;
        Self {
            id,
            employer_id,
            title,
            url,
            address: address.unwrap_or_else(|| ADDRESS_PLACEHOLDER.to_string()),
            publication_date: publication_date.unwrap_or_default(),
            experience: experience.unwrap_or_else(|| EXPERIENCE_PLACEHOLDER.to_string()),
            schedule: schedule.unwrap_or_else(|| SCHEDULE_PLACEHOLDER.to_string()),
            employment: employment.unwrap_or_else(|| EMPLOYMENT_PLACEHOLDER.to_string()),
            salary: Salary {
                from: salary_from,
                to: salary_to,
                currency: salary_currency,
                gross: salary_gross,
            },
            snippet: Snippet {
                requirement,
                responsibility: description,
            },
        }
    }

    pub fn from_stored_rows(rows: Vec<VacancyRow>) -> Vec<Vacancy> {
        rows.into_iter().map(Self::from_row).collect()
    }

    /// Midpoint-or-bound salary, zero when no bound is set.
    pub fn comparison_salary(&self) -> f64 {
        self.salary.basis().unwrap_or(0.0)
    }

    pub fn cmp_by_salary(&self, other: &Self) -> Ordering {
        self.comparison_salary()
            .total_cmp(&other.comparison_salary())
    }
}

impl fmt::Display for Vacancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:=^80}", " Vacancy ")?;
        writeln!(f, "Title: {}", self.title)?;
        writeln!(f, "URL: {}", self.url)?;
        writeln!(f, "Employer: https://hh.ru/employer/{}", self.employer_id)?;
        writeln!(f, "Address: {}", self.address)?;
        writeln!(f, "Published: {}", self.publication_date)?;
        writeln!(f, "Experience: {}", self.experience)?;
        writeln!(f, "Schedule: {}", self.schedule)?;
        writeln!(f, "Employment: {}", self.employment)?;
        writeln!(f, "Salary: {}", self.salary)?;
        writeln!(
            f,
            "Requirements: {}",
            self.snippet
                .requirement
                .as_deref()
                .unwrap_or("not specified")
        )?;
        writeln!(
            f,
            "Responsibilities: {}",
            self.snippet
                .responsibility
                .as_deref()
                .unwrap_or("not specified")
        )?;
        write!(f, "{:=^80}", " End ")
    }
}

/// Stable ascending sort by [`Vacancy::comparison_salary`].
pub fn sort_by_salary(vacancies: &mut [Vacancy]) {
    vacancies.sort_by(Vacancy::cmp_by_salary);
}

/// Mean midpoint-or-bound over vacancies with at least one bound; `None` if none qualify.
pub fn average_salary(vacancies: &[Vacancy]) -> Option<f64> {
    let bases: Vec<f64> = vacancies.iter().filter_map(|v| v.salary.basis()).collect();
    if bases.is_empty() {
        return None;
    }
    Some(bases.iter().sum::<f64>() / bases.len() as f64)
}

pub fn above_average(vacancies: &[Vacancy]) -> Vec<&Vacancy> {
    let Some(average) = average_salary(vacancies) else {
        return Vec::new();
    };
    vacancies
        .iter()
        .filter(|v| v.salary.basis().is_some_and(|basis| basis > average))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SalaryRangeError {
    #[error("salary range must be `min - max` or a single `max`, got {0:?}")]
    Malformed(String),
}

/// Inclusive salary window; a single number means `0 - max`. A window with `min > max`
/// matches nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SalaryRange {
    pub min: i32,
    pub max: i32,
}

impl FromStr for SalaryRange {
    type Err = SalaryRangeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
        let malformed = || SalaryRangeError::Malformed(input.to_string());
        let parts = compact
            .split('-')
            .map(|part| part.parse::<i32>().map_err(|_| malformed()))
            .collect::<Result<Vec<_>, _>>()?;
        match parts.as_slice() {
            [max] => Ok(Self { min: 0, max: *max }),
            [min, max] => Ok(Self {
                min: *min,
                max: *max,
            }),
            _ => Err(malformed()),
        }
    }
}

impl SalaryRange {
    pub fn contains(&self, vacancy: &Vacancy) -> bool {
        vacancy
            .salary
            .target()
            .is_some_and(|target| (self.min..=self.max).contains(&target))
    }
}

pub fn filter_by_salary_range(vacancies: Vec<Vacancy>, range: SalaryRange) -> Vec<Vacancy> {
    vacancies
        .into_iter()
        .filter(|v| range.contains(v))
        .collect()
}

/// Node of the static region tree (`areas.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Area {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub areas: Vec<Area>,
}

/// Depth-first, case-insensitive exact name match; first hit wins.
pub fn find_area_id<'a>(tree: &'a [Area], name: &str) -> Option<&'a str> {
    let needle = name.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }
    find_area_lowercase(tree, &needle)
}

fn find_area_lowercase<'a>(tree: &'a [Area], needle: &str) -> Option<&'a str> {
    for area in tree {
        if area.name.to_lowercase() == needle {
            return Some(area.id.as_str());
        }
        if let Some(id) = find_area_lowercase(&area.areas, needle) {
            return Some(id);
        }
    }
    None
}

/// Entry of the default employer list (`employers.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmployerSeed {
    pub name: String,
}
