use anyhow::Result;
use clap::{Parser, Subcommand};
use hhpg_adapters::{EmployerQuery, DEFAULT_MAX_PAGES};
use hhpg_core::{SalaryRange, Vacancy};
use hhpg_sync::{SyncConfig, SyncPipeline, SyncSummary};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "hhpg-cli")]
#[command(about = "Load hh.ru employers and vacancies into Postgres and query them")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the schema and (re)create both tables, discarding stored data.
    InitDb,
    /// Drop both tables.
    DropDb,
    /// Report whether the tables exist.
    Status,
    /// Look up the employers from the default list and store them.
    SeedEmployers {
        #[arg(long, default_value_t = 1)]
        max_pages: u32,
        #[arg(long, default_value_t = 1)]
        per_page: u32,
    },
    /// Search employers and store the results.
    LoadEmployers {
        #[arg(long)]
        query: Option<String>,
        /// Region name, e.g. "Москва".
        #[arg(long)]
        area: Option<String>,
        #[arg(long)]
        sort_by_vacancies: bool,
        #[arg(long)]
        max_pages: Option<u32>,
        #[arg(long, default_value_t = 10)]
        per_page: u32,
    },
    /// Fetch vacancies of every stored employer and store them.
    LoadVacancies {
        #[arg(long, default_value_t = DEFAULT_MAX_PAGES)]
        max_pages: u32,
        #[arg(long, default_value_t = 100)]
        per_page: u32,
    },
    /// Search vacancies on hh.ru without storing them.
    SearchRemote {
        #[arg(long)]
        query: Option<String>,
        #[arg(long)]
        area: Option<String>,
        /// "min - max" or a single "max".
        #[arg(long)]
        salary_range: Option<SalaryRange>,
        #[arg(long, default_value_t = DEFAULT_MAX_PAGES)]
        max_pages: u32,
    },
    /// Stored employers with their stored vacancy counts.
    Employers,
    /// All stored vacancies, lowest salary first.
    Vacancies,
    /// Stored vacancies whose title contains the keyword.
    Search {
        keyword: String,
        #[arg(long)]
        employer_id: Option<i64>,
    },
    /// Stored vacancies paying above the average.
    AboveAverage,
    /// Average salary over stored vacancies.
    AvgSalary,
}

fn print_summary(what: &str, summary: SyncSummary) {
    println!(
        "{what}: fetched={} inserted={} skipped={}",
        summary.fetched, summary.inserted, summary.skipped
    );
}

fn print_vacancies(vacancies: &[Vacancy]) {
    for vacancy in vacancies {
        println!("{vacancy}");
    }
    println!("{} vacancies", vacancies.len());
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    tracing::debug!(?cli, "arguments parsed");
    let pipeline = SyncPipeline::from_config(SyncConfig::from_env())?;

    match cli.command.unwrap_or(Commands::Status) {
        Commands::InitDb => {
            pipeline.initialize().await?;
            println!("tables created in schema {}", pipeline.config().schema);
        }
        Commands::DropDb => {
            pipeline.drop_tables().await?;
            println!("tables dropped from schema {}", pipeline.config().schema);
        }
        Commands::Status => {
            let state = if pipeline.exists().await? {
                "present"
            } else {
                "missing (run init-db)"
            };
            println!("schema {}: {state}", pipeline.config().schema);
        }
        Commands::SeedEmployers {
            max_pages,
            per_page,
        } => {
            let summary = pipeline.seed_default_employers(max_pages, per_page).await?;
            print_summary("default employers", summary);
        }
        Commands::LoadEmployers {
            query,
            area,
            sort_by_vacancies,
            max_pages,
            per_page,
        } => {
            let query = EmployerQuery {
                text: query,
                max_pages,
                per_page,
                sort_by_open_vacancies: sort_by_vacancies,
                area: None,
            };
            let summary = pipeline.sync_employers(query, area.as_deref()).await?;
            print_summary("employers", summary);
        }
        Commands::LoadVacancies {
            max_pages,
            per_page,
        } => {
            let summary = pipeline
                .sync_vacancies_for_stored_employers(max_pages, per_page)
                .await?;
            print_summary("vacancies", summary);
        }
        Commands::SearchRemote {
            query,
            area,
            salary_range,
            max_pages,
        } => {
            let vacancies = pipeline
                .search_remote_vacancies(query, area.as_deref(), salary_range, max_pages)
                .await?;
            print_vacancies(&vacancies);
        }
        Commands::Employers => {
            let employers = pipeline.stored_employers().await?;
            for employer in &employers {
                println!("{employer}");
            }
            println!("{} employers", employers.len());
        }
        Commands::Vacancies => print_vacancies(&pipeline.stored_vacancies().await?),
        Commands::Search {
            keyword,
            employer_id,
        } => print_vacancies(&pipeline.keyword_search(&keyword, employer_id).await?),
        Commands::AboveAverage => print_vacancies(&pipeline.above_average().await?),
        Commands::AvgSalary => match pipeline.average_salary().await? {
            Some(average) => println!("average salary: {average:.0}"),
            None => println!("no vacancies with a salary"),
        },
    }

    Ok(())
}
