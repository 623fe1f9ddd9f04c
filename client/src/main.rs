use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use arrears::api::v1::operation::{ResultsQuery, SortOrder};
use arrears::report::ReportKind;
use arrears_client::api::ApiClient;
use arrears_client::chunked_upload::{self, UploadConfig};
use arrears_client::size_parser::parse_size;

/// Arrears report client.
#[derive(Debug, Parser)]
#[clap(version)]
#[clap(propagate_version = true)]
struct Opts {
    /// Base URL of the Arrears server.
    #[clap(
        long,
        global = true,
        env = "ARREARS_ENDPOINT",
        default_value = "http://localhost:8080/"
    )]
    endpoint: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload a portfolio export and launch a report on it.
    Upload(UploadOpts),

    /// Show the status of an upload session.
    Status {
        session_id: String,
    },

    /// Show the progress of an operation.
    Progress {
        operation_id: String,

        /// Follow the operation until it finishes.
        #[clap(long)]
        watch: bool,
    },

    /// Page through the results of an operation.
    Results(ResultsOpts),

    /// Cancel an upload session, or an operation with `--operation`.
    Cancel {
        id: String,

        /// Treat the ID as an operation ID.
        #[clap(long)]
        operation: bool,
    },

    /// Show a finished operation.
    Info {
        operation_id: String,
    },

    /// Check that the server is up.
    Health,
}

#[derive(Debug, clap::Args)]
struct UploadOpts {
    /// The file to upload.
    file: PathBuf,

    /// The report to produce.
    #[clap(short, long)]
    report: ReportKind,

    /// Size of each chunk, such as `4MiB`.
    #[clap(long, default_value = "4MiB", value_parser = parse_size)]
    chunk_size: u64,

    /// Retries per chunk.
    #[clap(long, default_value = "3")]
    retries: u32,

    /// Number of chunks uploaded in parallel.
    #[clap(short = 'j', long, default_value = "4")]
    concurrency: usize,

    /// Wait for the report to finish.
    #[clap(long)]
    wait: bool,

    /// Suppress progress bars.
    #[clap(short, long)]
    quiet: bool,
}

#[derive(Debug, clap::Args)]
struct ResultsOpts {
    operation_id: String,

    /// Resume after this cursor.
    #[clap(long)]
    cursor: Option<String>,

    /// Page size.
    #[clap(long)]
    limit: Option<i64>,

    /// Comma-separated list of fields to return.
    #[clap(long)]
    fields: Option<String>,

    /// Walk the result set in descending order.
    #[clap(long)]
    desc: bool,

    /// Follow cursors until the last page.
    #[clap(long)]
    all: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();
    let api = ApiClient::new(&opts.endpoint)?;

    match opts.command {
        Command::Upload(upload) => run_upload(&api, upload).await,
        Command::Status { session_id } => print_json(&api.get_upload_status(&session_id).await?),
        Command::Progress {
            operation_id,
            watch,
        } => {
            let progress = if watch {
                chunked_upload::watch_progress(&api, &operation_id, false).await?
            } else {
                api.get_progress(&operation_id, None).await?
            };
            print_json(&progress)
        }
        Command::Results(results) => run_results(&api, results).await,
        Command::Cancel { id, operation } => {
            if operation {
                print_json(&api.cancel_operation(&id).await?)
            } else {
                api.cancel_upload(&id).await?;
                eprintln!("Cancelled upload session {}", id);
                Ok(())
            }
        }
        Command::Info { operation_id } => print_json(&api.get_operation(&operation_id).await?),
        Command::Health => print_json(&api.health().await?),
    }
}

async fn run_upload(api: &ApiClient, opts: UploadOpts) -> Result<()> {
    let config = UploadConfig {
        chunk_size: opts.chunk_size,
        max_retries: opts.retries,
        concurrency: opts.concurrency,
        retry_base: Duration::from_secs(1),
        quiet: opts.quiet,
    };

    let completed = chunked_upload::upload_file(api, &opts.file, opts.report, config).await?;
    eprintln!(
        "Uploaded {} ({} bytes), operation {}",
        completed.filename, completed.size, completed.operation_id
    );

    if opts.wait {
        let progress =
            chunked_upload::watch_progress(api, &completed.operation_id, opts.quiet).await?;

        if progress.failed {
            return Err(anyhow!(
                "Operation {} failed: {}",
                completed.operation_id,
                progress.error.unwrap_or_default()
            ));
        }
    }

    println!("{}", completed.operation_id);
    Ok(())
}

async fn run_results(api: &ApiClient, opts: ResultsOpts) -> Result<()> {
    let mut query = ResultsQuery {
        cursor: opts.cursor,
        limit: opts.limit,
        fields: opts.fields,
        order: opts.desc.then_some(SortOrder::Desc),
    };

    loop {
        let page = api.get_results(&opts.operation_id, &query).await?;

        if !opts.all {
            return print_json(&page);
        }

        for item in &page.items {
            println!("{}", serde_json::to_string(item)?);
        }

        match page.pagination.next_cursor {
            Some(next) => query.cursor = Some(next),
            None => return Ok(()),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
