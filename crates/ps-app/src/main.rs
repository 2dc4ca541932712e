//! Command line front end over the point-cloud store

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::csv::reader::Format;
use arrow::csv::ReaderBuilder;
use arrow::record_batch::RecordBatch;
use arrow::util::pretty::pretty_format_batches;
use clap::{Parser, Subcommand};
use ps_app::Explorer;
use ps_core::{CoreSettings, Predicate, RequestId, Value};
use ps_data::dataset::{encode_dataset, inspect_bytes};
use ps_data::synthetic::{synthetic_payload, SyntheticSpec};
use ps_dispatch::TaskOutcome;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Store, query and export point-cloud request results", long_about = None)]
struct Cli {
    #[arg(long, global = true, help = "Path to a JSON settings file")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Storage root, overrides the settings file")]
    root: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "List stored requests")]
    List,
    #[command(about = "Store an Arrow IPC or CSV file as the result of a new request")]
    Import {
        path: PathBuf,
        #[arg(long, default_value = "atl03x")]
        api: String,
    },
    #[command(about = "Print rows of a dataset")]
    Query {
        id: RequestId,
        #[arg(long = "where", value_parser = parse_filter, help = "column=value, may repeat")]
        filters: Vec<(String, Value)>,
        #[arg(long, value_delimiter = ',')]
        columns: Vec<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    #[command(about = "Print the distinct values of a column")]
    Distinct { id: RequestId, column: String },
    #[command(about = "Write a dataset as CSV")]
    Export {
        id: RequestId,
        #[arg(long, short, help = "Output file, stdout when omitted")]
        out: Option<PathBuf>,
    },
    #[command(about = "Delete a request and its dataset")]
    Delete {
        id: Option<RequestId>,
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },
    #[command(about = "Show storage usage")]
    Quota,
    #[command(about = "Store a generated dataset")]
    Demo {
        #[arg(long, default_value_t = 10_000)]
        rows: usize,
        #[arg(long, default_value_t = 1)]
        seed: u64,
        #[arg(long)]
        rgt: Option<i32>,
    },
}

fn parse_filter(raw: &str) -> Result<(String, Value), String> {
    let (column, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected column=value, got '{}'", raw))?;
    let value = value.trim();
    let value = if let Ok(int) = value.parse::<i64>() {
        Value::Int(int)
    } else if let Ok(float) = value.parse::<f64>() {
        Value::Float(float)
    } else {
        Value::Text(value.to_string())
    };
    Ok((column.trim().to_string(), value))
}

fn settings(cli: &Cli) -> Result<CoreSettings> {
    let settings = match &cli.config {
        Some(path) => CoreSettings::load(path)?,
        None => CoreSettings::default(),
    };
    Ok(match &cli.root {
        Some(root) => settings.with_root(root),
        None => settings,
    })
}

/// Arrow IPC files are stored as they are; CSV is converted
fn load_payload(path: &Path) -> Result<Vec<u8>> {
    let is_csv = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| ext.eq_ignore_ascii_case("csv"));
    if !is_csv {
        let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        inspect_bytes(&path.display().to_string(), &bytes)?;
        return Ok(bytes);
    }

    let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let (schema, _) = Format::default()
        .with_header(true)
        .infer_schema(BufReader::new(&file), Some(1000))?;
    file.seek(SeekFrom::Start(0))?;
    let schema = Arc::new(schema);
    let reader = ReaderBuilder::new(schema.clone())
        .with_header(true)
        .build(BufReader::new(file))?;
    let batches = reader.collect::<Result<Vec<RecordBatch>, _>>()?;
    Ok(encode_dataset(&schema, &batches, HashMap::new())?)
}

fn outcome<T>(outcome: TaskOutcome<T>) -> Result<T> {
    match outcome {
        TaskOutcome::Completed(value) => Ok(value),
        TaskOutcome::Failed(e) => Err(e.into()),
        TaskOutcome::Cancelled => bail!("Cancelled"),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let explorer = Explorer::open(settings(&cli)?).await?;

    match cli.command {
        Command::List => {
            for record in explorer.list_requests().await? {
                println!(
                    "{:>5}  {:<10} {:<8} {:>10} rows  {:>8}  {}",
                    record.id,
                    record.api.as_deref().unwrap_or("-"),
                    record.status.as_str(),
                    record.row_count.unwrap_or(0),
                    record.elapsed_display(),
                    record.file.as_deref().unwrap_or(""),
                );
            }
        }
        Command::Import { path, api } => {
            let payload = load_payload(&path)?;
            let parameters = serde_json::json!({ "source": path.display().to_string() });
            let id = explorer.submit_request(&api, parameters).await?;
            let summary = outcome(explorer.complete_request(id, &api, payload, None).await)?;
            println!(
                "request {}: {} rows, {} bytes in {}",
                id, summary.row_count, summary.num_bytes, summary.file
            );
        }
        Command::Query {
            id,
            filters,
            columns,
            limit,
        } => {
            let predicate = Predicate::and(
                filters
                    .into_iter()
                    .map(|(column, value)| Predicate::eq(column, value)),
            );
            let mut stream = outcome(explorer.query_dataset(id, predicate, columns).await)?;
            let mut shown = Vec::new();
            let mut remaining = limit;
            while remaining > 0 {
                let Some(batch) = stream.next_batch().await else {
                    break;
                };
                let batch = batch?;
                let take = remaining.min(batch.num_rows());
                shown.push(batch.slice(0, take));
                remaining -= take;
            }
            stream.cancel();
            println!("{}", pretty_format_batches(&shown)?);
        }
        Command::Distinct { id, column } => {
            for value in outcome(explorer.distinct_values(id, &column).await)? {
                println!("{}", serde_json::to_string(&value)?);
            }
        }
        Command::Export { id, out } => {
            let rows = match out {
                Some(path) => {
                    let file = File::create(&path)
                        .with_context(|| format!("Failed to create {}", path.display()))?;
                    let (mut sink, rows) = explorer.export_csv(id, BufWriter::new(file)).await?;
                    sink.flush()?;
                    rows
                }
                None => {
                    let (mut sink, rows) = explorer.export_csv(id, std::io::stdout().lock()).await?;
                    sink.flush()?;
                    rows
                }
            };
            info!(request_id = id, rows, "Export finished");
        }
        Command::Delete { id, all } => {
            if all {
                let deleted = explorer.delete_all_requests().await?;
                println!("deleted {} requests", deleted);
            } else if let Some(id) = id {
                let summary = outcome(explorer.delete_request(id).await)?;
                println!(
                    "request {}: record deleted: {}, file deleted: {}",
                    id, summary.record_deleted, summary.file_deleted
                );
            } else {
                bail!("Give a request id or --all");
            }
        }
        Command::Quota => {
            let quota = explorer.quota().await?;
            println!(
                "used {} of {} bytes ({} available)",
                quota.used, quota.quota, quota.available
            );
        }
        Command::Demo { rows, seed, rgt } => {
            let mut spec = SyntheticSpec::new(rows, seed);
            if let Some(rgt) = rgt {
                spec = spec.with_rgt(rgt);
            }
            let payload = synthetic_payload(&spec)?;
            let parameters = serde_json::json!({ "demo": true, "rows": rows, "seed": seed });
            let id = explorer.submit_request("atl03x", parameters).await?;
            let summary = outcome(
                explorer
                    .complete_request(id, "atl03x", payload, Some(rows as u64))
                    .await,
            )?;
            println!("request {}: {} rows in {}", id, summary.row_count, summary.file);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();

    run(Cli::parse()).await
}
