use std::io::Read;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use diskdoc::{Collection, Condition, Config, Database, FieldValue, Id};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "diskdoc", version, about = "Embedded document collection store")]
struct Args {
    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// fsync every record write and index append
    #[arg(long, default_value_t = false)]
    sync: bool,

    /// Collection name
    #[arg(short, long, default_value = "default")]
    collection: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List collections under the data directory
    Collections,
    /// Insert a JSON document ("-" reads stdin); prints the new id
    Insert { json: String },
    /// Print a record
    Get { id: i64 },
    /// Replace a record with a JSON document ("-" reads stdin)
    Update { id: i64, json: String },
    /// Delete a record
    Delete { id: i64 },
    /// Build an index for a field from all records
    AddIndex { field: String },
    /// Drop an index and its log
    RemoveIndex { field: String },
    /// Rebuild an index from all records
    Reindex { field: String },
    /// List indexed fields
    Indexes,
    /// Query records; all filters are combined with AND
    Query {
        /// field=value (value parsed as JSON, falls back to a string)
        #[arg(long = "eq")]
        eq: Vec<String>,
        /// field=low..high, inclusive; either side may be empty
        #[arg(long = "range")]
        range: Vec<String>,
        /// field=value, negated
        #[arg(long = "ne")]
        ne: Vec<String>,
        /// Sort by this field instead of by id
        #[arg(long)]
        order_by: Option<String>,
        /// Stop after this many records
        #[arg(long)]
        limit: Option<usize>,
        /// Print ids only
        #[arg(long, default_value_t = false)]
        ids_only: bool,
    },
    /// Print collection statistics
    Stats,
    /// Rewrite index logs from live tables
    Vacuum,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if args.sync {
        config.sync_appends = true;
    }

    let db = Database::from_config(&config)
        .with_context(|| format!("opening {}", config.data_dir.display()))?;

    if let Command::Collections = args.command {
        for name in db.collection_names()? {
            println!("{name}");
        }
        return Ok(());
    }

    let coll = db.collection(&args.collection)?;
    run(&coll, args.command)
}

fn run(coll: &Collection, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Collections => unreachable!("handled before opening a collection"),
        Command::Insert { json } => {
            let doc = read_document(&json)?;
            println!("{}", coll.insert(&doc)?);
        }
        Command::Get { id } => {
            let doc: Value = coll.get(Id(id))?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        Command::Update { id, json } => {
            let doc = read_document(&json)?;
            coll.update(Id(id), &doc)?;
        }
        Command::Delete { id } => coll.delete(Id(id))?,
        Command::AddIndex { field } => coll.add_index(&field)?,
        Command::RemoveIndex { field } => coll.remove_index(&field)?,
        Command::Reindex { field } => coll.reindex(&field)?,
        Command::Indexes => {
            for field in coll.indexes() {
                println!("{field}");
            }
        }
        Command::Query {
            eq,
            range,
            ne,
            order_by,
            limit,
            ids_only,
        } => {
            let cond = build_condition(&eq, &range, &ne)?;
            let result = match &order_by {
                Some(field) => coll.query_ordered(&cond, field)?,
                None => coll.query(&cond)?,
            };
            if ids_only {
                for id in result.ids().into_iter().take(limit.unwrap_or(usize::MAX)) {
                    println!("{id}");
                }
                return Ok(());
            }
            for item in result.decode::<Value>().take(limit.unwrap_or(usize::MAX)) {
                let (id, doc) = item?;
                println!("{id}\t{doc}");
            }
        }
        Command::Stats => print!("{}", coll.stats()?),
        Command::Vacuum => println!("{}", coll.vacuum()?),
    }
    Ok(())
}

fn read_document(arg: &str) -> anyhow::Result<Value> {
    let text = if arg == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        arg.to_string()
    };
    serde_json::from_str(&text).context("document is not valid JSON")
}

/// `42` / `true` / `"x"` 按 JSON 解析，其余当作字符串。
fn parse_value(text: &str) -> FieldValue {
    match serde_json::from_str::<Value>(text) {
        Ok(v) => FieldValue::from(v),
        Err(_) => FieldValue::from(text),
    }
}

fn split_assignment(arg: &str) -> anyhow::Result<(&str, &str)> {
    arg.split_once('=')
        .filter(|(field, _)| !field.is_empty())
        .ok_or_else(|| anyhow!("expected field=value, got {arg:?}"))
}

fn build_condition(eq: &[String], range: &[String], ne: &[String]) -> anyhow::Result<Condition> {
    let mut parts = Vec::new();
    for arg in eq {
        let (field, value) = split_assignment(arg)?;
        parts.push(Condition::eq(field, parse_value(value)));
    }
    for arg in range {
        let (field, bounds) = split_assignment(arg)?;
        let Some((low, high)) = bounds.split_once("..") else {
            bail!("expected field=low..high, got {arg:?}");
        };
        parts.push(Condition::Range {
            field: field.to_string(),
            low: (!low.is_empty()).then(|| parse_value(low)),
            high: (!high.is_empty()).then(|| parse_value(high)),
        });
    }
    for arg in ne {
        let (field, value) = split_assignment(arg)?;
        parts.push(Condition::not(Condition::eq(field, parse_value(value))));
    }
    Ok(match parts.len() {
        0 => Condition::True,
        1 => parts.remove(0),
        _ => Condition::and(parts),
    })
}
