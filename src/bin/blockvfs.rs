//! blockvfs CLI
//!
//! Inspect a SQLite-backed block store and run SQL against the databases
//! kept inside it.

use anyhow::{bail, Context};
use blockvfs::{register_vfs, unregister_vfs, BlockStore, StoreConfig, VfsAdapter, VfsConfig};
use clap::{Parser, Subcommand};
use rusqlite::types::ValueRef;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "blockvfs")]
#[command(about = "Inspect and query SQLite databases kept in a block store")]
struct Args {
    /// Path to the block store database
    #[arg(short = 's', long, global = true)]
    store: Option<PathBuf>,

    /// TOML configuration file (overrides --store)
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List files and their lengths
    Ls {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Write a file's content to stdout
    Cat {
        /// File name inside the store, e.g. /app.db
        name: String,
    },
    /// Run SQL statements against a database in the store
    Sql {
        /// Database name inside the store, e.g. /app.db
        db: String,
        /// Statements, run in order
        #[arg(required = true)]
        statements: Vec<String>,
    },
}

#[derive(Serialize)]
struct Listing {
    name: String,
    length: u64,
}

fn load_config(args: &Args) -> anyhow::Result<VfsConfig> {
    if let Some(path) = &args.config {
        return VfsConfig::load(path).with_context(|| format!("loading {}", path.display()));
    }
    match &args.store {
        Some(path) => Ok(VfsConfig::default().with_store(StoreConfig::Sqlite { path: path.clone() })),
        None => bail!("either --store or --config is required"),
    }
}

fn format_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => format!("<{} bytes>", b.len()),
    }
}

fn run_sql(vfs_name: &str, db: &str, statements: &[String]) -> anyhow::Result<()> {
    let conn = rusqlite::Connection::open_with_flags(
        format!("file:{}?vfs={}", db, vfs_name),
        rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
            | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
            | rusqlite::OpenFlags::SQLITE_OPEN_URI,
    )
    .with_context(|| format!("opening {}", db))?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for sql in statements {
        let mut stmt = conn.prepare(sql).with_context(|| format!("preparing {:?}", sql))?;
        let columns = stmt.column_count();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let fields = (0..columns)
                .map(|i| row.get_ref(i).map(format_value))
                .collect::<Result<Vec<_>, _>>()?;
            writeln!(out, "{}", fields.join("\t"))?;
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    info!("Opening store {:?}", config.store);

    let adapter = VfsAdapter::from_config(config.clone()).await?;

    match &args.command {
        Command::Ls { json } => {
            let files = adapter.list();
            if *json {
                let listing: Vec<Listing> = files
                    .into_iter()
                    .map(|(name, length)| Listing { name, length })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&listing)?);
            } else {
                for (name, length) in files {
                    println!("{:>12}  {}", length, name);
                }
            }
        }
        Command::Cat { name } => {
            let id = *adapter
                .store()
                .list_files()
                .await?
                .get(name)
                .with_context(|| format!("no file named {}", name))?;
            let content = adapter.store().read_file(id).await?;
            std::io::stdout().write_all(&content)?;
        }
        Command::Sql { db, statements } => {
            register_vfs(&config.name, Arc::new(adapter.clone()), config.make_default)?;
            let result = run_sql(&config.name, db, statements);
            unregister_vfs(&config.name)?;
            result?;
        }
    }

    adapter.shutdown().await?;
    Ok(())
}
