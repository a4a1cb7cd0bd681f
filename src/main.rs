//! revstore - revision-tracking document store
//!
//! Command-line entry point. Every command prints its result as JSON on
//! stdout; failures print `<status> <reason>` on stderr.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use revstore::db::{Database, DatabaseConfig, DatabaseResult};
use revstore::metadata::{AllDocsOptions, WriteOptions};
use revstore::revision::{Document, GetOptions};

/// Revision-tracking document store over a git repository
#[derive(Debug, Parser)]
#[command(name = "revstore", version, about)]
struct Cli {
    /// Path to the database directory
    #[arg(short, long, global = true, default_value = ".revstore")]
    database: PathBuf,

    /// Use a throwaway in-memory store instead of git
    #[arg(long, global = true)]
    memory: bool,

    /// Revision engine to go through
    #[arg(short, long, global = true, value_enum, default_value_t = Engine::Tree)]
    engine: Engine,

    /// Keep content of superseded revisions (tree engine)
    #[arg(long, global = true)]
    keep_history: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Engine {
    Tree,
    Metadata,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write a revision of document <ID>
    Put {
        id: String,
        /// Document body as a JSON object
        json: String,
        /// Previous revision
        #[arg(long)]
        rev: Option<String>,
    },

    /// Write a document under a generated id
    Post {
        /// Document body as a JSON object
        json: String,
    },

    /// Read a document
    Get {
        id: String,
        #[arg(long)]
        rev: Option<String>,
        /// Include the revision history
        #[arg(long)]
        revs: bool,
        /// Include the status of known revisions
        #[arg(long)]
        revs_info: bool,
        /// Include conflicting revisions
        #[arg(long)]
        conflicts: bool,
    },

    /// Delete a document revision
    Remove {
        id: String,
        /// Revision to delete; `last` picks the winner (metadata engine)
        #[arg(long)]
        rev: String,
    },

    /// List documents (metadata engine)
    AllDocs {
        #[arg(long)]
        include_docs: bool,
        #[arg(long)]
        conflicts: bool,
    },

    /// Remove blobs of <ID> no revision accounts for
    Prune { id: String },

    /// Show store statistics
    Stats,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = if cli.memory {
        DatabaseConfig::memory()
    } else {
        DatabaseConfig::new(&cli.database)
    };
    let config = config
        .create_if_missing(true)
        .keep_revision_history(cli.keep_history);

    let result = match Database::open_with_config(config) {
        Ok(db) => execute(&db, cli.engine, cli.command).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(output) => {
            println!("{}", output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{} {}", e.status(), e.reason());
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "revstore=debug" } else { "revstore=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_document(json: &str) -> DatabaseResult<Document> {
    let value: Value = serde_json::from_str(json)?;
    Ok(Document::from_value(value)?)
}

async fn execute(db: &Database, engine: Engine, command: Command) -> DatabaseResult<String> {
    let output = match command {
        Command::Put { id, json, rev } => {
            let mut doc = parse_document(&json)?.with_id(id);
            if rev.is_some() {
                doc.rev = rev;
            }
            match engine {
                Engine::Tree => serde_json::to_value(db.tree().put(doc).await?)?,
                Engine::Metadata => {
                    serde_json::to_value(db.metadata().put(doc, &WriteOptions::new()).await?)?
                }
            }
        }

        Command::Post { json } => {
            let doc = parse_document(&json)?;
            match engine {
                Engine::Tree => serde_json::to_value(db.tree().post(doc).await?)?,
                Engine::Metadata => {
                    serde_json::to_value(db.metadata().post(doc, &WriteOptions::new()).await?)?
                }
            }
        }

        Command::Get {
            id,
            rev,
            revs,
            revs_info,
            conflicts,
        } => {
            let mut options = GetOptions::new()
                .revs(revs)
                .revs_info(revs_info)
                .conflicts(conflicts);
            options.rev = rev;
            match engine {
                Engine::Tree => serde_json::to_value(db.tree().get(&id, &options).await?)?,
                Engine::Metadata => serde_json::to_value(db.metadata().get(&id, &options).await?)?,
            }
        }

        Command::Remove { id, rev } => match engine {
            Engine::Tree => {
                let doc = Document::default().with_id(id).with_rev(rev);
                serde_json::to_value(db.tree().remove(doc).await?)?
            }
            Engine::Metadata => serde_json::to_value(
                db.metadata()
                    .remove(&id, Some(rev.as_str()), &WriteOptions::new())
                    .await?,
            )?,
        },

        Command::AllDocs {
            include_docs,
            conflicts,
        } => match engine {
            Engine::Tree => serde_json::to_value(db.tree().all_docs().await?)?,
            Engine::Metadata => {
                let options = AllDocsOptions::new()
                    .include_docs(include_docs)
                    .conflicts(conflicts);
                serde_json::to_value(db.metadata().all_docs(&options).await?)?
            }
        },

        Command::Prune { id } => {
            let removed = match engine {
                Engine::Tree => db.tree().prune(&id).await?,
                Engine::Metadata => db.metadata().prune(&id).await?,
            };
            serde_json::json!({ "ok": true, "removed": removed })
        }

        Command::Stats => {
            let stats = db.stats().await?;
            serde_json::json!({ "entries": stats.entries, "commits": stats.commits })
        }
    };

    Ok(serde_json::to_string_pretty(&output)?)
}
