use std::{collections::BTreeSet, fs, path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    DropOutcome, DragOutcome, HttpMovieSearch, LogSession, MissingMovieSearch, MovieSearch,
    SessionOptions,
};
use shared::{
    domain::{CollaboratorId, EntryId, LogId, Visibility},
    order::OrderMap,
};
use storage::{DocumentStore, Storage};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, prepare_database_url, Settings};

#[derive(Parser, Debug)]
#[command(name = "watchlog", about = "Inspect and reorder shared watch logs")]
struct Cli {
    /// Overrides the configured database url.
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every log with its entry count.
    Logs,
    /// Print a log in display order.
    Show {
        log_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Replace a log's order with the entry ids of a JSON array.
    Import {
        log_id: String,
        file: PathBuf,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "private")]
        visibility: String,
    },
    /// Append an entry to the end of a log.
    Add { log_id: String, entry_id: String },
    Remove { log_id: String, entry_id: String },
    /// Drag an entry onto the slot of another and drop it there.
    Move {
        log_id: String,
        entry_id: String,
        #[arg(long)]
        over: String,
    },
    /// Look up movies by title.
    Search { query: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = load_settings();

    if let Command::Search { query } = &cli.command {
        return search(&settings, query).await;
    }

    let raw_database_url = cli
        .database_url
        .as_deref()
        .unwrap_or(&settings.database_url);
    let database_url = prepare_database_url(raw_database_url)?;
    let storage = Arc::new(Storage::new(&database_url).await.map_err(|error| {
        error!(%database_url, %error, "failed to open database");
        error
    })?);
    info!(%database_url, "database ready");

    match cli.command {
        Command::Logs => {
            for log in storage.list_logs().await? {
                println!(
                    "{}\t{}\t{}\tentries={}\tseq={}\tupdated={}",
                    log.log_id,
                    log.name,
                    log.visibility.as_str(),
                    log.entry_count,
                    log.seq,
                    log.updated_at.to_rfc3339()
                );
            }
        }
        Command::Show { log_id, json } => {
            let order = storage.get(&LogId::from(log_id)).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&order.sorted_ids())?);
            } else {
                for entry in order.entries() {
                    println!("{}\t{}", entry.rank, entry.id);
                }
            }
        }
        Command::Import {
            log_id,
            file,
            name,
            visibility,
        } => {
            let log_id = LogId::from(log_id);
            let raw = fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let ids: Vec<String> = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a JSON array of entry ids", file.display()))?;
            let visibility = Visibility::parse(&visibility)
                .ok_or_else(|| anyhow!("unknown visibility '{visibility}'"))?;

            let order = imported_order(ids)?;
            let seq = storage.set(&log_id, &order).await?;
            if let Some(name) = name {
                storage.describe_log(&log_id, &name, visibility).await?;
            }
            println!("imported {} entries into {log_id} seq={seq}", order.len());
        }
        Command::Add { log_id, entry_id } => {
            let session = open_session(&storage, &settings, log_id).await?;
            let seq = session.add_entry(EntryId::from(entry_id)).await?;
            println!("added seq={seq}");
        }
        Command::Remove { log_id, entry_id } => {
            let session = open_session(&storage, &settings, log_id).await?;
            let seq = session.remove_entry(&EntryId::from(entry_id)).await?;
            println!("removed seq={seq}");
        }
        Command::Move {
            log_id,
            entry_id,
            over,
        } => {
            let session = open_session(&storage, &settings, log_id).await?;
            let source = EntryId::from(entry_id);
            let target = EntryId::from(over);

            session.begin_drag(&source)?;
            if session.drag_over(&source, &target) == DragOutcome::Stale {
                session.cancel_drag();
                return Err(anyhow!("entry {target} is not part of this log"));
            }
            match session.complete_drop(&source).await? {
                DropOutcome::Unchanged => println!("order unchanged"),
                DropOutcome::Committed { seq } => println!("moved seq={seq}"),
                DropOutcome::Queued => println!("move queued"),
            }
            for (rank, id) in session.order().iter().enumerate() {
                println!("{rank}\t{id}");
            }
        }
        Command::Search { .. } => {}
    }

    Ok(())
}

/// Ranks imported ids by their position in the file.
fn imported_order(ids: Vec<String>) -> Result<OrderMap> {
    let mut seen = BTreeSet::new();
    for id in &ids {
        if !seen.insert(id.as_str()) {
            return Err(anyhow!("entry {id} appears more than once in the import"));
        }
    }
    Ok(OrderMap::from_ranks(
        ids.into_iter()
            .enumerate()
            .map(|(rank, id)| (id, rank as i64)),
        0,
    ))
}

async fn open_session(
    storage: &Arc<Storage>,
    settings: &Settings,
    log_id: String,
) -> Result<LogSession> {
    let store: Arc<dyn DocumentStore> = storage.clone();
    let author = settings
        .collaborator_id
        .clone()
        .map(CollaboratorId::from)
        .unwrap_or_else(CollaboratorId::generate);
    let options = SessionOptions {
        retry_delay: settings.write_retry_delay(),
        author: Some(author),
        ..SessionOptions::default()
    };
    Ok(LogSession::open(LogId::from(log_id), store, options).await?)
}

async fn search(settings: &Settings, query: &str) -> Result<()> {
    let search: Box<dyn MovieSearch> = match &settings.movie_api_key {
        Some(key) => Box::new(HttpMovieSearch::new(&settings.movie_api_url, key.clone())?),
        None => Box::new(MissingMovieSearch),
    };
    for movie in search.search(query).await? {
        println!(
            "{}\t{}\t{}",
            movie.id,
            movie.title,
            movie.release_date.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
