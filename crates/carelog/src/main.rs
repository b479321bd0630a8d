//! `carelog` - CLI for the local-first clinical record store
//!
//! This binary manages the on-device record database, the link to the
//! encrypted remote copy, and consent-gated export.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use clap::Parser;

use carelog::cli::{Cli, Command, ConfigCommand, ConsentCommand, DeleteCommand, ListCommand};
use carelog::identity::FileIdentityProvider;
use carelog::relay::UploadRelay;
use carelog::remote::DriveBlobStore;
use carelog::storage::LocalRecordStore;
use carelog::sync::SyncSession;
use carelog::{init_logging, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Load configuration
    let config = Config::load_from(cli.config.clone())?;

    // Execute the command
    match cli.command {
        Command::Status(cmd) => handle_status(&config, cmd.json),
        Command::List(cmd) => handle_list(&config, &cmd),
        Command::Delete(cmd) => handle_delete(&config, &cmd).await,
        Command::Link => handle_link(&config).await,
        Command::Unlink => handle_unlink(&config).await,
        Command::Sync => handle_sync(&config).await,
        Command::Consent(cmd) => handle_consent(&config, &cmd),
        Command::Export => handle_export(&config).await,
        Command::Config(cmd) => handle_config(&config, cmd),
    }
}

fn open_store(config: &Config) -> anyhow::Result<Arc<Mutex<LocalRecordStore>>> {
    let store = LocalRecordStore::open(config.database_path())?;
    Ok(Arc::new(Mutex::new(store)))
}

fn build_session(config: &Config, store: Arc<Mutex<LocalRecordStore>>) -> SyncSession {
    SyncSession::new(
        store,
        Box::new(FileIdentityProvider::new(config.credentials_path())),
        Box::new(DriveBlobStore::from_config(&config.remote)),
    )
}

fn lock(store: &Mutex<LocalRecordStore>) -> MutexGuard<'_, LocalRecordStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

fn handle_status(config: &Config, json: bool) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let store = lock(&store);

    let index = store.subject_index()?;
    let linked = store.sync_enabled()?;
    let last_sync = store.last_sync()?;
    let pending_export = store.needing_upload()?.len();

    if json {
        let status = serde_json::json!({
            "database_path": store.path(),
            "records": store.count()?,
            "subjects": index.len(),
            "linked": linked,
            "last_sync": last_sync,
            "pending_export": pending_export,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("carelog status");
        println!("--------------");
        println!("Database:       {}", store.path().display());
        println!("Records:        {}", store.count()?);
        println!("Subjects:       {}", index.len());
        println!("Linked:         {}", if linked { "yes" } else { "no" });
        println!(
            "Last sync:      {}",
            last_sync.as_deref().unwrap_or("never")
        );
        println!("Pending export: {pending_export}");
    }
    Ok(())
}

fn handle_list(config: &Config, cmd: &ListCommand) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let store = lock(&store);
    let index = store.subject_index()?;

    if let Some(subject) = &cmd.subject {
        let record_ids = index.records_for(subject);
        if cmd.json {
            println!("{}", serde_json::to_string_pretty(&record_ids)?);
            return Ok(());
        }
        if record_ids.is_empty() {
            println!("No records for subject {subject}");
            return Ok(());
        }
        println!("Records for subject {subject}:");
        for record_id in record_ids {
            if let Some(record) = store.get(record_id)? {
                println!("  {}  {}", record.record_id, format_millis(record.created_at));
            }
        }
    } else if cmd.json {
        let subjects: Vec<_> = index
            .subjects()
            .map(|subject| {
                serde_json::json!({
                    "subject_id": subject,
                    "records": index.records_for(subject).len(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&subjects)?);
    } else if index.is_empty() {
        println!("No records.");
    } else {
        println!("Subjects:");
        for subject in index.subjects() {
            println!("  {}  ({} records)", subject, index.records_for(subject).len());
        }
    }
    Ok(())
}

async fn handle_delete(config: &Config, cmd: &DeleteCommand) -> anyhow::Result<()> {
    let store = open_store(config)?;

    if !lock(&store).delete(&cmd.record_id)? {
        println!("No record with id {}", cmd.record_id);
        return Ok(());
    }
    println!("Deleted record {}", cmd.record_id);

    // Propagate the deletion if we can; the local tombstone stands anyway.
    if lock(&store).sync_enabled()? {
        let session = build_session(config, Arc::clone(&store));
        if let Err(e) = session.sync().await {
            println!("Warning: could not sync the deletion now: {e}");
        }
    }
    Ok(())
}

async fn handle_link(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let session = build_session(config, store);

    let user = session.link().await?;
    println!("Linked as {} <{}>", user.name, user.email);
    Ok(())
}

async fn handle_unlink(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let session = build_session(config, store);

    session.unlink().await?;
    println!("Device unlinked. Local records were kept.");
    Ok(())
}

async fn handle_sync(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let session = build_session(config, Arc::clone(&store));

    if session.sync().await? {
        let count = lock(&store).count()?;
        println!("Sync complete. {count} records.");
    } else {
        println!("This device is not linked. Run `carelog link` first.");
    }
    Ok(())
}

fn handle_consent(config: &Config, cmd: &ConsentCommand) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let store = lock(&store);

    match cmd {
        ConsentCommand::Grant => {
            let affected = store.set_consent_all(true)?;
            println!("Consent granted on {affected} records.");
            println!("Run `carelog export` to submit them.");
        }
        ConsentCommand::Revoke => {
            let affected = store.set_consent_all(false)?;
            println!("Consent revoked on {affected} records.");
        }
    }
    Ok(())
}

async fn handle_export(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let relay = UploadRelay::from_config(&config.relay)?;

    let submitted = relay.flush(&store).await?;
    if submitted == 0 {
        println!("Nothing to export.");
    } else {
        println!("Submitted {submitted} records.");
    }
    Ok(())
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Storage]");
                println!("  Database path:  {}", config.database_path().display());
                println!();
                println!("[Remote]");
                println!("  API base:       {}", config.remote.api_base_url);
                println!("  Upload base:    {}", config.remote.upload_base_url);
                println!(
                    "  Credentials:    {}",
                    config.credentials_path().display()
                );
                println!();
                println!("[Relay]");
                println!("  Enabled:        {}", config.relay.enabled);
                println!("  Endpoint:       {}", config.relay.endpoint_url);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
    }
    Ok(())
}

/// Render an epoch-milliseconds timestamp for display.
fn format_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map_or_else(|| millis.to_string(), |dt| dt.to_rfc3339())
}
