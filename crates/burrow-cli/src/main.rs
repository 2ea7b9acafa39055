use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use burrow_core::paths::{config_dir, default_sync_dir};
use burrow_core::record::{ClientFields, RecordBody, ServerFields, TunnelFields};
use burrow_core::store::{ConfigStore, UnlockOutcome};
use burrow_core::{RecordKind, Resolution, StoreError};

#[derive(Parser)]
#[command(name = "burrow")]
#[command(about = "Encrypted, synchronized configuration store for Burrow tunnels", long_about = None)]
struct Cli {
    /// Store root (the folder mirrored by your file synchronizer)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new store and print its recovery key
    Init,

    /// List records
    List {
        /// Restrict to one kind (server, tunnel, client, automation_credentials)
        #[arg(long)]
        kind: Option<String>,
    },

    /// Show one record as JSON
    Show { id: Uuid },

    /// Register a server
    AddServer {
        #[arg(long)]
        name: String,
        #[arg(long)]
        ip: String,
        #[arg(long, default_value = "root")]
        user: String,
    },

    /// Register a tunnel on an existing server
    AddTunnel {
        #[arg(long)]
        server: Uuid,
        #[arg(long)]
        hostname: String,
        #[arg(long)]
        remote_port: u16,
        #[arg(long)]
        local_destination: String,
        /// Syncthing device id of the client that runs the tunnel
        #[arg(long)]
        client: Option<String>,
    },

    /// Register a paired client device
    AddClient {
        #[arg(long)]
        name: String,
        #[arg(long)]
        device_id: String,
    },

    /// Store or replace the automation SSH key paths
    SetCredentials {
        #[arg(long)]
        private_key: PathBuf,
        #[arg(long)]
        public_key: PathBuf,
    },

    /// Point a tunnel at a different local destination
    SetDestination {
        id: Uuid,
        destination: String,
    },

    /// Delete a record (its history is kept)
    Remove { id: Uuid },

    /// Show a record's version timeline
    History { id: Uuid },

    /// Show a record's content as of a past instant (RFC3339)
    ShowAt {
        id: Uuid,
        #[arg(long)]
        at: String,
    },

    /// Change the master password (re-encrypts the whole store atomically)
    ChangePassword,

    /// Print the recovery key
    RecoveryKey,

    /// Regenerate the plaintext display index from the log
    RebuildIndex,

    /// Detect and resolve synchronizer conflicts (newest record wins)
    Resolve {
        /// Seconds to wait for the synchronizer to replicate the claim
        #[arg(long, default_value = "30")]
        window_secs: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let root = match cli.root {
        Some(root) => root,
        None => default_sync_dir()?,
    };
    let store = ConfigStore::open(&root, device_id()?)?;

    match cli.command {
        Commands::Init => init(&store),
        command => {
            if !store.is_configured() {
                bail!("no store at {} — run `burrow init` first", root.display());
            }
            let password = rpassword::prompt_password("Master password: ")?;
            match store.unlock(&password) {
                Ok(_) => {}
                Err(StoreError::AuthFailure) => bail!("wrong master password"),
                Err(e) => return Err(e.into()),
            }
            run(&store, command)
        }
    }
}

fn init(store: &ConfigStore) -> Result<()> {
    if store.is_configured() {
        bail!("store already exists at {}", store.root().display());
    }
    let password = prompt_password_twice("Create master password")?;
    match store.unlock(&password)? {
        UnlockOutcome::Created { recovery_key } => {
            println!("Store created at {}", store.root().display());
            println!("Recovery key (write it down, it will not be shown again):");
            println!("  {recovery_key}");
            Ok(())
        }
        UnlockOutcome::Unlocked => unreachable!("init on an unconfigured store"),
    }
}

fn run(store: &ConfigStore, command: Commands) -> Result<()> {
    match command {
        Commands::Init => unreachable!("handled before unlock"),

        Commands::List { kind } => {
            let records = match kind {
                Some(kind) => store.list_by_kind(kind.parse::<RecordKind>()?),
                None => store.records(),
            };
            for record in records {
                println!("{}  {:24}  {}", record.id, record.kind(), record.display_name());
            }
            Ok(())
        }

        Commands::Show { id } => {
            let record = store
                .get_record(id)
                .ok_or(StoreError::NotFound(id))?;
            println!("{}", record.to_canonical_json()?);
            Ok(())
        }

        Commands::AddServer { name, ip, user } => {
            let id = store.add(RecordBody::Server(ServerFields {
                name,
                ip_address: ip,
                user,
                password: None,
                extra: BTreeMap::new(),
            }))?;
            println!("{id}");
            Ok(())
        }

        Commands::AddTunnel {
            server,
            hostname,
            remote_port,
            local_destination,
            client,
        } => {
            if store.get_record(server).is_none() {
                bail!("no such server: {server}");
            }
            let id = store.add(RecordBody::Tunnel(TunnelFields {
                server_id: server,
                assigned_client_id: client,
                hostname,
                remote_port,
                local_destination,
                enabled: false,
                extra: BTreeMap::new(),
            }))?;
            println!("{id}");
            Ok(())
        }

        Commands::AddClient { name, device_id } => {
            let id = store.add(RecordBody::Client(ClientFields {
                name,
                syncthing_id: device_id,
                extra: BTreeMap::new(),
            }))?;
            println!("{id}");
            Ok(())
        }

        Commands::SetCredentials {
            private_key,
            public_key,
        } => {
            let id = store.set_automation_credentials(
                private_key.to_string_lossy(),
                public_key.to_string_lossy(),
            )?;
            println!("{id}");
            Ok(())
        }

        Commands::SetDestination { id, destination } => {
            let record = store
                .get_record(id)
                .ok_or(StoreError::NotFound(id))?;
            let RecordBody::Tunnel(mut fields) = record.body else {
                bail!("{id} is not a tunnel");
            };
            fields.local_destination = destination;
            store.update(id, RecordBody::Tunnel(fields))?;
            Ok(())
        }

        Commands::Remove { id } => {
            store.delete(id)?;
            Ok(())
        }

        Commands::History { id } => {
            for version in store.list_versions(id)? {
                println!("{}  {:?}", version.timestamp.to_rfc3339(), version.action);
            }
            Ok(())
        }

        Commands::ShowAt { id, at } => {
            let as_of: DateTime<Utc> = DateTime::parse_from_rfc3339(&at)
                .with_context(|| format!("invalid RFC3339 timestamp: {at}"))?
                .with_timezone(&Utc);
            let text = store.content_at(id, as_of)?;
            if text.is_empty() {
                bail!("{id} had no content at {at}");
            }
            println!("{text}");
            Ok(())
        }

        Commands::ChangePassword => {
            let old = rpassword::prompt_password("Current master password: ")?;
            let new = prompt_password_twice("New master password")?;
            store.change_password(&old, &new)?;
            println!("Password changed; the whole store was re-encrypted.");
            Ok(())
        }

        Commands::RecoveryKey => {
            println!("{}", store.recovery_key()?);
            Ok(())
        }

        Commands::RebuildIndex => {
            store.rebuild_index()?;
            println!("Display index rebuilt.");
            Ok(())
        }

        Commands::Resolve { window_secs } => resolve(store, window_secs),
    }
}

fn resolve(store: &ConfigStore, window_secs: u64) -> Result<()> {
    let artifacts = store.detect_conflicts()?;
    if artifacts.is_empty() {
        println!("No conflict artifacts found.");
    } else {
        println!("Found {} conflict artifact(s):", artifacts.len());
        for artifact in &artifacts {
            println!("  {}", artifact.display());
        }
    }

    println!("Claiming resolution and waiting {window_secs}s for the synchronizer...");
    let session = match store.begin_resolution(Duration::from_secs(window_secs)) {
        Ok(session) => session,
        Err(StoreError::LockContention { holder }) => {
            println!("Another device ({holder}) is resolving; try again later.");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    // Newest-wins policy: candidates are sorted oldest-first, so the last
    // one survives.
    let mut decisions = Vec::new();
    for group in session.collision_groups() {
        let winner = group
            .candidates
            .last()
            .ok_or_else(|| anyhow!("empty collision group"))?;
        let losers: Vec<Uuid> = group
            .candidates
            .iter()
            .filter(|c| c.record.id != winner.record.id)
            .map(|c| c.record.id)
            .collect();
        println!(
            "Collision on {}: keeping {} ({}), dropping {} older record(s)",
            group.key,
            winner.record.id,
            winner.record.display_name(),
            losers.len(),
        );
        decisions.push(Resolution {
            winner: winner.record.id,
            losers,
        });
    }

    let summary = session.complete(&decisions)?;
    println!(
        "Resolved: {} added, {} updated, {} removed, {} artifact(s) deleted.",
        summary.added, summary.updated, summary.removed, summary.artifacts_deleted
    );
    Ok(())
}

/// Stable per-device identity, stored outside the synchronized folder.
fn device_id() -> Result<String> {
    let dir = config_dir()?;
    fs::create_dir_all(&dir)?;
    let path = dir.join("device.id");
    if let Ok(id) = fs::read_to_string(&path) {
        let id = id.trim().to_string();
        if !id.is_empty() {
            return Ok(id);
        }
    }
    let id = Uuid::new_v4().to_string();
    fs::write(&path, &id).with_context(|| format!("write {}", path.display()))?;
    Ok(id)
}

fn prompt_password_twice(label: &str) -> Result<String> {
    let first = rpassword::prompt_password(format!("{label}: "))?;
    let second = rpassword::prompt_password("Repeat password: ")?;
    if first != second {
        bail!("passwords do not match");
    }
    if first.is_empty() {
        bail!("password must not be empty");
    }
    Ok(first)
}
