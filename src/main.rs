// src/main.rs

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use conary_core::changeset::{ChangeSetJob, ChangeSetOptions, FileContents};
use conary_core::datastore::DataStore;
use conary_core::files::sha256_hex;
use conary_core::flavor::Flavor;
use conary_core::repository::{DEFAULT_CONTENTS_DIR, DEFAULT_DB_PATH, RepositoryConfig};
use conary_core::trove::TroveIdentity;
use conary_core::version::{Version, str_to_frozen};
use serde_json::json;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "conary-core")]
#[command(author, version, about = "Conary repository core: versions, changesets and content store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct RepoArgs {
    /// Trove database path
    #[arg(short, long, default_value = DEFAULT_DB_PATH)]
    db_path: PathBuf,
    /// Content store directory
    #[arg(short, long, default_value = DEFAULT_CONTENTS_DIR)]
    contents_dir: PathBuf,
    /// Host names served by this repository (repeatable)
    #[arg(short, long = "server-name")]
    server_names: Vec<String>,
}

impl RepoArgs {
    fn config(&self) -> RepositoryConfig {
        RepositoryConfig {
            db_path: self.db_path.clone(),
            contents_dir: self.contents_dir.clone(),
            server_names: self.server_names.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and convert version strings
    #[command(subcommand)]
    Version(VersionCommands),
    /// Work with a content store directory
    #[command(subcommand)]
    Store(StoreCommands),
    /// Initialize the trove database
    Init {
        /// Database path
        #[arg(short, long, default_value = DEFAULT_DB_PATH)]
        db_path: String,
    },
    /// List stored troves
    List {
        /// Only troves with this name
        name: Option<String>,
        #[command(flatten)]
        repo: RepoArgs,
    },
    /// Compute a changeset and print a summary
    Changeset {
        /// Trove name
        name: String,
        /// Version to change to
        version: String,
        /// Version to change from (absent: fresh install)
        #[arg(long)]
        from: Option<String>,
        /// Flavor of both versions
        #[arg(long, default_value = "")]
        flavor: String,
        /// Build an absolute changeset
        #[arg(long)]
        absolute: bool,
        /// Do not follow contained troves
        #[arg(long)]
        no_recurse: bool,
        /// Leave out file contents
        #[arg(long)]
        no_contents: bool,
        #[command(flatten)]
        repo: RepoArgs,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell type
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum VersionCommands {
    /// Parse a version string and describe it
    Parse {
        text: String,
    },
    /// Show the display form of a frozen version
    Thaw {
        frozen: String,
    },
    /// Splice timestamps into a version string
    Freeze {
        text: String,
        /// One timestamp per revision
        #[arg(short, long, num_args = 1..)]
        timestamps: Vec<String>,
    },
    /// Order two versions and score their closeness
    Compare {
        a: String,
        b: String,
    },
}

#[derive(Subcommand)]
enum StoreCommands {
    /// Add a file, keyed by its sha256
    Add {
        file: PathBuf,
        #[arg(short, long, default_value = DEFAULT_CONTENTS_DIR)]
        contents_dir: PathBuf,
    },
    /// Write stored contents to stdout
    Cat {
        hash: String,
        #[arg(short, long, default_value = DEFAULT_CONTENTS_DIR)]
        contents_dir: PathBuf,
    },
    /// Show where a hash is stored
    Path {
        hash: String,
        #[arg(short, long, default_value = DEFAULT_CONTENTS_DIR)]
        contents_dir: PathBuf,
    },
    /// Remove stored contents
    Remove {
        hash: String,
        #[arg(short, long, default_value = DEFAULT_CONTENTS_DIR)]
        contents_dir: PathBuf,
    },
}

fn describe(version: &Version) -> serde_json::Value {
    json!({
        "display": version.as_string(),
        "frozen": version.freeze(),
        "branch": version.branch().as_string(),
        "host": version.host(),
        "is_branch": version.is_branch(),
        "shadow_length": version.shadow_length(),
        "is_shadow": version.is_shadow(),
        "is_modified_shadow": version.is_modified_shadow(),
        "parent_version": version.parent_version().ok().map(|v| v.as_string()),
        "canonical_version": version.canonical_version().as_string(),
        "on_local_host": version.is_on_local_host(),
    })
}

fn run_version(command: VersionCommands) -> Result<()> {
    match command {
        VersionCommands::Parse { text } => {
            let version = Version::parse(&text)?;
            println!("{}", serde_json::to_string_pretty(&describe(&version))?);
        }
        VersionCommands::Thaw { frozen } => {
            let version = Version::thaw(&frozen)?;
            println!("{}", version);
        }
        VersionCommands::Freeze { text, timestamps } => {
            let stamps: Vec<&str> = timestamps.iter().map(String::as_str).collect();
            println!("{}", str_to_frozen(&text, &stamps)?);
        }
        VersionCommands::Compare { a, b } => {
            let a = Version::parse(&a)?;
            let b = Version::parse(&b)?;
            println!("{:?}", a.cmp(&b));
            println!("closeness: {}", a.closeness(&b));
        }
    }
    Ok(())
}

fn run_store(command: StoreCommands) -> Result<()> {
    match command {
        StoreCommands::Add { file, contents_dir } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let hash = sha256_hex(&bytes);
            let store = DataStore::new(&contents_dir)?;
            if store.has_file(&hash)? {
                println!("{} (already stored)", hash);
            } else {
                store.add_file(&hash, &mut &bytes[..])?;
                println!("{}", hash);
            }
        }
        StoreCommands::Cat { hash, contents_dir } => {
            let contents = DataStore::new(&contents_dir)?.read(&hash)?;
            io::stdout().write_all(&contents)?;
        }
        StoreCommands::Path { hash, contents_dir } => {
            let (_, path) = DataStore::new(&contents_dir)?.hash_to_path(&hash)?;
            println!("{}", path.display());
        }
        StoreCommands::Remove { hash, contents_dir } => {
            DataStore::new(&contents_dir)?.remove(&hash)?;
            println!("Removed {}", hash);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version(command)) => run_version(command),
        Some(Commands::Store(command)) => run_store(command),
        Some(Commands::Init { db_path }) => {
            info!("Initializing trove database at: {}", db_path);
            conary_core::db::init(&db_path)?;
            println!("Database initialized successfully at: {}", db_path);
            Ok(())
        }
        Some(Commands::List { name, repo }) => {
            let repository = repo.config().open()?;
            let troves = repository.troves().list_troves(name.as_deref())?;
            if troves.is_empty() {
                println!("No troves found.");
            }
            for trove in &troves {
                println!("{}", trove);
            }
            Ok(())
        }
        Some(Commands::Changeset {
            name,
            version,
            from,
            flavor,
            absolute,
            no_recurse,
            no_contents,
            repo,
        }) => {
            let repository = repo.config().open()?;
            let flavor = Flavor::new(flavor);
            let resolve = |text: &str| -> Result<TroveIdentity> {
                repository
                    .troves()
                    .find_trove(&name, text, &flavor)?
                    .ok_or_else(|| anyhow!("Trove not found: {}={}[{}]", name, text, flavor))
            };

            let new = resolve(&version)?;
            let job = match from {
                Some(old) => ChangeSetJob::update(
                    &name,
                    (resolve(&old)?.version, flavor.clone()),
                    (new.version, flavor.clone()),
                ),
                None => ChangeSetJob::install(&name, new.version, flavor.clone(), absolute),
            };

            let options = ChangeSetOptions {
                recurse: !no_recurse,
                with_file_contents: !no_contents,
                ..ChangeSetOptions::default()
            };
            let result = repository.create_change_set(&[job], options)?;
            let cs = &result.change_set;

            let contents: Vec<_> = cs
                .contents()
                .iter()
                .map(|entry| {
                    let kind = match &entry.contents {
                        FileContents::Full(_) => "full",
                        FileContents::Diff(_) => "diff",
                        FileContents::Pointer { .. } => "ptr",
                        FileContents::Absent => "absent",
                    };
                    json!({
                        "path_id": entry.path_id.to_hex(),
                        "file_id": entry.file_id.to_hex(),
                        "type": kind,
                        "config": entry.is_config,
                        "compressed": entry.compressed,
                    })
                })
                .collect();

            let summary = json!({
                "troves": cs.troves().iter().map(|t| t.new_identity().to_string()).collect::<Vec<_>>(),
                "removed": cs.removed_troves().iter().map(ToString::to_string).collect::<Vec<_>>(),
                "files": cs.file_changes().len(),
                "contents": contents,
                "external_troves": result.external_troves.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "external_files": result.external_files.len(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Some(Commands::Completions { shell }) => {
            clap_complete::generate(shell, &mut Cli::command(), "conary-core", &mut io::stdout());
            Ok(())
        }
        None => {
            println!("Conary repository core v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'conary-core --help' for usage information");
            Ok(())
        }
    }
}
