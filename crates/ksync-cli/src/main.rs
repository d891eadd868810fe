//! ksync: sync key, keyset and record encryption tool
//!
//! Commands:
//!   config show                  - display current configuration
//!   sync-key generate            - print a fresh sync key
//!   sync-key store               - save a sync key in the credential store
//!   keys generate                - create an encrypted keys record
//!   keys inspect <file>          - decrypt a keys record and summarize it
//!   record encrypt / decrypt     - seal or open a data record with a keyset

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use secrecy::{ExposeSecret, SecretString};
use std::io::Read;
use std::path::{Path, PathBuf};

use ksync_core::config::KsyncConfig;
use ksync_core::Wbo;
use ksync_crypto::{CollectionKeyManager, EncryptedRecord, Payload, SyncKeyBundle};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "ksync",
    version,
    about = "Encrypted record and collection key tool",
    long_about = "ksync: generate sync keys, manage encrypted keysets, and encrypt or decrypt records"
)]
struct Cli {
    /// Path to ksync.toml configuration file
    #[arg(long, short = 'c', env = "KSYNC_CONFIG", default_value = "ksync.toml", global = true)]
    config: PathBuf,

    /// Log level (overrides config)
    #[arg(long, env = "KSYNC_LOG", global = true)]
    log: Option<String>,

    /// Log format (overrides config)
    #[arg(long, env = "KSYNC_LOG_FORMAT", global = true)]
    log_format: Option<LogFormat>,

    /// Account username (overrides config)
    #[arg(long, short = 'u', env = "KSYNC_USERNAME", global = true)]
    username: Option<String>,

    /// Sync key; read from the credential store when absent
    #[arg(long, env = "KSYNC_SYNC_KEY", hide_env_values = true, global = true)]
    sync_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Sync key management
    #[command(name = "sync-key")]
    SyncKey {
        #[command(subcommand)]
        action: SyncKeyAction,
    },

    /// Collection keyset management
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },

    /// Data record encryption
    Record {
        #[command(subcommand)]
        action: RecordAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

#[derive(Subcommand, Debug)]
enum SyncKeyAction {
    /// Print a new random sync key
    Generate,
    /// Prompt for a sync key and save it in the credential store
    Store,
}

#[derive(Subcommand, Debug)]
enum KeysAction {
    /// Generate a keyset and write it as a keys record encrypted with the sync key
    Generate {
        /// Collection that gets its own key (repeatable; default: config keys.collections)
        #[arg(long = "collection")]
        collections: Vec<String>,
        /// Output file (default: stdout)
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
    },
    /// Decrypt a keys record and print what it contains (never the keys)
    Inspect {
        /// Keys record file
        file: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum RecordAction {
    /// Encrypt a JSON object into a record
    Encrypt {
        /// Keys record file
        #[arg(long)]
        keys: PathBuf,
        #[arg(long)]
        collection: String,
        #[arg(long)]
        id: String,
        #[arg(long)]
        sortindex: Option<i64>,
        /// Cleartext JSON object (default: stdin)
        input: Option<PathBuf>,
    },
    /// Verify and decrypt a record, printing its cleartext
    Decrypt {
        /// Keys record file
        #[arg(long)]
        keys: PathBuf,
        /// Encrypted record (default: stdin)
        input: Option<PathBuf>,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();

    // the config file picks the log settings, so it is read before logging is up
    let loaded = KsyncConfig::load_optional(&cli.config)?;
    let found = loaded.is_some();
    let config = loaded.unwrap_or_default();

    let (level, format) = log_settings(&cli, &config);
    init_logging(&level, &format);

    if !found {
        tracing::warn!("config file not found: {}  (using defaults)", cli.config.display());
    }

    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "ksync starting"
    );

    match &cli.command {
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &cli.config),
        Commands::SyncKey { action: SyncKeyAction::Generate } => cmd_sync_key_generate(),
        Commands::SyncKey { action: SyncKeyAction::Store } => cmd_sync_key_store(&cli, &config),
        Commands::Keys { action: KeysAction::Generate { collections, out } } => {
            cmd_keys_generate(&cli, &config, collections, out.as_deref())
        }
        Commands::Keys { action: KeysAction::Inspect { file } } => cmd_keys_inspect(&cli, &config, file),
        Commands::Record {
            action: RecordAction::Encrypt { keys, collection, id, sortindex, input },
        } => cmd_record_encrypt(&cli, &config, keys, collection, id, *sortindex, input.as_deref()),
        Commands::Record { action: RecordAction::Decrypt { keys, input } } => {
            cmd_record_decrypt(&cli, &config, keys, input.as_deref())
        }
    }
}

/// Log level and format: command line first, then the config file.
fn log_settings(cli: &Cli, config: &KsyncConfig) -> (String, LogFormat) {
    let level = cli.log.clone().unwrap_or_else(|| config.logging.level.clone());
    let format = cli.log_format.clone().unwrap_or(match config.logging.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    (level, format)
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries command output
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn username<'a>(cli: &'a Cli, config: &'a KsyncConfig) -> Result<&'a str> {
    let username = cli.username.as_deref().unwrap_or(&config.keys.username);
    if username.is_empty() {
        bail!("no username: set keys.username in the config or pass --username");
    }
    Ok(username)
}

/// The sync key bundle from `--sync-key`, else from the credential store.
fn sync_key_bundle(cli: &Cli, config: &KsyncConfig) -> Result<SyncKeyBundle> {
    let username = username(cli, config)?;

    if let Some(key) = &cli.sync_key {
        tracing::debug!(username, "using sync key from command line");
        return SyncKeyBundle::with_realm(&config.keys.realm, username, SecretString::from(key.clone()))
            .context("invalid sync key");
    }

    let store = ksync_secrets::open_store(&config.secrets)?;
    ksync_secrets::load_sync_key_bundle(store.as_ref(), &config.keys.realm, username)?.with_context(|| {
        format!("no sync key stored for {username}; pass --sync-key or run `ksync sync-key store`")
    })
}

fn read_input(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) if path != Path::new("-") => {
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
        }
        _ => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading stdin")?;
            Ok(buf)
        }
    }
}

fn write_output(path: Option<&Path>, content: &str) -> Result<()> {
    match path {
        Some(path) => {
            std::fs::write(path, format!("{content}\n")).with_context(|| format!("writing {}", path.display()))?;
            tracing::info!(path = %path.display(), "wrote output");
            Ok(())
        }
        None => {
            println!("{content}");
            Ok(())
        }
    }
}

fn parse_record(text: &str) -> Result<EncryptedRecord> {
    let wbo = Wbo::from_json(text.trim())?;
    Ok(EncryptedRecord::from_wbo(&wbo)?)
}

/// Decrypt the keys record in `path` into a fresh keyset.
fn load_keys(path: &Path, sync: &SyncKeyBundle) -> Result<CollectionKeyManager> {
    let mut record = parse_record(&read_input(Some(path))?)
        .with_context(|| format!("parsing keys record {}", path.display()))?;
    let mut keys = CollectionKeyManager::new();
    keys.update_contents(sync, &mut record)
        .with_context(|| format!("opening keys record {}", path.display()))?;
    Ok(keys)
}

fn parse_cleartext(text: &str) -> Result<Payload> {
    match serde_json::from_str(text).context("cleartext is not JSON")? {
        serde_json::Value::Object(payload) => Ok(payload),
        other => bail!("cleartext must be a JSON object, got: {other}"),
    }
}

// ── `ksync config show` ───────────────────────────────────────────────────────

fn cmd_config_show(config: &KsyncConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = config.to_toml().context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── `ksync sync-key` ──────────────────────────────────────────────────────────

fn cmd_sync_key_generate() -> Result<()> {
    let key = ksync_crypto::generate_sync_key();
    println!("{}", key.expose_secret());
    Ok(())
}

fn cmd_sync_key_store(cli: &Cli, config: &KsyncConfig) -> Result<()> {
    let username = username(cli, config)?;
    if config.secrets.backend == "memory" {
        tracing::warn!("secrets backend is \"memory\": the key will not outlive this process");
    }

    let key = match &cli.sync_key {
        Some(key) => SecretString::from(key.clone()),
        None => SecretString::from(
            rpassword::prompt_password(format!("Sync key for {username}: ")).context("reading sync key")?,
        ),
    };

    let store = ksync_secrets::open_store(&config.secrets)?;
    ksync_secrets::store_sync_key(store.as_ref(), &config.keys.realm, username, key)?;
    println!("Stored sync key for {username} in realm {}", config.keys.realm);
    Ok(())
}

// ── `ksync keys` ──────────────────────────────────────────────────────────────

fn cmd_keys_generate(cli: &Cli, config: &KsyncConfig, collections: &[String], out: Option<&Path>) -> Result<()> {
    let sync = sync_key_bundle(cli, config)?;
    let collections = if collections.is_empty() {
        &config.keys.collections[..]
    } else {
        collections
    };

    let mut keys = CollectionKeyManager::new();
    keys.generate_new_keys(collections);

    let mut record = keys.as_wbo(Some(&config.keys.keys_collection), Some(&config.keys.keys_id));
    record.encrypt(&sync).context("encrypting keys record")?;
    let wire = record.to_wbo()?.to_json()?;

    write_output(out, &wire)
}

fn cmd_keys_inspect(cli: &Cli, config: &KsyncConfig, file: &Path) -> Result<()> {
    let sync = sync_key_bundle(cli, config)?;
    let keys = load_keys(file, &sync)?;

    println!("last_modified: {:.2}", keys.last_modified());
    println!("default key:   {}", if keys.is_clear() { "missing" } else { "present" });
    let collections: Vec<&str> = keys.collections().collect();
    if collections.is_empty() {
        println!("collections:   (none, all use the default key)");
    } else {
        println!("collections:   {}", collections.join(", "));
    }
    Ok(())
}

// ── `ksync record` ────────────────────────────────────────────────────────────

fn cmd_record_encrypt(
    cli: &Cli,
    config: &KsyncConfig,
    keys_path: &Path,
    collection: &str,
    id: &str,
    sortindex: Option<i64>,
    input: Option<&Path>,
) -> Result<()> {
    let sync = sync_key_bundle(cli, config)?;
    let keys = load_keys(keys_path, &sync)?;
    let cleartext = parse_cleartext(&read_input(input)?)?;

    let mut record = EncryptedRecord::with_cleartext(collection, id, cleartext);
    record.sortindex = sortindex;
    record
        .encrypt(&keys)
        .with_context(|| format!("encrypting {collection}/{id}"))?;

    write_output(None, &record.to_wbo()?.to_json()?)
}

fn cmd_record_decrypt(cli: &Cli, config: &KsyncConfig, keys_path: &Path, input: Option<&Path>) -> Result<()> {
    let sync = sync_key_bundle(cli, config)?;
    let keys = load_keys(keys_path, &sync)?;

    let mut record = parse_record(&read_input(input)?).context("parsing record")?;
    let label = format!("{}/{}", record.collection(), record.id());
    let cleartext = record
        .decrypt(&keys)
        .with_context(|| format!("decrypting {label}"))?;

    write_output(None, &serde_json::to_string_pretty(cleartext)?)
}
