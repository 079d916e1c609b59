//! Arbor CLI - Admin Command Line Interface
//!
//! Inspects and maintains a tree store in a local directory.

use anyhow::{Context, Result, anyhow, bail};
use arbor_common::StoreConfig;
use arbor_storage::{
    AttrStatus, AttrValue, Attribute, EvictionPolicy, Name, NodeRecord, TreePath, TreeStore,
};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "arbor-cli")]
#[command(about = "Arbor tree store admin CLI")]
#[command(version)]
struct Args {
    /// Store directory (overrides the config file)
    #[arg(short, long, env = "ARBOR_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the record at a path
    Get {
        /// Node path, e.g. /a/b
        path: String,
    },
    /// List the children of a directory
    Ls {
        /// Directory path
        #[arg(default_value = "/")]
        path: String,
    },
    /// Create or replace a directory and link it into its parent
    PutDir {
        /// Directory path
        path: String,
        /// Child names to record
        #[arg(long = "child")]
        children: Vec<String>,
    },
    /// Create or replace a file and link it into its parent
    PutFile {
        /// File path
        path: String,
        /// File length in bytes (e.g. 10M)
        #[arg(short, long, default_value = "0")]
        length: String,
        /// Attribute as NAME=VALUE
        #[arg(long = "attr")]
        attributes: Vec<String>,
    },
    /// Remove a node with its subtree and unlink it from its parent
    Rm {
        /// Node path
        path: String,
    },
    /// Mark a node as refreshed without rewriting its record
    Touch {
        /// Node path
        path: String,
    },
    /// Freeze the active overlay segment and start a new one
    Roll,
    /// Fold frozen overlay segments into a new base index
    Compact,
    /// Page out base index subtrees
    Evict {
        /// Bytes to free (e.g. 64M)
        #[arg(short, long)]
        bytes: String,
        /// Random descent instead of depth-first
        #[arg(long)]
        random: bool,
    },
    /// Show store statistics
    Stats,
    /// Record a local directory tree
    Import {
        /// Directory to walk
        source: PathBuf,
        /// Where to place it in the tree
        #[arg(long, default_value = "/")]
        at: String,
    },
}

/// Parse a human-readable size string (e.g. "10G", "1T", "500M") into bytes.
fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let (num, multiplier) = if let Some(n) = s.strip_suffix('T') {
        (n, 1024 * 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('G') {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('K') {
        (n, 1024)
    } else {
        // Assume bytes if no suffix
        (s, 1)
    };
    let value: u64 = num.parse().map_err(|_| anyhow!("Invalid size: '{s}'"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow!("Size too large: '{s}'"))
}

/// Format bytes as a human-readable size string.
fn format_size(bytes: u64) -> String {
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;
    const KIB: u64 = 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

fn to_millis(time: std::io::Result<SystemTime>) -> i64 {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// Parse `NAME=VALUE`; integers and booleans keep their type
fn parse_attribute(text: &str) -> Result<(String, Attribute)> {
    let (name, raw) = text
        .split_once('=')
        .ok_or_else(|| anyhow!("Invalid attribute '{text}', expected NAME=VALUE"))?;
    let value = if let Ok(v) = raw.parse::<i64>() {
        AttrValue::Int(v)
    } else if let Ok(v) = raw.parse::<bool>() {
        AttrValue::Bool(v)
    } else {
        AttrValue::Text(raw.to_string())
    };
    Ok((
        name.to_string(),
        Attribute::new(value, now_millis(), AttrStatus::Ok),
    ))
}

fn record_json(path: &TreePath, record: &NodeRecord) -> serde_json::Value {
    let attributes: serde_json::Map<String, serde_json::Value> = record
        .attributes
        .iter()
        .map(|(name, attr)| {
            let value = match &attr.value {
                AttrValue::Null => serde_json::Value::Null,
                AttrValue::Bool(v) => json!(v),
                AttrValue::Int(v) => json!(v),
                AttrValue::Float(v) => json!(v),
                AttrValue::Text(v) => json!(v),
                AttrValue::Bytes(v) => json!(v),
            };
            (
                name.clone(),
                json!({
                    "value": value,
                    "evaluated_at": attr.evaluated_at,
                    "status": format!("{:?}", attr.status),
                }),
            )
        })
        .collect();

    json!({
        "path": path.to_string(),
        "kind": record.kind.as_str(),
        "flags": record.flags,
        "children": record.children.iter().map(Name::as_str).collect::<Vec<_>>(),
        "attributes": attributes,
        "created_at": record.external_created_at,
        "modified_at": record.external_modified_at,
        "length": record.external_length,
        "update_time": record.update_time,
        "update_sequence": record.update_sequence,
    })
}

/// Add `path`'s name to its parent's child list
fn link_into_parent(store: &TreeStore, path: &TreePath) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    let mut record = store
        .get(&parent)?
        .ok_or_else(|| anyhow!("Parent {parent} does not exist"))?;
    if record.add_child(path.leaf_name()) {
        store.put(&parent, &record)?;
    }
    Ok(())
}

/// Drop `path`'s name from its parent's child list
fn unlink_from_parent(store: &TreeStore, path: &TreePath) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if let Some(mut record) = store.get(&parent)? {
        if record.remove_child(path.leaf_name().as_str()) {
            store.put(&parent, &record)?;
        }
    }
    Ok(())
}

/// Record `source` under `at`, children before parents; returns nodes written
fn import_tree(store: &TreeStore, source: &Path, at: &TreePath) -> Result<u64> {
    let mut entries: Vec<_> = std::fs::read_dir(source)
        .with_context(|| format!("Failed to read {}", source.display()))?
        .collect::<std::io::Result<_>>()?;
    entries.sort_by_key(std::fs::DirEntry::file_name);

    let mut written = 0;
    let mut children = Vec::with_capacity(entries.len());
    for entry in entries {
        let file_name = entry.file_name();
        let Some(text) = file_name.to_str() else {
            warn!("Skipping non UTF-8 name {:?}", file_name);
            continue;
        };
        let name = match Name::new(text) {
            Ok(name) => name,
            Err(e) => {
                warn!("Skipping {}: {}", text, e);
                continue;
            }
        };
        let path = at.child(name.clone());
        let metadata = entry.metadata()?;

        if metadata.is_dir() {
            written += import_tree(store, &entry.path(), &path)?;
        } else {
            let mut record = NodeRecord::file(name.clone(), metadata.len());
            record.external_created_at = to_millis(metadata.created());
            record.external_modified_at = to_millis(metadata.modified());
            store.put(&path, &record)?;
            written += 1;
        }
        children.push(name);
    }

    let metadata = std::fs::metadata(source)?;
    let mut record = NodeRecord::directory(at.leaf_name(), children);
    record.external_created_at = to_millis(metadata.created());
    record.external_modified_at = to_millis(metadata.modified());
    store.put(at, &record)?;
    debug!("Imported {} ({} children)", at, record.children.len());
    Ok(written + 1)
}

fn open_store(config: StoreConfig) -> Result<TreeStore> {
    TreeStore::open_local(config).map_err(|e| {
        if e.is_corruption() {
            anyhow::Error::new(e).context("Store files are damaged")
        } else {
            e.into()
        }
    })
}

fn load_config(args: &Args) -> Result<StoreConfig> {
    let mut config = match &args.config {
        Some(path) => StoreConfig::load(path)?,
        None => StoreConfig::default(),
    };
    if let Some(data_dir) = &args.data_dir {
        config.data_dir.clone_from(data_dir);
    }
    // Maintenance runs only when asked for
    config.compaction.background = false;
    Ok(config)
}

fn run(store: &TreeStore, command: Commands) -> Result<()> {
    match command {
        Commands::Get { path } => {
            let path = store.parse_path(&path)?;
            match store.get(&path)? {
                Some(record) => {
                    println!("{}", serde_json::to_string_pretty(&record_json(&path, &record))?);
                }
                None => bail!("{path} does not exist"),
            }
        }
        Commands::Ls { path } => {
            let path = store.parse_path(&path)?;
            let children = store.list_children(&path)?;
            println!("{:<10} {:>12} {:>10} NAME", "KIND", "LENGTH", "SEQUENCE");
            println!("{}", "-".repeat(60));
            for child in children {
                println!(
                    "{:<10} {:>12} {:>10} {}",
                    child.kind.as_str(),
                    format_size(child.external_length),
                    child.update_sequence,
                    child.name
                );
            }
        }
        Commands::PutDir { path, children } => {
            let path = store.parse_path(&path)?;
            let names = children
                .iter()
                .map(|c| Name::new(c))
                .collect::<arbor_common::Result<Vec<_>>>()?;
            let record = NodeRecord::directory(path.leaf_name(), names);
            link_into_parent(store, &path)?;
            let sequence = store.put(&path, &record)?;
            println!("Directory {path} written (sequence {sequence})");
        }
        Commands::PutFile {
            path,
            length,
            attributes,
        } => {
            let path = store.parse_path(&path)?;
            let mut record = NodeRecord::file(path.leaf_name(), parse_size(&length)?);
            let now = i64::try_from(now_millis()).unwrap_or(i64::MAX);
            record.external_created_at = now;
            record.external_modified_at = now;
            for text in &attributes {
                let (name, attribute) = parse_attribute(text)?;
                record.set_attribute(name, attribute);
            }
            link_into_parent(store, &path)?;
            let sequence = store.put(&path, &record)?;
            println!("File {path} written (sequence {sequence})");
        }
        Commands::Rm { path } => {
            let path = store.parse_path(&path)?;
            if store.get(&path)?.is_none() {
                bail!("{path} does not exist");
            }
            store.remove(&path)?;
            unlink_from_parent(store, &path)?;
            println!("Removed {path}");
        }
        Commands::Touch { path } => {
            let path = store.parse_path(&path)?;
            let mut record = store
                .get(&path)?
                .ok_or_else(|| anyhow!("{path} does not exist"))?;
            record.transient.last_refresh_time = now_millis();
            let sequence = store.put_fields_only(&path, &record)?;
            println!("Touched {path} (sequence {sequence})");
        }
        Commands::Roll => {
            let segment = store.roll()?;
            println!("Active overlay segment: {segment}");
        }
        Commands::Compact => {
            let summary = store.compact()?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Evict { bytes, random } => {
            let target = parse_size(&bytes)?;
            let policy = if random {
                EvictionPolicy::Random
            } else {
                EvictionPolicy::ByLevel
            };
            let freed = store.evict(target, policy);
            println!("Evicted ~{}", format_size(freed));
        }
        Commands::Stats => {
            println!("{}", serde_json::to_string_pretty(&store.stats())?);
        }
        Commands::Import { source, at } => {
            let at = store.parse_path(&at)?;
            if !source.is_dir() {
                bail!("{} is not a directory", source.display());
            }
            link_into_parent(store, &at)?;
            let nodes = import_tree(store, &source, &at)?;
            println!("Imported {nodes} nodes from {}", source.display());
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = load_config(&args)?;
    if let Commands::PutFile { attributes, .. } = &args.command {
        for text in attributes {
            let (name, _) = parse_attribute(text)?;
            if !config.attributes.contains(&name) {
                config.attributes.push(name);
            }
        }
    }
    info!("Opening store in {}", config.data_dir.display());

    let store = open_store(config)?;
    run(&store, args.command)?;
    store.sync()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &Path) -> TreeStore {
        let mut config = StoreConfig::with_data_dir(dir);
        config.overlay.sync_on_write = false;
        TreeStore::open_local(config).unwrap()
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("10M").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert!(parse_size("lots").is_err());
        assert_eq!(parse_size("16383T").unwrap(), 16_383u64 << 40);
        assert!(parse_size("99999999T").is_err());
        assert!(parse_size("18446744073709551615K").is_err());
    }

    #[test]
    fn test_parse_attribute() {
        let (name, attr) = parse_attribute("owner=42").unwrap();
        assert_eq!(name, "owner");
        assert_eq!(attr.value, AttrValue::Int(42));
        let (_, attr) = parse_attribute("md5=abc=").unwrap();
        assert_eq!(attr.value, AttrValue::Text("abc=".into()));
        assert!(parse_attribute("novalue").is_err());
    }

    #[test]
    fn test_put_and_rm_maintain_parent() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        run(&store, Commands::PutDir { path: "/".into(), children: vec![] }).unwrap();
        run(&store, Commands::PutDir { path: "/docs".into(), children: vec![] }).unwrap();
        run(
            &store,
            Commands::PutFile {
                path: "/docs/a.txt".into(),
                length: "1K".into(),
                attributes: vec![],
            },
        )
        .unwrap();

        let docs = store.get(&TreePath::parse("/docs").unwrap()).unwrap().unwrap();
        assert_eq!(docs.children, vec![Name::new("a.txt").unwrap()]);

        run(&store, Commands::Rm { path: "/docs/a.txt".into() }).unwrap();
        let docs = store.get(&TreePath::parse("/docs").unwrap()).unwrap().unwrap();
        assert!(docs.children.is_empty());
        assert!(run(&store, Commands::Rm { path: "/docs/a.txt".into() }).is_err());
    }

    #[test]
    fn test_reimport_over_removed_directory() {
        let source = tempdir().unwrap();
        std::fs::create_dir(source.path().join("sub")).unwrap();
        std::fs::write(source.path().join("sub/one.bin"), vec![0u8; 10]).unwrap();

        let data = tempdir().unwrap();
        let store = open(data.path());
        let import = || Commands::Import {
            source: source.path().to_path_buf(),
            at: "/x".into(),
        };
        run(&store, Commands::PutDir { path: "/".into(), children: vec![] }).unwrap();
        run(&store, import()).unwrap();
        run(&store, Commands::Rm { path: "/x".into() }).unwrap();
        assert!(store.get(&TreePath::parse("/x").unwrap()).unwrap().is_none());

        // Children land before their parents are put back
        run(&store, import()).unwrap();
        let one = TreePath::parse("/x/sub/one.bin").unwrap();
        assert_eq!(store.get(&one).unwrap().unwrap().external_length, 10);
        let root = store.get(&TreePath::root()).unwrap().unwrap();
        assert_eq!(root.children, vec![Name::new("x").unwrap()]);

        store.compact().unwrap();
        assert_eq!(store.get(&one).unwrap().unwrap().external_length, 10);
    }

    #[test]
    fn test_damaged_segment_is_reported() {
        let data = tempdir().unwrap();
        let segment = {
            let store = open(data.path());
            run(&store, Commands::PutDir { path: "/".into(), children: vec![] }).unwrap();
            store.stats().segments[0].clone()
        };
        std::fs::write(data.path().join(&segment), b"NOT-AN-OVERLAY-FILE").unwrap();

        let mut config = StoreConfig::with_data_dir(data.path());
        config.overlay.sync_on_write = false;
        let err = open_store(config).err().unwrap();
        assert_eq!(err.to_string(), "Store files are damaged");
    }

    #[test]
    fn test_import_directory() {
        let source = tempdir().unwrap();
        std::fs::create_dir(source.path().join("sub")).unwrap();
        std::fs::write(source.path().join("sub/one.bin"), vec![0u8; 100]).unwrap();
        std::fs::write(source.path().join("two.txt"), b"hello").unwrap();

        let data = tempdir().unwrap();
        let store = open(data.path());
        let nodes = import_tree(&store, source.path(), &TreePath::root()).unwrap();
        assert_eq!(nodes, 4);

        let root = store.get(&TreePath::root()).unwrap().unwrap();
        let names: Vec<&str> = root.children.iter().map(Name::as_str).collect();
        assert_eq!(names, vec!["sub", "two.txt"]);
        let one = store
            .get(&TreePath::parse("/sub/one.bin").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(one.external_length, 100);

        store.compact().unwrap();
        let listed = store.list_children(&TreePath::parse("/sub").unwrap()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].external_length, 100);
    }
}
