#![forbid(unsafe_code)]

use clap::{Parser, Subcommand};
use logtrie::{Config, ConfigFile, Doc, Store};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "logtrie", version, about = "Embedded log-structured document store", long_about = None)]
struct Cli {
    /// Path to a TOML config file. If omitted, `logtrie.toml` in the
    /// current directory is used when present.
    #[arg(long, help = "Path to a config file (TOML)")]
    config: Option<PathBuf>,
    /// Trie chunk width in bytes; overrides the config file.
    #[arg(long, help = "Trie chunk width in bytes")]
    chunk_size: Option<usize>,
    /// Buffer cache size in bytes; overrides the config file.
    #[arg(long, help = "Buffer cache size in bytes")]
    buffercache_size: Option<usize>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(name = "set", about = "Write a document; omit --body to delete the key")]
    Set {
        #[arg(help = "Store file path")]
        path: PathBuf,
        #[arg(help = "Key")]
        key: String,
        #[arg(long, help = "Metadata bytes, given as a UTF-8 string")]
        meta: Option<String>,
        #[arg(long, help = "Body bytes, given as a UTF-8 string. Omit to delete the key.")]
        body: Option<String>,
        #[arg(long, help = "Commit immediately after the write")]
        commit: bool,
    },
    #[command(name = "get", about = "Read a document's meta and body")]
    Get {
        #[arg(help = "Store file path")]
        path: PathBuf,
        #[arg(help = "Key")]
        key: String,
    },
    #[command(name = "commit", about = "Flush the WAL and write a new superblock")]
    Commit {
        #[arg(help = "Store file path")]
        path: PathBuf,
    },
    #[command(name = "compact", about = "Reclaim garbage by copying live documents into a fresh file")]
    Compact {
        #[arg(help = "Store file path")]
        path: PathBuf,
        #[arg(help = "Destination path for the compacted file")]
        new_path: PathBuf,
    },
    #[command(name = "stats", about = "Print ndocs and datasize for the store")]
    Stats {
        #[arg(help = "Store file path")]
        path: PathBuf,
    },
}

fn load_config(cli: &Cli) -> Config {
    let mut cfg = Config::default();
    let file_path = cli.config.clone().or_else(|| {
        let cur = PathBuf::from("logtrie.toml");
        cur.exists().then_some(cur)
    });
    if let Some(p) = file_path
        && let Ok(file_cfg) = ConfigFile::load(&p)
    {
        cfg = cfg.with_file(&file_cfg);
    }
    if let Some(v) = cli.chunk_size {
        cfg.chunk_size = v;
    }
    if let Some(v) = cli.buffercache_size {
        cfg.buffercache_size = v;
    }
    cfg
}

fn run() -> logtrie::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli);

    match &cli.command {
        Commands::Set { path, key, meta, body, commit } => {
            let store = Store::open(path, config)?;
            let doc = Doc::create(key.as_bytes(), meta.as_deref().map(str::as_bytes), body.as_deref().map(str::as_bytes))?;
            store.set(&doc)?;
            if *commit {
                store.commit()?;
            }
            store.close()?;
        }
        Commands::Get { path, key } => {
            let store = Store::open(path, config)?;
            let mut doc = Doc::create(key.as_bytes(), None, None)?;
            store.get(&mut doc)?;
            println!("meta: {}", String::from_utf8_lossy(doc.meta.as_deref().unwrap_or(&[])));
            println!("body: {}", String::from_utf8_lossy(doc.body.as_deref().unwrap_or(&[])));
            store.close()?;
        }
        Commands::Commit { path } => {
            let store = Store::open(path, config)?;
            store.commit()?;
            store.close()?;
        }
        Commands::Compact { path, new_path } => {
            let mut store = Store::open(path, config)?;
            store.compact(new_path)?;
            store.close()?;
        }
        Commands::Stats { path } => {
            let store = Store::open(path, config)?;
            println!("ndocs: {}", store.ndocs());
            println!("datasize: {}", store.datasize());
            store.close()?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
