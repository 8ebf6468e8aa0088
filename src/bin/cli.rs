// CLI binary: panicking on unrecoverable errors is standard for CLI tools.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::unreachable, clippy::indexing_slicing)]

use std::io::Write as _;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use snippet_repl::engine::references::{describe_references, ReferenceSupplier, StandardReferences};
use snippet_repl::engine::ReplEngine;
use snippet_repl::script::parser::LanguageVersion;
use snippet_repl::settings::{self, EngineSettings};
use snippet_repl::transcript::{EntryKind, TranscriptEntry, TranscriptSink};

const APP_ID: &str = "snippet-repl";

// ── CLI argument parsing ─────────────────────────────────────────

#[derive(Parser)]
#[command(name = "snippet-repl", about = "Incremental script REPL", version)]
struct Cli {
    /// Settings file (default: <config dir>/snippet-repl/settings.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Submit this snippet instead of reading stdin (repeatable)
    #[arg(short, long = "eval")]
    eval: Vec<String>,

    /// One JSON line per transcript entry
    #[arg(long)]
    json: bool,

    /// Reject preview language features
    #[arg(long)]
    stable: bool,

    /// Maximum VM steps per submission
    #[arg(long)]
    step_limit: Option<u64>,

    /// Write the effective settings back to the settings file
    #[arg(long)]
    write_config: bool,

    /// Print the settings JSON schema and exit
    #[arg(long)]
    print_schema: bool,

    /// Print the available library and exit
    #[arg(long)]
    list_references: bool,
}

// ── Settings ─────────────────────────────────────────────────────

fn dirs_config_dir() -> PathBuf {
    let base = if cfg!(target_os = "windows") {
        std::env::var("APPDATA")
            .map_or_else(|_| PathBuf::from("C:\\Users\\Default\\AppData\\Roaming"), PathBuf::from)
    } else if cfg!(target_os = "macos") {
        dirs_home().join("Library/Application Support")
    } else {
        std::env::var("XDG_CONFIG_HOME")
            .map_or_else(|_| dirs_home().join(".config"), PathBuf::from)
    };
    base.join(APP_ID)
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map_or_else(|_| PathBuf::from("."), PathBuf::from)
}

fn effective_settings(cli: &Cli, path: &std::path::Path) -> EngineSettings {
    let mut s = settings::load_settings(path).unwrap_or_default();
    if cli.stable {
        s.language_version = LanguageVersion::Stable;
    }
    if cli.step_limit.is_some() {
        s.step_limit = cli.step_limit;
    }
    s
}

// ── Output formatting ────────────────────────────────────────────

struct StdoutSink {
    json: bool,
    /// Echo submitted text (off when reading stdin; the terminal already shows it).
    echo: bool,
}

impl TranscriptSink for StdoutSink {
    fn append(&mut self, batch: &[TranscriptEntry]) {
        if self.json {
            let mut out = std::io::stdout().lock();
            for entry in batch {
                writeln!(out, "{}", serde_json::to_string(entry).unwrap_or_default()).ok();
            }
            out.flush().ok();
            return;
        }
        for entry in batch {
            match entry.kind {
                EntryKind::Echo if self.echo => println!("> {}", entry.text),
                EntryKind::Echo => {}
                EntryKind::Output => {
                    print!("{}", entry.text);
                    std::io::stdout().flush().ok();
                }
                EntryKind::Value => println!("{}", entry.text),
                EntryKind::Error | EntryKind::Warning | EntryKind::Info | EntryKind::Fault => {
                    eprintln!("{}", entry.text);
                }
            }
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if cli.print_schema {
        let schema = EngineSettings::schema();
        println!("{}", serde_json::to_string_pretty(&schema).unwrap_or_default());
        return;
    }

    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| settings::settings_path(&dirs_config_dir()));
    let loaded = effective_settings(&cli, &path);

    if cli.write_config {
        if let Err(e) = settings::save_settings(&path, &loaded) {
            eprintln!("Error: {e}");
            process::exit(1);
        }
        eprintln!("Wrote {}", path.display());
    }

    let references = StandardReferences::new(loaded.usings.iter().cloned());
    if cli.list_references {
        println!("{}", describe_references(&references.supply()));
        return;
    }

    let interactive = cli.eval.is_empty();
    let sink = StdoutSink {
        json: cli.json,
        echo: !interactive,
    };
    let mut engine = ReplEngine::new(loaded, &references, sink);
    let mut failed = false;

    if interactive {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await.unwrap() {
            // Engine failures are already in the transcript
            if engine.submit(&line).await.is_err() {
                process::exit(1);
            }
        }
    } else {
        for snippet in &cli.eval {
            match engine.submit(snippet).await {
                Ok(report) => failed |= !report.accepted || report.fault().is_some(),
                Err(_) => process::exit(1),
            }
        }
    }

    if failed {
        process::exit(1);
    }
}
