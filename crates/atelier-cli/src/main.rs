use std::path::PathBuf;

use anyhow::Result;
use atelier_contracts::config::ServiceConfig;
use atelier_contracts::events::EventLog;
use atelier_engine::BrokerEngine;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(name = "atelier", version, about = "AI chat and image brokering engine")]
struct Cli {
    /// Path of the JSONL event log.
    #[arg(long, default_value = "events.jsonl")]
    events: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate an image from free-form text.
    Generate(GenerateArgs),
    /// Ask the assistant, optionally through a named function.
    Chat(ChatArgs),
    /// Check connectivity to the image endpoint.
    Probe,
    /// List the supported chat functions.
    Functions,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    text: String,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    message: String,
    /// Function tag, `kind` or `kind:variant` (see `functions`).
    #[arg(long)]
    function: Option<String>,
    /// Free-form extra requirement passed to the function.
    #[arg(long)]
    value: Option<String>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("atelier error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let engine = BrokerEngine::new(ServiceConfig::from_env(), EventLog::new(&cli.events))?;

    let rendered = match cli.command {
        Command::Generate(args) => engine.generate_image(&args.text).to_value(),
        Command::Chat(args) => engine
            .chat_reply(
                &args.message,
                args.function.as_deref(),
                args.value.as_deref(),
            )
            .to_value(),
        Command::Probe => engine.probe_image_endpoint(),
        Command::Functions => {
            let rows: Vec<Value> = engine
                .functions()
                .specs()
                .map(|spec| {
                    json!({
                        "tag": spec.tag,
                        "summary": spec.summary,
                    })
                })
                .collect();
            Value::Array(rows)
        }
    };
    println!("{}", serde_json::to_string_pretty(&rendered)?);
    Ok(())
}
