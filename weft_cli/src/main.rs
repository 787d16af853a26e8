use weft_core::config::EngineConfig;
use weft_core::graph::{ModelGraph, UnfreezeOptions};
use weft_core::id::NodeId;
use weft_core::nonterm::{QtySpec, Separator, Shape, SubnodeRef};
use weft_core::sync::{SyncExistence, SyncRelation, SyncScope, SyncSize, ValueCondition};
use weft_core::value::{AbsorbConstraints, BytesValue, Endianness, UIntValue};

use clap::Parser;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// How many messages to generate from the demo model.
    #[clap(short, long, default_value_t = 4)]
    generate: u64,
    #[clap(short, long, default_value_t = 0)]
    seed: u64,
    /// Absorb this file into a fresh model instead of the last
    /// generated message.
    #[clap(short, long)]
    absorb: Option<PathBuf>,
    /// Dump the resolved tree of the last message as JSON.
    #[clap(long)]
    describe: bool,
    /// List the root-relative paths of the last message.
    #[clap(long)]
    paths: bool,
}

/// Small request/response protocol exercising the model features:
/// a conditional status field, a length-synced payload and a
/// separator-delimited command list.
fn build_message_model(graph: &mut ModelGraph) -> Result<NodeId, anyhow::Error> {
    let kind = graph.add_typed("kind", Box::new(BytesValue::new(["REQ", "RSP"])));
    let status = graph.add_typed("status", Box::new(BytesValue::new(["OK", "ERR"])));
    let len = graph.add_typed(
        "len",
        Box::new(UIntValue::ranged(1, Endianness::Big, 0, 255)),
    );
    let payload = graph.add_typed(
        "payload",
        Box::new(BytesValue::new(["ping", "pong", "telemetry"])),
    );
    let command = graph.add_typed("command", Box::new(BytesValue::new(["read", "write", "sync"])));
    let semi = graph.add_typed("semi", Box::new(BytesValue::new([";"])));

    // status only shows up on responses.
    graph.register_sync(
        status,
        SyncScope::Existence,
        SyncRelation::Existence(SyncExistence::single(
            kind,
            Some(ValueCondition::raw(["RSP"])),
        )),
    )?;
    // len carries the payload's byte length on the wire.
    graph.register_sync(
        payload,
        SyncScope::Size,
        SyncRelation::Size(SyncSize::new(len, 0)),
    )?;

    let commands = graph.add_nonterm_with_separator(
        "commands",
        vec![Shape::ordered(vec![SubnodeRef::with_qty(
            command,
            QtySpec::range(1, 3)?,
        )])],
        Separator::new(semi),
    )?;

    let msg = graph.add_nonterm(
        "msg",
        vec![Shape::ordered(vec![
            SubnodeRef::one(kind),
            SubnodeRef::one(status),
            SubnodeRef::one(len),
            SubnodeRef::one(payload),
            SubnodeRef::one(commands),
        ])],
    )?;
    Ok(msg)
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let config = match cli.config_file {
        Some(config_path) => {
            println!("Loading configuration from specified path: {config_path:?}");
            EngineConfig::load_from_file(&config_path)?
        }
        None => {
            // No config file specified via CLI, load default
            let default_config_path = PathBuf::from("weft.toml");
            if default_config_path.exists() {
                println!(
                    "No config file specified via CLI, loading default: {default_config_path:?}",
                );
                EngineConfig::load_from_file(&default_config_path)?
            } else {
                println!(
                    "No config file specified and default 'weft.toml' not found, using built-in defaults."
                );
                EngineConfig::default()
            }
        }
    };
    println!("Effective configuration: {config:#?}");

    let mut rng = ChaCha8Rng::seed_from_u64(cli.seed);
    let mut graph = ModelGraph::with_config(config.clone());
    let msg = build_message_model(&mut graph)?;

    println!("Generating {} message(s)...", cli.generate);
    let mut last_wire = Vec::new();
    for i in 0..cli.generate {
        if i > 0 {
            graph.unfreeze(msg, &UnfreezeOptions::default());
        }
        let wire = graph.freeze(msg, &mut rng);
        println!("  [{i}] {:3} bytes | {}", wire.len(), wire.escape_ascii());
        last_wire = wire;
    }

    if cli.paths {
        println!("Paths of the last message:");
        for (_, path) in graph.paths_from(msg) {
            println!("  {path}");
        }
    }
    if cli.describe {
        println!("{}", serde_json::to_string_pretty(&graph.describe(msg))?);
    }

    let blob = match &cli.absorb {
        Some(path) => {
            println!("Absorbing {path:?} into a fresh model...");
            std::fs::read(path)?
        }
        None => {
            if !last_wire.is_empty() {
                println!("Re-absorbing the last generated message into a fresh model...");
            }
            last_wire
        }
    };
    if !blob.is_empty() {
        let mut fresh = ModelGraph::with_config(config);
        let root = build_message_model(&mut fresh)?;
        let outcome = fresh.absorb(root, &blob, &AbsorbConstraints::default());
        println!(
            "Absorption: {:?}, {} of {} byte(s) consumed",
            outcome.status,
            outcome.size,
            blob.len()
        );
        for field in ["msg/kind", "msg/status", "msg/payload"] {
            let value = fresh
                .find_by_path(root, field)
                .and_then(|id| fresh.value(id));
            match value {
                Some(bytes) => println!("  {field}: {}", bytes.escape_ascii()),
                None => println!("  {field}: (absent)"),
            }
        }
    }

    Ok(())
}
