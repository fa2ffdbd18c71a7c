use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use rookery::{
    crow_tech_edges, parse_edges, Mesh, MeshConfig, Nest, SimConfig, DEFAULT_MAX_LATENCY,
    DEFAULT_MIN_LATENCY, NOTE,
};

/// How long a gossip flood is given to spread before reporting its reach.
const GOSSIP_SETTLE: Duration = Duration::from_secs(2);

/// A storage entry preloaded into one nest.
#[derive(Clone, Debug)]
struct StoreEntry {
    nest: String,
    key: String,
    value: Value,
}

impl FromStr for StoreEntry {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (nest, rest) = s
            .split_once(':')
            .context("store entry must look like NEST:KEY=VALUE")?;
        let (key, raw) = rest
            .split_once('=')
            .context("store entry must look like NEST:KEY=VALUE")?;
        if nest.is_empty() || key.is_empty() {
            anyhow::bail!("store entry needs both a nest and a key");
        }

        // JSON when it parses, a plain string otherwise.
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::from(raw));
        Ok(StoreEntry {
            nest: nest.to_string(),
            key: key.to_string(),
            value,
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "rookery")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Edge list with one `Name-Name` pair per line. Defaults to the crow village.
    #[arg(short, long, value_name = "FILE")]
    topology: Option<PathBuf>,

    /// Seed for latency, loss and lookup order.
    #[arg(short, long)]
    seed: Option<u64>,

    #[arg(long, default_value_t = DEFAULT_MIN_LATENCY.as_millis() as u64)]
    min_latency_ms: u64,

    #[arg(long, default_value_t = DEFAULT_MAX_LATENCY.as_millis() as u64)]
    max_latency_ms: u64,

    #[arg(long, default_value_t = 0.0)]
    drop_rate: f64,

    #[arg(long = "store", value_name = "NEST:KEY=VALUE")]
    store: Vec<StoreEntry>,

    #[arg(long, default_value = "10")]
    converge_timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the topology a nest believes in.
    Topology {
        #[arg(long)]
        from: String,
    },
    /// Flood a message from a nest and report how far it got.
    Gossip {
        #[arg(long)]
        from: String,
        message: String,
    },
    /// Send a note to any nest, routing through the mesh.
    Note {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        text: String,
    },
    /// Look a key up locally, then across the mesh.
    Find {
        #[arg(long)]
        from: String,
        key: String,
    },
    /// Ask every nest for a key at once.
    Collect {
        #[arg(long)]
        from: String,
        key: String,
    },
    /// Follow a chain of nest names stored under a key.
    Follow {
        #[arg(long)]
        from: String,
        key: String,
    },
    /// Ping each neighbor of a nest.
    Neighbors {
        #[arg(long)]
        from: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let edges = match &args.topology {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading topology from {}", path.display()))?;
            parse_edges(&text)?
        }
        None => crow_tech_edges(),
    };

    let mut builder = Mesh::builder()
        .edges(edges)
        .config(MeshConfig {
            seed: args.seed,
            ..Default::default()
        })
        .sim_config(SimConfig {
            min_latency: Duration::from_millis(args.min_latency_ms),
            max_latency: Duration::from_millis(args.max_latency_ms),
            drop_rate: args.drop_rate,
            seed: args.seed,
            ..Default::default()
        });
    for entry in args.store {
        builder = builder.store(entry.nest, entry.key, entry.value);
    }

    let mesh = builder.build().await?;
    mesh.wait_for_convergence(Duration::from_secs(args.converge_timeout_secs))
        .await?;
    info!(nests = mesh.nests().len(), "topology converged");

    let outcome = run(&mesh, args.command).await;
    if let Err(e) = &outcome {
        warn!(error = %e, "command failed");
    }
    mesh.shutdown().await;
    outcome
}

async fn run(mesh: &Mesh, command: Command) -> Result<()> {
    match command {
        Command::Topology { from } => {
            for (name, neighbors) in nest(mesh, &from)?.connections().await {
                println!("{name}: {}", neighbors.join(", "));
            }
        }
        Command::Gossip { from, message } => {
            nest(mesh, &from)?.broadcast_gossip(&message, None).await?;
            time::sleep(GOSSIP_SETTLE).await;
            let mut reached = 0;
            for nest in mesh.nests() {
                if nest.has_seen(&message).await {
                    reached += 1;
                }
            }
            println!("{message:?} reached {reached} of {} nests", mesh.nests().len());
        }
        Command::Note { from, to, text } => {
            let response = nest(mesh, &from)?.route_request(&to, NOTE, Value::from(text)).await?;
            println!("{}", render(&response));
        }
        Command::Find { from, key } => {
            let value = nest(mesh, &from)?.find_in_storage(&key).await?;
            println!("{key} = {}", render(&value));
        }
        Command::Collect { from, key } => {
            for (name, value) in nest(mesh, &from)?.collect_from_network(&key).await? {
                match value {
                    Some(value) => println!("{name}: {}", render(&value)),
                    None => println!("{name}: -"),
                }
            }
        }
        Command::Follow { from, key } => {
            let location = nest(mesh, &from)?.follow_pointer(&key).await?;
            println!("{key} is at {location}");
        }
        Command::Neighbors { from } => {
            let nest = nest(mesh, &from)?;
            let liveness = nest.neighbor_liveness().await;
            for (neighbor, alive) in nest.neighbors().iter().zip(liveness) {
                println!("{neighbor}: {}", if alive { "answering" } else { "silent" });
            }
        }
    }
    Ok(())
}

fn nest<'a>(mesh: &'a Mesh, name: &str) -> Result<&'a Nest> {
    mesh.nest(name)
        .with_context(|| format!("no nest named {name:?} in this mesh"))
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
