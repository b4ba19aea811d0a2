//! Troupe CLI - drive a cast of actors from the command line
//!
//! Loads a cast file (host definitions, actors, and optional scripted model
//! replies), then sends a chat request to one actor and prints the reply
//! envelope as JSON.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use troupe::{
    ActorId, ActorRecord, Envelope, FixtureModel, HostDefinition, InMemoryDirectory, Runtime,
};

#[derive(Parser)]
#[command(name = "troupe")]
#[command(about = "Prompt execution runtime for hierarchical agents", long_about = None)]
struct Cli {
    /// Cast file describing hosts and actors
    #[arg(short, long, default_value = "cast.json")]
    cast: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a chat request to an actor
    Chat {
        /// Target actor id
        #[arg(short, long)]
        actor: String,

        /// Entry name (empty selects the default entry)
        #[arg(short, long, default_value = "")]
        entry: String,

        /// Request text
        text: String,

        /// Bind the actor's long-running scope for this call
        #[arg(long)]
        contextual: bool,

        /// Wait for the terminal result instead of an interim reply
        #[arg(long)]
        settle: bool,
    },

    /// List the actors and hosts in the cast file
    Cast,
}

/// On-disk cast description.
#[derive(Deserialize)]
struct CastFile {
    #[serde(default)]
    hosts: Vec<HostDefinition>,
    #[serde(default)]
    actors: Vec<ActorRecord>,
    /// Scripted model replies, consumed in order; afterwards the model
    /// echoes prompts.
    #[serde(default)]
    replies: Vec<Envelope>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let raw = std::fs::read_to_string(&cli.cast)?;
    let cast: CastFile = serde_json::from_str(&raw)?;

    match cli.command {
        Commands::Cast => {
            for host in &cast.hosts {
                println!("host {} ({} entries)", host.id, host.entries.len());
            }
            for actor in &cast.actors {
                println!(
                    "actor {} host={}",
                    actor.id,
                    actor.host.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
        Commands::Chat {
            actor,
            entry,
            text,
            contextual,
            settle,
        } => {
            let directory = InMemoryDirectory::new();
            for host in cast.hosts {
                directory.add_host(host);
            }
            for record in cast.actors {
                directory.add_actor(record);
            }
            let model = FixtureModel::new();
            for reply in cast.replies {
                model.push(reply);
            }

            let runtime = Runtime::new(directory, model)?;
            let request = Envelope::text(text);
            let actor_id = ActorId(actor);
            let reply = if settle {
                runtime
                    .chat_settled(&actor_id, &entry, request, contextual)
                    .await?
            } else {
                runtime.chat(&actor_id, &entry, request, contextual).await?
            };
            println!("{}", serde_json::to_string_pretty(&reply)?);
            Ok(())
        }
    }
}
