//! marketflow - command-line front end for the flea-market chatbot
//!
//! Answers single questions, runs an interactive session, replays stored
//! prompt files and prints the workflow graph.

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use flowgraph_core::{visualize, VisualizationOptions};
use market_chatbot::batch;
use market_chatbot::{Chatbot, Role, Settings};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Parser)]
#[command(name = "marketflow")]
#[command(about = "Flea-market recommendations and seller guidance for 광주광역시", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// TOML settings file; environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a single question
    Ask {
        /// The question
        query: String,
        /// consumer (default) or seller
        #[arg(short, long, default_value = "consumer")]
        role: Role,
        /// Print the full outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Interactive session; `exit` or `quit` leaves
    Chat {
        /// consumer (default) or seller
        #[arg(short, long, default_value = "consumer")]
        role: Role,
    },

    /// Print the workflow graph
    Graph {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Graphviz DOT instead of Mermaid
        #[arg(long)]
        dot: bool,
    },

    /// Replay a stored prompt file and write a JSON report
    Prompts {
        /// Prompt file ({"prompts": [{id, role, section, text}]})
        #[arg(short, long)]
        input: PathBuf,
        /// Report path (default: results/test_prompts_results_<timestamp>.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Roles to include: consumer, seller or all
        #[arg(long, value_delimiter = ',', default_value = "all")]
        roles: Vec<String>,
        /// Maximum number of prompts (0: no limit)
        #[arg(long, default_value_t = 0)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(rust_log)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())
        .await
        .context("Failed to load settings")?;
    let chatbot = Chatbot::from_settings(settings)
        .await
        .context("Failed to start the chatbot")?;

    match cli.command {
        Commands::Ask { query, role, json } => {
            let outcome = chatbot.ask(role, &query).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!("{}", outcome.response);
            }
        }
        Commands::Chat { role } => chat(&chatbot, role).await?,
        Commands::Graph { output, dot } => {
            let options = if dot {
                VisualizationOptions::dot()
            } else {
                VisualizationOptions::mermaid()
            };
            let rendered = visualize(chatbot.graph().graph(), &options.with_title("marketflow"));
            match output {
                Some(path) => {
                    write_file(&path, &rendered).await?;
                    println!("✓ Graph written to {}", path.display());
                }
                None => print!("{rendered}"),
            }
        }
        Commands::Prompts { input, output, roles, limit } => {
            let roles = batch::select_roles(&roles);
            let prompts = batch::load_prompts(&input).await?;
            let prompts = batch::select_prompts(prompts, &roles, limit);
            println!("Running {} prompts...", prompts.len());

            let report = batch::run_batch(&chatbot, &input, prompts, roles).await;
            let path = output.unwrap_or_else(|| batch::default_report_path(Path::new("results"), Utc::now()));
            write_file(&path, &serde_json::to_string_pretty(&report)?).await?;
            println!(
                "✓ {} prompts, {} failures, report saved to {}",
                report.count,
                report.failures,
                path.display()
            );
        }
    }
    Ok(())
}

async fn chat(chatbot: &Chatbot, role: Role) -> anyhow::Result<()> {
    println!("marketflow ({role}) - type `exit` to quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        if matches!(query, "exit" | "quit") {
            break;
        }
        match chatbot.ask(role, query).await {
            Ok(outcome) => println!("{}\n", outcome.response),
            Err(e) => eprintln!("✗ {e}"),
        }
    }
    Ok(())
}

async fn write_file(path: &Path, content: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}
