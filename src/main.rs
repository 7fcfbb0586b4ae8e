use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use guidechat::{
    catalog::{Catalog, CatalogSource, CsvCatalog, HttpCatalog},
    chat, constants,
    session::{ConversationStore, HttpConversationStore, InMemoryConversationStore},
    template::Placeholders,
    web_server::{self, AppState},
    widget::{WidgetConfig, WidgetHandle},
};

// Define the command-line interface structure using clap
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Clone)]
struct SourceArgs {
    #[arg(long, env = "GUIDECHAT_DATA_DIR", default_value = "data", help = "Directory holding items.csv, locations.csv and questions.csv.")]
    data_dir: PathBuf,
    #[arg(long, env = "GUIDECHAT_CATALOG_URL", help = "Fetch catalogs over HTTP instead of reading CSV files.")]
    catalog_url: Option<String>,
    #[arg(long, env = "GUIDECHAT_STORE_URL", help = "Conversation store base URL; in-memory when unset.")]
    store_url: Option<String>,
    #[arg(long, default_value = "braced", value_parser = ["braced", "legacy"], help = "Placeholder syntax used by question templates.")]
    placeholders: String,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the web server.
    Serve {
        #[arg(long, default_value_t = 9900, help = "Port for the web server.")]
        port: u16,
        #[arg(long, default_value = "templates", help = "Directory of page templates.")]
        templates_dir: PathBuf,
        #[arg(long, default_value = "static", help = "Directory of static files.")]
        static_dir: PathBuf,
        #[command(flatten)]
        sources: SourceArgs,
    },
    /// Compose and send messages from the terminal.
    Chat {
        #[command(flatten)]
        sources: SourceArgs,
    },
    /// Print a catalog as JSON.
    Catalog {
        #[arg(value_parser = ["items", "locations", "questions"])]
        kind: String,
        #[command(flatten)]
        sources: SourceArgs,
    },
}

fn catalog_source(args: &SourceArgs) -> Box<dyn CatalogSource> {
    match &args.catalog_url {
        Some(url) => Box::new(HttpCatalog::new(url.clone(), *constants::REQUEST_TIMEOUT)),
        None => Box::new(CsvCatalog::new(args.data_dir.clone())),
    }
}

fn conversation_store(args: &SourceArgs) -> Arc<dyn ConversationStore> {
    match &args.store_url {
        Some(url) => Arc::new(HttpConversationStore::new(url.clone(), *constants::REQUEST_TIMEOUT)),
        None => {
            info!("No conversation store configured; messages are kept in memory");
            Arc::new(InMemoryConversationStore::new())
        }
    }
}

async fn start_widget(args: &SourceArgs) -> Result<WidgetHandle> {
    let placeholders = Placeholders::from_style(&args.placeholders)
        .with_context(|| format!("Unknown placeholder style {}", args.placeholders))?;
    let catalog = Catalog::load(catalog_source(args).as_ref()).await;
    let config = WidgetConfig {
        placeholders,
        ..WidgetConfig::default()
    };
    Ok(WidgetHandle::spawn(catalog, conversation_store(args), config))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Reads log level from RUST_LOG (e.g. RUST_LOG=info,guidechat=debug)
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    info!("guidechat starting with command: {:?}", cli.command);

    match cli.command {
        Commands::Serve {
            port,
            templates_dir,
            static_dir,
            sources,
        } => {
            let widget = start_widget(&sources).await?;
            if let Err(e) = widget.new_conversation().await {
                // The page stays usable; "new conversation" can be retried.
                error!("Could not start initial conversation: {}", e);
            }
            let state = AppState::new(widget, templates_dir);

            let mut web_server_handle =
                tokio::spawn(async move { web_server::start_web_server(port, state, static_dir).await });

            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);

            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("Ctrl-C received, shutting down...");
                    web_server_handle.abort();
                }
                res = &mut web_server_handle => {
                    match res {
                        Ok(Ok(())) => info!("Web server task completed."),
                        Ok(Err(e)) => return Err(e.context("Web server failed")),
                        Err(e) if e.is_panic() => error!("Web server task panicked: {:?}", e),
                        Err(e) => error!("Web server task failed: {:?}", e),
                    }
                }
            }
            info!("Shutdown complete.");
        }
        Commands::Chat { sources } => {
            let widget = start_widget(&sources).await?;
            chat::run_chat(widget).await.context("Chat session failed")?;
        }
        Commands::Catalog { kind, sources } => {
            let source = catalog_source(&sources);
            let json = match kind.as_str() {
                "items" => serde_json::to_string_pretty(&source.list_items().await?)?,
                "locations" => serde_json::to_string_pretty(&source.list_locations().await?)?,
                "questions" => serde_json::to_string_pretty(&source.list_question_templates().await?)?,
                other => bail!("Unknown catalog {}", other),
            };
            println!("{}", json);
        }
    }

    Ok(())
}
