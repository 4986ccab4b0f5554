use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use toolbridge_config::{ConfigStore, YamlConfigStore};
use toolbridge_core::ToolOutcome;
use toolbridge_mcp::{ClientManager, ToolContext};

#[derive(Parser)]
#[command(name = "toolbridge")]
#[command(about = "Connect to MCP tool servers and call their tools", long_about = None)]
struct Cli {
    #[arg(
        short,
        long,
        value_name = "FILE",
        env = "TOOLBRIDGE_CONFIG",
        default_value = "mcp_config.yaml"
    )]
    config: PathBuf,

    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, action = clap::ArgAction::SetTrue)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show configured servers with secrets masked
    Servers,

    /// Connect every enabled server and report its state
    Status,

    /// List the tools exposed to the agent
    Tools,

    /// Connect to one server, list its tools and disconnect
    Test {
        server: String,

        /// Merge the discovered tools into the saved snapshot
        #[arg(long, action = clap::ArgAction::SetTrue)]
        save: bool,
    },

    /// Call a tool by its registry name
    Call {
        tool: String,

        /// Arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,

        /// Go through the synchronous bridge
        #[arg(long, action = clap::ArgAction::SetTrue)]
        blocking: bool,
    },

    /// Enable one tool, or every tool of a server
    Enable { server: String, tool: Option<String> },

    /// Disable one tool, or every tool of a server
    Disable { server: String, tool: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_json);

    info!("Using MCP configuration at {:?}", cli.config);
    let store: Arc<dyn ConfigStore> = Arc::new(YamlConfigStore::new(cli.config.clone()));

    match cli.command {
        Commands::Servers => show_servers(&store)?,
        Commands::Status => show_status(store).await?,
        Commands::Tools => list_tools(store).await?,
        Commands::Test { server, save } => test_server(store, &server, save).await?,
        Commands::Call {
            tool,
            args,
            blocking,
        } => call_tool(store, tool, &args, blocking).await?,
        Commands::Enable { server, tool } => set_enabled(store, &server, tool.as_deref(), true)?,
        Commands::Disable { server, tool } => set_enabled(store, &server, tool.as_deref(), false)?,
    }

    Ok(())
}

fn show_servers(store: &Arc<dyn ConfigStore>) -> Result<()> {
    let document = store.load()?.masked();
    println!("{}", document.to_yaml()?);
    Ok(())
}

async fn show_status(store: Arc<dyn ConfigStore>) -> Result<()> {
    let manager = ClientManager::new(store);
    let report = manager.initialize(false).await?;

    println!("\n🔌 MCP Servers");
    println!("═══════════════════════════════════════");
    for status in manager.status()? {
        let marker = if status.healthy { "✅" } else if status.enabled { "❌" } else { "⏸️ " };
        println!("\n{} {} ({})", marker, status.name, status.kind);
        println!("   State: {}", status.state);
        println!("   Tools: {}", status.tool_count);
        if let Some(info) = &status.server_info {
            println!("   Server: {} v{}", info.name, info.version);
        }
        if let Some(connected_at) = status.connected_at {
            println!("   Connected at: {}", connected_at.to_rfc3339());
        }
    }
    for failure in &report.failed {
        println!("\n⚠️  {}: {}", failure.server, failure.reason);
    }
    println!();

    manager.shutdown().await;
    Ok(())
}

async fn list_tools(store: Arc<dyn ConfigStore>) -> Result<()> {
    let ctx = ToolContext::new(store);
    ctx.start().await?;

    println!("\n🛠️  Available Tools:");
    println!("═══════════════════════════════════════");
    for tool in ctx.registry().all() {
        println!("\n📦 {}", tool.name());
        for line in tool.description().lines() {
            println!("   {line}");
        }
    }

    let disabled: Vec<String> = ctx
        .manager()
        .get_all_tools()
        .into_iter()
        .filter(|tool| !tool.enabled)
        .map(|tool| format!("{}/{}", tool.server_name, tool.name))
        .collect();
    if !disabled.is_empty() {
        println!("\n🚫 Disabled: {}", disabled.join(", "));
    }
    println!();

    ctx.shutdown().await;
    Ok(())
}

async fn test_server(store: Arc<dyn ConfigStore>, server: &str, save: bool) -> Result<()> {
    let config = store
        .load()?
        .server(server)
        .cloned()
        .ok_or_else(|| anyhow!("Server '{server}' is not configured"))?;
    let manager = ClientManager::new(store);

    println!("\n🔍 Testing MCP server '{server}'");
    println!("═══════════════════════════════════════");

    let report = manager.test_server(server, &config).await;
    if !report.success {
        println!("❌ {}", report.message);
        bail!("Server test failed");
    }

    println!("✅ {}", report.message);
    for tool in &report.tools {
        let state = if tool.enabled { "enabled" } else { "disabled" };
        println!("   - {} [{}]", tool.name, state);
    }

    if save {
        manager.persist_discovered_tools(server, &report.tools)?;
        println!("\n💾 Saved {} tools to the configuration", report.tools.len());
    }
    Ok(())
}

async fn call_tool(store: Arc<dyn ConfigStore>, tool: String, args: &str, blocking: bool) -> Result<()> {
    let args: Value = serde_json::from_str(args).context("--args must be valid JSON")?;

    let ctx = ToolContext::new(store);
    ctx.start().await?;

    let outcome = if blocking {
        let registry = Arc::clone(ctx.registry());
        tokio::task::spawn_blocking(move || registry.call_blocking(&tool, args)).await?
    } else {
        ctx.registry().execute(&tool, args).await
    };

    ctx.shutdown().await;

    let outcome = outcome?;
    match &outcome {
        ToolOutcome::Success { .. } => println!("{}", outcome.text()),
        ToolOutcome::ToolError { .. } | ToolOutcome::Disabled { .. } => {
            bail!("{}", outcome.to_agent_text())
        }
        ToolOutcome::TransportFailure { message } => bail!("Transport failure: {message}"),
    }
    Ok(())
}

fn set_enabled(store: Arc<dyn ConfigStore>, server: &str, tool: Option<&str>, enabled: bool) -> Result<()> {
    let manager = ClientManager::new(store);
    let updated = manager.update_tool_enabled(server, tool, enabled)?;
    println!(
        "{} {} tool(s) on '{}'",
        if enabled { "Enabled" } else { "Disabled" },
        updated,
        server
    );
    Ok(())
}

fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    // stdout carries command output only.
    let json_layer = json.then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!json).then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}
