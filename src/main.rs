use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flint_hub::apps::AppDirectory;
use flint_hub::config::HubConfig;
use flint_hub::device::{register_device_tools, DisconnectedBridge};
use flint_hub::discovery::{
    IntegrationRegistrar, ProviderTrust, RescanOutcome, Scanner, Translator, VerifyPolicy,
};
use flint_hub::mcp::McpProtocol;
use flint_hub::provider::{Bounded, ProcessTransport, ProviderTransport};
use flint_hub::registry::ToolRegistry;
use flint_hub::server::McpServer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// MCP automation hub: device tools plus tools discovered from installed apps
#[derive(Debug, Parser)]
#[command(name = "flint-hub", version, about)]
struct Args {
    /// Config file (defaults to ~/.flint-hub/config.toml)
    #[arg(long, env = "FLINT_HUB_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Bearer token required on the MCP endpoints
    #[arg(long, env = "FLINT_HUB_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Listen on all interfaces instead of loopback only
    #[arg(long)]
    public: bool,

    /// Directory holding installed app manifests
    #[arg(long)]
    apps_dir: Option<PathBuf>,

    /// Do not watch the app directory for changes
    #[arg(long)]
    no_watch: bool,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    fn effective_config(&self) -> Result<HubConfig> {
        let path = self.config.clone().unwrap_or_else(HubConfig::default_path);
        let mut config = HubConfig::load(path.clone())
            .with_context(|| format!("failed to load config from {}", path.display()))?;

        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(token) = &self.token {
            config.server.auth_token = token.clone();
        }
        if self.public {
            config.server.localhost_only = false;
        }
        if let Some(dir) = &self.apps_dir {
            config.discovery.apps_dir = dir.clone();
        }
        if self.no_watch {
            config.discovery.watch = false;
        }
        Ok(config)
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flint_hub=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.effective_config()?;

    if args.print_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    init_tracing(args.log_format);

    let registry = ToolRegistry::new();
    if config.device.enabled {
        register_device_tools(&registry, Arc::new(DisconnectedBridge));
    }

    let discovery = &config.discovery;
    info!(dir = %discovery.apps_dir.display(), "app directory");
    let apps = AppDirectory::new(&discovery.apps_dir);
    let transport: Arc<dyn ProviderTransport> = Arc::new(Bounded::new(
        ProcessTransport::new(apps.clone()),
        discovery.call_timeout(),
    ));

    let scanner = Scanner::new(
        Arc::new(apps),
        transport.clone(),
        discovery.authority_suffix.clone(),
    )
    .with_trust(ProviderTrust::new(discovery.dev_mode));
    let translator = Translator::new(transport).with_verify_policy(VerifyPolicy {
        interval: discovery.verify_interval(),
        timeout: discovery.verify_timeout(),
    });
    let registrar = Arc::new(
        IntegrationRegistrar::new(Arc::new(scanner), translator, registry.clone())
            .with_debounce(discovery.rescan_debounce())
            .with_listener(discovery.watch),
    );

    let protocol = Arc::new(McpProtocol::new(registry.clone()));

    if let RescanOutcome::Completed(summary) = registrar.register_all().await {
        info!(apps = summary.apps, tools = summary.tools, "initial scan done");
    }
    info!(tools = registry.count(), "Flint Hub ready");

    if !config.server.localhost_only && !config.auth_enabled() {
        warn!("listening on all interfaces without an auth token");
    }
    let server = McpServer::new(protocol, &config.server);
    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
            return;
        }
        info!("shutting down");
        on_signal.cancel();
    });

    let served = server.serve(shutdown).await;
    registrar.cleanup().await;
    served
}
