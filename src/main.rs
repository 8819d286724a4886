//! MCP OAuth Bridge - local OAuth 2.1 trust broker for MCP servers

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use mcp_oauth_bridge::{
    Error,
    cli::{Cli, Command},
    config::{ApprovalPolicy, ServerRegistration, ServerRegistry, Settings},
    forwarder::Forwarder,
    gateway::ProxyServer,
    oauth::{AuthorizationGrant, PendingAuthorization, RefreshOutcome, TokenRecord},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let settings = match Settings::load(cli.settings.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load settings: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Command::Init = cli.command {
        return run_init(&settings);
    }

    let forwarder = match Forwarder::from_settings(&settings) {
        Ok(forwarder) => forwarder,
        Err(e) => {
            error!("Failed to initialise: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Init => ExitCode::SUCCESS,
        Command::Add { name, url, policy } => run_add(&forwarder, &name, &url, policy).await,
        Command::List => run_list(&forwarder),
        Command::Remove { name } => run_remove(&forwarder, &name),
        Command::Status => run_status(&forwarder),
        Command::Refresh { name } => run_refresh(&forwarder, &name).await,
        Command::Policy { name, policy, tool } => {
            run_policy(&forwarder, &name, policy, tool.as_deref())
        }
        Command::Sweep => run_sweep(&forwarder),
        Command::Start { host, port } => run_start(settings, forwarder, host, port).await,
    }
}

fn run_init(settings: &Settings) -> ExitCode {
    let registry = ServerRegistry::open(settings.registry_path());
    if registry.exists() {
        println!("Already initialised: {}", registry.path().display());
        return ExitCode::SUCCESS;
    }

    if let Err(e) = registry.persist() {
        eprintln!("❌ Failed to initialise {}: {e}", settings.config_dir().display());
        return ExitCode::FAILURE;
    }

    println!("✅ Initialised {}", settings.config_dir().display());
    println!("   Servers: {}", settings.registry_path().display());
    println!("   Tokens:  {} (encrypted)", settings.tokens_path().display());
    println!("\nNext: mcp-oauth-bridge add <name> <url>");
    ExitCode::SUCCESS
}

/// Print the URL and wait for the browser round trip
async fn await_grant(pending: PendingAuthorization) -> Result<AuthorizationGrant, Error> {
    println!("\nOpen this URL in your browser to authorize:\n\n  {}\n", pending.authorization_url());
    println!("Waiting for the callback on {} ...", pending.redirect_uri());
    pending.complete().await
}

async fn run_add(forwarder: &Forwarder, name: &str, url: &str, policy: ApprovalPolicy) -> ExitCode {
    if forwarder.registry().get_server(name).is_some() {
        eprintln!("❌ Server '{name}' is already registered (remove it first)");
        return ExitCode::FAILURE;
    }

    println!("Discovering OAuth configuration for {url} ...");
    let pending = match forwarder.engine().start(url).await {
        Ok(pending) => pending,
        Err(Error::DiscoveryFailed(_)) => {
            eprintln!("❌ No OAuth metadata found for {url}");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("❌ Could not start authorization: {e}");
            return ExitCode::FAILURE;
        }
    };

    let grant = match await_grant(pending).await {
        Ok(grant) => grant,
        Err(e) => {
            eprintln!("❌ Authorization failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut registration =
        ServerRegistration::new(name, url, grant.oauth_config, Some(grant.client));
    registration.approval_policy = policy;

    if let Err(e) = forwarder.tokens().put(name, grant.token) {
        eprintln!("❌ Failed to store token: {e}");
        return ExitCode::FAILURE;
    }
    if let Err(e) = forwarder.registry().add_server(registration) {
        eprintln!("❌ Failed to save registration: {e}");
        // Do not leave an orphaned token behind.
        let _ = forwarder.tokens().delete(name);
        return ExitCode::FAILURE;
    }

    println!("✅ Added '{name}' (approval policy: {policy})");
    ExitCode::SUCCESS
}

fn run_list(forwarder: &Forwarder) -> ExitCode {
    let registrations = forwarder.registry().registrations();
    if registrations.is_empty() {
        println!("No servers registered. Use: mcp-oauth-bridge add <name> <url>");
        return ExitCode::SUCCESS;
    }

    println!("Registered servers ({}):\n", registrations.len());
    for registration in registrations {
        println!("📦 {}", registration.name);
        println!("   URL:    {}", registration.url);
        println!("   Issuer: {}", registration.oauth_config.issuer);
        println!("   Policy: {}", registration.approval_policy);
        let mut overrides: Vec<_> = registration.tool_approvals.iter().collect();
        overrides.sort_by(|a, b| a.0.cmp(b.0));
        for (tool, policy) in overrides {
            println!("     {tool}: {policy}");
        }
        println!();
    }
    ExitCode::SUCCESS
}

fn run_remove(forwarder: &Forwarder, name: &str) -> ExitCode {
    match forwarder.registry().remove_server(name) {
        Ok(true) => {}
        Ok(false) => {
            eprintln!("❌ Server '{name}' is not registered");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("❌ Failed to remove '{name}': {e}");
            return ExitCode::FAILURE;
        }
    }

    if let Err(e) = forwarder.tokens().delete(name) {
        eprintln!("⚠️  Removed '{name}' but failed to delete its token: {e}");
        return ExitCode::FAILURE;
    }
    println!("✅ Removed '{name}'");
    ExitCode::SUCCESS
}

fn describe_token(token: Option<&TokenRecord>) -> String {
    let Some(token) = token else {
        return "not authenticated".to_string();
    };

    let refresh = if token.refresh_token.is_some() {
        "refreshable"
    } else {
        "no refresh token"
    };

    if token.is_expired() {
        return format!("expired ({refresh})");
    }
    match token.time_until_expiry() {
        Some(left) => format!("valid, expires in {}m ({refresh})", left.as_secs() / 60),
        None => format!("valid, no expiry ({refresh})"),
    }
}

fn run_status(forwarder: &Forwarder) -> ExitCode {
    let tokens = forwarder.tokens().list();
    let names = forwarder.registry().list_servers();
    if names.is_empty() {
        println!("No servers registered.");
        return ExitCode::SUCCESS;
    }

    for name in names {
        println!("{name:<24} {}", describe_token(tokens.get(&name)));
    }
    ExitCode::SUCCESS
}

async fn run_refresh(forwarder: &Forwarder, name: &str) -> ExitCode {
    let Some(registration) = forwarder.registry().get_server(name) else {
        eprintln!("❌ Server '{name}' is not registered");
        return ExitCode::FAILURE;
    };

    if let Some(token) = forwarder.tokens().get(name) {
        let client = forwarder.client_for(&registration);
        match forwarder
            .engine()
            .refresh(&registration.oauth_config, &client, &token)
            .await
        {
            RefreshOutcome::Refreshed(record) => {
                if let Err(e) = forwarder.tokens().put(name, record) {
                    eprintln!("❌ Failed to store token: {e}");
                    return ExitCode::FAILURE;
                }
                println!("✅ Refreshed '{name}'");
                return ExitCode::SUCCESS;
            }
            RefreshOutcome::NoRefreshToken => info!(server = %name, "No refresh token, re-authorizing"),
            RefreshOutcome::Failed(reason) => {
                println!("Refresh failed ({reason}), re-authorizing ...");
            }
        }
    }

    let grant = match forwarder
        .engine()
        .start_with_config(registration.oauth_config.clone())
        .await
    {
        Ok(pending) => await_grant(pending).await,
        Err(e) => Err(e),
    };
    let grant = match grant {
        Ok(grant) => grant,
        Err(e) => {
            eprintln!("❌ Re-authorization failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut updated = registration;
    updated.client = Some(grant.client);
    if let Err(e) = forwarder
        .tokens()
        .put(name, grant.token)
        .and_then(|()| forwarder.registry().add_server(updated))
    {
        eprintln!("❌ Failed to save: {e}");
        return ExitCode::FAILURE;
    }

    println!("✅ Re-authorized '{name}'");
    ExitCode::SUCCESS
}

fn run_policy(forwarder: &Forwarder, name: &str, policy: ApprovalPolicy, tool: Option<&str>) -> ExitCode {
    match forwarder.registry().set_approval_policy(name, policy, tool) {
        Ok(true) => {
            match tool {
                Some(tool) => println!("✅ {name}.{tool}: {policy}"),
                None => println!("✅ {name}: {policy}"),
            }
            ExitCode::SUCCESS
        }
        Ok(false) => {
            eprintln!("❌ Server '{name}' is not registered");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("❌ Failed to update policy: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_sweep(forwarder: &Forwarder) -> ExitCode {
    match forwarder.tokens().sweep_unrecoverable() {
        Ok(0) => {
            println!("Nothing to sweep");
            ExitCode::SUCCESS
        }
        Ok(removed) => {
            println!("✅ Removed {removed} unrecoverable token(s)");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Sweep failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_start(
    mut settings: Settings,
    forwarder: Forwarder,
    host: Option<String>,
    port: Option<u16>,
) -> ExitCode {
    if let Some(host) = host {
        settings.proxy.host = host;
    }
    if let Some(port) = port {
        settings.proxy.port = port;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = settings.proxy.port,
        servers = forwarder.registry().list_servers().len(),
        "Starting MCP OAuth Bridge"
    );

    if let Err(e) = ProxyServer::new(settings, Arc::new(forwarder)).run().await {
        error!("Proxy error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}
