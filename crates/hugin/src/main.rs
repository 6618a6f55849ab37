//! hugin: launch coding agents behind a local observing proxy
//!
//! hugin starts a reverse proxy on a local port, points the agent's base-URL variable at it and
//! records per-session usage metrics that can be synced to a remote API.

mod config;
mod session;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hugin_metrics::{DeltaWriter, SyncClient, aggregate};
use hugin_proxy::{ProxyServer, builtin_registry};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use config::Config;
use session::{SessionId, SessionMetadata};

/// Agents hugin can launch and the variable each reads its API base URL from.
const AGENTS: &[(&str, &str)] = &[
    ("claude", "ANTHROPIC_BASE_URL"),
    ("codex", "OPENAI_BASE_URL"),
    ("gemini", "GOOGLE_GEMINI_BASE_URL"),
];

/// Split command line args at agent command boundary.
/// Returns (hugin_args, Option<(agent_cmd, agent_args)>)
fn split_args_at_agent(args: Vec<String>) -> (Vec<String>, Option<(String, Vec<String>)>) {
    let is_agent = |a: &String| AGENTS.iter().any(|(name, _)| name == a);
    match args.iter().skip(1).position(is_agent) {
        Some(pos) => {
            let idx = pos + 1;
            let agent_cmd = args[idx].clone();
            let agent_args = args[idx + 1..].to_vec();
            (args[..idx].to_vec(), Some((agent_cmd, agent_args)))
        }
        None => (args, None),
    }
}

/// Launch coding agents behind a local observing proxy
///
/// Usage with agents: `hugin [OPTIONS] <agent> [AGENT_ARGS]...`
/// Example: `hugin --verbose claude -c` runs claude with -c flag
#[derive(Parser)]
#[command(name = "hugin")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to .hugin directory (default: search for .hugin/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Port for the proxy server (0 = auto-select)
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Upstream API base URL
    #[arg(long, global = true, env = "HUGIN_TARGET_URL")]
    target_url: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy server standalone (without launching an agent)
    Proxy {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
    },

    /// Initialize a new .hugin directory with config file
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Push unsynced metrics to the sync API
    Sync {
        /// Only this session (default: every session)
        #[arg(long)]
        session: Option<String>,

        /// Also retry records previously marked failed
        #[arg(long)]
        retry_failed: bool,
    },

    /// Show aggregated usage for a session
    Stats {
        /// Session id (default: the latest session)
        #[arg(long)]
        session: Option<String>,

        /// Print totals as JSON
        #[arg(long)]
        json: bool,
    },
}

fn env_filter(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Initialize logging for interactive commands. Logs to stderr.
fn init_logging(verbose: bool) {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter(verbose))
        .init();
}

/// Initialize logging for proxy runs.
/// Logs to a single file in the session directory so the agent's terminal stays clean.
fn init_session_logging(session_dir: &Path, verbose: bool) {
    use std::fs::OpenOptions;

    let log_path = session_dir.join("hugin.log");
    let file = match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: Failed to create log file: {}", e);
            init_logging(verbose);
            return;
        }
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    // Dropping the guard would stop the writer thread
    static SESSION_GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = SESSION_GUARD.set(guard);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(env_filter(verbose))
        .init();
}

/// Load config from an explicit path or auto-discover `.hugin/config.toml`.
///
/// Returns the config and the `.hugin` directory, if one was found.
fn load_config(override_path: Option<&PathBuf>) -> Result<(Config, Option<PathBuf>)> {
    if let Some(path) = override_path {
        // Explicit path: either the .hugin directory or the config file itself
        let config_file = if path.is_dir() {
            Config::config_path(path)
        } else {
            path.clone()
        };
        let hugin_dir = config_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| path.clone());
        let config = Config::from_file(&config_file)?;
        return Ok((config, Some(hugin_dir)));
    }

    Ok(match Config::find_and_load()? {
        Some((config, hugin_dir)) => (config, Some(hugin_dir)),
        None => (Config::default(), None),
    })
}

/// Refuse to start with an invalid config.
fn ensure_valid(config: &Config) -> Result<()> {
    let errors = config.validate();
    if errors.is_empty() {
        return Ok(());
    }
    let list: Vec<String> = errors.iter().map(|e| format!("  {}", e)).collect();
    anyhow::bail!("Invalid configuration:\n{}", list.join("\n"))
}

/// API key from the environment, used when the config file has none.
fn env_api_key() -> Option<String> {
    std::env::var("HUGIN_API_KEY")
        .ok()
        .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
}

/// `.hugin` directory to use, creating `./.hugin` when none was found.
fn resolve_hugin_dir(found: Option<PathBuf>) -> Result<PathBuf> {
    match found {
        Some(dir) => Ok(dir),
        None => {
            let dir = std::env::current_dir()?.join(config::HUGIN_DIR);
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            Ok(dir)
        }
    }
}

/// A started proxy and what is needed to stop it.
struct RunningProxy {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl RunningProxy {
    /// Stop accepting, drain in-flight requests and run plugin stop hooks.
    async fn stop(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        self.handle.await.context("Proxy task panicked")??;
        Ok(())
    }
}

/// Create a session and start a proxy for it.
async fn start_proxy(
    config: &Config,
    hugin_dir: &Path,
    agent_name: &str,
    target_url: &str,
    bind: SocketAddr,
    verbose: bool,
) -> Result<(SessionId, RunningProxy)> {
    let session_id = SessionId::generate();
    let session_dir = session::session_dir(hugin_dir, &session_id);
    std::fs::create_dir_all(&session_dir)
        .with_context(|| format!("Failed to create {}", session_dir.display()))?;
    init_session_logging(&session_dir, verbose);

    // Bind before handing the address to anyone
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    let addr = listener.local_addr()?;

    let proxy_config = config.proxy_config(
        target_url,
        session_id.as_str(),
        agent_name,
        addr,
        &session_dir,
        env_api_key(),
    );
    let server = ProxyServer::new(proxy_config, &builtin_registry(&config.plugins.disabled))?;

    let metadata = SessionMetadata::new(&session_id, agent_name, target_url)
        .with_proxy_addr(addr.to_string());
    session::write_metadata(&session_dir, &metadata)?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.serve(listener, async move {
        shutdown_rx.await.ok();
    }));

    info!(session_id = %session_id, addr = %addr, target = %target_url, "Proxy ready");
    Ok((
        session_id,
        RunningProxy {
            addr,
            shutdown_tx,
            handle,
        },
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Split args at agent command boundary BEFORE clap parsing
    let (hugin_args, agent_info) = split_args_at_agent(std::env::args().collect());
    let cli = Cli::parse_from(&hugin_args);

    let (mut config, config_dir) = load_config(cli.config.as_ref())?;
    if let Some(port) = cli.port {
        config.proxy.port = port;
    }
    if let Some(url) = cli.target_url.clone() {
        config.proxy.target_url = Some(url);
    }

    if let Some((agent_cmd, agent_args)) = agent_info {
        ensure_valid(&config)?;
        let hugin_dir = resolve_hugin_dir(config_dir)?;
        return run_with_agent(&config, &hugin_dir, &agent_cmd, &agent_args, cli.verbose).await;
    }

    let Some(command) = cli.command else {
        use clap::CommandFactory;
        Cli::command().print_help()?;
        let names: Vec<&str> = AGENTS.iter().map(|(name, _)| *name).collect();
        println!("\n\nSupported agents: {}", names.join(", "));
        return Ok(());
    };

    match command {
        Commands::Proxy { host } => {
            ensure_valid(&config)?;
            let hugin_dir = resolve_hugin_dir(config_dir)?;
            let host = host.unwrap_or_else(|| config.proxy.host.clone());
            let bind: SocketAddr = format!("{}:{}", host, config.proxy.port)
                .parse()
                .with_context(|| format!("Invalid bind address {}:{}", host, config.proxy.port))?;
            let target_url = config.target_url_for("claude");

            let (session_id, proxy) =
                start_proxy(&config, &hugin_dir, "proxy", &target_url, bind, cli.verbose).await?;
            println!("hugin proxy listening on http://{}", proxy.addr);
            println!("Session: {}", session_id);

            tokio::signal::ctrl_c().await?;
            info!("Received interrupt, shutting down...");
            proxy.stop().await?;
        }

        Commands::Init { force } => {
            init_logging(cli.verbose);
            let hugin_dir = std::env::current_dir()?.join(config::HUGIN_DIR);
            let config_path = Config::config_path(&hugin_dir);
            if config_path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    config_path.display()
                );
            }
            std::fs::create_dir_all(&hugin_dir)?;
            std::fs::write(&config_path, toml::to_string_pretty(&Config::default())?)?;
            println!("Created {}", config_path.display());
        }

        Commands::Sync {
            session,
            retry_failed,
        } => {
            init_logging(cli.verbose);
            let hugin_dir = config_dir.context("No .hugin directory found")?;
            let sync_config = config
                .sync_config(retry_failed)
                .context("Sync is not configured: set [sync] base_url")?;
            let client = SyncClient::new(sync_config)?;

            let sessions = match session {
                Some(id) => vec![SessionId::from_string(id)],
                None => session::list_sessions(&hugin_dir)?,
            };
            for id in sessions {
                let writer =
                    DeltaWriter::for_session(session::session_dir(&hugin_dir, &id), id.as_str());
                let report = client.sync_pending(&writer).await?;
                if report.batches == 0 {
                    continue;
                }
                println!(
                    "{}: {} synced, {} failed ({} batches)",
                    id, report.synced, report.failed, report.batches
                );
                for failure in &report.failures {
                    println!(
                        "  {} records failed after {} attempts: {}",
                        failure.record_ids.len(),
                        failure.attempts,
                        failure.error
                    );
                }
            }
        }

        Commands::Stats { session, json } => {
            init_logging(cli.verbose);
            let hugin_dir = config_dir.context("No .hugin directory found")?;
            let id = match session {
                Some(id) => SessionId::from_string(id),
                None => session::latest_session(&hugin_dir)?.context("No sessions recorded")?,
            };
            let dir = session::session_dir(&hugin_dir, &id);
            let writer = DeltaWriter::for_session(&dir, id.as_str());
            let totals = aggregate(&writer.read_all()?);

            if json {
                println!("{}", serde_json::to_string_pretty(&totals)?);
            } else {
                let metadata = session::read_metadata(&dir).ok();
                print_totals(&id, metadata.as_ref(), &totals);
            }
        }
    }

    Ok(())
}

fn print_totals(
    id: &SessionId,
    metadata: Option<&SessionMetadata>,
    totals: &hugin_metrics::SessionTotals,
) {
    println!("Session {}", id);
    if let Some(metadata) = metadata {
        println!(
            "  agent:          {} -> {}",
            metadata.agent_name, metadata.target_url
        );
        println!("  started:        {}", metadata.started_at.to_rfc3339());
    }
    println!("  requests:       {}", totals.requests);
    println!("  input tokens:   {}", totals.tokens.input);
    println!("  output tokens:  {}", totals.tokens.output);
    println!(
        "  cache tokens:   {} created, {} read",
        totals.tokens.cache_creation, totals.tokens.cache_read
    );
    println!("  tool calls:     {}", totals.total_tool_calls());
    for (tool, count) in &totals.tool_calls {
        println!("    {:<20} {}", tool, count);
    }
    for (model, model_totals) in &totals.models {
        println!(
            "  {}: {} requests, {} tokens",
            model,
            model_totals.requests,
            model_totals.tokens.total()
        );
    }
    println!(
        "  sync:           {} pending, {} synced, {} failed",
        totals.pending, totals.synced, totals.failed
    );
}

/// Run an agent with the proxy transparently injected.
async fn run_with_agent(
    config: &Config,
    hugin_dir: &Path,
    agent_cmd: &str,
    agent_args: &[String],
    verbose: bool,
) -> Result<()> {
    use tokio::process::Command;

    let base_url_var = AGENTS
        .iter()
        .find(|(name, _)| *name == agent_cmd)
        .map(|(_, var)| *var)
        .context("Unsupported agent")?;

    let target_url = config.target_url_for(agent_cmd);
    let bind = SocketAddr::from(([127, 0, 0, 1], config.proxy.port));
    let (session_id, proxy) =
        start_proxy(config, hugin_dir, agent_cmd, &target_url, bind, verbose).await?;
    let proxy_url = format!("http://{}", proxy.addr);

    let mut cmd = Command::new(agent_cmd);
    cmd.args(agent_args)
        .env(base_url_var, &proxy_url)
        .env("NO_PROXY", "127.0.0.1")
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    // The proxy injects the real credential; claude still wants a token to start
    if agent_cmd == "claude"
        && config.credentials(env_api_key()).is_some()
        && std::env::var("ANTHROPIC_API_KEY").is_err()
    {
        cmd.env("ANTHROPIC_AUTH_TOKEN", "hugin-proxy");
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            proxy.stop().await?;
            anyhow::bail!("Failed to launch '{}'. Is it installed? Error: {}", agent_cmd, e);
        }
    };
    info!(agent = %agent_cmd, session_id = %session_id, "Agent launched");

    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(exit) if exit.success() => info!("{} exited successfully", agent_cmd),
                Ok(exit) => info!("{} exited with status: {}", agent_cmd, exit),
                Err(e) => tracing::error!("Error waiting for {}: {}", agent_cmd, e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, shutting down...");
            let _ = child.kill().await;
        }
    }

    // Graceful stop runs plugin stop hooks, which flush pending sync
    proxy.stop().await?;
    info!(session_id = %session_id, "hugin proxy stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_split_args_at_agent() {
        let (own, agent) =
            split_args_at_agent(args(&["hugin", "--verbose", "claude", "-c", "--port", "1"]));
        assert_eq!(own, args(&["hugin", "--verbose"]));
        let (cmd, rest) = agent.unwrap();
        assert_eq!(cmd, "claude");
        assert_eq!(rest, args(&["-c", "--port", "1"]));
    }

    #[test]
    fn test_split_args_without_agent() {
        let (own, agent) = split_args_at_agent(args(&["hugin", "stats", "--json"]));
        assert_eq!(own, args(&["hugin", "stats", "--json"]));
        assert!(agent.is_none());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::parse_from(["hugin", "sync", "--retry-failed", "--session", "s1"]);
        match cli.command {
            Some(Commands::Sync {
                session,
                retry_failed,
            }) => {
                assert_eq!(session.as_deref(), Some("s1"));
                assert!(retry_failed);
            }
            _ => panic!("expected sync command"),
        }
    }
}
