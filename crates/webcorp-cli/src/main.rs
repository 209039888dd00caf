/// webcorp – main entry point.
///
/// Probes a corporate proxy to find out whether plain HTTP and CONNECT
/// tunnels are subject to NTLM (or another) authentication challenge.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use webcorp_core::{
    config::ClientConfig,
    probe::{self, ProbeResult},
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "webcorp", about = "webcorp – NTLM proxy authentication probe")]
struct Cli {
    /// Path to the XML configuration file
    #[arg(short, long, default_value = "webcorp.xml", global = true)]
    config: String,

    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Knock on every target through the proxy and report the challenge
    Check {
        /// Override the proxy as host:port
        #[arg(long)]
        proxy: Option<String>,

        /// Target URL to probe (repeatable); replaces the configured list
        #[arg(long = "target")]
        targets: Vec<String>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if std::path::Path::new(&cli.config).exists() {
        Some(ClientConfig::load_from_file(&cli.config))
    } else {
        None
    };

    // Initialise tracing
    let level = match (&config, cli.verbose) {
        (_, true) => "debug".to_string(),
        (Some(Ok(cfg)), false) => cfg.settings.log_level.clone(),
        _ => "info".to_string(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match config {
        Some(Ok(cfg)) => cfg,
        Some(Err(e)) => {
            warn!("Failed to load config '{}': {}. Using defaults.", cli.config, e);
            ClientConfig::default()
        }
        None => {
            info!("Config file '{}' not found, using defaults.", cli.config);
            ClientConfig::default()
        }
    };

    match cli.command {
        Command::Check { proxy, targets, json } => {
            if let Some(p) = proxy {
                let (host, port) = parse_host_port(&p)?;
                config.proxy.host = host;
                config.proxy.port = port;
            }
            if !targets.is_empty() {
                config.targets = targets;
            }
            run_check(&config, json)
        }
        Command::Init { force } => run_init(&cli.config, force),
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn run_check(config: &ClientConfig, json: bool) -> Result<()> {
    if config.targets.is_empty() {
        println!("No targets configured.");
        return Ok(());
    }
    let options = config.connect_options()?;
    if !json {
        println!(
            "Probing {} target(s) through {}...",
            config.targets.len(),
            options.authority()
        );
    }

    let results = probe::probe_all(&options, &config.auth, &config.targets);
    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        for r in &results {
            println!("  {}", format_result(r, &config.auth.name));
        }
    }
    Ok(())
}

fn format_result(r: &ProbeResult, scheme: &str) -> String {
    let Some(status) = r.status else {
        return format!("[ERR]  {} – {}", r.target, r.error.as_deref().unwrap_or("unknown error"));
    };
    let latency = r.latency_ms.unwrap_or(0);
    if !r.requires_auth {
        return format!("[OPEN] {} {} – {} in {}ms", r.method, r.target, status, latency);
    }
    let offered = if r.offered_schemes.is_empty() {
        "no schemes offered".to_string()
    } else {
        r.offered_schemes.join(", ")
    };
    let tag = if r.scheme_offered { "[AUTH]" } else { "[????]" };
    format!(
        "{} {} {} – {} in {}ms, offers: {} ({} {})",
        tag,
        r.method,
        r.target,
        status,
        latency,
        offered,
        scheme,
        if r.scheme_offered { "supported" } else { "not offered" }
    )
}

fn run_init(path: &str, force: bool) -> Result<()> {
    if std::path::Path::new(path).exists() && !force {
        return Err(anyhow!("'{}' already exists (use --force to overwrite)", path));
    }
    ClientConfig::default().save_to_file(path)?;
    println!("Wrote default configuration to {}", path);
    Ok(())
}

/// Parse `host:port` or `[ipv6]:port`.
fn parse_host_port(target: &str) -> Result<(String, u16)> {
    // Handle bracketed IPv6: [2001:db8::1]:8080
    if target.starts_with('[') {
        if let Some(bracket_end) = target.find(']') {
            let host = target[1..bracket_end].to_string();
            let rest = &target[bracket_end + 1..];
            if let Some(port_str) = rest.strip_prefix(':') {
                let port: u16 = port_str.parse()?;
                return Ok((host, port));
            }
            return Err(anyhow!("No port in IPv6 proxy address: {}", target));
        }
    }
    // Plain host:port (IPv4 or hostname)
    if let Some(pos) = target.rfind(':') {
        let host = target[..pos].to_string();
        let port: u16 = target[pos + 1..].parse()?;
        Ok((host, port))
    } else {
        Err(anyhow!("No port in proxy address: {}", target))
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
