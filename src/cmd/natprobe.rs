use clap::Parser;
use natprobe::bridge;
use natprobe::config::{self, ProbeConfig};
use natprobe::netif;
use natprobe::probe::NatType;
use natprobe::session::{self, SessionError};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// NAT type discovery probe
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Print the result as a JSON object
    #[arg(long)]
    pub json: bool,

    /// STUN server to use instead of the built-in list (e.g., stun.example.net)
    #[arg(long)]
    pub stun_host: Option<String>,

    /// Port for STUN servers given without an explicit one
    #[arg(long)]
    pub stun_port: Option<u16>,

    /// Source IP to test (defaults to the outbound address)
    #[arg(long)]
    pub source_ip: Option<String>,

    /// Local source port for the probe socket
    #[arg(long)]
    pub source_port: Option<u16>,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    pub config: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let default_level = if args.json {
        LevelFilter::ERROR
    } else {
        LevelFilter::INFO
    };
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(default_level.into())
                    .from_env_lossy(),
            )
            .with_line_number(true)
            .with_file(true)
            .finish(),
    )
    .unwrap();

    let mut config = match args.config.as_deref() {
        Some(path) => match config::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to load config {}: {}", path, e);
                return;
            }
        },
        None => ProbeConfig::default(),
    };
    if let Some(port) = args.stun_port {
        config.stun_port = port;
    }
    if let Some(port) = args.source_port {
        config.source_port = port;
    }

    let outbound = bridge::get_defaul_outbound_ip();
    if outbound == "0.0.0.0" {
        tracing::error!("No route to the public internet, cannot pick a source address");
        return;
    }

    let source_ip = match args.source_ip {
        Some(ip) => ip,
        None if config.source_ip != "0.0.0.0" => config.source_ip.clone(),
        None => outbound.clone(),
    };

    if !args.json {
        println!("Default Outbound IP: {}", outbound);
        println!("Tested Source IP: {}", source_ip);
        println!("- Discovering NAT type (it may take 5 to 60 seconds) ...");
    }

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc2::set_handler(move || {
        handler_token.cancel();
        true
    }) {
        tracing::warn!("Failed to install interrupt handler: {}", e);
    }

    let report = match session::run_test(&config, &source_ip, args.stun_host.as_deref(), cancel).await
    {
        Ok(report) => report,
        Err(SessionError::Cancelled) => {
            tracing::info!("Discovery cancelled");
            return;
        }
        Err(e) => {
            tracing::error!("Discovery rejected: {}", e);
            return;
        }
    };

    if args.json {
        let out = serde_json::json!({
            "type": report.verdict,
            "external_ip": report.external_ip.map(|ip| ip.to_string()).unwrap_or_default(),
            "external_port": report.external_port.unwrap_or(0),
        });
        println!("{}", out);
    } else {
        println!("\tNAT Type: {}", report.verdict);
        println!("\tDescription: {}", report.verdict.description());
        println!(
            "\tExternal IP: {}",
            report.external_ip.map(|ip| ip.to_string()).unwrap_or_default()
        );
        println!("\tExternal Port: {}", report.external_port.unwrap_or(0));
        if let Some(fault) = &report.fault {
            println!("\tFault: {}", fault);
        }
        if report.verdict == NatType::Blocked {
            // STUN got nothing through, an HTTPS echo can still recover
            // the external address (never the NAT type).
            if let Some(addr) = netif::public_ip_via_https() {
                println!("\tExternal IP (via HTTPS): {}", addr);
            }
        }
    }
}
