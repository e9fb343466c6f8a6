//! NAT discovery example
//!
//! Runs the full NAT classification flow and prints what the result
//! means for peer-to-peer traffic.
//!
//! Usage:
//! ```bash
//! cargo run --example nat_discover
//! cargo run --example nat_discover -- --stun-host stun.example.net
//! ```

use natprobe::bridge;
use natprobe::config::ProbeConfig;
use natprobe::probe::NatType;
use natprobe::session;
use tokio_util::sync::CancellationToken;

#[derive(clap::Parser, Debug)]
#[command(name = "nat_discover")]
#[command(about = "Classify the local NAT with STUN probes", long_about = None)]
struct Args {
    /// Custom STUN server to anchor the probes
    #[arg(short, long)]
    stun_host: Option<String>,

    /// Source IP to test (defaults to the outbound address)
    #[arg(long)]
    source_ip: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    use clap::Parser;
    let args = Args::parse();

    // Setup logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    println!("🔍 NAT Discovery");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let source_ip = args
        .source_ip
        .unwrap_or_else(bridge::get_defaul_outbound_ip);
    println!("🔌 Source IP: {}", source_ip);
    println!();

    println!("⏳ Classifying NAT behavior...");
    let config = ProbeConfig::default();
    let result = session::run_test(
        &config,
        &source_ip,
        args.stun_host.as_deref(),
        CancellationToken::new(),
    )
    .await;

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            eprintln!("❌ Discovery rejected: {}", e);
            std::process::exit(1);
        }
    };

    println!("✅ Classification finished!\n");

    println!("📍 Results:");
    println!("   NAT Type:      {}", report.verdict);
    println!("   Description:   {}", report.verdict.description());
    println!(
        "   External IP:   {}",
        report
            .external_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    );
    println!(
        "   External Port: {}",
        report
            .external_port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    );
    println!("   Result String: {}", bridge::result_string(&report));
    println!();

    println!("💡 Recommendations:");
    match report.verdict {
        NatType::OpenInternet => {
            println!("   ✓ Your device is directly on the public internet");
            println!("   ✓ P2P connections should work perfectly");
        }
        NatType::FullCone => {
            println!("   ✓ Very P2P-friendly mapping");
            println!("   ✓ Direct connections should work with most peers");
        }
        NatType::RestrictedCone | NatType::PortRestrictedCone => {
            println!("   ~ Moderate P2P support");
            println!("   ~ Direct connections may require hole punching");
        }
        NatType::Symmetric => {
            println!("   ⚠ Challenging for P2P, mappings change per destination");
            println!("   ⚠ Strongly recommend relay fallback");
        }
        NatType::SymmetricUDPFirewall => {
            println!("   ⚠ No NAT, but inbound UDP is filtered");
            println!("   ⚠ Peers cannot initiate connections to you");
        }
        NatType::Blocked => {
            println!("   ❌ UDP seems blocked, nothing answered");
            println!("   ❌ Check connectivity and firewall rules");
        }
        NatType::Unknown => {
            println!("   ? Unable to determine NAT type precisely");
            println!("   ? Recommend testing with actual peers");
        }
    }
}
