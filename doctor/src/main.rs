use anyhow::Result;
use octo_client::HealthVerdict;
use octo_client::OctoClient;
use octo_client::OctoConfig;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let default_level = "warn";
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let mut config = OctoConfig::from_env();
    // the doctor should answer in seconds, so probes are short and unretried
    config.request_timeout_ms = 5_000;
    config.max_retries = 0;
    let client = OctoClient::new(config);

    let report = client.diagnose().await;

    match &report.local_api {
        Some(path) => println!("local API:   reachable via {path}"),
        None => println!("local API:   UNREACHABLE"),
    }
    println!(
        "cloud API:   {}",
        if report.cloud_api {
            "reachable"
        } else {
            "UNREACHABLE"
        }
    );
    if report.live_debug_ports.is_empty() {
        println!("debug ports: none live");
    } else {
        let ports: Vec<String> = report
            .live_debug_ports
            .iter()
            .map(|port| port.to_string())
            .collect();
        println!("debug ports: {}", ports.join(", "));
    }
    match report.verdict() {
        HealthVerdict::Healthy => println!("verdict:     healthy"),
        HealthVerdict::CloudUnreachable => {
            println!("verdict:     cloud API unreachable; check the network and the token");
        }
        HealthVerdict::LocalUnreachable => {
            println!("verdict:     local API unreachable; is the desktop app running?");
        }
    }

    std::process::exit(report.exit_code());
}
