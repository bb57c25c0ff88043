use anyhow::Result;
use octo_client::OctoClient;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let default_level = "info";
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let client = OctoClient::from_env();
    let summary = client.stop_all_running().await?;

    if summary.running == 0 {
        println!("no running profiles");
        return Ok(());
    }
    println!(
        "stopped {} of {} running profile(s)",
        summary.stopped.len(),
        summary.running
    );
    for uuid in &summary.stopped {
        println!("  stopped {uuid}");
    }
    for uuid in &summary.failed {
        println!("  FAILED  {uuid}");
    }
    if !summary.failed.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}
