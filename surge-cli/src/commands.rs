//! CLI command implementations

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Subcommand;
use surge_core::config::SurgeConfig;
use surge_core::engine::{SpeedTestHandle, StartOutcome, spawn_speed_test_engine};
use surge_core::network::{HttpTransport, Transport};
use surge_core::{SessionSnapshot, TestStatus};

const REFRESH: Duration = Duration::from_millis(250);

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Measure against a speed test server
    Run {
        /// Base URL of the server; defaults to SURGE_SERVER_URL or localhost
        #[arg(short, long)]
        server: Option<String>,
        /// JSON object of setting overrides, e.g. '{"time_dl": 5}'
        #[arg(long)]
        settings: Option<String>,
    },
    /// Measure a simulated link without touching the network
    Simulate {
        /// Simulated download rate
        #[arg(long, default_value = "100")]
        download_mbps: f64,
        /// Simulated upload rate
        #[arg(long, default_value = "20")]
        upload_mbps: f64,
        /// One-way latency in milliseconds
        #[arg(long, default_value = "20")]
        latency_ms: u64,
        /// JSON object of setting overrides
        #[arg(long)]
        settings: Option<String>,
    },
    /// Start the web server with the API and measurement backend
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
        /// Port to bind to
        #[arg(short, long)]
        port: Option<u16>,
        /// Drive API sessions over a simulated link
        #[arg(long)]
        simulate: bool,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    let mut config = SurgeConfig::from_env();

    match command {
        Commands::Run { server, settings } => {
            if let Some(server) = server {
                config.server.base_url = server;
            }
            let transport = HttpTransport::new(&config.server)
                .with_context(|| format!("invalid server URL {}", config.server.base_url))?;
            println!("Testing against {}", transport.base_url());
            run_session(config, Arc::new(transport), settings.as_deref()).await
        }
        Commands::Simulate {
            download_mbps,
            upload_mbps,
            latency_ms,
            settings,
        } => {
            config.simulation.download_mbps = download_mbps;
            config.simulation.upload_mbps = upload_mbps;
            config.simulation.latency_ms = latency_ms;
            println!(
                "Simulating {download_mbps} Mbps down, {upload_mbps} Mbps up, {latency_ms} ms latency"
            );
            let transport = config.simulation.transport();
            run_session(config, Arc::new(transport), settings.as_deref()).await
        }
        Commands::Serve {
            host,
            port,
            simulate,
        } => {
            if let Some(host) = host {
                config.web.host = host;
            }
            if let Some(port) = port {
                config.web.port = port;
            }
            let engine = if simulate || config.simulation.enabled {
                let transport = config.simulation.transport();
                spawn_speed_test_engine(config.clone(), Arc::new(transport))
            } else {
                let transport = HttpTransport::new(&config.server)?;
                spawn_speed_test_engine(config.clone(), Arc::new(transport))
            };
            println!("Surge listening on http://{}", config.web.bind_address());
            surge_web::run_server(&config, engine).await?;
            Ok(())
        }
    }
}

/// Runs one session to the end, printing live progress. Ctrl-C aborts.
async fn run_session<T>(
    config: SurgeConfig,
    transport: Arc<T>,
    settings: Option<&str>,
) -> anyhow::Result<()>
where
    T: Transport + 'static,
{
    let handle = spawn_speed_test_engine(config, transport);
    let outcome = handle.start(settings).await?;
    tracing::debug!("Session outcome: {:?}", outcome);
    if let StartOutcome::AlreadyRunning { .. } = outcome {
        anyhow::bail!("a session is already running");
    }

    let mut ticker = tokio::time::interval(REFRESH);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let snapshot = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                handle.abort().await?;
                break handle.status();
            }
            _ = ticker.tick() => {
                let snapshot = handle.status();
                if !snapshot.status.is_active() {
                    break snapshot;
                }
                print_progress(&snapshot);
            }
        }
    };

    println!();
    print_summary(&snapshot);
    if has_warnings(&handle) {
        println!("Warnings were logged; see logs/surge-last-run.log for details.");
    }
    handle.shutdown().await?;

    if snapshot.status == TestStatus::Aborted {
        anyhow::bail!("speed test aborted");
    }
    Ok(())
}

fn print_progress(snapshot: &SessionSnapshot) {
    let progress = match snapshot.status {
        TestStatus::Download => snapshot.download_progress,
        TestStatus::Upload => snapshot.upload_progress,
        TestStatus::Ping => snapshot.ping_progress,
        _ => 0.0,
    };
    print!(
        "\r{:<9} [{:>3.0}%]  down {:>8}  up {:>8}  ping {:>7}  jitter {:>7}",
        snapshot.status_name,
        progress.clamp(0.0, 1.0) * 100.0,
        snapshot.download.to_string(),
        snapshot.upload.to_string(),
        snapshot.ping.to_string(),
        snapshot.jitter.to_string(),
    );
    let _ = std::io::stdout().flush();
}

fn print_summary(snapshot: &SessionSnapshot) {
    println!("Speed Test Result ({})", snapshot.status_name);
    println!("{:-<40}", "");
    if !snapshot.client_ip.is_empty() {
        println!("Client:   {}", snapshot.client_ip);
    }
    println!("Download: {} Mbps", or_dash(&snapshot.download.to_string()));
    println!("Upload:   {} Mbps", or_dash(&snapshot.upload.to_string()));
    println!("Ping:     {} ms", or_dash(&snapshot.ping.to_string()));
    println!("Jitter:   {} ms", or_dash(&snapshot.jitter.to_string()));
    println!("Test id:  {}", snapshot.test_id);
}

fn or_dash(value: &str) -> &str {
    if value.is_empty() { "-" } else { value }
}

fn has_warnings(handle: &SpeedTestHandle) -> bool {
    handle
        .diagnostic_log()
        .lines()
        .any(|line| line.contains(" WARN: "))
}
