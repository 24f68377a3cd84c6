use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use loadmeter::config::Config;
use loadmeter::probes::DnsTransport;
use loadmeter::report::{self, JsonLinesSink, ResultSink, TracingSink};
use loadmeter::resources::ResourceSampler;
use loadmeter::suite::{self, FamilyStatus, ProbeTarget, Suite};
use loadmeter::{device, latency, throughput};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "loadmeter",
    about = "Network load generator measuring latency, throughput and failure rate",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $LOADMETER_CONFIG, then /etc/loadmeter/loadmeter.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// JSON output for machine parsing
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every enabled test family and write results to the results directory
    Run {
        /// Override client.results_dir
        #[arg(long)]
        results_dir: Option<PathBuf>,
    },

    /// Send one or more bursts of concurrent probes
    Burst {
        #[arg(long, value_enum, default_value = "http-get")]
        probe: ProbeChoice,

        /// Use the HTTPS port for HTTP probes
        #[arg(long)]
        https: bool,

        /// Burst sizes to run, in order
        #[arg(long, value_delimiter = ',', default_value = "10")]
        sizes: Vec<usize>,
    },

    /// Hold a target request rate for a fixed duration
    Rate {
        #[arg(long, value_enum, default_value = "http-get")]
        probe: ProbeChoice,

        #[arg(long)]
        https: bool,

        /// Target requests per second
        #[arg(long, default_value = "10")]
        rps: f64,

        /// Test duration in seconds
        #[arg(long, default_value = "10")]
        duration: u64,
    },

    /// Bulk download and upload
    Throughput {
        #[arg(long)]
        https: bool,

        /// Run both directions at once instead of one after the other
        #[arg(long)]
        full_duplex: bool,
    },

    /// Average UDP echo round trip
    Ping {
        #[arg(long, default_value = "10")]
        count: u32,
    },

    /// Mean difference between consecutive UDP echo round trips
    Jitter {
        #[arg(long, default_value = "10")]
        count: u32,
    },

    /// Show CPU, memory and OS of this machine
    DeviceInfo,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProbeChoice {
    HttpGet,
    HttpPost,
    DnsUdp,
    DnsTcp,
    UdpEcho,
}

impl ProbeChoice {
    fn target(self, config: &Config, https: bool, path: &str) -> ProbeTarget {
        match self {
            ProbeChoice::HttpGet => ProbeTarget::HttpGet {
                https,
                path: path.to_string(),
            },
            ProbeChoice::HttpPost => ProbeTarget::HttpPost {
                https,
                payload_bytes: config.throughput.chunk_bytes as u64,
            },
            ProbeChoice::DnsUdp => ProbeTarget::Dns(DnsTransport::Udp),
            ProbeChoice::DnsTcp => ProbeTarget::Dns(DnsTransport::Tcp),
            ProbeChoice::UdpEcho => ProbeTarget::UdpEcho,
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, source) = Config::resolve(cli.config.as_deref())?;
    init_tracing(&config);
    tracing::info!(%source, "configuration loaded");

    let sampler = ResourceSampler::sysinfo();

    match cli.command {
        Commands::Run { results_dir } => {
            let dir = results_dir.unwrap_or_else(|| config.client.results_dir.clone());
            let sink = JsonLinesSink::new(
                &dir,
                JsonLinesSink::timestamp_prefix(),
                &config.client.file_postfix,
            )
            .await?;
            let sinks: Vec<Arc<dyn ResultSink>> = vec![Arc::new(sink), Arc::new(TracingSink)];

            let suite = Suite::new(config, sampler, sinks);
            let report = suite.run().await;

            println!("\n=== loadmeter run {} ===", report.run_id);
            println!("{:<20} | Status", "Family");
            println!("{:-<20}-|-{:-<40}", "", "");
            for outcome in &report.outcomes {
                let status = match &outcome.status {
                    FamilyStatus::Completed { records } => format!("OK ({records} records)"),
                    FamilyStatus::Failed { reason } => format!("FAILED: {reason}"),
                };
                println!("{:<20} | {}", outcome.family, status);
            }
            println!("Results written to {}", dir.display());

            if !report.all_passed() {
                anyhow::bail!("{} test families failed", report.failures().count());
            }
        }
        Commands::Burst {
            probe,
            https,
            sizes,
        } => {
            let target = probe.target(&config, https, &config.probes.http_burst_path);
            let probe = suite::build_probe(&config, &target).await?;
            let runner = suite::burst_runner(&config, sampler);

            let mut records = Vec::new();
            for size in sizes {
                let result = runner.run_burst(probe.clone(), size).await?;
                if !cli.json {
                    println!(
                        "burst {:>5}: {:>8.1} ms, {:>5.1}% failed",
                        result.burst_size,
                        result.duration.as_secs_f64() * 1000.0,
                        result.failure_rate * 100.0
                    );
                }
                records.push(report::burst_record(&result));
            }
            if cli.json {
                print_json(&records)?;
            }
        }
        Commands::Rate {
            probe,
            https,
            rps,
            duration,
        } => {
            let target = probe.target(&config, https, &config.probes.http_rate_path);
            let probe = suite::build_probe(&config, &target).await?;
            let controller = suite::rate_controller(&config, sampler);

            let result = controller
                .run_rate(probe, rps, Duration::from_secs(duration))
                .await?;
            if cli.json {
                print_json(&report::rate_record(&result))?;
            } else {
                println!(
                    "target {:.1} rps, achieved {:.1} rps over {:.1} s, {:.1}% failed",
                    result.desired_rps,
                    result.achieved_rps(),
                    result.elapsed.as_secs_f64(),
                    result.failure_rate * 100.0
                );
            }
        }
        Commands::Throughput { https, full_duplex } => {
            let runner = suite::throughput_runner(&config, sampler, https)?;
            let outcome = if full_duplex {
                runner.full_duplex().await
            } else {
                runner.half_duplex().await
            };
            let (rx, tx) = outcome.context("throughput test failed")?;

            if cli.json {
                print_json(&[report::throughput_record(&rx), report::throughput_record(&tx)])?;
            } else {
                println!("{}", throughput::report::format_summary(&rx));
                println!("{}", throughput::report::format_summary(&tx));
            }
        }
        Commands::Ping { count } => {
            let probe = suite::echo_probe(&config).await?;
            let result = latency::ping(&probe, count).await?;
            if cli.json {
                print_json(&report::latency_record(&result))?;
            } else {
                println!(
                    "ping: {:.3} ms average ({} measured, {} lost)",
                    result.average_ms(),
                    result.measured,
                    result.lost
                );
            }
        }
        Commands::Jitter { count } => {
            let probe = suite::echo_probe(&config).await?;
            let result = latency::jitter(&probe, count).await?;
            if cli.json {
                print_json(&report::latency_record(&result))?;
            } else {
                println!(
                    "jitter: {:.3} ms average ({} measured, {} lost)",
                    result.average_ms(),
                    result.measured,
                    result.lost
                );
            }
        }
        Commands::DeviceInfo => {
            let info = device::device_info();
            if cli.json {
                print_json(&info)?;
            } else {
                println!("{}", device::format_device_info(&info));
            }
        }
    }

    Ok(())
}
