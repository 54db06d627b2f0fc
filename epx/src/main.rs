use std::{sync::Arc, time::Duration, time::SystemTime};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use endpoint_failover::{ConnectionManager, Endpoint, HttpProbe, PollType, TimingMode};
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(
    name = "epx",
    version,
    about = "Health-check a set of endpoints and follow failover between them"
)]
#[command(after_help = r#"EXAMPLES:
    # Check two prioritized nodes and a local fallback once
    epx -e node1.example.com:18081,2 -e node2.example.com:18081,1 -e localhost:18081 check

    # Keep polling and print every change of the current endpoint
    epx -e node1.example.com:18081 -e node2.example.com:18081 --period 10s watch
"#)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// An endpoint as ADDRESS or ADDRESS,PRIORITY (can be repeated). Priority 0, the default,
    /// ranks below every positive priority.
    #[arg(short, long = "endpoint", value_parser = parse_endpoint, required = true)]
    endpoints: Vec<EndpointArg>,

    /// Probe timeout.
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration, global = true)]
    timeout: Duration,

    /// Polling period of `watch`.
    #[arg(long, default_value = "20s", value_parser = humantime::parse_duration, global = true)]
    period: Duration,

    /// Username sent to every endpoint.
    #[arg(long, global = true)]
    username: Option<String>,

    /// Password sent to every endpoint.
    #[arg(long, env = "EPX_PASSWORD", global = true)]
    password: Option<String>,

    /// HTTP proxy used for every endpoint.
    #[arg(long, global = true)]
    proxy: Option<String>,

    /// Path of the JSON-RPC handler.
    #[arg(long, default_value = "/json_rpc", global = true)]
    path: String,

    /// Side-effect free JSON-RPC method used as probe.
    #[arg(long, default_value = "get_version", global = true)]
    method: String,

    /// Keep the current endpoint even when a better one is available.
    #[arg(long, global = true)]
    no_auto_switch: bool,

    /// Which endpoints a polling cycle probes.
    #[arg(long, value_enum, default_value_t = PollTypeArg::All, global = true)]
    poll_type: PollTypeArg,

    /// Start polling cycles a period apart instead of waiting a period after each cycle.
    #[arg(long, global = true)]
    fixed_rate: bool,

    /// Print JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only print errors.
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Probes every endpoint once and reports their status. Fails if none is usable.
    Check,

    /// Polls the endpoints and prints every change of the current endpoint until interrupted.
    Watch,
}

#[derive(Clone, Copy, ValueEnum)]
enum PollTypeArg {
    Prioritized,
    Current,
    All,
}

impl From<PollTypeArg> for PollType {
    fn from(arg: PollTypeArg) -> Self {
        match arg {
            PollTypeArg::Prioritized => PollType::Prioritized,
            PollTypeArg::Current => PollType::Current,
            PollTypeArg::All => PollType::All,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct EndpointArg {
    address: String,
    priority: u32,
}

fn parse_endpoint(value: &str) -> Result<EndpointArg, String> {
    let (address, priority) = match value.rsplit_once(',') {
        Some((address, priority)) => {
            let priority = priority
                .trim()
                .parse()
                .map_err(|e| format!("invalid priority {priority:?}: {e}"))?;
            (address.trim(), priority)
        }
        None => (value.trim(), 0),
    };
    if address.is_empty() {
        return Err("the address can't be empty".to_string());
    }
    Ok(EndpointArg {
        address: address.to_string(),
        priority,
    })
}

#[derive(Serialize)]
struct EndpointReport {
    address: String,
    priority: u32,
    current: bool,
    online: Option<bool>,
    authenticated: Option<bool>,
    latency_ms: Option<u128>,
}

impl EndpointReport {
    fn new(endpoint: &Endpoint, current: bool) -> Self {
        Self {
            address: endpoint.address().to_string(),
            priority: endpoint.priority(),
            current,
            online: endpoint.is_online(),
            authenticated: endpoint.is_authenticated(),
            latency_ms: endpoint.last_response_time().map(|d| d.as_millis()),
        }
    }
}

fn tri_state(value: Option<bool>) -> &'static str {
    match value {
        Some(true) => "yes",
        Some(false) => "no",
        None => "?",
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => Level::ERROR,
        (false, 0) => Level::WARN,
        (false, 1) => Level::INFO,
        (false, 2) => Level::DEBUG,
        (false, _) => Level::TRACE,
    };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn build_manager(cli: &Cli) -> Result<ConnectionManager> {
    if cli.username.is_some() != cli.password.is_some() {
        bail!("--username and --password must be given together");
    }
    let mut builder = ConnectionManager::builder(
        HttpProbe::new()
            .with_path(cli.path.clone())
            .with_method(cli.method.clone()),
    )
    .with_auto_switch(!cli.no_auto_switch)
    .with_timeout(cli.timeout)
    .with_poll_period(cli.period)
    .with_poll_type(cli.poll_type.into())
    .with_timing_mode(if cli.fixed_rate {
        TimingMode::FixedRate
    } else {
        TimingMode::FixedDelay
    });

    for arg in &cli.endpoints {
        let mut endpoint = Endpoint::new(arg.address.clone()).with_priority(arg.priority);
        if let (Some(username), Some(password)) = (&cli.username, &cli.password) {
            endpoint = endpoint.with_credentials(username.clone(), password.clone());
        }
        if let Some(proxy) = &cli.proxy {
            endpoint = endpoint.with_proxy(proxy.clone());
        }
        HttpProbe::validate_endpoint(&endpoint)
            .with_context(|| format!("Invalid endpoint {}", arg.address))?;
        builder = builder.with_endpoint(endpoint);
    }
    builder.build().context("Failed to set up the connection manager")
}

fn print_report(manager: &ConnectionManager, json: bool) -> Result<()> {
    let current = manager.current();
    let reports: Vec<_> = manager
        .connections()
        .iter()
        .map(|endpoint| {
            let is_current = current
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, endpoint));
            EndpointReport::new(endpoint, is_current)
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }
    println!(
        "  {:<40} {:>8} {:>6} {:>6} {:>10}",
        "ADDRESS", "PRIORITY", "ONLINE", "AUTH", "LATENCY"
    );
    for report in &reports {
        let latency = report
            .latency_ms
            .map(|ms| format!("{ms}ms"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{} {:<40} {:>8} {:>6} {:>6} {:>10}",
            if report.current { "*" } else { " " },
            report.address,
            report.priority,
            tri_state(report.online),
            tri_state(report.authenticated),
            latency
        );
    }
    Ok(())
}

fn print_change(endpoint: Option<&Arc<Endpoint>>, json: bool) {
    let at = humantime::format_rfc3339_seconds(SystemTime::now());
    if json {
        let line = serde_json::json!({
            "at": at.to_string(),
            "current": endpoint.map(|e| EndpointReport::new(e, true)),
        });
        println!("{line}");
        return;
    }
    match endpoint {
        Some(endpoint) => println!(
            "{at} current: {} (online: {}, authenticated: {})",
            endpoint.address(),
            tri_state(endpoint.is_online()),
            tri_state(endpoint.is_authenticated()),
        ),
        None => println!("{at} current: none"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    let manager = build_manager(&cli)?;

    match cli.command {
        Command::Check => {
            manager.check_all().await;
            print_report(&manager, cli.json)?;
            if !manager.is_connected() {
                bail!("None of the {} endpoints is usable", cli.endpoints.len());
            }
        }
        Command::Watch => {
            let json = cli.json;
            manager.add_listener(Arc::new(move |endpoint: Option<&Arc<Endpoint>>| {
                print_change(endpoint, json)
            }));
            manager.start_polling()?;
            info!(
                "Polling {} endpoints every {}",
                cli.endpoints.len(),
                humantime::format_duration(cli.period)
            );
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for ctrl-c")?;
            manager.stop_polling();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::Parser;

    use super::{parse_endpoint, Cli, Command, EndpointArg};

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(
            parse_endpoint("localhost:18081").unwrap(),
            EndpointArg {
                address: "localhost:18081".to_string(),
                priority: 0
            }
        );
        assert_eq!(
            parse_endpoint("http://node.example.com:18081, 3").unwrap(),
            EndpointArg {
                address: "http://node.example.com:18081".to_string(),
                priority: 3
            }
        );
        assert!(parse_endpoint("localhost,-1").is_err());
        assert!(parse_endpoint(",2").is_err());
    }

    #[test]
    fn test_cli_arguments() {
        let cli = Cli::try_parse_from([
            "epx",
            "-e",
            "a.localhost,2",
            "--endpoint",
            "b.localhost",
            "--timeout",
            "250ms",
            "watch",
            "--period",
            "1m",
            "--poll-type",
            "prioritized",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Watch));
        assert_eq!(cli.endpoints.len(), 2);
        assert_eq!(cli.timeout, Duration::from_millis(250));
        assert_eq!(cli.period, Duration::from_secs(60));

        let manager = super::build_manager(&cli).unwrap();
        assert_eq!(manager.endpoints().len(), 2);
        assert_eq!(manager.endpoint("a.localhost").unwrap().priority(), 2);
    }

    #[test]
    fn test_cli_rejects_unsupported_proxy() {
        let cli = Cli::try_parse_from([
            "epx",
            "-e",
            "a.localhost",
            "--proxy",
            "socks5://127.0.0.1:9050",
            "check",
        ])
        .unwrap();
        assert!(super::build_manager(&cli).is_err());
    }

    #[test]
    fn test_cli_requires_an_endpoint() {
        assert!(Cli::try_parse_from(["epx", "check"]).is_err());
    }
}
