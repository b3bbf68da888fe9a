//! Berth - fleet deployment tool
//!
//! Usage:
//!   berth show                     # List slots
//!   berth install BINARY CONFIG    # Install onto free agents
//!   berth upgrade --to-binary 2.0  # Move slots to new versions
//!   berth start|stop|restart       # Drive slot processes
//!   berth agent show               # List agents

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use berth_core::config::load_config;
use berth_core::prelude::*;

#[derive(Parser)]
#[command(name = "berth")]
#[command(about = "Fleet deployment tool", long_about = None)]
struct Cli {
    /// Path to berth.toml (defaults are used when omitted)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show slots matching the filter
    Show(SlotArgs),

    /// Install an assignment on up to COUNT agents
    Install(InstallArgs),

    /// Upgrade matching slots to new versions
    Upgrade(UpgradeArgs),

    /// Start matching slots
    Start(SlotArgs),

    /// Stop matching slots
    Stop(SlotArgs),

    /// Restart matching slots
    Restart(SlotArgs),

    /// Stop matching slots and remove them from their agents
    Terminate(SlotArgs),

    /// Clear the assignment of matching slots
    Reset(SlotArgs),

    /// Agent operations
    Agent(AgentArgs),
}

#[derive(Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    /// Human-readable table
    #[default]
    Table,
    /// Machine-readable JSON
    Json,
    /// Only show failures (non-zero exit if any)
    Quiet,
}

#[derive(Args)]
struct SlotArgs {
    /// Host glob
    #[arg(long = "host", value_name = "GLOB")]
    hosts: Vec<String>,

    /// Slot id prefix or glob
    #[arg(long = "uuid", value_name = "ID")]
    ids: Vec<String>,

    /// Slot state codes (r running, s stopped, u unassigned, ...)
    #[arg(long)]
    state: Option<String>,

    /// Binary coordinate glob
    #[arg(long = "binary", value_name = "GLOB")]
    binaries: Vec<String>,

    /// Config coordinate glob
    #[arg(long = "config-spec", value_name = "GLOB")]
    configs: Vec<String>,

    /// Refuse to run if the fleet changed since this version was read
    #[arg(long)]
    expected_version: Option<String>,
}

impl SlotArgs {
    fn filter(&self) -> Result<SlotFilter> {
        let mut filter = SlotFilter::new();
        for host in &self.hosts {
            filter = filter.host(host)?;
        }
        for id in &self.ids {
            filter = filter.slot_id(id)?;
        }
        if let Some(codes) = &self.state {
            filter = filter.state_codes(codes)?;
        }
        for binary in &self.binaries {
            filter = filter.binary(binary)?;
        }
        for config in &self.configs {
            filter = filter.config(config)?;
        }
        Ok(filter)
    }
}

#[derive(Args)]
struct AgentFilterArgs {
    /// Host glob
    #[arg(long = "host", value_name = "GLOB")]
    hosts: Vec<String>,

    /// Agent state codes (o online, x offline, p provisioning)
    #[arg(long)]
    state: Option<String>,
}

impl AgentFilterArgs {
    fn filter(&self) -> Result<AgentFilter> {
        let mut filter = AgentFilter::new();
        for host in &self.hosts {
            filter = filter.host(host)?;
        }
        if let Some(codes) = &self.state {
            filter = filter.state_codes(codes)?;
        }
        Ok(filter)
    }
}

#[derive(Args)]
struct InstallArgs {
    /// Binary coordinate, e.g. food.fruit:apple:1.0
    binary: String,

    /// Config coordinate, e.g. @prod:apple:1.0
    config_spec: String,

    /// Number of agents to install on
    #[arg(long, default_value_t = 1)]
    count: usize,

    #[command(flatten)]
    agents: AgentFilterArgs,

    /// Refuse to run if the agents changed since this version was read
    #[arg(long)]
    expected_version: Option<String>,
}

#[derive(Args)]
struct UpgradeArgs {
    /// New binary version
    #[arg(long = "to-binary", value_name = "VERSION")]
    binary_version: Option<String>,

    /// New config version
    #[arg(long = "to-config", value_name = "VERSION")]
    config_version: Option<String>,

    #[command(flatten)]
    slots: SlotArgs,
}

#[derive(Args)]
struct AgentArgs {
    #[command(subcommand)]
    command: AgentSubcommand,
}

#[derive(Subcommand)]
enum AgentSubcommand {
    /// List agents
    Show(AgentFilterArgs),

    /// Announce the local agent to a coordinator until interrupted
    Announce {
        /// Coordinator base URI (defaults to agent.coordinator_uri)
        #[arg(long)]
        coordinator: Option<url::Url>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "berth=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let code = run(cli)?;
    std::process::exit(code);
}

// =============================================================================
// Setup
// =============================================================================

/// A coordinator driving the agent that owns this host's slots directory.
struct Local {
    coordinator: Coordinator,
    agent: Arc<Agent>,
    config: BerthConfig,
}

fn local(config_path: Option<&std::path::Path>) -> Result<Local> {
    let config = load_config(config_path)?;
    let repository = Arc::new(
        Repository::from_config(&config.repository).context("Failed to set up repository")?,
    );
    let agent = Arc::new(
        Agent::new(
            config.agent.clone(),
            repository.fetcher().clone(),
            Arc::new(LauncherLifecycleManager::default()),
        )
        .context("Failed to start local agent")?,
    );

    let coordinator = Coordinator::new(repository, &config.coordinator);
    coordinator.add_agent(RemoteAgent::Local(LocalRemoteAgent::new(agent.clone())));

    Ok(Local {
        coordinator,
        agent,
        config,
    })
}

fn run(cli: Cli) -> Result<i32> {
    let local = local(cli.config.as_deref())?;
    let coordinator = &local.coordinator;
    let format = cli.format;

    match cli.command {
        Commands::Show(args) => {
            let listing = coordinator.slots_status(&args.filter()?);
            print_slots(&listing, format)?;
            Ok(0)
        }
        Commands::Install(args) => {
            let assignment = Assignment::parse(&args.binary, &args.config_spec)?;
            let installed = coordinator.install(
                &args.agents.filter()?,
                args.count,
                &assignment,
                args.expected_version.as_deref(),
            )?;
            if installed.is_empty() {
                tracing::warn!("no agent could take {}", assignment);
            }
            print_report(
                &FleetReport {
                    succeeded: installed,
                    failed: Vec::new(),
                },
                coordinator,
                format,
            )
        }
        Commands::Upgrade(args) => {
            let versions = UpgradeVersions::new(args.binary_version, args.config_version);
            let report = coordinator.upgrade(
                &args.slots.filter()?,
                &versions,
                args.slots.expected_version.as_deref(),
            )?;
            print_report(&report, coordinator, format)
        }
        Commands::Start(args) => {
            let report = coordinator.set_state(
                SlotLifecycleState::Running,
                &args.filter()?,
                args.expected_version.as_deref(),
            )?;
            print_report(&report, coordinator, format)
        }
        Commands::Stop(args) => {
            let report = coordinator.set_state(
                SlotLifecycleState::Stopped,
                &args.filter()?,
                args.expected_version.as_deref(),
            )?;
            print_report(&report, coordinator, format)
        }
        Commands::Restart(args) => {
            let report = coordinator.restart(&args.filter()?, args.expected_version.as_deref())?;
            print_report(&report, coordinator, format)
        }
        Commands::Terminate(args) => {
            let report =
                coordinator.terminate(&args.filter()?, args.expected_version.as_deref())?;
            print_report(&report, coordinator, format)
        }
        Commands::Reset(args) => {
            let report = coordinator.reset(&args.filter()?, args.expected_version.as_deref())?;
            print_report(&report, coordinator, format)
        }
        Commands::Agent(AgentArgs {
            command: AgentSubcommand::Show(args),
        }) => {
            let listing = coordinator.agents_status(&args.filter()?);
            print_agents(&listing, format)?;
            Ok(0)
        }
        Commands::Agent(AgentArgs {
            command: AgentSubcommand::Announce { coordinator: uri },
        }) => {
            let uri = uri
                .or_else(|| local.config.agent.coordinator_uri.clone())
                .context("No coordinator URI given and agent.coordinator_uri is not set")?;
            let _announcer = Announcer::start(
                local.agent.clone(),
                uri.clone(),
                local.config.coordinator.announce_interval(),
                local.config.coordinator.agent_timeout(),
            )?;
            println!("Announcing agent {} to {}", local.agent.agent_id(), uri);
            loop {
                std::thread::park();
            }
        }
    }
}

// =============================================================================
// Output
// =============================================================================

fn print_slots(listing: &Listing<FleetSlot>, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(listing)?),
        OutputFormat::Quiet => {}
        OutputFormat::Table => {
            println!(
                "  {:<10} {:<12} {:<10} {:<28} Config",
                "Id", "Host", "State", "Binary"
            );
            println!("  {}", "-".repeat(80));
            for slot in &listing.items {
                let status = &slot.status;
                let (binary, config) = match &status.assignment {
                    Some(a) => (a.binary.to_string(), a.config.to_string()),
                    None => ("-".to_string(), "-".to_string()),
                };
                println!(
                    "  {:<10} {:<12} {:<10} {:<28} {}",
                    short_id(&status.id.to_string(), listing.prefix_len),
                    truncate(slot.host.as_deref().unwrap_or("-"), 12),
                    status.state,
                    truncate(&binary, 28),
                    config
                );
            }
            println!();
            println!("Version: {}", listing.version);
        }
    }
    Ok(())
}

fn print_agents(listing: &Listing<AgentStatus>, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(listing)?),
        OutputFormat::Quiet => {}
        OutputFormat::Table => {
            println!(
                "  {:<14} {:<14} {:<6} {:<24} Resources",
                "Id", "State", "Slots", "Location"
            );
            println!("  {}", "-".repeat(80));
            for agent in &listing.items {
                let resources = agent
                    .available_resources()
                    .iter()
                    .map(|(name, left)| {
                        let total = agent.resources.get(name).copied().unwrap_or(*left);
                        format!("{}={}/{}", name, left, total)
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                println!(
                    "  {:<14} {:<14} {:<6} {:<24} {}",
                    short_id(&agent.agent_id, listing.prefix_len),
                    agent.state,
                    agent.slots.len(),
                    truncate(&agent.location, 24),
                    resources
                );
            }
            println!();
            println!("Version: {}", listing.version);
        }
    }
    Ok(())
}

/// Print a fleet command's outcome. Exits non-zero when any slot failed.
fn print_report(report: &FleetReport, coordinator: &Coordinator, format: OutputFormat) -> Result<i32> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Quiet => {
            for failure in &report.failed {
                println!("{} ({}): {}", failure.slot_name, failure.slot_id, failure.error);
            }
        }
        OutputFormat::Table => {
            for slot in &report.succeeded {
                println!("[OK]   {} {} {}", slot.id, slot.name, slot.state);
            }
            for failure in &report.failed {
                println!("[FAIL] {} {} {}", failure.slot_id, failure.slot_name, failure.error);
            }
            println!();
            println!(
                "Summary: {} succeeded, {} failed",
                report.succeeded.len(),
                report.failed.len()
            );
        }
    }

    coordinator.push_service_inventory();
    Ok(if report.is_success() { 0 } else { 1 })
}

// =============================================================================
// Helpers
// =============================================================================

fn short_id(id: &str, prefix_len: usize) -> String {
    id.chars().take(prefix_len).collect()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_strings() {
        assert_eq!(truncate("apple", 10), "apple");
        assert_eq!(truncate("food.fruit:apple:1.0", 10), "food.fr...");
    }

    #[test]
    fn slot_args_build_filters() {
        let cli = Cli::try_parse_from(["berth", "start", "--host", "*.example.com", "--state", "s"])
            .expect("arguments should parse");
        let Commands::Start(args) = cli.command else {
            panic!("expected start");
        };
        assert!(!args.filter().expect("filter should build").is_empty());
    }

    #[test]
    fn bad_state_code_is_rejected() {
        let cli = Cli::try_parse_from(["berth", "show", "--state", "q"])
            .expect("arguments should parse");
        let Commands::Show(args) = cli.command else {
            panic!("expected show");
        };
        assert!(args.filter().is_err());
    }
}
