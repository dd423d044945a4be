use clap::Parser;
use selfheal::healing::{
    Collaborators, DryRunEffector, HealingOrchestrator, StaticProbe, SystemClock, TracingAlertSink,
};
use selfheal::scenario::{self, Scenario};
use selfheal::{HealingConfig, StaticMetricsSource, SystemMetrics};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "selfheal")]
#[command(about = "Self-healing orchestration core - replay scenarios against a dry-run effector", long_about = None)]
struct Args {
    /// TOML configuration file (falls back to SELFHEAL_CONFIG, then defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON scenario to replay
    #[arg(short, long)]
    scenario: Option<PathBuf>,

    /// Run a learning epoch after the replay
    #[arg(long)]
    learn: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "selfheal=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config_path = args
        .config
        .or_else(|| std::env::var_os("SELFHEAL_CONFIG").map(PathBuf::from));
    let config = match config_path {
        Some(path) => {
            tracing::info!("Loading configuration from {}", path.display());
            HealingConfig::load(&path)?
        }
        None => HealingConfig::default(),
    };

    if args.print_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let Some(scenario_path) = args.scenario else {
        anyhow::bail!("nothing to do: pass --scenario <file> or --print-config");
    };
    let scenario = Scenario::load(&scenario_path)?;
    tracing::info!(
        "Replaying {} snapshots and {} failures from {}",
        scenario.metrics.len(),
        scenario.failures.len(),
        scenario_path.display()
    );

    let probe = Arc::new(StaticProbe::new());
    scenario.seed(&probe);
    let baseline = scenario
        .metrics
        .first()
        .cloned()
        .unwrap_or_else(|| SystemMetrics::at(chrono::Utc::now()));

    let orchestrator = HealingOrchestrator::new(
        config,
        Collaborators {
            effector: Arc::new(DryRunEffector),
            probe,
            metrics: Arc::new(StaticMetricsSource::new(baseline)),
            alerts: Arc::new(TracingAlertSink),
            clock: Arc::new(SystemClock),
            history: None,
        },
    );

    for record in scenario::replay(&orchestrator, &scenario, args.learn).await? {
        println!("{}", record.to_json_line()?);
    }

    Ok(())
}
