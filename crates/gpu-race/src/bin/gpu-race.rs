//! gpu-race CLI - race GPU offers and keep the first instance that boots.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dialoguer::{theme::ColorfulTheme, Confirm};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gpu_race::providers::latitude::Latitude;
use gpu_race::providers::{CreateOptions, OfferFilter, OfferSearch, ProvisioningApi};
use gpu_race::{
    Candidate, CandidateId, CandidateStatus, RaceConfig, RaceEvent, RaceOrchestrator,
    RaceOutcome, RaceSession, RoundController, TaskSettings,
};

/// gpu-race - Provision GPU instances by racing several offers at once.
#[derive(Parser)]
#[command(name = "gpu-race")]
#[command(about = "Race GPU offers and keep the first instance that becomes ready")]
struct Cli {
    #[command(flatten)]
    credentials: CredentialArgs,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Latitude credentials, with 1Password as the fallback source.
#[derive(Args, Clone, Default)]
struct CredentialArgs {
    /// Latitude.sh API key.
    #[arg(long, env = "LATITUDE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Latitude.sh project ID.
    #[arg(long, env = "LATITUDE_PROJECT_ID")]
    project_id: Option<String>,

    /// 1Password vault holding the credentials item.
    #[arg(long, env = "OP_VAULT")]
    op_vault: Option<String>,

    /// 1Password item holding the credentials.
    #[arg(long, env = "OP_LATITUDE_ITEM", default_value = "Latitude.sh API")]
    op_item: String,

    /// Field of the item holding the API key.
    #[arg(long, env = "OP_LATITUDE_API_KEY_FIELD", default_value = "credential")]
    op_api_key_field: String,

    /// Field of the item holding the project ID.
    #[arg(long, env = "OP_LATITUDE_PROJECT_ID_FIELD", default_value = "Project ID")]
    op_project_id_field: String,
}

/// Offer filter flags shared by `offers` and `race`.
#[derive(Args, Clone)]
struct FilterArgs {
    /// GPU model substring (e.g., h100, l40s).
    #[arg(long)]
    gpu: Option<String>,

    /// Minimum GPU memory in GB.
    #[arg(long)]
    min_vram: Option<u32>,

    /// Maximum hourly price in USD.
    #[arg(long)]
    max_price: Option<f64>,

    /// Region/site.
    #[arg(long)]
    region: Option<String>,

    /// Minimum reliability score (0.0 - 1.0).
    #[arg(long)]
    min_reliability: Option<f64>,
}

impl From<FilterArgs> for OfferFilter {
    fn from(args: FilterArgs) -> Self {
        Self {
            gpu_model: args.gpu,
            min_vram_gb: args.min_vram,
            max_price_per_hour: args.max_price,
            region: args.region,
            min_reliability: args.min_reliability,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List GPU offers matching a filter.
    Offers {
        #[command(flatten)]
        filter: FilterArgs,

        /// Print offers as JSON.
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Race several offers and keep the first ready instance.
    Race {
        #[command(flatten)]
        filter: FilterArgs,

        /// TOML config file.
        #[arg(long, env = "GPU_RACE_CONFIG")]
        config: Option<PathBuf>,

        /// Offers raced per round.
        #[arg(long)]
        candidates: Option<usize>,

        /// Rounds before giving up.
        #[arg(long)]
        max_rounds: Option<u32>,

        /// Instance name prefix.
        #[arg(long, default_value = "gpu-race")]
        name_prefix: String,

        /// SSH key IDs (comma-separated).
        #[arg(long, value_delimiter = ',')]
        ssh_keys: Vec<String>,

        /// Accept the first winner without prompting.
        #[arg(long, short = 'y', default_value = "false")]
        yes: bool,

        /// Print race events as JSON lines instead of progress bars.
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Destroy an instance.
    Destroy {
        /// Instance ID.
        #[arg(long)]
        id: String,

        /// Skip confirmation prompt.
        #[arg(long, short = 'y', default_value = "false")]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging; stdout is reserved for results
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let creds = &cli.credentials;
    let (api_key, project_id) = resolve_credentials(creds, &OnePassword::from_args(creds))?;
    let provider = Arc::new(
        Latitude::new(&api_key, &project_id).context("Failed to create Latitude provider")?,
    );

    match cli.command {
        Commands::Offers { filter, json } => list_offers(&provider, filter.into(), json).await,
        Commands::Race {
            filter,
            config,
            candidates,
            max_rounds,
            name_prefix,
            ssh_keys,
            yes,
            json,
        } => {
            let mut race_config =
                RaceConfig::load(config.as_deref()).context("Failed to load race config")?;
            if let Some(n) = candidates {
                race_config.candidates_per_round = n;
            }
            if let Some(n) = max_rounds {
                race_config.max_rounds = n;
            }
            race_config.validate()?;

            let options = CreateOptions {
                name_prefix,
                ssh_keys,
                failover: None,
            };
            run_race(provider, &race_config, options, filter.into(), yes, json).await
        }
        Commands::Destroy { id, yes } => {
            let confirmed = yes
                || Confirm::with_theme(&ColorfulTheme::default())
                    .with_prompt(format!("Destroy instance {id}? This cannot be undone"))
                    .default(false)
                    .interact()?;
            if !confirmed {
                println!("Aborted.");
                return Ok(());
            }
            provider
                .destroy_instance(&id)
                .await
                .with_context(|| format!("Failed to destroy instance {id}"))?;
            println!("\n✅ Instance {id} destroyed");
            Ok(())
        }
    }
}

async fn list_offers(provider: &Latitude, filter: OfferFilter, json: bool) -> Result<()> {
    let offers = provider.search(&filter, &[]).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&offers)?);
        return Ok(());
    }

    println!(
        "\n{:<28} {:<14} {:>6} {:>9} {:<8} {:>7}",
        "OFFER", "GPU", "VRAM", "$/HR", "REGION", "RELIAB"
    );
    println!("{}", "-".repeat(78));
    for offer in &offers {
        let stock_emoji = match offer.reliability {
            r if r >= 0.9 => "🟢",
            r if r >= 0.7 => "🟡",
            _ => "🟠",
        };
        println!(
            "{:<28} {:<14} {:>4}GB {:>9.2} {:<8} {} {:>4.0}%",
            offer.id,
            offer.gpu_model,
            offer.vram_gb,
            offer.price_per_hour,
            offer.region,
            stock_emoji,
            offer.reliability * 100.0
        );
    }
    println!("\n{} offer(s)", offers.len());
    Ok(())
}

async fn run_race(
    provider: Arc<Latitude>,
    config: &RaceConfig,
    options: CreateOptions,
    filter: OfferFilter,
    yes: bool,
    json: bool,
) -> Result<()> {
    let settings = TaskSettings::from_config(config, options);
    let orchestrator = RaceOrchestrator::new(provider.clone(), settings);
    let controller = RoundController::new(provider, orchestrator, config.candidates_per_round);
    let mut session = RaceSession::from_config(controller, config, filter);

    let renderer = spawn_renderer(session.subscribe(), json);
    info!(
        session_id = %session.id(),
        candidates = config.candidates_per_round,
        max_rounds = config.max_rounds,
        "Starting race"
    );
    session.start();

    loop {
        let outcome = wait_for_outcome(&mut session).await?;
        let winner = match outcome {
            RaceOutcome::Won(winner) => winner,
            RaceOutcome::Exhausted => {
                drain_renderer(renderer).await;
                anyhow::bail!("No instance became ready; every round was exhausted");
            }
            RaceOutcome::UserCancelled => {
                drain_renderer(renderer).await;
                println!("\n🛑 Race cancelled; all attempts are being cleaned up");
                return Ok(());
            }
        };

        print_winner(&winner, json)?;
        let accept = yes
            || Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt("Keep this instance?")
                .default(true)
                .interact()?;

        if accept {
            let accepted = session.accept_winner().await?;
            drain_renderer(renderer).await;
            if !json {
                println!("\n✅ Instance {} is yours", instance_id(&accepted));
            }
            return Ok(());
        }

        warn!(candidate_id = %winner.id, "Winner rejected, racing again");
        session.reject_winner_and_continue().await?;
    }
}

/// Wait for the race, cancelling it on Ctrl-C.
async fn wait_for_outcome(session: &mut RaceSession) -> Result<RaceOutcome> {
    let interrupted = tokio::select! {
        outcome = session.outcome() => Some(outcome),
        _ = tokio::signal::ctrl_c() => None,
    };
    let outcome = match interrupted {
        Some(outcome) => outcome?,
        None => {
            session.cancel();
            session.outcome().await?
        }
    };
    Ok(outcome)
}

/// Let the renderer flush the final events.
async fn drain_renderer(renderer: JoinHandle<()>) {
    if tokio::time::timeout(Duration::from_millis(250), renderer)
        .await
        .is_err()
    {
        tracing::debug!("Renderer still running at exit");
    }
}

fn instance_id(candidate: &Candidate) -> &str {
    candidate.instance.as_ref().map_or("unknown", |i| i.id.as_str())
}

fn print_winner(winner: &Candidate, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(winner)?);
        return Ok(());
    }
    println!("\n🏁 Winner: candidate {} ({})", winner.id, winner.offer);
    println!("   Instance: {}", instance_id(winner));
    if let Some(instance) = &winner.instance {
        if let Some(host) = &instance.host {
            println!(
                "   📡 SSH: {}@{}",
                instance.username.as_deref().unwrap_or("root"),
                host
            );
        }
    }
    if let Some(took) = winner.time_to_ready() {
        println!("   Took:     {}s", took.as_secs());
    }
    Ok(())
}

/// Render race events as progress bars or JSON lines.
fn spawn_renderer(mut rx: broadcast::Receiver<RaceEvent>, json: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut view = RaceView::new();
        loop {
            match rx.recv().await {
                Ok(event) if json => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, "Failed to serialize race event"),
                },
                Ok(event) => view.apply(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Progress display fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
        view.finish();
    })
}

/// Terminal progress view: one bar per candidate plus an overall bar.
struct RaceView {
    multi: MultiProgress,
    overall: Option<ProgressBar>,
    bars: HashMap<CandidateId, ProgressBar>,
}

impl RaceView {
    fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            overall: None,
            bars: HashMap::new(),
        }
    }

    fn style(template: &str) -> ProgressStyle {
        ProgressStyle::with_template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░")
    }

    fn apply(&mut self, event: &RaceEvent) {
        match event {
            RaceEvent::RoundStarted { round, candidates } => {
                self.clear();
                let overall = self.multi.add(ProgressBar::new(100));
                overall.set_style(Self::style(
                    "{prefix:>10.bold} [{bar:30.green}] {pos:>3}% {msg}",
                ));
                overall.set_prefix(format!("round {round}"));
                self.overall = Some(overall);

                for (id, offer_id) in candidates {
                    let bar = self.multi.add(ProgressBar::new(100));
                    bar.set_style(Self::style(
                        "{prefix:>10} [{bar:30.cyan}] {pos:>3}% {msg}",
                    ));
                    bar.set_prefix(id.to_string());
                    bar.set_message(format!("{offer_id} pending"));
                    self.bars.insert(*id, bar);
                }
            }
            RaceEvent::CandidateUpdated {
                candidate_id,
                status,
                progress,
            } => {
                if let Some(bar) = self.bars.get(candidate_id) {
                    bar.set_position(u64::from(*progress));
                    let label = match status {
                        CandidateStatus::Ready => "✅ ready".to_string(),
                        CandidateStatus::Failed => "❌ failed".to_string(),
                        CandidateStatus::Cancelled => "⚪ cancelled".to_string(),
                        other => other.to_string(),
                    };
                    if status.is_terminal() {
                        bar.abandon_with_message(label);
                    } else {
                        bar.set_message(label);
                    }
                }
            }
            RaceEvent::Progress {
                max_progress, eta, ..
            } => {
                if let Some(overall) = &self.overall {
                    overall.set_position(u64::from(*max_progress));
                    overall.set_message(eta.to_string());
                }
            }
            RaceEvent::RoundFailed { round, summary } => {
                self.println(format!("⚠️  Round {round} failed: {summary}"));
            }
            RaceEvent::WinnerFound { candidate } => {
                if let Some(overall) = &self.overall {
                    overall.finish_with_message(format!("winner {}", candidate.id));
                }
            }
            RaceEvent::WinnerRejected { candidate_id } => {
                self.println(format!("↩️  Rejected {candidate_id}, racing again"));
            }
            RaceEvent::RoundExhausted { rounds } => {
                self.println(format!("🔴 Exhausted after {rounds} round(s)"));
            }
            RaceEvent::RaceCancelled => self.println("🛑 Cancelled".to_string()),
        }
    }

    fn println(&self, line: String) {
        if self.multi.println(&line).is_err() {
            eprintln!("{line}");
        }
    }

    fn clear(&mut self) {
        for (_, bar) in self.bars.drain() {
            bar.finish_and_clear();
        }
        if let Some(overall) = self.overall.take() {
            overall.finish_and_clear();
        }
    }

    fn finish(&mut self) {
        for bar in self.bars.values() {
            if !bar.is_finished() {
                bar.abandon();
            }
        }
        if let Some(overall) = &self.overall {
            if !overall.is_finished() {
                overall.abandon();
            }
        }
    }
}

/// Source for credential fields missing from flags and environment.
trait SecretLookup {
    /// Read one field.
    fn field(&self, label: &str) -> Result<String>;
}

/// Reads fields of one 1Password item through the `op` CLI.
struct OnePassword {
    vault: Option<String>,
    item: String,
}

impl OnePassword {
    fn from_args(args: &CredentialArgs) -> Self {
        Self {
            vault: non_empty(args.op_vault.as_deref()).map(str::to_string),
            item: args.op_item.trim().to_string(),
        }
    }

    fn signed_in() -> Result<()> {
        let out = Command::new("op")
            .args(["whoami"])
            .output()
            .context("1Password CLI `op` not found; install it or pass --api-key/--project-id")?;
        if !out.status.success() {
            anyhow::bail!("1Password CLI is not signed in; run `eval $(op signin)`");
        }
        Ok(())
    }
}

impl SecretLookup for OnePassword {
    fn field(&self, label: &str) -> Result<String> {
        Self::signed_in()?;
        let mut cmd = Command::new("op");
        cmd.args(["item", "get", &self.item, "--fields", label, "--reveal"]);
        if let Some(vault) = &self.vault {
            cmd.args(["--vault", vault]);
        }
        let out = cmd.output().context("Failed to run `op item get`")?;
        if !out.status.success() {
            anyhow::bail!(
                "op item get {:?} --fields {label:?}: {}",
                self.item,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Take each credential from flags or environment, else from `secrets`.
fn resolve_credentials(
    args: &CredentialArgs,
    secrets: &dyn SecretLookup,
) -> Result<(String, String)> {
    let lookup = |given: Option<&str>, label: &str, what: &str| -> Result<String> {
        if let Some(value) = non_empty(given) {
            return Ok(value.to_string());
        }
        let value = secrets
            .field(label)
            .with_context(|| format!("Latitude {what} not given and not found in 1Password"))?;
        if value.is_empty() {
            anyhow::bail!("1Password field {label:?} for the Latitude {what} is empty");
        }
        info!(field = label, "Read Latitude {what} from 1Password");
        Ok(value)
    };

    let api_key = lookup(args.api_key.as_deref(), &args.op_api_key_field, "API key")?;
    let project_id = lookup(args.project_id.as_deref(), &args.op_project_id_field, "project ID")?;
    Ok((api_key, project_id))
}
