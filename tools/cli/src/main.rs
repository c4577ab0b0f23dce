//! SehatLink CLI - Command line interface for offline health records.
//!
//! Records are saved locally first and queued for the remote authority.
//! `sehatlink sync` delivers queued changes when the remote is reachable.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use sehatlink_app::config::default_config_path;
use sehatlink_app::{AppConfig, OfflineService};
use sehatlink_common::{
    parse_time_of_day, RecordId, RecordKind, Recurrence, ReminderStatus, ReminderType,
    StoredRecord,
};
use sehatlink_sync::DrainOutcome;

#[derive(Parser)]
#[command(name = "sehatlink")]
#[command(about = "SehatLink - Offline-first health records")]
#[command(version)]
struct Cli {
    /// Config file (default: platform config dir).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage health reminders.
    #[command(subcommand)]
    Reminder(ReminderCommand),

    /// Log and list meals.
    #[command(subcommand)]
    Nutrition(NutritionCommand),

    /// Analyze and list symptom checks.
    #[command(subcommand)]
    Symptom(SymptomCommand),

    /// Show changes waiting to be synced.
    Ledger {
        /// Only this record kind: reminder, nutrition or symptoms.
        #[arg(short, long)]
        kind: Option<RecordKind>,
    },

    /// Deliver pending changes to the remote.
    Sync {
        /// Remote base URL, overriding the config file.
        #[arg(short, long)]
        remote: Option<String>,
    },

    /// Show connectivity and sync state.
    Status,

    /// Manage the config file.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum ReminderCommand {
    /// Add a reminder.
    Add {
        #[arg(short, long)]
        title: String,

        /// Time of day, HH:MM.
        #[arg(long)]
        time: String,

        #[arg(long = "type", value_enum, default_value = "medication")]
        reminder_type: TypeArg,

        #[arg(short, long, value_enum, default_value = "daily")]
        recurrence: RecurrenceArg,

        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// List reminders.
    List {
        #[arg(short, long, value_enum)]
        status: Option<StatusArg>,
    },

    /// Mark a reminder done.
    Done { id: String },

    /// Mark a reminder missed.
    Missed { id: String },
}

#[derive(Subcommand)]
enum NutritionCommand {
    /// Log a food item.
    Add { food: String },

    /// List logged food.
    List {
        /// Only entries from the last N hours.
        #[arg(long)]
        since_hours: Option<i64>,
    },
}

#[derive(Subcommand)]
enum SymptomCommand {
    /// Analyze symptoms and save the result.
    Check { symptoms: String },

    /// List saved symptom checks.
    List,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write a default config file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },

    /// Print the effective config.
    Show,
}

#[derive(Clone, Copy, ValueEnum)]
enum TypeArg {
    Medication,
    Checkup,
    Exercise,
}

impl From<TypeArg> for ReminderType {
    fn from(arg: TypeArg) -> Self {
        match arg {
            TypeArg::Medication => ReminderType::Medication,
            TypeArg::Checkup => ReminderType::Checkup,
            TypeArg::Exercise => ReminderType::Exercise,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum RecurrenceArg {
    Once,
    Daily,
    Weekly,
}

impl From<RecurrenceArg> for Recurrence {
    fn from(arg: RecurrenceArg) -> Self {
        match arg {
            RecurrenceArg::Once => Recurrence::Once,
            RecurrenceArg::Daily => Recurrence::Daily,
            RecurrenceArg::Weekly => Recurrence::Weekly,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusArg {
    Pending,
    Done,
    Missed,
}

impl From<StatusArg> for ReminderStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Pending => ReminderStatus::Pending,
            StatusArg::Done => ReminderStatus::Done,
            StatusArg::Missed => ReminderStatus::Missed,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins when set
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = cli.config.unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Config(ConfigCommand::Init { force }) => cmd_config_init(&config_path, force),
        Commands::Config(ConfigCommand::Show) => cmd_config_show(&config_path),

        Commands::Sync { remote } => {
            let mut config = load_config(&config_path)?;
            if remote.is_some() {
                config.remote_url = remote;
            }
            cmd_sync(config).await
        }

        command => {
            let service = OfflineService::open(load_config(&config_path)?)
                .await
                .context("Failed to open local storage")?;
            let result = run_with_service(&service, command).await;
            service.shutdown().await;
            result
        }
    }
}

async fn run_with_service(service: &OfflineService, command: Commands) -> Result<()> {
    match command {
        Commands::Reminder(ReminderCommand::Add {
            title,
            time,
            reminder_type,
            recurrence,
            description,
        }) => {
            cmd_reminder_add(service, title, &time, reminder_type, recurrence, description).await
        }
        Commands::Reminder(ReminderCommand::List { status }) => {
            cmd_reminder_list(service, status.map(Into::into)).await
        }
        Commands::Reminder(ReminderCommand::Done { id }) => {
            cmd_reminder_status(service, &id, ReminderStatus::Done).await
        }
        Commands::Reminder(ReminderCommand::Missed { id }) => {
            cmd_reminder_status(service, &id, ReminderStatus::Missed).await
        }

        Commands::Nutrition(NutritionCommand::Add { food }) => {
            cmd_nutrition_add(service, &food).await
        }
        Commands::Nutrition(NutritionCommand::List { since_hours }) => {
            cmd_nutrition_list(service, since_hours).await
        }

        Commands::Symptom(SymptomCommand::Check { symptoms }) => {
            cmd_symptom_check(service, &symptoms).await
        }
        Commands::Symptom(SymptomCommand::List) => cmd_symptom_list(service).await,

        Commands::Ledger { kind } => cmd_ledger(service, kind).await,
        Commands::Status => cmd_status(service).await,

        Commands::Sync { .. } | Commands::Config(_) => bail!("command needs no open service"),
    }
}

fn load_config(path: &Path) -> Result<AppConfig> {
    AppConfig::load_or_default(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

fn local_marker(local_only: bool) -> &'static str {
    if local_only {
        " [not synced]"
    } else {
        ""
    }
}

/// Add a reminder.
async fn cmd_reminder_add(
    service: &OfflineService,
    title: String,
    time: &str,
    reminder_type: TypeArg,
    recurrence: RecurrenceArg,
    description: String,
) -> Result<()> {
    let time = parse_time_of_day(time).context("Invalid --time")?;
    let reminder = sehatlink_common::Reminder::new(title, time, reminder_type.into())
        .with_recurrence(recurrence.into())
        .with_description(description);

    let saved = service.save(reminder).await.context("Failed to save reminder")?;
    println!("Reminder saved: {}", saved.id());
    print_pending(service).await;
    Ok(())
}

/// List reminders.
async fn cmd_reminder_list(service: &OfflineService, status: Option<ReminderStatus>) -> Result<()> {
    let reminders = service.reminders(status).await;
    if reminders.is_empty() {
        println!("No reminders.");
        return Ok(());
    }

    for r in reminders {
        println!(
            "  {}  {}  {:<30} {:?}/{:?}{}",
            r.id,
            r.time.format("%H:%M"),
            r.title,
            r.reminder_type,
            r.status,
            local_marker(r.is_local_only)
        );
    }
    Ok(())
}

/// Change a reminder's status.
async fn cmd_reminder_status(service: &OfflineService, id: &str, status: ReminderStatus) -> Result<()> {
    let id = RecordId::new(id)?;
    let reminder = service
        .set_reminder_status(&id, status)
        .await
        .with_context(|| format!("Failed to update reminder {}", id))?;

    println!("Reminder {} is now {:?}", reminder.id, reminder.status);
    print_pending(service).await;
    Ok(())
}

/// Log a food item.
async fn cmd_nutrition_add(service: &OfflineService, food: &str) -> Result<()> {
    let entry = service.log_nutrition(food).await.context("Failed to log food")?;
    println!("Logged {} at {}", entry.food, entry.timestamp.format("%Y-%m-%d %H:%M"));
    print_pending(service).await;
    Ok(())
}

/// List logged food.
async fn cmd_nutrition_list(service: &OfflineService, since_hours: Option<i64>) -> Result<()> {
    let records = match since_hours {
        Some(hours) => {
            let since = chrono::Utc::now() - chrono::Duration::hours(hours);
            service
                .store()
                .records_since(RecordKind::NutritionEntry, since)
                .await
        }
        None => service.get_all(RecordKind::NutritionEntry).await,
    };

    if records.is_empty() {
        println!("No food logged.");
        return Ok(());
    }
    for record in records {
        if let StoredRecord::NutritionEntry(entry) = record {
            println!(
                "  {}  {}{}",
                entry.timestamp.format("%Y-%m-%d %H:%M"),
                entry.food,
                local_marker(entry.is_local_only)
            );
        }
    }
    Ok(())
}

/// Analyze symptoms and save the result.
async fn cmd_symptom_check(service: &OfflineService, symptoms: &str) -> Result<()> {
    let check = service
        .record_symptom_check(symptoms)
        .await
        .context("Failed to analyze symptoms")?;
    let result = &check.result;

    println!("Condition: {} ({:?})", result.condition, result.severity);
    println!("  {}", result.description);
    println!("  Confidence: {}% - based on {} similar cases", result.confidence, result.similar_cases);
    for recommendation in &result.recommendations {
        println!("  - {}", recommendation);
    }
    if result.seek_medical_help {
        println!("Please contact a health worker.");
    }
    print_pending(service).await;
    Ok(())
}

/// List saved symptom checks.
async fn cmd_symptom_list(service: &OfflineService) -> Result<()> {
    let records = service.get_all(RecordKind::SymptomCheck).await;
    if records.is_empty() {
        println!("No symptom checks.");
        return Ok(());
    }
    for record in records {
        if let StoredRecord::SymptomCheck(check) = record {
            println!(
                "  {}  {} -> {} ({}%){}",
                check.timestamp.format("%Y-%m-%d %H:%M"),
                check.symptoms,
                check.result.condition,
                check.result.confidence,
                local_marker(check.is_local_only)
            );
        }
    }
    Ok(())
}

/// Show unsynced ledger entries.
async fn cmd_ledger(service: &OfflineService, kind: Option<RecordKind>) -> Result<()> {
    let ledger = service.ledger();
    let pending = match kind {
        Some(kind) => ledger.list_unsynced_of(kind).await,
        None => ledger.list_unsynced().await,
    };

    if pending.is_empty() {
        println!("Nothing waiting to sync.");
    } else {
        println!("{} change(s) waiting to sync:", pending.len());
        for change in pending {
            let record = change
                .payload
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or("?");
            println!(
                "  #{:<5} {}  {:<13} {}",
                change.id,
                change.created_at.format("%Y-%m-%d %H:%M:%S"),
                change.kind,
                record
            );
        }
    }

    let quarantined = ledger.corrupt_count().await;
    if quarantined > 0 {
        println!("{} unreadable entr(ies) quarantined.", quarantined);
    }
    Ok(())
}

/// Deliver pending changes.
async fn cmd_sync(config: AppConfig) -> Result<()> {
    let Some(remote) = config.remote_url.clone() else {
        bail!("No remote configured; pass --remote URL or set remote_url in the config file");
    };

    let service = OfflineService::open(config)
        .await
        .context("Failed to open local storage")?;
    info!("Syncing with {}", remote);

    let outcome = service.sync_now().await;
    let pending = service.pending_sync_count().await;
    service.shutdown().await;

    match outcome {
        DrainOutcome::Offline => {
            println!("Remote unreachable; {} change(s) still pending.", pending);
        }
        DrainOutcome::Coalesced => {
            println!("A sync is already running.");
        }
        DrainOutcome::Completed(report) => {
            println!("Sync finished in {:?}", report.duration);
            println!("  Attempted: {}", report.attempted);
            println!("  Succeeded: {}", report.succeeded);
            println!("  Failed:    {}", report.failed);
            if report.corrupted > 0 {
                println!("  Corrupt:   {}", report.corrupted);
            }
            println!("  Pending:   {}", pending);
        }
    }
    Ok(())
}

/// Show connectivity and sync state.
async fn cmd_status(service: &OfflineService) -> Result<()> {
    let status = service.status().await;

    println!("SehatLink status:");
    println!("  Connectivity: {}", if status.online { "online" } else { "offline" });
    println!(
        "  Storage: {}{}",
        service.store().engine_name(),
        if service.is_memory_only() { " (memory only)" } else { "" }
    );
    for kind in RecordKind::ALL {
        println!("  {}: {}", kind.table_name(), service.store().count(kind).await);
    }
    println!("  Pending sync: {}", status.pending);
    if status.quarantined > 0 {
        println!("  Quarantined: {}", status.quarantined);
    }
    if let Some(report) = status.last_report {
        println!(
            "  Last sync: {} succeeded, {} failed",
            report.succeeded, report.failed
        );
    }
    Ok(())
}

/// Write a default config file.
fn cmd_config_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    AppConfig::default()
        .save(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Config written to {}", path.display());
    Ok(())
}

/// Print the effective config.
fn cmd_config_show(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    println!("# {}", path.display());
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

async fn print_pending(service: &OfflineService) {
    let pending = service.pending_sync_count().await;
    if pending > 0 && !service.is_online() {
        println!("Saved offline - {} change(s) will sync when online.", pending);
    }
}
