use std::sync::Arc;

use anyhow::Result;
use careminder_core::config::CareminderConfig;
use careminder_core::{Category, ReminderId};
use careminder_scheduler::{
    Clock, NotificationFacility, NotifierHandle, ReminderScheduler, SqliteReminderStore,
    SystemClock, TimeOfDay, WeekdaySet,
};
use clap::{Parser, Subcommand};
use tracing::info;

mod commands;

use commands::{App, ContentArgs};

const DEFAULT_LOG_FILTER: &str =
    "careminder_cli=info,careminder_scheduler=info,careminder_core=info";

#[derive(Parser)]
#[command(
    name = "careminder",
    about = "Recurring medication, hydration and nutrition reminders",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (default: $CAREMINDER_CONFIG, then ~/.careminder/careminder.toml)
    #[arg(long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a reminder and schedule its next triggers
    Add {
        /// What to take, drink or eat
        name: String,

        /// medication, hydration or nutrition
        #[arg(long, short)]
        category: Category,

        /// Time of day, 24-hour HH:MM
        #[arg(long, short)]
        time: TimeOfDay,

        /// daily, weekdays, weekends, or a list such as mon,wed,fri
        /// (hydration and nutrition default to daily)
        #[arg(long, short)]
        days: Option<WeekdaySet>,

        #[command(flatten)]
        content: ContentArgs,
    },

    /// Change a reminder and replace its scheduled triggers
    Edit {
        /// Reminder id
        id: String,

        #[arg(long, short)]
        name: Option<String>,

        #[arg(long, short)]
        category: Option<Category>,

        #[arg(long, short)]
        time: Option<TimeOfDay>,

        #[arg(long, short)]
        days: Option<WeekdaySet>,

        #[command(flatten)]
        content: ContentArgs,
    },

    /// Cancel a reminder's triggers and delete it
    Remove {
        /// Reminder id
        id: String,
    },

    /// List all reminders
    List,

    /// Show the reminders due next
    Upcoming {
        /// Show every reminder instead of the dashboard limit
        #[arg(long)]
        all: bool,
    },

    /// Re-schedule triggers up to the horizon (one reminder, or all)
    Refresh {
        /// Reminder id; omit to refresh everything
        id: Option<String>,
    },

    /// Deliver notifications until Ctrl-C
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // config: --config > CAREMINDER_CONFIG env > ~/.careminder/careminder.toml
    let config_path = cli
        .config
        .or_else(|| std::env::var("CAREMINDER_CONFIG").ok());
    let config = CareminderConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        CareminderConfig::default()
    });

    let db_path = config.database.path.clone();
    ensure_parent_dir(&db_path);
    info!(path = %db_path, "opening SQLite database");

    let db = rusqlite::Connection::open(&db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;
    careminder_scheduler::db::init_db(&db)?;

    // store and notifier each get their own connection
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let notifier = Arc::new(NotifierHandle::new(
        rusqlite::Connection::open(&db_path)?,
        clock.clone(),
    )?);
    let grant = notifier.request_permission().await?;
    let store = Arc::new(SqliteReminderStore::new(db)?);
    let scheduler = ReminderScheduler::new(
        store,
        notifier.clone(),
        clock.clone(),
        config.scheduler.clone(),
        grant,
    )?;

    let app = App {
        scheduler,
        notifier,
        clock,
        db_path,
        config,
    };

    match cli.command {
        Commands::Add {
            name,
            category,
            time,
            days,
            content,
        } => commands::add(&app, name, category, time, days, content).await,
        Commands::Edit {
            id,
            name,
            category,
            time,
            days,
            content,
        } => {
            let edit = commands::Edit {
                name,
                category,
                time,
                days,
                content,
            };
            commands::edit(&app, &ReminderId::from(id), edit).await
        }
        Commands::Remove { id } => commands::remove(&app, &ReminderId::from(id)).await,
        Commands::List => commands::list(&app),
        Commands::Upcoming { all } => commands::upcoming(&app, all),
        Commands::Refresh { id } => commands::refresh(&app, id.map(ReminderId::from)).await,
        Commands::Run => commands::run(app).await,
    }
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
