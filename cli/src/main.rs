use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tiger_sync::backend::memory::MemoryBackend;
use tiger_sync::backend::{Backend, BackendError, RowFilter, to_row};
use tiger_sync::config::ConfigError;
use tiger_sync::functions::{AssistantRequest, FunctionError, FunctionsClient, FunctionsConfig};
use tiger_sync::notice::{Notice, Notifier};
use tiger_sync::presence::{PageVisibility, PresenceTracker};
use tiger_sync::rate_limit::{AuthRateLimiter, RateLimitError};
use tiger_sync::resource::DroneStore;
use tiger_sync::telemetry::{DEFAULT_STATUS_TABLE, DEFAULT_TELEMETRY_TABLE, TelemetrySubscriber, TelemetryView};
use tiger_sync::translation::TranslationCache;
use tiger_sync::SyncConfig;
use tracing::{debug, info, warn};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing functions URL; pass --functions-url or set TIGER_FUNCTIONS_URL")]
    MissingFunctionsUrl,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Function(#[from] FunctionError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("{0} stream closed")]
    Closed(&'static str),
}

#[derive(Parser, Debug)]
#[command(name = "tiger", about = "Tiger CRM sync layer CLI")]
struct Cli {
    #[arg(long, env = "TIGER_FUNCTIONS_URL")]
    functions_url: Option<String>,

    #[arg(long, env = "TIGER_ANON_KEY", hide_env_values = true)]
    anon_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Translate text through the cache.
    Translate {
        text: String,
        #[arg(long)]
        target: String,
        #[arg(long)]
        source: Option<String>,
    },
    /// Detect the language of text.
    Detect { text: String },
    /// Ask the task assistant.
    Assist {
        message: String,
        #[arg(long, default_value = "en")]
        language: String,
        #[arg(long, help = "Task context as a JSON object")]
        context: Option<String>,
    },
    /// Run the sync components against the in-process backend.
    Demo,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;
    debug!(command = ?cli.command, "cli: dispatch");

    match cli.command {
        Command::Translate { text, target, source } => {
            let client = functions_client(cli.functions_url, cli.anon_key)?;
            let cache = TranslationCache::new(Arc::new(client), config.translation);
            let state = cache.get_translation(&text, source.as_deref(), &target).await;
            info!(target_lang = %target, needs_translation = state.needs_translation, "cli: translated");
            print_json(&json!({
                "translated": state.translated_text,
                "detected_language": state.detected_language,
                "needs_translation": state.needs_translation,
            }))
        }
        Command::Detect { text } => {
            let client = functions_client(cli.functions_url, cli.anon_key)?;
            let language = client.detect(&text).await?;
            info!(%language, "cli: detected");
            println!("{language}");
            Ok(())
        }
        Command::Assist { message, language, context } => {
            let client = functions_client(cli.functions_url, cli.anon_key)?;
            let task_context = context.as_deref().map(serde_json::from_str::<Value>).transpose()?;
            let reply = client
                .ask_assistant(&AssistantRequest { message, task_context, language })
                .await;
            println!("{reply}");
            Ok(())
        }
        Command::Demo => run_demo(config).await,
    }
}

fn functions_client(url: Option<String>, anon_key: Option<String>) -> Result<FunctionsClient, CliError> {
    let url = url.ok_or(CliError::MissingFunctionsUrl)?;
    if anon_key.is_none() {
        warn!("cli: no anon key set; functions calls are unauthenticated");
    }
    let mut config = FunctionsConfig::new(&url);
    config.anon_key = anon_key;
    Ok(FunctionsClient::new(config)?)
}

// =============================================================================
// DEMO
// =============================================================================

async fn run_demo(config: SyncConfig) -> Result<(), CliError> {
    let memory = MemoryBackend::new();
    let backend: Arc<dyn Backend> = Arc::new(memory.clone());
    memory.seed(
        DEFAULT_STATUS_TABLE,
        [to_row(&json!({ "id": "drone-1", "name": "Kestrel", "status": "flying" }))?],
    );
    memory.seed(
        DEFAULT_TELEMETRY_TABLE,
        [to_row(&json!({ "drone_id": "drone-1", "battery_level": 80, "altitude": 10 }))?],
    );

    // PHASE: FLEET STORE
    info!("demo: opening fleet store");
    let drones = DroneStore::open(backend.clone()).await;
    println!("fleet: {} drone(s) loaded", drones.state().items.len());

    // PHASE: TELEMETRY
    info!("demo: subscribing to drone-1 telemetry");
    let mut telemetry = TelemetrySubscriber::new(backend.clone(), config.telemetry.clone());
    let mut view = telemetry.subscribe("drone-1").await?;
    print_view(&telemetry.view())?;

    backend
        .update(DEFAULT_STATUS_TABLE, &RowFilter::eq("id", "drone-1"), to_row(&json!({ "battery_level": 75 }))?)
        .await?;
    let battery = |v: &TelemetryView| v.snapshot.as_ref().and_then(|s| s.battery_level);
    tokio::time::timeout(WAIT, view.wait_for(|v| battery(v) == Some(75.0)))
        .await
        .map_err(|_| CliError::Timeout("telemetry update"))?
        .map_err(|_| CliError::Closed("telemetry"))?;
    print_view(&telemetry.view())?;

    // PHASE: PRESENCE
    info!("demo: joining presence");
    let visibility = PageVisibility::default();
    let alice =
        PresenceTracker::join(backend.clone(), "online-users", "alice", "Alice", config.presence, visibility.clone())
            .await?;
    let bob = PresenceTracker::join(backend.clone(), "online-users", "bob", "Bob", config.presence, visibility).await?;
    let mut roster = alice.subscribe();
    tokio::time::timeout(WAIT, roster.wait_for(|r| r.len() == 2))
        .await
        .map_err(|_| CliError::Timeout("presence roster"))?
        .map_err(|_| CliError::Closed("presence"))?;
    println!("presence: {} online", alice.count());
    bob.leave().await?;
    alice.leave().await?;

    // PHASE: ADMIN RATE LIMIT
    info!("demo: exercising admin auth rate limit");
    let notifier = Notifier::new();
    let mut notices = notifier.subscribe();
    let limiter = AuthRateLimiter::new(config.rate_limit);
    for attempt in 1..=limiter.config().max_attempts + 1 {
        match limiter.check_and_record("admin@tiger.example") {
            Ok(()) => println!("auth attempt {attempt}: allowed"),
            Err(e) => {
                warn!(attempt, error = %e, "demo: auth attempt rejected");
                let RateLimitError::Locked { retry_after } = e;
                notifier.notify(Notice::RateLimited { retry_after });
                println!("auth attempt {attempt}: locked for {}s", retry_after.as_secs());
            }
        }
    }
    while let Ok(notice) = notices.try_recv() {
        println!("notice: {notice:?}");
    }

    telemetry.close().await;
    drones.close().await;
    info!("demo: done");
    Ok(())
}

fn print_view(view: &TelemetryView) -> Result<(), CliError> {
    print_json(&json!({
        "entity_id": view.entity_id,
        "connected": view.connected,
        "snapshot": serde_json::to_value(&view.snapshot)?,
    }))
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
