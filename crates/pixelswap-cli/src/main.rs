use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pixelswap_contracts::events::{new_session_id, EventPayload, EventWriter};
use pixelswap_contracts::messages::ExtensionMessage;
use pixelswap_contracts::params::{resolve_prompt, ModelParams};
use pixelswap_contracts::session::{BadgeState, SessionStore};
use pixelswap_engine::{
    default_provider_registry, BatchOutcome, ChannelBridge, GenerationDispatcher, HostBridge,
    PageSnapshot, ReplaceEngine, TabId, TabRouter,
};
use serde_json::{json, Map, Value};

const SESSION_FILE: &str = "session.json";
const PAGE_FILE: &str = "page.json";
const ACTIVE_TAB: TabId = 1;

#[derive(Debug, Parser)]
#[command(
    name = "pixelswap",
    version,
    about = "Swap page images for generated variants"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the page engine and the background dispatcher over a page snapshot.
    Run(RunArgs),
    /// Set or flip the persisted ON/OFF indicator.
    Toggle(ToggleArgs),
    /// Store the user prompt used for the next generation batch.
    Prompt(PromptArgs),
    /// Print the session state.
    Show(ShowArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Switch {
    On,
    Off,
}

impl Switch {
    fn is_on(self) -> bool {
        self == Self::On
    }
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    page: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = "dryrun")]
    provider: String,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    prompt: Option<String>,
    /// Page snapshot inserted after load, one mutation batch per file.
    #[arg(long = "append")]
    append: Vec<PathBuf>,
    #[arg(long, value_enum)]
    enabled: Option<Switch>,
    /// Overrides PIXELSWAP_DISPATCH_DELAY_MS.
    #[arg(long)]
    delay_ms: Option<u64>,
    /// How far the result may drift from the source image (0.0 to 1.0).
    #[arg(long)]
    strength: Option<f64>,
    #[arg(long)]
    steps: Option<u32>,
}

#[derive(Debug, Parser)]
struct ToggleArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(value_enum)]
    state: Option<Switch>,
}

#[derive(Debug, Parser)]
struct PromptArgs {
    #[arg(long)]
    out: PathBuf,
    text: String,
}

#[derive(Debug, Parser)]
struct ShowArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RunSummary {
    dispatched: usize,
    generated: usize,
    completed: usize,
    failed: usize,
    attribute_writes: usize,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("pixelswap error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => {
            let summary = run_page(&args)?;
            println!(
                "Dispatched {} image(s): {} generated, {} failed, {} attribute write(s).",
                summary.dispatched, summary.completed, summary.failed, summary.attribute_writes
            );
            println!("Page written to {}", args.out.join(PAGE_FILE).display());
            Ok(if summary.failed > 0 { 2 } else { 0 })
        }
        Command::Toggle(args) => {
            let state = run_toggle(&args)?;
            println!("Image replacement {}", state.text());
            Ok(0)
        }
        Command::Prompt(args) => {
            session_for(&args.out)?.set_user_prompt(&args.text)?;
            println!("Prompt set.");
            Ok(0)
        }
        Command::Show(args) => {
            let state = session_state(&session_for(&args.out)?);
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(0)
        }
    }
}

fn session_for(out: &Path) -> Result<SessionStore> {
    fs::create_dir_all(out).with_context(|| format!("failed to create {}", out.display()))?;
    Ok(SessionStore::new(out.join(SESSION_FILE)))
}

fn run_toggle(args: &ToggleArgs) -> Result<BadgeState> {
    let session = session_for(&args.out)?;
    let next = match args.state {
        Some(state) => BadgeState::from_enabled(state.is_on()),
        None => BadgeState::from_enabled(!session.badge().is_on()),
    };
    session.set_badge(next)?;
    Ok(next)
}

fn session_state(session: &SessionStore) -> Value {
    let badge = session.badge();
    let user_prompt = session.user_prompt();
    json!({
        "session_file": session.path().display().to_string(),
        "badge_text": badge.text(),
        "badge_color": session.badge_color().unwrap_or_else(|| badge.color().to_string()),
        "user_prompt": user_prompt,
        "effective_prompt": resolve_prompt(&user_prompt),
    })
}

/// Page loop on this thread, dispatcher on a worker thread, joined by the bus.
///
/// Appended snapshots are inserted only after the results that are already
/// back have been applied, so each append arrives as its own mutation batch.
fn run_page(args: &RunArgs) -> Result<RunSummary> {
    let params = model_params(args)?;
    let session = session_for(&args.out)?;
    if let Some(prompt) = args.prompt.as_deref() {
        session.set_user_prompt(prompt)?;
    }
    let page = PageSnapshot::load(&args.page)?;
    let appended = args
        .append
        .iter()
        .map(|path| PageSnapshot::load(path))
        .collect::<Result<Vec<_>>>()?;

    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let events = EventWriter::new(&events_path, new_session_id());
    events.emit(
        "session_started",
        payload(json!({
            "page": args.page.display().to_string(),
            "provider": args.provider,
            "badge": session.badge().text(),
        })),
    )?;

    let (page_tx, page_rx) = mpsc::channel::<ExtensionMessage>();
    let (background_tx, background_rx) = mpsc::channel::<ExtensionMessage>();
    let mut router = TabRouter::new().with_events(events.clone());
    router.register(ACTIVE_TAB, page_tx);
    router.activate(ACTIVE_TAB);

    let mut dispatcher = GenerationDispatcher::new(
        default_provider_registry(&args.out),
        &args.provider,
        session.clone(),
        router,
    )?
    .with_events(events.clone());
    if let Some(model) = args.model.as_deref() {
        dispatcher = dispatcher.with_model(model);
    }
    if let Some(delay_ms) = args.delay_ms {
        dispatcher = dispatcher.with_delay(Duration::from_millis(delay_ms));
    }
    dispatcher = dispatcher.with_params(params);
    let worker = thread::Builder::new()
        .name("pixelswap-dispatch".to_string())
        .spawn(move || dispatcher.run(background_rx))
        .context("failed to spawn dispatcher thread")?;

    let bridge = ChannelBridge::new(background_tx, session.clone()).with_events(events.clone());
    let mut engine =
        ReplaceEngine::new(page, bridge, session.badge()).with_events(events.clone());
    engine.start();
    if let Some(state) = args.enabled {
        engine.on_toggle(state.is_on());
    }
    engine.poll_mutations();

    for more in appended {
        drain_ready(&mut engine, &page_rx);
        engine.document_mut().append(more);
        engine.poll_mutations();
    }

    // Dropping the page's sender lets the dispatcher finish its queue and
    // release the router, which closes `page_rx`.
    engine.bridge_mut().close();
    for message in page_rx.iter() {
        engine.handle_message(message);
        engine.poll_mutations();
    }
    let outcome: BatchOutcome = worker
        .join()
        .map_err(|_| anyhow!("dispatcher thread panicked"))?;

    let (document, _bridge, registry) = engine.into_parts();
    document.save(&args.out.join(PAGE_FILE))?;
    let summary = RunSummary {
        dispatched: registry.dispatched_count(),
        generated: registry.len(),
        completed: outcome.completed,
        failed: outcome.failed,
        attribute_writes: document.attribute_writes(),
    };
    events.emit(
        "session_finished",
        payload(json!({
            "dispatched": summary.dispatched,
            "generated": summary.generated,
            "completed": summary.completed,
            "failed": summary.failed,
            "attribute_writes": summary.attribute_writes,
            "replacements": registry
                .entries()
                .map(|(original, generated)| {
                    (original.to_string(), Value::String(generated.to_string()))
                })
                .collect::<Map<String, Value>>(),
        })),
    )?;
    Ok(summary)
}

fn model_params(args: &RunArgs) -> Result<ModelParams> {
    let mut params = ModelParams::default();
    if let Some(strength) = args.strength {
        if !(0.0..=1.0).contains(&strength) {
            bail!("--strength must be between 0.0 and 1.0 (got {strength})");
        }
        params.strength = strength;
    }
    if let Some(steps) = args.steps {
        if steps == 0 {
            bail!("--steps must be at least 1");
        }
        params.num_inference_steps = steps;
    }
    Ok(params)
}

fn drain_ready<B: HostBridge>(
    engine: &mut ReplaceEngine<PageSnapshot, B>,
    inbox: &mpsc::Receiver<ExtensionMessage>,
) {
    while let Ok(message) = inbox.try_recv() {
        engine.handle_message(message);
        engine.poll_mutations();
    }
}

fn payload(value: Value) -> EventPayload {
    match value {
        Value::Object(map) => map,
        _ => EventPayload::new(),
    }
}
