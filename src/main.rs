mod cli;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use cli::{ChatArgs, Cli, Commands, ConversationAction, TranscriptArgs, UsageArgs};
use colored::*;
use rusty_chat::config::Config;
use rusty_chat::context::{UsageLevel, UsageSnapshot, usage};
use rusty_chat::conversation::{
    self, CONVERSATIONS_KEY, Conversation, ConversationRegistry, StoredConversation,
};
use rusty_chat::models::ModelTable;
use rusty_chat::providers::Role;
use rusty_chat::providers::registry::ProviderRegistry;
use rusty_chat::reduce::{PlaceholderOptimizer, should_optimize};
use rusty_chat::session::{FileStore, KeyValueStore};
use rusty_chat::stream::{StreamController, StreamError, TurnOutcome};
use rusty_chat::task::CancellableTask;
use rusty_chat::window::ChatView;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let cfg = Config::load(cli.config.as_deref())?;
    let models = ModelTable::with_overrides(&cfg.models);

    match cli.command {
        Commands::Chat(args) => run_chat(&cfg, &models, args).await?,
        Commands::Usage(args) => show_usage(&models, args)?,
        Commands::Conversations(c) => {
            let store = FileStore::open_default()?;
            let mut stored = conversation::load_conversations(&store)?;
            match c.action {
                ConversationAction::List => {
                    if stored.is_empty() {
                        println!("no stored conversations");
                    }
                    for s in &stored {
                        println!("{}  {} messages  {}", s.id.bold(), s.messages.len(), s.title);
                    }
                }
                ConversationAction::Show => {
                    let id = c.conversation.as_deref().unwrap_or("");
                    if id.is_empty() {
                        eprintln!("--conversation is required for show");
                    } else {
                        let s = find(&stored, id)?;
                        for m in &s.messages {
                            println!("{} {}\n", role_label(m.role), m.content);
                        }
                    }
                }
                ConversationAction::Delete => {
                    let id = c.conversation.as_deref().unwrap_or("");
                    if id.is_empty() {
                        eprintln!("--conversation is required for delete");
                    } else {
                        let before = stored.len();
                        stored.retain(|s| s.id != id);
                        if stored.len() == before {
                            println!("no conversation named {id}");
                        } else {
                            conversation::save_conversations(&store, &stored)?;
                            println!("deleted {id}");
                        }
                    }
                }
                ConversationAction::ClearAll => {
                    store.delete(CONVERSATIONS_KEY)?;
                    println!("cleared all conversations");
                }
            }
        }
        Commands::Transcript(args) => show_transcript(&cfg, args)?,
        Commands::ListModels(cmd) => {
            let registry = ProviderRegistry::from_config(&cfg)?;
            let provider = registry.get(&cmd.provider)?;
            for m in provider.list_models().await? {
                println!("{m}");
            }
        }
        Commands::Providers => {
            let registry = ProviderRegistry::from_config(&cfg)?;
            println!("{}", "Available providers:".bold());
            for key in registry.list() {
                match registry.get(&key) {
                    Ok(p) => println!("- {} (default model {})", key, p.default_model()),
                    Err(_) => println!("- {key}"),
                }
            }
        }
        Commands::ConfigPath => {
            println!("{}", Config::default_path()?.display());
        }
        Commands::InitConfig => {
            let path = Config::write_example_if_absent()?;
            println!("Wrote example config to {}", path.display());
        }
    }

    Ok(())
}

async fn run_chat(cfg: &Config, models: &ModelTable, args: ChatArgs) -> Result<()> {
    let providers = ProviderRegistry::from_config(cfg)?;
    let provider_key = args
        .provider
        .or_else(|| cfg.chat.default_provider.clone())
        .unwrap_or_else(|| "openai".into());
    let provider = providers.get(&provider_key)?;
    let model_id = args
        .model
        .unwrap_or_else(|| provider.default_model().to_string());
    let model = models.profile(&model_id);
    let system = args
        .system
        .or_else(|| cfg.chat.system_prompt.clone())
        .unwrap_or_default();

    let controller = StreamController::new(Arc::clone(&provider))
        .with_optimizer(Box::new(PlaceholderOptimizer {
            keep_recent: cfg.budget.keep_recent,
        }))
        .with_system(system.clone())
        .with_temperature(args.temperature.or(cfg.chat.temperature))
        .with_max_tokens(args.max_tokens.or(cfg.chat.max_tokens))
        .with_truncate_target(cfg.budget.truncate_target);

    let store = FileStore::open_default()?;
    let mut registry = ConversationRegistry::new(
        cfg.view.window(),
        Duration::from_millis(cfg.budget.debounce_ms),
    );
    for stored in conversation::load_conversations(&store)? {
        registry.insert(Conversation::from(stored));
    }
    registry.switch_to(&args.conversation);

    println!(
        "{} {} via {} (budget ~{} tokens)",
        "chat".bold(),
        args.conversation.cyan(),
        format!("{}/{}", controller.provider_name(), model.id).bold(),
        model.soft_limit
    );
    println!("end a line with \\ to continue, Ctrl-C cancels a reply, /usage, /quit");
    if let Some(snap) = registry.usage_now(&system, &model) {
        print_usage(&snap);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut draft = String::new();
    loop {
        let marker = if draft.is_empty() { ">" } else { "." };
        print!("{} ", marker.cyan().bold());
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };

        if draft.is_empty() {
            match line.trim() {
                "/quit" | "/exit" => break,
                "/usage" => {
                    if let Some(snap) = registry.usage_now(&system, &model) {
                        print_usage(&snap);
                    }
                    continue;
                }
                _ => {}
            }
        }
        if let Some(head) = line.strip_suffix('\\') {
            draft.push_str(head);
            draft.push('\n');
            registry.set_draft(&draft, &system, &model);
            continue;
        }
        draft.push_str(&line);
        let input = std::mem::take(&mut draft);

        let turn = match registry.submit_active(&controller, &input, &model).await {
            Ok(turn) => turn,
            Err(StreamError::EmptyInput) => continue,
            Err(e) => {
                eprintln!("{} {e}", "error:".red().bold());
                continue;
            }
        };
        if turn.elided() > 0 {
            eprintln!(
                "{} {} older messages left out of this request",
                "[context]".yellow(),
                turn.elided()
            );
        }

        let token = turn.cancel_token();
        let ctrl_c = CancellableTask::spawn(move |watch| async move {
            tokio::select! {
                _ = watch.cancelled() => {}
                res = tokio::signal::ctrl_c() => {
                    if res.is_ok() {
                        token.cancel();
                    }
                }
            }
        });
        let Some(conv) = registry.active_mut() else {
            break;
        };
        let outcome = controller
            .stream(conv, turn, |fragment| {
                print!("{fragment}");
                let _ = std::io::stdout().flush();
            })
            .await;
        drop(ctrl_c);
        conv.session.acknowledge();

        match outcome {
            TurnOutcome::Completed { .. } => println!(),
            TurnOutcome::Aborted { .. } => println!("\n{}", "[cancelled]".yellow()),
            TurnOutcome::Failed { message, .. } => println!("\n{}", message.red()),
        }

        if let Err(e) = conversation::save_conversations(&store, &registry.stored()) {
            tracing::warn!(error = %e, "failed to save conversations");
        }
        if let Some(snap) = registry.usage_now(&system, &model)
            && snap.level >= UsageLevel::Warning
        {
            print_usage(&snap);
        }
    }

    conversation::save_conversations(&store, &registry.stored())
        .context("saving conversations")?;
    Ok(())
}

fn show_usage(models: &ModelTable, args: UsageArgs) -> Result<()> {
    let store = FileStore::open_default()?;
    let stored = conversation::load_conversations(&store)?;
    let conv = find(&stored, &args.conversation)?;
    let model = models.profile(&args.model);
    let system = args.system.unwrap_or_default();
    let snap = usage(&conv.messages, &system, args.draft.as_deref(), &model);
    print_usage(&snap);
    if should_optimize(&conv.messages, &system, &model) {
        println!("history would be reduced before the next request");
    }
    Ok(())
}

fn show_transcript(cfg: &Config, args: TranscriptArgs) -> Result<()> {
    let store = FileStore::open_default()?;
    let stored = conversation::load_conversations(&store)?;
    let conv = find(&stored, &args.conversation)?;

    let rendered: Vec<String> = conv
        .messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect();
    let items: Vec<&str> = rendered.iter().map(String::as_str).collect();

    let mut view = ChatView::new(cfg.view.window());
    view.bind(&conv.id);
    let Some(window) = view.layout(&items, args.width, args.scroll, args.rows) else {
        println!("(empty conversation)");
        return Ok(());
    };
    println!(
        "{}",
        format!(
            "messages {}-{} of {}, offset {} of {} rows",
            window.start_index + 1,
            window.end_index + 1,
            items.len(),
            window.offset_pixels,
            window.total_pixels
        )
        .dimmed()
    );
    for i in window.indices() {
        let m = &conv.messages[i];
        println!("{} {}\n", role_label(m.role), m.content);
    }
    Ok(())
}

fn find<'a>(stored: &'a [StoredConversation], id: &str) -> Result<&'a StoredConversation> {
    stored
        .iter()
        .find(|s| s.id == id)
        .ok_or_else(|| anyhow!("no conversation named {id}"))
}

fn role_label(role: Role) -> ColoredString {
    match role {
        Role::User => "user:".cyan().bold(),
        Role::Assistant => "assistant:".green().bold(),
    }
}

fn print_usage(snap: &UsageSnapshot) {
    let level = match snap.level {
        UsageLevel::Safe => snap.level.as_str().green(),
        UsageLevel::Info => snap.level.as_str().cyan(),
        UsageLevel::Warning => snap.level.as_str().yellow(),
        UsageLevel::Danger => snap.level.as_str().red().bold(),
    };
    println!(
        "{} ~{} of {} tokens ({:.1}%, {}), {} remaining",
        "[usage]".bold(),
        snap.estimated,
        snap.limit,
        snap.percentage * 100.0,
        level,
        snap.remaining
    );
}
