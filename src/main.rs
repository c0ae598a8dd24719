//! # Open Notebook CLI (`notebook`)
//!
//! Manage notebooks and their sources, ask grounded questions, keep notes,
//! configure which model serves each role, and write podcast scripts.
//!
//! ## Usage
//!
//! ```bash
//! notebook --config ./config/notebook.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `notebook init` | Create the SQLite database and run schema migrations |
//! | `notebook notebook create\|list\|show\|delete` | Manage notebooks |
//! | `notebook source add\|import-dir\|status\|reingest\|list\|delete` | Manage sources |
//! | `notebook ask <notebook> <conversation> "<question>"` | Answer from notebook content |
//! | `notebook conversation new\|list\|show` | Manage conversations |
//! | `notebook note add\|list\|delete` | Manage notes |
//! | `notebook provider list\|roles\|set-role\|reset-role` | Model providers and role bindings |
//! | `notebook podcast script <notebook>` | Write (and optionally voice) a podcast script |
//!
//! Logs go to stderr; `RUST_LOG` overrides the level.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use open_notebook::app::App;
use open_notebook::config;
use open_notebook::logging;
use open_notebook::models::{AuthorKind, SourceDescriptor, SourceStatus};
use open_notebook::podcast::{PodcastContent, SpeechRenderer};
use open_notebook::providers::{GenerationOptions, ModelTarget, Role, RoleBinding};
use open_notebook::store::{NewNote, SqliteStore};

/// Open Notebook: a local research notebook with grounded answers.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/notebook.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "notebook",
    about = "Open Notebook: import sources, ask questions, get cited answers",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/notebook.toml")]
    config: PathBuf,

    /// Log at debug level.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Create, list, show and delete notebooks.
    Notebook {
        #[command(subcommand)]
        action: NotebookAction,
    },

    /// Add and manage the sources of a notebook.
    Source {
        #[command(subcommand)]
        action: SourceAction,
    },

    /// Ask a question answered from a notebook's sources.
    Ask {
        notebook: String,
        conversation: String,
        question: String,

        /// Also keep the answer as an AI-authored note.
        #[arg(long)]
        save_note: bool,
    },

    Conversation {
        #[command(subcommand)]
        action: ConversationAction,
    },

    Note {
        #[command(subcommand)]
        action: NoteAction,
    },

    /// Inspect providers and bind roles to models.
    Provider {
        #[command(subcommand)]
        action: ProviderAction,
    },

    Podcast {
        #[command(subcommand)]
        action: PodcastAction,
    },
}

#[derive(Subcommand)]
enum NotebookAction {
    Create {
        title: String,
        #[arg(long)]
        description: Option<String>,
    },
    List,
    Show {
        id: String,
    },
    /// Delete a notebook and everything it owns.
    Delete {
        id: String,
    },
}

#[derive(Subcommand)]
enum SourceAction {
    /// Add one source and ingest it.
    Add {
        notebook: String,
        /// A local file.
        #[arg(long, conflicts_with_all = ["url", "text"])]
        file: Option<PathBuf>,
        /// An http(s) URL.
        #[arg(long, conflicts_with = "text")]
        url: Option<String>,
        /// Literal text.
        #[arg(long)]
        text: Option<String>,
        /// Declared MIME type for --file.
        #[arg(long)]
        mime: Option<String>,
        /// Title for --text.
        #[arg(long)]
        title: Option<String>,
    },
    /// Ingest every matching file under a directory.
    ImportDir {
        notebook: String,
        root: PathBuf,
        /// Glob relative to the root (repeatable). Defaults to every file.
        #[arg(long = "include")]
        include: Vec<String>,
        #[arg(long = "exclude")]
        exclude: Vec<String>,
    },
    Status {
        id: String,
    },
    /// Ingest a source again from its stored content.
    Reingest {
        id: String,
    },
    List {
        notebook: String,
    },
    Delete {
        id: String,
    },
}

#[derive(Subcommand)]
enum ConversationAction {
    New {
        notebook: String,
        #[arg(long, default_value = "")]
        title: String,
    },
    List {
        notebook: String,
    },
    /// Print a conversation transcript.
    Show {
        id: String,
    },
}

#[derive(Subcommand)]
enum NoteAction {
    Add {
        notebook: String,
        text: String,
        #[arg(long)]
        title: Option<String>,
        /// Source the note refers to.
        #[arg(long)]
        source: Option<String>,
    },
    List {
        notebook: String,
    },
    Delete {
        id: String,
    },
}

#[derive(Subcommand)]
enum ProviderAction {
    /// Configured providers and the models they know about.
    List,
    /// Current role bindings.
    Roles,
    /// Bind a role to a provider and model, persisted across restarts.
    SetRole {
        role: String,
        provider: String,
        model: String,
        /// Alternate as PROVIDER:MODEL, tried in order (repeatable).
        #[arg(long = "fallback", value_parser = parse_target)]
        fallbacks: Vec<ModelTarget>,
        #[arg(long)]
        temperature: Option<f32>,
        #[arg(long)]
        max_tokens: Option<u32>,
    },
    /// Remove a saved binding and return to the configured one.
    ResetRole {
        role: String,
    },
}

#[derive(Subcommand)]
enum PodcastAction {
    /// Write a podcast script from a notebook's sources and notes.
    Script {
        notebook: String,
        #[arg(long)]
        no_sources: bool,
        #[arg(long)]
        no_notes: bool,
        /// Voice the script through the speech role into this directory.
        #[arg(long)]
        render: Option<PathBuf>,
    },
}

fn parse_target(s: &str) -> Result<ModelTarget, String> {
    let (provider, model) = s
        .split_once(':')
        .ok_or_else(|| format!("invalid PROVIDER:MODEL: no ':' found in '{}'", s))?;
    Ok(ModelTarget::new(provider, model))
}

fn parse_role(s: &str) -> Result<Role> {
    Role::parse(s).with_context(|| {
        let names: Vec<&str> = Role::ALL.iter().map(|r| r.as_str()).collect();
        format!("Unknown role '{}'. Available: {}", s, names.join(", "))
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        let store = SqliteStore::open(&cfg).await?;
        store.close().await;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let app = App::open(cfg).await?;
    let result = run(&app, cli.command).await;
    app.store.close().await;
    result
}

async fn run(app: &App, command: Commands) -> Result<()> {
    match command {
        Commands::Init => {}
        Commands::Notebook { action } => notebook_cmd(app, action).await?,
        Commands::Source { action } => source_cmd(app, action).await?,
        Commands::Ask {
            notebook,
            conversation,
            question,
            save_note,
        } => {
            // Ctrl-C stops the question at its next step; nothing is saved.
            let cancelled = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&cancelled);
            let interrupt = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("cancelling after the current step...");
                    flag.store(true, Ordering::SeqCst);
                }
            });
            let answer = app
                .orchestrator
                .ask_cancellable(&notebook, &conversation, &question, &cancelled)
                .await;
            interrupt.abort();
            let answer = answer?;
            println!("{}", answer.answer_text);
            if answer.truncated {
                println!("\n(answer truncated by the model's output limit)");
            }
            if !answer.cited_chunk_ids.is_empty() {
                println!("\ncited chunks:");
                for id in &answer.cited_chunk_ids {
                    let chunk = app.store.get_chunk(id).await?;
                    let source = app.store.get_source(&chunk.source_id).await?;
                    println!("  {}  {} #{}", id, source.display_title(), chunk.ordinal);
                }
            }
            if save_note {
                let note = app
                    .orchestrator
                    .save_answer_as_note(&notebook, &answer, Some(&question))
                    .await?;
                println!("\nsaved note {}", note.id);
            }
        }
        Commands::Conversation { action } => match action {
            ConversationAction::New { notebook, title } => {
                let conversation = app.store.create_conversation(&notebook, &title).await?;
                println!("{}", conversation.id);
            }
            ConversationAction::List { notebook } => {
                for c in app.store.list_conversations(&notebook).await? {
                    println!("{}  {}  {}", c.id, c.created_at.format("%Y-%m-%d %H:%M"), c.title);
                }
            }
            ConversationAction::Show { id } => {
                let conversation = app.store.get_conversation(&id).await?;
                println!("# {}\n", conversation.title);
                for m in app.store.messages(&id).await? {
                    println!("[{}] {}: {}", m.seq, m.role.as_str(), m.text);
                    if !m.cited_chunk_ids.is_empty() {
                        println!("    cites: {}", m.cited_chunk_ids.join(", "));
                    }
                }
            }
        },
        Commands::Note { action } => match action {
            NoteAction::Add {
                notebook,
                text,
                title,
                source,
            } => {
                let note = app
                    .store
                    .create_note(NewNote {
                        notebook_id: notebook,
                        title,
                        text,
                        author: AuthorKind::Human,
                        source_id: source,
                    })
                    .await?;
                println!("{}", note.id);
            }
            NoteAction::List { notebook } => {
                for n in app.store.list_notes(&notebook).await? {
                    println!(
                        "{}  {}  [{}] {}",
                        n.id,
                        n.created_at.format("%Y-%m-%d %H:%M"),
                        n.author.as_str(),
                        n.title.as_deref().unwrap_or(&n.text)
                    );
                }
            }
            NoteAction::Delete { id } => {
                app.store.delete_note(&id).await?;
                println!("deleted note {}", id);
            }
        },
        Commands::Provider { action } => provider_cmd(app, action).await?,
        Commands::Podcast {
            action:
                PodcastAction::Script {
                    notebook,
                    no_sources,
                    no_notes,
                    render,
                },
        } => {
            let content = PodcastContent {
                sources: !no_sources,
                notes: !no_notes,
            };
            let script = match render {
                Some(dir) => {
                    let renderer = SpeechRenderer::new(
                        app.registry.clone(),
                        &app.config.podcast,
                        dir,
                    );
                    let (script, artifact) = app
                        .podcasts
                        .produce(&notebook, content, &renderer)
                        .await?;
                    eprintln!("audio written to {}", artifact.0);
                    script
                }
                None => app.podcasts.script(&notebook, content).await?,
            };
            for segment in &script.segments {
                println!("{}: {}", segment.speaker, segment.text);
            }
        }
    }
    Ok(())
}

async fn notebook_cmd(app: &App, action: NotebookAction) -> Result<()> {
    match action {
        NotebookAction::Create { title, description } => {
            let notebook = app
                .store
                .create_notebook(&title, description.as_deref())
                .await?;
            println!("{}", notebook.id);
        }
        NotebookAction::List => {
            for n in app.store.list_notebooks().await? {
                println!("{}  {}  {}", n.id, n.updated_at.format("%Y-%m-%d %H:%M"), n.title);
            }
        }
        NotebookAction::Show { id } => {
            let notebook = app.store.get_notebook(&id).await?;
            println!("{}", serde_json::to_string_pretty(&notebook)?);
            let sources = app.store.list_sources(&id).await?;
            let notes = app.store.list_notes(&id).await?;
            let conversations = app.store.list_conversations(&id).await?;
            println!(
                "sources: {}  notes: {}  conversations: {}",
                sources.len(),
                notes.len(),
                conversations.len()
            );
        }
        NotebookAction::Delete { id } => {
            app.store.delete_notebook(&id).await?;
            println!("deleted notebook {}", id);
        }
    }
    Ok(())
}

async fn source_cmd(app: &App, action: SourceAction) -> Result<()> {
    match action {
        SourceAction::Add {
            notebook,
            file,
            url,
            text,
            mime,
            title,
        } => {
            let descriptor = match (file, url, text) {
                (Some(path), None, None) => {
                    let bytes = tokio::fs::read(&path)
                        .await
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    SourceDescriptor::File {
                        bytes,
                        mime_type: mime,
                        filename: path
                            .file_name()
                            .map(|n| n.to_string_lossy().to_string()),
                    }
                }
                (None, Some(url), None) => SourceDescriptor::Url(url),
                (None, None, Some(text)) => SourceDescriptor::Text { text, title },
                _ => bail!("Pass exactly one of --file, --url or --text"),
            };
            let job = app.pipeline.submit(&notebook, descriptor).await?;
            println!("{}", job.source_id);
            let outcome = job.wait().await?;
            eprintln!(
                "ingested {} chunks ({} embedded)",
                outcome.chunks, outcome.embedded
            );
            for warning in &outcome.warnings {
                eprintln!("  warning: {}", warning);
            }
        }
        SourceAction::ImportDir {
            notebook,
            root,
            include,
            exclude,
        } => {
            let report = app
                .pipeline
                .import_dir(&notebook, &root, &include, &exclude)
                .await?;
            for (path, reason) in &report.skipped {
                eprintln!("skipped {}: {}", path.display(), reason);
            }
            let mut failed = 0usize;
            for job in report.jobs {
                let id = job.source_id.clone();
                match job.wait().await {
                    Ok(outcome) => println!("{}  {} chunks", id, outcome.chunks),
                    Err(e) => {
                        failed += 1;
                        println!("{}  failed: {}", id, e);
                    }
                }
            }
            if failed > 0 {
                bail!("{} source(s) failed to ingest", failed);
            }
        }
        SourceAction::Status { id } => {
            let report = app.pipeline.get_source_status(&id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        SourceAction::Reingest { id } => {
            let outcome = app.pipeline.reingest(&id).await?.wait().await?;
            println!("{}  version {}  {} chunks", id, outcome.version, outcome.chunks);
        }
        SourceAction::List { notebook } => {
            for s in app.store.list_sources(&notebook).await? {
                let marker = match s.status {
                    SourceStatus::Failed => "!",
                    SourceStatus::Done => " ",
                    _ => "~",
                };
                println!(
                    "{}{}  {:<10}  {}",
                    marker,
                    s.id,
                    s.status.as_str(),
                    s.display_title()
                );
            }
        }
        SourceAction::Delete { id } => {
            app.store.delete_source(&id).await?;
            println!("deleted source {}", id);
        }
    }
    Ok(())
}

async fn provider_cmd(app: &App, action: ProviderAction) -> Result<()> {
    match action {
        ProviderAction::List => {
            for (provider, models) in app.registry.available_models() {
                println!("{}", provider);
                for model in models {
                    println!("  {}", model);
                }
            }
        }
        ProviderAction::Roles => {
            for (role, binding) in app.registry.bindings() {
                let fallbacks: Vec<String> = binding
                    .fallbacks
                    .iter()
                    .map(|t| format!("{}:{}", t.provider, t.model))
                    .collect();
                println!(
                    "{:<14} {}:{}  temperature={} max_tokens={}{}",
                    role.as_str(),
                    binding.primary.provider,
                    binding.primary.model,
                    binding.options.temperature,
                    binding.options.max_tokens,
                    if fallbacks.is_empty() {
                        String::new()
                    } else {
                        format!("  fallbacks={}", fallbacks.join(","))
                    }
                );
            }
        }
        ProviderAction::SetRole {
            role,
            provider,
            model,
            fallbacks,
            temperature,
            max_tokens,
        } => {
            let role = parse_role(&role)?;
            let defaults = GenerationOptions::default();
            let mut binding = RoleBinding::new(ModelTarget::new(provider, model)).with_options(
                GenerationOptions {
                    temperature: temperature.unwrap_or(defaults.temperature),
                    max_tokens: max_tokens.unwrap_or(defaults.max_tokens),
                },
            );
            for fallback in fallbacks {
                binding = binding.with_fallback(fallback);
            }
            app.set_role(role, binding).await?;
            println!("bound {}", role.as_str());
        }
        ProviderAction::ResetRole { role } => {
            let role = parse_role(&role)?;
            app.reset_role(role).await?;
            println!("reset {}", role.as_str());
        }
    }
    Ok(())
}
