//! `stride`: line-oriented chat over a local platform database.
//!
//! # Usage
//!
//! ```text
//! stride start --user <UUID> --with <UUID>
//! stride chat --conversation 3 --user <UUID>
//! stride --database ~/.local/share/stride/stride.db chat --conversation 3 --user <UUID>
//! ```
//!
//! Settings come from `stride.toml` (or `--config`), then `STRIDE_*`
//! environment variables (`STRIDE_CHAT__PAGE_SIZE=50`), then flags.

mod input;

use std::{
  collections::HashSet,
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::{Context as _, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use input::Input;
use serde::Deserialize;
use stride_chat::{Attachment, ChatClient, ChatConfig, ConversationController, ConversationView};
use stride_core::message::{ConversationId, Message, UserId};
use stride_local::LocalPlatform;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

// ─── CLI args ────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "stride", version, about = "Chat over a local Stride platform database")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "stride.toml")]
  config: PathBuf,

  /// SQLite database path; overrides the config file.
  #[arg(long, value_name = "PATH")]
  database: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Print the direct conversation between two users, creating it if needed.
  Start {
    #[arg(long)]
    user: UserId,
    #[arg(long = "with", value_name = "USER")]
    other: UserId,
  },
  /// Open a conversation and chat from stdin.
  Chat {
    #[arg(long)]
    conversation: ConversationId,
    #[arg(long)]
    user: UserId,
  },
}

// ─── Config ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct Settings {
  #[serde(default = "default_database")]
  database: PathBuf,
  #[serde(default)]
  chat:     ChatConfig,
}

fn default_database() -> PathBuf { PathBuf::from("~/.local/share/stride/stride.db") }

fn load_settings(cli: &Cli) -> Result<Settings> {
  let settings = config::Config::builder()
    .add_source(config::File::from(cli.config.clone()).required(false))
    .add_source(config::Environment::with_prefix("STRIDE").separator("__"))
    .set_override_option(
      "database",
      cli.database.as_ref().map(|p| p.to_string_lossy().into_owned()),
    )
    .context("invalid --database")?
    .build()
    .context("failed to read config file")?;

  settings
    .try_deserialize()
    .context("failed to deserialise settings")
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}

// ─── Entry point ─────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();
  let settings = load_settings(&cli)?;

  let db_path = expand_tilde(&settings.database);
  if let Some(dir) = db_path.parent()
    && !dir.as_os_str().is_empty()
  {
    std::fs::create_dir_all(dir)
      .with_context(|| format!("failed to create {}", dir.display()))?;
  }
  let platform = LocalPlatform::open(&db_path)
    .await
    .with_context(|| format!("failed to open database at {db_path:?}"))?;

  match cli.command {
    Command::Start { user, other } => {
      platform.sign_in(user).await.context("sign-in failed")?;
      let client = ChatClient::new(Arc::new(platform), settings.chat);
      let id = client
        .start_direct_conversation(other)
        .await
        .context("failed to start conversation")?;
      println!("{id}");
    }
    Command::Chat { conversation, user } => {
      platform.sign_in(user).await.context("sign-in failed")?;
      let client = ChatClient::new(Arc::new(platform), settings.chat);
      chat(&client, conversation, user).await?;
      client.shutdown().await;
    }
  }
  Ok(())
}

// ─── Chat loop ───────────────────────────────────────────────────────────────

async fn chat(client: &ChatClient<LocalPlatform>, conversation: ConversationId, me: UserId) -> Result<()> {
  let controller = client
    .open(conversation, me)
    .await
    .with_context(|| format!("failed to open conversation {conversation}"))?;
  info!(conversation, live = controller.snapshot().live, "conversation open; /help for commands");

  let mut view = controller.watch();
  let printer = tokio::spawn(async move {
    let mut printer = Printer { me, shown: HashSet::new(), error: None };
    loop {
      let snapshot = view.borrow_and_update().clone();
      printer.render(&snapshot);
      if view.changed().await.is_err() {
        break;
      }
    }
  });

  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
    match input::parse(&line) {
      Ok(Input::Quit) => break,
      Ok(input) => handle(&controller, input).await,
      Err(message) => eprintln!("{message}"),
    }
  }

  controller.close().await;
  printer.abort();
  Ok(())
}

async fn handle(controller: &ConversationController<LocalPlatform>, input: Input) {
  let outcome = match input {
    Input::Text(text) => controller.send_text(&text).await.map(drop),
    Input::Older => match controller.load_older().await {
      Ok(false) if !controller.snapshot().has_older => {
        eprintln!("no older messages");
        Ok(())
      }
      other => other.map(drop),
    },
    Input::Attach { path, content_type } => match tokio::fs::read(&path).await {
      Ok(data) => controller
        .send_attachment(Attachment {
          data: Bytes::from(data),
          content_type,
          width: None,
          height: None,
        })
        .await
        .map(drop),
      Err(e) => {
        eprintln!("cannot read {}: {e}", path.display());
        Ok(())
      }
    },
    Input::Help => {
      eprintln!("{}", input::HELP);
      Ok(())
    }
    Input::Empty | Input::Quit => Ok(()),
  };
  if let Err(e) = outcome {
    eprintln!("error: {e}");
  }
}

// ─── Output ──────────────────────────────────────────────────────────────────

struct Printer {
  me:    UserId,
  shown: HashSet<i64>,
  error: Option<String>,
}

impl Printer {
  fn render(&mut self, view: &ConversationView) {
    for message in &view.messages {
      if self.shown.insert(message.id) {
        println!("{}", self.line(message));
      }
    }
    if view.error != self.error {
      if let Some(error) = &view.error {
        eprintln!("! {error}");
      }
      self.error = view.error.clone();
    }
  }

  fn line(&self, message: &Message) -> String {
    let who = if message.author_id == self.me {
      "you".to_owned()
    } else {
      message.author_id.simple().to_string()[..8].to_owned()
    };
    let at = message.created_at.format("%H:%M");
    let content = if message.deleted_at.is_some() {
      "(deleted)".to_owned()
    } else if message.kind.is_attachment() {
      match &message.metadata {
        Some(meta) => format!("[{} {} bytes: {}]", meta.mime_type, meta.size, meta.path),
        None => "[uploading…]".to_owned(),
      }
    } else {
      message.body.clone().unwrap_or_default()
    };
    format!("{at} {who:>8} │ {content}")
  }
}
