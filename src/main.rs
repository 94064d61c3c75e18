mod app;
mod cache;
mod config;
mod error;
mod event;
mod logging;
mod net;
mod push;
mod queue;
mod sync;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;

use crate::queue::Payload;

#[derive(Parser, Debug)]
#[command(name = "cpf-offline")]
#[command(about = "Offline cache and background form sync for the Kings Park CPF site")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/cpf-offline/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Site origin to use
  #[arg(short, long)]
  origin: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the asset manifest into a new cache generation
  Install,
  /// Purge old cache generations and serve from the current one
  Activate,
  /// Show cache generation, queue depth and pending sync tags
  Status,
  /// Fetch a page or asset through the cache
  Fetch {
    /// Path or URL
    url: String,
    /// Accept header to send
    #[arg(long, default_value = "text/html")]
    accept: String,
  },
  /// Submit a report form, queuing it when offline
  Submit {
    /// Form field as name=value (repeatable)
    #[arg(short, long = "field", value_parser = parse_field)]
    fields: Vec<(String, String)>,
    /// Anti-forgery token from the form
    #[arg(short, long)]
    token: String,
    /// Page to continue at after submitting
    #[arg(long)]
    success_url: Option<String>,
    /// Skip the connectivity check and queue
    #[arg(long)]
    offline: bool,
  },
  /// List queued submissions
  Queue,
  /// Run a deferred-sync wake event
  Sync {
    /// Sync tag (defaults to the configured one)
    #[arg(long)]
    tag: Option<String>,
  },
  /// Show a push notification from a JSON payload
  Push {
    /// JSON payload with optional title, message and url
    payload: Option<String>,
    /// Follow the notification as if clicked
    #[arg(long)]
    click: bool,
  },
  /// Watch connectivity and sync queued reports when back online
  Watch,
}

fn parse_field(s: &str) -> Result<(String, String)> {
  let (name, value) = s
    .split_once('=')
    .ok_or_else(|| eyre!("expected name=value, got '{}'", s))?;
  if name.is_empty() {
    return Err(eyre!("field name is empty in '{}'", s));
  }
  Ok((name.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;

  // Override origin if specified on command line
  if let Some(origin) = args.origin {
    config.origin =
      url::Url::parse(&origin).map_err(|e| eyre!("Invalid origin '{}': {}", origin, e))?;
  }

  let _guard = logging::init(config.log_dir.as_deref())?;

  let app = app::App::new(config)?;

  match args.command {
    Command::Install => app.install().await,
    Command::Activate => app.activate().await,
    Command::Status => app.status(),
    Command::Fetch { url, accept } => app.fetch(&url, &accept).await,
    Command::Submit {
      fields,
      token,
      success_url,
      offline,
    } => {
      let fields: Payload = fields.into_iter().collect();
      app.submit(fields, token, success_url, offline).await
    }
    Command::Queue => app.list_queue(),
    Command::Sync { tag } => app.sync(tag).await,
    Command::Push { payload, click } => app.push(payload, click).await,
    Command::Watch => app.watch().await,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_field() {
    assert_eq!(
      parse_field("description=theft").unwrap(),
      ("description".to_string(), "theft".to_string())
    );
    assert_eq!(
      parse_field("note=a=b").unwrap(),
      ("note".to_string(), "a=b".to_string())
    );
    assert_eq!(
      parse_field("empty=").unwrap(),
      ("empty".to_string(), String::new())
    );
    assert!(parse_field("novalue").is_err());
    assert!(parse_field("=x").is_err());
  }

  #[test]
  fn test_cli_parses_submit() {
    let args = Args::try_parse_from([
      "cpf-offline",
      "submit",
      "-f",
      "description=theft",
      "--field",
      "location=corner",
      "--token",
      "abc123",
      "--offline",
    ])
    .unwrap();

    match args.command {
      Command::Submit {
        fields,
        token,
        offline,
        ..
      } => {
        assert_eq!(fields.len(), 2);
        assert_eq!(token, "abc123");
        assert!(offline);
      }
      other => panic!("unexpected command {:?}", other),
    }
  }
}
