use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    ChangeFeed, HttpRemoteStore, ListenConfig, MissingChangeFeed, NavigationController,
    Reconciler, ReconcilerEvent, VoiceCommandBridge, WsChangeFeed,
};
use shared::domain::Category;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::{info, warn};

mod commands;
mod settings;
mod speech;

use commands::{find_category, parse_line, render_categories, render_projection, ConsoleCommand, HELP};
use speech::ConsoleSpeech;

#[derive(Parser, Debug)]
#[command(about = "Presents one category at a time, driven by the console or voice")]
struct Args {
    /// Settings file; defaults to ./presenter.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    /// Category id or name to open at startup.
    #[arg(long)]
    category: Option<String>,
    /// Skip the change feed; the projection only updates on resync.
    #[arg(long)]
    no_live: bool,
    #[arg(long)]
    no_voice: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut settings = settings::load(args.config.as_deref())?;
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if args.category.is_some() {
        settings.category = args.category;
    }
    settings.live &= !args.no_live;
    settings.voice &= !args.no_voice;
    info!(server_url = %settings.server_url, live = settings.live, voice = settings.voice, "starting presenter");

    let store = Arc::new(HttpRemoteStore::new(&settings.server_url));
    let feed: Arc<dyn ChangeFeed> = if settings.live {
        Arc::new(WsChangeFeed::new(&settings.server_url)?)
    } else {
        Arc::new(MissingChangeFeed)
    };
    let reconciler = Reconciler::new(store, feed);
    let navigator = NavigationController::new(reconciler.clone());

    let mut updates = reconciler.subscribe_events();
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(ReconcilerEvent::ProjectionChanged(projection)) => {
                    println!("{}", render_projection(&projection));
                }
                Ok(ReconcilerEvent::SyncFailed(message)) => println!("! {message}"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "presenter display lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let (speech, mut microphone) = ConsoleSpeech::new();
    if settings.voice {
        let bridge = VoiceCommandBridge::new(navigator.clone());
        let listen = ListenConfig {
            continuous: true,
            locale: settings.locale.clone(),
        };
        tokio::spawn(async move {
            if let Err(err) = bridge.run(&speech, listen).await {
                warn!(%err, "voice commands unavailable");
            }
        });
    }

    let mut categories = reconciler
        .list_categories()
        .await
        .context("failed to list categories")?;
    match settings.category.as_deref() {
        Some(wanted) => open(&reconciler, &categories, wanted).await,
        None => println!("{}\n{HELP}", render_categories(&categories)),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match parse_line(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                println!("? {message}");
                continue;
            }
        };
        let outcome = match command {
            ConsoleCommand::Next => navigator.next().await.map(drop),
            ConsoleCommand::Previous => navigator.previous().await.map(drop),
            ConsoleCommand::GoTo(index) => match navigator.go_to(index).await {
                Ok(None) => {
                    println!("? no item at position {}", index + 1);
                    Ok(())
                }
                other => other.map(drop),
            },
            ConsoleCommand::Say(text) => {
                if !settings.voice {
                    println!("? voice commands are turned off");
                } else if let Err(err) = microphone.say(&text).await {
                    println!("? {err}");
                }
                Ok(())
            }
            ConsoleCommand::Resync => reconciler.resync().await,
            ConsoleCommand::Categories => {
                match reconciler.list_categories().await {
                    Ok(fresh) => {
                        categories = fresh;
                        println!("{}", render_categories(&categories));
                    }
                    Err(err) => println!("! {err}"),
                }
                Ok(())
            }
            ConsoleCommand::Use(wanted) => {
                open(&reconciler, &categories, &wanted).await;
                Ok(())
            }
            ConsoleCommand::Show => {
                println!("{}", render_projection(&reconciler.snapshot().await));
                Ok(())
            }
            ConsoleCommand::Help => {
                println!("{HELP}");
                Ok(())
            }
            ConsoleCommand::Quit => break,
        };
        if let Err(err) = outcome {
            warn!(%err, "command failed");
        }
    }

    reconciler.shutdown().await;
    info!("presenter stopped");
    Ok(())
}

async fn open(reconciler: &Arc<Reconciler>, categories: &[Category], wanted: &str) {
    let Some(category) = find_category(categories, wanted).cloned() else {
        println!("? no category matches {wanted:?}");
        return;
    };
    if let Err(err) = reconciler.select_category(category).await {
        warn!(%err, retry = err.is_retryable_by_resync(), "category opened with errors");
    }
}
