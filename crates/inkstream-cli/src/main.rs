mod commands;
mod logging;
mod render;

use anyhow::{Context, Result};
use clap::Parser;
use commands::{parse_command, WatchCommand, HELP};
use inkstream_sync::config::DEFAULT_PAGE_SIZE;
use inkstream_sync::{
    derive_channel_url, EngineHandle, HttpNotificationApi, IdentityGate, NotificationView,
    Principal, SyncConfig, SyncEngine,
};
use logging::LogSettings;
use std::{env, sync::Arc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};
use url::Url;

const DEFAULT_API_URL: &str = "http://127.0.0.1:5000/api";
const DEFAULT_LOG_DIR: &str = ".inkstream/logs";
const BELL_ITEMS: usize = 5;

#[derive(Parser, Debug)]
#[command(name = "inkstream-watch")]
#[command(about = "Live notification bell for an inkstream account", long_about = None)]
struct Args {
    #[arg(long, default_value = "")]
    api_url: String,
    #[arg(long, default_value = "")]
    channel_url: String,
    #[arg(long, default_value = "")]
    user: String,
    #[arg(long, default_value = "")]
    token: String,
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: u32,
    /// Entries shown under the bell.
    #[arg(long, default_value_t = BELL_ITEMS)]
    bell_items: usize,
    #[arg(long, default_value = "")]
    log_dir: String,
    /// Print every view as a JSON line instead of the bell.
    #[arg(long)]
    json: bool,
}

struct RuntimeConfig {
    sync: SyncConfig,
    user: String,
    token: String,
    bell_items: usize,
    json: bool,
    log: LogSettings,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args)?;
    logging::init(&config.log);

    let identity = IdentityGate::new();
    let api = Arc::new(HttpNotificationApi::new(&config.sync).context("building http client")?);
    let (engine, handle) = SyncEngine::new(&config.sync, api, identity.clone());
    let engine_task = tokio::spawn(engine.run());
    info!(
        "inkstream_watch_start api={} channel={}",
        config.sync.api_base, config.sync.channel_url
    );

    let render_task = tokio::spawn(render_loop(
        handle.subscribe(),
        config.bell_items,
        config.json,
    ));

    if !config.user.trim().is_empty() && !config.token.trim().is_empty() {
        identity.login(Principal::new(config.user.clone(), config.token.clone()));
    } else {
        println!("not signed in; use `login <user> <token>`");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line.context("reading stdin")?,
        };
        let Some(line) = line else {
            break;
        };
        match parse_command(&line) {
            Ok(Some(command)) => {
                if execute(&handle, command).await == Flow::Quit {
                    break;
                }
            }
            Ok(None) => {}
            Err(err) => eprintln!("{err}"),
        }
    }

    identity.logout();
    drop(handle);
    let _ = engine_task.await;
    render_task.abort();
    info!("inkstream_watch_stop");
    Ok(())
}

async fn execute(handle: &EngineHandle, command: WatchCommand) -> Flow {
    let outcome = match command {
        WatchCommand::Read(id) => handle
            .mark_read(id)
            .await
            .map(|state| format!("read #{id}: {}", state.as_str())),
        WatchCommand::ReadAll => handle
            .mark_all_read()
            .await
            .map(|state| format!("read-all: {}", state.as_str())),
        WatchCommand::Delete(id) => handle
            .delete(id)
            .await
            .map(|state| format!("delete #{id}: {}", state.as_str())),
        WatchCommand::Open(id) => handle.open(id).await.map(|url| match url {
            Some(url) => format!("navigate: {url}"),
            None => format!("#{id} has no link"),
        }),
        WatchCommand::Refresh => handle.refresh().await.map(|_| "refreshing".to_string()),
        WatchCommand::Dismiss => handle.dismiss_notice().await.map(|_| String::new()),
        WatchCommand::Login { user, token } => {
            handle.identity().login(Principal::new(user, token));
            Ok(String::new())
        }
        WatchCommand::Logout => {
            handle.identity().logout();
            Ok(String::new())
        }
        WatchCommand::Help => Ok(HELP.to_string()),
        WatchCommand::Quit => return Flow::Quit,
    };
    match outcome {
        Ok(message) if message.is_empty() => {}
        Ok(message) => println!("{message}"),
        Err(err) => eprintln!("error: {err}"),
    }
    Flow::Continue
}

async fn render_loop(mut views: watch::Receiver<NotificationView>, bell_items: usize, json: bool) {
    loop {
        let view = views.borrow_and_update().clone();
        if json {
            match serde_json::to_string(&view) {
                Ok(line) => println!("{line}"),
                Err(err) => warn!("view_encode_error: {err}"),
            }
        } else {
            println!("{}", render::render_bell(&view, bell_items));
        }
        if views.changed().await.is_err() {
            break;
        }
    }
}

fn load_config(args: Args) -> Result<RuntimeConfig> {
    let api_base = resolve_api_url(&args.api_url)?;
    let channel_url = resolve_channel_url(&args.channel_url, &api_base)?;
    let mut sync = SyncConfig::new(api_base, channel_url);
    sync.page_size = args.page_size.max(1);
    let user = resolve_value(&args.user, env::var("INKSTREAM_USER").ok(), "");
    let log = LogSettings {
        dir: resolve_value(
            &args.log_dir,
            env::var("INKSTREAM_LOG_DIR").ok(),
            DEFAULT_LOG_DIR,
        ),
        user: user.clone(),
        mirror_stdout: resolve_log_stdout(),
    };
    Ok(RuntimeConfig {
        sync,
        user,
        token: resolve_value(&args.token, env::var("INKSTREAM_TOKEN").ok(), ""),
        bell_items: args.bell_items,
        json: args.json,
        log,
    })
}

/// Flag, then environment, then default; blank values fall through.
fn resolve_value(flag: &str, env_value: Option<String>, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    if let Some(value) = env_value {
        if !value.trim().is_empty() {
            return value.trim().to_string();
        }
    }
    default.to_string()
}

fn resolve_api_url(flag: &str) -> Result<Url> {
    let raw = resolve_value(flag, env::var("INKSTREAM_API_URL").ok(), DEFAULT_API_URL);
    Url::parse(&raw).with_context(|| format!("invalid api url {raw}"))
}

fn resolve_channel_url(flag: &str, api_base: &Url) -> Result<Url> {
    let raw = resolve_value(flag, env::var("INKSTREAM_CHANNEL_URL").ok(), "");
    if raw.is_empty() {
        return derive_channel_url(api_base).context("deriving channel url");
    }
    Url::parse(&raw).with_context(|| format!("invalid channel url {raw}"))
}

fn resolve_log_stdout() -> bool {
    env::var("INKSTREAM_LOG_STDOUT")
        .ok()
        .and_then(|value| parse_bool_env(&value))
        .unwrap_or(false)
}

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" | "on" | "ON" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" | "off" | "OFF" => Some(false),
        _ => None,
    }
}
