use clap::Parser;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

use schoolchat::api::client::ApiClient;
use schoolchat::api::socket::{run_socket, socket_url};
use schoolchat::app::ClientConfig;
use schoolchat::session::{Session, SessionHandle, run_dispatcher};
use schoolchat::storage::ChatCache;
use schoolchat::sync::{ChatSyncEngine, Outbox};
use schoolchat::utils::{RUNTIME, spawn_async};
use schoolchat::{ApiError, ChatId, ClientError, DeliveryStatus, MessageContent, MessageId, TempId};

#[derive(Parser)]
#[command(name = "schoolchat", version, about = "Headless client for the school chat backend")]
struct Args {
    /// Config file to use instead of the platform default
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Chat to open on startup
    #[arg(short, long, value_name = "CHAT_ID")]
    chat: Option<String>,
    /// Skip the local chat list cache
    #[arg(long)]
    no_cache: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if let Err(e) = RUNTIME.block_on(run(args)) {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), ClientError> {
    let mut cfg = match &args.config {
        Some(path) => ClientConfig::load_from(path)?,
        None => ClientConfig::load(),
    };
    cfg.require()?;

    let mut api = ApiClient::from_config(&cfg)?;
    match api.ping().await {
        Ok(code) => debug!("server answered ping with HTTP {}", code),
        Err(e) => warn!("server not reachable yet: {}", e),
    }
    if api.token().is_none() {
        match api.obtain_token().await {
            Ok(token) => {
                api.set_token(token.clone());
                cfg.token = Some(token);
                let saved = match &args.config {
                    Some(path) => cfg.save_to(path),
                    None => cfg.save(),
                };
                if let Err(e) = saved {
                    warn!("could not store token: {}", e);
                }
            }
            Err(e) => warn!("continuing without token: {}", e),
        }
    }
    let api = Arc::new(api);

    let (outbox, outbox_rx) = Outbox::channel();
    let engine = ChatSyncEngine::new(cfg.user_id.clone(), outbox, cfg.engine_settings());
    let (mut session, handle) = Session::new(engine, Duration::from_secs(1));
    let changes = session.change_feed();
    let session_task = spawn_async(async move {
        let engine = session.run().await;
        info!(
            "session ended, {} pending sends, {} anomalies",
            engine.pending_count(),
            engine.anomalies().total()
        );
    });

    spawn_async(run_dispatcher(
        api.clone(),
        outbox_rx,
        handle.clone(),
        cfg.request_timeout(),
    ));
    let ws = socket_url(&cfg.websocket_url().map_err(ApiError::from)?, api.token());
    spawn_async(run_socket(ws, handle.clone(), cfg.reconnect_delay()));

    let mut cache = if args.no_cache {
        None
    } else {
        match ChatCache::open_default() {
            Ok(cache) => Some(cache),
            Err(e) => {
                warn!("chat cache unavailable: {}", e);
                None
            }
        }
    };
    if let Some(cache) = &cache {
        match cache.get_chats(Some(200)) {
            Ok(cached) if !cached.is_empty() => {
                handle.load_chats(cached);
            }
            Ok(_) => {}
            Err(e) => warn!("could not read chat cache: {}", e),
        }
    }
    match api.chats(1000).await {
        Ok((chats, raw)) => {
            if let Some(cache) = cache.as_mut() {
                if let Err(e) = cache.upsert_chats(&chats, Some(&raw)) {
                    warn!("could not update chat cache: {}", e);
                }
            }
            info!("loaded {} chats", chats.len());
            handle.load_chats(chats);
        }
        Err(e) => warn!("Failed to load chats: {}", e),
    }

    let (current_tx, current_rx) = watch::channel::<Option<ChatId>>(None);
    if let Some(chat) = args.chat {
        open(&api, &handle, &current_tx, ChatId::from(chat), cfg.history_page_size).await?;
    }
    spawn_async(print_changes(handle.clone(), changes, current_rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix('/') {
            let (cmd, arg) = rest.split_once(' ').unwrap_or((rest, ""));
            let arg = arg.trim();
            match cmd {
                "quit" | "q" => break,
                "open" => {
                    open(&api, &handle, &current_tx, ChatId::from(arg), cfg.history_page_size)
                        .await?
                }
                "chats" => {
                    let chats = handle.chat_list().await.ok_or(ClientError::SessionClosed)?;
                    for c in chats {
                        let pin = if c.pinned { "*" } else { " " };
                        println!("{}{} {} ({} unread)", pin, c.id, c.title, c.unread);
                    }
                }
                "retry" | "cancel" => match arg.parse::<TempId>() {
                    Ok(temp_id) => {
                        let res = if cmd == "retry" {
                            handle.retry(temp_id).await
                        } else {
                            handle.cancel(temp_id).await
                        };
                        match res {
                            Some(Ok(())) => {}
                            Some(Err(e)) => println!("{}", e),
                            None => return Err(ClientError::SessionClosed),
                        }
                    }
                    Err(_) => println!("usage: /{} <temp id>", cmd),
                },
                _ => println!("commands: /open <chat>, /chats, /retry <id>, /cancel <id>, /quit"),
            }
            continue;
        }
        let current = current_tx.borrow().clone();
        let Some(chat_id) = current else {
            println!("no chat open, use /open <chat>");
            continue;
        };
        handle
            .send_message(chat_id, MessageContent::text(line), None)
            .await
            .ok_or(ClientError::SessionClosed)?;
    }

    handle.shutdown();
    let _ = session_task.await;
    Ok(())
}

async fn open(
    api: &ApiClient,
    handle: &SessionHandle,
    current: &watch::Sender<Option<ChatId>>,
    chat_id: ChatId,
    page_size: usize,
) -> Result<(), ClientError> {
    match api.history(&chat_id, None, page_size).await {
        Ok(messages) => {
            handle.merge_history(chat_id.clone(), messages);
        }
        Err(e) => warn!("could not load history for {}: {}", chat_id, e),
    }
    match handle.open_chat(chat_id.clone()).await {
        Some(Ok(())) => {
            current.send_replace(Some(chat_id.clone()));
            print_chat(handle, chat_id).await;
        }
        Some(Err(e)) => println!("{}", e),
        None => return Err(ClientError::SessionClosed),
    }
    Ok(())
}

async fn print_chat(handle: &SessionHandle, chat_id: ChatId) {
    let Some(snapshot) = handle.snapshot(chat_id).await else {
        return;
    };
    println!("--- {} ---", snapshot.chat.title);
    let start = snapshot.messages.len().saturating_sub(20);
    for m in &snapshot.messages[start..] {
        let mark = match (m.status, m.id) {
            (DeliveryStatus::Failed, MessageId::Temp(t)) => format!("failed, /retry {}", t),
            (status, _) => status.to_string(),
        };
        let edited = if m.edited_at.is_some() { " (edited)" } else { "" };
        let reactions: String = m.reactions.iter().map(|r| r.emoji.as_str()).collect();
        println!("[{}] {}: {}{} {}", mark, m.sender_id, m.content.preview(), edited, reactions);
    }
}

async fn print_changes(
    handle: SessionHandle,
    mut changes: mpsc::UnboundedReceiver<ChatId>,
    current: watch::Receiver<Option<ChatId>>,
) {
    while let Some(chat_id) = changes.recv().await {
        let is_current = current.borrow().as_ref() == Some(&chat_id);
        if is_current {
            print_chat(&handle, chat_id).await;
        }
    }
}
