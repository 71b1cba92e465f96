use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use realchat_client::api::client::{ApiClient, ChatDirectory};
use realchat_client::api::models::ProfileUpdate;
use realchat_client::app::AppState;
use realchat_client::auth;
use realchat_client::session::transport::WsConnector;
use realchat_client::storage::Storage;
use realchat_client::store::{self, ConversationStore, SharedStore};
use realchat_client::sync::ConversationSync;
use realchat_client::{
    ConnectionStatus, Identity, MessageDraft, SessionHandle, SessionManager, SessionNotice, SessionSettings,
};

type CliResult<T> = Result<T, Box<dyn Error>>;

#[derive(Parser)]
#[command(name = "realchat", version, about = "Terminal client for RealChat")]
struct Cli {
    /// Chat server base url
    #[arg(long, env = "REALCHAT_API_BASE_URL")]
    api_base_url: Option<String>,

    /// Language messages are sent in
    #[arg(long, env = "REALCHAT_LANG")]
    lang: Option<String>,

    /// Where cached conversations are kept
    #[arg(long)]
    state_db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with a one-time code sent by email
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Open the interactive chat
    Chat,
    /// Forget the saved session and cached conversations
    Logout,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    let mut state = AppState::load();
    if let Some(url) = cli.api_base_url {
        state.api_base_url = url;
    }
    if let Some(lang) = cli.lang {
        state.language = lang;
    }
    let storage = match cli.state_db {
        Some(path) => Storage::open(path)?,
        None => Storage::open_default()?,
    };

    match cli.command {
        Commands::Login { email, name } => login(&mut state, &email, name.as_deref()).await,
        Commands::Chat => chat(&mut state, storage).await,
        Commands::Logout => {
            let store = ConversationStore::new().shared();
            auth::logout(&mut state, &store);
            storage.clear()?;
            state.save()?;
            println!("Signed out.");
            Ok(())
        }
    }
}

async fn read_line(prompt: &str) -> CliResult<String> {
    println!("{}", prompt);
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(line.trim().to_string())
}

async fn login(state: &mut AppState, email: &str, name: Option<&str>) -> CliResult<()> {
    let api = ApiClient::new(&state.api_base_url);
    auth::request_otp(&api, email).await?;
    let code = read_line(&format!("Enter the code sent to {}:", email)).await?;
    let identity = auth::verify_otp(&api, state, email, &code, name).await?;
    state.save()?;
    println!("Signed in as {}.", identity.label());
    Ok(())
}

async fn chat(state: &mut AppState, storage: Storage) -> CliResult<()> {
    let api = Arc::new(ApiClient::new(&state.api_base_url).with_token(state.token.clone()));
    if let Err(e) = api.health_check().await {
        warn!("Server at {} is not answering: {}", state.api_base_url, e);
    }
    let had_credentials = state.credentials().is_some();
    let Some(mut identity) = auth::restore_identity(api.as_ref(), state).await else {
        if had_credentials {
            auth::discard_rejected_session(state, &storage);
        }
        state.save()?;
        println!("Not signed in. Run `realchat login --email <address>` first.");
        return Ok(());
    };

    let cached = storage.load().unwrap_or_else(|e| {
        warn!("Ignoring conversation cache: {}", e);
        Default::default()
    });
    let store = ConversationStore::restore(cached).shared();
    let directory: Arc<dyn ChatDirectory> = api.clone();
    let sync = ConversationSync::new(Arc::clone(&directory), store.clone());
    if let Err(e) = sync.load_conversations(&identity).await {
        warn!("Showing cached conversations: {}", e);
    }

    let settings = SessionSettings::new(state.api_base_url.clone(), state.language.clone());
    let (manager, rx) = SessionManager::new(settings, store.clone(), directory, Box::new(WsConnector));
    let handle = manager.spawn(rx);
    spawn_printers(&handle, &identity, state.clone(), storage.clone());
    handle.sign_in(identity.clone());

    println!("Signed in as {}. Type /list to see conversations, /quit to leave.", identity.label());
    let mut cli = Chat {
        handle: &handle,
        sync: &sync,
        store: &store,
        api: api.as_ref(),
        state,
    };
    let result = cli.repl(&mut identity).await;

    let rejected = handle.status() == ConnectionStatus::AuthFailed;
    handle.shutdown();
    if rejected {
        return result;
    }
    let snapshot = store::lock(&store).snapshot();
    if let Err(e) = storage.save(&snapshot) {
        warn!("Could not cache conversations: {}", e);
    }
    result
}

fn spawn_printers(handle: &SessionHandle, me: &Identity, mut state: AppState, storage: Storage) {
    let mut notices = handle.subscribe();
    let me_id = me.user_id.clone();
    tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(SessionNotice::MessageAdded { conversation_id, message }) if message.sender_id != me_id => {
                    println!("[{}] {}: {}", conversation_id, message.sender_name, message.content);
                }
                Ok(SessionNotice::ConversationsReplaced) => println!("(conversation list updated)"),
                Ok(SessionNotice::ServerError(e)) => println!("server error: {}", e),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("Missed {} session notices", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut status = handle.watch_status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            info!("Connection: {}", current);
            if current == ConnectionStatus::AuthFailed {
                println!("The server rejected this session. Run `realchat login --email <address>` to sign in again.");
                auth::discard_rejected_session(&mut state, &storage);
                if let Err(e) = state.save() {
                    warn!("Could not save settings: {}", e);
                }
            }
        }
    });
}

struct Chat<'a> {
    handle: &'a SessionHandle,
    sync: &'a ConversationSync,
    store: &'a SharedStore,
    api: &'a ApiClient,
    state: &'a mut AppState,
}

impl Chat<'_> {
    async fn repl(&mut self, me: &mut Identity) -> CliResult<()> {
        let (handle, sync, store) = (self.handle, self.sync, self.store);
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
            let rest = rest.trim();
            match cmd {
                "/quit" => break,
                "/status" => println!("{}", handle.status()),
                "/list" => print_conversations(store),
                "/open" => {
                    let mut guard = store::lock(store);
                    if guard.conversation(rest).is_some() {
                        guard.set_active_conversation(Some(rest.to_string()));
                        for msg in guard.messages(rest) {
                            println!("  {}: {}", msg.sender_name, msg.content);
                        }
                    } else {
                        println!("No conversation {}", rest);
                    }
                }
                "/dm" => match sync.search_users(me, rest).await {
                    Ok(found) => match found.first() {
                        Some(peer) => {
                            let id = sync.open_direct_conversation(me, peer).await;
                            println!("Opened {} with {}", id, peer.short_name());
                        }
                        None => println!("Nobody new matches {:?}", rest),
                    },
                    Err(e) => println!("Search failed: {}", e),
                },
                "/group" => {
                    let (name, members) = rest.split_once(' ').unwrap_or((rest, ""));
                    let members: Vec<String> = members
                        .split(',')
                        .map(str::trim)
                        .filter(|m| !m.is_empty())
                        .map(str::to_string)
                        .collect();
                    if let Err(e) = handle.create_group(name, members).await {
                        println!("Could not create group: {}", e);
                    }
                }
                "/join" => {
                    if let Err(e) = handle.join_group(rest).await {
                        println!("Could not join group: {}", e);
                    }
                }
                "/delete" => match sync.delete_conversation(rest).await {
                    Ok(()) => println!("Deleted {}", rest),
                    Err(e) => println!("Could not delete {}: {}", rest, e),
                },
                "/presence" => match sync.refresh_presence(me).await {
                    Ok(n) => {
                        println!("{} online", n);
                        print_conversations(store);
                    }
                    Err(e) => println!("Could not load presence: {}", e),
                },
                "/name" if !rest.is_empty() => {
                    let update = ProfileUpdate {
                        display_name: Some(rest.to_string()),
                        ..ProfileUpdate::default()
                    };
                    match auth::update_profile(self.api, me, self.state, &update).await {
                        Ok(()) => {
                            if let Err(e) = self.state.save() {
                                warn!("Could not save settings: {}", e);
                            }
                            println!("You are now {}. New messages use it after a restart.", me.label());
                        }
                        Err(e) => println!("Could not update profile: {}", e),
                    }
                }
                "/file" if !rest.is_empty() => {
                    let Some(conversation_id) = active_conversation(store) else {
                        println!("No conversation selected; use /open <id>");
                        continue;
                    };
                    let (path, caption) = rest.split_once(' ').unwrap_or((rest, ""));
                    let url = match sync.upload_attachment(Path::new(path)).await {
                        Ok(url) => url,
                        Err(e) => {
                            println!("Upload failed: {}", e);
                            continue;
                        }
                    };
                    let draft = MessageDraft {
                        files: vec![url],
                        ..MessageDraft::text(caption.trim())
                    };
                    if let Err(e) = handle.send_message(&conversation_id, draft).await {
                        println!("Not sent: {}", e);
                    }
                }
                _ if cmd.starts_with('/') => println!("Unknown command {}", cmd),
                _ => {
                    let Some(conversation_id) = active_conversation(store) else {
                        println!("No conversation selected; use /open <id>");
                        continue;
                    };
                    handle.input(&conversation_id, line);
                    if let Err(e) = handle.send_message(&conversation_id, MessageDraft::text(line)).await {
                        println!("Not sent: {}", e);
                    }
                }
            }
        }
        Ok(())
    }
}

fn active_conversation(store: &SharedStore) -> Option<String> {
    store::lock(store).active_conversation_id().map(str::to_string)
}

fn print_conversations(store: &SharedStore) {
    let guard = store::lock(store);
    let active = guard.active_conversation_id();
    if guard.conversations().is_empty() {
        println!("No conversations yet. Start one with /dm <email or name>.");
    }
    for conv in guard.conversations() {
        let marker = if active == Some(conv.id.as_str()) { "*" } else { " " };
        println!(
            "{} {:<24} {:?} {} ({} messages)",
            marker,
            conv.id,
            conv.kind,
            conv.name,
            guard.messages(&conv.id).len()
        );
    }
}
