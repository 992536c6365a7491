use std::{collections::HashSet, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::Parser;
use client_core::{load_settings, ChatClient, StoreChange};
use shared::domain::{ConversationId, MessageId, UserId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// REST origin, e.g. http://localhost:8080
    #[arg(long)]
    api_url: Option<String>,
    /// Explicit socket endpoint; derived from the api url when omitted.
    #[arg(long)]
    ws_url: Option<String>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    password: Option<String>,
    /// Create the account instead of logging in.
    #[arg(long, requires = "username")]
    register: bool,
    #[arg(long)]
    username: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Open(ConversationId),
    Close,
    Older,
    List,
    Logout,
    Quit,
    Send(String),
    Unknown(String),
    Empty,
}

impl Command {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Command::Send(line.to_string());
        };
        let mut parts = rest.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("open"), Some(id)) => Command::Open(ConversationId::from(id)),
            (Some("close"), None) => Command::Close,
            (Some("older"), None) => Command::Older,
            (Some("list"), None) => Command::List,
            (Some("logout"), None) => Command::Logout,
            (Some("quit"), None) => Command::Quit,
            _ => Command::Unknown(line.to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings()?;
    if let Some(api_url) = args.api_url {
        settings.api_base_url = api_url;
    }
    if let Some(ws_url) = args.ws_url {
        settings.ws_url = Some(ws_url);
    }
    let client = Arc::new(ChatClient::new(settings).context("failed to build chat client")?);

    if !client.start().await {
        let (Some(email), Some(password)) = (args.email.as_deref(), args.password.as_deref())
        else {
            bail!("no valid session, pass --email and --password");
        };
        let user = match args.username.as_deref().filter(|_| args.register) {
            Some(username) => client.register(email, username, password).await?,
            None => client.login(email, password).await?,
        };
        println!("signed in as {} <{}>", user.username, user.email);
    }

    client.load_conversations().await?;
    print_conversations(&client);
    println!("commands: /open <id>, /close, /older, /list, /logout, /quit; anything else is sent");

    let printer = tokio::spawn(print_changes(Arc::clone(&client)));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let outcome = match Command::parse(&line) {
            Command::Quit => break,
            Command::Logout => {
                client.logout().await;
                println!("signed out");
                break;
            }
            Command::Empty => Ok(()),
            Command::List => {
                print_conversations(&client);
                Ok(())
            }
            Command::Open(id) => client.select_conversation(Some(id)).await,
            Command::Close => client.select_conversation(None).await,
            Command::Older => match client.store().active_conversation_id() {
                Some(id) => client.load_older_messages(&id).await.map(|loaded| {
                    if !loaded {
                        println!("no older messages");
                    }
                }),
                None => {
                    println!("open a conversation first");
                    Ok(())
                }
            },
            Command::Send(text) => client.send_message(&text, None).map(drop),
            Command::Unknown(raw) => {
                println!("unknown command: {raw}");
                Ok(())
            }
        };
        if let Err(err) = outcome {
            eprintln!("error: {err}");
            if !client.session().is_authenticated() {
                break;
            }
        }
    }

    printer.abort();
    client.shutdown();
    Ok(())
}

fn viewer(client: &ChatClient) -> UserId {
    client
        .session()
        .current_user()
        .map(|user| user.id)
        .unwrap_or_else(|| UserId::from(""))
}

fn print_conversations(client: &ChatClient) {
    let me = viewer(client);
    let state = client.store().snapshot();
    if state.conversations.is_empty() {
        println!("no conversations yet");
    }
    for conversation in &state.conversations {
        let unread = state.unread(&conversation.id);
        let preview = conversation
            .last_message
            .as_ref()
            .map(|message| message.content.as_str())
            .unwrap_or("");
        println!(
            "{:<38} {:<24} {:>3} unread  {}",
            conversation.id,
            conversation.display_name(&me),
            unread,
            preview
        );
    }
}

async fn print_changes(client: Arc<ChatClient>) {
    let mut changes = client.store().subscribe();
    let mut printed: HashSet<MessageId> = HashSet::new();
    loop {
        let change = match changes.recv().await {
            Ok(change) => change,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "change feed lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        match change {
            StoreChange::Messages(id) => print_new_messages(&client, &id, &mut printed),
            StoreChange::Unread(id) => {
                let unread = client.store().read(|state| state.unread(&id));
                if unread > 0 {
                    println!("* {unread} unread in {id}");
                }
            }
            StoreChange::Connection(true) => println!("-- connected"),
            StoreChange::Connection(false) => println!("-- disconnected"),
            StoreChange::ServerError(message) => println!("-- server error: {message}"),
            StoreChange::ActiveConversation(Some(id)) => println!("-- opened {id}"),
            StoreChange::Reset => printed.clear(),
            _ => {}
        }
    }
}

fn print_new_messages(client: &ChatClient, id: &ConversationId, printed: &mut HashSet<MessageId>) {
    if client.store().active_conversation_id().as_ref() != Some(id) {
        return;
    }
    let messages = client.store().read(|state| state.messages_for(id).to_vec());
    for message in messages {
        if message.id.is_temporary() || !printed.insert(message.id.clone()) {
            continue;
        }
        let sender = message
            .sender_username
            .as_deref()
            .unwrap_or(message.sender_id.as_str());
        println!("[{}] {}: {}", message.sent_at, sender, message.content);
    }
}
