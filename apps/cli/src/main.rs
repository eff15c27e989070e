use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;
use client_core::{
    config::load_settings_from, load_settings, ChatClient, ClientEvent, ClientHandle, Conversation,
};
use shared::{
    domain::{ConversationId, Message, MessageId, Origin, Session},
    error::ClientError,
    protocol::Registration,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Terminal client for the chat API")]
struct Args {
    /// Settings file; defaults to ./client.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    poll_secs: Option<u64>,
    #[arg(long)]
    username: Option<String>,
    #[arg(long, env = "CHAT_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    /// Create the account before logging in.
    #[arg(long, requires = "email")]
    register: bool,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    avatar: Option<String>,
    #[arg(long, default_value = "general")]
    conversation: String,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Send(String),
    Delete(MessageId),
    Retry(MessageId),
    Refresh,
    Whoami,
    Logout,
    Quit,
    Help,
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if !line.starts_with('/') {
        return Some(Command::Send(line.to_string()));
    }

    let (name, arg) = match line.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (line, ""),
    };
    let command = match (name, arg) {
        ("/delete", id) if !id.is_empty() => Command::Delete(MessageId::new(id)),
        ("/retry", id) if !id.is_empty() => Command::Retry(MessageId::new(id)),
        ("/refresh", _) => Command::Refresh,
        ("/whoami", _) => Command::Whoami,
        ("/logout", _) => Command::Logout,
        ("/quit" | "/exit", _) => Command::Quit,
        _ => Command::Help,
    };
    Some(command)
}

fn render_message(message: &Message) -> String {
    let marker = match message.origin {
        Origin::Confirmed => "",
        Origin::Pending => " (sending)",
        Origin::Failed => " (unsent, /retry to resend)",
    };
    format!(
        "[{}] {} <{}>: {}{marker}",
        message.created_at.format("%H:%M:%S"),
        message.id,
        message.author_username,
        message.content
    )
}

fn print_help() {
    println!("type a line to send it; commands:");
    println!("  /delete <id>   remove a message");
    println!("  /retry <id>    resend an unsent message");
    println!("  /refresh       sync now");
    println!("  /whoami        show the current session");
    println!("  /logout        log out and exit");
    println!("  /quit          exit, keeping the session");
}

async fn sign_in(client: &Arc<ChatClient>, args: &Args) -> Result<Session> {
    if let Some(session) = client.restore_session().await? {
        info!(username = %session.username, "cli: resumed saved session");
        return Ok(session);
    }

    let (Some(username), Some(password)) = (args.username.clone(), args.password.clone()) else {
        bail!("no saved session; pass --username and --password (or CHAT_PASSWORD)");
    };

    let session = if args.register {
        let registration = Registration {
            username,
            password,
            email: args.email.clone().unwrap_or_default(),
            avatar: args.avatar.clone(),
        };
        client.register(registration).await?
    } else {
        client.login(&username, &password).await?
    };
    Ok(session)
}

async fn run_command(
    client: &Arc<ChatClient>,
    conversation: &Conversation,
    command: Command,
) -> Result<bool> {
    match command {
        Command::Send(text) => {
            conversation.send(&text).await?;
        }
        Command::Delete(id) => conversation.delete(&id).await?,
        Command::Retry(id) => {
            conversation.retry(&id).await?;
        }
        Command::Refresh => {
            conversation.refresh().await?;
        }
        Command::Whoami => match client.current_session().await {
            Some(session) => println!(
                "{} ({}) until {}",
                session.username, session.user_id, session.expires_at
            ),
            None => println!("not logged in"),
        },
        Command::Logout => {
            client.logout().await?;
            return Ok(false);
        }
        Command::Quit => return Ok(false),
        Command::Help => print_help(),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => load_settings_from(path),
        None => load_settings(),
    };
    if let Some(api_url) = &args.api_url {
        settings.api_url = api_url.clone();
    }
    if let Some(database_url) = &args.database_url {
        settings.database_url = database_url.clone();
    }
    if let Some(secs) = args.poll_secs.filter(|s| *s > 0) {
        settings.poll_interval = Duration::from_secs(secs);
    }

    let client = ChatClient::connect(settings)
        .await
        .context("failed to start chat client")?;
    let session = sign_in(&client, &args).await?;
    println!("logged in as {}", session.username);

    let mut events = client.subscribe_events();
    let conversation = client
        .open_conversation(ConversationId::new(args.conversation.clone()))
        .await?;
    println!("joined {}; /help for commands", conversation.id());

    let printer = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };
            match event {
                ClientEvent::MessagesChanged { messages, .. } => {
                    println!("---");
                    for message in &messages {
                        println!("{}", render_message(message));
                    }
                }
                ClientEvent::SyncFailed { error, .. } => warn!(%error, "cli: sync failed"),
                ClientEvent::SendFailed { placeholder_id, error, .. } => {
                    eprintln!("message {placeholder_id} not sent: {error}");
                }
                ClientEvent::DeleteFailed { message_id, error, .. } => {
                    eprintln!("message {message_id} not deleted on the server: {error}");
                }
                ClientEvent::SessionExpired => {
                    eprintln!("session expired; run again to log in");
                }
                ClientEvent::LoggedIn { .. } | ClientEvent::LoggedOut => {}
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(command) = parse_command(&line) else {
            continue;
        };
        match run_command(&client, &conversation, command).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                let needs_login = err
                    .downcast_ref::<ClientError>()
                    .is_some_and(|e| e.requires_reauth());
                eprintln!("error: {err:#}");
                if needs_login {
                    break;
                }
            }
        }
    }

    client.close_conversation().await;
    printer.abort();
    Ok(())
}
