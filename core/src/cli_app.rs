use crate::chat_types::{ChatEvent, Conversation, DeliveryState, Message};
use crate::config::Config;
use crate::error::ChatError;
use crate::facade::ChatFacade;
use crate::message_store::FetchOutcome;
use crate::transport::{ConnectionState, ConnectionStatus};
use colored::*;
use std::collections::HashMap;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

/// Terminal client: `carechat [flags] <command> [args]`
pub async fn run(config: Config, args: Vec<String>) -> anyhow::Result<()> {
    let bin = "carechat";

    let Some(command) = args.first() else {
        print_usage(bin);
        return Ok(());
    };

    match command.as_str() {
        "conversations" => list_conversations(&config).await?,
        "unread" => show_unread(&config).await?,
        "send" => {
            if args.len() < 4 {
                eprintln!(
                    "{}",
                    format!("Usage: {} send <conversation_id> <recipient_id> <message>", bin).yellow()
                );
                return Ok(());
            }
            let conversation_id = args[1].parse::<i64>()?;
            let recipient_id = args[2].parse::<i64>()?;
            let text = args[3..].join(" ");
            send_once(&config, conversation_id, recipient_id, &text).await?;
        }
        "open" => {
            if args.len() < 2 {
                eprintln!("{}", format!("Usage: {} open <conversation_id>", bin).yellow());
                return Ok(());
            }
            let conversation_id = args[1].parse::<i64>()?;
            open_thread(&config, conversation_id).await?;
        }
        _ => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), command.red());
            print_usage(bin);
        }
    }

    Ok(())
}

fn print_usage(bin: &str) {
    println!("{}", "CareChat".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!("  {} [--api <url>] [--ws <url>] [--token <token>] [--user <id>] <command>", bin.cyan());
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!("  {}                          List conversations", "conversations".cyan());
    println!("  {}                                 Show unread total", "unread".cyan());
    println!("  {} <conversation_id>                 Open a thread (interactive)", "open".cyan());
    println!("  {} <conversation_id> <recipient_id> <message>", "send".cyan());
    println!();
    println!("{}", "Inside a thread:".bright_white().bold());
    println!("  /older  /retry <tmp-id>  /discard <tmp-id>  /reconnect  /quit");
}

async fn list_conversations(config: &Config) -> anyhow::Result<()> {
    let (chat, _) = ChatFacade::from_config(config)?;
    chat.refresh_conversations().await?;
    let snapshot = chat.directory().await;

    if snapshot.conversations.is_empty() {
        println!("{}", "No conversations".bright_black());
        return Ok(());
    }
    for conversation in &snapshot.conversations {
        print_conversation(conversation);
    }
    println!();
    println!("{} unread", snapshot.unread_total.to_string().bold());
    Ok(())
}

async fn show_unread(config: &Config) -> anyhow::Result<()> {
    let (chat, _) = ChatFacade::from_config(config)?;
    let total = chat.refresh_unread_total().await?;
    println!("{} unread", total.to_string().bold());
    Ok(())
}

async fn send_once(
    config: &Config,
    conversation_id: i64,
    recipient_id: i64,
    text: &str,
) -> anyhow::Result<()> {
    let (chat, _) = ChatFacade::from_config(config)?;
    let message = chat.send_to(conversation_id, recipient_id, text).await?;
    println!("{} Message sent! ID: {}", "✓".green().bold(), message.id);
    Ok(())
}

async fn open_thread(config: &Config, conversation_id: i64) -> anyhow::Result<()> {
    let (chat, _) = ChatFacade::from_config(config)?;
    let mut events = chat.subscribe();

    if let Err(e) = chat.refresh_conversations().await {
        eprintln!("{} conversation list unavailable: {}", "!".yellow(), e);
    }
    if let Err(e) = chat.open_thread(conversation_id).await {
        eprintln!("{} history unavailable: {}", "!".yellow(), e);
    }
    chat.spawn_directory_refresh().await;

    // id -> delivery state already printed
    let mut printed: HashMap<String, DeliveryState> = HashMap::new();
    print_new_messages(&chat, &mut printed).await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_input(&chat, line.trim()).await {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(ChatEvent::MessagesChanged { conversation_id: id }) if id == conversation_id => {
                    print_new_messages(&chat, &mut printed).await;
                }
                Ok(ChatEvent::ConnectionChanged { state }) => print_connection(&state),
                Ok(ChatEvent::SendFailed { client_id, error, .. }) => {
                    eprintln!("{} {} not delivered: {} (/retry {})", "✗".red(), client_id, error, client_id);
                }
                Ok(ChatEvent::HistoryFailed { error, .. }) => {
                    eprintln!("{} history refresh failed: {}", "!".yellow(), error);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => print_new_messages(&chat, &mut printed).await,
                Err(RecvError::Closed) => break,
            },
        }
    }

    chat.shutdown().await;
    Ok(())
}

/// Returns false when the user asked to leave
async fn handle_input(chat: &ChatFacade, line: &str) -> bool {
    let (command, arg) = match line.split_once(' ') {
        Some((c, a)) => (c, a.trim()),
        None => (line, ""),
    };

    match command {
        "" => {}
        "/quit" | "/q" => return false,
        "/older" => match chat.load_older().await {
            Ok(FetchOutcome::Exhausted) => println!("{}", "(beginning of conversation)".bright_black()),
            Ok(_) => {}
            Err(e) => eprintln!("{} {}", "✗".red(), e),
        },
        "/retry" => {
            if let Err(e) = chat.retry_send(arg).await {
                eprintln!("{} {}", "✗".red(), e);
            }
        }
        "/discard" => {
            if !chat.discard_failed(arg).await {
                eprintln!("{} no failed message {}", "✗".red(), arg);
            }
        }
        "/reconnect" => {
            if let Err(e) = chat.reconnect().await {
                eprintln!("{} {}", "✗".red(), e);
            }
        }
        _ => match chat.send_message(line).await {
            // Delivery failures are reported through SendFailed
            Ok(_) => {}
            Err(e @ (ChatError::NotFound(_) | ChatError::Config(_))) => {
                eprintln!("{} {}", "✗".red(), e)
            }
            Err(_) => {}
        },
    }
    true
}

async fn print_new_messages(chat: &ChatFacade, printed: &mut HashMap<String, DeliveryState>) {
    let Some(thread) = chat.thread().await else {
        return;
    };
    for message in &thread.messages {
        let id = message.id.to_string();
        if printed.get(&id) == Some(&message.delivery_state) {
            continue;
        }
        print_message(message);
        printed.insert(id, message.delivery_state);
    }
}

fn print_message(message: &Message) {
    let marker = match message.delivery_state {
        DeliveryState::Pending => "…".bright_black(),
        DeliveryState::Sent => "✓".green(),
        DeliveryState::Failed => "✗".red().bold(),
    };
    println!(
        "{} {} {} {}",
        message.created_at.format("%H:%M").to_string().bright_black(),
        format!("[{}]", message.sender_id).cyan(),
        message.text,
        marker
    );
}

fn print_conversation(conversation: &Conversation) {
    let unread = if conversation.unread_count > 0 {
        format!("({})", conversation.unread_count).yellow().bold()
    } else {
        "".normal()
    };
    println!(
        "{} {} {} {}",
        format!("#{}", conversation.id).cyan(),
        unread,
        conversation
            .last_message_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default()
            .bright_black(),
        conversation.last_message_preview.as_deref().unwrap_or("")
    );
}

fn print_connection(state: &ConnectionState) {
    let label = match state.status {
        ConnectionStatus::Connected => "connected".green(),
        ConnectionStatus::Connecting => format!("connecting (retry {})", state.retry_count).yellow(),
        ConnectionStatus::Disconnected => "disconnected".bright_black(),
        ConnectionStatus::AuthFailed => "authentication failed, /reconnect after signing in".red(),
        ConnectionStatus::Failed => "connection lost, /reconnect to try again".red(),
    };
    eprintln!("{} {}", "●".bold(), label);
}
