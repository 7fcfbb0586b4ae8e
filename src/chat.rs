// Interactive terminal front end for the chat widget.

use anyhow::Result;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::widget::{WidgetHandle, WidgetSnapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Help,
    Questions,
    /// Template by list number or id; `None` clears it.
    Pick(Option<String>),
    Items(String),
    Locations(String),
    AddItems(Vec<String>),
    AddLocations(Vec<String>),
    Edit(String),
    Send,
    Reset,
    New,
    Show,
    Quit,
    Unknown(String),
}

fn split_list(args: &str) -> Vec<String> {
    args.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_command(line: &str) -> ChatCommand {
    let line = line.trim();
    let (word, args) = match line.split_once(char::is_whitespace) {
        Some((word, args)) => (word, args.trim()),
        None => (line, ""),
    };
    match word {
        "help" | "?" => ChatCommand::Help,
        "questions" | "q" => ChatCommand::Questions,
        "pick" if args.is_empty() || args == "none" => ChatCommand::Pick(None),
        "pick" => ChatCommand::Pick(Some(args.to_string())),
        "items" => ChatCommand::Items(args.to_string()),
        "locations" => ChatCommand::Locations(args.to_string()),
        "add-items" | "+i" => ChatCommand::AddItems(split_list(args)),
        "add-locations" | "+l" => ChatCommand::AddLocations(split_list(args)),
        "edit" => ChatCommand::Edit(args.to_string()),
        "send" => ChatCommand::Send,
        "reset" => ChatCommand::Reset,
        "new" => ChatCommand::New,
        "show" | "" => ChatCommand::Show,
        "quit" | "exit" => ChatCommand::Quit,
        _ => ChatCommand::Unknown(line.to_string()),
    }
}

/// Resolve a `pick` argument: 1-based list number first, then template id.
pub fn resolve_template_id(catalog: &Catalog, arg: &str) -> Option<String> {
    if let Ok(n) = arg.parse::<usize>() {
        if let Some(template) = n.checked_sub(1).and_then(|i| catalog.templates.get(i)) {
            return Some(template.id.clone());
        }
    }
    catalog.template(arg).map(|t| t.id.clone())
}

const HELP: &str = "\
Commands:
  questions               list question templates
  pick <n|id> | pick none choose or clear the question
  items [category]        list items
  locations [type]        list locations
  add-items a, b          add items by id or name
  add-locations a, b      add locations by id or name
  edit <text>             replace the message text
  send                    send the message
  reset                   clear question and selections
  new                     start a new conversation
  show                    show the composer
  quit";

fn print_snapshot(snapshot: &WidgetSnapshot) {
    let composer = &snapshot.composer;
    match &composer.active_template {
        Some(t) => println!("Question: {}", t.source_text()),
        None => println!("Question: (none)"),
    }
    println!("Items: {}", composer.items.join(", "));
    println!("Locations: {}", composer.locations.join(", "));
    for pending in &snapshot.pending_requirements {
        println!("Still needed: {:?}", pending);
    }
    println!("> {}", composer.text.as_str());
}

pub async fn run_chat(widget: WidgetHandle) -> Result<()> {
    info!("Starting terminal chat...");
    let catalog = widget.catalog().clone();
    for notice in &catalog.notices {
        println!("! {}", notice);
    }
    if let Err(e) = widget.new_conversation().await {
        println!("! Could not start a conversation: {}", e);
    }
    println!("Type `help` for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_command(&line) {
            ChatCommand::Help => println!("{}", HELP),
            ChatCommand::Questions => {
                if catalog.templates.is_empty() {
                    println!("No questions available.");
                }
                for (i, t) in catalog.templates.iter().enumerate() {
                    println!("{:>3}. {}", i + 1, t.source_text());
                }
            }
            ChatCommand::Pick(arg) => {
                let template_id = match arg {
                    None => None,
                    Some(arg) => match resolve_template_id(&catalog, &arg) {
                        Some(id) => Some(id),
                        None => {
                            println!("! No question {}", arg);
                            continue;
                        }
                    },
                };
                match widget.choose_template(template_id).await {
                    Ok(state) => println!("> {}", state.text.as_str()),
                    Err(e) => println!("! {}", e),
                }
            }
            ChatCommand::Items(category) => {
                for item in catalog.items_in(&category) {
                    println!("  {}  {} ({})", item.id, item.name, item.category);
                }
            }
            ChatCommand::Locations(kind) => {
                for location in catalog.locations_of(&kind) {
                    println!("  {}  {} ({})", location.id, location.name, location.kind);
                }
            }
            ChatCommand::AddItems(ids) => {
                let names = catalog.resolve_item_names(ids.as_slice());
                let state = widget.add_items(json!(names)).await?;
                println!("> {}", state.text.as_str());
            }
            ChatCommand::AddLocations(ids) => {
                let names = catalog.resolve_location_names(ids.as_slice());
                let state = widget.add_locations(json!(names)).await?;
                println!("> {}", state.text.as_str());
            }
            ChatCommand::Edit(text) => {
                widget.edit_text(text).await?;
            }
            ChatCommand::Send => match widget.send().await {
                Ok(message) => {
                    println!("You: {}", message.content);
                    let snapshot = widget.snapshot().await?;
                    if let Some(reply) = snapshot.conversation.messages.last().filter(|m| !m.is_user_message) {
                        println!("Bot: {}", reply.content);
                    }
                }
                Err(e) => {
                    warn!("Send failed: {}", e);
                    println!("! {}{}", e, if e.is_retryable() { " (try again)" } else { "" });
                }
            },
            ChatCommand::Reset => {
                widget.reset().await?;
                println!("Cleared.");
            }
            ChatCommand::New => match widget.new_conversation().await {
                Ok(id) => println!("New conversation {}", id),
                Err(e) => println!("! {}", e),
            },
            ChatCommand::Show => print_snapshot(&widget.snapshot().await?),
            ChatCommand::Quit => break,
            ChatCommand::Unknown(line) => println!("Unknown command: {} (try `help`)", line),
        }
    }
    info!("Terminal chat finished");
    Ok(())
}
