//! Slash commands understood by the bot. Parsing only; the channel adapter acts on them.

use crate::resolver::BypassKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// /start, /help
    Help,
    /// /queue: this chat's queue depth.
    Queue,
    /// /bypass <kind> <link> or /<kind> <link>. `kind` is raw user input, validated on submit.
    Bypass { kind: String, link: String },
}

/// Parse a message. Returns None for text that is not a command at all.
pub fn parse_command(text: &str) -> Option<Command> {
    let text = text.trim();
    let rest = text.strip_prefix('/')?;
    let (head, args) = match rest.split_once(char::is_whitespace) {
        Some((head, args)) => (head, args.trim()),
        None => (rest, ""),
    };
    // Group chats address commands as /cmd@BotName.
    let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();

    match name.as_str() {
        "start" | "help" => Some(Command::Help),
        "queue" => Some(Command::Queue),
        "bypass" => {
            let mut parts = args.split_whitespace();
            let kind = parts.next().unwrap_or("").to_string();
            let link = parts.next().unwrap_or("").to_string();
            Some(Command::Bypass { kind, link })
        }
        other if BypassKind::all().iter().any(|k| k.route() == other) => Some(Command::Bypass {
            kind: other.to_string(),
            link: args.split_whitespace().next().unwrap_or("").to_string(),
        }),
        _ => Some(Command::Help),
    }
}

/// Usage text listing the supported kinds.
pub fn help_text() -> String {
    let kinds: Vec<&str> = BypassKind::all().iter().map(|k| k.route()).collect();
    let shortcuts: Vec<String> = kinds.iter().map(|k| format!("/{} <link>", k)).collect();
    format!(
        "Send a link to bypass:\n/bypass <kind> <link>\n{}\n\nKinds: {}\n/queue shows how many requests are waiting in this chat.",
        shortcuts.join("\n"),
        kinds.join(", ")
    )
}
