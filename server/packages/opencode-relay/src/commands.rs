//! Parsing of chat text into bot commands.

/// Entries published with `setMyCommands`.
pub const COMMAND_MENU: &[(&str, &str)] = &[
    ("start", "Start fresh"),
    ("help", "Show commands"),
    ("new", "New conversation"),
    ("sessions", "List sessions"),
    ("switch", "Switch to a session"),
    ("rename", "Rename the current session"),
    ("delete", "Delete a session"),
    ("purge", "Delete all sessions"),
    ("diff", "Show current changes"),
    ("history", "Show message history"),
    ("model", "Show or set the model"),
    ("agent", "Show or set the agent"),
    ("stop", "Stop the current operation"),
    ("status", "Bot status"),
    ("stats", "Usage statistics"),
    ("clear", "Clear the current session"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    Start,
    Help,
    New,
    Stop,
    Clear,
    Sessions,
    Switch(Option<String>),
    Rename(Option<String>),
    Delete(Option<String>),
    Purge,
    Diff,
    History,
    Model(Option<String>),
    Agent(Option<String>),
    Status,
    Stats,
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Command(BotCommand),
    /// Anything that is not a command is a prompt for the agent.
    Prompt(String),
}

/// Parses one incoming text. Returns `None` for blank messages.
pub fn parse_incoming(text: &str) -> Option<Incoming> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let Some(body) = text.strip_prefix('/') else {
        return Some(Incoming::Prompt(text.to_string()));
    };
    let (head, rest) = match body.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (body, ""),
    };
    // Group chats address commands as `/name@bot_username`.
    let name = head.split_once('@').map_or(head, |(name, _)| name);
    let argument = (!rest.is_empty()).then(|| rest.to_string());
    let first_word = rest.split_whitespace().next().map(str::to_string);

    let command = match name.to_ascii_lowercase().as_str() {
        "start" => BotCommand::Start,
        "help" => BotCommand::Help,
        "new" => BotCommand::New,
        "stop" => BotCommand::Stop,
        "clear" => BotCommand::Clear,
        "sessions" => BotCommand::Sessions,
        "switch" => BotCommand::Switch(first_word),
        "rename" => BotCommand::Rename(argument),
        "delete" => BotCommand::Delete(first_word),
        "purge" => BotCommand::Purge,
        "diff" => BotCommand::Diff,
        "history" => BotCommand::History,
        "model" => BotCommand::Model(first_word),
        "agent" => BotCommand::Agent(first_word),
        "status" => BotCommand::Status,
        "stats" => BotCommand::Stats,
        _ => BotCommand::Unknown(name.to_string()),
    };
    Some(Incoming::Command(command))
}

pub fn help_text() -> String {
    let mut text = String::from("OpenCode Bot\n\nSend any message to talk to OpenCode.\n\nCommands:\n");
    for (command, description) in COMMAND_MENU {
        text.push_str(&format!("/{command} - {description}\n"));
    }
    text.truncate(text.trim_end().len());
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(text: &str) -> BotCommand {
        match parse_incoming(text) {
            Some(Incoming::Command(command)) => command,
            other => panic!("expected a command, got {other:?}"),
        }
    }

    #[test]
    fn plain_text_is_a_prompt() {
        assert_eq!(
            parse_incoming("  fix the failing test \n"),
            Some(Incoming::Prompt("fix the failing test".to_string()))
        );
        assert_eq!(parse_incoming("   "), None);
    }

    #[test]
    fn commands_take_optional_arguments() {
        assert_eq!(command("/sessions"), BotCommand::Sessions);
        assert_eq!(
            command("/switch ses_abc extra"),
            BotCommand::Switch(Some("ses_abc".to_string()))
        );
        assert_eq!(command("/switch"), BotCommand::Switch(None));
        assert_eq!(
            command("/rename  Release notes draft "),
            BotCommand::Rename(Some("Release notes draft".to_string()))
        );
        assert_eq!(
            command("/model anthropic/claude-sonnet"),
            BotCommand::Model(Some("anthropic/claude-sonnet".to_string()))
        );
    }

    #[test]
    fn bot_mentions_and_case_are_ignored() {
        assert_eq!(command("/Status@relay_bot"), BotCommand::Status);
        assert_eq!(
            command("/delete@relay_bot ses_1"),
            BotCommand::Delete(Some("ses_1".to_string()))
        );
    }

    #[test]
    fn unknown_commands_are_reported() {
        assert_eq!(
            command("/think"),
            BotCommand::Unknown("think".to_string())
        );
    }

    #[test]
    fn help_lists_every_menu_entry() {
        let help = help_text();
        for (command, _) in COMMAND_MENU {
            assert!(help.contains(&format!("/{command} - ")));
        }
        assert!(!help.ends_with('\n'));
    }
}
