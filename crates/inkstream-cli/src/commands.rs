use inkstream_core::NotificationId;

pub const HELP: &str = "commands: read <id> | read-all | delete <id> | open <id> | refresh | dismiss | login <user> <token> | logout | help | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchCommand {
    Read(NotificationId),
    ReadAll,
    Delete(NotificationId),
    Open(NotificationId),
    Refresh,
    Dismiss,
    Login { user: String, token: String },
    Logout,
    Help,
    Quit,
}

/// `Ok(None)` for a blank line.
pub fn parse_command(line: &str) -> Result<Option<WatchCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();
    let command = match (verb.to_ascii_lowercase().as_str(), args.as_slice()) {
        ("read", [id]) => WatchCommand::Read(parse_id(id)?),
        ("read-all" | "readall", []) => WatchCommand::ReadAll,
        ("delete" | "rm", [id]) => WatchCommand::Delete(parse_id(id)?),
        ("open", [id]) => WatchCommand::Open(parse_id(id)?),
        ("refresh", []) => WatchCommand::Refresh,
        ("dismiss", []) => WatchCommand::Dismiss,
        ("login", [user, token]) => WatchCommand::Login {
            user: user.to_string(),
            token: token.to_string(),
        },
        ("logout", []) => WatchCommand::Logout,
        ("help" | "?", []) => WatchCommand::Help,
        ("quit" | "exit", []) => WatchCommand::Quit,
        (verb, _) => return Err(format!("unrecognized command `{verb}`; {HELP}")),
    };
    Ok(Some(command))
}

fn parse_id(raw: &str) -> Result<NotificationId, String> {
    raw.trim_start_matches('#')
        .parse()
        .map_err(|_| format!("`{raw}` is not a notification id"))
}
