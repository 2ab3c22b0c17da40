//! Line commands typed at the prompt.

use murmur_shared::UserId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Open(UserId),
    Close,
    /// Load the next older page of the open conversation.
    More,
    List,
    Quit,
    /// Plain text for the open conversation.
    Send(String),
    Empty,
    Invalid(String),
}

pub const HELP: &str = "commands: /open <user id>, /close, /more, /list, /quit; anything else is sent";

pub fn parse_line(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Send(line.to_string());
    };

    let mut parts = command.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("open"), Some(id)) => match id.parse::<UserId>() {
            Ok(id) if id.is_valid() => Input::Open(id),
            _ => Input::Invalid(format!("not a user id: {id}")),
        },
        (Some("open"), None) => Input::Invalid("usage: /open <user id>".into()),
        (Some("close"), _) => Input::Close,
        (Some("more"), _) => Input::More,
        (Some("list"), _) => Input::List,
        (Some("quit" | "exit"), _) => Input::Quit,
        _ => Input::Invalid(HELP.into()),
    }
}
