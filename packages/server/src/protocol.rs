//! Line-oriented wire protocol: handshake parsing, command parsing and the
//! formatting of every line the server emits.
//!
//! ```text
//! client → server   alice|3600                       handshake (offset optional)
//! server → client   [18-10-26 14:05] bob: hi         history, repeated
//! server → client   HISTORY_END
//! server → client   ONLINE_USERS|2|alice|bob
//! client → server   /pm bob see you later
//! server → both     [18-10-26 14:06] (Private) alice -> bob: see you later
//! ```

use hiroba_shared::time::UtcOffset;

use crate::domain::{DomainError, Identity, SYSTEM_IDENTITY, SessionMetadata};

/// Marker line sent after the last replayed history line
pub const HISTORY_END: &str = "HISTORY_END";

/// Prefix of the presence line
pub const ONLINE_USERS: &str = "ONLINE_USERS";

/// Command prefix for private messages
pub const PRIVATE_MESSAGE_COMMAND: &str = "/pm";

pub const USAGE_PRIVATE_MESSAGE: &str = "Error: Usage /pm <username> <message>";
pub const ERROR_SELF_TARGET: &str = "Error: Cannot send a private message to yourself.";
pub const ERROR_SAVE_PUBLIC: &str = "Error saving message to the database.";
pub const ERROR_SAVE_PRIVATE: &str = "Error saving private message to the database.";

/// Parsed handshake frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub identity: Identity,
    pub metadata: SessionMetadata,
}

/// Parse `identity` or `identity|utc_offset_seconds`.
///
/// An unparsable or out-of-range offset is dropped; only the identity decides
/// whether the handshake succeeds.
pub fn parse_handshake(line: &str) -> Result<Handshake, DomainError> {
    let (raw_identity, raw_offset) = match line.split_once('|') {
        Some((identity, offset)) => (identity, Some(offset)),
        None => (line, None),
    };

    let identity = Identity::new(raw_identity)?;

    let utc_offset = raw_offset.and_then(|raw| {
        let parsed = raw
            .trim()
            .parse::<i32>()
            .ok()
            .and_then(UtcOffset::from_seconds);
        if parsed.is_none() {
            tracing::warn!(
                "Ignoring invalid UTC offset '{}' from '{}'",
                raw.trim(),
                identity
            );
        }
        parsed
    });

    Ok(Handshake {
        identity,
        metadata: SessionMetadata { utc_offset },
    })
}

/// One inbound line from an active session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// Blank line; ignored
    Empty,
    /// `/pm` without both a target and a body
    PrivateUsage,
    Private { target: &'a str, body: &'a str },
    Public(&'a str),
}

/// Classify an inbound line. Surrounding whitespace is trimmed first.
pub fn parse_command(line: &str) -> Command<'_> {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }

    let Some(rest) = line.strip_prefix(PRIVATE_MESSAGE_COMMAND) else {
        return Command::Public(line);
    };

    if rest.is_empty() {
        return Command::PrivateUsage;
    }
    // `/pmfoo` is an ordinary message, not a command
    if !rest.starts_with(char::is_whitespace) {
        return Command::Public(line);
    }

    match rest.trim_start().split_once(char::is_whitespace) {
        Some((target, body)) if !body.trim().is_empty() => Command::Private {
            target,
            body: body.trim(),
        },
        _ => Command::PrivateUsage,
    }
}

/// `[time] identity: body`
pub fn format_chat_line(time: &str, sender: &str, body: &str) -> String {
    format!("[{}] {}: {}", time, sender, body)
}

/// `[time] (Private) sender -> receiver: body`
pub fn format_private_line(time: &str, sender: &str, receiver: &str, body: &str) -> String {
    format!("[{}] (Private) {} -> {}: {}", time, sender, receiver, body)
}

/// `[time] System: text`
pub fn format_system_line(time: &str, text: &str) -> String {
    format_chat_line(time, SYSTEM_IDENTITY, text)
}

/// `ONLINE_USERS|<count>|id1|id2|...`
pub fn format_online_users(identities: &[Identity]) -> String {
    let mut line = format!("{}|{}", ONLINE_USERS, identities.len());
    for identity in identities {
        line.push('|');
        line.push_str(identity.as_str());
    }
    line
}

pub fn joined_notice(identity: &Identity) -> String {
    format!("==> {} joined the chat", identity)
}

pub fn left_notice(identity: &Identity) -> String {
    format!("==> {} left the chat", identity)
}

pub fn evicted_notice(identity: &Identity) -> String {
    format!("==> {} (unexpectedly) left the chat", identity)
}

pub fn target_not_found(target: &str) -> String {
    format!("User {} not found.", target)
}

pub fn invalid_body(err: &DomainError) -> String {
    match err {
        DomainError::BodyTooLong { max, .. } => {
            format!("Error: Message exceeds {} characters.", max)
        }
        other => format!("Error: {}", other),
    }
}
