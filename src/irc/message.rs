//! IRC message parsing and serialization.
//!
//! Parsing splits a line on runs of spaces; a token beginning with `:`
//! starts the trailing argument, which extends to end-of-line. The first
//! token is the command, matched case-insensitively by the dispatcher.
//!
//! Serialization sanitises every argument: middle arguments have
//! `{TAB, CR, LF, NUL, space}` and leading `:` stripped (empty arguments
//! become `*`); the trailing argument maps `{CR, LF, NUL}` to space and is
//! always prefixed with `:`.

use std::fmt;

/// A parsed IRC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Optional prefix (server name or `nick!user@host`).
    pub prefix: Option<String>,
    /// The command (e.g. `PRIVMSG`, `001`, `NICK`).
    pub command: String,
    /// Parameters — the last may have been a trailing param (with spaces).
    pub params: Vec<String>,
}

/// Errors that can occur during message parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,
    #[error("prefix present but missing command")]
    MissingCommand,
}

impl Message {
    /// Build a message without a prefix.
    pub fn new(command: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            prefix: None,
            command: command.into(),
            params,
        }
    }

    /// Build a message with a prefix.
    pub fn with_prefix(
        prefix: impl Into<String>,
        command: impl Into<String>,
        params: Vec<String>,
    ) -> Self {
        Self {
            prefix: Some(prefix.into()),
            command: command.into(),
            params,
        }
    }

    /// Parse a single IRC message from a line (without the trailing `\r\n`).
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let input = input.trim_end_matches(['\r', '\n']);
        let mut rest = input.trim_start_matches(' ');

        if rest.is_empty() {
            return Err(ParseError::Empty);
        }

        let prefix = if let Some(after) = rest.strip_prefix(':') {
            // Prefix runs until the first space.
            match after.find(' ') {
                Some(idx) => {
                    let prefix = after[..idx].to_owned();
                    rest = after[idx..].trim_start_matches(' ');
                    Some(prefix)
                }
                None => return Err(ParseError::MissingCommand),
            }
        } else {
            None
        };

        if rest.is_empty() {
            return Err(ParseError::MissingCommand);
        }

        let (command, mut rest) = match rest.find(' ') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                // Trailing parameter: everything after the colon, including spaces.
                params.push(trailing.to_owned());
                break;
            }
            match rest.find(' ') {
                Some(idx) => {
                    params.push(rest[..idx].to_owned());
                    rest = &rest[idx..];
                }
                None => {
                    params.push(rest.to_owned());
                    break;
                }
            }
        }

        Ok(Message {
            prefix,
            command: command.to_owned(),
            params,
        })
    }

    /// Serialize to the IRC wire format (without trailing `\r\n`).
    pub fn to_wire(&self) -> String {
        let mut out = String::new();

        if let Some(ref prefix) = self.prefix {
            out.push(':');
            out.push_str(prefix);
            out.push(' ');
        }

        out.push_str(&self.command);

        if !self.params.is_empty() {
            let last_idx = self.params.len() - 1;
            for (i, param) in self.params.iter().enumerate() {
                out.push(' ');
                if i == last_idx {
                    // Always prefix the last parameter with `:`.
                    // This is always valid and avoids edge cases where a
                    // trailing param could be misinterpreted.
                    out.push(':');
                    out.push_str(&sanitize_trailing(param));
                } else {
                    out.push_str(&sanitize_middle(param));
                }
            }
        }

        out
    }
}

/// Strip bytes a middle argument must not contain. Empty results become `*`.
fn sanitize_middle(arg: &str) -> String {
    let stripped: String = arg
        .chars()
        .filter(|c| !matches!(c, '\t' | '\r' | '\n' | '\0' | ' '))
        .collect();
    let stripped = stripped.trim_start_matches(':');
    if stripped.is_empty() {
        "*".to_owned()
    } else {
        stripped.to_owned()
    }
}

/// Map line-breaking bytes in the trailing argument to spaces.
fn sanitize_trailing(arg: &str) -> String {
    arg.chars()
        .map(|c| if matches!(c, '\r' | '\n' | '\0') { ' ' } else { c })
        .collect()
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}
