//! Line-oriented command codec for the external-tool interop socket.
//!
//! Wire format (newline-terminated ASCII lines):
//!
//! ```text
//! command=<name>
//! <name>.<key>=<value>
//! ...
//! endcommand=<name>
//! ```
//!
//! The command names and parameter keys below are a stable wire contract
//! with an external closed-source tool; they must not change.

use std::fmt;

use thiserror::Error;

/// `initialize` handshake field: protocol version.
pub const KEY_VERSION: &str = "interop_version";
/// `initialize` handshake field: tool name.
pub const KEY_NAME: &str = "interop_name";
/// `set_event` field: externally-assigned linear event id.
pub const KEY_LINEAR_ID: &str = "interoplinearid";
/// `set_event` field: command buffer the event was recorded into.
pub const KEY_CMD_BUF_ID: &str = "cmdbufid";
/// `set_event` field: display name of the event.
pub const KEY_EVENT_NAME: &str = "eventname";

pub const CMD_INITIALIZE: &str = "initialize";
pub const CMD_SET_EVENT: &str = "set_event";
pub const CMD_TERMINATE: &str = "terminate";

/// Version this implementation speaks in the `initialize` handshake.
pub const INTEROP_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Initialize { version: u32, name: String },
    SetEvent {
        linear_id: u32,
        command_buffer_id: u64,
        event_name: String,
    },
    Terminate,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Initialize { .. } => CMD_INITIALIZE,
            Command::SetEvent { .. } => CMD_SET_EVENT,
            Command::Terminate => CMD_TERMINATE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("command block does not start with command=<name>: {line:?}")]
    MissingHeader { line: String },
    #[error("unknown command {name:?}")]
    UnknownCommand { name: String },
    #[error("endcommand name {end:?} does not match command {start:?}")]
    MismatchedEnd { start: String, end: String },
    #[error("parameter line without {command}.<key>=<value> shape: {line:?}")]
    MalformedParameter { command: String, line: String },
    #[error("{command} is missing required field {key}")]
    MissingField {
        command: &'static str,
        key: &'static str,
    },
    #[error("{command}.{key} has non-numeric value {value:?}")]
    InvalidNumber {
        command: &'static str,
        key: &'static str,
        value: String,
    },
    #[error("interop stream is not valid UTF-8")]
    InvalidUtf8,
}

/// Encodes one command as its wire block, trailing newline included.
pub fn encode_command(command: &Command) -> String {
    let name = command.name();
    let mut out = String::new();
    push_line(&mut out, "command", name);
    match command {
        Command::Initialize { version, name: tool } => {
            push_field(&mut out, name, KEY_VERSION, version);
            push_field(&mut out, name, KEY_NAME, tool);
        }
        Command::SetEvent {
            linear_id,
            command_buffer_id,
            event_name,
        } => {
            push_field(&mut out, name, KEY_LINEAR_ID, linear_id);
            push_field(&mut out, name, KEY_CMD_BUF_ID, command_buffer_id);
            push_field(&mut out, name, KEY_EVENT_NAME, event_name);
        }
        Command::Terminate => {}
    }
    push_line(&mut out, "endcommand", name);
    out
}

fn push_line(out: &mut String, key: &str, value: &str) {
    out.push_str(key);
    out.push('=');
    out.push_str(value);
    out.push('\n');
}

fn push_field(out: &mut String, command: &str, key: &str, value: &dyn fmt::Display) {
    out.push_str(command);
    out.push('.');
    out.push_str(key);
    out.push('=');
    out.push_str(&value.to_string());
    out.push('\n');
}

/// Pull-based incremental decoder.
///
/// Bytes go in via [`push`](CommandDecoder::push) at arbitrary chunk
/// boundaries; [`next_command`](CommandDecoder::next_command) yields one
/// complete command at a time and leaves any trailing partial command
/// buffered for the next read.
#[derive(Debug, Default)]
pub struct CommandDecoder {
    buf: Vec<u8>,
}

impl CommandDecoder {
    pub fn new() -> CommandDecoder {
        CommandDecoder::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet consumed as a complete command.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Extracts the next complete command, if the buffer holds one.
    ///
    /// A command is complete only once the newline after its
    /// `endcommand=<name>` line has arrived; anything after that newline
    /// stays buffered.
    pub fn next_command(&mut self) -> Result<Option<Command>, CodecError> {
        const END_TOKEN: &[u8] = b"endcommand=";

        let Some(end_at) = find(&self.buf, END_TOKEN) else {
            return Ok(None);
        };
        let Some(newline_rel) = self.buf[end_at..].iter().position(|&b| b == b'\n') else {
            // endcommand line itself is still partial.
            return Ok(None);
        };
        let block_end = end_at + newline_rel + 1;

        let block = std::str::from_utf8(&self.buf[..block_end])
            .map_err(|_| CodecError::InvalidUtf8)?
            .to_owned();
        self.buf.drain(..block_end);
        parse_block(&block).map(Some)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_block(block: &str) -> Result<Command, CodecError> {
    let mut lines = block.lines().filter(|line| !line.trim().is_empty());

    let header = lines.next().unwrap_or_default();
    let Some(name) = header.strip_prefix("command=") else {
        return Err(CodecError::MissingHeader {
            line: header.to_owned(),
        });
    };

    let mut fields: Vec<(String, String)> = Vec::new();
    let mut end_name: Option<&str> = None;
    for line in lines {
        if let Some(end) = line.strip_prefix("endcommand=") {
            end_name = Some(end);
            break;
        }
        let prefix = format!("{name}.");
        let Some(rest) = line.strip_prefix(&prefix) else {
            return Err(CodecError::MalformedParameter {
                command: name.to_owned(),
                line: line.to_owned(),
            });
        };
        // Values may contain '='; split on the first one only.
        let Some((key, value)) = rest.split_once('=') else {
            return Err(CodecError::MalformedParameter {
                command: name.to_owned(),
                line: line.to_owned(),
            });
        };
        fields.push((key.to_owned(), value.to_owned()));
    }

    if let Some(end) = end_name {
        if end != name {
            return Err(CodecError::MismatchedEnd {
                start: name.to_owned(),
                end: end.to_owned(),
            });
        }
    }

    match name {
        CMD_INITIALIZE => Ok(Command::Initialize {
            version: numeric_field(&fields, CMD_INITIALIZE, KEY_VERSION)?,
            name: text_field(&fields, CMD_INITIALIZE, KEY_NAME)?,
        }),
        CMD_SET_EVENT => Ok(Command::SetEvent {
            linear_id: numeric_field(&fields, CMD_SET_EVENT, KEY_LINEAR_ID)?,
            command_buffer_id: numeric_field(&fields, CMD_SET_EVENT, KEY_CMD_BUF_ID)?,
            event_name: text_field(&fields, CMD_SET_EVENT, KEY_EVENT_NAME)?,
        }),
        CMD_TERMINATE => Ok(Command::Terminate),
        _ => Err(CodecError::UnknownCommand {
            name: name.to_owned(),
        }),
    }
}

fn text_field(
    fields: &[(String, String)],
    command: &'static str,
    key: &'static str,
) -> Result<String, CodecError> {
    fields
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
        .ok_or(CodecError::MissingField { command, key })
}

fn numeric_field<T: std::str::FromStr>(
    fields: &[(String, String)],
    command: &'static str,
    key: &'static str,
) -> Result<T, CodecError> {
    let value = text_field(fields, command, key)?;
    value
        .trim()
        .parse()
        .map_err(|_| CodecError::InvalidNumber {
            command,
            key,
            value,
        })
}
