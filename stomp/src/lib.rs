//! STOMP 1.2 frame model and text codec for the chat WebSocket transport.
//!
//! This crate owns the wire representation spoken between the chat client and
//! the broker. Frames travel as WebSocket text messages; one message carries
//! exactly one NUL-terminated frame, or a bare EOL heart-beat.
//!
//! DESIGN
//! ======
//! - Bodies are kept as `String`: every destination in the chat vocabulary
//!   carries JSON, so the codec never needs binary bodies.
//! - Headers keep wire order in a `Vec`; lookups return the first occurrence,
//!   which is the value STOMP 1.2 says wins on repeats.
//! - Header escaping applies to every command except `CONNECT`/`CONNECTED`.

use std::fmt;
use std::str::FromStr;

/// Error returned by [`decode_frame`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    /// The message contained nothing but line endings.
    #[error("empty frame")]
    Empty,
    /// The command line is not a known STOMP command.
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    /// A header line had no `:` separator.
    #[error("malformed header line: {0}")]
    MalformedHeader(String),
    /// A header contained an escape sequence STOMP 1.2 does not define.
    #[error("invalid escape sequence in header: {0}")]
    InvalidEscape(String),
    /// The `content-length` header was not a valid byte count for this body.
    #[error("invalid content-length: {0}")]
    InvalidContentLength(String),
    /// The frame ended before the blank line separating headers from body.
    #[error("frame truncated before body")]
    Truncated,
    /// The body was not terminated by a NUL octet.
    #[error("frame body is missing its NUL terminator")]
    MissingNul,
}

/// STOMP frame command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    /// Wire spelling of the command.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
            Self::Disconnect => "DISCONNECT",
            Self::Connected => "CONNECTED",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    /// `CONNECT` and `CONNECTED` frames carry headers verbatim.
    fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONNECT" => Ok(Self::Connect),
            "STOMP" => Ok(Self::Stomp),
            "SEND" => Ok(Self::Send),
            "SUBSCRIBE" => Ok(Self::Subscribe),
            "UNSUBSCRIBE" => Ok(Self::Unsubscribe),
            "ACK" => Ok(Self::Ack),
            "NACK" => Ok(Self::Nack),
            "BEGIN" => Ok(Self::Begin),
            "COMMIT" => Ok(Self::Commit),
            "ABORT" => Ok(Self::Abort),
            "DISCONNECT" => Ok(Self::Disconnect),
            "CONNECTED" => Ok(Self::Connected),
            "MESSAGE" => Ok(Self::Message),
            "RECEIPT" => Ok(Self::Receipt),
            "ERROR" => Ok(Self::Error),
            other => Err(CodecError::UnknownCommand(other.to_owned())),
        }
    }
}

/// A single STOMP frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// What the frame asks for or reports.
    pub command: Command,
    /// Headers in wire order.
    pub headers: Vec<(String, String)>,
    /// UTF-8 body; empty for most control frames.
    pub body: String,
}

impl Frame {
    /// Create a frame with no headers and an empty body.
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self { command, headers: Vec::new(), body: String::new() }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value for `name`, if present.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

// =============================================================================
// HEADER NAMES
// =============================================================================

pub const HEADER_ACCEPT_VERSION: &str = "accept-version";
pub const HEADER_HOST: &str = "host";
pub const HEADER_HEART_BEAT: &str = "heart-beat";
pub const HEADER_AUTHORIZATION: &str = "Authorization";
pub const HEADER_DESTINATION: &str = "destination";
pub const HEADER_ID: &str = "id";
pub const HEADER_ACK: &str = "ack";
pub const HEADER_SUBSCRIPTION: &str = "subscription";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_CONTENT_LENGTH: &str = "content-length";
pub const HEADER_MESSAGE: &str = "message";
pub const HEADER_RECEIPT: &str = "receipt";

/// Protocol version this codec speaks.
pub const STOMP_VERSION: &str = "1.2";

// =============================================================================
// BUILDERS
// =============================================================================

/// `CONNECT` frame presenting the bearer credential at handshake time.
///
/// `heartbeat` is `(outgoing_ms, incoming_ms)` as advertised by the client.
#[must_use]
pub fn connect_frame(host: &str, authorization: Option<&str>, heartbeat: (u64, u64)) -> Frame {
    let frame = Frame::new(Command::Connect)
        .with_header(HEADER_ACCEPT_VERSION, STOMP_VERSION)
        .with_header(HEADER_HOST, host)
        .with_header(HEADER_HEART_BEAT, format!("{},{}", heartbeat.0, heartbeat.1));
    match authorization {
        Some(value) => frame.with_header(HEADER_AUTHORIZATION, value),
        None => frame,
    }
}

#[must_use]
pub fn subscribe_frame(id: &str, destination: &str) -> Frame {
    Frame::new(Command::Subscribe)
        .with_header(HEADER_ID, id)
        .with_header(HEADER_DESTINATION, destination)
        .with_header(HEADER_ACK, "auto")
}

#[must_use]
pub fn unsubscribe_frame(id: &str) -> Frame {
    Frame::new(Command::Unsubscribe).with_header(HEADER_ID, id)
}

/// `SEND` frame carrying a JSON body.
#[must_use]
pub fn send_frame(destination: &str, json_body: impl Into<String>) -> Frame {
    Frame::new(Command::Send)
        .with_header(HEADER_DESTINATION, destination)
        .with_header(HEADER_CONTENT_TYPE, "application/json")
        .with_body(json_body)
}

#[must_use]
pub fn disconnect_frame() -> Frame {
    Frame::new(Command::Disconnect)
}

/// Parse a `heart-beat` header value (`"cx,cy"`).
#[must_use]
pub fn parse_heartbeat(value: &str) -> Option<(u64, u64)> {
    let (outgoing, incoming) = value.split_once(',')?;
    Some((outgoing.trim().parse().ok()?, incoming.trim().parse().ok()?))
}

/// A text message made only of line endings is a heart-beat, not a frame.
#[must_use]
pub fn is_heartbeat(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| c == '\n' || c == '\r')
}

// =============================================================================
// CODEC
// =============================================================================

/// Encode a frame into its NUL-terminated wire text.
#[must_use]
pub fn encode_frame(frame: &Frame) -> String {
    let escape = frame.command.escapes_headers();
    let mut out = String::with_capacity(frame.body.len() + 64);
    out.push_str(frame.command.as_str());
    out.push('\n');

    for (name, value) in &frame.headers {
        if escape {
            out.push_str(&escape_header(name));
            out.push(':');
            out.push_str(&escape_header(value));
        } else {
            out.push_str(name);
            out.push(':');
            out.push_str(value);
        }
        out.push('\n');
    }

    if !frame.body.is_empty() && frame.header(HEADER_CONTENT_LENGTH).is_none() {
        out.push_str(HEADER_CONTENT_LENGTH);
        out.push(':');
        out.push_str(&frame.body.len().to_string());
        out.push('\n');
    }

    out.push('\n');
    out.push_str(&frame.body);
    out.push('\0');
    out
}

/// Decode one wire message into a frame.
///
/// # Errors
///
/// Returns a [`CodecError`] describing the first violation found. Heart-beats
/// decode as [`CodecError::Empty`]; check [`is_heartbeat`] first.
pub fn decode_frame(text: &str) -> Result<Frame, CodecError> {
    let text = text.trim_start_matches(['\r', '\n']);
    if text.is_empty() {
        return Err(CodecError::Empty);
    }

    let (command_line, mut rest) = next_line(text).ok_or(CodecError::Truncated)?;
    let command: Command = command_line.parse()?;

    let mut headers = Vec::new();
    loop {
        let (line, after) = next_line(rest).ok_or(CodecError::Truncated)?;
        rest = after;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| CodecError::MalformedHeader(line.to_owned()))?;
        if command.escapes_headers() {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_owned(), value.to_owned()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(name, _)| name == HEADER_CONTENT_LENGTH)
        .map(|(_, value)| value.clone());

    let body = match content_length {
        Some(raw) => {
            let len = raw
                .trim()
                .parse::<usize>()
                .map_err(|_| CodecError::InvalidContentLength(raw.clone()))?;
            let body = rest
                .get(..len)
                .ok_or_else(|| CodecError::InvalidContentLength(raw.clone()))?;
            if rest.as_bytes().get(len) != Some(&0) {
                return Err(CodecError::MissingNul);
            }
            body
        }
        None => {
            let end = rest.find('\0').ok_or(CodecError::MissingNul)?;
            &rest[..end]
        }
    };

    Ok(Frame { command, headers, body: body.to_owned() })
}

/// Split off one line, accepting both `\n` and `\r\n` endings.
fn next_line(input: &str) -> Option<(&str, &str)> {
    let idx = input.find('\n')?;
    let line = &input[..idx];
    let line = line.strip_suffix('\r').unwrap_or(line);
    Some((line, &input[idx + 1..]))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, CodecError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(CodecError::InvalidEscape(raw.to_owned())),
        }
    }
    Ok(out)
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
