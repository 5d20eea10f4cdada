//! Argument payload carried to remote hosts.
//!
//! Arguments can hold anything a remote shell would reinterpret (quotes,
//! globs, pipes, newlines), so the remote command line is shell-quoted and
//! then shipped as a single base64 token. The remote side decodes the token
//! and evaluates it; base64 text is inert to the shell on the way there.

use std::borrow::Cow;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::error::ProtoError;

/// Exit code the remote snippet returns when the token does not decode.
pub const DECODE_FAILURE_EXIT_CODE: i32 = 65;

/// Quotes `s` for a POSIX shell, leaving plain words untouched.
pub fn shell_quote(s: &str) -> Cow<'_, str> {
    if s.is_empty() {
        return Cow::Borrowed("''");
    }
    if s.chars().all(is_plain) {
        return Cow::Borrowed(s);
    }
    Cow::Owned(format!("'{}'", s.replace('\'', "'\\''")))
}

/// Characters a POSIX shell passes through unquoted.
fn is_plain(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(c, '-' | '_' | '.' | '/' | '%' | ':' | '=' | ',' | '+' | '@')
}

/// Joins a program and its arguments into one shell command line.
pub fn command_line<S: AsRef<str>>(program: &str, args: &[S]) -> String {
    std::iter::once(shell_quote(program))
        .chain(args.iter().map(|a| shell_quote(a.as_ref())))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A command line encoded as a single shell-safe token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgPayload {
    token: String,
}

impl ArgPayload {
    pub fn encode(command: &str) -> Self {
        Self {
            token: STANDARD.encode(command.as_bytes()),
        }
    }

    /// Wraps a token received from elsewhere; nothing is validated until [`decode`](Self::decode).
    pub fn from_token(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn decode(&self) -> Result<String, ProtoError> {
        let bytes = STANDARD
            .decode(self.token.as_bytes())
            .map_err(|e| ProtoError::InvalidPayload(e.to_string()))?;
        String::from_utf8(bytes).map_err(|_| ProtoError::NonUtf8Payload)
    }

    /// Shell snippet that decodes the token on the remote host and runs it.
    ///
    /// Exits with [`DECODE_FAILURE_EXIT_CODE`] without running anything if
    /// the token does not decode.
    pub fn remote_script(&self) -> String {
        format!(
            "payload=$(printf '%s' {token} | base64 -d 2>/dev/null) || exit {code}; \
             eval \"$payload\"",
            token = shell_quote(&self.token),
            code = DECODE_FAILURE_EXIT_CODE,
        )
    }
}
