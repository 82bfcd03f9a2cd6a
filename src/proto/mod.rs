//! Line protocol: request parsing and response forms.
//!
//! A request is one LF-terminated line: a verb followed by arguments. An
//! argument is either a bareword (positional) or `key=value`, where the value
//! may be double-quoted and supports `\"` and `\\` escapes. Verbs are
//! case-insensitive; keys are lowercased.
//!
//! Responses are either a single scalar line (`PONG`, `OK`, `OK k=v ...`,
//! a plain string, `ERR <reason>`) or NDJSON: one JSON object per line, with
//! end-of-stream signalled by connection close.

use crate::error::{Error, Result};
use std::collections::HashMap;

/// Upper bound on a request line; longer input is rejected, not buffered.
pub const MAX_REQUEST_BYTES: u64 = 64 * 1024;

/// A parsed request line.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Request {
  pub verb: String,
  pub positional: Vec<String>,
  pub kv: HashMap<String, String>,
}

/// Parse one request line (without the trailing newline).
pub fn parse_request(line: &str) -> Result<Request> {
  let tokens = tokenize(line)?;
  let mut tokens = tokens.into_iter();
  let verb = tokens
    .next()
    .ok_or_else(|| Error::BadRequest("empty request".into()))?
    .to_ascii_uppercase();

  let mut request = Request {
    verb,
    ..Request::default()
  };
  for token in tokens {
    match token.split_once('=') {
      Some((key, value)) => {
        request.kv.insert(key.to_ascii_lowercase(), value.to_string());
      }
      None => request.positional.push(token),
    }
  }
  Ok(request)
}

/// Format a scalar `OK` response with trailing `key=value` pairs.
pub fn ok_with(pairs: &[(&str, String)]) -> String {
  let mut line = String::from("OK");
  for (key, value) in pairs {
    line.push_str(&format!(" {key}={value}"));
  }
  line.push('\n');
  line
}

fn tokenize(line: &str) -> Result<Vec<String>> {
  let mut tokens = Vec::new();
  let mut chars = line.chars().peekable();
  loop {
    while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
      chars.next();
    }
    if chars.peek().is_none() {
      break;
    }
    let mut token = String::new();
    let mut quoted = false;
    while let Some(&c) = chars.peek() {
      if quoted {
        chars.next();
        match c {
          '\\' => match chars.next() {
            Some('"') => token.push('"'),
            Some('\\') => token.push('\\'),
            Some(other) => {
              token.push('\\');
              token.push(other);
            }
            None => return Err(Error::BadRequest("dangling escape".into())),
          },
          '"' => quoted = false,
          _ => token.push(c),
        }
      } else if c == '"' {
        chars.next();
        quoted = true;
      } else if c.is_whitespace() {
        break;
      } else {
        chars.next();
        token.push(c);
      }
    }
    if quoted {
      return Err(Error::BadRequest("unterminated quote".into()));
    }
    tokens.push(token);
  }
  Ok(tokens)
}
