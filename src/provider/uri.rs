#![forbid(unsafe_code)]

//! Open-request names: a path plus URI query parameters.

use std::collections::HashMap;
use std::fmt;

/// Lookup of the named parameters attached to an open request.
pub trait UriParameters {
    /// Path portion of the name, without parameters.
    fn path(&self) -> &str;
    /// Value of parameter `key`, if present.
    fn parameter(&self, key: &str) -> Option<&str>;
}

/// An owned open-request name parsed from `file:` URI syntax.
///
/// `file:/data/app.db?ptr=0x7f00&sz=0` yields the path `/data/app.db` and the
/// parameters `ptr` and `sz`. Names without a `file:` prefix are taken as
/// plain paths with no parameters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UriPath {
    path: String,
    params: Vec<(String, String)>,
}

impl UriPath {
    /// Creates a name with no parameters.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            params: Vec::new(),
        }
    }

    /// Parses a name in `file:` URI syntax.
    pub fn parse(name: &str) -> Self {
        let Some(rest) = name.strip_prefix("file:") else {
            return Self::new(name);
        };
        let rest = rest.split('#').next().unwrap_or_default();
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, query),
            None => (rest, ""),
        };
        let path = path
            .strip_prefix("//localhost")
            .or_else(|| path.strip_prefix("//").filter(|p| p.starts_with('/')))
            .unwrap_or(path);
        let mut params = Vec::new();
        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            params.push((percent_decode(key), percent_decode(value)));
        }
        Self {
            path: percent_decode(path),
            params,
        }
    }

    /// Appends a parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }

    /// Returns all parameters as a map; later duplicates lose to earlier ones.
    pub fn params(&self) -> HashMap<&str, &str> {
        let mut map = HashMap::new();
        for (key, value) in &self.params {
            map.entry(key.as_str()).or_insert(value.as_str());
        }
        map
    }
}

impl UriParameters for UriPath {
    fn path(&self) -> &str {
        &self.path
    }

    fn parameter(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for UriPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            return f.write_str(&self.path);
        }
        write!(f, "file:{}", self.path)?;
        for (idx, (key, value)) in self.params.iter().enumerate() {
            let sep = if idx == 0 { '?' } else { '&' };
            write!(f, "{sep}{key}={value}")?;
        }
        Ok(())
    }
}

fn percent_decode(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'%' && idx + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[idx + 1]), hex_value(bytes[idx + 2])) {
                out.push(hi << 4 | lo);
                idx += 3;
                continue;
            }
        }
        out.push(bytes[idx]);
        idx += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|digit| digit as u8)
}
