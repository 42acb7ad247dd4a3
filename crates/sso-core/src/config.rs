use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use url::Url;

/// Env-to-field binding helper shared by both services.
///
/// Every setting a service honors is read through one of these accessors
/// from an explicit call site, so the full mapping is auditable in one
/// screen. Problems are collected rather than failing fast; `finish`
/// returns them all at once.
pub struct EnvReader<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
    messages: Vec<String>,
}

impl<'a> EnvReader<'a> {
    pub fn new(lookup: &'a dyn Fn(&str) -> Option<String>) -> Self {
        Self {
            lookup,
            messages: Vec::new(),
        }
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    pub fn string(&mut self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub fn required(&mut self, key: &str) -> String {
        match self.string(key) {
            Some(value) => value,
            None => {
                self.fail(format!("missing setting: {key}"));
                String::new()
            }
        }
    }

    pub fn list(&mut self, key: &str) -> Vec<String> {
        self.string(key)
            .map(|value| {
                value
                    .split(',')
                    .map(|item| item.trim().to_string())
                    .filter(|item| !item.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn parsed<T: std::str::FromStr>(&mut self, key: &str, default: T) -> T {
        match self.string(key) {
            Some(raw) => match raw.parse() {
                Ok(value) => value,
                Err(_) => {
                    self.fail(format!("invalid value for {key}: {raw:?}"));
                    default
                }
            },
            None => default,
        }
    }

    pub fn optional_parsed<T: std::str::FromStr>(&mut self, key: &str) -> Option<T> {
        let raw = self.string(key)?;
        match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                self.fail(format!("invalid value for {key}: {raw:?}"));
                None
            }
        }
    }

    pub fn boolean(&mut self, key: &str, default: bool) -> bool {
        match self.string(key) {
            Some(raw) => matches!(raw.as_str(), "1" | "true" | "yes" | "on"),
            None => default,
        }
    }

    pub fn duration(&mut self, key: &str, default: &str) -> Duration {
        let raw = self.string(key).unwrap_or_else(|| default.to_string());
        match parse_duration(&raw) {
            Ok(value) => value,
            Err(reason) => {
                self.fail(format!("invalid duration for {key}: {reason}"));
                Duration::ZERO
            }
        }
    }

    pub fn url(&mut self, key: &str, required: bool) -> Option<Url> {
        match self.string(key) {
            Some(raw) => match Url::parse(raw.trim_matches('"')) {
                Ok(url) => Some(url),
                Err(err) => {
                    self.fail(format!("error parsing {key}={raw:?}: {err}"));
                    None
                }
            },
            None if required => {
                self.fail(format!("missing setting: {key}"));
                None
            }
            None => None,
        }
    }

    /// Base64 secret that must decode to exactly 32 or 64 bytes.
    pub fn sealing_secret(&mut self, key: &str, required: bool) -> Vec<u8> {
        let raw = match self.string(key) {
            Some(value) => value,
            None => {
                if required {
                    self.fail(format!("missing setting: {key}"));
                }
                return Vec::new();
            }
        };
        let decoded = match BASE64_STANDARD.decode(raw.as_bytes()) {
            Ok(bytes) => bytes,
            Err(_) => {
                self.fail(format!(
                    "invalid value for {key}; expected base64-encoded bytes, as from `openssl rand 32 -base64`"
                ));
                return Vec::new();
            }
        };
        if decoded.len() != 32 && decoded.len() != 64 {
            self.fail(format!(
                "invalid value for {key}; must decode to 32 or 64 bytes, but decoded to {} bytes",
                decoded.len()
            ));
            return Vec::new();
        }
        decoded
    }

    pub fn finish(self) -> Result<(), Vec<String>> {
        if self.messages.is_empty() {
            Ok(())
        } else {
            Err(self.messages)
        }
    }
}

/// Parse `168h`, `10m`, `2s`, `500ms`, and concatenations like `1h30m`.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty duration".to_string());
    }
    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if digits.is_empty() {
            return Err(format!("unexpected unit in {raw:?}"));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("bad number in {raw:?}"))?;
        digits.clear();
        let unit = match c {
            'h' => Duration::from_secs(value * 3600),
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                Duration::from_millis(value)
            }
            'm' => Duration::from_secs(value * 60),
            's' => Duration::from_secs(value),
            other => return Err(format!("unknown unit {other:?} in {raw:?}")),
        };
        total += unit;
    }
    if !digits.is_empty() {
        return Err(format!("missing unit in {raw:?}"));
    }
    Ok(total)
}
