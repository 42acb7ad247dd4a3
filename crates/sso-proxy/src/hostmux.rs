use std::collections::HashMap;

use regex::{Captures, Regex};

/// Host-based request multiplexer.
///
/// Exact hosts win over regex routes; regex routes match in registration
/// order, first match wins. The `Host` header value is matched with any
/// port stripped.
pub struct HostMux<T> {
    exact: HashMap<String, usize>,
    patterns: Vec<(Regex, usize)>,
    entries: Vec<T>,
}

impl<T> Default for HostMux<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HostMux<T> {
    pub fn new() -> Self {
        Self {
            exact: HashMap::new(),
            patterns: Vec::new(),
            entries: Vec::new(),
        }
    }

    pub fn handle_static(&mut self, host: &str, entry: T) {
        let index = self.push(entry);
        self.exact.insert(host.to_ascii_lowercase(), index);
    }

    pub fn handle_regex(&mut self, pattern: Regex, entry: T) {
        let index = self.push(entry);
        self.patterns.push((pattern, index));
    }

    pub fn route<'h>(&self, host_header: &'h str) -> Option<(&T, Option<Captures<'h>>)> {
        let host = strip_port(host_header);
        if let Some(&index) = self.exact.get(&host.to_ascii_lowercase()) {
            return Some((&self.entries[index], None));
        }
        for (pattern, index) in &self.patterns {
            if let Some(captures) = pattern.captures(host) {
                return Some((&self.entries[*index], Some(captures)));
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, entry: T) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }
}

/// Strip a `:port` suffix, leaving IPv6 literals intact.
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.split_once(']').map_or(host, |(addr, _)| &host[..addr.len() + 1]);
    }
    host.split_once(':').map_or(host, |(name, _)| name)
}
