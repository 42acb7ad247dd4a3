use std::time::Duration;

/// Attributes applied to the session cookie on every write.
#[derive(Clone, Debug)]
pub struct CookieSettings {
    pub name: String,
    pub domain: Option<String>,
    pub expire: Duration,
    pub secure: bool,
    pub http_only: bool,
}

impl CookieSettings {
    /// `Set-Cookie` value carrying a sealed session.
    pub fn set_header(&self, value: &str) -> String {
        self.render(value, self.expire.as_secs() as i64)
    }

    /// `Set-Cookie` value that clears the session cookie.
    pub fn clear_header(&self) -> String {
        self.render("", -1)
    }

    fn render(&self, value: &str, max_age: i64) -> String {
        let mut header = format!("{}={value}; Path=/; SameSite=Lax; Max-Age={max_age}", self.name);
        if let Some(domain) = &self.domain {
            header.push_str("; Domain=");
            header.push_str(domain);
        }
        if self.http_only {
            header.push_str("; HttpOnly");
        }
        if self.secure {
            header.push_str("; Secure");
        }
        header
    }

    /// Extract this cookie's value from a `Cookie` request header.
    pub fn read<'a>(&self, cookie_header: &'a str) -> Option<&'a str> {
        cookie_header.split(';').find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == self.name).then_some(value)
        })
    }

    /// Rewrite a `Cookie` request header with this cookie removed, so the
    /// session blob never reaches an upstream. Returns `None` when nothing
    /// is left.
    pub fn strip(&self, cookie_header: &str) -> Option<String> {
        let kept: Vec<&str> = cookie_header
            .split(';')
            .map(str::trim)
            .filter(|pair| {
                pair.split_once('=')
                    .map(|(name, _)| name != self.name)
                    .unwrap_or(true)
            })
            .collect();
        if kept.is_empty() {
            None
        } else {
            Some(kept.join("; "))
        }
    }
}
