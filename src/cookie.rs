//! Cookies: `Cookie` request header parsing and `Set-Cookie` encoding.

use std::fmt;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};

/// A single HTTP cookie.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Cookie {
    name: String,
    value: String,
    path: Option<String>,
    domain: Option<String>,
    max_age: Option<i64>,
    secure: bool,
    http_only: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into(), ..Self::default() }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn value(&self) -> &str { &self.value }
    pub fn path(&self) -> Option<&str> { self.path.as_deref() }
    pub fn domain(&self) -> Option<&str> { self.domain.as_deref() }
    pub fn max_age(&self) -> Option<i64> { self.max_age }
    pub fn is_secure(&self) -> bool { self.secure }
    pub fn is_http_only(&self) -> bool { self.http_only }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// `Max-Age` in seconds. Also emits a matching `Expires` for old clients;
    /// `0` deletes the cookie.
    pub fn with_max_age(mut self, seconds: i64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    /// Parses a `Cookie` request header value (`a=1; b=2`).
    ///
    /// Pairs without `=` or with an empty name are skipped rather than
    /// failing the whole header.
    pub fn parse_header(header: &str) -> Vec<Cookie> {
        header
            .split(';')
            .filter_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                let value = value.trim().trim_matches('"');
                Some(Cookie::new(name, value))
            })
            .collect()
    }

    /// The `Set-Cookie` header value.
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)?;
        if let Some(max_age) = self.max_age {
            write!(f, "; Max-Age={max_age}")?;
            // Dates past what an IMF-fixdate can carry are left to `Max-Age`.
            let expires = SystemTime::now()
                .checked_add(Duration::from_secs(max_age.max(0).unsigned_abs()))
                .and_then(http_date);
            if let Some(expires) = expires {
                write!(f, "; Expires={expires}")?;
            }
        }
        if let Some(domain) = &self.domain {
            write!(f, "; Domain={domain}")?;
        }
        if let Some(path) = &self.path {
            write!(f, "; Path={path}")?;
        }
        if self.secure {
            f.write_str("; Secure")?;
        }
        if self.http_only {
            f.write_str("; HttpOnly")?;
        }
        Ok(())
    }
}

/// Formats a timestamp as an RFC 7231 IMF-fixdate, or `None` when chrono
/// cannot represent it.
pub(crate) fn http_date(at: SystemTime) -> Option<String> {
    let secs = match at.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_secs()).ok()?,
        Err(before) => {
            let before = before.duration();
            let whole = i64::try_from(before.as_secs()).ok()?;
            // Floor, as the post-epoch branch does.
            if before.subsec_nanos() > 0 { whole.checked_add(1)?.checked_neg()? } else { whole.checked_neg()? }
        }
    };
    let at = DateTime::<Utc>::from_timestamp(secs, 0)?;
    Some(at.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
}
