//! `cookie` and `set-cookie` parsing.
//!
//! Parsing is lenient in the way browsers and Go's `net/http` are:
//! malformed pairs are skipped, unknown set-cookie attributes are kept in
//! `unparsed`, and nothing here ever fails the stream.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SameSite {
    /// `SameSite` present with an unrecognised value.
    Default,
    Lax,
    Strict,
    None,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: String,
    pub domain: String,
    /// `Expires` exactly as received.
    pub expires: Option<String>,
    /// `None` means no `Max-Age` attribute, `Some(-1)` means delete now
    /// (`Max-Age=0` or negative), otherwise the age in seconds.
    pub max_age: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
    pub partitioned: bool,
    /// The full `set-cookie` line this cookie came from.
    pub raw: String,
    /// Attributes that were not understood, verbatim.
    pub unparsed: Vec<String>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ..Self::default()
        }
    }
}

/// Parses `cookie` request header values into name/value pairs, in order.
pub fn parse_cookies<'a, I>(lines: I) -> Vec<Cookie>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut out = Vec::new();
    for line in lines {
        for part in line.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (name, value) = part.split_once('=').unwrap_or((part, ""));
            if !is_token(name) {
                continue;
            }
            if let Some(value) = parse_value(value, true) {
                out.push(Cookie::new(name, value));
            }
        }
    }
    out
}

/// Parses `set-cookie` response header values, one cookie per line.
pub fn parse_set_cookies<'a, I>(lines: I) -> Vec<Cookie>
where
    I: IntoIterator<Item = &'a str>,
{
    lines.into_iter().filter_map(parse_set_cookie).collect()
}

fn parse_set_cookie(line: &str) -> Option<Cookie> {
    let mut parts = line.trim().split(';');
    let first = parts.next()?.trim();
    let (name, value) = first.split_once('=')?;
    let name = name.trim();
    if !is_token(name) {
        return None;
    }
    let mut cookie = Cookie::new(name, parse_value(value, true)?);
    cookie.raw = line.to_string();

    for part in parts {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (attr, val) = part.split_once('=').unwrap_or((part, ""));
        let attr = attr.trim().to_ascii_lowercase();
        let Some(val) = parse_value(val, false) else {
            cookie.unparsed.push(part.to_string());
            continue;
        };
        match attr.as_str() {
            "samesite" => {
                cookie.same_site = Some(match val.to_ascii_lowercase().as_str() {
                    "lax" => SameSite::Lax,
                    "strict" => SameSite::Strict,
                    "none" => SameSite::None,
                    _ => SameSite::Default,
                });
            }
            "secure" => cookie.secure = true,
            "httponly" => cookie.http_only = true,
            "domain" => cookie.domain = val,
            "max-age" => match val.parse::<i64>() {
                // leading zeros are rejected, except for a plain "0"
                Ok(secs) if secs == 0 || !val.starts_with('0') => {
                    cookie.max_age = Some(if secs <= 0 { -1 } else { secs });
                }
                _ => cookie.unparsed.push(part.to_string()),
            },
            "expires" => cookie.expires = Some(val),
            "path" => cookie.path = val,
            "partitioned" => cookie.partitioned = true,
            _ => cookie.unparsed.push(part.to_string()),
        }
    }
    Some(cookie)
}

fn parse_value(raw: &str, allow_quotes: bool) -> Option<String> {
    let mut v = raw.trim();
    if allow_quotes && v.len() > 1 && v.starts_with('"') && v.ends_with('"') {
        v = &v[1..v.len() - 1];
    }
    v.bytes().all(valid_value_byte).then(|| v.to_string())
}

fn valid_value_byte(b: u8) -> bool {
    (0x20..0x7f).contains(&b) && b != b'"' && b != b';' && b != b'\\'
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

impl fmt::Display for Cookie {
    /// Serialises the cookie as a `set-cookie` header value.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.contains(' ') || self.value.contains(',') {
            write!(f, "{}=\"{}\"", self.name, self.value)?;
        } else {
            write!(f, "{}={}", self.name, self.value)?;
        }
        if !self.path.is_empty() {
            write!(f, "; Path={}", self.path)?;
        }
        if !self.domain.is_empty() {
            write!(f, "; Domain={}", self.domain.trim_start_matches('.'))?;
        }
        if let Some(expires) = &self.expires {
            write!(f, "; Expires={}", expires)?;
        }
        match self.max_age {
            Some(secs) if secs > 0 => write!(f, "; Max-Age={}", secs)?,
            Some(_) => f.write_str("; Max-Age=0")?,
            None => {}
        }
        if self.http_only {
            f.write_str("; HttpOnly")?;
        }
        if self.secure {
            f.write_str("; Secure")?;
        }
        match self.same_site {
            Some(SameSite::Lax) => f.write_str("; SameSite=Lax")?,
            Some(SameSite::Strict) => f.write_str("; SameSite=Strict")?,
            Some(SameSite::None) => f.write_str("; SameSite=None")?,
            Some(SameSite::Default) | None => {}
        }
        if self.partitioned {
            f.write_str("; Partitioned")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_cookies_keep_declaration_order() {
        let cookies = parse_cookies(["a=1;b=2", " c=\"3\" ; bad name=x; d"]);
        let pairs: Vec<(&str, &str)> = cookies
            .iter()
            .map(|c| (c.name.as_str(), c.value.as_str()))
            .collect();
        assert_eq!(pairs, vec![("a", "1"), ("b", "2"), ("c", "3"), ("d", "")]);
    }

    #[test]
    fn set_cookie_attributes() {
        let c = parse_set_cookies([
            "sid=abc; Path=/; Domain=.example.com; Max-Age=60; Secure; HttpOnly; SameSite=Strict; Flavour=choc",
        ]);
        assert_eq!(c.len(), 1);
        let c = &c[0];
        assert_eq!(c.name, "sid");
        assert_eq!(c.value, "abc");
        assert_eq!(c.path, "/");
        assert_eq!(c.domain, ".example.com");
        assert_eq!(c.max_age, Some(60));
        assert!(c.secure && c.http_only);
        assert_eq!(c.same_site, Some(SameSite::Strict));
        assert_eq!(c.unparsed, vec!["Flavour=choc".to_string()]);
    }

    #[test]
    fn max_age_edge_cases() {
        let c = parse_set_cookies(["a=1; Max-Age=0", "b=2; Max-Age=-5", "c=3; Max-Age=007"]);
        assert_eq!(c[0].max_age, Some(-1));
        assert_eq!(c[1].max_age, Some(-1));
        assert_eq!(c[2].max_age, None);
        assert_eq!(c[2].unparsed, vec!["Max-Age=007".to_string()]);
    }

    #[test]
    fn lines_without_a_pair_are_skipped() {
        assert!(parse_set_cookies(["", "novalue", "=x"]).is_empty());
    }

    #[test]
    fn display_renders_set_cookie_line() {
        let mut c = Cookie::new("sid", "a b");
        c.path = "/".into();
        c.domain = ".example.com".into();
        c.http_only = true;
        c.same_site = Some(SameSite::Lax);
        assert_eq!(
            c.to_string(),
            "sid=\"a b\"; Path=/; Domain=example.com; HttpOnly; SameSite=Lax"
        );
    }
}
