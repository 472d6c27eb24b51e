//! Minimal SIP URI handling for identities and call targets.

use std::fmt;

use crate::error::{ClientError, ClientResult};

/// `sip:` or `sips:` URI in the `user@host[:port][;params]` form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub secure: bool,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Option<String>,
}

impl SipUri {
    /// Parse a full SIP URI
    pub fn parse(input: &str) -> ClientResult<Self> {
        let trimmed = input.trim();
        let (secure, rest) = if let Some(rest) = strip_scheme(trimmed, "sips:") {
            (true, rest)
        } else if let Some(rest) = strip_scheme(trimmed, "sip:") {
            (false, rest)
        } else {
            return Err(ClientError::invalid_target(input, "scheme must be sip: or sips:"));
        };

        let (address, params) = match rest.split_once(';') {
            Some((address, params)) => (address, Some(params.to_string())),
            None => (rest, None),
        };

        let (user, hostport) = match address.rsplit_once('@') {
            Some((user, hostport)) => {
                if user.is_empty() {
                    return Err(ClientError::invalid_target(input, "empty user part"));
                }
                if user.chars().any(|c| c.is_whitespace() || c == '<' || c == '>') {
                    return Err(ClientError::invalid_target(input, "illegal character in user part"));
                }
                (Some(user.to_string()), hostport)
            }
            None => (None, address),
        };

        let (host, port) = split_host_port(hostport).ok_or_else(|| {
            ClientError::invalid_target(input, "invalid host or port")
        })?;

        Ok(Self {
            secure,
            user,
            host,
            port,
            params,
        })
    }

    /// Turn a dial string into a SIP URI. Bare users (`2000`, `alice`) and
    /// `user@host` forms are completed with `default_domain` and the `sip:` scheme.
    pub fn normalize_target(target: &str, default_domain: &str) -> ClientResult<Self> {
        let trimmed = target.trim();
        if trimmed.is_empty() {
            return Err(ClientError::invalid_target(target, "target is empty"));
        }
        if trimmed.starts_with("sip:") || trimmed.starts_with("sips:") {
            return Self::parse(trimmed);
        }
        if trimmed.contains(':') && !trimmed.contains('@') {
            // tel:, http: and friends
            return Err(ClientError::invalid_target(target, "unsupported URI scheme"));
        }
        if trimmed.contains('@') {
            return Self::parse(&format!("sip:{}", trimmed));
        }
        Self::parse(&format!("sip:{}@{}", trimmed, default_domain))
    }

    /// `user@host` without scheme, port or parameters
    pub fn address_of_record(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.secure { "sips:" } else { "sip:" })?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if let Some(params) = &self.params {
            write!(f, ";{}", params)?;
        }
        Ok(())
    }
}

fn strip_scheme<'a>(input: &'a str, scheme: &str) -> Option<&'a str> {
    if input.len() >= scheme.len() && input[..scheme.len()].eq_ignore_ascii_case(scheme) {
        Some(&input[scheme.len()..])
    } else {
        None
    }
}

fn split_host_port(hostport: &str) -> Option<(String, Option<u16>)> {
    // IPv6 reference: [::1]:5060
    if let Some(rest) = hostport.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(port) => Some(port.parse().ok()?),
            None if tail.is_empty() => None,
            None => return None,
        };
        return Some((format!("[{}]", host), port));
    }

    let (host, port) = match hostport.split_once(':') {
        Some((host, port)) => (host, Some(port.parse::<u16>().ok()?)),
        None => (hostport, None),
    };
    let valid = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_');
    valid.then(|| (host.to_ascii_lowercase(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_uri() {
        let uri = SipUri::parse("sips:alice@Example.com:5061;transport=tls").unwrap();
        assert!(uri.secure);
        assert_eq!(uri.user.as_deref(), Some("alice"));
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, Some(5061));
        assert_eq!(uri.to_string(), "sips:alice@example.com:5061;transport=tls");
    }

    #[test]
    fn test_normalize_bare_user() {
        let uri = SipUri::normalize_target("2000", "example.com").unwrap();
        assert_eq!(uri.to_string(), "sip:2000@example.com");

        let uri = SipUri::normalize_target("bob@other.org", "example.com").unwrap();
        assert_eq!(uri.to_string(), "sip:bob@other.org");
    }

    #[test]
    fn test_rejects_bad_targets() {
        assert!(SipUri::normalize_target("", "example.com").is_err());
        assert!(SipUri::normalize_target("tel:+15551234", "example.com").is_err());
        assert!(SipUri::parse("sip:@example.com").is_err());
        assert!(SipUri::parse("sip:alice@exa mple.com").is_err());
        assert!(SipUri::parse("sip:alice@example.com:99999").is_err());
    }

    #[test]
    fn test_ipv6_host() {
        let uri = SipUri::parse("sip:bob@[2001:db8::1]:5060").unwrap();
        assert_eq!(uri.host, "[2001:db8::1]");
        assert_eq!(uri.port, Some(5060));
    }
}
