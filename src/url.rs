use std::fmt;

use bytes::Bytes;
use percent_encoding::percent_decode_str;

use crate::errors::WinkError;
use crate::frame::{HEADER_LEN, MAX_PAYLOAD_SIZE};

/// largest handshake token, bounded by the OPEN frame payload
pub const MAX_TOKEN_SIZE: usize = MAX_PAYLOAD_SIZE - HEADER_LEN;

/// transport scheme of a channel url
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// plain tcp
    Http,
    /// tls, byte stream provided by the host
    Https,
}

impl Scheme {
    /// port used when the url does not name one
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    /// scheme name as it appears in a url
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// connection pool key: scheme + host + effective port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Authority {
    /// transport scheme
    pub scheme: Scheme,
    /// lowercase host name
    pub host: String,
    /// effective port, scheme default when the url omits it
    pub port: u16,
}

impl Authority {
    /// `host` or `host:port` as used in the Host header
    pub fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

/// parsed channel url
///
/// `[http(s)://]host[:port][/<chan-id>|/x<hex-chan-id>][?<url-encoded-token>]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUrl {
    /// where the shared connection goes
    pub authority: Authority,
    /// channel id named by the path, `1` when the path is empty
    pub channel: u32,
    /// percent-decoded query, passed opaquely in the OPEN payload
    pub token: Option<Bytes>,
}

impl ChannelUrl {
    /// parse a channel url, defaulting the scheme to `http`
    pub fn parse(input: &str) -> Result<Self, WinkError> {
        let bad = || WinkError::InvalidUrl(input.to_string());
        let absolute;
        let uri: http::Uri = if input.contains("://") {
            input.parse().map_err(|_| bad())?
        } else {
            absolute = format!("http://{input}");
            absolute.parse().map_err(|_| bad())?
        };
        let scheme = match uri.scheme_str() {
            Some("http") => Scheme::Http,
            Some("https") => Scheme::Https,
            _ => return Err(bad()),
        };
        let host = uri.host().ok_or_else(bad)?.to_ascii_lowercase();
        if host.is_empty() {
            return Err(bad());
        }
        let port = uri.port_u16().unwrap_or_else(|| scheme.default_port());
        let channel = parse_channel_id(uri.path()).ok_or_else(bad)?;
        let token = match uri.query() {
            None | Some("") => None,
            Some(query) => {
                let decoded: Vec<u8> = percent_decode_str(query).collect();
                if decoded.len() > MAX_TOKEN_SIZE {
                    return Err(WinkError::TokenTooLarge(MAX_TOKEN_SIZE));
                }
                Some(Bytes::from(decoded))
            }
        };
        Ok(Self {
            authority: Authority { scheme, host, port },
            channel,
            token,
        })
    }
}

/// empty path means channel 1; `/xNN` parses as hex, otherwise decimal
///
/// Id 0 is the broadcast wildcard and never a valid open target.
fn parse_channel_id(path: &str) -> Option<u32> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Some(1);
    }
    if trimmed.contains('/') {
        return None;
    }
    let id = match trimmed.strip_prefix('x').or_else(|| trimmed.strip_prefix('X')) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => trimmed.parse().ok()?,
    };
    if id == 0 {
        return None;
    }
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn full_form() {
        let url = ChannelUrl::parse("http://localhost:7010/x112233?secret%20key").unwrap();
        assert_eq!(url.authority.scheme, Scheme::Http);
        assert_eq!(url.authority.host, "localhost");
        assert_eq!(url.authority.port, 7010);
        assert_eq!(url.channel, 0x112233);
        assert_eq!(url.token.as_deref(), Some(&b"secret key"[..]));
    }

    #[test]
    fn scheme_defaults_to_http() {
        let url = ChannelUrl::parse("localhost:7010/5").unwrap();
        assert_eq!(url.authority.scheme, Scheme::Http);
        assert_eq!(url.channel, 5);
    }

    #[test]
    fn missing_path_means_channel_one() {
        assert_eq!(ChannelUrl::parse("example.com").unwrap().channel, 1);
        assert_eq!(ChannelUrl::parse("example.com/").unwrap().channel, 1);
    }

    #[test]
    fn default_ports() {
        assert_eq!(ChannelUrl::parse("http://h").unwrap().authority.port, 80);
        assert_eq!(ChannelUrl::parse("https://h").unwrap().authority.port, 443);
    }

    #[test]
    fn decimal_and_hex_ids() {
        assert_eq!(ChannelUrl::parse("h/42").unwrap().channel, 42);
        assert_eq!(ChannelUrl::parse("h/xff").unwrap().channel, 0xff);
        assert_eq!(
            ChannelUrl::parse("h/xffffffff").unwrap().channel,
            u32::MAX
        );
    }

    #[test]
    fn rejects_bad_ids() {
        assert_matches!(ChannelUrl::parse("h/0"), Err(WinkError::InvalidUrl(_)));
        assert_matches!(ChannelUrl::parse("h/x0"), Err(WinkError::InvalidUrl(_)));
        assert_matches!(
            ChannelUrl::parse("h/4294967296"),
            Err(WinkError::InvalidUrl(_))
        );
        assert_matches!(ChannelUrl::parse("h/abc"), Err(WinkError::InvalidUrl(_)));
        assert_matches!(ChannelUrl::parse("h/1/2"), Err(WinkError::InvalidUrl(_)));
    }

    #[test]
    fn rejects_foreign_schemes() {
        assert_matches!(
            ChannelUrl::parse("ftp://example.com/1"),
            Err(WinkError::InvalidUrl(_))
        );
    }

    #[test]
    fn empty_query_is_no_token() {
        assert_eq!(ChannelUrl::parse("h/1?").unwrap().token, None);
    }

    #[test]
    fn oversized_token() {
        let query = "a".repeat(MAX_TOKEN_SIZE + 1);
        assert_matches!(
            ChannelUrl::parse(&format!("h/1?{query}")),
            Err(WinkError::TokenTooLarge(_))
        );
    }

    #[test]
    fn authority_key_coalesces_case() {
        let a = ChannelUrl::parse("http://Example.com:7010/1").unwrap().authority;
        let b = ChannelUrl::parse("http://example.com:7010/2").unwrap().authority;
        assert_eq!(a, b);
    }
}
