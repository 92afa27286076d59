use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::errors::HandshakeError;
use crate::url::{Authority, Scheme};
use crate::ClientConfig;

/// upgrade token named in the Upgrade header
pub const UPGRADE_PROTOCOL: &str = "winksock/1";

/// redirect hop limit
pub const MAX_REDIRECTS: u8 = 5;

/// where an upgrade request is sent: authority plus request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeTarget {
    /// authority to dial
    pub authority: Authority,
    /// request path, `/` unless a redirect named another
    pub path: String,
}

impl HandshakeTarget {
    /// target for a fresh connection to `authority`
    pub fn new(authority: Authority) -> Self {
        Self {
            authority,
            path: "/".to_string(),
        }
    }

    /// resolve a Location header against this target
    pub fn redirect(&self, location: &str) -> Result<HandshakeTarget, HandshakeError> {
        let bad = || HandshakeError::BadLocation(location.to_string());
        if location.starts_with('/') {
            return Ok(Self {
                authority: self.authority.clone(),
                path: location.to_string(),
            });
        }
        let absolute;
        let uri: http::Uri = if location.contains("://") {
            location.parse().map_err(|_| bad())?
        } else {
            absolute = format!("http://{location}");
            absolute.parse().map_err(|_| bad())?
        };
        let scheme = match uri.scheme_str() {
            Some("http") => Scheme::Http,
            Some("https") => Scheme::Https,
            _ => return Err(bad()),
        };
        let host = uri.host().ok_or_else(bad)?.to_ascii_lowercase();
        let port = uri.port_u16().unwrap_or_else(|| scheme.default_port());
        let path = match uri.path() {
            "" => "/".to_string(),
            path => path.to_string(),
        };
        Ok(Self {
            authority: Authority { scheme, host, port },
            path,
        })
    }
}

/// terminal handshake outcomes
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// 101 with the right upgrade token; bytes past the header section are
    /// the first frame bytes
    Upgraded {
        /// unconsumed input to seed the frame decoder
        remainder: BytesMut,
    },
    /// 301/302/307 with redirects enabled
    Redirect {
        /// Location header value, resolved by the caller
        location: String,
    },
}

/// incremental HTTP/1.1 upgrade response parser
#[derive(Debug, Default)]
pub struct Handshake {
    buf: BytesMut,
}

/// serialize the upgrade request for `target`
pub fn request(target: &HandshakeTarget, config: &ClientConfig) -> Bytes {
    let mut builder = http::Request::builder()
        .header("Host", target.authority.host_header())
        .header("Connection", "Upgrade")
        .header("Upgrade", UPGRADE_PROTOCOL)
        .header(
            "Origin",
            config
                .origin
                .clone()
                .unwrap_or_else(|| target.authority.host.clone()),
        );
    if let Some(agent) = &config.agent {
        builder = builder.header("User-Agent", agent);
    }
    if !config.follow_redirects {
        builder = builder.header("X-Accept-Redirects", "no");
    }
    let req = builder.body(()).unwrap();
    let headers = req
        .headers()
        .iter()
        .map(|(k, v)| format!("{}: {}", k, v.to_str().unwrap_or_default()))
        .collect::<Vec<String>>()
        .join("\r\n");
    let req_str = format!("GET {path} HTTP/1.1\r\n{headers}\r\n\r\n", path = target.path);
    Bytes::from(req_str)
}

impl Handshake {
    /// feed response bytes; `Ok(None)` until the header section is complete
    pub fn parse(
        &mut self,
        input: &[u8],
        follow_redirects: bool,
    ) -> Result<Option<HandshakeOutcome>, HandshakeError> {
        self.buf.extend_from_slice(input);
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut resp = httparse::Response::new(&mut headers);
        let header_len = match resp.parse(&self.buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(_) => return Err(HandshakeError::Malformed),
        };
        let code = resp.code.ok_or(HandshakeError::Malformed)?;
        let reason = resp.reason.unwrap_or_default().to_string();
        match code {
            101 => {
                let upgrade = resp
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("upgrade"))
                    .map(|h| h.value.to_vec())
                    .unwrap_or_default();
                if !upgrade.eq_ignore_ascii_case(UPGRADE_PROTOCOL.as_bytes()) {
                    return Err(HandshakeError::BadProtocolVersion);
                }
                debug!("protocol handshake complete");
                let remainder = self.buf.split_off(header_len);
                Ok(Some(HandshakeOutcome::Upgraded { remainder }))
            }
            301 | 302 | 307 if follow_redirects => {
                let location = resp
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("location"))
                    .map(|h| String::from_utf8_lossy(h.value).to_string())
                    .ok_or(HandshakeError::MissingLocation)?;
                debug!(code, %location, "handshake redirected");
                Ok(Some(HandshakeOutcome::Redirect { location }))
            }
            _ => {
                let body = String::from_utf8_lossy(&self.buf[header_len..]);
                let body = body.trim();
                let reason = match (reason.is_empty(), body.is_empty()) {
                    (true, true) => format!("HTTP {code}"),
                    (false, true) => reason,
                    (true, false) => body.to_string(),
                    (false, false) => format!("{reason}: {body}"),
                };
                Err(HandshakeError::BadStatus { code, reason })
            }
        }
    }
}
