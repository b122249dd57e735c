//! Transport addresses: `<protocol>://<host>:<port>[/#<option>]`.
//!
//! The host may be empty (bootstrap entries strip it after the IP is
//! lifted into the announcement) and IPv6 hosts are bracketed. The
//! fragment carries an optional protocol-specific option, for bootstrap
//! hubs the base58 hub ID.

use std::fmt;

use crate::{Error, Result};

/// A parsed transport address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transport {
    /// Transport protocol, e.g. `tcp`.
    pub protocol: String,
    /// Host part; may be a domain, an IP, or empty.
    pub domain: String,
    /// Port number.
    pub port: u16,
    /// Optional fragment option.
    pub option: String,
}

impl Transport {
    /// Parse a transport address.
    pub fn parse(input: &str) -> Result<Self> {
        let (protocol, rest) = input
            .split_once("://")
            .ok_or_else(|| Error::InvalidTransport(format!("missing scheme: {input}")))?;
        if protocol.is_empty() || !protocol.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::InvalidTransport(format!("bad protocol: {input}")));
        }

        let (addr, option) = match rest.split_once("/#") {
            Some((addr, option)) => (addr, option.to_string()),
            None => (rest, String::new()),
        };

        let (domain, port_str) = if let Some(stripped) = addr.strip_prefix('[') {
            // Bracketed IPv6 host.
            let (host, rest) = stripped
                .split_once(']')
                .ok_or_else(|| Error::InvalidTransport(format!("unclosed bracket: {input}")))?;
            let port = rest
                .strip_prefix(':')
                .ok_or_else(|| Error::InvalidTransport(format!("missing port: {input}")))?;
            (format!("[{host}]"), port)
        } else {
            let (domain, port) = addr
                .rsplit_once(':')
                .ok_or_else(|| Error::InvalidTransport(format!("missing port: {input}")))?;
            (domain.to_string(), port)
        };

        let port: u16 = port_str
            .parse()
            .map_err(|_| Error::InvalidTransport(format!("bad port: {input}")))?;

        Ok(Self {
            protocol: protocol.to_string(),
            domain,
            port,
            option,
        })
    }

    /// The host with brackets stripped, for IP parsing.
    pub fn bare_host(&self) -> &str {
        self.domain
            .strip_prefix('[')
            .and_then(|d| d.strip_suffix(']'))
            .unwrap_or(&self.domain)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.domain, self.port)?;
        if !self.option.is_empty() {
            write!(f, "/#{}", self.option)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_format_round_trip() {
        for input in ["tcp://1.2.3.4:17", "tcp://:17", "spn://hub.example.com:717/#opt"] {
            let t = Transport::parse(input).unwrap();
            assert_eq!(t.to_string(), input);
        }
    }

    #[test]
    fn parses_fields() {
        let t = Transport::parse("tcp://1.2.3.4:17/#abc").unwrap();
        assert_eq!(t.protocol, "tcp");
        assert_eq!(t.domain, "1.2.3.4");
        assert_eq!(t.port, 17);
        assert_eq!(t.option, "abc");
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        let t = Transport::parse("tcp://[2001:db8::1]:17").unwrap();
        assert_eq!(t.domain, "[2001:db8::1]");
        assert_eq!(t.bare_host(), "2001:db8::1");
        assert_eq!(t.port, 17);
        assert_eq!(t.to_string(), "tcp://[2001:db8::1]:17");
    }

    #[test]
    fn rejects_malformed_input() {
        for input in ["1.2.3.4:17", "tcp://1.2.3.4", "tcp://1.2.3.4:badport", "://:17"] {
            assert!(Transport::parse(input).is_err(), "accepted {input}");
        }
    }
}
