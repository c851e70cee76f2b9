// Copyright 2020 Joyent, Inc.

//! Symbolic transport descriptors.
//!
//! An [`Endpoint`](struct.Endpoint.html) names a destination before address
//! resolution: a protocol, a host name or literal address, a port, a connect
//! timeout and a compression flag. Endpoints are plain values and may be used
//! as map keys independent of where they came from. Their stringified form
//! is the familiar option syntax:
//!
//! ```text
//! tcp -h db.example.com -p 4061 -t 5000 -z
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;

/// The transport protocol of an endpoint.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Protocol {
    Tcp,
    Ssl,
    Ws,
    Wss,
}

impl Protocol {
    /// Whether the protocol runs over a secure channel.
    pub fn secure(self) -> bool {
        match self {
            Protocol::Ssl | Protocol::Wss => true,
            Protocol::Tcp | Protocol::Ws => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Ssl => "ssl",
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "ssl" => Ok(Protocol::Ssl),
            "ws" => Ok(Protocol::Ws),
            "wss" => Ok(Protocol::Wss),
            _ => Err(Error::InvalidEndpoint(format!(
                "unknown protocol `{}'",
                s
            ))),
        }
    }
}

/// The order in which the endpoints of a reference are tried.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EndpointSelection {
    /// Endpoint iteration order is shuffled once per connection request.
    Random,
    /// Endpoints are tried strictly in the order given.
    Ordered,
}

impl Default for EndpointSelection {
    fn default() -> Self {
        EndpointSelection::Random
    }
}

impl fmt::Display for EndpointSelection {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EndpointSelection::Random => fmt.write_str("random"),
            EndpointSelection::Ordered => fmt.write_str("ordered"),
        }
    }
}

/// A transport descriptor prior to address resolution.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Endpoint {
    pub protocol: Protocol,
    /// Host name or literal address. An empty host is replaced by the
    /// factory's default host override, if any.
    pub host: String,
    pub port: u16,
    /// Connect timeout. `None` means the attempt never times out.
    pub timeout: Option<Duration>,
    pub compress: bool,
}

impl Endpoint {
    pub fn new(protocol: Protocol, host: &str, port: u16) -> Self {
        Endpoint {
            protocol,
            host: String::from(host),
            port,
            timeout: None,
            compress: false,
        }
    }

    /// Shorthand for a plain TCP endpoint.
    pub fn tcp(host: &str, port: u16) -> Self {
        Endpoint::new(Protocol::Tcp, host, port)
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = String::from(host);
        self
    }

    pub fn secure(&self) -> bool {
        self.protocol.secure()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.protocol)?;
        if !self.host.is_empty() {
            if needs_quotes(&self.host) {
                write!(fmt, " -h \"{}\"", self.host)?;
            } else {
                write!(fmt, " -h {}", self.host)?;
            }
        }
        write!(fmt, " -p {}", self.port)?;
        match self.timeout {
            Some(t) => write!(fmt, " -t {}", t.as_millis())?,
            None => write!(fmt, " -t infinite")?,
        }
        if self.compress {
            write!(fmt, " -z")?;
        }
        Ok(())
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens = tokenize(s)?;
        let mut iter = tokens.into_iter();

        let protocol: Protocol = match iter.next() {
            Some(p) => p.parse()?,
            None => {
                return Err(Error::InvalidEndpoint(String::from(
                    "empty endpoint",
                )))
            }
        };

        let mut endpoint = Endpoint::new(protocol, "", 0);
        let mut port = None;

        while let Some(option) = iter.next() {
            match option.as_str() {
                "-h" => endpoint.host = option_argument(&option, iter.next(), s)?,
                "-p" => {
                    let arg = option_argument(&option, iter.next(), s)?;
                    let p = arg.parse::<u16>().map_err(|_| {
                        Error::InvalidEndpoint(format!(
                            "invalid port `{}' in `{}'",
                            arg, s
                        ))
                    })?;
                    port = Some(p);
                }
                "-t" => {
                    let arg = option_argument(&option, iter.next(), s)?;
                    endpoint.timeout = if arg == "infinite" {
                        None
                    } else {
                        let ms = arg.parse::<u64>().map_err(|_| {
                            Error::InvalidEndpoint(format!(
                                "invalid timeout `{}' in `{}'",
                                arg, s
                            ))
                        })?;
                        Some(Duration::from_millis(ms))
                    };
                }
                "-z" => endpoint.compress = true,
                _ => {
                    return Err(Error::InvalidEndpoint(format!(
                        "unknown option `{}' in `{}'",
                        option, s
                    )))
                }
            }
        }

        endpoint.port = port.ok_or_else(|| {
            Error::InvalidEndpoint(format!("no port in `{}'", s))
        })?;

        Ok(endpoint)
    }
}

fn option_argument(
    option: &str,
    arg: Option<String>,
    s: &str,
) -> Result<String, Error> {
    match arg {
        Some(a) if !a.starts_with('-') => Ok(a),
        _ => Err(Error::InvalidEndpoint(format!(
            "no argument provided for {} option in `{}'",
            option, s
        ))),
    }
}

fn needs_quotes(host: &str) -> bool {
    host.chars().any(|c| c == ':' || c.is_whitespace())
}

// Split on whitespace, keeping double-quoted runs together.
fn tokenize(s: &str) -> Result<Vec<String>, Error> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_token = false;

    for c in s.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_token {
                    tokens.push(std::mem::replace(&mut current, String::new()));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if quoted {
        return Err(Error::InvalidEndpoint(format!(
            "mismatched quotes in `{}'",
            s
        )));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_endpoint() {
        let ep: Endpoint = "tcp -h db.example.com -p 4061 -t 5000 -z"
            .parse()
            .expect("parse");
        assert_eq!(ep.protocol, Protocol::Tcp);
        assert_eq!(ep.host, "db.example.com");
        assert_eq!(ep.port, 4061);
        assert_eq!(ep.timeout, Some(Duration::from_millis(5000)));
        assert!(ep.compress);
        assert!(!ep.secure());
    }

    #[test]
    fn parse_quoted_ipv6_host() {
        let ep: Endpoint = "ssl -h \"::1\" -p 10000".parse().expect("parse");
        assert_eq!(ep.host, "::1");
        assert!(ep.secure());
        assert_eq!(ep.to_string(), "ssl -h \"::1\" -p 10000 -t infinite");
    }

    #[test]
    fn display_parses_back() {
        let ep = Endpoint::tcp("10.0.0.1", 80)
            .with_timeout(Some(Duration::from_millis(250)))
            .with_compress(true);
        let parsed: Endpoint = ep.to_string().parse().expect("parse");
        assert_eq!(parsed, ep);
    }

    #[test]
    fn parse_errors() {
        assert!("".parse::<Endpoint>().is_err());
        assert!("udp -h a -p 1".parse::<Endpoint>().is_err());
        assert!("tcp -h a".parse::<Endpoint>().is_err());
        assert!("tcp -h a -p 99999".parse::<Endpoint>().is_err());
        assert!("tcp -h -p 1".parse::<Endpoint>().is_err());
        assert!("tcp -h \"a -p 1".parse::<Endpoint>().is_err());
        assert!("tcp -p 1 -x".parse::<Endpoint>().is_err());
    }

    #[test]
    fn compress_is_part_of_identity() {
        let plain = Endpoint::tcp("a", 1);
        let compressed = plain.clone().with_compress(true);
        assert_ne!(plain, compressed);
        assert_eq!(plain, compressed.with_compress(false));
    }
}
