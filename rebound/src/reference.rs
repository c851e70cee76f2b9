// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::str::FromStr;

use crate::endpoint::{Endpoint, EndpointSelection};
use crate::error::Error;

/// Identifies a destination object: an identity, its candidate endpoints and
/// the policies used when connecting to them.
///
/// References are immutable values. Many proxies may share equal references,
/// and the request handler factory keys its handler cache on reference
/// equality rather than identity.
///
/// The stringified form is the identity followed by colon separated
/// endpoints:
///
/// ```text
/// inventory:tcp -h db1 -p 4061:tcp -h db2 -p 4061
/// ```
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Reference {
    identity: String,
    endpoints: Vec<Endpoint>,
    cache_connection: bool,
    collocation_optimized: bool,
    endpoint_selection: EndpointSelection,
}

impl Reference {
    /// A reference with connection caching and collocation optimization
    /// enabled and random endpoint selection.
    pub fn new(identity: &str, endpoints: Vec<Endpoint>) -> Self {
        Reference {
            identity: String::from(identity),
            endpoints,
            cache_connection: true,
            collocation_optimized: true,
            endpoint_selection: EndpointSelection::default(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn cache_connection(&self) -> bool {
        self.cache_connection
    }

    pub fn collocation_optimized(&self) -> bool {
        self.collocation_optimized
    }

    pub fn endpoint_selection(&self) -> EndpointSelection {
        self.endpoint_selection
    }

    pub fn with_cache_connection(mut self, cache_connection: bool) -> Self {
        self.cache_connection = cache_connection;
        self
    }

    pub fn with_collocation_optimized(mut self, collocation: bool) -> Self {
        self.collocation_optimized = collocation;
        self
    }

    pub fn with_endpoint_selection(
        mut self,
        selection: EndpointSelection,
    ) -> Self {
        self.endpoint_selection = selection;
        self
    }

    pub fn with_endpoints(mut self, endpoints: Vec<Endpoint>) -> Self {
        self.endpoints = endpoints;
        self
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.identity)?;
        for endpoint in &self.endpoints {
            write!(fmt, ":{}", endpoint)?;
        }
        Ok(())
    }
}

impl FromStr for Reference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = split_unquoted(s, ':').into_iter();

        let identity = match parts.next() {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => {
                return Err(Error::InvalidReference(format!(
                    "no identity in `{}'",
                    s
                )))
            }
        };

        let endpoints = parts
            .map(|part| {
                part.trim().parse::<Endpoint>().map_err(|e| {
                    Error::InvalidReference(format!("`{}': {}", s, e))
                })
            })
            .collect::<Result<Vec<Endpoint>, Error>>()?;

        Ok(Reference::new(&identity, endpoints))
    }
}

fn split_unquoted(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quoted = false;
    let mut start = 0;

    for (idx, c) in s.char_indices() {
        if c == '"' {
            quoted = !quoted;
        } else if c == sep && !quoted {
            parts.push(&s[start..idx]);
            start = idx + c.len_utf8();
        }
    }
    parts.push(&s[start..]);
    parts
}
