// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::endpoint::{Endpoint, Protocol};

/// A concrete, attemptable address produced by resolving an
/// [`Endpoint`](../endpoint/struct.Endpoint.html).
///
/// Equality and ordering are defined on the connector's own fields, so two
/// differently configured endpoints that resolve to the same address yield
/// equal connectors.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Connector {
    pub protocol: Protocol,
    pub address: SocketAddr,
    pub timeout: Option<Duration>,
}

impl Connector {
    pub fn new(
        protocol: Protocol,
        address: SocketAddr,
        timeout: Option<Duration>,
    ) -> Self {
        Connector {
            protocol,
            address,
            timeout,
        }
    }

    /// Build the connector for `address` using the protocol and timeout of
    /// the endpoint it was resolved from.
    pub fn for_endpoint(endpoint: &Endpoint, address: SocketAddr) -> Self {
        Connector::new(endpoint.protocol, address, endpoint.timeout)
    }
}

impl fmt::Display for Connector {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{} {}", self.protocol, self.address)
    }
}

// Pairs a connector with the endpoint that produced it. Two infos are equal
// when their connectors are equal.
#[doc(hidden)]
#[derive(Clone, Debug)]
pub struct ConnectorInfo {
    pub connector: Connector,
    pub endpoint: Endpoint,
}

impl ConnectorInfo {
    pub fn new(connector: Connector, endpoint: Endpoint) -> Self {
        ConnectorInfo {
            connector,
            endpoint,
        }
    }
}

impl PartialEq for ConnectorInfo {
    fn eq(&self, other: &ConnectorInfo) -> bool {
        self.connector == other.connector
    }
}

impl Eq for ConnectorInfo {}
