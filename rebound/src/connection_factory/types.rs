// Copyright 2020 Joyent, Inc.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use derive_more::{Add, AddAssign, Display, From, Into, Sub, SubAssign};
use serde_derive::Deserialize;
use slog::Logger;

use crate::connection::{same_connection, Connection};
use crate::connection_factory::connect_callback::ConnectCallback;
use crate::connector::Connector;
use crate::endpoint::Endpoint;
use crate::observer::Observer;

/// Counts reported by the connection factory
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FactoryStats {
    /// The number of distinct pooled connections
    pub connections: ConnectionCount,
    /// The number of connectors with a connection attempt in flight
    pub pending_connectors: ConnectionCount,
    /// The number of `create` requests that have not been answered yet
    pub pending_connects: ConnectionCount,
    /// The number of connections whose handshake is in flight
    pub starting_connections: ConnectionCount,
}

impl FactoryStats {
    pub fn new() -> Self {
        FactoryStats {
            connections: ConnectionCount::from(0),
            pending_connectors: ConnectionCount::from(0),
            pending_connects: ConnectionCount::from(0),
            starting_connections: ConnectionCount::from(0),
        }
    }
}

impl Default for FactoryStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Endpoint settings that take precedence over the values carried by the
/// endpoints handed to the factory. Every field is optional so an overrides
/// section may be deserialized from a partial configuration document.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct Overrides {
    /// Connect timeout in milliseconds applied to every endpoint.
    pub timeout: Option<u64>,
    /// Compression flag reported to callers alongside a connection.
    pub compress: Option<bool>,
    /// Host substituted into endpoints that carry no host.
    pub default_host: Option<String>,
}

impl Overrides {
    pub fn apply(&self, mut endpoint: Endpoint) -> Endpoint {
        if let Some(timeout) = self.timeout {
            endpoint.timeout = Some(Duration::from_millis(timeout));
        }
        if endpoint.host.is_empty() {
            if let Some(host) = &self.default_host {
                endpoint.host = host.clone();
            }
        }
        endpoint
    }

    pub fn compress(&self, endpoint: &Endpoint) -> bool {
        self.compress.unwrap_or(endpoint.compress)
    }
}

/// The configuration options for an outgoing connection factory.
#[derive(Default)]
pub struct ConnectionFactoryOptions {
    /// An optional `slog` logger instance. If none is provided then the logging
    /// will fall back to using the [`slog-stdlog`](https://docs.rs/slog-stdlog)
    /// drain which is essentially the same as using the rust standard
    /// [`log`](https://docs.rs/log) crate.
    pub log: Option<Logger>,
    pub overrides: Overrides,
    /// An optional observer notified of connection establishment attempts.
    pub observer: Option<Arc<dyn Observer>>,
    /// Optional connection check interval in seconds. This represents the
    /// length of the period of the task that prunes closed connections from
    /// the pool. If not specified the default is 30 seconds.
    pub connection_check_interval: Option<u64>,
}

impl fmt::Debug for ConnectionFactoryOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionFactoryOptions")
            .field("log", &self.log)
            .field("overrides", &self.overrides)
            .field("observer", &self.observer.is_some())
            .field("connection_check_interval", &self.connection_check_interval)
            .finish()
    }
}

/// A newtype wrapper around u32 used for the counts kept by the connection
/// factory.
#[derive(
    Add,
    AddAssign,
    Clone,
    Copy,
    Debug,
    Display,
    Eq,
    From,
    Into,
    Ord,
    PartialOrd,
    PartialEq,
    Sub,
    SubAssign,
)]
pub struct ConnectionCount(u32);

// The internal data structures used to manage the connection factory.
#[doc(hidden)]
pub struct FactoryData {
    pub destroyed: bool,
    pub connections: BTreeMap<Connector, Vec<Arc<dyn Connection>>>,
    pub connections_by_endpoint: HashMap<Endpoint, Vec<Arc<dyn Connection>>>,
    pub pending: BTreeMap<Connector, Vec<Arc<ConnectCallback>>>,
    pub starting: Vec<Arc<dyn Connection>>,
    pub pending_connect_count: ConnectionCount,
}

impl FactoryData {
    #[doc(hidden)]
    pub fn new() -> Self {
        FactoryData {
            destroyed: false,
            connections: BTreeMap::new(),
            connections_by_endpoint: HashMap::new(),
            pending: BTreeMap::new(),
            starting: Vec::new(),
            pending_connect_count: ConnectionCount::from(0),
        }
    }

    // Every distinct pooled connection.
    pub fn all_connections(&self) -> Vec<Arc<dyn Connection>> {
        self.connections.values().flatten().cloned().collect()
    }

    // Index a connection under its connector and under both compression
    // variants of each endpoint.
    pub fn insert_connection(
        &mut self,
        connector: &Connector,
        endpoints: &[Endpoint],
        connection: &Arc<dyn Connection>,
    ) {
        push_unique(
            self.connections.entry(connector.clone()).or_default(),
            connection,
        );
        for endpoint in endpoints {
            for compress in &[true, false] {
                let key = endpoint.clone().with_compress(*compress);
                push_unique(
                    self.connections_by_endpoint.entry(key).or_default(),
                    connection,
                );
            }
        }
    }

    // Remove connections that have been fully closed from every map. Returns
    // the number of connections removed.
    pub fn reap_closed(&mut self) -> usize {
        let before = self.connections.values().map(Vec::len).sum::<usize>();

        self.connections.retain(|_, conns| {
            conns.retain(|c| !c.is_closed());
            !conns.is_empty()
        });
        self.connections_by_endpoint.retain(|_, conns| {
            conns.retain(|c| !c.is_closed());
            !conns.is_empty()
        });

        let after = self.connections.values().map(Vec::len).sum::<usize>();
        before - after
    }

    pub fn remove_starting(&mut self, connection: &Arc<dyn Connection>) {
        self.starting.retain(|c| !same_connection(c, connection));
    }

    pub fn stats(&self) -> FactoryStats {
        FactoryStats {
            connections: count(self.all_connections().len()),
            pending_connectors: count(self.pending.len()),
            pending_connects: self.pending_connect_count,
            starting_connections: count(self.starting.len()),
        }
    }
}

impl Default for FactoryData {
    fn default() -> Self {
        Self::new()
    }
}

fn push_unique(conns: &mut Vec<Arc<dyn Connection>>, connection: &Arc<dyn Connection>) {
    if !conns.iter().any(|c| same_connection(c, connection)) {
        conns.push(Arc::clone(connection));
    }
}

fn count(n: usize) -> ConnectionCount {
    ConnectionCount::from(n as u32)
}

// Protected access to the internal connection factory data structures
#[doc(hidden)]
pub struct ProtectedData(Arc<(Mutex<FactoryData>, Condvar)>);

impl ProtectedData {
    pub fn new(factory_data: FactoryData) -> Self {
        ProtectedData(Arc::new((Mutex::new(factory_data), Condvar::new())))
    }

    pub fn factory_data_lock(&self) -> MutexGuard<FactoryData> {
        (self.0).0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn condvar_wait<'a>(
        &self,
        g: MutexGuard<'a, FactoryData>,
        m_timeout_ms: Option<u64>,
    ) -> (MutexGuard<'a, FactoryData>, bool) {
        match m_timeout_ms {
            Some(timeout_ms) => {
                let timeout = Duration::from_millis(timeout_ms);
                let wait_result = (self.0)
                    .1
                    .wait_timeout(g, timeout)
                    .unwrap_or_else(PoisonError::into_inner);
                (wait_result.0, wait_result.1.timed_out())
            }
            None => (
                (self.0).1.wait(g).unwrap_or_else(PoisonError::into_inner),
                false,
            ),
        }
    }

    pub fn condvar_notify(&self) {
        (self.0).1.notify_all()
    }
}

impl Clone for ProtectedData {
    fn clone(&self) -> ProtectedData {
        ProtectedData(Arc::clone(&self.0))
    }
}

/// A trait that provides utility methods for shuffling a collection.
pub trait ShuffleCollection {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool;
    fn swap(&mut self, i: usize, j: usize);
}

impl<T> ShuffleCollection for Vec<T> {
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn len(&self) -> usize {
        self.len()
    }
    fn swap(&mut self, i: usize, j: usize) {
        self.as_mut_slice().swap(i, j)
    }
}
