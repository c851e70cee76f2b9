// Copyright 2020 Joyent, Inc.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use slog::{o, trace, Drain, Logger};

use rebound::connector::Connector;
use rebound::endpoint::{Endpoint, EndpointSelection};
use rebound::error::Error;
use rebound::resolver::{EndpointResolver, ResolveCallback};

/// An endpoint resolver backed by a fixed host table.
///
/// Literal IP addresses resolve to themselves. Host names resolve to the
/// addresses registered for them, in registration order. Resolution
/// completes on the calling thread.
pub struct StaticResolver {
    hosts: Mutex<HashMap<String, Vec<IpAddr>>>,
    resolve_count: AtomicUsize,
    log: Logger,
}

impl StaticResolver {
    pub fn new(hosts: Vec<(&str, Vec<IpAddr>)>, log: Option<Logger>) -> Self {
        let log = log.unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let hosts = hosts
            .into_iter()
            .map(|(host, addresses)| (String::from(host), addresses))
            .collect();

        StaticResolver {
            hosts: Mutex::new(hosts),
            resolve_count: AtomicUsize::new(0),
            log,
        }
    }

    pub fn add_host(&self, host: &str, addresses: Vec<IpAddr>) {
        self.hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(String::from(host), addresses);
    }

    pub fn remove_host(&self, host: &str) {
        self.hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(host);
    }

    /// The number of resolutions performed so far.
    pub fn resolve_count(&self) -> usize {
        self.resolve_count.load(Ordering::SeqCst)
    }

    fn lookup(&self, endpoint: &Endpoint) -> Result<Vec<Connector>, Error> {
        let addresses = match endpoint.host.parse::<IpAddr>() {
            Ok(ip) => vec![ip],
            Err(_) => self
                .hosts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&endpoint.host)
                .cloned()
                .ok_or_else(|| {
                    Error::ResolutionFailure(format!("unknown host {}", endpoint.host))
                })?,
        };

        Ok(addresses
            .into_iter()
            .map(|ip| Connector::for_endpoint(endpoint, SocketAddr::new(ip, endpoint.port)))
            .collect())
    }
}

impl EndpointResolver for StaticResolver {
    fn resolve(
        &self,
        endpoint: &Endpoint,
        _selection: EndpointSelection,
        callback: ResolveCallback,
    ) {
        self.resolve_count.fetch_add(1, Ordering::SeqCst);
        let result = self.lookup(endpoint);
        trace!(self.log, "resolved {}", endpoint; "ok" => result.is_ok());
        callback(result);
    }
}
