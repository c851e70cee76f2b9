// Copyright 2020 Joyent, Inc.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use backoff::{ExponentialBackoff, Operation};
use slog::{debug, o, warn, Drain, Logger};

use crate::connector::Connector;
use crate::endpoint::{Endpoint, EndpointSelection};
use crate::error::Error;

// Maximum time spent retrying a failing host lookup, in milliseconds
const DEFAULT_RETRY_TIMEOUT: u64 = 2000;

/// Delivers the outcome of one endpoint resolution.
pub type ResolveCallback =
    Box<dyn FnOnce(Result<Vec<Connector>, Error>) + Send + 'static>;

/// Endpoint resolver
///
/// An `EndpointResolver` turns one symbolic endpoint into the ordered list of
/// connectors that may be attempted for it. Resolution may complete on any
/// thread, including synchronously on the calling thread before `resolve`
/// returns. The callback must be invoked exactly once.
///
/// Implementations preserve the order of the addresses they produce; the
/// `selection` hint is informational and the connection factory performs any
/// endpoint shuffling itself. A failure is reported through the callback as an
/// `Error::ResolutionFailure` and is treated like a connect failure: the
/// factory moves on to the next endpoint.
pub trait EndpointResolver: Send + Sync {
    fn resolve(
        &self,
        endpoint: &Endpoint,
        selection: EndpointSelection,
        callback: ResolveCallback,
    );
}

/// Configuration for the [`SystemResolver`](struct.SystemResolver.html).
#[derive(Clone, Debug, Default)]
pub struct SystemResolverOptions {
    /// Order IPv6 addresses ahead of IPv4 addresses.
    pub prefer_ipv6: bool,
    /// Optional time limit in milliseconds for retrying a failed lookup. If
    /// not specified the default is 2000 milliseconds.
    pub retry_timeout: Option<u64>,
    /// An optional `slog` logger instance. If none is provided then the
    /// logging will fall back to the `slog-stdlog` drain.
    pub log: Option<Logger>,
}

/// An endpoint resolver that uses the platform's host lookup. Each resolution
/// runs on its own thread and transient lookup failures are retried with
/// exponential backoff.
#[derive(Clone, Debug)]
pub struct SystemResolver {
    prefer_ipv6: bool,
    retry_timeout: Duration,
    log: Logger,
}

impl SystemResolver {
    pub fn new(options: SystemResolverOptions) -> Self {
        let log = options
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let retry_timeout = Duration::from_millis(
            options.retry_timeout.unwrap_or(DEFAULT_RETRY_TIMEOUT),
        );

        SystemResolver {
            prefer_ipv6: options.prefer_ipv6,
            retry_timeout,
            log,
        }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        SystemResolver::new(SystemResolverOptions::default())
    }
}

impl EndpointResolver for SystemResolver {
    fn resolve(
        &self,
        endpoint: &Endpoint,
        _selection: EndpointSelection,
        callback: ResolveCallback,
    ) {
        let endpoint = endpoint.clone();
        let prefer_ipv6 = self.prefer_ipv6;
        let retry_timeout = self.retry_timeout;
        let log = self.log.clone();

        // Shared with the worker so the callback survives a failed spawn.
        let slot = Arc::new(Mutex::new(Some(callback)));
        let worker_slot = Arc::clone(&slot);

        let spawned = thread::Builder::new()
            .name(String::from("rebound-resolve"))
            .spawn(move || {
                let result =
                    lookup(&endpoint, prefer_ipv6, retry_timeout, &log);
                let callback = worker_slot
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(callback) = callback {
                    callback(result);
                }
            });

        if let Err(e) = spawned {
            warn!(self.log, "failed to spawn resolver thread: {}", e);
            let callback = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(callback) = callback {
                callback(Err(Error::from(e)));
            }
        }
    }
}

fn lookup(
    endpoint: &Endpoint,
    prefer_ipv6: bool,
    retry_timeout: Duration,
    log: &Logger,
) -> Result<Vec<Connector>, Error> {
    let mut backoff = ExponentialBackoff::default();
    backoff.max_elapsed_time = Some(retry_timeout);

    let host = endpoint.host.as_str();
    let mut op = || {
        (host, endpoint.port)
            .to_socket_addrs()
            .map(|addrs| addrs.collect::<Vec<SocketAddr>>())
            .map_err(|e| {
                debug!(log, "retrying lookup of {}: {}", host, e);
                backoff::Error::Transient(e)
            })
    };

    let addrs = match op.retry(&mut backoff) {
        Ok(addrs) => addrs,
        Err(backoff::Error::Transient(e))
        | Err(backoff::Error::Permanent(e)) => {
            return Err(Error::ResolutionFailure(format!("{}: {}", host, e)))
        }
    };

    if addrs.is_empty() {
        return Err(Error::ResolutionFailure(format!(
            "{}: no addresses",
            host
        )));
    }

    debug!(log, "resolved {} to {} addresses", host, addrs.len());

    Ok(order_addresses(addrs, prefer_ipv6)
        .into_iter()
        .map(|addr| Connector::for_endpoint(endpoint, addr))
        .collect())
}

// Stable, so lookup order is kept within each address family.
fn order_addresses(
    mut addrs: Vec<SocketAddr>,
    prefer_ipv6: bool,
) -> Vec<SocketAddr> {
    if prefer_ipv6 {
        addrs.sort_by_key(|a| !a.is_ipv6());
    }
    addrs
}
