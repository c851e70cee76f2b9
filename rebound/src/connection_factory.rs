// Copyright 2020 Joyent, Inc.

pub mod connect_callback;
pub mod types;

use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::Duration;
use slog::{debug, info, o, trace, Drain, Logger};
use timer::Guard;

use crate::connection::{Connection, Transport};
use crate::connection_factory::connect_callback::ConnectCallback;
use crate::connection_factory::types::{
    ConnectionCount, ConnectionFactoryOptions, FactoryData, FactoryStats,
    Overrides, ProtectedData, ShuffleCollection,
};
use crate::connector::ConnectorInfo;
use crate::endpoint::{Endpoint, EndpointSelection};
use crate::error::Error;
use crate::observer::{NoopObserver, Observer};
use crate::resolver::EndpointResolver;

// Connection check interval in seconds
const DEFAULT_CONNECTION_CHECK_INTERVAL: u64 = 30;

/// Receives the outcome of `OutgoingConnectionFactory::create`.
///
/// Exactly one of the two methods is invoked, exactly once, on whatever
/// thread completes the request.
pub trait CreateConnectionCallback: Send + Sync {
    fn set_connection(&self, connection: Arc<dyn Connection>, compress: bool);
    fn set_exception(&self, error: Error);
}

// The answer to a connection lookup made on behalf of a connect callback.
pub(crate) enum Lookup {
    // A usable pooled connection and the compression flag to report.
    Found(Arc<dyn Connection>, bool),
    // Another callback owns an attempt to one of the connectors. The
    // factory resumes this callback when that attempt finishes.
    Waiting,
    // The callback must establish the connection itself.
    Owner,
}

/// The pool of outgoing connections and the state machine that fills it.
///
/// The factory deduplicates concurrent connection attempts to the same
/// connector: the first caller owns the real attempt and later callers wait
/// on its outcome. Connections join the pool only once their handshake has
/// succeeded and are then reused by any request whose endpoints resolve to
/// the same connector.
///
/// All bookkeeping is guarded by a single mutex. Resolution, handshakes and
/// caller notifications all happen outside of it.
pub struct OutgoingConnectionFactory {
    this: Weak<OutgoingConnectionFactory>,
    protected_data: ProtectedData,
    resolver: Arc<dyn EndpointResolver>,
    transport: Arc<dyn Transport>,
    overrides: Overrides,
    observer: Arc<dyn Observer>,
    log: Logger,
    connection_check: Mutex<Option<(timer::Timer, Guard)>>,
}

impl OutgoingConnectionFactory {
    pub fn new(
        cfo: ConnectionFactoryOptions,
        resolver: Arc<dyn EndpointResolver>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let logger = cfo
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        let observer = cfo
            .observer
            .unwrap_or_else(|| Arc::new(NoopObserver) as Arc<dyn Observer>);

        let overrides = cfo.overrides;

        let protected_data = ProtectedData::new(FactoryData::new());

        let connection_check_interval = cfo
            .connection_check_interval
            .unwrap_or(DEFAULT_CONNECTION_CHECK_INTERVAL);

        let connection_check_timer = timer::Timer::new();

        let connection_check_timer_guard = start_connection_check(
            &connection_check_timer,
            connection_check_interval,
            protected_data.clone(),
            logger.clone(),
        );

        Arc::new_cyclic(|this| OutgoingConnectionFactory {
            this: this.clone(),
            protected_data,
            resolver,
            transport,
            overrides,
            observer,
            log: logger,
            connection_check: Mutex::new(Some((
                connection_check_timer,
                connection_check_timer_guard,
            ))),
        })
    }

    /// Obtain a connection to one of `endpoints`.
    ///
    /// An existing connection to any of the endpoints is returned right
    /// away. Otherwise the endpoints are resolved and their connectors are
    /// attempted in order until one succeeds. With
    /// `EndpointSelection::Random` the endpoint order is shuffled once for
    /// this call; the connector order of each endpoint is kept. `has_more`
    /// signals that further requests are queued behind this one and only
    /// affects logging.
    ///
    /// The outcome is delivered to `callback`, possibly before this function
    /// returns. When every connector fails, the failure of the last attempt
    /// is reported.
    pub fn create(
        &self,
        endpoints: Vec<Endpoint>,
        has_more: bool,
        selection: EndpointSelection,
        callback: Arc<dyn CreateConnectionCallback>,
    ) {
        if endpoints.is_empty() {
            callback.set_exception(Error::NoEndpoints);
            return;
        }

        let mut endpoints: Vec<Endpoint> = endpoints
            .into_iter()
            .map(|e| self.overrides.apply(e))
            .collect();

        match self.find_connection_by_endpoints(&endpoints) {
            Ok(Some((connection, compress))) => {
                trace!(
                    self.log,
                    "reusing connection to {}",
                    connection.connector()
                );
                callback.set_connection(connection, compress);
                return;
            }
            Ok(None) => (),
            Err(e) => {
                callback.set_exception(e);
                return;
            }
        }

        if selection == EndpointSelection::Random {
            shuffle(&mut endpoints, rand::thread_rng(), &self.log);
        }

        let factory = match self.this.upgrade() {
            Some(factory) => factory,
            None => {
                callback.set_exception(Error::FactoryDestroyed);
                return;
            }
        };

        let cb = ConnectCallback::new(
            factory,
            endpoints,
            has_more,
            selection,
            callback,
            self.log.clone(),
        );
        cb.get_connectors();
    }

    /// Mark the factory destroyed and initiate the close of every pooled
    /// connection and of every connection whose handshake is in flight.
    /// Outstanding and future requests fail with `Error::FactoryDestroyed`.
    /// Does not block and may be called more than once.
    pub fn destroy(&self) {
        let connections = {
            let mut factory_data = self.protected_data.factory_data_lock();
            if factory_data.destroyed {
                return;
            }
            factory_data.destroyed = true;

            let mut connections = factory_data.all_connections();
            connections.extend(factory_data.starting.iter().cloned());
            self.protected_data.condvar_notify();
            connections
        };

        if let Some((timer, guard)) = self
            .connection_check
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            drop(guard);
            drop(timer);
        }

        info!(
            self.log,
            "destroying connection factory, closing {} connections",
            connections.len()
        );

        for connection in connections {
            connection.close(Error::FactoryDestroyed);
        }
    }

    /// Block until the factory has been destroyed, every pending request
    /// has been answered and every connection has finished closing.
    pub fn wait_until_finished(&self) {
        let connections = {
            let mut factory_data = self.protected_data.factory_data_lock();

            // The pool is only complete once nothing is pending or starting.
            while !factory_data.destroyed
                || !factory_data.pending.is_empty()
                || factory_data.pending_connect_count > 0.into()
                || !factory_data.starting.is_empty()
            {
                factory_data =
                    self.protected_data.condvar_wait(factory_data, None).0;
            }

            factory_data.all_connections()
        };

        debug!(
            self.log,
            "waiting for {} connections to finish",
            connections.len()
        );

        for connection in connections {
            connection.wait_until_finished();
        }

        let mut factory_data = self.protected_data.factory_data_lock();
        factory_data.connections.clear();
        factory_data.connections_by_endpoint.clear();
    }

    /// Detach the named object adapter from every pooled connection that
    /// dispatches incoming requests through it.
    pub fn remove_adapter(&self, adapter: &str) {
        let factory_data = self.protected_data.factory_data_lock();
        if factory_data.destroyed {
            return;
        }

        for connection in factory_data.all_connections() {
            if connection.adapter().as_ref().map(String::as_str) == Some(adapter)
            {
                debug!(
                    self.log,
                    "detaching adapter {} from connection to {}",
                    adapter,
                    connection.connector()
                );
                connection.set_adapter(None);
            }
        }
    }

    /// Ask every pooled connection to refresh its instrumentation.
    pub fn update_connection_observers(&self) {
        let connections = self.protected_data.factory_data_lock().all_connections();
        for connection in connections {
            connection.update_observer();
        }
    }

    pub fn get_stats(&self) -> FactoryStats {
        self.protected_data.factory_data_lock().stats()
    }

    pub fn is_destroyed(&self) -> bool {
        self.protected_data.factory_data_lock().destroyed
    }

    pub(crate) fn resolver(&self) -> Arc<dyn EndpointResolver> {
        Arc::clone(&self.resolver)
    }

    pub(crate) fn observer(&self) -> &Arc<dyn Observer> {
        &self.observer
    }

    // Exact endpoint match against the pool.
    fn find_connection_by_endpoints(
        &self,
        endpoints: &[Endpoint],
    ) -> Result<Option<(Arc<dyn Connection>, bool)>, Error> {
        let factory_data = self.protected_data.factory_data_lock();
        if factory_data.destroyed {
            return Err(Error::FactoryDestroyed);
        }

        for endpoint in endpoints {
            if let Some(connections) =
                factory_data.connections_by_endpoint.get(endpoint)
            {
                if let Some(connection) =
                    connections.iter().find(|c| c.is_active())
                {
                    return Ok(Some((
                        Arc::clone(connection),
                        self.overrides.compress(endpoint),
                    )));
                }
            }
        }
        Ok(None)
    }

    pub(crate) fn get_connection(
        &self,
        cb: &Arc<ConnectCallback>,
    ) -> Result<Lookup, Error> {
        let mut factory_data = self.protected_data.factory_data_lock();
        if factory_data.destroyed {
            return Err(Error::FactoryDestroyed);
        }

        let reaped = factory_data.reap_closed();
        if reaped > 0 {
            debug!(self.log, "reaped {} closed connections", reaped);
        }

        let connectors = cb.connectors();

        // Per-connector match. Connectors with an attempt in flight are
        // skipped; they are handled by joining the pending attempt.
        for info in &connectors {
            if factory_data.pending.contains_key(&info.connector) {
                continue;
            }
            if let Some(connections) = factory_data.connections.get(&info.connector)
            {
                if let Some(connection) =
                    connections.iter().find(|c| c.is_active())
                {
                    return Ok(Lookup::Found(
                        Arc::clone(connection),
                        self.overrides.compress(&info.endpoint),
                    ));
                }
            }
        }

        if add_to_pending(&mut factory_data, cb, &connectors) {
            Ok(Lookup::Waiting)
        } else {
            Ok(Lookup::Owner)
        }
    }

    pub(crate) fn create_connection(
        &self,
        info: &ConnectorInfo,
    ) -> Result<Arc<dyn Connection>, Error> {
        if self.is_destroyed() {
            return Err(Error::FactoryDestroyed);
        }

        let connection = self
            .transport
            .create_connection(&info.connector, &info.endpoint)?;

        {
            let mut factory_data = self.protected_data.factory_data_lock();
            if !factory_data.destroyed {
                factory_data.starting.push(Arc::clone(&connection));
                return Ok(connection);
            }
        }

        connection.close(Error::FactoryDestroyed);
        Err(Error::FactoryDestroyed)
    }

    pub(crate) fn remove_starting(&self, connection: &Arc<dyn Connection>) {
        let mut factory_data = self.protected_data.factory_data_lock();
        factory_data.remove_starting(connection);
        self.protected_data.condvar_notify();
    }

    // The attempt owned by `cb` produced `connection` through the connector
    // of `info`. Pool the connection and resume every waiter.
    pub(crate) fn finish_get_connection(
        &self,
        cb: &Arc<ConnectCallback>,
        info: &ConnectorInfo,
        connection: Arc<dyn Connection>,
    ) {
        let mut connection_callbacks = vec![Arc::clone(cb)];
        let mut callbacks: Vec<Arc<ConnectCallback>> = Vec::new();

        {
            let mut factory_data = self.protected_data.factory_data_lock();
            factory_data.remove_starting(&connection);

            if factory_data.destroyed {
                drop(factory_data);
                self.protected_data.condvar_notify();
                debug!(
                    self.log,
                    "connection to {} established after destroy",
                    info.connector
                );
                connection.close(Error::FactoryDestroyed);
                self.finish_get_connection_failed(cb, Error::FactoryDestroyed);
                return;
            }

            let connectors = cb.connectors();

            // Every endpoint whose resolution included the connector.
            let endpoints: Vec<Endpoint> = connectors
                .iter()
                .filter(|c| c.connector == info.connector)
                .map(|c| c.endpoint.clone())
                .collect();
            factory_data.insert_connection(&info.connector, &endpoints, &connection);

            for c in &connectors {
                if let Some(waiters) = factory_data.pending.remove(&c.connector) {
                    for waiter in waiters {
                        if contains(&connection_callbacks, &waiter)
                            || contains(&callbacks, &waiter)
                        {
                            continue;
                        }
                        if waiter.has_connector(info) {
                            connection_callbacks.push(waiter);
                        } else {
                            callbacks.push(waiter);
                        }
                    }
                }
            }

            for waiter in connection_callbacks.iter().chain(callbacks.iter()) {
                remove_from_pending(&mut factory_data, waiter);
            }

            self.protected_data.condvar_notify();
        }

        info!(
            self.log,
            "established {} connection to {}",
            connection.connection_type(),
            info.connector
        );

        let compress = self.overrides.compress(&info.endpoint);

        for waiter in callbacks {
            waiter.get_connection();
        }
        for waiter in connection_callbacks {
            waiter.set_connection(Arc::clone(&connection), compress);
        }
    }

    // The attempt owned by `cb` failed for all of its connectors. Waiters
    // with no connector left fail with `error`, the others try again.
    pub(crate) fn finish_get_connection_failed(
        &self,
        cb: &Arc<ConnectCallback>,
        error: Error,
    ) {
        let mut failed_callbacks = vec![Arc::clone(cb)];
        let mut callbacks: Vec<Arc<ConnectCallback>> = Vec::new();

        {
            let mut factory_data = self.protected_data.factory_data_lock();
            let connectors = cb.connectors();

            for c in &connectors {
                if let Some(waiters) = factory_data.pending.remove(&c.connector) {
                    for waiter in waiters {
                        if contains(&failed_callbacks, &waiter)
                            || contains(&callbacks, &waiter)
                        {
                            continue;
                        }
                        if waiter.remove_connectors(&connectors) {
                            failed_callbacks.push(waiter);
                        } else {
                            callbacks.push(waiter);
                        }
                    }
                }
            }

            for waiter in &callbacks {
                remove_from_pending(&mut factory_data, waiter);
            }

            self.protected_data.condvar_notify();
        }

        for waiter in callbacks {
            waiter.get_connection();
        }
        for waiter in failed_callbacks {
            waiter.set_exception(error.clone());
        }
    }

    pub(crate) fn inc_pending_connect_count(&self) -> Result<(), Error> {
        let mut factory_data = self.protected_data.factory_data_lock();
        if factory_data.destroyed {
            return Err(Error::FactoryDestroyed);
        }
        factory_data.pending_connect_count += ConnectionCount::from(1);
        Ok(())
    }

    pub(crate) fn dec_pending_connect_count(&self) {
        let mut factory_data = self.protected_data.factory_data_lock();
        if factory_data.pending_connect_count > 0.into() {
            factory_data.pending_connect_count -= ConnectionCount::from(1);
        }
        if factory_data.pending_connect_count == 0.into() {
            self.protected_data.condvar_notify();
        }
    }

    pub(crate) fn handle_connection_exception(&self, error: &Error, has_more: bool) {
        if has_more {
            debug!(
                self.log,
                "connection to endpoint failed, trying next endpoint: {}", error
            );
        } else {
            debug!(
                self.log,
                "connection to endpoint failed and no more endpoints to try: {}",
                error
            );
        }
    }

    pub(crate) fn handle_resolve_exception(
        &self,
        endpoint: &Endpoint,
        error: &Error,
        has_more: bool,
    ) {
        if has_more {
            debug!(
                self.log,
                "couldn't resolve endpoint host, trying next endpoint";
                "endpoint" => %endpoint, "error" => %error
            );
        } else {
            debug!(
                self.log,
                "couldn't resolve endpoint host and no more endpoints to try";
                "endpoint" => %endpoint, "error" => %error
            );
        }
    }
}

// Register `cb` as a waiter on every pending connector it shares with an
// attempt in flight. Returns false when there is no such attempt, in which
// case empty pending entries are added for all of `cb`'s connectors and the
// caller owns the attempt.
fn add_to_pending(
    factory_data: &mut FactoryData,
    cb: &Arc<ConnectCallback>,
    connectors: &[ConnectorInfo],
) -> bool {
    let mut found = false;
    for info in connectors {
        if let Some(waiters) = factory_data.pending.get_mut(&info.connector) {
            found = true;
            if !contains(waiters, cb) {
                waiters.push(Arc::clone(cb));
            }
        }
    }

    if found {
        return true;
    }

    for info in connectors {
        factory_data
            .pending
            .entry(info.connector.clone())
            .or_insert_with(Vec::new);
    }
    false
}

fn remove_from_pending(factory_data: &mut FactoryData, cb: &Arc<ConnectCallback>) {
    for info in cb.connectors() {
        if let Some(waiters) = factory_data.pending.get_mut(&info.connector) {
            waiters.retain(|w| !Arc::ptr_eq(w, cb));
        }
    }
}

fn contains(callbacks: &[Arc<ConnectCallback>], cb: &Arc<ConnectCallback>) -> bool {
    callbacks.iter().any(|c| Arc::ptr_eq(c, cb))
}

/// Start a thread to run periodic pruning of closed connections
fn start_connection_check(
    timer: &timer::Timer,
    conn_check_interval: u64,
    protected_data: ProtectedData,
    log: Logger,
) -> Guard {
    debug!(
        log,
        "starting connection check task, interval {} seconds",
        conn_check_interval
    );
    timer.schedule_repeating(
        Duration::seconds(conn_check_interval as i64),
        move || check_pool_connections(protected_data.clone(), log.clone()),
    )
}

fn check_pool_connections(protected_data: ProtectedData, log: Logger) {
    let mut factory_data = protected_data.factory_data_lock();
    if factory_data.destroyed {
        return;
    }

    let removed = factory_data.reap_closed();
    if removed > 0 {
        debug!(log, "Removed {} closed connections from the pool", removed);
    }
}

/// Fisher-Yates shuffle
pub(crate) fn shuffle<T, R>(items: &mut T, mut rng: R, log: &Logger)
where
    T: ShuffleCollection,
    R: rand::Rng,
{
    let mut i = items.len();
    while i > 1 {
        i -= 1;
        let new_idx = rng.gen_range(0, i + 1);
        trace!(log, "randomization puts item at idx {} to idx {}", i, new_idx);
        items.swap(i, new_idx);
    }
}
