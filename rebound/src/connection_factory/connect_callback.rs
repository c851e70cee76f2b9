// Copyright 2020 Joyent, Inc.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use slog::{debug, trace, Logger};

use crate::connection::Connection;
use crate::connection_factory::{
    CreateConnectionCallback, Lookup, OutgoingConnectionFactory,
};
use crate::connector::{Connector, ConnectorInfo};
use crate::endpoint::{Endpoint, EndpointSelection};
use crate::error::Error;
use crate::observer::EstablishmentObserver;

struct CallbackState {
    // Index of the endpoint currently being resolved.
    endpoint_index: usize,
    // Connectors of every resolved endpoint, in endpoint order.
    connectors: Vec<ConnectorInfo>,
    // Index of the connector currently being attempted.
    connector_index: usize,
    observer: Option<Box<dyn EstablishmentObserver>>,
}

/// The state of one `create` request as it moves through resolution,
/// connection lookup, and connection establishment.
///
/// Each step is a discrete event method. A callback either owns the
/// connection attempt for its connectors or waits on the attempt of another
/// callback that got there first, in which case the factory resumes it once
/// that attempt finishes.
///
/// Lock order is the factory lock, then the callback's state lock. The state
/// lock is never held while calling into the factory.
pub struct ConnectCallback {
    factory: Arc<OutgoingConnectionFactory>,
    callback: Arc<dyn CreateConnectionCallback>,
    endpoints: Vec<Endpoint>,
    has_more: bool,
    selection: EndpointSelection,
    state: Mutex<CallbackState>,
    notified: AtomicBool,
    log: Logger,
}

impl ConnectCallback {
    pub(crate) fn new(
        factory: Arc<OutgoingConnectionFactory>,
        endpoints: Vec<Endpoint>,
        has_more: bool,
        selection: EndpointSelection,
        callback: Arc<dyn CreateConnectionCallback>,
        log: Logger,
    ) -> Arc<Self> {
        Arc::new(ConnectCallback {
            factory,
            callback,
            endpoints,
            has_more,
            selection,
            state: Mutex::new(CallbackState {
                endpoint_index: 0,
                connectors: Vec::new(),
                connector_index: 0,
                observer: None,
            }),
            notified: AtomicBool::new(false),
            log,
        })
    }

    fn state_lock(&self) -> MutexGuard<CallbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the request with the factory and start resolving the first
    /// endpoint.
    pub(crate) fn get_connectors(self: Arc<Self>) {
        if let Err(e) = self.factory.inc_pending_connect_count() {
            if !self.notified.swap(true, Ordering::SeqCst) {
                self.callback.set_exception(e);
            }
            return;
        }
        self.next_endpoint();
    }

    fn next_endpoint(self: Arc<Self>) {
        let endpoint = {
            let state = self.state_lock();
            self.endpoints[state.endpoint_index].clone()
        };

        trace!(self.log, "resolving endpoint {}", endpoint);

        let resolver = self.factory.resolver();
        let described = endpoint.to_string();
        resolver.resolve(
            &endpoint,
            self.selection,
            Box::new(move |result| match result {
                Ok(ref connectors) if connectors.is_empty() => {
                    self.resolve_failed(Error::ResolutionFailure(format!(
                        "no connectors for {}",
                        described
                    )))
                }
                Ok(connectors) => self.connectors_resolved(connectors),
                Err(e) => self.resolve_failed(e),
            }),
        );
    }

    fn connectors_resolved(self: Arc<Self>, connectors: Vec<Connector>) {
        let more_endpoints = {
            let mut state = self.state_lock();
            let endpoint = &self.endpoints[state.endpoint_index];
            let infos: Vec<ConnectorInfo> = connectors
                .into_iter()
                .map(|c| ConnectorInfo::new(c, endpoint.clone()))
                .collect();
            state.connectors.extend(infos);
            state.endpoint_index += 1;
            state.endpoint_index < self.endpoints.len()
        };

        if more_endpoints {
            self.next_endpoint();
        } else {
            self.get_connection();
        }
    }

    fn resolve_failed(self: Arc<Self>, error: Error) {
        let (endpoint, more_endpoints, have_connectors) = {
            let mut state = self.state_lock();
            let endpoint = self.endpoints[state.endpoint_index].clone();
            state.endpoint_index += 1;
            (
                endpoint,
                state.endpoint_index < self.endpoints.len(),
                !state.connectors.is_empty(),
            )
        };

        self.factory.handle_resolve_exception(
            &endpoint,
            &error,
            self.has_more || more_endpoints,
        );

        if more_endpoints {
            self.next_endpoint();
        } else if have_connectors {
            self.get_connection();
        } else {
            self.set_exception(error);
        }
    }

    /// Look for a usable connection, or join or take ownership of a pending
    /// attempt. Also used by the factory to resume a waiting callback.
    pub(crate) fn get_connection(self: Arc<Self>) {
        match self.factory.get_connection(&self) {
            Ok(Lookup::Found(connection, compress)) => {
                self.set_connection(connection, compress)
            }
            Ok(Lookup::Waiting) => {
                trace!(self.log, "waiting on a pending connection attempt")
            }
            Ok(Lookup::Owner) => self.next_connector(),
            Err(e) => self.set_exception(e),
        }
    }

    fn next_connector(self: Arc<Self>) {
        loop {
            let info = {
                let mut state = self.state_lock();
                let info = state.connectors[state.connector_index].clone();
                let observer = self
                    .factory
                    .observer()
                    .connection_establishment(&info.endpoint, &info.connector);
                observer.attach();
                state.observer = Some(observer);
                info
            };

            debug!(
                self.log,
                "trying to establish {} connection to {}",
                info.endpoint.protocol,
                info.connector
            );

            match self.factory.create_connection(&info) {
                Ok(connection) => {
                    let cb = Arc::clone(&self);
                    let started = Arc::clone(&connection);
                    connection.start(Box::new(move |result| match result {
                        Ok(()) => cb.connection_start_completed(started),
                        Err(e) => cb.connection_start_failed(started, e),
                    }));
                    return;
                }
                Err(e) => {
                    debug!(
                        self.log,
                        "failed to establish {} connection to {}: {}",
                        info.endpoint.protocol,
                        info.connector,
                        e
                    );
                    if !Arc::clone(&self).connection_start_failed_impl(e) {
                        return;
                    }
                }
            }
        }
    }

    fn connection_start_completed(self: Arc<Self>, connection: Arc<dyn Connection>) {
        let info = {
            let mut state = self.state_lock();
            if let Some(observer) = state.observer.take() {
                observer.detach();
            }
            state.connectors[state.connector_index].clone()
        };

        connection.activate();
        self.factory.finish_get_connection(&self, &info, connection);
    }

    fn connection_start_failed(
        self: Arc<Self>,
        connection: Arc<dyn Connection>,
        error: Error,
    ) {
        self.factory.remove_starting(&connection);
        if Arc::clone(&self).connection_start_failed_impl(error) {
            self.next_connector();
        }
    }

    // Returns true if there is another connector to try.
    fn connection_start_failed_impl(self: Arc<Self>, error: Error) -> bool {
        let more_connectors = {
            let mut state = self.state_lock();
            if let Some(observer) = state.observer.take() {
                observer.failed(&error);
                observer.detach();
            }
            state.connector_index + 1 < state.connectors.len()
        };

        self.factory
            .handle_connection_exception(&error, self.has_more || more_connectors);

        match error {
            Error::FactoryDestroyed => {
                self.factory.finish_get_connection_failed(&self, error);
                false
            }
            _ if more_connectors => {
                self.state_lock().connector_index += 1;
                true
            }
            _ => {
                self.factory.finish_get_connection_failed(&self, error);
                false
            }
        }
    }

    /// Deliver a connection to the caller. Only the first notification is
    /// delivered.
    pub(crate) fn set_connection(
        &self,
        connection: Arc<dyn Connection>,
        compress: bool,
    ) {
        if self.notified.swap(true, Ordering::SeqCst) {
            return;
        }
        self.callback.set_connection(connection, compress);
        self.factory.dec_pending_connect_count();
    }

    /// Deliver a terminal failure to the caller. Only the first notification
    /// is delivered.
    pub(crate) fn set_exception(&self, error: Error) {
        if self.notified.swap(true, Ordering::SeqCst) {
            return;
        }
        self.callback.set_exception(error);
        self.factory.dec_pending_connect_count();
    }

    pub(crate) fn connectors(&self) -> Vec<ConnectorInfo> {
        self.state_lock().connectors.clone()
    }

    pub(crate) fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub(crate) fn has_connector(&self, info: &ConnectorInfo) -> bool {
        self.state_lock().connectors.iter().any(|c| c == info)
    }

    // Drop the connectors of a failed attempt. Returns true if no connector
    // is left to try.
    pub(crate) fn remove_connectors(&self, failed: &[ConnectorInfo]) -> bool {
        let mut state = self.state_lock();
        state.connectors.retain(|c| !failed.contains(c));
        state.connector_index = 0;
        state.connectors.is_empty()
    }
}
