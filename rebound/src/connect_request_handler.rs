// Copyright 2020 Joyent, Inc.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use slog::{debug, o, trace, warn, Logger};

use crate::connection::Connection;
use crate::connection_factory::{
    shuffle, CreateConnectionCallback, OutgoingConnectionFactory,
};
use crate::endpoint::{Endpoint, EndpointSelection};
use crate::error::Error;
use crate::proxy::Proxy;
use crate::reference::Reference;
use crate::request::{AsyncStatus, Request};
use crate::request_handler_factory::RequestHandlerFactory;
use crate::request_handler::{
    same_handler, ConnectionRequestHandler, RequestHandler,
};

/// Where a connect request handler is in its lifecycle. `Initialized` and
/// `Failed` are terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandlerStatus {
    Unconnected,
    Connecting,
    Initialized,
    Failed,
}

impl fmt::Display for HandlerStatus {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HandlerStatus::Unconnected => fmt.write_str("unconnected"),
            HandlerStatus::Connecting => fmt.write_str("connecting"),
            HandlerStatus::Initialized => fmt.write_str("initialized"),
            HandlerStatus::Failed => fmt.write_str("failed"),
        }
    }
}

struct HandlerState {
    proxies: Vec<Weak<Proxy>>,
    connection: Option<Arc<dyn Connection>>,
    compress: bool,
    exception: Option<Error>,
    initialized: bool,
    // Set while queued requests are being flushed or failed. The queue and
    // the proxy list do not change while it is set.
    flushing: bool,
    connecting: bool,
    requests: VecDeque<Arc<Request>>,
    request_handler: Option<Arc<dyn RequestHandler>>,
}

/// Buffers the requests of a proxy until its connection is known.
///
/// The first `connect` starts one connection attempt through the outgoing
/// connection factory. Requests sent before the attempt completes are queued
/// and flushed in FIFO order once the connection is established, or failed in
/// FIFO order with the connection failure. After a successful flush, proxies
/// that adopted this handler are switched to a direct
/// `ConnectionRequestHandler` when connection caching is enabled.
pub struct ConnectRequestHandler {
    reference: Reference,
    factory: Arc<OutgoingConnectionFactory>,
    handler_factory: Weak<RequestHandlerFactory>,
    state: Mutex<HandlerState>,
    cond: Condvar,
    log: Logger,
}

impl ConnectRequestHandler {
    pub fn new(
        reference: Reference,
        factory: Arc<OutgoingConnectionFactory>,
        handler_factory: Weak<RequestHandlerFactory>,
        log: &Logger,
    ) -> Arc<Self> {
        let log = log.new(o!("reference" => reference.to_string()));
        Arc::new(ConnectRequestHandler {
            reference,
            factory,
            handler_factory,
            state: Mutex::new(HandlerState {
                proxies: Vec::new(),
                connection: None,
                compress: false,
                exception: None,
                initialized: false,
                flushing: false,
                connecting: false,
                requests: VecDeque::new(),
                request_handler: None,
            }),
            cond: Condvar::new(),
            log,
        })
    }

    fn state_lock(&self) -> MutexGuard<HandlerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the connection attempt if it has not been started yet and
    /// register `proxy` for a handler update once the connection is
    /// established. Returns the handler the proxy should use from now on:
    /// this handler, or the direct handler if the connection was already
    /// established and flushed.
    pub fn connect(self: Arc<Self>, proxy: Option<&Proxy>) -> Arc<dyn RequestHandler> {
        let start = {
            let mut state = self.state_lock();
            let start = !state.connecting;
            state.connecting = true;
            start
        };

        if start {
            Arc::clone(&self).start_connect();
        }

        let state = self.state_lock();
        if let Ok((mut state, initialized)) = self.wait_initialized(state) {
            if initialized {
                if let Some(handler) = &state.request_handler {
                    return Arc::clone(handler);
                }
            } else if let Some(proxy) = proxy {
                state.proxies.push(proxy.downgrade());
            }
        }
        self
    }

    fn start_connect(self: Arc<Self>) {
        let endpoints = self.reference.endpoints().to_vec();
        let selection = self.reference.endpoint_selection();

        debug!(self.log, "establishing connection");

        if self.reference.cache_connection() || endpoints.len() <= 1 {
            let factory = Arc::clone(&self.factory);
            factory.create(endpoints, false, selection, self);
        } else {
            SequentialConnect::start(
                Arc::clone(&self.factory),
                endpoints,
                selection,
                self.clone(),
                &self.log,
            );
        }
    }

    /// Block until the connection is established or has failed.
    pub fn wait_for_connection(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Arc<dyn Connection>, Error> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state_lock();
        loop {
            if let Some(e) = &state.exception {
                return Err(e.clone());
            }
            if state.initialized {
                if let Some(connection) = &state.connection {
                    return Ok(Arc::clone(connection));
                }
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::InvocationTimeout);
                    }
                    self.cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .cond
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    pub fn state(&self) -> HandlerStatus {
        let state = self.state_lock();
        if state.initialized {
            HandlerStatus::Initialized
        } else if state.exception.is_some() {
            HandlerStatus::Failed
        } else if state.connecting {
            HandlerStatus::Connecting
        } else {
            HandlerStatus::Unconnected
        }
    }

    /// The number of requests waiting for the connection.
    pub fn queued_requests(&self) -> usize {
        self.state_lock().requests.len()
    }

    // Wait out any flush in progress and report whether requests may go
    // straight to the connection. Fails with the connection failure if the
    // connection was never established.
    fn wait_initialized<'a>(
        &'a self,
        mut state: MutexGuard<'a, HandlerState>,
    ) -> Result<(MutexGuard<'a, HandlerState>, bool), Error> {
        if state.initialized {
            return Ok((state, true));
        }

        while state.flushing {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        if let Some(e) = &state.exception {
            // A connection that was established but failed while flushing
            // still takes requests; it reports its own failures.
            if state.connection.is_some() {
                return Ok((state, true));
            }
            return Err(e.clone());
        }

        let initialized = state.initialized;
        Ok((state, initialized))
    }

    fn flush_requests(&self) {
        let (connection, compress, requests) = {
            let mut state = self.state_lock();
            let connection = match &state.connection {
                Some(connection) => Arc::clone(connection),
                None => return,
            };
            state.flushing = true;
            let requests = std::mem::replace(&mut state.requests, VecDeque::new());
            (connection, state.compress, requests)
        };

        debug!(
            self.log,
            "connection established to {}, flushing {} requests",
            connection.connector(),
            requests.len()
        );

        // Requests that made it onto the connection are canceled through it
        // from now on.
        let forward: Arc<dyn RequestHandler> = Arc::new(ConnectionRequestHandler::new(
            self.reference.clone(),
            Arc::clone(&connection),
            compress,
        ));

        let mut exception = None;
        for request in requests {
            request.set_handler(&forward);
            match connection.send_async_request(&request, compress) {
                Ok(_) => (),
                Err(e) => {
                    warn!(
                        self.log,
                        "failed to send queued request {}: {}",
                        request.id(),
                        e
                    );
                    request.fail(e.clone());
                    exception = Some(e);
                }
            }
        }

        let mut direct = None;
        if self.reference.cache_connection() && exception.is_none() {
            let proxies = self.state_lock().proxies.clone();
            for proxy in proxies.iter().filter_map(Weak::upgrade) {
                proxy.update_request_handler(self, Some(Arc::clone(&forward)));
            }
            direct = Some(forward);
        }

        {
            let mut state = self.state_lock();
            state.request_handler = direct;
            state.initialized = exception.is_none();
            state.exception = exception;
            state.flushing = false;
            state.proxies.clear();
            self.cond.notify_all();
        }

        if let Some(handler_factory) = self.handler_factory.upgrade() {
            handler_factory.remove_request_handler(&self.reference, self);
        }
    }
}

impl CreateConnectionCallback for ConnectRequestHandler {
    fn set_connection(&self, connection: Arc<dyn Connection>, compress: bool) {
        {
            let mut state = self.state_lock();
            if state.connection.is_some() || state.exception.is_some() {
                warn!(self.log, "connection delivered to a settled handler");
                return;
            }
            state.connection = Some(connection);
            state.compress = compress;
        }

        self.flush_requests();
    }

    fn set_exception(&self, error: Error) {
        let requests = {
            let mut state = self.state_lock();
            if state.initialized || state.exception.is_some() {
                warn!(self.log, "failure delivered to a settled handler: {}", error);
                return;
            }
            state.exception = Some(error.clone());
            state.flushing = true;
            std::mem::replace(&mut state.requests, VecDeque::new())
        };

        // Deregister before notifying the requests so that a retry after a
        // failure notification obtains a fresh handler.
        if let Some(handler_factory) = self.handler_factory.upgrade() {
            handler_factory.remove_request_handler(&self.reference, self);
        }

        debug!(
            self.log,
            "connection failed, failing {} queued requests: {}",
            requests.len(),
            error
        );

        for request in requests {
            request.fail(error.clone());
        }

        let proxies = {
            let mut state = self.state_lock();
            state.flushing = false;
            self.cond.notify_all();
            std::mem::replace(&mut state.proxies, Vec::new())
        };

        for proxy in proxies.iter().filter_map(Weak::upgrade) {
            proxy.update_request_handler(self, None);
        }
    }
}

impl RequestHandler for ConnectRequestHandler {
    fn update(
        self: Arc<Self>,
        previous: &dyn RequestHandler,
        replacement: Option<Arc<dyn RequestHandler>>,
    ) -> Option<Arc<dyn RequestHandler>> {
        if same_handler(previous, &*self) {
            replacement
        } else {
            Some(self)
        }
    }

    fn send_async_request(
        &self,
        request: &Arc<Request>,
    ) -> Result<AsyncStatus, Error> {
        let (connection, compress) = {
            let state = self.state_lock();
            let (mut state, initialized) = self.wait_initialized(state)?;
            if !initialized {
                trace!(self.log, "queueing request {}", request.id());
                state.requests.push_back(Arc::clone(request));
                return Ok(AsyncStatus::Queued);
            }
            match &state.connection {
                Some(connection) => (Arc::clone(connection), state.compress),
                None => {
                    return Err(Error::ConnectionLost(String::from(
                        "no connection",
                    )))
                }
            }
        };

        connection.send_async_request(request, compress)
    }

    fn request_canceled(&self, request: &Request, error: Error) {
        let connection = {
            let state = self.state_lock();
            match self.wait_initialized(state) {
                Ok((mut state, false)) => {
                    let idx = state
                        .requests
                        .iter()
                        .position(|r| r.id() == request.id());
                    if let Some(idx) = idx {
                        let removed = state.requests.remove(idx);
                        drop(state);
                        trace!(self.log, "canceled queued request {}", request.id());
                        if let Some(removed) = removed {
                            removed.fail(error);
                        }
                        return;
                    }
                    None
                }
                Ok((state, true)) => state.connection.clone(),
                Err(_) => None,
            }
        };

        match connection {
            Some(connection) => connection.request_canceled(request, error),
            None => {
                request.fail(error);
            }
        }
    }

    fn reference(&self) -> &Reference {
        &self.reference
    }

    fn connection(&self) -> Result<Option<Arc<dyn Connection>>, Error> {
        let state = self.state_lock();
        match (&state.connection, &state.exception) {
            (Some(connection), _) => Ok(Some(Arc::clone(connection))),
            (None, Some(e)) => Err(e.clone()),
            (None, None) => Ok(None),
        }
    }
}

// Connects to the endpoints of a reference one at a time, for references
// that do not cache their connection. Each endpoint gets its own `create`
// call; the failure of the last endpoint is reported.
struct SequentialConnect {
    this: Weak<SequentialConnect>,
    factory: Arc<OutgoingConnectionFactory>,
    endpoints: Vec<Endpoint>,
    selection: EndpointSelection,
    next: AtomicUsize,
    callback: Arc<dyn CreateConnectionCallback>,
}

impl SequentialConnect {
    fn start(
        factory: Arc<OutgoingConnectionFactory>,
        mut endpoints: Vec<Endpoint>,
        selection: EndpointSelection,
        callback: Arc<dyn CreateConnectionCallback>,
        log: &Logger,
    ) {
        if selection == EndpointSelection::Random {
            shuffle(&mut endpoints, rand::thread_rng(), log);
        }

        let sequence = Arc::new_cyclic(|this| SequentialConnect {
            this: this.clone(),
            factory,
            endpoints,
            selection,
            next: AtomicUsize::new(0),
            callback,
        });
        sequence.attempt(0);
    }

    fn attempt(self: Arc<Self>, index: usize) {
        let endpoint = vec![self.endpoints[index].clone()];
        let has_more = index + 1 < self.endpoints.len();
        let factory = Arc::clone(&self.factory);
        let selection = self.selection;
        factory.create(endpoint, has_more, selection, self);
    }
}

impl CreateConnectionCallback for SequentialConnect {
    fn set_connection(&self, connection: Arc<dyn Connection>, compress: bool) {
        self.callback.set_connection(connection, compress);
    }

    fn set_exception(&self, error: Error) {
        let index = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        if index >= self.endpoints.len() || !error.is_retryable() {
            self.callback.set_exception(error);
            return;
        }

        match self.this.upgrade() {
            Some(this) => this.attempt(index),
            None => self.callback.set_exception(error),
        }
    }
}
