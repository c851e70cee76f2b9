// Copyright 2020 Joyent, Inc.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use slog::{debug, trace, Logger};

use crate::adapter::ObjectAdapterRegistry;
use crate::connect_request_handler::ConnectRequestHandler;
use crate::connection_factory::OutgoingConnectionFactory;
use crate::proxy::Proxy;
use crate::reference::Reference;
use crate::request_handler::{same_handler, CollocatedRequestHandler, RequestHandler};

/// Hands out request handlers to proxies.
///
/// References that cache their connection share one connect request handler
/// per reference while the connection is being established, so proxies for
/// the same reference coalesce onto a single attempt. The shared handler is
/// deregistered once its attempt settles.
pub struct RequestHandlerFactory {
    this: Weak<RequestHandlerFactory>,
    factory: Arc<OutgoingConnectionFactory>,
    adapters: Arc<ObjectAdapterRegistry>,
    handlers: Mutex<HashMap<Reference, Arc<ConnectRequestHandler>>>,
    log: Logger,
}

impl RequestHandlerFactory {
    pub fn new(
        factory: Arc<OutgoingConnectionFactory>,
        adapters: Arc<ObjectAdapterRegistry>,
        log: Logger,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| RequestHandlerFactory {
            this: this.clone(),
            factory,
            adapters,
            handlers: Mutex::new(HashMap::new()),
            log,
        })
    }

    fn handlers_lock(
        &self,
    ) -> MutexGuard<HashMap<Reference, Arc<ConnectRequestHandler>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Obtain the handler `proxy` should send its requests through and
    /// install it on the proxy.
    ///
    /// A collocated handler is used when the reference allows it and a
    /// registered adapter hosts the object. Otherwise the proxy gets the
    /// connect request handler registered for the reference, or a fresh one
    /// that starts a connection attempt. The returned handler may be the
    /// direct handler for an already established connection.
    pub fn get_request_handler(
        &self,
        reference: &Reference,
        proxy: &Proxy,
    ) -> Arc<dyn RequestHandler> {
        if reference.collocation_optimized() {
            if let Some(adapter) = self.adapters.find(reference) {
                debug!(
                    self.log,
                    "using collocated adapter {} for {}",
                    adapter.name(),
                    reference.identity()
                );
                let handler: Arc<dyn RequestHandler> = Arc::new(
                    CollocatedRequestHandler::new(reference.clone(), adapter),
                );
                return proxy.set_request_handler(handler);
            }
        }

        let handler = if reference.cache_connection() {
            let mut handlers = self.handlers_lock();
            match handlers.get(reference) {
                Some(handler) => {
                    trace!(
                        self.log,
                        "joining pending connection for {}",
                        reference.identity()
                    );
                    Arc::clone(handler)
                }
                None => {
                    let handler = self.new_handler(reference);
                    handlers.insert(reference.clone(), Arc::clone(&handler));
                    handler
                }
            }
        } else {
            self.new_handler(reference)
        };

        proxy.set_request_handler(handler.connect(Some(proxy)))
    }

    fn new_handler(&self, reference: &Reference) -> Arc<ConnectRequestHandler> {
        ConnectRequestHandler::new(
            reference.clone(),
            Arc::clone(&self.factory),
            self.this.clone(),
            &self.log,
        )
    }

    /// Deregister `handler` if it is still the handler registered for
    /// `reference`.
    pub fn remove_request_handler(
        &self,
        reference: &Reference,
        handler: &dyn RequestHandler,
    ) {
        if !reference.cache_connection() {
            return;
        }

        let mut handlers = self.handlers_lock();
        let registered = handlers
            .get(reference)
            .map(|h| same_handler(&**h, handler))
            .unwrap_or(false);
        if registered {
            handlers.remove(reference);
        }
    }

    /// The connect request handler currently registered for `reference`.
    pub fn registered_handler(
        &self,
        reference: &Reference,
    ) -> Option<Arc<ConnectRequestHandler>> {
        self.handlers_lock().get(reference).cloned()
    }

    pub fn connection_factory(&self) -> &Arc<OutgoingConnectionFactory> {
        &self.factory
    }
}
