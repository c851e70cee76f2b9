// Copyright 2020 Joyent, Inc.

use std::sync::Arc;

use slog::{info, o, Drain, Logger};

use crate::adapter::ObjectAdapterRegistry;
use crate::connection::Transport;
use crate::connection_factory::types::ConnectionFactoryOptions;
use crate::connection_factory::OutgoingConnectionFactory;
use crate::error::Error;
use crate::proxy::Proxy;
use crate::reference::Reference;
use crate::request_handler_factory::RequestHandlerFactory;
use crate::resolver::EndpointResolver;

/// Wires the outgoing connection factory, the object adapter registry and
/// the request handler factory together and hands out proxies.
///
/// Dropping a runtime destroys its connection factory without waiting for
/// the connections to close. Use `destroy` to wait.
pub struct Runtime {
    factory: Arc<OutgoingConnectionFactory>,
    adapters: Arc<ObjectAdapterRegistry>,
    handler_factory: Arc<RequestHandlerFactory>,
    log: Logger,
}

impl Runtime {
    pub fn new(
        options: ConnectionFactoryOptions,
        resolver: Arc<dyn EndpointResolver>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let log = options
            .log
            .clone()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        let factory = OutgoingConnectionFactory::new(options, resolver, transport);
        let adapters = Arc::new(ObjectAdapterRegistry::new(
            Arc::clone(&factory),
            log.new(o!("component" => "ObjectAdapterRegistry")),
        ));
        let handler_factory = RequestHandlerFactory::new(
            Arc::clone(&factory),
            Arc::clone(&adapters),
            log.new(o!("component" => "RequestHandlerFactory")),
        );

        info!(log, "runtime started");

        Runtime {
            factory,
            adapters,
            handler_factory,
            log,
        }
    }

    pub fn proxy(&self, reference: Reference) -> Arc<Proxy> {
        Proxy::new(reference, Arc::clone(&self.handler_factory))
    }

    /// Parse a stringified reference and create a proxy for it.
    pub fn string_to_proxy(&self, s: &str) -> Result<Arc<Proxy>, Error> {
        let reference = s.parse::<Reference>()?;
        Ok(self.proxy(reference))
    }

    pub fn adapters(&self) -> &Arc<ObjectAdapterRegistry> {
        &self.adapters
    }

    pub fn connection_factory(&self) -> &Arc<OutgoingConnectionFactory> {
        &self.factory
    }

    pub fn request_handler_factory(&self) -> &Arc<RequestHandlerFactory> {
        &self.handler_factory
    }

    /// Destroy the connection factory and wait until every connection it
    /// created has finished.
    pub fn destroy(&self) {
        info!(self.log, "destroying runtime");
        self.factory.destroy();
        self.factory.wait_until_finished();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.factory.destroy();
    }
}
