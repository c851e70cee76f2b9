// Copyright 2020 Joyent, Inc.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use slog::{info, Logger};

use crate::connection_factory::OutgoingConnectionFactory;
use crate::error::Error;
use crate::reference::Reference;
use crate::request::Request;

/// A local object adapter that can serve requests in process.
pub trait ObjectAdapter: Send + Sync {
    fn name(&self) -> &str;
    /// Whether the object named by `reference` is hosted by this adapter.
    fn is_local(&self, reference: &Reference) -> bool;
    /// Serve a request addressed to `identity` and return the reply.
    fn dispatch(&self, identity: &str, request: &Request) -> Result<Vec<u8>, Error>;
}

/// The set of object adapters registered with a runtime. Used to find a
/// collocated adapter for a reference.
pub struct ObjectAdapterRegistry {
    adapters: Mutex<Vec<Arc<dyn ObjectAdapter>>>,
    factory: Arc<OutgoingConnectionFactory>,
    log: Logger,
}

impl ObjectAdapterRegistry {
    pub fn new(factory: Arc<OutgoingConnectionFactory>, log: Logger) -> Self {
        ObjectAdapterRegistry {
            adapters: Mutex::new(Vec::new()),
            factory,
            log,
        }
    }

    fn adapters_lock(&self) -> MutexGuard<Vec<Arc<dyn ObjectAdapter>>> {
        self.adapters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, adapter: Arc<dyn ObjectAdapter>) -> Result<(), Error> {
        let mut adapters = self.adapters_lock();
        if adapters.iter().any(|a| a.name() == adapter.name()) {
            return Err(Error::AdapterAlreadyRegistered(String::from(
                adapter.name(),
            )));
        }
        info!(self.log, "registered object adapter {}", adapter.name());
        adapters.push(adapter);
        Ok(())
    }

    /// Unregister an adapter and detach it from the pooled connections of
    /// the connection factory.
    pub fn remove(&self, name: &str) -> Option<Arc<dyn ObjectAdapter>> {
        let removed = {
            let mut adapters = self.adapters_lock();
            let idx = adapters.iter().position(|a| a.name() == name)?;
            adapters.remove(idx)
        };

        info!(self.log, "removed object adapter {}", name);
        self.factory.remove_adapter(name);
        Some(removed)
    }

    /// The first adapter hosting the object named by `reference`.
    pub fn find(&self, reference: &Reference) -> Option<Arc<dyn ObjectAdapter>> {
        self.adapters_lock()
            .iter()
            .find(|a| a.is_local(reference))
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters_lock()
            .iter()
            .map(|a| String::from(a.name()))
            .collect()
    }
}
