// Copyright 2020 Joyent, Inc.

use crate::connector::Connector;
use crate::endpoint::Endpoint;
use crate::error::Error;

/// Instrumentation for a single connection establishment attempt.
///
/// `attach` is called when the attempt against a connector begins and
/// `detach` when it ends. A failed attempt calls `failed` before `detach`.
pub trait EstablishmentObserver: Send {
    fn attach(&self) {}
    fn detach(&self) {}
    fn failed(&self, _error: &Error) {}
}

/// Factory for establishment observers, supplied through the connection
/// factory options.
pub trait Observer: Send + Sync {
    fn connection_establishment(
        &self,
        endpoint: &Endpoint,
        connector: &Connector,
    ) -> Box<dyn EstablishmentObserver>;
}

/// The observer used when none is configured. All events are ignored.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

struct NoopEstablishment;

impl EstablishmentObserver for NoopEstablishment {}

impl Observer for NoopObserver {
    fn connection_establishment(
        &self,
        _endpoint: &Endpoint,
        _connector: &Connector,
    ) -> Box<dyn EstablishmentObserver> {
        Box::new(NoopEstablishment)
    }
}
