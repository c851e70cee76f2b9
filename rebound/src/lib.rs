//
// Copyright 2020 Joyent, Inc.
//

//! Outgoing connection establishment and request dispatch
//!
//! Rebound turns an object reference into a live, pooled network connection
//! and sends requests over it. Use of rebound requires an implementation of
//! the [`EndpointResolver`] trait, which turns symbolic endpoints into
//! connectors, and an implementation of the [`Transport`] trait, which
//! creates [`Connection`]s to those connectors.
//!
//! The [`OutgoingConnectionFactory`] owns the connection pool. Concurrent
//! requests for the same connector share one connection attempt, failed
//! attempts move on to the next connector, and established connections are
//! reused. Proxies send requests through request handlers; a
//! [`ConnectRequestHandler`] queues requests while the connection is being
//! established and flushes them in order once it is.
//!
//! [`EndpointResolver`]: resolver/trait.EndpointResolver.html
//! [`Transport`]: connection/trait.Transport.html
//! [`Connection`]: connection/trait.Connection.html
//! [`OutgoingConnectionFactory`]: connection_factory/struct.OutgoingConnectionFactory.html
//! [`ConnectRequestHandler`]: connect_request_handler/struct.ConnectRequestHandler.html
//!
//! # Example
//!
//! Use a hypothetical `Transport` to create a runtime and send a request.
//!
//! ```rust,ignore
//! use std::sync::{Arc, Mutex};
//!
//! use slog::{Drain, Logger, o};
//!
//! use rebound::connection_factory::types::ConnectionFactoryOptions;
//! use rebound::request::Request;
//! use rebound::resolver::{SystemResolver, SystemResolverOptions};
//! use rebound::runtime::Runtime;
//!
//! fn main() {
//!     let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
//!     let log = Logger::root(
//!         Mutex::new(
//!             slog_term::FullFormat::new(plain).build()
//!         ).fuse(),
//!         o!("build-id" => "0.1.0")
//!     );
//!
//!     let resolver = Arc::new(SystemResolver::new(SystemResolverOptions {
//!         log: Some(log.clone()),
//!         ..Default::default()
//!     }));
//!
//!     let options = ConnectionFactoryOptions {
//!         log: Some(log.clone()),
//!         ..Default::default()
//!     };
//!
//!     let runtime = Runtime::new(options, resolver, Arc::new(MyTransport::new()));
//!
//!     let proxy = runtime
//!         .string_to_proxy("hello:tcp -h localhost -p 10000")
//!         .unwrap();
//!
//!     let request = Request::new("sayHello", Vec::new());
//!     let reply = proxy.invoke_sync(&request, None);
//!
//!     runtime.destroy();
//! }
//! ```

#![allow(missing_docs)]

pub mod adapter;
pub mod connect_request_handler;
pub mod connection;
pub mod connection_factory;
pub mod connector;
pub mod endpoint;
pub mod error;
pub mod observer;
pub mod proxy;
pub mod reference;
pub mod request;
pub mod request_handler;
pub mod request_handler_factory;
pub mod resolver;
pub mod runtime;
