// Copyright 2020 Joyent, Inc.

use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use slog::{error, info, o, Drain, Logger};

use rebound::connection::Connection;
use rebound::connection_factory::types::ConnectionFactoryOptions;
use rebound::request::Request;
use rebound::resolver::{SystemResolver, SystemResolverOptions};
use rebound::runtime::Runtime;
use rebound_tcp_stream_connection::TcpTransport;

fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let reference = env::args()
        .nth(1)
        .unwrap_or_else(|| String::from("hello:tcp -h localhost -p 10000 -t 2000"));

    let resolver = Arc::new(SystemResolver::new(SystemResolverOptions {
        log: Some(log.clone()),
        ..Default::default()
    }));

    let runtime = Runtime::new(
        ConnectionFactoryOptions {
            log: Some(log.clone()),
            ..Default::default()
        },
        resolver,
        Arc::new(TcpTransport::new(Some(log.clone()))),
    );

    let proxy = match runtime.string_to_proxy(&reference) {
        Ok(proxy) => proxy,
        Err(e) => {
            error!(log, "invalid reference: {}", e);
            return;
        }
    };

    let request = Request::new("ping", b"ping\n".to_vec());
    match proxy.invoke_sync(&request, Some(Duration::from_secs(5))) {
        Ok(_) => {
            if let Ok(Some(connection)) = proxy.connection() {
                info!(log, "request sent"; "remote" => ?connection.info().remote_address);
            }
        }
        Err(e) => error!(log, "request failed: {}", e),
    }

    info!(log, "factory stats"; "stats" => ?runtime.connection_factory().get_stats());
    runtime.destroy();
}
