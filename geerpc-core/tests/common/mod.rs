// Each integration test file is compiled as its own binary crate with its
// own copy of this module, so helpers used by one binary but not another
// trigger false "dead code" warnings. Allow dead_code to silence them.
#![allow(dead_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use geerpc_core::{Options, Server, Service};

/// Argument record used by the `Foo` test service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Args {
    pub num1: i64,
    pub num2: i64,
}

/// The `Foo` service: `Sum` adds, `Sleep` sleeps `num1` seconds first.
pub fn foo_service() -> Service {
    Service::builder("Foo")
        .method("Sum", |args: Args| async move {
            Ok::<_, String>(args.num1 + args.num2)
        })
        .method("Sleep", |args: Args| async move {
            tokio::time::sleep(Duration::from_secs(args.num1 as u64)).await;
            Ok::<_, String>(args.num1 + args.num2)
        })
        .build()
}

/// Start a server with the `Foo` service on an ephemeral port; returns
/// its `host:port` address.
pub async fn start_server() -> String {
    start_server_with(foo_service()).await
}

/// Start a server with the given service on an ephemeral port.
pub async fn start_server_with(service: Service) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("listener address").to_string();

    let server = Server::new();
    server.register(service).expect("register service");
    tokio::spawn(async move {
        let _ = server.accept(listener).await;
    });

    addr
}

/// Default options with a server-side handle timeout.
pub fn options_with_handle_timeout(handle_timeout: Duration) -> Options {
    let mut options = Options::default();
    options.handle_timeout = handle_timeout;
    options
}
