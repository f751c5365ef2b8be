//! A general-purpose RPC framework over TCP.
//!
//! A [`Server`] exposes the methods of registered [`Service`]s; a
//! [`Client`] multiplexes concurrent calls over one connection by
//! sequence number. Each connection starts with a JSON option preamble
//! that negotiates the body codec and timeouts; everything after it is
//! length-delimited header/body frame pairs in the negotiated encoding.
//!
//! On top of the single-connection core sit [`Discovery`] (endpoint
//! selection), [`XClient`] (call routing and broadcast across endpoints)
//! and the heartbeat-based [`Registry`] service.
//!
//! ```no_run
//! use geerpc_core::{Client, Options, Server, Service};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Args {
//!     num1: i64,
//!     num2: i64,
//! }
//!
//! # async fn run() -> geerpc_core::Result<()> {
//! let server = Server::new();
//! server.register(
//!     Service::builder("Foo")
//!         .method("Sum", |args: Args| async move {
//!             Ok::<_, String>(args.num1 + args.num2)
//!         })
//!         .build(),
//! )?;
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
//! let addr = listener.local_addr()?.to_string();
//! tokio::spawn(async move { server.accept(listener).await });
//!
//! let client = Client::dial(&addr, Options::default()).await?;
//! let sum: i64 = client.call("Foo.Sum", &Args { num1: 2, num2: 3 }).await?;
//! assert_eq!(sum, 5);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod discovery;
pub mod error;
mod frame;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod service;
pub mod xclient;

pub use client::{Call, Client};
pub use codec::{ContentType, Header};
pub use discovery::{Discovery, MultiServerDiscovery, RegistryDiscovery, SelectMode};
pub use error::{Result, RpcError};
pub use protocol::{Options, DEFAULT_CONNECT_TIMEOUT, MAGIC_NUMBER};
pub use registry::{heartbeat, Registry};
pub use server::Server;
pub use service::{Service, ServiceBuilder};
pub use xclient::XClient;
