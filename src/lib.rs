//! A bidirectional, lock-free, shared-memory inter-domain channel.
//!
//! Two cooperating endpoints exchange byte streams through a pair of
//! single-producer/single-consumer ring buffers living on a page shared
//! via a grant mechanism, with wake-ups delivered over an event channel.
//! One side (the server) allocates the shared page and an unbound event
//! port and publishes both through a small directory service; the other
//! (the client) looks them up, imports the page, and binds an interdomain
//! event port against the server's.
//!
//! ```no_run
//! use vchan::{Endpoint, RuntimeDir};
//!
//! # fn main() -> Result<(), vchan::VchanError> {
//! let runtime = RuntimeDir::new("/tmp/vchan-example");
//! let mut server = Endpoint::server_init(runtime.clone(), 0, 0, 4096, 4096, false)?;
//! // ... in a peer process:
//! let mut client = Endpoint::client_init(runtime, 0, 0)?;
//!
//! client.packet_send(b"hello")?;
//! let mut buf = [0u8; 5];
//! server.packet_recv(&mut buf)?;
//! assert_eq!(&buf, b"hello");
//! # Ok(())
//! # }
//! ```
//!
//! This crate provides no framing beyond "packet or stream", no
//! multiplexing, no encryption, and no flow control beyond ring
//! back-pressure; see each module's documentation for the exact contract
//! it implements.

pub mod config;
pub mod directory;
pub mod endpoint;
pub mod error;
pub mod grant;
pub mod notifier;
pub mod page;
pub mod ring;

pub use endpoint::{Endpoint, EndpointState, Role};
pub use error::{VchanError, VchanResult};
pub use grant::RuntimeDir;
