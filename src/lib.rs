//! fleetlink - host-to-host message transport for accelerator fleets
//!
//! Every participating host joins a group through a [`transport::Transport`]
//! and wraps it in a [`manager::HostManager`]. Host 0 is the master: it
//! discovers the accelerators of every host, allocates communication tags
//! and dispatches serialized tasks to device inboxes. All hosts can move raw
//! bytes, typed values and chunked bulk data between each other.
//!
//! Transport failures are not recoverable: they are logged and the whole
//! group is aborted. Misuse of the API (waiting on an empty request, a
//! worker allocating tags, oversized tasks) panics.

pub mod cli;
pub mod codec;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod manager;
pub mod request;
pub mod tag;
pub mod topology;
pub mod transport;
pub mod version;
pub mod workload;

pub use codec::{CompressionPolicy, Compressor, WireValue};
pub use dispatch::{DeviceInbox, SerializedTask, TaskSendMode};
pub use error::{Error, Result};
pub use manager::{ChunkedReceive, HostManager, ManagerSettings};
pub use request::{are_requests_complete, wait_all, Request, RequestState};
pub use tag::Tag;
pub use topology::{DeviceId, DeviceProperties, HostId, Topology, MASTER_HOST};
