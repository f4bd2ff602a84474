// crates/client/src/lib.rs
//! jobcast client.
//!
//! Reconstructs a consistent view of every job on a jobcast server from a
//! snapshot plus the live event stream, surviving disconnects, duplicate
//! delivery and reordering across reconnects.
//!
//! Data flows [`JobTransport`] → [`EventChannel`] → [`ClientJobStore`] →
//! [`JobView`]; [`JobFeed`] wires all of them together.

pub mod backoff;
pub mod channel;
pub mod error;
pub mod feed;
pub mod store;
pub mod transport;
pub mod view;

pub use backoff::{Backoff, BackoffConfig};
pub use channel::{ChannelConfig, ChannelUpdate, ConnectionState, EventChannel};
pub use error::{ProtocolError, TransportError};
pub use feed::{FeedConfig, JobFeed};
pub use store::{ApplyOutcome, ClientJob, ClientJobStore, SideEffect};
pub use transport::{decode_event, EventSource, JobTransport, WsConfig, WsTransport};
pub use view::{JobView, DEFAULT_HISTORY_LIMIT};
