//! CSP-style channels: rendezvous-or-buffered message passing with
//! per-operation timeouts, cancellation, graceful retirement, and a
//! two-phase-commit offer protocol enabling atomic multi-channel selection.
//!
//! ## Layout
//!
//! - [`channel`] — the kernel: per-channel reader/writer queues, matching,
//!   buffering, retirement.
//! - [`select`] — atomic selection across many channels (`read_from_any`,
//!   `write_to_any`).
//! - [`broadcast`] — a channel variant that delivers one write to every
//!   registered reader atomically.
//! - [`offer`] — the two-phase-commit contract (`offer`/`commit`/`withdraw`)
//!   that makes atomic selection possible.
//! - [`scope`] — a nested, task-local namespace mapping channel names to
//!   instances.
//! - [`timer`] — the process-wide expiration manager backing deadlines.
//! - [`deadline`] — the `Deadline` sentinel/duration type.
//! - [`error`] — `ChannelError`/`ScopeError`.
//!
//! ## Example
//!
//! ```no_run
//! use csp_kernel::{Channel, ChannelConfig, Deadline};
//!
//! # async fn run() {
//! let c = Channel::<&'static str>::new(ChannelConfig::default()).unwrap();
//! let writer = {
//!     let c = c.clone();
//!     tokio::spawn(async move { c.write("hello", None, Deadline::Infinite).await })
//! };
//! let received = c.read(None, Deadline::Infinite).await.unwrap();
//! assert_eq!(received, "hello");
//! writer.await.unwrap().unwrap();
//! # }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() { run().await }
//! ```

pub mod broadcast;
pub mod channel;
pub mod deadline;
pub mod error;
pub mod offer;
pub mod scope;
pub mod select;
pub(crate) mod timer;

pub use broadcast::{BroadcastChannel, BroadcastConfig};
pub use channel::{Channel, ChannelConfig, OverflowPolicy, ReadFuture, WriteFuture, new_channel};
pub use deadline::Deadline;
pub use error::{ChannelError, Result, ScopeError};
pub use offer::{Offer, OfferHandle};
pub use scope::{Scope, ScopeGuard};
pub use select::{Priority, read_from_any, write_to_any};

/// Re-exports the common surface for `use csp_kernel::prelude::*;`.
pub mod prelude {
    pub use crate::broadcast::{BroadcastChannel, BroadcastConfig};
    pub use crate::channel::{Channel, ChannelConfig, OverflowPolicy};
    pub use crate::deadline::Deadline;
    pub use crate::error::{ChannelError, Result, ScopeError};
    pub use crate::scope::Scope;
    pub use crate::select::{Priority, read_from_any, write_to_any};
}
