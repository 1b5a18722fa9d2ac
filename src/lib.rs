//! Resilient realtime client for trading-signal streams.
//!
//! A [`ConnectionSupervisor`] owns one subscription at a time and keeps it
//! alive across transport failures: it plans a cascade over the configured
//! transports (datagram, then socket, then push), runs one
//! [`attempt`](crate::attempt) per connection with heartbeat and idle-timeout
//! supervision, deduplicates incoming records into a bounded in-memory
//! buffer, and retries with jittered exponential backoff. An optional
//! [`VisibilityGate`] suspends all of that while nobody is observing the
//! feed.
//!
//! ```no_run
//! use std::sync::Arc;
//! use signal_feed::{
//!     ConnectionSupervisor, FeedConsumer, FeedStatusSnapshot, Signal, SubscribeArgs,
//!     TransportEndpoints,
//! };
//!
//! struct Printer;
//!
//! impl FeedConsumer for Printer {
//!     fn on_status(&self, status: &FeedStatusSnapshot) {
//!         println!("status: {:?} {:?}", status.state, status.reason);
//!     }
//!     fn on_signal(&self, signal: &Signal) {
//!         println!("signal: {} @ {}", signal.symbol, signal.ts);
//!     }
//! }
//!
//! # async fn run() -> Result<(), signal_feed::FeedError> {
//! let supervisor = ConnectionSupervisor::new();
//! let subscription = supervisor
//!     .subscribe(
//!         SubscribeArgs {
//!             channel: "signals:btcusdt".to_string(),
//!             endpoints: TransportEndpoints {
//!                 socket: Some("wss://feed.example.com/ws".to_string()),
//!                 push: Some("https://feed.example.com/stream".to_string()),
//!                 ..TransportEndpoints::default()
//!             },
//!             ..SubscribeArgs::default()
//!         },
//!         Arc::new(Printer),
//!         None,
//!     )
//!     .await?;
//!
//! let recent = subscription.snapshot();
//! # let _ = recent;
//! # Ok(())
//! # }
//! ```

pub mod attempt;
pub mod backoff;
pub mod buffer;
pub mod cascade;
pub mod codec;
pub mod error;
pub mod gate;
pub mod supervisor;
pub mod transport;
pub mod types;

pub use attempt::CloseReason;
pub use backoff::BackoffPolicy;
pub use buffer::DedupBuffer;
pub use error::FeedError;
pub use gate::{visibility_gate, VisibilityGate, VisibilityHandle};
pub use supervisor::{ConnectionSupervisor, FeedConsumer, Subscription};
pub use transport::{CapabilityProbe, RuntimeProbe, TransportEndpoints, TransportKind};
pub use types::{
    ConnectionState, FeedConfig, FeedStatusSnapshot, Signal, SignalSide, SubscribeArgs,
};
