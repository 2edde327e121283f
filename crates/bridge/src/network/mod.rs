//! Meteor pub/sub peer
//!
//! ```text
//! polling threads                     tokio
//!   SinkHandle ──votes (async-channel)──> DdpClient ──method──> Meteor
//!   SinkHandle <──display mirror (RwLock)── DdpClient <──added/changed── Meteor
//! ```

pub mod client;
pub mod ddp;

pub use client::{ClientOptions, Credentials, DdpClient, Readiness};
