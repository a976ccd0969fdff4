//! Out-of-band rendezvous for skein transports.
//!
//! [`KvsServer`] runs one job's key-value store and barrier over TCP;
//! [`KvsClient`] is the blocking per-rank handle implementing
//! [`skein::Pmi`] and [`skein::Pmix`].

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::KvsClient;
pub use error::{KvsError, Result};
pub use server::{KvsServer, RunningServer};
