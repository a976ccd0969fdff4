#[macro_use]
mod fault;

pub mod addr;
pub mod config;
pub mod coord;
pub mod dispatch;
pub mod error;
pub mod fabric;
pub mod mr;
pub mod pmi;
mod progress;
pub mod registry;
pub mod request;
pub mod transport;
pub mod types;

pub use config::{AttrIn, AttrOut, NicFilter, NicSpec, SkeinConfig, TransportAttr};
pub use coord::ProcessCoordinate;
pub use error::{Result, SkeinError, Status};
pub use fabric::{DeviceMemory, Fabric, HmemAttr, HmemIface};
pub use mr::RegisteredMr;
pub use pmi::{LocalPmi, Pmi, Pmix};
pub use request::Request;
pub use transport::{ProbeOutcome, Transport};
pub use types::{KvsMode, MnicOffset, MnicType, ProgressMode, Rank};
