//! Provider abstraction modelled on libfabric.
//!
//! A [`FabricProvider`] is discovered through [`FabricProvider::getinfo`] and
//! opened into a [`Domain`], which owns the endpoints, address vector,
//! completion queues and memory-registration namespace of one provider
//! instance. Data-path calls take raw `u64` buffer addresses; the caller
//! guarantees the memory stays valid until the matching completion.

mod catalog;
pub mod shm;
pub mod tagged;
pub mod tcp;
mod wire;

pub use catalog::{DeviceMemory, Fabric, HmemAttr, HmemIface, HostMemory};
pub use tagged::{CompletionQueue, CqEvent, CqRead, EpState, RxContext};

use crate::error::Result;
use crate::types::FiAddr;
use std::sync::Arc;

pub const SHM_PROV_NAME: &str = "shm";
pub const TCP_PROV_NAME: &str = "tcp";

/// Tag width every provider must offer.
pub const TAG_BITS: u32 = 64;

/// Largest completion batch read from a queue at once.
pub const CQ_BATCH: usize = 8;

/// Provider API version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FabricVersion {
    pub major: u32,
    pub minor: u32,
}

impl FabricVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl Default for FabricVersion {
    fn default() -> Self {
        Self::new(1, 18)
    }
}

impl std::str::FromStr for FabricVersion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (major, minor) = s
            .trim()
            .split_once('.')
            .ok_or_else(|| format!("expected major.minor, got {s}"))?;
        Ok(Self::new(
            major.parse().map_err(|e| format!("major: {e}"))?,
            minor.parse().map_err(|e| format!("minor: {e}"))?,
        ))
    }
}

impl std::fmt::Display for FabricVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

bitflags::bitflags! {
    /// Provider capabilities.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Caps: u64 {
        const TAGGED = 1 << 0;
        const MSG = 1 << 1;
        const RMA = 1 << 2;
        const READ = 1 << 3;
        const WRITE = 1 << 4;
        const REMOTE_READ = 1 << 5;
        const REMOTE_WRITE = 1 << 6;
        const HMEM = 1 << 7;
        const LOCAL_COMM = 1 << 8;
        const REMOTE_COMM = 1 << 9;
    }
}

bitflags::bitflags! {
    /// Access rights requested for a memory registration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MrAccess: u32 {
        const SEND = 1 << 0;
        const RECV = 1 << 1;
        const READ = 1 << 2;
        const WRITE = 1 << 3;
        const REMOTE_READ = 1 << 4;
        const REMOTE_WRITE = 1 << 5;
    }
}

bitflags::bitflags! {
    /// Registration requirements of a domain.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MrMode: u32 {
        /// Local buffers must be registered for data transfers.
        const LOCAL = 1 << 0;
        /// Registrations must be bound to an endpoint before use.
        const ENDPOINT = 1 << 1;
        /// Remote addresses are virtual addresses, not offsets.
        const VIRT_ADDR = 1 << 2;
        /// The provider picks remote keys.
        const PROV_KEY = 1 << 3;
        /// Device memory must be registered.
        const HMEM = 1 << 4;
    }
}

bitflags::bitflags! {
    /// Completion entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CompFlags: u32 {
        const SEND = 1 << 0;
        const RECV = 1 << 1;
        const TAGGED = 1 << 2;
        const READ = 1 << 3;
        const WRITE = 1 << 4;
        const PEEK = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Shm,
    Network,
}

/// Description of one usable provider instance.
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub name: String,
    pub kind: ProviderKind,
    /// NIC backing a network provider.
    pub nic: Option<String>,
    pub caps: Caps,
    pub tag_bits: u32,
    pub addr_len: usize,
    pub max_msg_size: usize,
    pub mr_mode: MrMode,
    /// One name per process, receive contexts addressed through `rx_addr`.
    pub scalable_ep: bool,
    pub rx_ctx_bits: u32,
    pub version: FabricVersion,
}

impl ProviderInfo {
    pub fn is_shm(&self) -> bool {
        self.kind == ProviderKind::Shm
    }
}

/// Discovery filter.
#[derive(Debug, Clone, Default)]
pub struct Hints {
    /// Exact provider name.
    pub provider: Option<String>,
    pub kind: Option<ProviderKind>,
    pub caps: Option<Caps>,
    /// Require device-memory support.
    pub hmem: bool,
    pub min_version: FabricVersion,
}

impl Hints {
    /// Whether `info` satisfies everything but the provider-specific checks.
    pub fn accepts(&self, info: &ProviderInfo) -> bool {
        self.provider.as_deref().is_none_or(|p| p == info.name)
            && self.kind.is_none_or(|k| k == info.kind)
            && self.caps.is_none_or(|c| info.caps.contains(c))
            && (!self.hmem || info.caps.contains(Caps::HMEM))
            && info.version >= self.min_version
    }
}

/// Parameters for opening a domain.
#[derive(Debug, Clone)]
pub struct OpenParams {
    pub ep_count: usize,
    /// Host the process runs on, as seen by the rendezvous.
    pub host: String,
    /// Process-unique id assigned by the opener.
    pub domain_id: u64,
}

/// Memory registration request.
#[derive(Debug, Clone, Copy)]
pub struct MrRequest {
    pub addr: u64,
    pub len: usize,
    pub access: MrAccess,
    pub requested_key: u64,
    pub hmem: HmemAttr,
}

/// Registered memory as seen by a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrHandle {
    pub addr: u64,
    pub len: usize,
    /// Descriptor passed with local data transfers.
    pub local_key: u64,
    /// Key a peer presents for one-sided access.
    pub remote_key: u64,
    pub hmem: HmemAttr,
}

/// A successful completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqEntry {
    pub context: u64,
    pub flags: CompFlags,
    pub len: usize,
    pub tag: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqErrKind {
    /// The operation was cancelled.
    Canceled,
    /// A peek found no matching message.
    NoMessage,
    /// Remote key or bounds check failed.
    Access,
    /// Incoming message larger than the posted buffer.
    Truncated,
    Io,
}

/// A failed completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqErrEntry {
    pub context: u64,
    pub kind: CqErrKind,
    /// Bytes that did not fit, for truncation.
    pub olen: usize,
}

/// Issue-time failure of a data-path call.
#[derive(Debug, thiserror::Error)]
pub enum OpError {
    /// Transient resource exhaustion; retry after progressing.
    #[error("resource temporarily unavailable")]
    Again,
    /// Nothing to act on (e.g. cancel of an already finished operation).
    #[error("no such operation")]
    NotFound,
    #[error("{0}")]
    Failed(String),
}

pub type OpResult = std::result::Result<(), OpError>;

/// A transport backend that can be discovered and opened.
pub trait FabricProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Instances matching `hints`; empty when unavailable.
    fn getinfo(&self, hints: &Hints) -> Vec<ProviderInfo>;

    fn open(&self, info: &ProviderInfo, params: &OpenParams) -> Result<Arc<dyn Domain>>;
}

/// An opened provider instance.
///
/// Endpoint indices run over `0..ep_count`. For scalable-endpoint
/// providers they select receive/transmit contexts of a single named endpoint.
pub trait Domain: Send + Sync {
    fn info(&self) -> &ProviderInfo;

    /// Unique within the process; part of registration cache keys.
    fn id(&self) -> u64;

    /// Address name of endpoint `ep`, exactly `info().addr_len` bytes.
    fn ep_name(&self, ep: usize) -> Vec<u8>;

    /// Insert peer names; unreachable names map to `FI_ADDR_NOTAVAIL`.
    fn av_insert(&self, names: &[Vec<u8>]) -> Result<Vec<FiAddr>>;

    /// Address of receive context `rx_idx` behind `base`.
    fn rx_addr(&self, base: FiAddr, rx_idx: usize) -> FiAddr {
        let bits = self.info().rx_ctx_bits;
        if bits == 0 {
            return base;
        }
        base | ((rx_idx as u64) << (64 - bits))
    }

    fn mr_reg(&self, req: &MrRequest) -> Result<MrHandle>;

    fn mr_bind(&self, _mr: &MrHandle, _ep: usize) -> Result<()> {
        Ok(())
    }

    fn mr_close(&self, mr: &MrHandle) -> Result<()>;

    /// Tagged send.
    ///
    /// # Safety
    /// `buf` must be valid for reads of `len` bytes until the completion.
    unsafe fn tsend(
        &self,
        ep: usize,
        buf: u64,
        len: usize,
        desc: Option<u64>,
        dest: FiAddr,
        tag: u64,
        context: u64,
    ) -> OpResult;

    /// Tagged receive. With `peek` set the message is reported, not consumed,
    /// and `buf` is never written.
    ///
    /// # Safety
    /// `buf` must be valid for writes of `len` bytes until the completion.
    #[allow(clippy::too_many_arguments)]
    unsafe fn trecv(
        &self,
        ep: usize,
        buf: u64,
        len: usize,
        desc: Option<u64>,
        src: FiAddr,
        tag: u64,
        ignore: u64,
        context: u64,
        peek: bool,
    ) -> OpResult;

    /// One-sided read from `src`'s registered memory.
    ///
    /// # Safety
    /// `buf` must be valid for writes of `len` bytes until the completion.
    #[allow(clippy::too_many_arguments)]
    unsafe fn read(
        &self,
        ep: usize,
        buf: u64,
        len: usize,
        desc: Option<u64>,
        src: FiAddr,
        remote_addr: u64,
        remote_key: u64,
        context: u64,
    ) -> OpResult;

    /// One-sided write into `dest`'s registered memory.
    ///
    /// # Safety
    /// `buf` must be valid for reads of `len` bytes until the completion.
    #[allow(clippy::too_many_arguments)]
    unsafe fn write(
        &self,
        ep: usize,
        buf: u64,
        len: usize,
        desc: Option<u64>,
        dest: FiAddr,
        remote_addr: u64,
        remote_key: u64,
        context: u64,
    ) -> OpResult;

    /// Cancel a pending receive; a `Canceled` error entry follows on success.
    fn cancel(&self, ep: usize, context: u64) -> OpResult;

    fn cq_read(&self, ep: usize, out: &mut Vec<CqEntry>, max: usize) -> CqRead;

    fn cq_readerr(&self, ep: usize) -> Option<CqErrEntry>;
}

/// Strip the NUL padding of a shared-memory name, keeping one terminator.
pub fn trim_shm_name(name: &[u8]) -> Vec<u8> {
    let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    let mut out = name[..end].to_vec();
    out.push(0);
    out
}
