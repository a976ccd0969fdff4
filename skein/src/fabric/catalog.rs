use super::shm::{ShmHub, ShmProvider};
use super::tcp::TcpProvider;
use super::{FabricProvider, Hints, ProviderInfo};
use crate::config::SkeinConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HmemIface {
    #[default]
    System,
    Cuda,
    Rocm,
    Ze,
}

impl HmemIface {
    pub const fn name(self) -> &'static str {
        match self {
            HmemIface::System => "system",
            HmemIface::Cuda => "cuda",
            HmemIface::Rocm => "rocm",
            HmemIface::Ze => "ze",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HmemAttr {
    pub iface: HmemIface,
    pub device: u64,
}

impl HmemAttr {
    pub fn is_device(&self) -> bool {
        self.iface != HmemIface::System
    }
}

/// Classifies buffers as host or accelerator memory.
pub trait DeviceMemory: Send + Sync {
    fn query(&self, addr: u64, len: usize) -> HmemAttr;
}

/// Everything is host memory.
#[derive(Debug, Default)]
pub struct HostMemory;

impl DeviceMemory for HostMemory {
    fn query(&self, _addr: u64, _len: usize) -> HmemAttr {
        HmemAttr::default()
    }
}

/// Process-wide runtime context.
///
/// Owns the provider catalog, the rendezvous call-sequence counter and the
/// device-memory probe. Construct one per process and pass it to every
/// transport.
pub struct Fabric {
    providers: Vec<Arc<dyn FabricProvider>>,
    shm_hub: Arc<ShmHub>,
    device_memory: Arc<dyn DeviceMemory>,
    call_seq: AtomicU64,
    domain_ids: AtomicU64,
}

impl Fabric {
    /// Empty catalog around a node-wide shared-memory hub.
    pub fn new(shm_hub: Arc<ShmHub>) -> Self {
        Self {
            providers: Vec::new(),
            shm_hub,
            device_memory: Arc::new(HostMemory),
            call_seq: AtomicU64::new(0),
            domain_ids: AtomicU64::new(1),
        }
    }

    /// Built-in providers: `shm` plus one `tcp` instance per configured NIC.
    pub fn with_defaults(config: &SkeinConfig) -> Arc<Self> {
        Arc::new(Self::with_shm_hub(config, ShmHub::new()))
    }

    /// Like [`with_defaults`](Self::with_defaults) with an existing hub, so
    /// several in-process ranks see the same shared-memory node.
    pub fn with_shm_hub(config: &SkeinConfig, hub: Arc<ShmHub>) -> Self {
        let mut fabric = Self::new(hub);
        let shm = ShmProvider::new(Arc::clone(&fabric.shm_hub), config.fabric_version);
        fabric.register(Arc::new(shm));
        for nic in &config.tcp_ifaces {
            fabric.register(Arc::new(TcpProvider::new(nic.clone(), config.fabric_version)));
        }
        fabric
    }

    pub fn register(&mut self, provider: Arc<dyn FabricProvider>) {
        tracing::debug!(prov = provider.name(), "registered provider");
        self.providers.push(provider);
    }

    pub fn set_device_memory(&mut self, dm: Arc<dyn DeviceMemory>) {
        self.device_memory = dm;
    }

    pub fn device_memory(&self) -> &dyn DeviceMemory {
        self.device_memory.as_ref()
    }

    pub fn shm_hub(&self) -> &Arc<ShmHub> {
        &self.shm_hub
    }

    /// Every provider instance accepted by `hints`, in registration order.
    pub fn getinfo(&self, hints: &Hints) -> Vec<(Arc<dyn FabricProvider>, ProviderInfo)> {
        self.providers
            .iter()
            .flat_map(|p| {
                p.getinfo(hints)
                    .into_iter()
                    .filter(|info| hints.accepts(info))
                    .map(move |info| (Arc::clone(p), info))
            })
            .collect()
    }

    /// Next rendezvous call id. Every process makes the same sequence of
    /// calls, so ids agree across ranks.
    pub fn next_call_id(&self) -> u64 {
        self.call_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_domain_id(&self) -> u64 {
        self.domain_ids.fetch_add(1, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Fabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.providers.iter().map(|p| p.name()).collect();
        f.debug_struct("Fabric").field("providers", &names).finish()
    }
}
