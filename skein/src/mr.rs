//! Memory registration and the per-endpoint registration cache.

use crate::error::Result;
use crate::fabric::{
    DeviceMemory, Domain, HmemAttr, MrAccess, MrHandle, MrMode, MrRequest, ProviderInfo,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Access requested for every registration made by the transport.
pub const MR_ACCESS: MrAccess = MrAccess::SEND
    .union(MrAccess::RECV)
    .union(MrAccess::READ)
    .union(MrAccess::WRITE)
    .union(MrAccess::REMOTE_READ)
    .union(MrAccess::REMOTE_WRITE);

/// A registration, closed when the last reference drops.
pub struct MemoryRegion {
    domain: Arc<dyn Domain>,
    handle: MrHandle,
    closed: bool,
}

impl MemoryRegion {
    /// Register `[addr, addr + len)` on `domain` under `key`.
    pub fn register(
        domain: &Arc<dyn Domain>,
        addr: u64,
        len: usize,
        key: u64,
        hmem: HmemAttr,
    ) -> Result<Self> {
        let req = MrRequest {
            addr,
            len,
            access: MR_ACCESS,
            requested_key: key,
            hmem,
        };
        let handle = domain.mr_reg(&req)?;
        tracing::trace!(prov = %domain.info().name, addr, len, key, "registered memory");
        Ok(Self {
            domain: Arc::clone(domain),
            handle,
            closed: false,
        })
    }

    /// Close now, reporting a provider failure instead of logging it.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.domain.mr_close(&self.handle)
    }

    pub fn handle(&self) -> &MrHandle {
        &self.handle
    }

    pub fn addr(&self) -> u64 {
        self.handle.addr
    }

    pub fn len(&self) -> usize {
        self.handle.len
    }

    pub fn is_empty(&self) -> bool {
        self.handle.len == 0
    }

    /// Descriptor passed with local transfers.
    pub fn local_key(&self) -> u64 {
        self.handle.local_key
    }

    pub fn remote_key(&self) -> u64 {
        self.handle.remote_key
    }

    pub fn domain_id(&self) -> u64 {
        self.domain.id()
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.domain.mr_close(&self.handle) {
            tracing::warn!(
                prov = %self.domain.info().name,
                key = self.handle.remote_key,
                "failed to close memory region: {e}"
            );
        }
    }
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("domain", &self.domain.id())
            .field("handle", &self.handle)
            .finish()
    }
}

/// A buffer registered on every provider of a transport under one key.
#[derive(Debug)]
pub struct RegisteredMr {
    pub buf: u64,
    pub len: usize,
    pub local_key: u64,
    pub remote_key: u64,
    pub(crate) regions: Vec<MemoryRegion>,
}

impl RegisteredMr {
    /// Close every per-provider registration, returning the first failure.
    pub(crate) fn close(self) -> Result<()> {
        let mut first = Ok(());
        for region in self.regions {
            if let Err(e) = region.close()
                && first.is_ok()
            {
                first = Err(e);
            }
        }
        first
    }
}

/// Whether transfers from a buffer with `hmem` need a registration on `info`.
pub fn needs_registration(info: &ProviderInfo, hmem: &HmemAttr) -> bool {
    info.mr_mode.contains(MrMode::LOCAL) || (hmem.is_device() && info.mr_mode.contains(MrMode::HMEM))
}

/// Source of requested keys, shared by every cache of a transport.
#[derive(Debug, Default)]
pub struct MrKeys(AtomicU64);

impl MrKeys {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

type CacheKey = (u64, u64, usize);

/// Registrations of one endpoint.
pub struct MrCache {
    enabled: bool,
    keys: Arc<MrKeys>,
    entries: HashMap<CacheKey, Arc<MemoryRegion>>,
}

impl MrCache {
    pub fn new(enabled: bool, keys: Arc<MrKeys>) -> Self {
        Self {
            enabled,
            keys,
            entries: HashMap::new(),
        }
    }

    /// Registration covering `[buf, buf + len)` on `domain` for endpoint
    /// `ep`, or `None` when the provider transfers without one.
    pub fn get(
        &mut self,
        ep: usize,
        domain: &Arc<dyn Domain>,
        device_memory: &dyn DeviceMemory,
        buf: u64,
        len: usize,
    ) -> Result<Option<Arc<MemoryRegion>>> {
        let info = domain.info();
        let hmem = device_memory.query(buf, len);
        if !needs_registration(info, &hmem) {
            return Ok(None);
        }

        let key = (domain.id(), buf, len);
        if self.enabled
            && let Some(mr) = self.entries.get(&key)
        {
            return Ok(Some(Arc::clone(mr)));
        }

        let mr = Arc::new(MemoryRegion::register(domain, buf, len, self.keys.next(), hmem)?);
        if info.mr_mode.contains(MrMode::ENDPOINT) {
            domain.mr_bind(mr.handle(), ep)?;
        }
        if hmem.is_device() {
            tracing::debug!(iface = hmem.iface.name(), device = hmem.device, len, "registered device buffer");
        }
        if self.enabled {
            self.entries.insert(key, Arc::clone(&mr));
        }
        Ok(Some(mr))
    }

    /// Hand back a registration obtained from [`get`](Self::get). Without
    /// caching it closes here unless someone else still holds it.
    pub fn push(&mut self, mr: Arc<MemoryRegion>) {
        drop(mr);
    }

    /// Close every cached registration.
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            tracing::warn!(count = self.entries.len(), "force-closing cached memory regions");
        }
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl Drop for MrCache {
    fn drop(&mut self) {
        self.clear();
    }
}
