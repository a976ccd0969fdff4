//! In-process shared-memory provider.
//!
//! Endpoints of every domain opened on the same [`ShmHub`] can reach each
//! other as long as they were opened for the same host. Transfers are eager
//! copies, so sends and one-sided operations complete at issue time.

use super::tagged::{EpState, PostedRecv, RegionTable};
use super::{
    Caps, CompFlags, CqEntry, CqErrEntry, CqErrKind, CqRead, Domain, FabricProvider,
    FabricVersion, Hints, MrAccess, MrHandle, MrMode, MrRequest, OpError, OpResult, OpenParams,
    ProviderInfo, ProviderKind, SHM_PROV_NAME, TAG_BITS,
};
use crate::error::{Result, SkeinError};
use crate::types::{FI_ADDR_NOTAVAIL, FI_ADDR_UNSPEC, FiAddr};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Address length of a shared-memory endpoint name, NUL padded.
pub const SHM_ADDR_LEN: usize = 128;

/// Largest message routed through shared memory.
pub const SHM_MAX_MSG_SIZE: usize = 16 * 1024 * 1024;

const NAME_PREFIX: &str = "shm://";

/// Node-wide directory of live shared-memory endpoints.
#[derive(Debug, Default)]
pub struct ShmHub {
    endpoints: Mutex<HashMap<Vec<u8>, Weak<ShmEndpoint>>>,
    instances: AtomicU64,
}

impl ShmHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, ep: &Arc<ShmEndpoint>) {
        self.endpoints
            .lock()
            .insert(ep.name.clone(), Arc::downgrade(ep));
    }

    fn lookup(&self, name: &[u8]) -> Option<Arc<ShmEndpoint>> {
        self.endpoints.lock().get(name).and_then(Weak::upgrade)
    }

    fn unregister(&self, name: &[u8]) {
        self.endpoints.lock().remove(name);
    }

    /// Live endpoints on the hub.
    pub fn len(&self) -> usize {
        self.endpoints
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Name bytes up to the first NUL.
fn name_key(name: &[u8]) -> &[u8] {
    let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    &name[..end]
}

fn name_host(key: &[u8]) -> Option<&[u8]> {
    let rest = key.strip_prefix(NAME_PREFIX.as_bytes())?;
    let end = rest.iter().position(|&b| b == b'/')?;
    Some(&rest[..end])
}

#[derive(Debug, Default)]
struct AvTable {
    peers: Vec<Weak<ShmEndpoint>>,
    by_name: HashMap<Vec<u8>, FiAddr>,
}

#[derive(Debug)]
pub struct ShmEndpoint {
    name: Vec<u8>,
    state: Mutex<EpState>,
    regions: Arc<Mutex<RegionTable>>,
    av: Arc<Mutex<AvTable>>,
}

impl ShmEndpoint {
    fn src_of(&self, sender: &[u8]) -> FiAddr {
        self.av
            .lock()
            .by_name
            .get(sender)
            .copied()
            .unwrap_or(FI_ADDR_UNSPEC)
    }

    fn region_check(&self, key: u64, addr: u64, len: usize, access: MrAccess) -> bool {
        self.regions.lock().covers(key, addr, len, access)
    }
}

pub struct ShmProvider {
    hub: Arc<ShmHub>,
    version: FabricVersion,
}

impl ShmProvider {
    pub fn new(hub: Arc<ShmHub>, version: FabricVersion) -> Self {
        Self { hub, version }
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: SHM_PROV_NAME.into(),
            kind: ProviderKind::Shm,
            nic: None,
            caps: Caps::TAGGED
                | Caps::MSG
                | Caps::RMA
                | Caps::READ
                | Caps::WRITE
                | Caps::REMOTE_READ
                | Caps::REMOTE_WRITE
                | Caps::LOCAL_COMM,
            tag_bits: TAG_BITS,
            addr_len: SHM_ADDR_LEN,
            max_msg_size: SHM_MAX_MSG_SIZE,
            mr_mode: MrMode::VIRT_ADDR,
            scalable_ep: false,
            rx_ctx_bits: 0,
            version: self.version,
        }
    }
}

impl FabricProvider for ShmProvider {
    fn name(&self) -> &str {
        SHM_PROV_NAME
    }

    fn getinfo(&self, hints: &Hints) -> Vec<ProviderInfo> {
        let info = self.info();
        if hints.accepts(&info) {
            vec![info]
        } else {
            Vec::new()
        }
    }

    fn open(&self, info: &ProviderInfo, params: &OpenParams) -> Result<Arc<dyn Domain>> {
        let instance = self.hub.instances.fetch_add(1, Ordering::Relaxed);
        let regions = Arc::new(Mutex::new(RegionTable::default()));
        let av = Arc::new(Mutex::new(AvTable::default()));

        let mut endpoints = Vec::with_capacity(params.ep_count);
        for ep in 0..params.ep_count {
            let name = format!(
                "{NAME_PREFIX}{}/{}.{instance}.{ep}",
                params.host,
                std::process::id()
            )
            .into_bytes();
            if name.len() >= SHM_ADDR_LEN {
                return Err(SkeinError::provider(
                    SHM_PROV_NAME,
                    format!("endpoint name exceeds {SHM_ADDR_LEN} bytes"),
                ));
            }
            let endpoint = Arc::new(ShmEndpoint {
                name,
                state: Mutex::new(EpState::default()),
                regions: Arc::clone(&regions),
                av: Arc::clone(&av),
            });
            self.hub.register(&endpoint);
            endpoints.push(endpoint);
        }

        tracing::debug!(host = %params.host, eps = params.ep_count, "opened shm domain");
        Ok(Arc::new(ShmDomain {
            info: info.clone(),
            id: params.domain_id,
            host: params.host.clone(),
            hub: Arc::clone(&self.hub),
            endpoints,
            regions,
            av,
        }))
    }
}

pub struct ShmDomain {
    info: ProviderInfo,
    id: u64,
    host: String,
    hub: Arc<ShmHub>,
    endpoints: Vec<Arc<ShmEndpoint>>,
    regions: Arc<Mutex<RegionTable>>,
    av: Arc<Mutex<AvTable>>,
}

impl ShmDomain {
    fn endpoint(&self, ep: usize) -> std::result::Result<&Arc<ShmEndpoint>, OpError> {
        self.endpoints
            .get(ep)
            .ok_or_else(|| OpError::Failed(format!("shm: no endpoint {ep}")))
    }

    fn peer(&self, addr: FiAddr) -> std::result::Result<Arc<ShmEndpoint>, OpError> {
        let av = self.av.lock();
        av.peers
            .get(addr as usize)
            .and_then(Weak::upgrade)
            .ok_or_else(|| OpError::Failed(format!("shm: address {addr} is not reachable")))
    }
}

impl Drop for ShmDomain {
    fn drop(&mut self) {
        for ep in &self.endpoints {
            self.hub.unregister(&ep.name);
        }
    }
}

impl Domain for ShmDomain {
    fn info(&self) -> &ProviderInfo {
        &self.info
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn ep_name(&self, ep: usize) -> Vec<u8> {
        let mut name = self
            .endpoints
            .get(ep)
            .map(|e| e.name.clone())
            .unwrap_or_default();
        name.resize(SHM_ADDR_LEN, 0);
        name
    }

    fn av_insert(&self, names: &[Vec<u8>]) -> Result<Vec<FiAddr>> {
        let mut av = self.av.lock();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let key = name_key(name);
            if name_host(key) != Some(self.host.as_bytes()) {
                out.push(FI_ADDR_NOTAVAIL);
                continue;
            }
            if let Some(&addr) = av.by_name.get(key) {
                out.push(addr);
                continue;
            }
            let peer = self.hub.lookup(key).ok_or_else(|| {
                SkeinError::provider(
                    SHM_PROV_NAME,
                    format!("unknown peer {}", String::from_utf8_lossy(key)),
                )
            })?;
            let addr = av.peers.len() as FiAddr;
            av.peers.push(Arc::downgrade(&peer));
            av.by_name.insert(key.to_vec(), addr);
            out.push(addr);
        }
        Ok(out)
    }

    fn mr_reg(&self, req: &MrRequest) -> Result<MrHandle> {
        self.regions.lock().register(req).ok_or_else(|| {
            SkeinError::provider(
                SHM_PROV_NAME,
                format!("memory key {} already registered", req.requested_key),
            )
        })
    }

    fn mr_close(&self, mr: &MrHandle) -> Result<()> {
        if self.regions.lock().deregister(mr.remote_key) {
            Ok(())
        } else {
            Err(SkeinError::provider(
                SHM_PROV_NAME,
                format!("memory key {} is not registered", mr.remote_key),
            ))
        }
    }

    unsafe fn tsend(
        &self,
        ep: usize,
        buf: u64,
        len: usize,
        _desc: Option<u64>,
        dest: FiAddr,
        tag: u64,
        context: u64,
    ) -> OpResult {
        let me = self.endpoint(ep)?;
        let peer = self.peer(dest)?;
        let src = peer.src_of(&me.name);
        let data = if len == 0 {
            Vec::new()
        } else {
            // SAFETY: caller guarantees `buf` covers `len` readable bytes.
            unsafe { std::slice::from_raw_parts(buf as *const u8, len) }.to_vec()
        };
        // SAFETY: posted buffers on the peer are kept valid by its owner.
        unsafe { peer.state.lock().deliver(src, tag, data) };
        me.state
            .lock()
            .push_done(context, CompFlags::SEND | CompFlags::TAGGED, len, tag);
        Ok(())
    }

    unsafe fn trecv(
        &self,
        ep: usize,
        buf: u64,
        len: usize,
        _desc: Option<u64>,
        src: FiAddr,
        tag: u64,
        ignore: u64,
        context: u64,
        peek: bool,
    ) -> OpResult {
        let me = self.endpoint(ep)?;
        let recv = PostedRecv {
            src,
            tag,
            ignore,
            buf,
            len,
            context,
        };
        // SAFETY: forwarded from the caller.
        unsafe { me.state.lock().post_recv(recv, peek) };
        Ok(())
    }

    unsafe fn read(
        &self,
        ep: usize,
        buf: u64,
        len: usize,
        _desc: Option<u64>,
        src: FiAddr,
        remote_addr: u64,
        remote_key: u64,
        context: u64,
    ) -> OpResult {
        let me = self.endpoint(ep)?;
        let peer = self.peer(src)?;
        let mut state = me.state.lock();
        if !peer.region_check(remote_key, remote_addr, len, MrAccess::REMOTE_READ) {
            state.push_error(context, CqErrKind::Access);
            return Ok(());
        }
        // SAFETY: the remote range is registered and `buf` is valid per the caller.
        unsafe { std::ptr::copy(remote_addr as *const u8, buf as *mut u8, len) };
        state.push_done(context, CompFlags::READ, len, 0);
        Ok(())
    }

    unsafe fn write(
        &self,
        ep: usize,
        buf: u64,
        len: usize,
        _desc: Option<u64>,
        dest: FiAddr,
        remote_addr: u64,
        remote_key: u64,
        context: u64,
    ) -> OpResult {
        let me = self.endpoint(ep)?;
        let peer = self.peer(dest)?;
        let mut state = me.state.lock();
        if !peer.region_check(remote_key, remote_addr, len, MrAccess::REMOTE_WRITE) {
            state.push_error(context, CqErrKind::Access);
            return Ok(());
        }
        // SAFETY: the remote range is registered and `buf` is valid per the caller.
        unsafe { std::ptr::copy(buf as *const u8, remote_addr as *mut u8, len) };
        state.push_done(context, CompFlags::WRITE, len, 0);
        Ok(())
    }

    fn cancel(&self, ep: usize, context: u64) -> OpResult {
        if self.endpoint(ep)?.state.lock().cancel(context) {
            Ok(())
        } else {
            Err(OpError::NotFound)
        }
    }

    fn cq_read(&self, ep: usize, out: &mut Vec<CqEntry>, max: usize) -> CqRead {
        match self.endpoints.get(ep) {
            Some(e) => e.state.lock().cq.read(out, max),
            None => CqRead::Again,
        }
    }

    fn cq_readerr(&self, ep: usize) -> Option<CqErrEntry> {
        self.endpoints.get(ep)?.state.lock().cq.readerr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(hub: &Arc<ShmHub>, host: &str, eps: usize, id: u64) -> Arc<dyn Domain> {
        let prov = ShmProvider::new(Arc::clone(hub), FabricVersion::default());
        let info = prov.getinfo(&Hints::default()).remove(0);
        prov.open(
            &info,
            &OpenParams {
                ep_count: eps,
                host: host.into(),
                domain_id: id,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_names_are_padded_and_unique() {
        let hub = ShmHub::new();
        let d = open(&hub, "node-a", 2, 1);
        let n0 = d.ep_name(0);
        let n1 = d.ep_name(1);
        assert_eq!(n0.len(), SHM_ADDR_LEN);
        assert_ne!(n0, n1);
        assert_eq!(name_host(name_key(&n0)), Some(&b"node-a"[..]));
        assert_eq!(hub.len(), 2);
        drop(d);
        assert!(hub.is_empty());
    }

    #[test]
    fn test_remote_host_not_available() {
        let hub = ShmHub::new();
        let a = open(&hub, "node-a", 1, 1);
        let b = open(&hub, "node-b", 1, 2);
        let addrs = a.av_insert(&[a.ep_name(0), b.ep_name(0)]).unwrap();
        assert_eq!(addrs[0], 0);
        assert_eq!(addrs[1], FI_ADDR_NOTAVAIL);
    }

    #[test]
    fn test_send_recv_between_domains() {
        let hub = ShmHub::new();
        let a = open(&hub, "h", 1, 1);
        let b = open(&hub, "h", 1, 2);
        let names = vec![a.ep_name(0), b.ep_name(0)];
        let av_a = a.av_insert(&names).unwrap();
        let av_b = b.av_insert(&names).unwrap();

        let mut dst = [0u8; 4];
        let src = [1u8, 2, 3, 4];
        unsafe {
            b.trecv(0, dst.as_mut_ptr() as u64, 4, None, av_b[0], 9, 0, 11, false)
                .unwrap();
            a.tsend(0, src.as_ptr() as u64, 4, None, av_a[1], 9, 22).unwrap();
        }
        let mut out = Vec::new();
        assert_eq!(a.cq_read(0, &mut out, 8), CqRead::Read(1));
        assert_eq!(out[0].context, 22);
        out.clear();
        assert_eq!(b.cq_read(0, &mut out, 8), CqRead::Read(1));
        assert_eq!((out[0].context, out[0].len), (11, 4));
        assert_eq!(dst, src);
    }

    #[test]
    fn test_rma_checks_key_and_bounds() {
        let hub = ShmHub::new();
        let a = open(&hub, "h", 1, 1);
        let b = open(&hub, "h", 1, 2);
        let names = vec![a.ep_name(0), b.ep_name(0)];
        let av_a = a.av_insert(&names).unwrap();
        b.av_insert(&names).unwrap();

        let mut target = vec![0u8; 16];
        let mr = b
            .mr_reg(&MrRequest {
                addr: target.as_mut_ptr() as u64,
                len: 16,
                access: MrAccess::REMOTE_READ | MrAccess::REMOTE_WRITE,
                requested_key: 5,
                hmem: Default::default(),
            })
            .unwrap();
        let payload = [0xabu8; 8];
        unsafe {
            a.write(0, payload.as_ptr() as u64, 8, None, av_a[1], mr.addr + 4, 5, 1)
                .unwrap();
            a.write(0, payload.as_ptr() as u64, 8, None, av_a[1], mr.addr + 12, 5, 2)
                .unwrap();
            a.write(0, payload.as_ptr() as u64, 8, None, av_a[1], mr.addr, 6, 3)
                .unwrap();
        }
        let mut out = Vec::new();
        assert_eq!(a.cq_read(0, &mut out, 8), CqRead::Read(1));
        assert_eq!(a.cq_read(0, &mut out, 8), CqRead::ErrorAvailable);
        assert_eq!(a.cq_readerr(0).map(|e| e.kind), Some(CqErrKind::Access));
        assert_eq!(a.cq_readerr(0).map(|e| e.kind), Some(CqErrKind::Access));
        assert_eq!(&target[4..12], &payload);
        b.mr_close(&mr).unwrap();
        assert!(b.mr_close(&mr).is_err());
    }
}
