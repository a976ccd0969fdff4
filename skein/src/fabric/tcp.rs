//! TCP network provider.
//!
//! One listening socket per domain, exposed as a scalable endpoint: a single
//! 24-byte name whose receive contexts are selected through the top
//! `rx_ctx_bits` of an address. Tagged sends are eager and complete locally
//! once queued; one-sided operations travel as request/response frames and
//! complete when the peer answers.

use super::tagged::{EpState, PostedRecv, RegionTable};
use super::wire::{Frame, LEN_PREFIX, MAX_FRAME_SIZE, TCP_ADDR_LEN, WireName, decode_frame, encode_frame};
use super::{
    Caps, CompFlags, CqEntry, CqErrEntry, CqErrKind, CqRead, Domain, FabricProvider,
    FabricVersion, Hints, MrAccess, MrHandle, MrMode, MrRequest, OpError, OpResult, OpenParams,
    ProviderInfo, ProviderKind, TAG_BITS, TCP_PROV_NAME,
};
use crate::config::NicSpec;
use crate::error::{Result, SkeinError};
use crate::types::{FI_ADDR_NOTAVAIL, FI_ADDR_UNSPEC, FiAddr};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Receive-context bits of a TCP address.
pub const TCP_RX_CTX_BITS: u32 = 8;

pub const TCP_MAX_MSG_SIZE: usize = 256 * 1024 * 1024;

/// `[ip: 16 (v4 mapped)][port: u16 LE][reserved: 2][instance: u32 LE]`.
pub fn encode_name(addr: SocketAddr, instance: u32) -> WireName {
    let mut name = [0u8; TCP_ADDR_LEN];
    let ip = match addr.ip() {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    };
    name[..16].copy_from_slice(&ip.octets());
    name[16..18].copy_from_slice(&addr.port().to_le_bytes());
    name[20..24].copy_from_slice(&instance.to_le_bytes());
    name
}

pub fn decode_name(name: &[u8]) -> Option<(SocketAddr, u32)> {
    if name.len() != TCP_ADDR_LEN {
        return None;
    }
    let octets: [u8; 16] = name[..16].try_into().ok()?;
    let v6 = Ipv6Addr::from(octets);
    let ip = match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    };
    let port = u16::from_le_bytes([name[16], name[17]]);
    let instance = u32::from_le_bytes(name[20..24].try_into().ok()?);
    Some((SocketAddr::new(ip, port), instance))
}

pub struct TcpProvider {
    nic: NicSpec,
    version: FabricVersion,
}

impl TcpProvider {
    pub fn new(nic: NicSpec, version: FabricVersion) -> Self {
        Self { nic, version }
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: TCP_PROV_NAME.into(),
            kind: ProviderKind::Network,
            nic: Some(self.nic.name.clone()),
            caps: Caps::TAGGED
                | Caps::MSG
                | Caps::RMA
                | Caps::READ
                | Caps::WRITE
                | Caps::REMOTE_READ
                | Caps::REMOTE_WRITE
                | Caps::LOCAL_COMM
                | Caps::REMOTE_COMM,
            tag_bits: TAG_BITS,
            addr_len: TCP_ADDR_LEN,
            max_msg_size: TCP_MAX_MSG_SIZE,
            mr_mode: MrMode::LOCAL | MrMode::VIRT_ADDR,
            scalable_ep: true,
            rx_ctx_bits: TCP_RX_CTX_BITS,
            version: self.version,
        }
    }
}

impl FabricProvider for TcpProvider {
    fn name(&self) -> &str {
        TCP_PROV_NAME
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
        if params.ep_count == 0 || params.ep_count > 1 << TCP_RX_CTX_BITS {
            return Err(SkeinError::provider(
                TCP_PROV_NAME,
                format!("unsupported endpoint count {}", params.ep_count),
            ));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("skein-tcp")
            .enable_all()
            .build()?;

        let std_listener = std::net::TcpListener::bind(SocketAddr::new(self.nic.ip, 0))?;
        std_listener.set_nonblocking(true)?;
        let local = std_listener.local_addr()?;
        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(std_listener)?
        };

        let instance = (params.domain_id as u32) ^ std::process::id().rotate_left(16);
        let shared = Arc::new(Shared {
            name: encode_name(local, instance),
            eps: (0..params.ep_count)
                .map(|_| Mutex::new(EpState::default()))
                .collect(),
            peers: Mutex::new(PeerTable::default()),
            regions: Mutex::new(RegionTable::default()),
            pending: Mutex::new(HashMap::new()),
            next_req: AtomicU64::new(1),
            conns: Mutex::new(HashMap::new()),
            handle: runtime.handle().clone(),
        });

        runtime.spawn(accept_loop(listener, Arc::clone(&shared)));
        tracing::debug!(nic = %self.nic.name, %local, eps = params.ep_count, "opened tcp domain");

        Ok(Arc::new(TcpDomain {
            info: info.clone(),
            id: params.domain_id,
            shared,
            runtime: Some(runtime),
        }))
    }
}

#[derive(Debug, Default)]
struct PeerTable {
    addrs: Vec<SocketAddr>,
    by_name: HashMap<WireName, FiAddr>,
}

#[derive(Debug, Clone, Copy)]
enum RmaKind {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy)]
struct PendingRma {
    kind: RmaKind,
    ep: usize,
    context: u64,
    buf: u64,
    len: usize,
}

/// State shared between the domain and its I/O tasks.
struct Shared {
    name: WireName,
    eps: Vec<Mutex<EpState>>,
    peers: Mutex<PeerTable>,
    regions: Mutex<RegionTable>,
    pending: Mutex<HashMap<u64, PendingRma>>,
    next_req: AtomicU64,
    conns: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Vec<u8>>>>,
    handle: tokio::runtime::Handle,
}

fn split_addr(addr: FiAddr) -> (usize, usize) {
    let shift = 64 - TCP_RX_CTX_BITS;
    let base = addr & ((1u64 << shift) - 1);
    ((base) as usize, (addr >> shift) as usize)
}

impl Shared {
    fn ep(&self, ep: usize) -> std::result::Result<&Mutex<EpState>, OpError> {
        self.eps
            .get(ep)
            .ok_or_else(|| OpError::Failed(format!("tcp: no endpoint {ep}")))
    }

    fn peer_addr(&self, base: usize) -> std::result::Result<SocketAddr, OpError> {
        self.peers
            .lock()
            .addrs
            .get(base)
            .copied()
            .ok_or_else(|| OpError::Failed(format!("tcp: unknown address {base}")))
    }

    /// Queue an encoded frame on the connection to `to`, opening it on first use.
    fn post(&self, to: SocketAddr, frame: &Frame) -> OpResult {
        let buf = encode_frame(frame).map_err(|e| OpError::Failed(e.to_string()))?;
        let mut conns = self.conns.lock();
        if let Some(tx) = conns.get(&to)
            && !tx.is_closed()
        {
            return tx
                .send(buf)
                .map_err(|_| OpError::Failed(format!("tcp: connection to {to} closed")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.handle.spawn(writer_loop(to, rx));
        tx.send(buf)
            .map_err(|_| OpError::Failed(format!("tcp: connection to {to} closed")))?;
        conns.insert(to, tx);
        Ok(())
    }

    fn reply(&self, src: &WireName, frame: Frame) {
        let Some((to, _)) = decode_name(src) else {
            tracing::warn!("tcp: malformed reply address");
            return;
        };
        if let Err(e) = self.post(to, &frame) {
            tracing::warn!(%to, "tcp: reply failed: {e}");
        }
    }

    fn finish_rma(&self, req_id: u64, ok: bool, payload: &[u8]) {
        let Some(p) = self.pending.lock().remove(&req_id) else {
            tracing::warn!(req_id, "tcp: response for unknown rma request");
            return;
        };
        let Some(ep) = self.eps.get(p.ep) else {
            return;
        };
        let mut state = ep.lock();
        if !ok {
            state.push_error(p.context, CqErrKind::Access);
            return;
        }
        match p.kind {
            RmaKind::Read => {
                let n = payload.len().min(p.len);
                // SAFETY: the issuer keeps `buf` valid until this completion.
                unsafe { std::ptr::copy_nonoverlapping(payload.as_ptr(), p.buf as *mut u8, n) };
                state.push_done(p.context, CompFlags::READ, n, 0);
            }
            RmaKind::Write => state.push_done(p.context, CompFlags::WRITE, p.len, 0),
        }
    }

    fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Tagged {
                src,
                tx_ctx,
                rx_ctx,
                tag,
                payload,
            } => {
                let src_addr = match self.peers.lock().by_name.get(&src) {
                    Some(&base) => base | ((tx_ctx as u64) << (64 - TCP_RX_CTX_BITS)),
                    None => FI_ADDR_UNSPEC,
                };
                match self.eps.get(rx_ctx as usize) {
                    // SAFETY: posted buffers are kept valid by their owner.
                    Some(ep) => unsafe { ep.lock().deliver(src_addr, tag, payload) },
                    None => tracing::warn!(rx_ctx, "tcp: message for unknown receive context"),
                }
            }
            Frame::ReadReq {
                src,
                req_id,
                key,
                addr,
                len,
            } => {
                let len = len as usize;
                let ok = self
                    .regions
                    .lock()
                    .covers(key, addr, len, MrAccess::REMOTE_READ);
                let payload = if ok && len > 0 {
                    // SAFETY: the range lies inside a live registration.
                    unsafe { std::slice::from_raw_parts(addr as *const u8, len) }.to_vec()
                } else {
                    Vec::new()
                };
                self.reply(&src, Frame::ReadResp {
                    req_id,
                    ok,
                    payload,
                });
            }
            Frame::WriteReq {
                src,
                req_id,
                key,
                addr,
                payload,
            } => {
                let ok = self
                    .regions
                    .lock()
                    .covers(key, addr, payload.len(), MrAccess::REMOTE_WRITE);
                if ok {
                    // SAFETY: the range lies inside a live registration.
                    unsafe {
                        std::ptr::copy_nonoverlapping(payload.as_ptr(), addr as *mut u8, payload.len())
                    };
                }
                self.reply(&src, Frame::WriteAck { req_id, ok });
            }
            Frame::ReadResp {
                req_id,
                ok,
                payload,
            } => self.finish_rma(req_id, ok, &payload),
            Frame::WriteAck { req_id, ok } => self.finish_rma(req_id, ok, &[]),
        }
    }

    fn start_rma(&self, pending: PendingRma, to: SocketAddr, frame: &Frame, req_id: u64) -> OpResult {
        self.pending.lock().insert(req_id, pending);
        if let Err(e) = self.post(to, frame) {
            self.pending.lock().remove(&req_id);
            return Err(e);
        }
        Ok(())
    }
}

async fn writer_loop(to: SocketAddr, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    let mut stream = match TcpStream::connect(to).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(%to, "tcp connect failed: {e}");
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("tcp set_nodelay: {e}");
    }
    while let Some(buf) = rx.recv().await {
        if let Err(e) = stream.write_all(&buf).await {
            tracing::warn!(%to, "tcp write failed: {e}");
            return;
        }
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!("tcp accept loop ended: {e}");
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, "tcp set_nodelay: {e}");
        }
        tokio::spawn(recv_loop(stream, Arc::clone(&shared)));
    }
}

/// Read frames from one inbound connection until it closes.
async fn recv_loop(mut stream: TcpStream, shared: Arc<Shared>) {
    let mut len_buf = [0u8; LEN_PREFIX];
    loop {
        if let Err(e) = stream.read_exact(&mut len_buf).await {
            tracing::debug!("tcp recv loop ended: {e}");
            return;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            tracing::warn!(len, "tcp: frame too large, closing connection");
            return;
        }
        let mut payload = vec![0u8; len];
        if let Err(e) = stream.read_exact(&mut payload).await {
            tracing::debug!("tcp recv loop ended reading payload: {e}");
            return;
        }
        match decode_frame(&payload) {
            Ok(frame) => shared.handle_frame(frame),
            Err(e) => {
                tracing::warn!("tcp: dropping connection on bad frame: {e}");
                return;
            }
        }
    }
}

pub struct TcpDomain {
    info: ProviderInfo,
    id: u64,
    shared: Arc<Shared>,
    runtime: Option<tokio::runtime::Runtime>,
}

impl Drop for TcpDomain {
    fn drop(&mut self) {
        if let Some(rt) = self.runtime.take() {
            rt.shutdown_background();
        }
    }
}

impl Domain for TcpDomain {
    fn info(&self) -> &ProviderInfo {
        &self.info
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn ep_name(&self, _ep: usize) -> Vec<u8> {
        self.shared.name.to_vec()
    }

    fn av_insert(&self, names: &[Vec<u8>]) -> Result<Vec<FiAddr>> {
        let mut peers = self.shared.peers.lock();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let wire: WireName = match name.as_slice().try_into() {
                Ok(w) => w,
                Err(_) => {
                    out.push(FI_ADDR_NOTAVAIL);
                    continue;
                }
            };
            if let Some(&addr) = peers.by_name.get(&wire) {
                out.push(addr);
                continue;
            }
            let Some((sock, _)) = decode_name(&wire) else {
                out.push(FI_ADDR_NOTAVAIL);
                continue;
            };
            let addr = peers.addrs.len() as FiAddr;
            peers.addrs.push(sock);
            peers.by_name.insert(wire, addr);
            out.push(addr);
        }
        Ok(out)
    }

    fn mr_reg(&self, req: &MrRequest) -> Result<MrHandle> {
        self.shared.regions.lock().register(req).ok_or_else(|| {
            SkeinError::provider(
                TCP_PROV_NAME,
                format!("memory key {} already registered", req.requested_key),
            )
        })
    }

    fn mr_close(&self, mr: &MrHandle) -> Result<()> {
        if self.shared.regions.lock().deregister(mr.remote_key) {
            Ok(())
        } else {
            Err(SkeinError::provider(
                TCP_PROV_NAME,
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
        let state = self.shared.ep(ep)?;
        let (base, rx_ctx) = split_addr(dest);
        let to = self.shared.peer_addr(base)?;
        let payload = if len == 0 {
            Vec::new()
        } else {
            // SAFETY: caller guarantees `buf` covers `len` readable bytes.
            unsafe { std::slice::from_raw_parts(buf as *const u8, len) }.to_vec()
        };
        let frame = Frame::Tagged {
            src: self.shared.name,
            tx_ctx: ep as u32,
            rx_ctx: rx_ctx as u32,
            tag,
            payload,
        };
        self.shared.post(to, &frame)?;
        state
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
        let state = self.shared.ep(ep)?;
        let recv = PostedRecv {
            src,
            tag,
            ignore,
            buf,
            len,
            context,
        };
        // SAFETY: forwarded from the caller.
        unsafe { state.lock().post_recv(recv, peek) };
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
        self.shared.ep(ep)?;
        let (base, _) = split_addr(src);
        let to = self.shared.peer_addr(base)?;
        let req_id = self.shared.next_req.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::ReadReq {
            src: self.shared.name,
            req_id,
            key: remote_key,
            addr: remote_addr,
            len: len as u64,
        };
        let pending = PendingRma {
            kind: RmaKind::Read,
            ep,
            context,
            buf,
            len,
        };
        self.shared.start_rma(pending, to, &frame, req_id)
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
        self.shared.ep(ep)?;
        let (base, _) = split_addr(dest);
        let to = self.shared.peer_addr(base)?;
        let payload = if len == 0 {
            Vec::new()
        } else {
            // SAFETY: caller guarantees `buf` covers `len` readable bytes.
            unsafe { std::slice::from_raw_parts(buf as *const u8, len) }.to_vec()
        };
        let req_id = self.shared.next_req.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::WriteReq {
            src: self.shared.name,
            req_id,
            key: remote_key,
            addr: remote_addr,
            payload,
        };
        let pending = PendingRma {
            kind: RmaKind::Write,
            ep,
            context,
            buf,
            len,
        };
        self.shared.start_rma(pending, to, &frame, req_id)
    }

    fn cancel(&self, ep: usize, context: u64) -> OpResult {
        if self.shared.ep(ep)?.lock().cancel(context) {
            Ok(())
        } else {
            Err(OpError::NotFound)
        }
    }

    fn cq_read(&self, ep: usize, out: &mut Vec<CqEntry>, max: usize) -> CqRead {
        match self.shared.eps.get(ep) {
            Some(e) => e.lock().cq.read(out, max),
            None => CqRead::Again,
        }
    }

    fn cq_readerr(&self, ep: usize) -> Option<CqErrEntry> {
        self.shared.eps.get(ep)?.lock().cq.readerr()
    }
}
