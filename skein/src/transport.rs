//! The public transport: bootstrap, data operations and progress.
//!
//! Data operations take raw `u64` buffer addresses, as the providers do, and
//! return a [`Status`]. An operation that is issued leaves its handle in the
//! caller's [`Request`]; the buffer must stay valid until `wait`, `check`
//! or `cancel` reports the request completed.

use crate::addr::{AddressTable, ExchangeCtx, ProvSlot, resolve_addresses};
use crate::config::{SkeinConfig, TransportAttr};
use crate::coord::ProcessCoordinate;
use crate::dispatch::{DispatchTable, Locality, Route, ShmCaps};
use crate::error::{Result, SkeinError, Status};
use crate::fabric::{Caps, CqErrKind, Fabric, MrMode, OpError, OpResult};
use crate::mr::{MemoryRegion, MrCache, MrKeys, RegisteredMr};
use crate::pmi::Pmi;
use crate::progress::EpView;
use crate::registry::{Endpoint, ProviderSet, open_providers};
use crate::request::{ProviderReq, ReqState, Request, RequestTable, Token};
use crate::types::{FiAddr, ProgressMode, Rank};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// Result of [`Transport::probe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProbeOutcome {
    pub found: bool,
    /// Size of the matched message when `found`.
    pub recv_len: usize,
}

#[derive(Debug)]
struct AddrState {
    tables: Vec<AddressTable>,
    rank2proc: Vec<usize>,
    served_init_map: bool,
}

/// Transport context of one process.
pub struct Transport {
    fabric: Arc<Fabric>,
    pmi: Arc<dyn Pmi>,
    config: SkeinConfig,
    coord: RwLock<ProcessCoordinate>,
    set: ProviderSet,
    dispatch: DispatchTable,
    requests: Vec<RequestTable>,
    mr_caches: Vec<Mutex<MrCache>>,
    mr_keys: Arc<MrKeys>,
    addrs: Mutex<AddrState>,
    finalized: bool,
}

impl Transport {
    /// Bootstrap: resolve coordinates, open providers, exchange addresses.
    ///
    /// Collective over every rank of `pmi`. On success `attr.output` holds
    /// what was enabled.
    pub fn init(
        fabric: Arc<Fabric>,
        attr: &mut TransportAttr,
        config: SkeinConfig,
        pmi: Arc<dyn Pmi>,
    ) -> Result<Self> {
        let coord = ProcessCoordinate::exchange(pmi.as_ref(), fabric.next_call_id())?;
        tracing::debug!(
            rank = coord.global_idx,
            size = coord.global_count,
            local_idx = coord.local_idx,
            local_count = coord.local_count,
            host = %coord.host,
            "resolved coordinates"
        );

        let set = open_providers(&fabric, &coord, attr, &config)?;
        let ep_count = attr.input.ep_count;

        let shm_caps = set.provs.iter().find(|p| p.is_shm()).map(|p| ShmCaps {
            max_msg_size: p.info().max_msg_size,
            hmem: p.info().caps.contains(Caps::HMEM),
        });
        let dispatch = DispatchTable::build(shm_caps, set.open_nw_provs && set.nw_prov_count > 0);

        let tables = set
            .provs
            .iter()
            .map(|p| AddressTable::for_domain(p.domain.as_ref(), ep_count))
            .collect();
        let mr_keys = Arc::new(MrKeys::default());
        let transport = Self {
            requests: (0..ep_count).map(RequestTable::new).collect(),
            mr_caches: (0..ep_count)
                .map(|_| Mutex::new(MrCache::new(config.mr_cache, Arc::clone(&mr_keys))))
                .collect(),
            mr_keys,
            fabric,
            pmi,
            config,
            coord: RwLock::new(coord),
            set,
            dispatch,
            addrs: Mutex::new(AddrState {
                tables,
                rank2proc: Vec::new(),
                served_init_map: false,
            }),
            finalized: false,
        };

        {
            let coord = transport.coord();
            let mut addrs = transport.addrs.lock();
            transport.exchange(&coord, &mut addrs)?;
        }
        tracing::info!(rank = transport.rank(), "transport initialized: {transport}");
        Ok(transport)
    }

    /// [`init`](Self::init) reporting a [`Status`].
    pub fn init_status(
        fabric: Arc<Fabric>,
        attr: &mut TransportAttr,
        config: SkeinConfig,
        pmi: Arc<dyn Pmi>,
    ) -> (Status, Option<Self>) {
        match Self::init(fabric, attr, config, pmi) {
            Ok(t) => (Status::Success, Some(t)),
            Err(e) => {
                tracing::error!("transport init failed: {e}");
                (Status::Failure, None)
            }
        }
    }

    pub fn rank(&self) -> Rank {
        self.coord.read().global_idx as Rank
    }

    pub fn size(&self) -> usize {
        self.coord.read().global_count
    }

    pub fn coord(&self) -> ProcessCoordinate {
        self.coord.read().clone()
    }

    pub fn ep_count(&self) -> usize {
        self.set.eps.len()
    }

    pub fn progress_mode(&self) -> ProgressMode {
        self.set.progress_mode
    }

    pub fn providers(&self) -> &ProviderSet {
        &self.set
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Re-resolve coordinates and addresses after a process-group change.
    pub fn update(&self) -> Status {
        Status::from_result("update", &self.update_inner())
    }

    fn update_inner(&self) -> Result<()> {
        self.ensure_live()?;
        self.pmi.barrier()?;
        self.pmi.update()?;
        let coord = ProcessCoordinate::exchange(self.pmi.as_ref(), self.fabric.next_call_id())?;
        if self.set.prov_count() == 1 && self.set.provs[0].is_shm() {
            ensure_or_fatal!(
                self.config.abort_on_throw,
                coord.single_node(),
                "shm-only transport spans hosts after update (local {}, global {})",
                coord.local_count,
                coord.global_count
            );
        }
        *self.coord.write() = coord.clone();

        let mut addrs = self.addrs.lock();
        self.exchange(&coord, &mut addrs)?;
        tracing::info!(rank = self.rank(), size = self.size(), "transport updated");
        Ok(())
    }

    /// Release every provider resource. A second call is a fault.
    pub fn finalize(&mut self) -> Status {
        ensure_or_fatal!(
            self.config.abort_on_throw,
            !self.finalized,
            "transport finalized twice"
        );
        self.finalized = true;

        for cache in &self.mr_caches {
            cache.lock().clear();
        }
        let live: usize = self.requests.iter().map(RequestTable::live).sum();
        if live > 0 {
            tracing::warn!(live, "finalizing with operations in flight");
        }
        let provs = self.set.provs.len();
        self.set.provs.clear();
        tracing::info!(provs, "transport finalized");
        Status::Success
    }

    fn ensure_live(&self) -> Result<()> {
        if self.finalized {
            return Err(SkeinError::AlreadyFinalized);
        }
        Ok(())
    }

    /// Must not touch the coordinate lock: callers hold the address lock.
    fn exchange(&self, coord: &ProcessCoordinate, addrs: &mut AddrState) -> Result<()> {
        let ctx = ExchangeCtx {
            pmi: self.pmi.as_ref(),
            coord,
            kvs_mode: self.config.kvs_mode,
            shm_dir: &self.config.shm_dir,
            call_id: self.fabric.next_call_id(),
            hostname_sharing: self.config.hostname_sharing,
        };
        let mut slots: Vec<ProvSlot<'_>> = self
            .set
            .provs
            .iter()
            .zip(addrs.tables.iter_mut())
            .map(|(p, table)| ProvSlot {
                domain: p.domain.as_ref(),
                table,
            })
            .collect();
        addrs.rank2proc = resolve_addresses(&ctx, &mut slots)?;
        // peers must have inserted our names before anyone sends
        self.pmi.barrier()?;
        Ok(())
    }

    /// Rank-to-process map. The first call returns the map built at init,
    /// later calls run a fresh collective exchange.
    pub fn get_rank2proc_map(&self) -> Result<Vec<usize>> {
        self.ensure_live()?;
        let coord = self.coord();
        let mut addrs = self.addrs.lock();
        if !addrs.served_init_map {
            addrs.served_init_map = true;
            return Ok(addrs.rank2proc.clone());
        }
        self.exchange(&coord, &mut addrs)?;
        Ok(addrs.rank2proc.clone())
    }

    /// Register `[buf, buf + len)` for one-sided access on every provider.
    pub fn mr_reg(&self, buf: u64, len: usize) -> Result<RegisteredMr> {
        self.ensure_live()?;
        let key = self.mr_keys.next();
        let hmem = self.fabric.device_memory().query(buf, len);
        let mut regions = Vec::with_capacity(self.set.prov_count());
        for prov in &self.set.provs {
            let region = MemoryRegion::register(&prov.domain, buf, len, key, hmem)?;
            if prov.info().mr_mode.contains(MrMode::ENDPOINT) {
                for ep in self.set.eps.iter().filter(|e| e.active.contains(&prov.idx)) {
                    prov.domain.mr_bind(region.handle(), ep.idx)?;
                }
            }
            regions.push(region);
        }
        let first = regions
            .first()
            .ok_or_else(|| SkeinError::no_provider("no provider to register memory on"))?;
        Ok(RegisteredMr {
            buf,
            len,
            local_key: first.local_key(),
            remote_key: first.remote_key(),
            regions,
        })
    }

    pub fn mr_dereg(&self, mr: RegisteredMr) -> Status {
        Status::from_result("mr_dereg", &mr.close())
    }

    /// Tagged send of `len` bytes at `buf` to `peer`.
    ///
    /// # Safety
    /// `buf` must be valid for reads of `len` bytes until `req` completes.
    pub unsafe fn send(
        &self,
        ep: usize,
        buf: u64,
        len: usize,
        peer: Rank,
        tag: u64,
        req: &mut Request,
    ) -> Status {
        let res = self.issue(ep, buf, len, peer, req, "send", |p, desc, addr, token| {
            let domain = &self.set.provs[p].domain;
            // SAFETY: the caller keeps `buf` alive until completion.
            unsafe { domain.tsend(ep, buf, len, desc, addr, tag, token.context()) }
        });
        Status::from_result("send", &res)
    }

    /// Tagged receive into `buf` from `peer`.
    ///
    /// # Safety
    /// `buf` must be valid for writes of `len` bytes until `req` completes.
    pub unsafe fn recv(
        &self,
        ep: usize,
        buf: u64,
        len: usize,
        peer: Rank,
        tag: u64,
        req: &mut Request,
    ) -> Status {
        let res = self.issue(ep, buf, len, peer, req, "recv", |p, desc, addr, token| {
            let domain = &self.set.provs[p].domain;
            // SAFETY: the caller keeps `buf` alive until completion.
            unsafe { domain.trecv(ep, buf, len, desc, addr, tag, 0, token.context(), false) }
        });
        Status::from_result("recv", &res)
    }

    /// One-sided read of `peer`'s registered memory into `buf`.
    ///
    /// # Safety
    /// `buf` must lie inside `local_mr` and stay valid until `req` completes.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn read(
        &self,
        ep: usize,
        buf: u64,
        len: usize,
        local_mr: &RegisteredMr,
        remote_addr: u64,
        remote_key: u64,
        peer: Rank,
        req: &mut Request,
    ) -> Status {
        let res = self.issue_rma(ep, buf, len, local_mr, peer, req, "read", |p, desc, addr, token| {
            let domain = &self.set.provs[p].domain;
            // SAFETY: the caller keeps `buf` alive until completion.
            unsafe { domain.read(ep, buf, len, desc, addr, remote_addr, remote_key, token.context()) }
        });
        Status::from_result("read", &res)
    }

    /// One-sided write of `buf` into `peer`'s registered memory.
    ///
    /// # Safety
    /// `buf` must lie inside `local_mr` and stay valid until `req` completes.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn write(
        &self,
        ep: usize,
        buf: u64,
        len: usize,
        local_mr: &RegisteredMr,
        remote_addr: u64,
        remote_key: u64,
        peer: Rank,
        req: &mut Request,
    ) -> Status {
        let res = self.issue_rma(ep, buf, len, local_mr, peer, req, "write", |p, desc, addr, token| {
            let domain = &self.set.provs[p].domain;
            // SAFETY: the caller keeps `buf` alive until completion.
            unsafe { domain.write(ep, buf, len, desc, addr, remote_addr, remote_key, token.context()) }
        });
        Status::from_result("write", &res)
    }

    #[allow(clippy::too_many_arguments)]
    fn issue(
        &self,
        ep: usize,
        buf: u64,
        len: usize,
        peer: Rank,
        req: &mut Request,
        what: &str,
        op: impl Fn(usize, Option<u64>, FiAddr, Token) -> OpResult,
    ) -> Result<()> {
        self.ensure_live()?;
        ensure_or_fatal!(
            self.config.abort_on_throw,
            !req.in_flight(),
            "{what}: request reused before completion"
        );
        let endpoint = self.endpoint(ep)?;
        let (prov, addr) = self.select(endpoint, peer, buf, len)?;

        let domain = &self.set.provs[prov].domain;
        let mr = self.mr_cache(ep).lock().get(
            ep,
            domain,
            self.fabric.device_memory(),
            buf,
            len,
        )?;
        let desc = mr.as_ref().map(|m| m.local_key());
        let token = self.requests[ep].acquire(
            ReqState::Posted,
            ProviderReq::new(prov, self.set.provs[prov].is_shm(), mr),
        )?;

        if let Err(e) = self.retry(endpoint, prov, what, || op(prov, desc, addr, token)) {
            self.requests[ep].release(token);
            return Err(e);
        }
        tracing::trace!(ep, peer, len, prov, what, "issued");
        Self::arm(req, ep, token);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn issue_rma(
        &self,
        ep: usize,
        buf: u64,
        len: usize,
        local_mr: &RegisteredMr,
        peer: Rank,
        req: &mut Request,
        what: &str,
        op: impl Fn(usize, Option<u64>, FiAddr, Token) -> OpResult,
    ) -> Result<()> {
        self.ensure_live()?;
        ensure_or_fatal!(
            self.config.abort_on_throw,
            !req.in_flight(),
            "{what}: request reused before completion"
        );
        let in_region = buf >= local_mr.buf
            && buf
                .checked_add(len as u64)
                .is_some_and(|end| end <= local_mr.buf + local_mr.len as u64);
        if !in_region {
            return Err(SkeinError::InvalidArgument(format!(
                "{what}: buffer is outside the local registration"
            )));
        }
        let endpoint = self.endpoint(ep)?;
        let (prov, addr) = self.select(endpoint, peer, buf, len)?;
        let desc = Some(local_mr.local_key);
        let token = self.requests[ep].acquire(
            ReqState::Posted,
            ProviderReq::new(prov, self.set.provs[prov].is_shm(), None),
        )?;
        if let Err(e) = self.retry(endpoint, prov, what, || op(prov, desc, addr, token)) {
            self.requests[ep].release(token);
            return Err(e);
        }
        Self::arm(req, ep, token);
        Ok(())
    }

    fn arm(req: &mut Request, ep: usize, token: Token) {
        req.token = Some(token);
        req.ep = ep;
        req.is_completed = false;
        req.recv_len = 0;
    }

    /// Issue `op`, progressing the endpoint while the provider is busy.
    fn retry(
        &self,
        ep: &Endpoint,
        prov: usize,
        what: &str,
        mut op: impl FnMut() -> OpResult,
    ) -> Result<()> {
        let max = self.config.max_retry_count;
        for _ in 0..=max {
            match op() {
                Ok(()) => return Ok(()),
                Err(OpError::Again) => self.view(ep).progress()?,
                Err(e) => {
                    return Err(SkeinError::provider(
                        &self.set.provs[prov].info().name,
                        format!("{what}: {e}"),
                    ));
                }
            }
        }
        fatal!(
            self.config.abort_on_throw,
            "{what} on ep {} (prov {}): provider still busy after {max} retries",
            ep.idx,
            self.set.provs[prov].info().name
        );
    }

    fn endpoint(&self, ep: usize) -> Result<&Endpoint> {
        self.set.eps.get(ep).ok_or_else(|| {
            SkeinError::InvalidArgument(format!("endpoint {ep} of {}", self.set.eps.len()))
        })
    }

    fn mr_cache(&self, ep: usize) -> &Mutex<MrCache> {
        &self.mr_caches[ep % self.mr_caches.len()]
    }

    fn view<'a>(&'a self, ep: &'a Endpoint) -> EpView<'a> {
        EpView {
            ep,
            provs: &self.set.provs,
            requests: &self.requests[ep.idx],
            mr_cache: self.mr_cache(ep.idx),
            abort_on_throw: self.config.abort_on_throw,
        }
    }

    /// Provider and peer address for an operation.
    fn select(&self, ep: &Endpoint, peer: Rank, buf: u64, len: usize) -> Result<(usize, FiAddr)> {
        let local = self.peer_local_idx(peer)?;
        let locality = if local.is_some() {
            Locality::SameHost
        } else {
            Locality::Remote
        };
        let device = self.fabric.device_memory().query(buf, len).is_device();
        let route = self
            .dispatch
            .route(locality, len, device)
            .ok_or(SkeinError::UnknownPeer { rank: peer })?;
        let prov = match route {
            Route::Shm => ep.shm_prov(&self.set.provs),
            Route::Network => ep.nw_prov(&self.set.provs),
        }
        .ok_or_else(|| SkeinError::no_provider(format!("endpoint {} has no {route:?} provider", ep.idx)))?;
        let addr = self.lookup(prov, ep.idx, peer, local)?;
        Ok((prov, addr))
    }

    /// Local index of `peer`, `None` when it runs on another host.
    fn peer_local_idx(&self, peer: Rank) -> Result<Option<usize>> {
        let coord = self.coord.read();
        if peer as usize >= coord.global_count {
            return Err(SkeinError::UnknownPeer { rank: peer });
        }
        Ok(coord.local_of(peer))
    }

    fn lookup(&self, prov: usize, ep: usize, peer: Rank, local: Option<usize>) -> Result<FiAddr> {
        let addrs = self.addrs.lock();
        let table = &addrs.tables[prov];
        let proc = if table.is_shm() {
            local
        } else {
            table.proc_of(peer as usize)
        };
        proc.and_then(|p| table.lookup(p, ep))
            .ok_or(SkeinError::UnknownPeer { rank: peer })
    }

    /// Check for a matching message from `peer` on every active provider
    /// without receiving it.
    pub fn probe(&self, ep: usize, peer: Rank, tag: u64) -> Result<ProbeOutcome> {
        self.ensure_live()?;
        tracing::debug!(ep, peer, tag, "probe: legacy multi-provider peek path");
        let endpoint = self.endpoint(ep)?;
        let requests = &self.requests[ep];
        let mut peeks: Vec<(usize, Token)> = Vec::with_capacity(endpoint.active.len());

        let result = self.probe_peeks(endpoint, peer, tag, &mut peeks);
        for &(_, token) in &peeks {
            requests.release(token);
        }
        result
    }

    fn probe_peeks(
        &self,
        ep: &Endpoint,
        peer: Rank,
        tag: u64,
        peeks: &mut Vec<(usize, Token)>,
    ) -> Result<ProbeOutcome> {
        let requests = &self.requests[ep.idx];
        let local = self.peer_local_idx(peer)?;
        for &prov in &ep.active {
            let ctx = &self.set.provs[prov];
            if ctx.is_shm() && local.is_none() {
                continue;
            }
            let src = self.lookup(prov, ep.idx, peer, local)?;
            let token = requests.acquire(
                ReqState::PeekStarted,
                ProviderReq::new(prov, ctx.is_shm(), None),
            )?;
            peeks.push((prov, token));
            self.retry(ep, prov, "probe", || {
                // SAFETY: a peek never writes to its buffer.
                unsafe { ctx.domain.trecv(ep.idx, 0, 0, None, src, tag, 0, token.context(), true) }
            })?;
        }
        if peeks.is_empty() {
            return Err(SkeinError::UnknownPeer { rank: peer });
        }

        let view = self.view(ep);
        let resolved = |s: Option<(ReqState, usize)>| {
            matches!(
                s,
                Some((ReqState::PeekFound | ReqState::PeekNotFound | ReqState::Failed(_), _))
            )
        };
        while !peeks.iter().any(|&(_, t)| resolved(requests.state(t))) {
            view.progress()?;
        }

        let mut outcome = ProbeOutcome::default();
        for &(prov, token) in peeks.iter() {
            match requests.state(token) {
                Some((ReqState::Failed(kind), _)) => {
                    return Err(SkeinError::provider(
                        &self.set.provs[prov].info().name,
                        format!("probe completion error {kind:?}"),
                    ));
                }
                Some((ReqState::PeekFound, len)) if !outcome.found => {
                    outcome = ProbeOutcome {
                        found: true,
                        recv_len: len,
                    };
                }
                Some((ReqState::PeekStarted, _)) => {
                    match self.set.provs[prov].domain.cancel(ep.idx, token.context()) {
                        Ok(()) => view.wait_cancel_cq(prov, token)?,
                        Err(OpError::NotFound) => {}
                        Err(e) => {
                            return Err(SkeinError::provider(
                                &self.set.provs[prov].info().name,
                                format!("probe cancel: {e}"),
                            ));
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(outcome)
    }

    /// Block until `req` completes.
    pub fn wait(&self, ep: usize, req: &mut Request) -> Status {
        Status::from_result("wait", &self.wait_inner(ep, req))
    }

    fn wait_inner(&self, ep: usize, req: &mut Request) -> Result<()> {
        self.ensure_live()?;
        if req.is_completed {
            return Ok(());
        }
        let (endpoint, token) = self.request_token(ep, req)?;
        let view = self.view(endpoint);
        loop {
            match self.requests[ep].state(token) {
                Some((ReqState::Completed, len)) => {
                    self.finish(ep, req, token, len);
                    return Ok(());
                }
                Some((ReqState::Failed(kind), _)) => return Err(self.fail(ep, req, token, kind)),
                Some(_) => view.progress()?,
                None => return Err(SkeinError::InvalidArgument("request handle is stale".into())),
            }
        }
    }

    /// Wait for every request, stopping at the first failure.
    pub fn wait_all(&self, ep: usize, reqs: &mut [Request]) -> Status {
        for req in reqs.iter_mut() {
            let status = self.wait(ep, req);
            if !status.is_success() {
                return status;
            }
        }
        Status::Success
    }

    /// Non-blocking completion check. In check mode this progresses the
    /// endpoint first. Checking a completed request is a fault.
    pub fn check(&self, ep: usize, req: &mut Request) -> Status {
        ensure_or_fatal!(
            self.config.abort_on_throw,
            !req.is_completed,
            "check on a completed request"
        );
        Status::from_result("check", &self.check_inner(ep, req))
    }

    fn check_inner(&self, ep: usize, req: &mut Request) -> Result<()> {
        self.ensure_live()?;
        let (endpoint, token) = self.request_token(ep, req)?;
        if self.set.progress_mode == ProgressMode::Check
            && matches!(self.requests[ep].state(token), Some((ReqState::Posted, _)))
        {
            self.view(endpoint).progress()?;
        }
        match self.requests[ep].state(token) {
            Some((ReqState::Completed, len)) => self.finish(ep, req, token, len),
            Some((ReqState::Failed(kind), _)) => return Err(self.fail(ep, req, token, kind)),
            _ => {}
        }
        Ok(())
    }

    /// Drive completions of `ep`; a no-op outside poll mode.
    pub fn poll(&self, ep: usize) -> Status {
        Status::from_result("poll", &self.poll_inner(ep))
    }

    fn poll_inner(&self, ep: usize) -> Result<()> {
        self.ensure_live()?;
        if self.set.progress_mode != ProgressMode::Poll {
            return Ok(());
        }
        let endpoint = self.endpoint(ep)?;
        self.view(endpoint).progress()
    }

    /// Cancel a pending operation, blocking until the provider confirms.
    pub fn cancel(&self, ep: usize, req: &mut Request) -> Status {
        Status::from_result("cancel", &self.cancel_inner(ep, req))
    }

    fn cancel_inner(&self, ep: usize, req: &mut Request) -> Result<()> {
        self.ensure_live()?;
        if req.is_completed {
            return Ok(());
        }
        let (endpoint, token) = self.request_token(ep, req)?;
        let table = &self.requests[ep];
        let Some(prov) = table.prov(token) else {
            return Err(SkeinError::InvalidArgument("request handle is stale".into()));
        };
        match self.set.provs[prov].domain.cancel(ep, token.context()) {
            Ok(()) => {
                self.view(endpoint).wait_cancel_cq(prov, token)?;
                if let Some(mr) = table.set_state(token, ReqState::Completed) {
                    self.mr_cache(ep).lock().push(mr);
                }
                self.finish(ep, req, token, 0);
                tracing::debug!(ep, "request canceled");
                Ok(())
            }
            // already matched; its completion arrives through progress
            Err(OpError::NotFound) => Ok(()),
            Err(e) => Err(SkeinError::provider(
                &self.set.provs[prov].info().name,
                format!("cancel: {e}"),
            )),
        }
    }

    fn request_token(&self, ep: usize, req: &Request) -> Result<(&Endpoint, Token)> {
        let endpoint = self.endpoint(ep)?;
        let token = req
            .token
            .ok_or_else(|| SkeinError::InvalidArgument("request was never issued".into()))?;
        if token.ep() != ep {
            return Err(SkeinError::InvalidArgument(format!(
                "request belongs to endpoint {}, not {ep}",
                token.ep()
            )));
        }
        Ok((endpoint, token))
    }

    fn finish(&self, ep: usize, req: &mut Request, token: Token, recv_len: usize) {
        req.is_completed = true;
        req.recv_len = recv_len;
        req.token = None;
        self.requests[ep].release(token);
    }

    /// Retire a request whose operation failed; the handle becomes reusable.
    fn fail(&self, ep: usize, req: &mut Request, token: Token, kind: CqErrKind) -> SkeinError {
        let prov = self.requests[ep]
            .prov(token)
            .map_or_else(|| "unknown".to_string(), |p| self.set.provs[p].info().name.clone());
        self.finish(ep, req, token, 0);
        SkeinError::provider(prov, format!("completion error {kind:?}"))
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = &self.set;
        write!(
            f,
            "skein: prov_count {}, nw_prov_count {}, nw_prov_first_idx {}, mnic_type {}",
            s.prov_count(),
            s.nw_prov_count,
            s.nw_prov_first_idx,
            s.mnic_type
        )?;
        if !s.mnic_include.is_empty() {
            write!(f, ", mnic_include_names {}", s.mnic_include.join(","))?;
        }
        if !s.mnic_exclude.is_empty() {
            write!(f, ", mnic_exclude_names {}", s.mnic_exclude.join(","))?;
        }
        write!(
            f,
            ", mnic_count {}, mnic_offset {}, max_retry_count {}, progress_mode {}, hmem {}, kvs_mode {}, mr_cache {}",
            s.mnic_count,
            s.mnic_offset,
            self.config.max_retry_count,
            s.progress_mode,
            s.enable_hmem,
            self.config.kvs_mode,
            self.config.mr_cache
        )?;
        for p in &s.provs {
            write!(f, "\n  prov {}: {}", p.idx, p.info().name)?;
            if let Some(nic) = &p.info().nic {
                write!(f, " ({nic})")?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("rank", &self.rank())
            .field("set", &self.set)
            .field("finalized", &self.finalized)
            .finish()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if !self.finalized {
            self.finalize();
        }
    }
}
