use super::helpers::{init_tracing, pattern, post_recv, run_local, send_bytes};
use skein::fabric::shm::ShmHub;
use skein::fabric::{
    Caps, CqEntry, CqErrEntry, CqRead, Domain, FabricProvider, FabricVersion, Hints, MrHandle,
    MrMode, MrRequest, OpError, OpResult, OpenParams, ProviderInfo, ProviderKind,
};
use skein::types::FiAddr;
use skein::{AttrIn, Fabric, LocalPmi, Pmi, Request, SkeinConfig, Transport, TransportAttr};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn panic_text(err: Box<dyn std::any::Any + Send>) -> String {
    match err.downcast::<String>() {
        Ok(s) => *s,
        Err(err) => err.downcast_ref::<&str>().map(|s| s.to_string()).unwrap_or_default(),
    }
}

#[test]
fn test_check_on_completed_request_faults() {
    let out = run_local(1, |ctx| {
        let t = ctx.transport;
        let mut buf = vec![0u8; 8];
        let mut req = post_recv(t, 0, &mut buf, 0, 1);
        let data = pattern(8, 0);
        let mut sreq = send_bytes(t, 0, &data, 0, 1);
        assert!(t.wait(0, &mut sreq).is_success());
        assert!(t.wait(0, &mut req).is_success());
        let err = catch_unwind(AssertUnwindSafe(|| t.check(0, &mut req))).unwrap_err();
        panic_text(err)
    });
    assert!(out[0].contains("check on a completed request"), "{}", out[0]);
}

#[test]
fn test_request_reuse_in_flight_faults() {
    let out = run_local(1, |ctx| {
        let t = ctx.transport;
        let mut a = vec![0u8; 8];
        let mut b = vec![0u8; 8];
        let mut req = post_recv(t, 0, &mut a, 0, 1);
        let err = catch_unwind(AssertUnwindSafe(|| {
            // SAFETY: `b` outlives the call, which faults before posting.
            unsafe { t.recv(0, b.as_mut_ptr() as u64, b.len(), 0, 2, &mut req) }
        }))
        .unwrap_err();
        assert!(t.cancel(0, &mut req).is_success());
        panic_text(err)
    });
    assert!(out[0].contains("request reused before completion"), "{}", out[0]);
}

#[test]
fn test_abort_setting_stays_with_its_transport() {
    let out = run_local(1, |ctx| {
        // a later transport in the same process opts into aborting
        let config = SkeinConfig {
            abort_on_throw: true,
            ..SkeinConfig::default()
        };
        let fabric = Arc::new(Fabric::with_shm_hub(&config, ShmHub::new()));
        let pmi: Arc<dyn Pmi> = Arc::new(LocalPmi::group(1).remove(0));
        let mut attr = TransportAttr::default();
        let aborting = Transport::init(fabric, &mut attr, config, pmi).unwrap();

        let t = ctx.transport;
        let mut buf = vec![0u8; 8];
        let mut req = post_recv(t, 0, &mut buf, 0, 4);
        let data = pattern(8, 4);
        let mut sreq = send_bytes(t, 0, &data, 0, 4);
        assert!(t.wait(0, &mut sreq).is_success());
        assert!(t.wait(0, &mut req).is_success());
        let err = catch_unwind(AssertUnwindSafe(|| t.check(0, &mut req))).unwrap_err();
        drop(aborting);
        panic_text(err)
    });
    assert!(out[0].contains("check on a completed request"), "{}", out[0]);
}

/// A network provider whose transmit path is always busy.
struct BusyProvider {
    sends: Arc<AtomicUsize>,
}

impl BusyProvider {
    fn info() -> ProviderInfo {
        ProviderInfo {
            name: "busy".into(),
            kind: ProviderKind::Network,
            nic: Some("busy0".into()),
            caps: Caps::TAGGED | Caps::REMOTE_COMM,
            tag_bits: 64,
            addr_len: 8,
            max_msg_size: 1 << 20,
            mr_mode: MrMode::empty(),
            scalable_ep: false,
            rx_ctx_bits: 0,
            version: FabricVersion::default(),
        }
    }
}

impl FabricProvider for BusyProvider {
    fn name(&self) -> &str {
        "busy"
    }

    fn getinfo(&self, _hints: &Hints) -> Vec<ProviderInfo> {
        vec![Self::info()]
    }

    fn open(&self, info: &ProviderInfo, params: &OpenParams) -> skein::Result<Arc<dyn Domain>> {
        Ok(Arc::new(BusyDomain {
            info: info.clone(),
            id: params.domain_id,
            sends: Arc::clone(&self.sends),
        }))
    }
}

struct BusyDomain {
    info: ProviderInfo,
    id: u64,
    sends: Arc<AtomicUsize>,
}

impl Domain for BusyDomain {
    fn info(&self) -> &ProviderInfo {
        &self.info
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn ep_name(&self, ep: usize) -> Vec<u8> {
        (self.id * 100 + ep as u64).to_le_bytes().to_vec()
    }

    fn av_insert(&self, names: &[Vec<u8>]) -> skein::Result<Vec<FiAddr>> {
        Ok((0..names.len() as u64).collect())
    }

    fn mr_reg(&self, req: &MrRequest) -> skein::Result<MrHandle> {
        Ok(MrHandle {
            addr: req.addr,
            len: req.len,
            local_key: req.requested_key,
            remote_key: req.requested_key,
            hmem: req.hmem,
        })
    }

    fn mr_close(&self, _mr: &MrHandle) -> skein::Result<()> {
        Ok(())
    }

    unsafe fn tsend(&self, _: usize, _: u64, _: usize, _: Option<u64>, _: FiAddr, _: u64, _: u64) -> OpResult {
        self.sends.fetch_add(1, Ordering::SeqCst);
        Err(OpError::Again)
    }

    unsafe fn trecv(
        &self,
        _: usize,
        _: u64,
        _: usize,
        _: Option<u64>,
        _: FiAddr,
        _: u64,
        _: u64,
        _: u64,
        _: bool,
    ) -> OpResult {
        Ok(())
    }

    unsafe fn read(&self, _: usize, _: u64, _: usize, _: Option<u64>, _: FiAddr, _: u64, _: u64, _: u64) -> OpResult {
        Err(OpError::Failed("read unsupported".into()))
    }

    unsafe fn write(&self, _: usize, _: u64, _: usize, _: Option<u64>, _: FiAddr, _: u64, _: u64, _: u64) -> OpResult {
        Err(OpError::Failed("write unsupported".into()))
    }

    fn cancel(&self, _ep: usize, _context: u64) -> OpResult {
        Err(OpError::NotFound)
    }

    fn cq_read(&self, _ep: usize, _out: &mut Vec<CqEntry>, _max: usize) -> CqRead {
        CqRead::Again
    }

    fn cq_readerr(&self, _ep: usize) -> Option<CqErrEntry> {
        None
    }
}

#[test]
fn test_retry_exhaustion_faults() {
    init_tracing();
    let sends = Arc::new(AtomicUsize::new(0));
    let config = SkeinConfig {
        provider: Some("busy".into()),
        max_retry_count: 3,
        ..SkeinConfig::default()
    };
    let mut fabric = Fabric::new(ShmHub::new());
    fabric.register(Arc::new(BusyProvider {
        sends: Arc::clone(&sends),
    }));
    let mut attr = TransportAttr {
        input: AttrIn {
            enable_shm: false,
            ..Default::default()
        },
        ..Default::default()
    };
    let pmi: Arc<dyn Pmi> = Arc::new(LocalPmi::group(1).remove(0));
    let t = Transport::init(Arc::new(fabric), &mut attr, config, pmi).unwrap();
    assert_eq!(t.providers().provs[0].info().name, "busy");

    let data = [0u8; 16];
    let mut req = Request::new();
    let err = catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: `data` outlives the call; the provider never reads it.
        unsafe { t.send(0, data.as_ptr() as u64, data.len(), 0, 1, &mut req) }
    }))
    .unwrap_err();
    assert!(panic_text(err).contains("still busy after 3 retries"));
    assert_eq!(sends.load(Ordering::SeqCst), 4);
    assert!(!req.in_flight());
}
