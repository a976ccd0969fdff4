use skein::fabric::shm::ShmHub;
use skein::{Fabric, LocalPmi, Pmi, Request, SkeinConfig, Transport, TransportAttr};
use std::sync::Arc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One rank's view inside [`run_ranks`].
pub struct RankCtx<'a> {
    pub transport: &'a Transport,
    pub pmi: &'a dyn Pmi,
    pub attr: &'a TransportAttr,
}

impl RankCtx<'_> {
    pub fn rank(&self) -> u32 {
        self.transport.rank()
    }

    pub fn barrier(&self) {
        self.pmi.barrier().unwrap();
    }
}

/// Run `f` on one thread per handle of `pmis`, giving each its own fabric
/// over a shared shm hub. Every rank initializes, runs `f`, meets the
/// others at a barrier and finalizes.
pub fn run_ranks<F, R>(pmis: Vec<LocalPmi>, config: SkeinConfig, attr: TransportAttr, f: F) -> Vec<R>
where
    F: Fn(&RankCtx<'_>) -> R + Send + Sync + 'static,
    R: Send + 'static,
{
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = SkeinConfig {
        shm_dir: dir.path().to_path_buf(),
        ..config
    };
    let hub = ShmHub::new();
    let f = Arc::new(f);

    let handles: Vec<_> = pmis
        .into_iter()
        .map(|pmi| {
            let hub = Arc::clone(&hub);
            let config = config.clone();
            let mut attr = attr.clone();
            let f = Arc::clone(&f);
            std::thread::spawn(move || {
                let fabric = Arc::new(Fabric::with_shm_hub(&config, hub));
                let pmi: Arc<dyn Pmi> = Arc::new(pmi);
                let mut transport =
                    Transport::init(fabric, &mut attr, config, Arc::clone(&pmi)).unwrap();
                let out = f(&RankCtx {
                    transport: &transport,
                    pmi: pmi.as_ref(),
                    attr: &attr,
                });
                pmi.barrier().unwrap();
                assert!(transport.finalize().is_success());
                out
            })
        })
        .collect();
    let out = handles.into_iter().map(|h| h.join().unwrap()).collect();
    drop(dir);
    out
}

/// Ranks `0..size` on this machine, default config and attributes.
pub fn run_local<F, R>(size: usize, f: F) -> Vec<R>
where
    F: Fn(&RankCtx<'_>) -> R + Send + Sync + 'static,
    R: Send + 'static,
{
    run_ranks(LocalPmi::group(size), SkeinConfig::default(), TransportAttr::default(), f)
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

pub fn send_bytes(t: &Transport, ep: usize, data: &[u8], peer: u32, tag: u64) -> Request {
    let mut req = Request::new();
    // SAFETY: callers wait on the request before `data` goes out of scope.
    let status = unsafe { t.send(ep, data.as_ptr() as u64, data.len(), peer, tag, &mut req) };
    assert!(status.is_success(), "send to {peer} failed");
    req
}

pub fn post_recv(t: &Transport, ep: usize, buf: &mut [u8], peer: u32, tag: u64) -> Request {
    let mut req = Request::new();
    // SAFETY: callers wait on the request before `buf` goes out of scope.
    let status = unsafe { t.recv(ep, buf.as_mut_ptr() as u64, buf.len(), peer, tag, &mut req) };
    assert!(status.is_success(), "recv from {peer} failed");
    req
}
