use super::helpers::init_tracing;
use skein::addr::shm_exchange::{RANK_ADDRS_KEY, SEGMENT_PREFIX};
use skein::fabric::shm::ShmHub;
use skein::{
    Fabric, KvsMode, LocalPmi, Pmi, Pmix, Rank, Result, SkeinConfig, SkeinError, Transport,
    TransportAttr,
};
use std::path::Path;
use std::sync::Arc;

#[derive(Clone, Copy)]
enum Tamper {
    Truncate,
    Drop,
}

/// Rendezvous that corrupts values under keys starting with `prefix`.
struct TamperedPmi {
    inner: LocalPmi,
    prefix: &'static str,
    tamper: Tamper,
}

impl TamperedPmi {
    fn filter(&self, key: &str, value: Result<Vec<u8>>) -> Result<Vec<u8>> {
        if !key.starts_with(self.prefix) {
            return value;
        }
        match self.tamper {
            Tamper::Truncate => value.map(|mut v| {
                v.truncate(v.len() / 2);
                v
            }),
            Tamper::Drop => Err(SkeinError::KeyNotFound {
                key: key.to_string(),
            }),
        }
    }
}

impl Pmi for TamperedPmi {
    fn rank(&self) -> Rank {
        self.inner.rank()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn barrier(&self) -> Result<()> {
        self.inner.barrier()
    }

    fn kvs_put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.inner.kvs_put(key, value)
    }

    fn kvs_get(&self, key: &str) -> Result<Vec<u8>> {
        self.filter(key, self.inner.kvs_get(key))
    }

    fn hostname(&self) -> Result<String> {
        self.inner.hostname()
    }

    fn pmix(&self) -> Option<&dyn Pmix> {
        Some(self)
    }
}

impl Pmix for TamperedPmi {
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        Pmix::put(&self.inner, key, value)
    }

    fn commit(&self) -> Result<()> {
        self.inner.commit()
    }

    fn fence(&self) -> Result<()> {
        self.inner.fence()
    }

    fn get(&self, rank: Rank, key: &str) -> Result<Vec<u8>> {
        self.filter(key, Pmix::get(&self.inner, rank, key))
    }
}

fn segments_left(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name.starts_with(SEGMENT_PREFIX))
                .collect()
        })
        .unwrap_or_default()
}

/// Initialize `size` ranks whose rendezvous tampers with `prefix` keys;
/// returns every rank's init error.
fn init_failures(
    size: usize,
    kvs_mode: KvsMode,
    prefix: &'static str,
    tamper: Tamper,
    shm_dir: &Path,
) -> Vec<SkeinError> {
    init_tracing();
    let config = SkeinConfig {
        kvs_mode,
        shm_dir: shm_dir.to_path_buf(),
        ..SkeinConfig::default()
    };
    let hub = ShmHub::new();
    let handles: Vec<_> = LocalPmi::group(size)
        .into_iter()
        .map(|inner| {
            let hub = Arc::clone(&hub);
            let config = config.clone();
            std::thread::spawn(move || {
                let fabric = Arc::new(Fabric::with_shm_hub(&config, hub));
                let pmi: Arc<dyn Pmi> = Arc::new(TamperedPmi {
                    inner,
                    prefix,
                    tamper,
                });
                let mut attr = TransportAttr::default();
                match Transport::init(fabric, &mut attr, config, pmi) {
                    Ok(_) => panic!("init succeeded over a tampered rendezvous"),
                    Err(e) => e,
                }
            })
        })
        .collect();
    let errors = handles.into_iter().map(|h| h.join().unwrap()).collect();
    // the failed transports closed their domains
    assert!(hub.is_empty());
    errors
}

#[test]
fn test_shm_exchange_size_mismatch_unlinks_segment() {
    let dir = tempfile::tempdir().unwrap();
    let errors = init_failures(2, KvsMode::PmixShm, RANK_ADDRS_KEY, Tamper::Truncate, dir.path());
    for e in &errors {
        assert!(matches!(e, SkeinError::ValueSizeMismatch { key, .. } if key.starts_with(RANK_ADDRS_KEY)), "{e}");
    }
    assert!(segments_left(dir.path()).is_empty());
}

#[test]
fn test_shm_exchange_missing_key_unlinks_segment() {
    let dir = tempfile::tempdir().unwrap();
    let errors = init_failures(2, KvsMode::PmixShm, RANK_ADDRS_KEY, Tamper::Drop, dir.path());
    for e in &errors {
        assert!(matches!(e, SkeinError::KeyNotFound { .. }), "{e}");
    }
    assert!(segments_left(dir.path()).is_empty());
}

#[test]
fn test_direct_exchange_size_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let errors = init_failures(2, KvsMode::Pmi, "SKEIN_FI_ADDR", Tamper::Truncate, dir.path());
    for e in &errors {
        assert!(matches!(e, SkeinError::ValueSizeMismatch { .. }), "{e}");
    }
}

#[test]
fn test_direct_exchange_missing_key() {
    let dir = tempfile::tempdir().unwrap();
    let errors = init_failures(1, KvsMode::Pmix, "SKEIN_FI_ADDR", Tamper::Drop, dir.path());
    assert!(matches!(&errors[0], SkeinError::KeyNotFound { .. }), "{}", errors[0]);
}

#[test]
fn test_segment_allocation_failure() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("no-such-dir");
    // nothing is tampered with; the segment directory does not exist
    let errors = init_failures(1, KvsMode::PmixShm, "unused-", Tamper::Drop, &missing);
    assert!(matches!(&errors[0], SkeinError::SharedMemory { .. }), "{}", errors[0]);
    assert!(!missing.exists());
}
