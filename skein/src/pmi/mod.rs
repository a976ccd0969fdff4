//! Out-of-band rendezvous boundary.
//!
//! The transport only needs rank/size, a barrier and a key-value store while
//! bootstrapping. A binding may additionally expose the PMIx-style
//! put/commit/fence/get flow through [`Pmi::pmix`].

mod local;

pub use local::LocalPmi;

use crate::error::{Result, SkeinError};
use crate::types::Rank;

/// Plain key-value rendezvous.
pub trait Pmi: Send + Sync {
    fn rank(&self) -> Rank;

    fn size(&self) -> usize;

    /// Block until every rank arrives.
    fn barrier(&self) -> Result<()>;

    fn kvs_put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Fails with [`SkeinError::KeyNotFound`] when nothing was put under `key`.
    fn kvs_get(&self, key: &str) -> Result<Vec<u8>>;

    /// Refresh rank/size after a process-group change.
    fn update(&self) -> Result<()> {
        Ok(())
    }

    /// Host this rank runs on.
    fn hostname(&self) -> Result<String> {
        local_hostname()
    }

    /// PMIx-style access, when the binding supports it.
    fn pmix(&self) -> Option<&dyn Pmix> {
        None
    }
}

/// PMIx-style rendezvous: puts are staged until `commit` and visible to
/// other ranks after `fence`.
pub trait Pmix: Send + Sync {
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn fence(&self) -> Result<()>;

    fn get(&self, rank: Rank, key: &str) -> Result<Vec<u8>>;
}

/// Host name of this machine.
pub fn local_hostname() -> Result<String> {
    let name = gethostname::gethostname();
    match name.into_string() {
        Ok(s) if !s.is_empty() => Ok(s),
        Ok(_) => Err(SkeinError::Hostname {
            reason: "empty hostname".into(),
        }),
        Err(raw) => Err(SkeinError::Hostname {
            reason: format!("hostname is not valid UTF-8: {raw:?}"),
        }),
    }
}

/// The PMIx view of `pmi`, or a bootstrap error naming `mode`.
pub fn require_pmix<'a>(pmi: &'a dyn Pmi, mode: &str) -> Result<&'a dyn Pmix> {
    pmi.pmix()
        .ok_or_else(|| SkeinError::bootstrap(format!("kvs mode {mode} needs a PMIx binding")))
}

/// `kvs_get` that also checks the value length.
pub fn kvs_get_exact(pmi: &dyn Pmi, key: &str, expected: usize) -> Result<Vec<u8>> {
    let value = pmi.kvs_get(key)?;
    if value.len() != expected {
        return Err(SkeinError::ValueSizeMismatch {
            key: key.to_string(),
            expected,
            actual: value.len(),
        });
    }
    Ok(value)
}
