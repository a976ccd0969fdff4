//! Node-local shared-memory address exchange.
//!
//! Segment layout, `rec = total_named_eps * slot` bytes per rank:
//!
//! ```text
//! [header: HEADER_LEN][local region: local_count * rec][global region: global_count * rec]
//! ```
//!
//! The header holds the barrier counters. Local ranks write their record
//! into the local region, publish it once through PMIx, then split the
//! fetch of all global records between them (rank `r` is fetched by local
//! rank `r % local_count`). After a second local barrier every rank reads
//! the complete global region.

use super::{ExchangeCtx, ProvSlot};
use crate::error::{Result, SkeinError};
use crate::pmi::require_pmix;
use crate::types::Rank;
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub const HEADER_LEN: usize = 64;
pub const SEGMENT_PREFIX: &str = "skein-rank2proc-eps-shm-";
pub const RANK_ADDRS_KEY: &str = "RANK_EP_ADDRS_";

const ARRIVE_OFFSET: usize = 0;
const GENERATION_OFFSET: usize = 8;

/// Upper bound on a node-local barrier.
pub const BARRIER_TIMEOUT: Duration = Duration::from_secs(120);

/// Mapped rendezvous segment. Unmapped on drop; the creating rank also
/// unlinks the file.
pub struct Segment {
    path: PathBuf,
    map: MmapMut,
    base: *mut u8,
    owner: bool,
}

impl Segment {
    /// Segment file for one rendezvous on `host`.
    pub fn path_for(dir: &Path, host: &str, call_id: u64) -> PathBuf {
        let host: String = host
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        dir.join(format!("{SEGMENT_PREFIX}{call_id}-{host}"))
    }

    /// Create a zeroed segment, replacing a stale one left by a crashed job.
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed stale segment"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SkeinError::shared_memory(path.display(), e.to_string())),
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| SkeinError::shared_memory(path.display(), format!("create: {e}")))?;
        file.set_len(len as u64)
            .map_err(|e| SkeinError::shared_memory(path.display(), format!("resize: {e}")))?;
        Self::map(path, &file, len, true)
    }

    pub fn open(path: &Path, len: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| SkeinError::shared_memory(path.display(), format!("open: {e}")))?;
        let actual = file
            .metadata()
            .map_err(|e| SkeinError::shared_memory(path.display(), e.to_string()))?
            .len();
        if actual != len as u64 {
            return Err(SkeinError::shared_memory(
                path.display(),
                format!("size {actual}, expected {len}"),
            ));
        }
        Self::map(path, &file, len, false)
    }

    fn map(path: &Path, file: &std::fs::File, len: usize, owner: bool) -> Result<Self> {
        // SAFETY: the file is private to this rendezvous and sized above.
        let mut map = unsafe { MmapMut::map_mut(file) }
            .map_err(|e| SkeinError::shared_memory(path.display(), format!("mmap: {e}")))?;
        if map.len() != len {
            return Err(SkeinError::shared_memory(path.display(), "mapping size mismatch"));
        }
        let base = map.as_mut_ptr();
        Ok(Self {
            path: path.to_path_buf(),
            map,
            base,
            owner,
        })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn atomic(&self, offset: usize) -> &AtomicU64 {
        // SAFETY: the mapping is page aligned and the header lies in bounds;
        // header words are only ever accessed atomically.
        unsafe { &*(self.base.add(offset) as *const AtomicU64) }
    }

    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        // SAFETY: range checked; regions written by different ranks never overlap.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(offset), data.len()) };
        Ok(())
    }

    pub fn read_at(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check_range(offset, len)?;
        let mut out = vec![0u8; len];
        // SAFETY: range checked; readers run after the barrier that ends all writes.
        unsafe { std::ptr::copy_nonoverlapping(self.base.add(offset), out.as_mut_ptr(), len) };
        Ok(out)
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        if offset < HEADER_LEN || offset.checked_add(len).is_none_or(|end| end > self.len()) {
            return Err(SkeinError::shared_memory(
                self.path.display(),
                format!("access [{offset}, +{len}) outside the data regions"),
            ));
        }
        Ok(())
    }

    /// Sense-reversing barrier over `participants` node-local ranks.
    pub fn barrier(&self, participants: usize, timeout: Duration) -> Result<()> {
        let arrive = self.atomic(ARRIVE_OFFSET);
        let generation = self.atomic(GENERATION_OFFSET);
        let gen_seen = generation.load(Ordering::Acquire);

        if arrive.fetch_add(1, Ordering::AcqRel) + 1 == participants as u64 {
            arrive.store(0, Ordering::Relaxed);
            generation.fetch_add(1, Ordering::Release);
            return Ok(());
        }

        let start = Instant::now();
        let mut iter = 0u32;
        while generation.load(Ordering::Acquire) == gen_seen {
            if start.elapsed() > timeout {
                return Err(SkeinError::shared_memory(
                    self.path.display(),
                    format!("barrier timed out after {}ms", timeout.as_millis()),
                ));
            }
            if iter < 1000 {
                std::hint::spin_loop();
            } else if iter < 5000 {
                std::thread::sleep(Duration::from_micros(10));
            } else {
                std::thread::sleep(Duration::from_micros(100));
            }
            iter = iter.saturating_add(1);
        }
        Ok(())
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.owner
            && let Err(e) = std::fs::remove_file(&self.path)
        {
            tracing::debug!(path = %self.path.display(), "segment unlink: {e}");
        }
    }
}

/// Per-rank record geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLayout {
    /// Bytes per name slot: the longest address of any provider.
    pub slot: usize,
    /// First slot of each provider within a record.
    pub prov_offset: Vec<usize>,
    pub total_named_eps: usize,
}

impl RecordLayout {
    pub fn new(named: &[usize], addr_lens: &[usize]) -> Self {
        let mut prov_offset = Vec::with_capacity(named.len());
        let mut total = 0;
        for &n in named {
            prov_offset.push(total);
            total += n;
        }
        Self {
            slot: addr_lens.iter().copied().max().unwrap_or(0),
            prov_offset,
            total_named_eps: total,
        }
    }

    pub fn record_len(&self) -> usize {
        self.total_named_eps * self.slot
    }

    pub fn segment_len(&self, local_count: usize, global_count: usize) -> usize {
        HEADER_LEN + (local_count + global_count) * self.record_len()
    }

    pub fn local_offset(&self, local_idx: usize) -> usize {
        HEADER_LEN + local_idx * self.record_len()
    }

    pub fn global_offset(&self, local_count: usize, rank: usize) -> usize {
        HEADER_LEN + (local_count + rank) * self.record_len()
    }

    /// Byte offset of `(prov, ep)` inside a record.
    pub fn name_offset(&self, prov: usize, ep: usize) -> usize {
        (self.prov_offset[prov] + ep) * self.slot
    }
}

pub(crate) fn run(ctx: &ExchangeCtx<'_>, provs: &mut [ProvSlot<'_>]) -> Result<Vec<usize>> {
    let pmix = require_pmix(ctx.pmi, ctx.kvs_mode.name())?;
    let rank = ctx.pmi.rank() as usize;
    let size = ctx.pmi.size();
    let local_idx = ctx.coord.local_idx;
    let local_count = ctx.coord.local_count.min(size);

    let named: Vec<usize> = provs.iter().map(|p| p.table.named_ep_count()).collect();
    let addr_lens: Vec<usize> = provs.iter().map(|p| p.domain.info().addr_len).collect();
    let layout = RecordLayout::new(&named, &addr_lens);
    let rec_len = layout.record_len();
    let seg_len = layout.segment_len(local_count, size);
    let path = Segment::path_for(ctx.shm_dir, &ctx.coord.host, ctx.call_id);

    let mut record = vec![0u8; rec_len];
    for (p, slot) in provs.iter().enumerate() {
        for ep in 0..named[p] {
            let name = slot.domain.ep_name(ep);
            let off = layout.name_offset(p, ep);
            record[off..off + name.len().min(layout.slot)]
                .copy_from_slice(&name[..name.len().min(layout.slot)]);
        }
    }

    // the node root creates the file; everyone else opens it after the barrier
    let created = if local_idx == 0 {
        Some(Segment::create(&path, seg_len))
    } else {
        None
    };
    ctx.pmi.barrier()?;
    let segment = match created {
        Some(seg) => seg?,
        None => Segment::open(&path, seg_len)?,
    };
    tracing::debug!(path = %path.display(), seg_len, local_count, "mapped rendezvous segment");

    segment.write_at(layout.local_offset(local_idx), &record)?;
    segment.barrier(local_count, BARRIER_TIMEOUT)?;

    pmix.put(&format!("{RANK_ADDRS_KEY}{rank}"), &record)?;
    pmix.commit()?;
    pmix.fence()?;

    for r in (local_idx..size).step_by(local_count) {
        let key = format!("{RANK_ADDRS_KEY}{r}");
        let value = pmix.get(r as Rank, &key)?;
        if value.len() != rec_len {
            return Err(SkeinError::ValueSizeMismatch {
                key,
                expected: rec_len,
                actual: value.len(),
            });
        }
        segment.write_at(layout.global_offset(local_count, r), &value)?;
    }
    segment.barrier(local_count, BARRIER_TIMEOUT)?;

    let mut rank2proc = Vec::new();
    for (p, slot) in provs.iter_mut().enumerate() {
        let addr_len = addr_lens[p];
        for r in 0..size {
            let base = layout.global_offset(local_count, r);
            for ep in 0..named[p] {
                let name = segment.read_at(base + layout.name_offset(p, ep), addr_len)?;
                slot.table.process_name(r, &name);
            }
        }
        slot.table.commit(slot.domain)?;
        rank2proc = slot.table.rank2proc(size)?;
    }

    Ok(rank2proc)
}
