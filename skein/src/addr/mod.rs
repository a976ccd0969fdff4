//! Address exchange and rank resolution.
//!
//! Each provider keeps an [`AddressTable`]: the deduplicated list of peer
//! address names discovered during rendezvous and the provider addresses
//! they were inserted as. Two protocols fill the tables and must agree on
//! the resulting rank-to-process map:
//! - [`direct`]: every rank publishes and fetches every name through the KVS;
//! - [`shm_exchange`]: node-local ranks aggregate names in a shared-memory
//!   segment and publish one record per rank through PMIx.

pub mod direct;
pub mod shm_exchange;

use crate::coord::ProcessCoordinate;
use crate::error::{Result, SkeinError};
use crate::fabric::{Domain, trim_shm_name};
use crate::pmi::{Pmi, require_pmix};
use crate::types::{FI_ADDR_NOTAVAIL, FiAddr, KvsMode, Rank};
use std::path::Path;

/// Key prefix of published endpoint names.
pub const ADDR_KEY: &str = "SKEIN_FI_ADDR";
/// Key prefix of shared hostnames.
pub const HOSTNAME_KEY: &str = "SKEIN_HOSTNAME";

pub const PROC_MULTIPLIER: usize = 1000;
pub const PROV_MULTIPLIER: usize = 100;

/// Key under which `rank` publishes the name of endpoint `ep` of provider `prov`.
pub fn addr_key(rank: usize, prov: usize, ep: usize) -> String {
    format!(
        "{ADDR_KEY}{}",
        rank * PROC_MULTIPLIER + prov * PROV_MULTIPLIER + ep
    )
}

/// Peer addresses known to one provider.
#[derive(Debug, Clone)]
pub struct AddressTable {
    is_shm: bool,
    ep_count: usize,
    scalable: bool,
    names: Vec<Vec<u8>>,
    /// Names already inserted into the provider's address vector.
    inserted: usize,
    /// Indexed by `proc * ep_count + ep`.
    fi_addrs: Vec<FiAddr>,
    rank2proc: Vec<Option<usize>>,
}

impl AddressTable {
    pub fn new(is_shm: bool, ep_count: usize, scalable: bool) -> Self {
        Self {
            is_shm,
            ep_count,
            scalable,
            names: Vec::new(),
            inserted: 0,
            fi_addrs: Vec::new(),
            rank2proc: Vec::new(),
        }
    }

    pub fn for_domain(domain: &dyn Domain, ep_count: usize) -> Self {
        let info = domain.info();
        Self::new(info.is_shm(), ep_count, info.scalable_ep)
    }

    /// Names each process publishes: one for a scalable endpoint, else one per endpoint.
    pub fn named_ep_count(&self) -> usize {
        if self.scalable { 1 } else { self.ep_count }
    }

    /// Record `rank`'s name, appending it unless an identical one is known.
    /// Returns whether the table grew.
    pub fn process_name(&mut self, rank: usize, raw: &[u8]) -> bool {
        let name = if self.is_shm {
            trim_shm_name(raw)
        } else {
            raw.to_vec()
        };
        if self.rank2proc.len() <= rank {
            self.rank2proc.resize(rank + 1, None);
        }
        let named = self.named_ep_count();
        match self.names.iter().position(|n| *n == name) {
            Some(idx) => {
                self.rank2proc[rank] = Some(idx / named);
                false
            }
            None => {
                self.names.push(name);
                self.rank2proc[rank] = Some((self.names.len() - 1) / named);
                true
            }
        }
    }

    /// Insert names discovered since the last commit into `domain`'s address
    /// vector. Returns the number of names inserted.
    pub fn commit(&mut self, domain: &dyn Domain) -> Result<usize> {
        let fresh = &self.names[self.inserted..];
        if fresh.is_empty() {
            return Ok(0);
        }
        let addrs = domain.av_insert(fresh)?;
        if addrs.len() != fresh.len() {
            return Err(SkeinError::provider(
                &domain.info().name,
                format!("av_insert returned {} of {} addresses", addrs.len(), fresh.len()),
            ));
        }
        let mut reachable = 0;
        for &addr in &addrs {
            if addr == FI_ADDR_NOTAVAIL {
                // shm cannot reach other hosts; its table only holds local peers
                if self.is_shm {
                    continue;
                }
                return Err(SkeinError::provider(
                    &domain.info().name,
                    "peer address not available",
                ));
            }
            if self.scalable {
                for rx in 0..self.ep_count {
                    self.fi_addrs.push(domain.rx_addr(addr, rx));
                }
            } else {
                self.fi_addrs.push(addr);
            }
            reachable += 1;
        }
        self.inserted = self.names.len();
        tracing::debug!(
            prov = %domain.info().name,
            inserted = addrs.len(),
            reachable,
            total = self.fi_addrs.len(),
            "address table updated"
        );
        Ok(addrs.len())
    }

    /// Provider address of endpoint `ep` of process `proc`.
    pub fn lookup(&self, proc: usize, ep: usize) -> Option<FiAddr> {
        if ep >= self.ep_count {
            return None;
        }
        self.fi_addrs.get(proc * self.ep_count + ep).copied()
    }

    pub fn proc_of(&self, rank: usize) -> Option<usize> {
        self.rank2proc.get(rank).copied().flatten()
    }

    /// Rank-to-process map over `0..size`; every rank must be resolved.
    pub fn rank2proc(&self, size: usize) -> Result<Vec<usize>> {
        (0..size)
            .map(|r| {
                self.proc_of(r)
                    .ok_or_else(|| SkeinError::bootstrap(format!("rank {r} has no address")))
            })
            .collect()
    }

    /// Distinct names known.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[Vec<u8>] {
        &self.names
    }

    pub fn is_shm(&self) -> bool {
        self.is_shm
    }
}

/// Inputs shared by both exchange protocols.
pub struct ExchangeCtx<'a> {
    pub pmi: &'a dyn Pmi,
    pub coord: &'a ProcessCoordinate,
    pub kvs_mode: KvsMode,
    pub shm_dir: &'a Path,
    /// Rendezvous call id; names the shared-memory segment.
    pub call_id: u64,
    pub hostname_sharing: bool,
}

/// One provider taking part in an exchange.
pub struct ProvSlot<'a> {
    pub domain: &'a dyn Domain,
    pub table: &'a mut AddressTable,
}

/// Exchange addresses for every provider and return the rank-to-process map.
pub fn resolve_addresses(ctx: &ExchangeCtx<'_>, provs: &mut [ProvSlot<'_>]) -> Result<Vec<usize>> {
    if provs.is_empty() {
        return Err(SkeinError::bootstrap("no providers to exchange addresses for"));
    }
    exchange_hostnames_if_enabled(ctx)?;

    let rank2proc = match ctx.kvs_mode {
        KvsMode::PmixShm => shm_exchange::run(ctx, provs)?,
        KvsMode::Pmi | KvsMode::Pmix => direct::run(ctx, provs)?,
    };

    let size = ctx.pmi.size();
    if rank2proc.len() != size {
        return Err(SkeinError::bootstrap(format!(
            "rank2proc has {} entries for {size} ranks",
            rank2proc.len()
        )));
    }
    tracing::debug!(rank = ctx.pmi.rank(), ?rank2proc, "resolved addresses");
    Ok(rank2proc)
}

/// Publish `hostname-rank` when hostname sharing is enabled.
pub fn exchange_hostnames_if_enabled(ctx: &ExchangeCtx<'_>) -> Result<()> {
    if !ctx.hostname_sharing {
        return Ok(());
    }
    tracing::warn!(
        "hostname sharing is enabled; this feature is deprecated and may expose host information"
    );

    let rank = ctx.pmi.rank();
    let host = ctx.pmi.hostname()?;
    let value = format!("{host}-{rank}");
    let key = format!("{HOSTNAME_KEY}{}", rank as usize * PROC_MULTIPLIER);

    if ctx.kvs_mode.uses_pmix() {
        let pmix = require_pmix(ctx.pmi, ctx.kvs_mode.name())?;
        pmix.put(&key, value.as_bytes())?;
        pmix.commit()?;
        pmix.fence()?;
    } else {
        ctx.pmi.kvs_put(&key, value.as_bytes())?;
        ctx.pmi.barrier()?;
    }
    Ok(())
}

/// Shared hostname of `rank`, if it was published.
pub fn shared_hostname(pmi: &dyn Pmi, kvs_mode: KvsMode, rank: Rank) -> Result<String> {
    let key = format!("{HOSTNAME_KEY}{}", rank as usize * PROC_MULTIPLIER);
    let raw = if kvs_mode.uses_pmix() {
        require_pmix(pmi, kvs_mode.name())?.get(rank, &key)?
    } else {
        pmi.kvs_get(&key)?
    };
    Ok(String::from_utf8_lossy(&raw).into_owned())
}
