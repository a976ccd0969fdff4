use crate::error::{Result, SkeinError};
use crate::pmi::Pmi;
use crate::types::Rank;

/// Key prefix for the hostname exchange that builds coordinates.
const COORD_HOST_KEY: &str = "SKEIN_COORD_HOST";

/// Where this process sits in the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCoordinate {
    pub global_idx: usize,
    pub global_count: usize,
    pub local_idx: usize,
    pub local_count: usize,
    /// Local index of every global rank, `None` for ranks on other hosts.
    pub global2local: Vec<Option<usize>>,
    /// Host of this process.
    pub host: String,
    /// Index of this host among all hosts, in order of first appearance.
    pub node_idx: usize,
    pub node_count: usize,
}

impl ProcessCoordinate {
    /// Exchange hostnames through `pmi` and group ranks by host.
    ///
    /// All ranks must call this collectively with the same `epoch`.
    pub fn exchange(pmi: &dyn Pmi, epoch: u64) -> Result<Self> {
        let host = pmi.hostname()?;
        let rank = pmi.rank() as usize;
        let size = pmi.size();

        pmi.kvs_put(&format!("{COORD_HOST_KEY}-{epoch}-{rank}"), host.as_bytes())?;
        pmi.barrier()?;

        let mut hosts = Vec::with_capacity(size);
        for r in 0..size {
            let raw = pmi.kvs_get(&format!("{COORD_HOST_KEY}-{epoch}-{r}"))?;
            hosts.push(String::from_utf8_lossy(&raw).into_owned());
        }
        Self::from_hosts(rank, &hosts)
    }

    /// Coordinates of `rank` given every rank's host.
    pub fn from_hosts(rank: usize, hosts: &[String]) -> Result<Self> {
        let host = hosts
            .get(rank)
            .cloned()
            .ok_or_else(|| SkeinError::bootstrap(format!("rank {rank} outside of job")))?;

        let seen: indexmap::IndexSet<&str> = hosts.iter().map(String::as_str).collect();
        let node_idx = seen
            .get_index_of(host.as_str())
            .ok_or_else(|| SkeinError::bootstrap("own host missing from exchange"))?;

        let mut global2local = vec![None; hosts.len()];
        let mut local_count = 0;
        for (r, h) in hosts.iter().enumerate() {
            if *h == host {
                global2local[r] = Some(local_count);
                local_count += 1;
            }
        }
        let local_idx = global2local[rank]
            .ok_or_else(|| SkeinError::bootstrap("own rank is not local"))?;

        let coord = Self {
            global_idx: rank,
            global_count: hosts.len(),
            local_idx,
            local_count,
            global2local,
            host,
            node_idx,
            node_count: seen.len(),
        };
        coord.validate()?;
        Ok(coord)
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_count == 0 || self.local_count > self.global_count {
            return Err(SkeinError::bootstrap(format!(
                "local count {} outside of [1, {}]",
                self.local_count, self.global_count
            )));
        }
        if self.global2local.len() != self.global_count {
            return Err(SkeinError::bootstrap("global2local size mismatch"));
        }
        if self
            .global2local
            .iter()
            .flatten()
            .any(|&l| l >= self.local_count)
        {
            return Err(SkeinError::bootstrap("global2local entry out of range"));
        }
        Ok(())
    }

    pub fn is_local(&self, rank: Rank) -> bool {
        self.local_of(rank).is_some()
    }

    pub fn local_of(&self, rank: Rank) -> Option<usize> {
        self.global2local.get(rank as usize).copied().flatten()
    }

    /// Every rank runs on this host.
    pub fn single_node(&self) -> bool {
        self.local_count == self.global_count
    }
}
