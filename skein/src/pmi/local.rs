use super::{Pmi, Pmix};
use crate::error::{Result, SkeinError};
use crate::types::Rank;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Barrier};

struct Group {
    size: usize,
    kvs: Mutex<HashMap<String, Vec<u8>>>,
    committed: Mutex<HashMap<(Rank, String), Vec<u8>>>,
    barrier: Barrier,
    hosts: Option<Vec<String>>,
}

/// In-process rendezvous for ranks running as threads of one process.
///
/// Every handle of a group shares one store and one barrier. Hosts may be
/// overridden per rank to simulate a multi-node job.
pub struct LocalPmi {
    group: Arc<Group>,
    rank: Rank,
    staged: Mutex<Vec<(String, Vec<u8>)>>,
}

impl LocalPmi {
    /// Handles for ranks `0..size`, all on this machine.
    pub fn group(size: usize) -> Vec<LocalPmi> {
        Self::build(size, None)
    }

    /// One handle per entry of `hosts`, rank `i` reporting `hosts[i]`.
    pub fn group_on_hosts(hosts: &[&str]) -> Vec<LocalPmi> {
        let hosts: Vec<String> = hosts.iter().map(|h| h.to_string()).collect();
        Self::build(hosts.len(), Some(hosts))
    }

    fn build(size: usize, hosts: Option<Vec<String>>) -> Vec<LocalPmi> {
        let group = Arc::new(Group {
            size,
            kvs: Mutex::new(HashMap::new()),
            committed: Mutex::new(HashMap::new()),
            barrier: Barrier::new(size),
            hosts,
        });
        (0..size)
            .map(|rank| LocalPmi {
                group: Arc::clone(&group),
                rank: rank as Rank,
                staged: Mutex::new(Vec::new()),
            })
            .collect()
    }
}

impl Pmi for LocalPmi {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.group.size
    }

    fn barrier(&self) -> Result<()> {
        self.group.barrier.wait();
        Ok(())
    }

    fn kvs_put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.group.kvs.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn kvs_get(&self, key: &str) -> Result<Vec<u8>> {
        self.group
            .kvs
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| SkeinError::KeyNotFound {
                key: key.to_string(),
            })
    }

    fn hostname(&self) -> Result<String> {
        match &self.group.hosts {
            Some(hosts) => Ok(hosts[self.rank as usize].clone()),
            None => super::local_hostname(),
        }
    }

    fn pmix(&self) -> Option<&dyn Pmix> {
        Some(self)
    }
}

impl Pmix for LocalPmi {
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.staged.lock().push((key.to_string(), value.to_vec()));
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let staged = std::mem::take(&mut *self.staged.lock());
        let mut committed = self.group.committed.lock();
        for (key, value) in staged {
            committed.insert((self.rank, key), value);
        }
        Ok(())
    }

    fn fence(&self) -> Result<()> {
        self.group.barrier.wait();
        Ok(())
    }

    fn get(&self, rank: Rank, key: &str) -> Result<Vec<u8>> {
        self.group
            .committed
            .lock()
            .get(&(rank, key.to_string()))
            .cloned()
            .ok_or_else(|| SkeinError::KeyNotFound {
                key: format!("{key}@{rank}"),
            })
    }
}
