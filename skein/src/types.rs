/// Rank of a process in the job (0-indexed).
pub type Rank = u32;

/// Provider-level address handle returned by address-vector insertion.
pub type FiAddr = u64;

/// Wildcard source address for receives.
pub const FI_ADDR_UNSPEC: FiAddr = u64::MAX;

/// Returned by address-vector insertion for names this provider cannot reach.
pub const FI_ADDR_NOTAVAIL: FiAddr = u64::MAX - 1;

/// How completion queues are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProgressMode {
    /// Drain every completion queue on each `poll`/`wait`.
    Poll = 0,
    /// Progress only while checking a specific request.
    Check = 1,
}

impl ProgressMode {
    pub const fn name(self) -> &'static str {
        match self {
            ProgressMode::Poll => "poll",
            ProgressMode::Check => "check",
        }
    }

    /// Default for a job: check mode for small single-host jobs.
    pub fn default_for(local_count: usize, global_count: usize) -> Self {
        if local_count == global_count && global_count <= 4 {
            ProgressMode::Check
        } else {
            ProgressMode::Poll
        }
    }
}

impl std::str::FromStr for ProgressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "0" | "poll" => Ok(ProgressMode::Poll),
            "1" | "check" => Ok(ProgressMode::Check),
            other => Err(format!("unknown progress mode: {other}")),
        }
    }
}

impl std::fmt::Display for ProgressMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Multi-NIC selection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MnicType {
    /// Single network provider.
    #[default]
    None,
    /// NICs local to the process.
    Local,
    /// All discovered NICs.
    Global,
}

impl MnicType {
    pub const fn name(self) -> &'static str {
        match self {
            MnicType::None => "none",
            MnicType::Local => "local",
            MnicType::Global => "global",
        }
    }
}

impl std::str::FromStr for MnicType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(MnicType::None),
            "local" => Ok(MnicType::Local),
            "global" => Ok(MnicType::Global),
            other => Err(format!("unknown mnic type: {other}")),
        }
    }
}

impl std::fmt::Display for MnicType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// First NIC assigned to endpoint 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MnicOffset {
    #[default]
    None,
    /// Start at `local_idx % nic_count` so co-located ranks spread over NICs.
    LocalRank,
}

impl MnicOffset {
    pub const fn name(self) -> &'static str {
        match self {
            MnicOffset::None => "none",
            MnicOffset::LocalRank => "local_rank",
        }
    }
}

impl std::str::FromStr for MnicOffset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(MnicOffset::None),
            "local_rank" => Ok(MnicOffset::LocalRank),
            other => Err(format!("unknown mnic offset: {other}")),
        }
    }
}

impl std::fmt::Display for MnicOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Rendezvous binding used for address exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KvsMode {
    /// Plain put / barrier / get.
    #[default]
    Pmi,
    /// PMIx put / commit / fence / get.
    Pmix,
    /// PMIx with node-local shared-memory aggregation of addresses.
    PmixShm,
}

impl KvsMode {
    pub const fn name(self) -> &'static str {
        match self {
            KvsMode::Pmi => "pmi",
            KvsMode::Pmix => "pmix",
            KvsMode::PmixShm => "pmix_shm",
        }
    }

    pub const fn uses_pmix(self) -> bool {
        matches!(self, KvsMode::Pmix | KvsMode::PmixShm)
    }
}

impl std::str::FromStr for KvsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pmi" => Ok(KvsMode::Pmi),
            "pmix" => Ok(KvsMode::Pmix),
            "pmix_shm" => Ok(KvsMode::PmixShm),
            other => Err(format!("unknown kvs mode: {other}")),
        }
    }
}

impl std::fmt::Display for KvsMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
