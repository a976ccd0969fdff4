//! Runtime configuration for the transport layer.
//!
//! Two inputs feed [`Transport::init`](crate::Transport::init):
//! - [`SkeinConfig`], process-level tuning loaded from `SKEIN_*` variables
//!   or constructed directly;
//! - [`TransportAttr`], the per-transport attributes the caller requests
//!   (`input`) and that init reports back (`output`).

use crate::fabric::FabricVersion;
use crate::types::{KvsMode, MnicOffset, MnicType, ProgressMode};
use std::net::IpAddr;
use std::path::PathBuf;

/// Retry bound for operations hitting a transient provider error.
pub const DEFAULT_MAX_RETRY_COUNT: usize = 10_000;

/// Upper bound on network provider instances opened for multi-NIC.
pub const MAX_NW_PROV_COUNT: usize = 16;

/// A network interface the TCP provider may bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicSpec {
    pub name: String,
    pub ip: IpAddr,
}

impl NicSpec {
    pub fn new(name: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            name: name.into(),
            ip,
        }
    }

    pub fn loopback() -> Self {
        Self::new("lo", IpAddr::from([127, 0, 0, 1]))
    }

    /// Parse `name=ip[,name=ip...]`. A bare ip names the NIC after itself.
    pub fn parse_list(s: &str) -> Option<Vec<NicSpec>> {
        let mut out = Vec::new();
        for item in s.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let spec = match item.split_once('=') {
                Some((name, ip)) => NicSpec::new(name.trim(), ip.trim().parse().ok()?),
                None => NicSpec::new(item, item.parse().ok()?),
            };
            out.push(spec);
        }
        (!out.is_empty()).then_some(out)
    }
}

/// Include/exclude filter over NIC names.
///
/// `"a,b"` keeps only `a` and `b`; `"^a,b"` drops them; empty keeps all.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NicFilter {
    #[default]
    Any,
    Include(Vec<String>),
    Exclude(Vec<String>),
}

impl NicFilter {
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        let (exclude, body) = match s.strip_prefix('^') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let names: Vec<String> = body
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(String::from)
            .collect();
        match (names.is_empty(), exclude) {
            (true, _) => NicFilter::Any,
            (false, false) => NicFilter::Include(names),
            (false, true) => NicFilter::Exclude(names),
        }
    }

    pub fn allows(&self, name: &str) -> bool {
        match self {
            NicFilter::Any => true,
            NicFilter::Include(names) => names.iter().any(|n| n == name),
            NicFilter::Exclude(names) => !names.iter().any(|n| n == name),
        }
    }

    pub fn include_names(&self) -> &[String] {
        match self {
            NicFilter::Include(names) => names,
            _ => &[],
        }
    }

    pub fn exclude_names(&self) -> &[String] {
        match self {
            NicFilter::Exclude(names) => names,
            _ => &[],
        }
    }
}

/// Process-level transport tuning.
#[derive(Debug, Clone)]
pub struct SkeinConfig {
    /// Explicit provider name; `"shm"` requests shared-memory-only mode.
    pub provider: Option<String>,

    /// Minimum provider API version accepted during discovery.
    pub fabric_version: FabricVersion,

    /// Retries on a transient provider error before the operation faults.
    pub max_retry_count: usize,

    /// Overrides the automatic progress mode choice.
    pub progress_mode: Option<ProgressMode>,

    /// Rendezvous binding used for address exchange.
    pub kvs_mode: KvsMode,

    /// Keep memory registrations alive between operations.
    pub mr_cache: bool,

    /// Publish `hostname-rank` during address exchange. Deprecated.
    pub hostname_sharing: bool,

    /// Abort the process instead of unwinding on an internal fault.
    pub abort_on_throw: bool,

    /// NICs available to the TCP provider.
    pub tcp_ifaces: Vec<NicSpec>,

    /// Directory holding rendezvous shared-memory segments.
    pub shm_dir: PathBuf,
}

impl Default for SkeinConfig {
    fn default() -> Self {
        Self {
            provider: None,
            fabric_version: FabricVersion::default(),
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            progress_mode: None,
            kvs_mode: KvsMode::Pmi,
            mr_cache: true,
            hostname_sharing: false,
            abort_on_throw: false,
            tcp_ifaces: vec![NicSpec::loopback()],
            shm_dir: PathBuf::from("/dev/shm"),
        }
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl SkeinConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `SKEIN_PROVIDER`
    /// - `SKEIN_FABRIC_VERSION` (`major.minor`)
    /// - `SKEIN_MAX_RETRY_COUNT`
    /// - `SKEIN_PROGRESS_MODE` (`poll`/`check`, or `0`/`1`)
    /// - `SKEIN_KVS_MODE` (`pmi`, `pmix`, `pmix_shm`)
    /// - `SKEIN_MR_CACHE`
    /// - `SKEIN_ENABLE_HOSTNAME_SHARING`
    /// - `SKEIN_ABORT_ON_THROW`
    /// - `SKEIN_TCP_IFACES` (`name=ip,...`)
    /// - `SKEIN_SHM_DIR`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("SKEIN_PROVIDER") {
            if !v.trim().is_empty() {
                cfg.provider = Some(v.trim().to_string());
            }
        }
        if let Ok(v) = std::env::var("SKEIN_FABRIC_VERSION") {
            if let Ok(ver) = v.parse::<FabricVersion>() {
                cfg.fabric_version = ver;
            }
        }
        if let Ok(v) = std::env::var("SKEIN_MAX_RETRY_COUNT") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.max_retry_count = n;
            }
        }
        if let Ok(v) = std::env::var("SKEIN_PROGRESS_MODE") {
            if let Ok(m) = v.parse::<ProgressMode>() {
                cfg.progress_mode = Some(m);
            }
        }
        if let Ok(v) = std::env::var("SKEIN_KVS_MODE") {
            if let Ok(m) = v.parse::<KvsMode>() {
                cfg.kvs_mode = m;
            }
        }
        if let Ok(v) = std::env::var("SKEIN_MR_CACHE") {
            if let Some(b) = parse_bool(&v) {
                cfg.mr_cache = b;
            }
        }
        if let Ok(v) = std::env::var("SKEIN_ENABLE_HOSTNAME_SHARING") {
            if let Some(b) = parse_bool(&v) {
                cfg.hostname_sharing = b;
            }
        }
        if let Ok(v) = std::env::var("SKEIN_ABORT_ON_THROW") {
            if let Some(b) = parse_bool(&v) {
                cfg.abort_on_throw = b;
            }
        }
        if let Ok(v) = std::env::var("SKEIN_TCP_IFACES") {
            if let Some(list) = NicSpec::parse_list(&v) {
                cfg.tcp_ifaces = list;
            }
        }
        if let Ok(v) = std::env::var("SKEIN_SHM_DIR") {
            if !v.trim().is_empty() {
                cfg.shm_dir = PathBuf::from(v.trim());
            }
        }

        cfg
    }

    /// Whether the configured provider name requests shared-memory-only mode.
    pub fn shm_only(&self) -> bool {
        self.provider.as_deref() == Some(crate::fabric::SHM_PROV_NAME)
    }
}

/// Attributes requested by the caller.
#[derive(Debug, Clone)]
pub struct AttrIn {
    /// Logical endpoints per process.
    pub ep_count: usize,
    pub enable_shm: bool,
    pub enable_hmem: bool,
    pub mnic_type: MnicType,
    /// Include/exclude filter over NIC names.
    pub mnic_name: NicFilter,
    pub mnic_count: usize,
    pub mnic_offset: MnicOffset,
}

impl Default for AttrIn {
    fn default() -> Self {
        Self {
            ep_count: 1,
            enable_shm: true,
            enable_hmem: false,
            mnic_type: MnicType::None,
            mnic_name: NicFilter::Any,
            mnic_count: MAX_NW_PROV_COUNT,
            mnic_offset: MnicOffset::None,
        }
    }
}

/// Attributes reported back by init.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttrOut {
    pub enable_shm: bool,
    /// One-sided operations are exposed but not advertised to the algorithm layer.
    pub enable_rma: bool,
    pub enable_hmem: bool,
    pub mnic_type: MnicType,
    pub mnic_count: usize,
    pub tag_bits: u32,
    pub max_tag: u64,
    pub max_order_waw_size: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TransportAttr {
    pub input: AttrIn,
    pub output: AttrOut,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nic_filter() {
        let inc = NicFilter::parse("eth0, ib0");
        assert!(inc.allows("eth0"));
        assert!(!inc.allows("lo"));
        assert_eq!(inc.include_names(), ["eth0", "ib0"]);

        let exc = NicFilter::parse("^lo");
        assert!(!exc.allows("lo"));
        assert!(exc.allows("eth0"));
        assert_eq!(exc.exclude_names(), ["lo"]);

        assert_eq!(NicFilter::parse(""), NicFilter::Any);
        assert_eq!(NicFilter::parse("^"), NicFilter::Any);
    }

    #[test]
    fn test_nic_spec_list() {
        let list = NicSpec::parse_list("lo=127.0.0.1, 10.0.0.2").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "lo");
        assert_eq!(list[1].name, "10.0.0.2");
        assert!(NicSpec::parse_list("lo=not-an-ip").is_none());
        assert!(NicSpec::parse_list(" , ").is_none());
    }

    #[test]
    fn test_defaults() {
        let cfg = SkeinConfig::default();
        assert_eq!(cfg.max_retry_count, DEFAULT_MAX_RETRY_COUNT);
        assert!(cfg.mr_cache);
        assert!(!cfg.shm_only());
        assert_eq!(cfg.kvs_mode, KvsMode::Pmi);

        let cfg = SkeinConfig {
            provider: Some("shm".into()),
            ..Default::default()
        };
        assert!(cfg.shm_only());
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
