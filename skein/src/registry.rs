//! Provider discovery and opening.
//!
//! Produces the fixed provider array of a transport: an optional
//! shared-memory provider at index 0 followed by up to
//! [`MAX_NW_PROV_COUNT`] network provider instances, and for every endpoint
//! the subset of those providers that is active on it.

use crate::config::{AttrIn, MAX_NW_PROV_COUNT, SkeinConfig, TransportAttr};
use crate::coord::ProcessCoordinate;
use crate::error::{Result, SkeinError};
use crate::fabric::{
    Caps, Domain, Fabric, FabricProvider, Hints, OpenParams, ProviderInfo, ProviderKind,
    SHM_PROV_NAME, TAG_BITS,
};
use crate::types::{MnicOffset, MnicType, ProgressMode};
use std::sync::Arc;

/// Network providers that can carry device memory when asked to.
pub const HMEM_PROVIDERS: &[&str] = &["verbs", "cxi", "psm3", "tcp"];

/// One opened provider.
pub struct ProviderCtx {
    pub idx: usize,
    pub domain: Arc<dyn Domain>,
}

impl ProviderCtx {
    pub fn info(&self) -> &ProviderInfo {
        self.domain.info()
    }

    pub fn is_shm(&self) -> bool {
        self.domain.info().is_shm()
    }
}

impl std::fmt::Debug for ProviderCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let info = self.info();
        f.debug_struct("ProviderCtx")
            .field("idx", &self.idx)
            .field("name", &info.name)
            .field("nic", &info.nic)
            .field("domain", &self.domain.id())
            .finish()
    }
}

/// A logical endpoint and the providers it may use, shm first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub idx: usize,
    pub active: Vec<usize>,
}

impl Endpoint {
    /// Active shared-memory provider, if any.
    pub fn shm_prov(&self, provs: &[ProviderCtx]) -> Option<usize> {
        self.active.iter().copied().find(|&p| provs[p].is_shm())
    }

    /// Active network provider, if any.
    pub fn nw_prov(&self, provs: &[ProviderCtx]) -> Option<usize> {
        self.active.iter().copied().find(|&p| !provs[p].is_shm())
    }
}

/// Everything [`open_providers`] decided.
#[derive(Debug)]
pub struct ProviderSet {
    pub provs: Vec<ProviderCtx>,
    pub eps: Vec<Endpoint>,
    pub enable_shm: bool,
    pub open_nw_provs: bool,
    pub nw_prov_first_idx: usize,
    pub nw_prov_count: usize,
    pub enable_hmem: bool,
    pub mnic_type: MnicType,
    pub mnic_count: usize,
    pub mnic_offset: MnicOffset,
    pub mnic_include: Vec<String>,
    pub mnic_exclude: Vec<String>,
    pub progress_mode: ProgressMode,
}

impl ProviderSet {
    pub fn prov_count(&self) -> usize {
        self.provs.len()
    }
}

/// Discover and open providers for `coord`, filling `attr.output`.
pub fn open_providers(
    fabric: &Fabric,
    coord: &ProcessCoordinate,
    attr: &mut TransportAttr,
    config: &SkeinConfig,
) -> Result<ProviderSet> {
    let input = &attr.input;
    if input.ep_count == 0 {
        return Err(SkeinError::InvalidArgument("endpoint count must be positive".into()));
    }

    let shm_only = config.shm_only();
    if shm_only && !(input.enable_shm && coord.single_node()) {
        return Err(SkeinError::no_provider(format!(
            "shm-only mode needs shm enabled and all ranks on one host (local {}, global {})",
            coord.local_count, coord.global_count
        )));
    }

    let hint = config.provider.as_deref().filter(|p| *p != SHM_PROV_NAME);
    let try_hmem = input.enable_hmem && hint.is_some_and(|p| HMEM_PROVIDERS.contains(&p));

    let mut opened = None;
    if try_hmem {
        match open_all(fabric, coord, input, config, hint, true, false) {
            Ok(set) => opened = Some(set),
            Err(e) => {
                // partially opened domains were dropped with the error
                tracing::warn!("can't open providers with device memory support, falling back: {e}");
            }
        }
    }
    let set = match opened {
        Some(set) => set,
        None => open_all(fabric, coord, input, config, hint, false, input.enable_shm)?,
    };

    for prov in &set.provs {
        let info = prov.info();
        ensure_or_fatal!(
            config.abort_on_throw,
            info.tag_bits >= TAG_BITS,
            "provider {} offers {} tag bits, {TAG_BITS} required",
            info.name,
            info.tag_bits
        );
    }

    attr.output.enable_shm = set.enable_shm;
    attr.output.enable_rma = false;
    attr.output.enable_hmem = set.enable_hmem;
    attr.output.mnic_type = set.mnic_type;
    attr.output.mnic_count = set.nw_prov_count;
    attr.output.tag_bits = TAG_BITS;
    attr.output.max_tag = u64::MAX;
    attr.output.max_order_waw_size = 0;

    tracing::info!(
        rank = coord.global_idx,
        provs = set.prov_count(),
        shm = set.enable_shm,
        nw = set.nw_prov_count,
        hmem = set.enable_hmem,
        progress = %set.progress_mode,
        "opened providers"
    );
    Ok(set)
}

fn open_all(
    fabric: &Fabric,
    coord: &ProcessCoordinate,
    input: &AttrIn,
    config: &SkeinConfig,
    hint: Option<&str>,
    hmem: bool,
    want_shm: bool,
) -> Result<ProviderSet> {
    let open_nw_provs = !config.shm_only();
    let mut provs: Vec<ProviderCtx> = Vec::new();

    let mut enable_shm = want_shm;
    if enable_shm {
        let hints = Hints {
            provider: Some(SHM_PROV_NAME.into()),
            kind: Some(ProviderKind::Shm),
            caps: Some(Caps::TAGGED),
            hmem,
            min_version: config.fabric_version,
        };
        match fabric.getinfo(&hints).into_iter().next() {
            Some((provider, info)) => {
                let domain = open_one(fabric, coord, input, provider.as_ref(), &info)?;
                provs.push(ProviderCtx { idx: 0, domain });
            }
            None => {
                tracing::info!("shm provider is requested but not available, disabling shm");
                enable_shm = false;
            }
        }
    }
    if config.shm_only() && !enable_shm {
        return Err(SkeinError::no_provider("shm-only mode requested but shm is unavailable"));
    }

    let nw_prov_first_idx = provs.len();
    let mut nw_prov_count = 0;
    let mnic_type = input.mnic_type;
    if open_nw_provs {
        let hints = Hints {
            provider: hint.map(str::to_string),
            kind: Some(ProviderKind::Network),
            caps: Some(Caps::TAGGED),
            hmem,
            min_version: config.fabric_version,
        };
        let found: Vec<_> = fabric
            .getinfo(&hints)
            .into_iter()
            .filter(|(_, info)| {
                info.nic
                    .as_deref()
                    .is_none_or(|nic| input.mnic_name.allows(nic))
            })
            .collect();
        if found.is_empty() {
            return Err(SkeinError::no_provider(format!(
                "no network provider matches (hint {}, hmem {hmem})",
                hint.unwrap_or("none")
            )));
        }

        let selected = select_nics(found.len(), coord.local_idx, input);
        tracing::debug!(found = found.len(), ?selected, %mnic_type, "selected network providers");
        for i in selected {
            let (provider, info) = &found[i];
            let domain = open_one(fabric, coord, input, provider.as_ref(), info)?;
            provs.push(ProviderCtx {
                idx: provs.len(),
                domain,
            });
            nw_prov_count += 1;
        }
    }

    let eps = build_endpoints(
        input.ep_count,
        enable_shm,
        open_nw_provs,
        nw_prov_first_idx,
        nw_prov_count,
    )?;

    let progress_mode = config
        .progress_mode
        .unwrap_or_else(|| ProgressMode::default_for(coord.local_count, coord.global_count));

    Ok(ProviderSet {
        provs,
        eps,
        enable_shm,
        open_nw_provs,
        nw_prov_first_idx,
        nw_prov_count,
        enable_hmem: hmem,
        mnic_type,
        mnic_count: input.mnic_count,
        mnic_offset: input.mnic_offset,
        mnic_include: input.mnic_name.include_names().to_vec(),
        mnic_exclude: input.mnic_name.exclude_names().to_vec(),
        progress_mode,
    })
}

fn open_one(
    fabric: &Fabric,
    coord: &ProcessCoordinate,
    input: &AttrIn,
    provider: &dyn FabricProvider,
    info: &ProviderInfo,
) -> Result<Arc<dyn Domain>> {
    let params = OpenParams {
        ep_count: input.ep_count,
        host: coord.host.clone(),
        domain_id: fabric.next_domain_id(),
    };
    let domain = provider.open(info, &params)?;
    tracing::debug!(prov = %info.name, nic = ?info.nic, id = params.domain_id, "opened domain");
    Ok(domain)
}

/// Indices into the discovered NIC list, in endpoint assignment order.
pub fn select_nics(found: usize, local_idx: usize, input: &AttrIn) -> Vec<usize> {
    if found == 0 {
        return Vec::new();
    }
    let count = match input.mnic_type {
        MnicType::None => 1,
        MnicType::Local | MnicType::Global => {
            input.mnic_count.clamp(1, MAX_NW_PROV_COUNT).min(found)
        }
    };
    let start = match input.mnic_offset {
        MnicOffset::None => 0,
        MnicOffset::LocalRank => local_idx % found,
    };
    (0..count).map(|i| (start + i) % found).collect()
}

/// Active providers per endpoint: shm (if enabled) then one network
/// provider picked round-robin by endpoint index.
pub fn build_endpoints(
    ep_count: usize,
    enable_shm: bool,
    open_nw_provs: bool,
    nw_first: usize,
    nw_count: usize,
) -> Result<Vec<Endpoint>> {
    (0..ep_count)
        .map(|idx| {
            let mut active = Vec::with_capacity(2);
            if enable_shm {
                active.push(0);
            }
            if open_nw_provs && nw_count > 0 {
                active.push(nw_first + idx % nw_count);
            }
            if active.is_empty() {
                return Err(SkeinError::no_provider(format!("endpoint {idx} has no active provider")));
            }
            Ok(Endpoint { idx, active })
        })
        .collect()
}
