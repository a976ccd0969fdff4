//! Direct key-value address exchange.
//!
//! Every rank publishes each provider's endpoint names under
//! [`addr_key`](super::addr_key), then after a barrier (or PMIx fence) fetches
//! every rank's names in rank order.

use super::{ExchangeCtx, ProvSlot, addr_key};
use crate::error::{Result, SkeinError};
use crate::pmi::{Pmix, require_pmix};
use crate::types::Rank;

pub(crate) fn run(ctx: &ExchangeCtx<'_>, provs: &mut [ProvSlot<'_>]) -> Result<Vec<usize>> {
    let rank = ctx.pmi.rank() as usize;
    let size = ctx.pmi.size();
    let pmix: Option<&dyn Pmix> = if ctx.kvs_mode.uses_pmix() {
        Some(require_pmix(ctx.pmi, ctx.kvs_mode.name())?)
    } else {
        None
    };

    for (prov_idx, slot) in provs.iter().enumerate() {
        for ep in 0..slot.table.named_ep_count() {
            let key = addr_key(rank, prov_idx, ep);
            let name = slot.domain.ep_name(ep);
            match pmix {
                Some(p) => p.put(&key, &name)?,
                None => ctx.pmi.kvs_put(&key, &name)?,
            }
        }
    }
    if let Some(p) = pmix {
        p.commit()?;
    }

    let mut rank2proc = Vec::new();
    for (prov_idx, slot) in provs.iter_mut().enumerate() {
        match pmix {
            Some(p) => p.fence()?,
            None => ctx.pmi.barrier()?,
        }

        let addr_len = slot.domain.info().addr_len;
        let named = slot.table.named_ep_count();
        let mut fresh = 0;
        for r in 0..size {
            for ep in 0..named {
                let key = addr_key(r, prov_idx, ep);
                let name = match pmix {
                    Some(p) => p.get(r as Rank, &key)?,
                    None => ctx.pmi.kvs_get(&key)?,
                };
                if name.len() != addr_len {
                    return Err(SkeinError::ValueSizeMismatch {
                        key,
                        expected: addr_len,
                        actual: name.len(),
                    });
                }
                if slot.table.process_name(r, &name) {
                    fresh += 1;
                }
            }
        }
        slot.table.commit(slot.domain)?;
        tracing::debug!(prov = prov_idx, fresh, known = slot.table.len(), "direct exchange");
        rank2proc = slot.table.rank2proc(size)?;
    }
    Ok(rank2proc)
}
