//! Completion processing for one endpoint.

use crate::error::Result;
use crate::fabric::{CQ_BATCH, CompFlags, CqEntry, CqErrEntry, CqErrKind, CqRead};
use crate::mr::MrCache;
use crate::registry::{Endpoint, ProviderCtx};
use crate::request::{Applied, ReqState, RequestTable, Token};
use parking_lot::Mutex;

/// Everything completion handling touches for one endpoint.
pub(crate) struct EpView<'a> {
    pub ep: &'a Endpoint,
    pub provs: &'a [ProviderCtx],
    pub requests: &'a RequestTable,
    pub mr_cache: &'a Mutex<MrCache>,
    pub abort_on_throw: bool,
}

impl EpView<'_> {
    /// Drain the completion queues of every active provider.
    pub fn progress(&self) -> Result<()> {
        for &p in &self.ep.active {
            self.progress_prov(p)?;
        }
        Ok(())
    }

    fn progress_prov(&self, prov: usize) -> Result<()> {
        let domain = &self.provs[prov].domain;
        let mut batch = Vec::with_capacity(CQ_BATCH);
        loop {
            batch.clear();
            match domain.cq_read(self.ep.idx, &mut batch, CQ_BATCH) {
                CqRead::Read(_) => self.process_comps(&batch),
                CqRead::Again => return Ok(()),
                CqRead::ErrorAvailable => {
                    if let Some(err) = domain.cq_readerr(self.ep.idx) {
                        self.handle_cq_err(prov, &err);
                    }
                }
            }
        }
    }

    pub fn process_comps(&self, entries: &[CqEntry]) {
        for entry in entries {
            let token = Token::from_context(entry.context);
            let recv_len = entry
                .flags
                .intersects(CompFlags::RECV | CompFlags::PEEK)
                .then_some(entry.len);
            let applied = self.requests.apply(
                token,
                |state| match state {
                    ReqState::Posted => Some(ReqState::Completed),
                    ReqState::PeekStarted => Some(ReqState::PeekFound),
                    _ => None,
                },
                recv_len,
            );
            match applied {
                Applied::Transition { from, mr } => match from {
                    ReqState::Posted | ReqState::PeekStarted => {
                        if let Some(mr) = mr {
                            self.mr_cache.lock().push(mr);
                        }
                    }
                    // late entry of a request that cancel already completed
                    ReqState::Completed | ReqState::Failed(_) => {
                        tracing::debug!(ep = self.ep.idx, ctx = entry.context, "completion for completed request");
                    }
                    ReqState::PeekFound | ReqState::PeekNotFound => {
                        fatal!(
                            self.abort_on_throw,
                            "unexpected completion state {from:?} (ep {}, flags {:?})",
                            self.ep.idx,
                            entry.flags
                        );
                    }
                },
                Applied::Stale => {
                    tracing::debug!(ep = self.ep.idx, ctx = entry.context, "completion for released request");
                }
            }
        }
    }

    /// Record an error completion on the request it belongs to.
    ///
    /// A failed operation moves its slot to [`ReqState::Failed`]; the error
    /// surfaces from the wait or check of that request only.
    pub fn handle_cq_err(&self, prov: usize, err: &CqErrEntry) {
        let token = Token::from_context(err.context);
        match err.kind {
            CqErrKind::Canceled => {
                tracing::debug!(ep = self.ep.idx, ctx = err.context, "operation canceled");
            }
            CqErrKind::NoMessage
                if self.requests.state(token).map(|(s, _)| s) == Some(ReqState::PeekStarted) =>
            {
                self.requests.set_state(token, ReqState::PeekNotFound);
            }
            kind => {
                tracing::error!(
                    prov = %self.provs[prov].info().name,
                    ep = self.ep.idx,
                    ?kind,
                    olen = err.olen,
                    "completion queue error"
                );
                let applied = self.requests.apply(
                    token,
                    |state| match state {
                        ReqState::Posted | ReqState::PeekStarted => Some(ReqState::Failed(kind)),
                        _ => None,
                    },
                    None,
                );
                match applied {
                    Applied::Transition { mr: Some(mr), .. } => self.mr_cache.lock().push(mr),
                    Applied::Transition { .. } => {}
                    Applied::Stale => {
                        tracing::debug!(ep = self.ep.idx, ctx = err.context, "error for released request");
                    }
                }
            }
        }
    }

    /// Drain `prov`'s queue until the cancellation of `token` is reported.
    pub fn wait_cancel_cq(&self, prov: usize, token: Token) -> Result<()> {
        let domain = &self.provs[prov].domain;
        let mut batch = Vec::with_capacity(CQ_BATCH);
        loop {
            batch.clear();
            match domain.cq_read(self.ep.idx, &mut batch, CQ_BATCH) {
                CqRead::Read(_) => self.process_comps(&batch),
                CqRead::Again => std::thread::yield_now(),
                CqRead::ErrorAvailable => {
                    let Some(err) = domain.cq_readerr(self.ep.idx) else {
                        continue;
                    };
                    if err.kind == CqErrKind::Canceled && err.context == token.context() {
                        return Ok(());
                    }
                    self.handle_cq_err(prov, &err);
                }
            }
        }
    }
}
