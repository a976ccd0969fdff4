//! Request bookkeeping.
//!
//! A caller-owned [`Request`] refers to a slot in its endpoint's
//! [`RequestTable`]. The slot's token travels through the provider as the
//! completion context: endpoint, slot generation and slot index packed into
//! one `u64`. A completion carrying a stale generation belongs to a slot
//! that has since been reused and is ignored.

use crate::error::{Result, SkeinError};
use crate::fabric::CqErrKind;
use crate::mr::MemoryRegion;
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use std::sync::Arc;

/// Outstanding operations per endpoint.
pub const MAX_REQS_PER_EP: usize = 1 << 16;

/// Completion state of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqState {
    Posted,
    Completed,
    PeekStarted,
    PeekFound,
    PeekNotFound,
    /// Terminal: the provider reported an error completion.
    Failed(CqErrKind),
}

/// Provider-side part of an in-flight operation.
#[derive(Debug)]
pub enum ProviderReq {
    /// Issued on the shared-memory provider.
    Shm { prov: u8, mr: Option<Arc<MemoryRegion>> },
    /// Issued on a network provider.
    Network { prov: u8, mr: Option<Arc<MemoryRegion>> },
}

/// Room a request may take inside a slot.
const PROVIDER_REQ_SIZE: usize = 16;
const _: () = assert!(std::mem::size_of::<ProviderReq>() <= PROVIDER_REQ_SIZE);

impl ProviderReq {
    pub fn new(prov: usize, is_shm: bool, mr: Option<Arc<MemoryRegion>>) -> Self {
        let prov = prov as u8;
        if is_shm {
            ProviderReq::Shm { prov, mr }
        } else {
            ProviderReq::Network { prov, mr }
        }
    }

    pub fn prov(&self) -> usize {
        match self {
            ProviderReq::Shm { prov, .. } | ProviderReq::Network { prov, .. } => *prov as usize,
        }
    }

    pub fn take_mr(&mut self) -> Option<Arc<MemoryRegion>> {
        match self {
            ProviderReq::Shm { mr, .. } | ProviderReq::Network { mr, .. } => mr.take(),
        }
    }
}

/// Completion token: `ep:16 | generation:16 | slot:32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u64);

impl Token {
    pub fn new(ep: usize, generation: u16, slot: u32) -> Self {
        Self(((ep as u64 & 0xffff) << 48) | ((generation as u64) << 32) | slot as u64)
    }

    pub fn from_context(context: u64) -> Self {
        Self(context)
    }

    pub fn context(self) -> u64 {
        self.0
    }

    pub fn ep(self) -> usize {
        (self.0 >> 48) as usize
    }

    pub fn generation(self) -> u16 {
        (self.0 >> 32) as u16
    }

    pub fn slot(self) -> usize {
        (self.0 & 0xffff_ffff) as usize
    }
}

/// Caller-owned handle of one operation.
///
/// Reusable once [`is_completed`](Self::is_completed) reports true.
#[derive(Debug, Default)]
pub struct Request {
    pub(crate) token: Option<Token>,
    pub(crate) ep: usize,
    pub(crate) is_completed: bool,
    pub(crate) recv_len: usize,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_completed(&self) -> bool {
        self.is_completed
    }

    /// Bytes received, valid after a receive completes.
    pub fn recv_len(&self) -> usize {
        self.recv_len
    }

    /// Endpoint the operation was issued on.
    pub fn ep(&self) -> usize {
        self.ep
    }

    pub fn in_flight(&self) -> bool {
        self.token.is_some()
    }
}

#[derive(Debug)]
struct ReqSlot {
    generation: u16,
    state: ReqState,
    recv_len: usize,
    req: Option<ProviderReq>,
}

/// What a completion did to its slot.
#[derive(Debug)]
pub enum Applied {
    /// The slot moved to a new state; a registration it held is returned.
    Transition {
        from: ReqState,
        mr: Option<Arc<MemoryRegion>>,
    },
    /// The completion belongs to a released slot.
    Stale,
}

/// Slots of one endpoint.
pub struct RequestTable {
    ep: usize,
    slots: Mutex<Vec<ReqSlot>>,
    free: ArrayQueue<u32>,
}

impl RequestTable {
    pub fn new(ep: usize) -> Self {
        Self {
            ep,
            slots: Mutex::new(Vec::new()),
            free: ArrayQueue::new(MAX_REQS_PER_EP),
        }
    }

    /// Take a slot in `state` for `req`.
    pub fn acquire(&self, state: ReqState, req: ProviderReq) -> Result<Token> {
        let mut slots = self.slots.lock();
        let idx = match self.free.pop() {
            Some(idx) => idx as usize,
            None => {
                if slots.len() >= MAX_REQS_PER_EP {
                    return Err(SkeinError::InvalidArgument(format!(
                        "more than {MAX_REQS_PER_EP} operations outstanding on endpoint {}",
                        self.ep
                    )));
                }
                slots.push(ReqSlot {
                    generation: 0,
                    state: ReqState::Completed,
                    recv_len: 0,
                    req: None,
                });
                slots.len() - 1
            }
        };
        let slot = &mut slots[idx];
        slot.state = state;
        slot.recv_len = 0;
        slot.req = Some(req);
        Ok(Token::new(self.ep, slot.generation, idx as u32))
    }

    /// Free a slot; later completions for its token become stale.
    pub fn release(&self, token: Token) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(token.slot()) else {
            return;
        };
        if slot.generation != token.generation() {
            return;
        }
        slot.generation = slot.generation.wrapping_add(1);
        slot.req = None;
        drop(slots);
        // capacity equals the slot limit, so this cannot overflow
        let _ = self.free.push(token.slot() as u32);
    }

    /// Current state and received length, `None` for a stale token.
    pub fn state(&self, token: Token) -> Option<(ReqState, usize)> {
        let slots = self.slots.lock();
        slots
            .get(token.slot())
            .filter(|s| s.generation == token.generation())
            .map(|s| (s.state, s.recv_len))
    }

    /// Provider index of a live token.
    pub fn prov(&self, token: Token) -> Option<usize> {
        let slots = self.slots.lock();
        slots
            .get(token.slot())
            .filter(|s| s.generation == token.generation())
            .and_then(|s| s.req.as_ref().map(ProviderReq::prov))
    }

    /// Move a live slot to `to`, recording `recv_len` when given.
    ///
    /// `allowed` maps the current state to whether the move is legal; an
    /// illegal move is reported back through `Transition::from` unchanged.
    pub fn apply(
        &self,
        token: Token,
        allowed: impl Fn(ReqState) -> Option<ReqState>,
        recv_len: Option<usize>,
    ) -> Applied {
        let mut slots = self.slots.lock();
        let Some(slot) = slots
            .get_mut(token.slot())
            .filter(|s| s.generation == token.generation())
        else {
            return Applied::Stale;
        };
        let from = slot.state;
        let mut mr = None;
        if let Some(to) = allowed(from) {
            slot.state = to;
            if let Some(len) = recv_len {
                slot.recv_len = len;
            }
            if to != ReqState::PeekStarted && to != ReqState::Posted {
                mr = slot.req.as_mut().and_then(ProviderReq::take_mr);
            }
        }
        Applied::Transition { from, mr }
    }

    /// Force a live slot into `state`, returning any registration it held.
    pub fn set_state(&self, token: Token, state: ReqState) -> Option<Arc<MemoryRegion>> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(token.slot())
            .filter(|s| s.generation == token.generation())?;
        slot.state = state;
        slot.req.as_mut().and_then(ProviderReq::take_mr)
    }

    /// Slots holding an operation.
    pub fn live(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.req.is_some()).count()
    }
}

impl std::fmt::Debug for RequestTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestTable")
            .field("ep", &self.ep)
            .field("slots", &self.slots.lock().len())
            .field("free", &self.free.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn posted_to_completed(s: ReqState) -> Option<ReqState> {
        (s == ReqState::Posted).then_some(ReqState::Completed)
    }

    #[test]
    fn test_token_packing() {
        let t = Token::new(3, 0xbeef, 77);
        assert_eq!((t.ep(), t.generation(), t.slot()), (3, 0xbeef, 77));
        assert_eq!(Token::from_context(t.context()), t);
    }

    #[test]
    fn test_slot_reuse_bumps_generation() {
        let table = RequestTable::new(1);
        let a = table.acquire(ReqState::Posted, ProviderReq::new(0, true, None)).unwrap();
        table.release(a);
        let b = table.acquire(ReqState::Posted, ProviderReq::new(1, false, None)).unwrap();
        assert_eq!(a.slot(), b.slot());
        assert_ne!(a.generation(), b.generation());
        assert!(table.state(a).is_none());
        assert!(matches!(table.apply(a, posted_to_completed, None), Applied::Stale));
        assert_eq!(table.prov(b), Some(1));
    }

    #[test]
    fn test_completion_records_len() {
        let table = RequestTable::new(0);
        let t = table.acquire(ReqState::Posted, ProviderReq::new(0, false, None)).unwrap();
        match table.apply(t, posted_to_completed, Some(42)) {
            Applied::Transition { from, .. } => assert_eq!(from, ReqState::Posted),
            Applied::Stale => panic!("live slot reported stale"),
        }
        assert_eq!(table.state(t), Some((ReqState::Completed, 42)));

        // a second completion leaves the state alone
        match table.apply(t, posted_to_completed, Some(7)) {
            Applied::Transition { from, .. } => assert_eq!(from, ReqState::Completed),
            Applied::Stale => panic!("live slot reported stale"),
        }
        assert_eq!(table.state(t), Some((ReqState::Completed, 42)));
    }

    #[test]
    fn test_failure_returns_registration_slot() {
        let table = RequestTable::new(0);
        let t = table.acquire(ReqState::Posted, ProviderReq::new(2, false, None)).unwrap();
        let to_failed = |s: ReqState| (s == ReqState::Posted).then_some(ReqState::Failed(CqErrKind::Truncated));
        assert!(matches!(
            table.apply(t, to_failed, None),
            Applied::Transition { from: ReqState::Posted, .. }
        ));
        assert_eq!(table.state(t), Some((ReqState::Failed(CqErrKind::Truncated), 0)));
        assert_eq!(table.prov(t), Some(2));
        table.release(t);
        assert_eq!(table.live(), 0);
    }

    #[test]
    fn test_live_count() {
        let table = RequestTable::new(0);
        let ts: Vec<_> = (0..4)
            .map(|_| table.acquire(ReqState::Posted, ProviderReq::new(0, true, None)).unwrap())
            .collect();
        assert_eq!(table.live(), 4);
        for t in ts {
            table.release(t);
        }
        assert_eq!(table.live(), 0);
    }
}
