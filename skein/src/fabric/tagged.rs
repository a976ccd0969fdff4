//! Software tagged-message matching and completion queues shared by the
//! built-in providers.

use super::{CompFlags, CqEntry, CqErrEntry, CqErrKind, MrAccess, MrHandle, MrRequest};
use crate::types::{FI_ADDR_UNSPEC, FiAddr};
use std::collections::{HashMap, VecDeque};

/// A receive waiting for a matching message.
#[derive(Debug, Clone, Copy)]
pub struct PostedRecv {
    pub src: FiAddr,
    pub tag: u64,
    pub ignore: u64,
    pub buf: u64,
    pub len: usize,
    pub context: u64,
}

/// A message that arrived before any matching receive.
#[derive(Debug)]
struct Unexpected {
    src: FiAddr,
    tag: u64,
    data: Vec<u8>,
}

fn tag_matches(want: u64, ignore: u64, got: u64) -> bool {
    (want | ignore) == (got | ignore)
}

fn src_matches(want: FiAddr, got: FiAddr) -> bool {
    want == FI_ADDR_UNSPEC || want == got
}

/// Copy a matched message into the posted buffer and build its completion.
///
/// # Safety
/// `recv.buf` must be valid for writes of `recv.len` bytes.
unsafe fn complete_recv(recv: &PostedRecv, tag: u64, data: &[u8]) -> CqEvent {
    let n = data.len().min(recv.len);
    if n > 0 {
        // SAFETY: caller guarantees the posted buffer covers `recv.len` bytes.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), recv.buf as *mut u8, n) };
    }
    if data.len() > recv.len {
        return CqEvent::Error(CqErrEntry {
            context: recv.context,
            kind: CqErrKind::Truncated,
            olen: data.len() - recv.len,
        });
    }
    CqEvent::Done(CqEntry {
        context: recv.context,
        flags: CompFlags::RECV | CompFlags::TAGGED,
        len: n,
        tag,
    })
}

/// Posted and unexpected queues of one receive context.
#[derive(Debug, Default)]
pub struct RxContext {
    posted: VecDeque<PostedRecv>,
    unexpected: VecDeque<Unexpected>,
}

impl RxContext {
    /// Match an incoming message against posted receives, queueing it as
    /// unexpected when nothing matches.
    ///
    /// # Safety
    /// Every posted buffer must still be valid for writes.
    pub unsafe fn deliver(&mut self, src: FiAddr, tag: u64, data: Vec<u8>) -> Option<CqEvent> {
        let pos = self
            .posted
            .iter()
            .position(|r| src_matches(r.src, src) && tag_matches(r.tag, r.ignore, tag));
        match pos.and_then(|p| self.posted.remove(p)) {
            // SAFETY: forwarded from the caller.
            Some(recv) => Some(unsafe { complete_recv(&recv, tag, &data) }),
            None => {
                self.unexpected.push_back(Unexpected { src, tag, data });
                None
            }
        }
    }

    /// Post a receive, completing it at once against an unexpected message.
    ///
    /// # Safety
    /// `recv.buf` must be valid for writes of `recv.len` bytes until completion.
    pub unsafe fn post(&mut self, recv: PostedRecv) -> Option<CqEvent> {
        let pos = self
            .unexpected
            .iter()
            .position(|m| src_matches(recv.src, m.src) && tag_matches(recv.tag, recv.ignore, m.tag));
        match pos.and_then(|p| self.unexpected.remove(p)) {
            // SAFETY: forwarded from the caller.
            Some(msg) => Some(unsafe { complete_recv(&recv, msg.tag, &msg.data) }),
            None => {
                self.posted.push_back(recv);
                None
            }
        }
    }

    /// Report a matching unexpected message without consuming it.
    pub fn peek(&self, src: FiAddr, tag: u64, ignore: u64, context: u64) -> CqEvent {
        match self
            .unexpected
            .iter()
            .find(|m| src_matches(src, m.src) && tag_matches(tag, ignore, m.tag))
        {
            Some(msg) => CqEvent::Done(CqEntry {
                context,
                flags: CompFlags::RECV | CompFlags::TAGGED | CompFlags::PEEK,
                len: msg.data.len(),
                tag: msg.tag,
            }),
            None => CqEvent::Error(CqErrEntry {
                context,
                kind: CqErrKind::NoMessage,
                olen: 0,
            }),
        }
    }

    /// Remove a posted receive. Returns whether it was still pending.
    pub fn cancel(&mut self, context: u64) -> bool {
        match self.posted.iter().position(|r| r.context == context) {
            Some(p) => {
                self.posted.remove(p);
                true
            }
            None => false,
        }
    }

    pub fn posted_len(&self) -> usize {
        self.posted.len()
    }

    pub fn unexpected_len(&self) -> usize {
        self.unexpected.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqEvent {
    Done(CqEntry),
    Error(CqErrEntry),
}

/// Outcome of a completion-queue read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqRead {
    /// This many entries were appended to the output.
    Read(usize),
    /// Queue is empty.
    Again,
    /// An error entry is at the head; fetch it with `cq_readerr`.
    ErrorAvailable,
}

/// In-order completion queue. Error entries block regular reads until
/// they are taken, as with libfabric's `-FI_EAVAIL`.
#[derive(Debug, Default)]
pub struct CompletionQueue {
    events: VecDeque<CqEvent>,
}

impl CompletionQueue {
    pub fn push(&mut self, ev: CqEvent) {
        self.events.push_back(ev);
    }

    pub fn read(&mut self, out: &mut Vec<CqEntry>, max: usize) -> CqRead {
        let mut n = 0;
        while n < max {
            match self.events.front() {
                Some(CqEvent::Done(entry)) => {
                    out.push(*entry);
                    self.events.pop_front();
                    n += 1;
                }
                Some(CqEvent::Error(_)) if n == 0 => return CqRead::ErrorAvailable,
                _ => break,
            }
        }
        if n == 0 { CqRead::Again } else { CqRead::Read(n) }
    }

    pub fn readerr(&mut self) -> Option<CqErrEntry> {
        match self.events.front() {
            Some(CqEvent::Error(err)) => {
                let err = *err;
                self.events.pop_front();
                Some(err)
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Matching state and completion queue of one endpoint context.
#[derive(Debug, Default)]
pub struct EpState {
    pub rx: RxContext,
    pub cq: CompletionQueue,
}

impl EpState {
    pub fn push_done(&mut self, context: u64, flags: CompFlags, len: usize, tag: u64) {
        self.cq.push(CqEvent::Done(CqEntry {
            context,
            flags,
            len,
            tag,
        }));
    }

    pub fn push_error(&mut self, context: u64, kind: CqErrKind) {
        self.cq.push(CqEvent::Error(CqErrEntry {
            context,
            kind,
            olen: 0,
        }));
    }

    /// Post a receive or a peek and queue whatever completes immediately.
    ///
    /// # Safety
    /// For non-peek receives `recv.buf` must be valid for writes of `recv.len`
    /// bytes until completion.
    pub unsafe fn post_recv(&mut self, recv: PostedRecv, peek: bool) {
        if peek {
            let ev = self.rx.peek(recv.src, recv.tag, recv.ignore, recv.context);
            self.cq.push(ev);
            return;
        }
        // SAFETY: forwarded from the caller.
        if let Some(ev) = unsafe { self.rx.post(recv) } {
            self.cq.push(ev);
        }
    }

    /// Deliver an incoming message, queueing the receive completion if it matched.
    ///
    /// # Safety
    /// Posted buffers must still be valid for writes.
    pub unsafe fn deliver(&mut self, src: FiAddr, tag: u64, data: Vec<u8>) {
        // SAFETY: forwarded from the caller.
        if let Some(ev) = unsafe { self.rx.deliver(src, tag, data) } {
            self.cq.push(ev);
        }
    }

    pub fn cancel(&mut self, context: u64) -> bool {
        if self.rx.cancel(context) {
            self.push_error(context, CqErrKind::Canceled);
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Region {
    addr: u64,
    len: usize,
    access: MrAccess,
}

/// Registered regions of a domain, keyed by remote key.
#[derive(Debug, Default)]
pub struct RegionTable {
    regions: HashMap<u64, Region>,
}

impl RegionTable {
    /// Register under the requested key; fails if the key is taken.
    pub fn register(&mut self, req: &MrRequest) -> Option<MrHandle> {
        if self.regions.contains_key(&req.requested_key) {
            return None;
        }
        self.regions.insert(
            req.requested_key,
            Region {
                addr: req.addr,
                len: req.len,
                access: req.access,
            },
        );
        Some(MrHandle {
            addr: req.addr,
            len: req.len,
            local_key: req.requested_key,
            remote_key: req.requested_key,
            hmem: req.hmem,
        })
    }

    pub fn deregister(&mut self, key: u64) -> bool {
        self.regions.remove(&key).is_some()
    }

    /// Whether `[addr, addr + len)` lies in the region `key` with `access`.
    pub fn covers(&self, key: u64, addr: u64, len: usize, access: MrAccess) -> bool {
        self.regions.get(&key).is_some_and(|r| {
            r.access.contains(access)
                && addr >= r.addr
                && addr
                    .checked_add(len as u64)
                    .is_some_and(|end| end <= r.addr + r.len as u64)
        })
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
