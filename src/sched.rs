use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::stack::Stack;
use crate::value::{SymbolId, Value, NIL};

pub type CtxId = u32;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CtxState {
    Ready,
    BlockedRecv,
    BlockedEvent,
    Sleeping,
    Done,
    Killed,
}

/// An evaluation context: the registers of one cooperative evaluator,
/// its continuation stack, and its mailbox. Contexts live in the
/// scheduler's slab and are taken out while running.
pub struct Context {
    pub id: CtxId,
    /// Remaining top-level forms; the evaluator steps to the next one
    /// when the `DONE` frame pops.
    pub program: Value,
    pub curr_exp: Value,
    pub curr_env: Value,
    pub r: Value,
    pub k: Stack,
    pub mailbox: VecDeque<Value>,
    pub mailbox_cap: usize,
    pub state: CtxState,
    pub wake_time: u64,
    pub event_tag: Option<SymbolId>,
    pub app_cont: bool,
    pub kill_requested: bool,
    /// Reductions since the last GC cycle; two GCs with no reduction in
    /// between fail the context instead of looping.
    pub non_gc: u32,
}

impl Context {
    /// Values the collector must treat as roots for this context.
    pub fn roots(&self, out: &mut Vec<Value>) {
        out.push(self.program);
        out.push(self.curr_exp);
        out.push(self.curr_env);
        out.push(self.r);
        out.extend_from_slice(self.k.live());
        out.extend(self.mailbox.iter().copied());
    }
}

/// Read-only view of a context handed to the host iterators.
pub struct ContextView {
    pub id: CtxId,
    pub state: CtxState,
    pub sp: usize,
    pub max_sp: usize,
    pub mailbox_len: usize,
    pub wake_time: u64,
}

/// A value a host thread may hand across the port. Heap allocation for
/// it happens on the evaluator thread when the inbox drains, keeping the
/// heap single-owner.
#[derive(Clone, Debug)]
pub enum HostValue {
    Nil,
    Int(i32),
    Uint(u32),
    Char(u8),
    Symbol(String),
    Str(String),
}

/// The cross-thread surface: pending host messages and events plus the
/// pause/kill request flags, all behind one mutex. Everything else in
/// the runtime is touched only by the evaluator thread.
#[derive(Default)]
pub struct Inbox {
    pub messages: Vec<(CtxId, HostValue)>,
    pub events: Vec<(String, HostValue)>,
    pub pause: bool,
    pub kill: bool,
}

/// Cloneable handle a host thread uses to reach a running evaluator.
#[derive(Clone)]
pub struct HostPort {
    inner: Arc<Mutex<Inbox>>,
}

impl HostPort {
    pub fn new() -> HostPort {
        HostPort {
            inner: Arc::new(Mutex::new(Inbox::default())),
        }
    }

    pub fn send_message(&self, cid: CtxId, v: HostValue) {
        self.inner.lock().messages.push((cid, v));
    }

    pub fn push_event(&self, tag: &str, v: HostValue) {
        self.inner.lock().events.push((tag.to_string(), v));
    }

    pub fn request_pause(&self, on: bool) {
        self.inner.lock().pause = on;
    }

    pub fn request_kill(&self) {
        self.inner.lock().kill = true;
    }

    /// Take everything pending. Called from the evaluator thread at the
    /// scheduling safepoint.
    pub fn drain(&self) -> Inbox {
        let mut guard = self.inner.lock();
        Inbox {
            messages: std::mem::take(&mut guard.messages),
            events: std::mem::take(&mut guard.events),
            pause: guard.pause,
            kill: guard.kill,
        }
    }

    pub fn clear_kill(&self) {
        self.inner.lock().kill = false;
    }
}

/// Context slab plus the four state queues. Round-robin over `ready`;
/// `sleeping` is kept sorted by wake time.
pub struct Scheduler {
    ctxs: HashMap<CtxId, Context>,
    pub ready: VecDeque<CtxId>,
    pub sleeping: Vec<(u64, CtxId)>,
    pub blocked_recv: Vec<CtxId>,
    pub blocked_event: Vec<CtxId>,
    pub events: VecDeque<(SymbolId, Value)>,
    pub event_cap: usize,
    next_id: CtxId,
}

impl Scheduler {
    pub fn new(event_cap: usize) -> Scheduler {
        Scheduler {
            ctxs: HashMap::new(),
            ready: VecDeque::new(),
            sleeping: Vec::new(),
            blocked_recv: Vec::new(),
            blocked_event: Vec::new(),
            events: VecDeque::new(),
            event_cap,
            next_id: 1,
        }
    }

    /// Create a ready context. Ids are positive and never reused.
    pub fn spawn(
        &mut self,
        program: Value,
        curr_exp: Value,
        curr_env: Value,
        stack: Stack,
        mailbox_cap: usize,
    ) -> CtxId {
        let id = self.next_id;
        self.next_id += 1;
        let ctx = Context {
            id,
            program,
            curr_exp,
            curr_env,
            r: NIL,
            k: stack,
            mailbox: VecDeque::new(),
            mailbox_cap,
            state: CtxState::Ready,
            wake_time: 0,
            event_tag: None,
            app_cont: false,
            kill_requested: false,
            non_gc: 1,
        };
        self.ctxs.insert(id, ctx);
        self.ready.push_back(id);
        id
    }

    pub fn take(&mut self, id: CtxId) -> Option<Context> {
        self.ctxs.remove(&id)
    }

    pub fn exists(&self, id: CtxId) -> bool {
        self.ctxs.contains_key(&id)
    }

    pub fn num_contexts(&self) -> usize {
        self.ctxs.len()
    }

    /// Re-queue a context at the tail of `ready` (round-robin).
    pub fn requeue_ready(&mut self, mut ctx: Context) {
        ctx.state = CtxState::Ready;
        self.ready.push_back(ctx.id);
        self.ctxs.insert(ctx.id, ctx);
    }

    pub fn park_sleeping(&mut self, mut ctx: Context, wake_time: u64) {
        ctx.state = CtxState::Sleeping;
        ctx.wake_time = wake_time;
        let pos = self
            .sleeping
            .partition_point(|&(t, _)| t <= wake_time);
        self.sleeping.insert(pos, (wake_time, ctx.id));
        self.ctxs.insert(ctx.id, ctx);
    }

    pub fn park_recv(&mut self, mut ctx: Context) {
        ctx.state = CtxState::BlockedRecv;
        self.blocked_recv.push(ctx.id);
        self.ctxs.insert(ctx.id, ctx);
    }

    pub fn park_event(&mut self, mut ctx: Context, tag: SymbolId) {
        ctx.state = CtxState::BlockedEvent;
        ctx.event_tag = Some(tag);
        self.blocked_event.push(ctx.id);
        self.ctxs.insert(ctx.id, ctx);
    }

    fn unlink(&mut self, id: CtxId) {
        self.ready.retain(|&c| c != id);
        self.sleeping.retain(|&(_, c)| c != id);
        self.blocked_recv.retain(|&c| c != id);
        self.blocked_event.retain(|&c| c != id);
    }

    /// Drop a context from every queue and the slab (done or killed).
    /// Its stack buffer is released with it.
    pub fn remove(&mut self, id: CtxId) -> Option<Context> {
        self.unlink(id);
        self.ctxs.remove(&id)
    }

    /// Mark a context for death. A blocked or sleeping target is made
    /// ready so the safepoint can observe the flag.
    pub fn kill(&mut self, id: CtxId) -> bool {
        match self.ctxs.get_mut(&id) {
            Some(ctx) => {
                ctx.kill_requested = true;
                if ctx.state != CtxState::Ready {
                    self.unlink(id);
                    let ctx = self.ctxs.get_mut(&id).unwrap();
                    ctx.state = CtxState::Ready;
                    self.ready.push_back(id);
                }
                true
            }
            None => false,
        }
    }

    /// Enqueue `msg` for `cid`. False when the target is gone or its
    /// mailbox is full; the sender is never blocked. A target blocked on
    /// receive becomes ready.
    pub fn deliver(&mut self, cid: CtxId, msg: Value) -> bool {
        let Some(ctx) = self.ctxs.get_mut(&cid) else {
            return false;
        };
        if ctx.mailbox.len() >= ctx.mailbox_cap {
            return false;
        }
        ctx.mailbox.push_back(msg);
        if ctx.state == CtxState::BlockedRecv {
            self.blocked_recv.retain(|&c| c != cid);
            let ctx = self.ctxs.get_mut(&cid).unwrap();
            ctx.state = CtxState::Ready;
            self.ready.push_back(cid);
        }
        true
    }

    /// Push a `(tag, payload)` event. False when the queue is full.
    pub fn push_event(&mut self, tag: SymbolId, payload: Value) -> bool {
        if self.events.len() >= self.event_cap {
            return false;
        }
        self.events.push_back((tag, payload));
        self.wake_event_waiters();
        true
    }

    /// Take the oldest event with `tag`, if any.
    pub fn take_event(&mut self, tag: SymbolId) -> Option<Value> {
        let pos = self.events.iter().position(|&(t, _)| t == tag)?;
        self.events.remove(pos).map(|(_, v)| v)
    }

    fn wake_event_waiters(&mut self) {
        let tags: Vec<SymbolId> = self.events.iter().map(|&(t, _)| t).collect();
        let woken: Vec<CtxId> = self
            .blocked_event
            .iter()
            .copied()
            .filter(|id| {
                self.ctxs
                    .get(id)
                    .and_then(|c| c.event_tag)
                    .map(|t| tags.contains(&t))
                    .unwrap_or(false)
            })
            .collect();
        for id in woken {
            self.blocked_event.retain(|&c| c != id);
            let ctx = self.ctxs.get_mut(&id).unwrap();
            ctx.state = CtxState::Ready;
            ctx.event_tag = None;
            self.ready.push_back(id);
        }
    }

    /// Move every context whose wake time has passed to `ready`.
    pub fn wake_sleepers(&mut self, now: u64) {
        while let Some(&(t, id)) = self.sleeping.first() {
            if t > now {
                break;
            }
            self.sleeping.remove(0);
            let ctx = self.ctxs.get_mut(&id).unwrap();
            ctx.state = CtxState::Ready;
            self.ready.push_back(id);
        }
    }

    /// The earliest pending wake time, if anything sleeps.
    pub fn next_wake(&self) -> Option<u64> {
        self.sleeping.first().map(|&(t, _)| t)
    }

    pub fn has_blocked(&self) -> bool {
        !self.blocked_recv.is_empty() || !self.blocked_event.is_empty()
    }

    /// GC roots across every parked context and pending event payload.
    pub fn roots(&self, out: &mut Vec<Value>) {
        for ctx in self.ctxs.values() {
            ctx.roots(out);
        }
        out.extend(self.events.iter().map(|&(_, v)| v));
    }

    pub fn all_ids(&self) -> Vec<CtxId> {
        self.ctxs.keys().copied().collect()
    }

    pub fn views(&self, state: CtxState) -> Vec<ContextView> {
        self.ctxs
            .values()
            .filter(|c| c.state == state)
            .map(|c| ContextView {
                id: c.id,
                state: c.state,
                sp: c.k.sp(),
                max_sp: c.k.max_sp(),
                mailbox_len: c.mailbox.len(),
                wake_time: c.wake_time,
            })
            .collect()
    }
}
