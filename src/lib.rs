//! An embeddable Lisp dialect for memory-constrained hosts: a tagged
//! cell heap with a precise mark-sweep collector, a continuation-passing
//! evaluator, and a cooperative scheduler multiplexing evaluation
//! contexts that talk through mailboxes.
//!
//! All state lives in a [`Runtime`] value constructed from a
//! [`RuntimeConfig`]; there are no process-wide singletons, so isolated
//! runtimes can coexist in one process. A [`HostPort`] is the only
//! cross-thread surface: messages, events and pause/kill requests pass
//! through it and are drained by the evaluator thread at safepoints.

pub mod channel;
pub mod consts;
pub mod env;
pub mod error;
mod eval;
pub mod extension;
pub mod fundamental;
pub mod heap;
pub mod image;
pub mod mem;
pub mod pattern;
pub mod printer;
pub mod reader;
pub mod sched;
pub mod stack;
pub mod symbol;
pub mod value;

use std::collections::HashMap;
use std::time::Instant;

pub use error::{Result, RuntimeError};
pub use sched::{CtxId, CtxState, ContextView, HostPort, HostValue};
pub use value::{sym, SymbolId, Value, NIL, TRUE};

use consts::ConstHeap;
use extension::{ExtensionFn, ExtensionTable};
use fundamental::TypeSyms;
use heap::Heap;
use mem::AuxMem;
use sched::Scheduler;
use stack::Stack;
use symbol::SymbolTable;

/// Region sizes and evaluator knobs. Sizes are in cells/words, not
/// bytes; the defaults suit tests and the REPL on a hosted machine.
pub struct RuntimeConfig {
    pub heap_cells: usize,
    pub aux_words: usize,
    pub const_words: usize,
    /// Depth of the GC marking stack. Overflow is a fatal condition.
    pub gc_stack_depth: usize,
    /// Per-context continuation stack capacity.
    pub ctx_stack_cap: usize,
    /// Double the continuation stack on demand instead of failing.
    pub ctx_stack_grow: bool,
    /// Reductions per scheduling slice.
    pub quantum: u32,
    /// Free-cell count below which a collection is requested at the
    /// next safepoint. Zero picks `heap_cells / 32`.
    pub gc_low_water: usize,
    pub mailbox_cap: usize,
    pub event_queue_cap: usize,
    pub extension_capacity: usize,
    /// Depth bound for the printer.
    pub print_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            heap_cells: 16 * 1024,
            aux_words: 8 * 1024,
            const_words: 4 * 1024,
            gc_stack_depth: 1024,
            ctx_stack_cap: 256,
            ctx_stack_grow: true,
            quantum: 128,
            gc_low_water: 0,
            mailbox_cap: 16,
            event_queue_cap: 16,
            extension_capacity: 32,
            print_depth: 24,
        }
    }
}

/// What the evaluator is currently doing, as the host sees it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EvalState {
    Running,
    Paused,
    /// No context has work pending.
    Idle,
    /// A kill request is being honored.
    Kill,
    /// `kill_all` completed; the runtime holds no contexts.
    Dead,
}

/// Host callbacks. The defaults use std timing; embedded hosts replace
/// them with platform primitives.
pub struct Hooks {
    pub ctx_done: Option<Box<dyn FnMut(CtxId, Value, &str) + Send>>,
    pub critical: Option<Box<dyn FnMut(&str) + Send>>,
    pub timestamp: Box<dyn FnMut() -> u64 + Send>,
    pub usleep: Box<dyn FnMut(u64) + Send>,
}

impl Default for Hooks {
    fn default() -> Self {
        let epoch = Instant::now();
        Hooks {
            ctx_done: None,
            critical: None,
            timestamp: Box::new(move || epoch.elapsed().as_micros() as u64),
            usleep: Box::new(|us| std::thread::sleep(std::time::Duration::from_micros(us))),
        }
    }
}

/// One interpreter instance: heap, auxiliary memory, constant heap,
/// symbol table, extension registry, scheduler, and the global
/// environment, threaded explicitly through every operation.
pub struct Runtime {
    pub(crate) heap: Heap,
    pub(crate) mem: AuxMem,
    pub(crate) consts: ConstHeap,
    pub(crate) symbols: SymbolTable,
    pub(crate) global_env: Value,
    pub(crate) types: TypeSyms,
    pub(crate) extensions: ExtensionTable,
    pub(crate) sched: Scheduler,
    pub(crate) hooks: Hooks,
    pub(crate) finished: HashMap<CtxId, Value>,
    pub(crate) gc_requested: bool,
    pub(crate) gc_low_water: usize,
    pub(crate) quantum: u32,
    pub(crate) ctx_stack_cap: usize,
    pub(crate) ctx_stack_grow: bool,
    pub(crate) mailbox_cap: usize,
    pub(crate) print_depth: usize,
    port: HostPort,
    paused: bool,
    dead: bool,
}

impl Runtime {
    pub fn new(cfg: RuntimeConfig) -> Result<Runtime> {
        if cfg.heap_cells == 0 || cfg.aux_words == 0 {
            return Err(RuntimeError::Init("empty memory region".into()));
        }
        let mem = AuxMem::new(cfg.aux_words);
        let symbols = SymbolTable::new();
        let types = TypeSyms::new(&symbols, &mem);
        Ok(Runtime {
            heap: Heap::new(cfg.heap_cells, cfg.gc_stack_depth),
            mem,
            consts: ConstHeap::new(cfg.const_words),
            symbols,
            global_env: NIL,
            types,
            extensions: ExtensionTable::new(cfg.extension_capacity),
            sched: Scheduler::new(cfg.event_queue_cap),
            hooks: Hooks::default(),
            finished: HashMap::new(),
            gc_requested: false,
            gc_low_water: if cfg.gc_low_water > 0 {
                cfg.gc_low_water
            } else {
                cfg.heap_cells / 32
            },
            quantum: cfg.quantum.max(1),
            ctx_stack_cap: cfg.ctx_stack_cap,
            ctx_stack_grow: cfg.ctx_stack_grow,
            mailbox_cap: cfg.mailbox_cap,
            print_depth: cfg.print_depth,
            port: HostPort::new(),
            paused: false,
            dead: false,
        })
    }

    // ------------------------------------------------------------------
    // Host wiring
    // ------------------------------------------------------------------

    /// Handle for other threads; see [`HostPort`].
    pub fn port(&self) -> HostPort {
        self.port.clone()
    }

    pub fn set_ctx_done_callback(&mut self, f: Box<dyn FnMut(CtxId, Value, &str) + Send>) {
        self.hooks.ctx_done = Some(f);
    }

    pub fn set_critical_error_callback(&mut self, f: Box<dyn FnMut(&str) + Send>) {
        self.hooks.critical = Some(f);
    }

    pub fn set_timestamp_callback(&mut self, f: Box<dyn FnMut() -> u64 + Send>) {
        self.hooks.timestamp = f;
    }

    pub fn set_usleep_callback(&mut self, f: Box<dyn FnMut(u64) + Send>) {
        self.hooks.usleep = f;
    }

    /// Register a host operation callable from Lisp by name.
    pub fn add_extension(&mut self, name: &str, f: ExtensionFn) -> bool {
        self.extensions
            .add(&mut self.symbols, &self.mem, name, f)
            .is_some()
    }

    /// Install a write-through hook on the constant heap.
    pub fn const_heap_write_fun(&mut self, f: Box<dyn FnMut(u32, u64) -> bool + Send>) {
        self.consts.set_write_fun(f);
    }

    // ------------------------------------------------------------------
    // Programs
    // ------------------------------------------------------------------

    /// Intern a symbol, collecting once if auxiliary memory is full.
    pub fn intern(&mut self, name: &str) -> Result<SymbolId> {
        if let Some(id) = self.symbols.intern(&mut self.mem, name) {
            return Ok(id);
        }
        self.run_gc(None)?;
        self.symbols
            .intern(&mut self.mem, name)
            .ok_or_else(|| RuntimeError::Init("symbol memory exhausted".into()))
    }

    /// Parse every top-level form in `src` onto the heap.
    pub fn read_all(&mut self, src: &str) -> Result<Vec<Value>> {
        let mut chan = channel::StringChannel::new(src);
        let mut forms = Vec::new();
        let mut r = reader::Reader::new(
            &mut chan,
            &mut self.heap,
            &mut self.mem,
            &mut self.symbols,
        );
        while let Some(form) = r.read()? {
            forms.push(form);
        }
        Ok(forms)
    }

    /// Parse `src` and enqueue a fresh context that evaluates its forms
    /// one by one. Returns the context id.
    pub fn load_program(&mut self, src: &str) -> Result<CtxId> {
        let forms = self.read_all(src)?;
        self.spawn_program(&forms)
    }

    /// Parse from a character channel (the external parser interface).
    pub fn load_channel(&mut self, chan: &mut dyn channel::CharChannel) -> Result<CtxId> {
        let mut forms = Vec::new();
        let mut r = reader::Reader::new(chan, &mut self.heap, &mut self.mem, &mut self.symbols);
        while let Some(form) = r.read()? {
            forms.push(form);
        }
        self.spawn_program(&forms)
    }

    fn spawn_program(&mut self, forms: &[Value]) -> Result<CtxId> {
        let mut program = NIL;
        for &f in forms.iter().rev() {
            program = self.heap.cons(f, program);
            if program.is_oom() {
                return Err(RuntimeError::Init("heap exhausted while loading".into()));
            }
        }
        let (first, rest) = if program.is_cons() {
            (self.car(program), self.cdr(program))
        } else {
            (NIL, NIL)
        };
        let mut k = Stack::new(self.ctx_stack_cap, self.ctx_stack_grow);
        if !eval::seed_stack(&mut k) {
            return Err(RuntimeError::Init("context stack too small".into()));
        }
        Ok(self.sched.spawn(rest, first, NIL, k, self.mailbox_cap))
    }

    /// Convenience: load `src`, run until idle, and return the final
    /// value of its context.
    pub fn eval_program(&mut self, src: &str) -> Result<Value> {
        let cid = self.load_program(src)?;
        self.run_until_idle()?;
        self.take_result(cid)
            .ok_or_else(|| RuntimeError::Init("program did not run to completion".into()))
    }

    /// The final value of a finished context, once.
    pub fn take_result(&mut self, cid: CtxId) -> Option<Value> {
        self.finished.remove(&cid)
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Run until every context is done, parked on a receive/event with
    /// nothing pending, or the runtime is paused or killed. Sleeping
    /// contexts are waited for.
    pub fn run_until_idle(&mut self) -> Result<()> {
        loop {
            self.drain_inbox()?;
            if self.paused || self.dead {
                return Ok(());
            }
            let now = (self.hooks.timestamp)();
            self.sched.wake_sleepers(now);
            let Some(cid) = self.sched.ready.pop_front() else {
                match self.sched.next_wake() {
                    Some(t) => {
                        let now = (self.hooks.timestamp)();
                        if t > now {
                            (self.hooks.usleep)(t - now);
                        }
                        continue;
                    }
                    None => return Ok(()),
                }
            };
            self.run_slice(cid)?;
        }
    }

    /// Run forever, idling between wake-ups, until a kill request
    /// arrives through the port. This is the dedicated-thread entry
    /// point.
    pub fn run(&mut self) -> Result<()> {
        const IDLE_POLL_US: u64 = 1000;
        loop {
            self.drain_inbox()?;
            if self.dead {
                return Ok(());
            }
            if self.paused {
                (self.hooks.usleep)(IDLE_POLL_US);
                continue;
            }
            let now = (self.hooks.timestamp)();
            self.sched.wake_sleepers(now);
            let Some(cid) = self.sched.ready.pop_front() else {
                let wait = match self.sched.next_wake() {
                    Some(t) if t > now => (t - now).min(IDLE_POLL_US),
                    Some(_) => continue,
                    None => IDLE_POLL_US,
                };
                (self.hooks.usleep)(wait);
                continue;
            };
            self.run_slice(cid)?;
        }
    }

    fn run_slice(&mut self, cid: CtxId) -> Result<()> {
        let Some(mut ctx) = self.sched.take(cid) else {
            return Ok(());
        };
        let outcome = match self.run_ctx(&mut ctx) {
            Ok(o) => o,
            Err(e) => {
                self.critical(&e.to_string());
                return Err(e);
            }
        };
        use eval::RunResult::*;
        match outcome {
            Finished(v) => self.finish_ctx(ctx, v),
            Yielded | Preempted => self.sched.requeue_ready(ctx),
            Sleeping(us) => {
                let now = (self.hooks.timestamp)();
                self.sched.park_sleeping(ctx, now + us);
            }
            BlockedRecv => self.sched.park_recv(ctx),
            BlockedEvent(tag) => self.sched.park_event(ctx, tag),
            Killed => self.finish_ctx(ctx, Value::Symbol(sym::RECOVERED)),
        }
        Ok(())
    }

    fn finish_ctx(&mut self, ctx: sched::Context, v: Value) {
        let id = ctx.id;
        drop(ctx);
        self.finished.insert(id, v);
        if let Some(cb) = &mut self.hooks.ctx_done {
            let rendered = printer::print_value(
                &self.heap,
                &self.mem,
                &self.consts,
                &self.symbols,
                v,
                self.print_depth,
            );
            cb(id, v, &rendered);
        }
    }

    fn critical(&mut self, msg: &str) {
        if let Some(cb) = &mut self.hooks.critical {
            cb(msg);
        }
    }

    fn drain_inbox(&mut self) -> Result<()> {
        let inbox = self.port.drain();
        self.paused = inbox.pause;
        if inbox.kill {
            self.port.clear_kill();
            self.kill_all();
            return Ok(());
        }
        for (cid, hv) in inbox.messages {
            if let Some(v) = self.host_value(hv) {
                self.sched.deliver(cid, v);
            }
        }
        for (tag, hv) in inbox.events {
            let tag_id = self.intern(&tag)?;
            if let Some(v) = self.host_value(hv) {
                self.sched.push_event(tag_id, v);
            }
        }
        Ok(())
    }

    /// Materialize a host value on the heap, on the evaluator thread.
    fn host_value(&mut self, hv: HostValue) -> Option<Value> {
        match hv {
            HostValue::Nil => Some(NIL),
            HostValue::Int(n) => Some(Value::Int(n)),
            HostValue::Uint(n) => Some(Value::Uint(n)),
            HostValue::Char(c) => Some(Value::Char(c)),
            HostValue::Symbol(name) => self.intern(&name).ok().map(Value::Symbol),
            HostValue::Str(s) => {
                let mut v = self.heap.alloc_array_from(&mut self.mem, s.as_bytes(), true);
                if v.is_oom() {
                    self.run_gc(None).ok()?;
                    v = self.heap.alloc_array_from(&mut self.mem, s.as_bytes(), true);
                }
                if v.is_oom() {
                    None
                } else {
                    Some(v)
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Direct (same-thread) host operations
    // ------------------------------------------------------------------

    /// Deliver a message to a context's mailbox. False when the target
    /// is gone or its mailbox is full.
    pub fn send_message(&mut self, cid: CtxId, v: HostValue) -> bool {
        match self.host_value(v) {
            Some(val) => self.sched.deliver(cid, val),
            None => false,
        }
    }

    /// Push a `(tag, payload)` event for `event-wait`ing contexts.
    pub fn push_event(&mut self, tag: &str, v: HostValue) -> Result<bool> {
        let tag_id = self.intern(tag)?;
        match self.host_value(v) {
            Some(val) => Ok(self.sched.push_event(tag_id, val)),
            None => Ok(false),
        }
    }

    /// Pause scheduling at the next safepoint, optionally collecting
    /// while quiesced.
    pub fn pause(&mut self, with_gc: bool) -> Result<()> {
        self.paused = true;
        self.port.request_pause(true);
        if with_gc {
            self.run_gc(None)?;
        }
        Ok(())
    }

    pub fn resume(&mut self) {
        self.paused = false;
        self.port.request_pause(false);
    }

    /// Drop every context. Their stacks are released; no done callbacks
    /// fire.
    pub fn kill_all(&mut self) {
        for id in self.sched.all_ids() {
            self.sched.remove(id);
        }
        self.dead = true;
    }

    pub fn eval_state(&self) -> EvalState {
        if self.dead {
            EvalState::Dead
        } else if self.paused {
            EvalState::Paused
        } else if self.sched.num_contexts() == 0 {
            EvalState::Idle
        } else {
            EvalState::Running
        }
    }

    /// Visit every runnable context with the scheduler quiesced.
    pub fn running_iterator(&self, mut f: impl FnMut(&ContextView)) {
        for v in self.sched.views(CtxState::Ready) {
            f(&v);
        }
    }

    /// Visit every parked context.
    pub fn blocked_iterator(&self, mut f: impl FnMut(&ContextView)) {
        for v in self
            .sched
            .views(CtxState::BlockedRecv)
            .into_iter()
            .chain(self.sched.views(CtxState::BlockedEvent))
            .chain(self.sched.views(CtxState::Sleeping))
        {
            f(&v);
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn heap_num_free(&self) -> usize {
        self.heap.num_free()
    }

    pub fn mem_num_free(&self) -> usize {
        self.mem.num_free()
    }

    pub fn num_symbols(&self) -> usize {
        self.symbols.count()
    }

    pub fn num_contexts(&self) -> usize {
        self.sched.num_contexts()
    }

    /// Collections performed since init.
    pub fn gc_runs(&self) -> u64 {
        self.heap.gc_runs()
    }

    /// Force a collection from the host, with the scheduler quiesced.
    pub fn gc_now(&mut self) -> Result<usize> {
        self.run_gc(None)
    }

    pub fn print_value(&self, v: Value) -> String {
        printer::print_value(
            &self.heap,
            &self.mem,
            &self.consts,
            &self.symbols,
            v,
            self.print_depth,
        )
    }
}
