//! The evaluator: a CPS-style dispatch loop over a context's registers
//! (`curr_exp`, `curr_env`, `r`, `K`). Every reduction either replaces
//! `curr_exp`, pushes a continuation frame, or sets `r` and enters
//! apply-continuation mode. Recursion lives entirely on the continuation
//! stack; the host stack never grows with expression depth.
//!
//! The top of the loop is the only safepoint: pending GC requests, kill
//! flags and quantum expiry are observed there and nowhere else.

use crate::env;
use crate::error::{Result, RuntimeError};
use crate::extension::ExtContext;
use crate::fundamental::{self, as_num, Fund};
use crate::heap::{car_val, cdr_val, list_length};
use crate::sched::Context;
use crate::stack::Stack;
use crate::value::{sym, SymbolId, Value, NIL, TRUE};
use crate::Runtime;

/// Continuation frame opcodes. Operands sit below the opcode word in a
/// fixed order per opcode.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ContOp {
    Done = 1,
    SetGlobalEnv = 2,
    FunctionApp = 3,
    Function = 4,
    BindToKeyRest = 5,
    If = 6,
    ArgList = 7,
    PrognRest = 8,
}

fn op(o: ContOp) -> Value {
    Value::Uint(o as u32)
}

fn decode_op(v: Value) -> Option<ContOp> {
    match v {
        Value::Uint(1) => Some(ContOp::Done),
        Value::Uint(2) => Some(ContOp::SetGlobalEnv),
        Value::Uint(3) => Some(ContOp::FunctionApp),
        Value::Uint(4) => Some(ContOp::Function),
        Value::Uint(5) => Some(ContOp::BindToKeyRest),
        Value::Uint(6) => Some(ContOp::If),
        Value::Uint(7) => Some(ContOp::ArgList),
        Value::Uint(8) => Some(ContOp::PrognRest),
        _ => None,
    }
}

/// How a scheduling slice of a context ended.
#[derive(Debug)]
pub(crate) enum RunResult {
    /// The context reached `DONE` with no program left (or failed).
    Finished(Value),
    /// Voluntary yield; requeue at the ready tail.
    Yielded,
    /// Sleep until the given absolute time (microseconds).
    Sleeping(u64),
    /// No matching message; park until a delivery.
    BlockedRecv,
    /// No matching event; park until one with this tag arrives.
    BlockedEvent(SymbolId),
    /// Quantum expired at the safepoint.
    Preempted,
    /// Kill flag observed.
    Killed,
}

enum Step {
    Continue,
    Finished(Value),
    Suspend(RunResult),
}

/// Push a fresh `DONE` frame onto a new context stack.
pub(crate) fn seed_stack(k: &mut Stack) -> bool {
    k.push(op(ContOp::Done))
}

impl Runtime {
    pub(crate) fn car(&self, v: Value) -> Value {
        car_val(&self.heap, &self.consts, v)
    }

    pub(crate) fn cdr(&self, v: Value) -> Value {
        cdr_val(&self.heap, &self.consts, v)
    }

    fn cadr(&self, v: Value) -> Value {
        self.car(self.cdr(v))
    }

    fn caddr(&self, v: Value) -> Value {
        self.car(self.cdr(self.cdr(v)))
    }

    fn cadddr(&self, v: Value) -> Value {
        self.car(self.cdr(self.cdr(self.cdr(v))))
    }

    fn length(&self, v: Value) -> Option<usize> {
        list_length(&self.heap, &self.consts, v)
    }

    /// Run `ctx` for up to one quantum of reductions. The caller parks
    /// or requeues the context according to the result.
    pub(crate) fn run_ctx(&mut self, ctx: &mut Context) -> Result<RunResult> {
        let mut quantum = self.quantum;
        loop {
            // Safepoint.
            if ctx.kill_requested {
                return Ok(RunResult::Killed);
            }
            // Low-water trigger, rate-limited by the progress counter so
            // a small live set cannot thrash the collector.
            if !self.gc_requested
                && self.heap.num_free() < self.gc_low_water
                && ctx.non_gc >= 32
            {
                self.gc_requested = true;
            }
            if self.gc_requested {
                if ctx.non_gc == 0 {
                    // Two collections with no reduction in between: the
                    // allocation cannot be satisfied.
                    self.gc_requested = false;
                    return Ok(RunResult::Finished(Value::oom()));
                }
                self.run_gc(Some(ctx))?;
                ctx.non_gc = 0;
            } else {
                ctx.non_gc = ctx.non_gc.saturating_add(1);
            }
            if quantum == 0 {
                return Ok(RunResult::Preempted);
            }
            quantum -= 1;

            let step = if ctx.app_cont {
                self.apply_continuation(ctx)?
            } else {
                self.eval_dispatch(ctx)?
            };
            match step {
                Step::Continue => {}
                Step::Finished(v) => return Ok(RunResult::Finished(v)),
                Step::Suspend(r) => return Ok(r),
            }
        }
    }

    /// Collect the full root set and collect. `current` is the context
    /// taken out of the scheduler for this slice, if any.
    pub(crate) fn run_gc(&mut self, current: Option<&Context>) -> Result<usize> {
        let mut roots = Vec::with_capacity(64);
        roots.push(self.global_env);
        self.sched.roots(&mut roots);
        if let Some(ctx) = current {
            ctx.roots(&mut roots);
        }
        roots.extend(self.finished.values().copied());
        let recovered = self.heap.gc(&mut self.mem, &roots)?;
        self.gc_requested = false;
        Ok(recovered)
    }

    // ------------------------------------------------------------------
    // Expression dispatch
    // ------------------------------------------------------------------

    fn eval_dispatch(&mut self, ctx: &mut Context) -> Result<Step> {
        let exp = ctx.curr_exp;
        match exp {
            Value::Symbol(id) => {
                // Reserved symbols, fundamentals and extensions evaluate
                // to themselves; everything else is a variable.
                if id.0 < sym::RUNTIME_BASE {
                    ctx.r = exp;
                    ctx.app_cont = true;
                    return Ok(Step::Continue);
                }
                let found = env::lookup(&self.heap, &self.consts, exp, ctx.curr_env)
                    .or_else(|| env::lookup(&self.heap, &self.consts, exp, self.global_env));
                match found {
                    Some(v) => {
                        ctx.r = v;
                        ctx.app_cont = true;
                        Ok(Step::Continue)
                    }
                    None => Ok(Step::Finished(Value::Symbol(sym::EVAL_ERROR))),
                }
            }
            v if v.is_self_evaluating() => {
                ctx.r = v;
                ctx.app_cont = true;
                Ok(Step::Continue)
            }
            Value::Cons(_) => {
                let head = self.car(exp);
                if let Value::Symbol(id) = head {
                    if sym::is_special_form(id) {
                        return self.eval_special(ctx, id);
                    }
                }
                self.eval_application(ctx, head)
            }
            // Raw words and region references are not expressions.
            _ => Ok(Step::Finished(Value::Symbol(sym::EVAL_ERROR))),
        }
    }

    fn eval_application(&mut self, ctx: &mut Context, head: Value) -> Result<Step> {
        let args = self.cdr(ctx.curr_exp);
        if !ctx.k.push_n(&[head, op(ContOp::Function)]) {
            return Ok(Step::Finished(Value::oom()));
        }
        if args.is_nil() {
            ctx.r = NIL;
            ctx.app_cont = true;
        } else {
            let rest = self.cdr(args);
            if !ctx.k.push_n(&[ctx.curr_env, NIL, rest, op(ContOp::ArgList)]) {
                return Ok(Step::Finished(Value::oom()));
            }
            ctx.curr_exp = self.car(args);
        }
        Ok(Step::Continue)
    }

    fn eval_special(&mut self, ctx: &mut Context, form: SymbolId) -> Result<Step> {
        let exp = ctx.curr_exp;
        match form {
            sym::QUOTE => {
                ctx.r = self.cadr(exp);
                ctx.app_cont = true;
                Ok(Step::Continue)
            }
            sym::DEFINE => {
                let key = self.cadr(exp);
                let val_exp = self.caddr(exp);
                match key {
                    Value::Symbol(id) if id != sym::NIL => {}
                    _ => return Ok(Step::Finished(Value::Symbol(sym::EVAL_ERROR))),
                }
                if !ctx.k.push_n(&[key, op(ContOp::SetGlobalEnv)]) {
                    return Ok(Step::Finished(Value::oom()));
                }
                ctx.curr_exp = val_exp;
                Ok(Step::Continue)
            }
            sym::LAMBDA => {
                let env_cpy = env::copy_shallow(&mut self.heap, &self.consts, ctx.curr_env);
                if env_cpy.is_oom() {
                    return Ok(self.gc_retry());
                }
                let closure = self.make_list4(
                    Value::Symbol(sym::CLOSURE),
                    self.cadr(exp),
                    self.caddr(exp),
                    env_cpy,
                );
                if closure.is_oom() {
                    return Ok(self.gc_retry());
                }
                ctx.r = closure;
                ctx.app_cont = true;
                Ok(Step::Continue)
            }
            sym::PROGN => {
                let exps = self.cdr(exp);
                if exps.is_nil() {
                    ctx.r = NIL;
                    ctx.app_cont = true;
                    return Ok(Step::Continue);
                }
                let rest = self.cdr(exps);
                if !ctx.k.push_n(&[rest, op(ContOp::PrognRest)]) {
                    return Ok(Step::Finished(Value::oom()));
                }
                ctx.curr_exp = self.car(exps);
                Ok(Step::Continue)
            }
            sym::IF => {
                let then_b = self.caddr(exp);
                let else_b = self.cadddr(exp);
                if !ctx.k.push_n(&[else_b, then_b, op(ContOp::If)]) {
                    return Ok(Step::Finished(Value::oom()));
                }
                ctx.curr_exp = self.cadr(exp);
                Ok(Step::Continue)
            }
            sym::COND => {
                // (cond (c e) ...) rewrites to (if c (progn e...) (cond ...)).
                let clauses = self.cdr(exp);
                if clauses.is_nil() {
                    ctx.r = NIL;
                    ctx.app_cont = true;
                    return Ok(Step::Continue);
                }
                let clause = self.car(clauses);
                let test = self.car(clause);
                let body = self.cdr(clause);
                let progn_form = self.heap.cons(Value::Symbol(sym::PROGN), body);
                let rest_form = {
                    let rest = self.cdr(clauses);
                    self.heap.cons(Value::Symbol(sym::COND), rest)
                };
                if progn_form.is_oom() || rest_form.is_oom() {
                    return Ok(self.gc_retry());
                }
                let rewritten =
                    self.make_list4(Value::Symbol(sym::IF), test, progn_form, rest_form);
                if rewritten.is_oom() {
                    return Ok(self.gc_retry());
                }
                ctx.curr_exp = rewritten;
                Ok(Step::Continue)
            }
            sym::LET | sym::LETREC => self.eval_let(ctx),
            sym::RECV | sym::RECV_NB => self.eval_recv(ctx, form == sym::RECV),
            _ => Ok(Step::Finished(Value::Symbol(sym::EVAL_ERROR))),
        }
    }

    /// `let` with letrec semantics: every key is pre-bound to nil before
    /// the first value expression runs, and `BIND_TO_KEY_REST` patches
    /// the binding cells in evaluation order.
    fn eval_let(&mut self, ctx: &mut Context) -> Result<Step> {
        let exp = ctx.curr_exp;
        let binds = self.cadr(exp);
        let body = self.caddr(exp);
        if !binds.is_cons() {
            ctx.curr_exp = body;
            return Ok(Step::Continue);
        }
        let mut new_env = ctx.curr_env;
        let mut curr = binds;
        while curr.is_cons() {
            let key = self.car(self.car(curr));
            new_env = env::extend(&mut self.heap, key, NIL, new_env);
            if new_env.is_oom() {
                return Ok(self.gc_retry());
            }
            curr = self.cdr(curr);
        }
        let key0 = self.car(self.car(binds));
        let val0 = self.cadr(self.car(binds));
        let rest = self.cdr(binds);
        if !ctx
            .k
            .push_n(&[body, rest, new_env, key0, op(ContOp::BindToKeyRest)])
        {
            return Ok(Step::Finished(Value::oom()));
        }
        ctx.curr_exp = val0;
        ctx.curr_env = new_env;
        Ok(Step::Continue)
    }

    /// `recv`: match the oldest message against the clause patterns in
    /// order. The first match binds and consumes; otherwise the blocking
    /// form parks with `curr_exp` intact so a delivery re-runs it, and
    /// the non-blocking form answers `no-match`.
    fn eval_recv(&mut self, ctx: &mut Context, blocking: bool) -> Result<Step> {
        let clauses = self.cdr(ctx.curr_exp);
        if let Some(&msg) = ctx.mailbox.front() {
            let mut curr = clauses;
            while curr.is_cons() {
                let clause = self.car(curr);
                let pattern = self.car(clause);
                let body = self.cadr(clause);
                let mut binds = Vec::new();
                if crate::pattern::match_pattern(
                    &self.heap,
                    &self.mem,
                    &self.consts,
                    pattern,
                    msg,
                    &mut binds,
                ) {
                    let mut env = ctx.curr_env;
                    for &(key, val) in &binds {
                        env = env::extend(&mut self.heap, key, val, env);
                        if env.is_oom() {
                            // Nothing consumed yet; safe to retry the
                            // whole form after a collection.
                            return Ok(self.gc_retry());
                        }
                    }
                    ctx.mailbox.pop_front();
                    ctx.curr_env = env;
                    ctx.curr_exp = body;
                    return Ok(Step::Continue);
                }
                curr = self.cdr(curr);
            }
        }
        if blocking {
            Ok(Step::Suspend(RunResult::BlockedRecv))
        } else {
            ctx.r = Value::Symbol(sym::NO_MATCH);
            ctx.app_cont = true;
            Ok(Step::Continue)
        }
    }

    // ------------------------------------------------------------------
    // Continuations
    // ------------------------------------------------------------------

    fn apply_continuation(&mut self, ctx: &mut Context) -> Result<Step> {
        ctx.app_cont = false;
        let opcode = ctx
            .k
            .pop()
            .ok_or(RuntimeError::StackCorrupt("pop on empty continuation stack"))?;
        let opcode =
            decode_op(opcode).ok_or(RuntimeError::StackCorrupt("word is not an opcode"))?;
        match opcode {
            ContOp::Done => {
                if ctx.r.is_error() {
                    return Ok(Step::Finished(ctx.r));
                }
                if ctx.program.is_cons() {
                    // Step to the next top-level form.
                    let next = self.car(ctx.program);
                    ctx.program = self.cdr(ctx.program);
                    ctx.k.clear();
                    if !seed_stack(&mut ctx.k) {
                        return Ok(Step::Finished(Value::oom()));
                    }
                    ctx.curr_exp = next;
                    ctx.curr_env = NIL;
                    return Ok(Step::Continue);
                }
                Ok(Step::Finished(ctx.r))
            }
            ContOp::SetGlobalEnv => {
                let [key] = ctx
                    .k
                    .pop_n::<1>()
                    .ok_or(RuntimeError::StackCorrupt("SET_GLOBAL_ENV operands"))?;
                match env::global_set(&mut self.heap, &self.consts, self.global_env, key, ctx.r) {
                    env::SetResult::Updated => {}
                    env::SetResult::Prepended(e) => self.global_env = e,
                    env::SetResult::OutOfMemory => {
                        if !ctx.k.push_n(&[key, op(ContOp::SetGlobalEnv)]) {
                            return Ok(Step::Finished(Value::oom()));
                        }
                        ctx.app_cont = true;
                        return Ok(self.gc_retry());
                    }
                }
                ctx.r = TRUE;
                ctx.app_cont = true;
                Ok(Step::Continue)
            }
            ContOp::PrognRest => {
                let [rest] = ctx
                    .k
                    .pop_n::<1>()
                    .ok_or(RuntimeError::StackCorrupt("PROGN_REST operands"))?;
                if ctx.r == Value::Symbol(sym::READ_ERROR) {
                    return Ok(Step::Finished(ctx.r));
                }
                if rest.is_nil() {
                    ctx.app_cont = true;
                    return Ok(Step::Continue);
                }
                let tail = self.cdr(rest);
                if !ctx.k.push_n(&[tail, op(ContOp::PrognRest)]) {
                    return Ok(Step::Finished(Value::oom()));
                }
                ctx.curr_exp = self.car(rest);
                Ok(Step::Continue)
            }
            ContOp::If => {
                let [then_b, else_b] = ctx
                    .k
                    .pop_n::<2>()
                    .ok_or(RuntimeError::StackCorrupt("IF operands"))?;
                if ctx.r.is_error() {
                    // An error condition propagates instead of branching.
                    return Ok(Step::Finished(ctx.r));
                }
                ctx.curr_exp = if !ctx.r.is_nil() { then_b } else { else_b };
                Ok(Step::Continue)
            }
            ContOp::ArgList => {
                let [rest, acc, env] = ctx
                    .k
                    .pop_n::<3>()
                    .ok_or(RuntimeError::StackCorrupt("ARG_LIST operands"))?;
                let acc2 = self.heap.cons(ctx.r, acc);
                if acc2.is_oom() {
                    if !ctx.k.push_n(&[env, acc, rest, op(ContOp::ArgList)]) {
                        return Ok(Step::Finished(Value::oom()));
                    }
                    ctx.app_cont = true;
                    return Ok(self.gc_retry());
                }
                if rest.is_nil() {
                    ctx.r = acc2;
                    ctx.app_cont = true;
                    return Ok(Step::Continue);
                }
                let tail = self.cdr(rest);
                if !ctx.k.push_n(&[env, acc2, tail, op(ContOp::ArgList)]) {
                    return Ok(Step::Finished(Value::oom()));
                }
                ctx.curr_exp = self.car(rest);
                ctx.curr_env = env;
                Ok(Step::Continue)
            }
            ContOp::Function => {
                let [head] = ctx
                    .k
                    .pop_n::<1>()
                    .ok_or(RuntimeError::StackCorrupt("FUNCTION operands"))?;
                // r holds the reversed argument list.
                if !ctx.k.push_n(&[ctx.r, op(ContOp::FunctionApp)]) {
                    return Ok(Step::Finished(Value::oom()));
                }
                if let Value::Symbol(id) = head {
                    if sym::is_fundamental(id) || sym::is_extension(id) {
                        ctx.r = head;
                        ctx.app_cont = true;
                        return Ok(Step::Continue);
                    }
                }
                ctx.curr_exp = head;
                Ok(Step::Continue)
            }
            ContOp::FunctionApp => self.apply_function(ctx),
            ContOp::BindToKeyRest => {
                let [key, env, rest] = ctx
                    .k
                    .pop_n::<3>()
                    .ok_or(RuntimeError::StackCorrupt("BIND_TO_KEY_REST operands"))?;
                env::modify(&mut self.heap, &self.consts, env, key, ctx.r);
                if rest.is_cons() {
                    let next = self.car(rest);
                    let keyn = self.car(next);
                    let valn = self.cadr(next);
                    let tail = self.cdr(rest);
                    if !ctx
                        .k
                        .push_n(&[tail, env, keyn, op(ContOp::BindToKeyRest)])
                    {
                        return Ok(Step::Finished(Value::oom()));
                    }
                    ctx.curr_exp = valn;
                    ctx.curr_env = env;
                    return Ok(Step::Continue);
                }
                let [body] = ctx
                    .k
                    .pop_n::<1>()
                    .ok_or(RuntimeError::StackCorrupt("BIND_TO_KEY_REST body"))?;
                ctx.curr_exp = body;
                ctx.curr_env = env;
                Ok(Step::Continue)
            }
        }
    }

    /// `FUNCTION_APP`: `r` is the function value, the frame operand is
    /// the reversed argument list.
    fn apply_function(&mut self, ctx: &mut Context) -> Result<Step> {
        let [args] = ctx
            .k
            .pop_n::<1>()
            .ok_or(RuntimeError::StackCorrupt("FUNCTION_APP operands"))?;
        let fun = ctx.r;

        let args_rev = if args.is_cons() {
            let rev = self.reverse_list(args);
            if rev.is_oom() {
                return self.retry_apply(ctx, args);
            }
            rev
        } else {
            args
        };

        // Closure: bind parameters and enter the body. No frame is
        // pushed, so calls in tail position run in constant stack.
        if fun.is_cons() && self.car(fun) == Value::Symbol(sym::CLOSURE) {
            let params = self.cadr(fun);
            let body = self.caddr(fun);
            let clo_env = self.cadddr(fun);
            if self.length(params) != self.length(args_rev) {
                return Ok(Step::Finished(Value::Symbol(sym::EVAL_ERROR)));
            }
            let local = env::build_params(&mut self.heap, &self.consts, params, args_rev, clo_env);
            if local.is_oom() {
                return self.retry_apply(ctx, args);
            }
            ctx.curr_exp = body;
            ctx.curr_env = local;
            return Ok(Step::Continue);
        }

        if let Value::Symbol(id) = fun {
            if let Some(fund) = Fund::from_id(id) {
                if fund.is_eval_coupled() {
                    return self.apply_eval_fund(ctx, fund, args_rev, args);
                }
                let argv = self.collect_args(args_rev);
                let res = fundamental::apply(
                    fund,
                    &argv,
                    &mut self.heap,
                    &mut self.mem,
                    &self.consts,
                    &self.types,
                );
                if res.is_oom() {
                    return self.retry_apply(ctx, args);
                }
                ctx.r = res;
                ctx.app_cont = true;
                return Ok(Step::Continue);
            }
            if sym::is_extension(id) {
                let Some(handler) = self.extensions.lookup(id) else {
                    return Ok(Step::Finished(Value::Symbol(sym::EVAL_ERROR)));
                };
                let argv = self.collect_args(args_rev);
                let mut ext = ExtContext {
                    heap: &mut self.heap,
                    mem: &mut self.mem,
                    consts: &self.consts,
                    symbols: &mut self.symbols,
                    sched: &mut self.sched,
                };
                let res = handler(&mut ext, &argv);
                if res.is_oom() {
                    return self.retry_apply(ctx, args);
                }
                ctx.r = res;
                ctx.app_cont = true;
                return Ok(Step::Continue);
            }
        }

        // Calling a non-callable value.
        Ok(Step::Finished(Value::Symbol(sym::EVAL_ERROR)))
    }

    /// The fundamentals that touch the scheduler or the dispatch loop.
    fn apply_eval_fund(
        &mut self,
        ctx: &mut Context,
        fund: Fund,
        args_rev: Value,
        args_acc: Value,
    ) -> Result<Step> {
        let argv = self.collect_args(args_rev);
        match fund {
            Fund::Gc => {
                self.run_gc(Some(ctx))?;
                ctx.r = TRUE;
                ctx.app_cont = true;
                Ok(Step::Continue)
            }
            Fund::Eval => {
                ctx.curr_exp = argv.first().copied().unwrap_or(NIL);
                Ok(Step::Continue)
            }
            Fund::SelfId => {
                ctx.r = Value::Int(ctx.id as i32);
                ctx.app_cont = true;
                Ok(Step::Continue)
            }
            Fund::Yield => {
                ctx.r = TRUE;
                ctx.app_cont = true;
                Ok(Step::Suspend(RunResult::Yielded))
            }
            Fund::Sleep => {
                let us = match argv.first().and_then(|&v| as_num(&self.heap, &self.consts, v)) {
                    Some(n) if n.to_i64() >= 0 => n.to_u64(),
                    _ => {
                        ctx.r = Value::Symbol(sym::TYPE_ERROR);
                        ctx.app_cont = true;
                        return Ok(Step::Continue);
                    }
                };
                ctx.r = TRUE;
                ctx.app_cont = true;
                Ok(Step::Suspend(RunResult::Sleeping(us)))
            }
            Fund::Send => {
                if argv.len() != 2 {
                    ctx.r = Value::Symbol(sym::EVAL_ERROR);
                    ctx.app_cont = true;
                    return Ok(Step::Continue);
                }
                let cid = match as_num(&self.heap, &self.consts, argv[0]) {
                    Some(n) if n.to_i64() > 0 => n.to_i64() as u32,
                    _ => {
                        ctx.r = Value::Symbol(sym::TYPE_ERROR);
                        ctx.app_cont = true;
                        return Ok(Step::Continue);
                    }
                };
                let ok = if cid == ctx.id {
                    if ctx.mailbox.len() < ctx.mailbox_cap {
                        ctx.mailbox.push_back(argv[1]);
                        true
                    } else {
                        false
                    }
                } else {
                    self.sched.deliver(cid, argv[1])
                };
                ctx.r = if ok { TRUE } else { NIL };
                ctx.app_cont = true;
                Ok(Step::Continue)
            }
            Fund::Kill => {
                let cid = match argv.first().and_then(|&v| as_num(&self.heap, &self.consts, v)) {
                    Some(n) if n.to_i64() > 0 => n.to_i64() as u32,
                    _ => {
                        ctx.r = Value::Symbol(sym::TYPE_ERROR);
                        ctx.app_cont = true;
                        return Ok(Step::Continue);
                    }
                };
                if cid == ctx.id {
                    return Ok(Step::Suspend(RunResult::Killed));
                }
                ctx.r = if self.sched.kill(cid) { TRUE } else { NIL };
                ctx.app_cont = true;
                Ok(Step::Continue)
            }
            Fund::EventWait => {
                let tag = match argv.first() {
                    Some(&Value::Symbol(tag)) => tag,
                    _ => {
                        ctx.r = Value::Symbol(sym::TYPE_ERROR);
                        ctx.app_cont = true;
                        return Ok(Step::Continue);
                    }
                };
                if let Some(payload) = self.sched.take_event(tag) {
                    ctx.r = payload;
                    ctx.app_cont = true;
                    return Ok(Step::Continue);
                }
                // Re-arm the application so the wake re-runs event-wait;
                // r still holds the fundamental symbol.
                if !ctx.k.push_n(&[args_acc, op(ContOp::FunctionApp)]) {
                    return Ok(Step::Finished(Value::oom()));
                }
                ctx.app_cont = true;
                Ok(Step::Suspend(RunResult::BlockedEvent(tag)))
            }
            Fund::Spawn => {
                if argv.is_empty() {
                    ctx.r = Value::Symbol(sym::EVAL_ERROR);
                    ctx.app_cont = true;
                    return Ok(Step::Continue);
                }
                let fun = argv[0];
                if !(fun.is_cons() && self.car(fun) == Value::Symbol(sym::CLOSURE)) {
                    ctx.r = Value::Symbol(sym::EVAL_ERROR);
                    ctx.app_cont = true;
                    return Ok(Step::Continue);
                }
                let params = self.cadr(fun);
                let body = self.caddr(fun);
                let clo_env = self.cadddr(fun);
                if self.length(params) != Some(argv.len() - 1) {
                    ctx.r = Value::Symbol(sym::EVAL_ERROR);
                    ctx.app_cont = true;
                    return Ok(Step::Continue);
                }
                // Rebuild the argument list in order for build_params.
                let mut spawn_args = NIL;
                for &a in argv[1..].iter().rev() {
                    spawn_args = self.heap.cons(a, spawn_args);
                    if spawn_args.is_oom() {
                        return self.retry_apply(ctx, args_acc);
                    }
                }
                let local = env::build_params(
                    &mut self.heap,
                    &self.consts,
                    params,
                    spawn_args,
                    clo_env,
                );
                if local.is_oom() {
                    return self.retry_apply(ctx, args_acc);
                }
                let mut k = Stack::new(self.ctx_stack_cap, self.ctx_stack_grow);
                if !seed_stack(&mut k) {
                    return Ok(Step::Finished(Value::oom()));
                }
                let cid = self.sched.spawn(NIL, body, local, k, self.mailbox_cap);
                ctx.r = Value::Int(cid as i32);
                ctx.app_cont = true;
                Ok(Step::Continue)
            }
            _ => Ok(Step::Finished(Value::Symbol(sym::EVAL_ERROR))),
        }
    }

    // ------------------------------------------------------------------
    // Allocation-retry plumbing
    // ------------------------------------------------------------------

    /// Restart the current reduction after a collection. With no other
    /// state touched the dispatch re-runs the same expression; a
    /// continuation that already repushed its frame resumes there
    /// instead.
    fn gc_retry(&mut self) -> Step {
        self.gc_requested = true;
        Step::Continue
    }

    /// Repush a `FUNCTION_APP` frame so the application re-runs once the
    /// collector has made room. `r` still holds the function value.
    fn retry_apply(&mut self, ctx: &mut Context, args_acc: Value) -> Result<Step> {
        if !ctx.k.push_n(&[args_acc, op(ContOp::FunctionApp)]) {
            return Ok(Step::Finished(Value::oom()));
        }
        ctx.app_cont = true;
        self.gc_requested = true;
        Ok(Step::Continue)
    }

    // ------------------------------------------------------------------
    // List helpers
    // ------------------------------------------------------------------

    fn collect_args(&self, mut list: Value) -> Vec<Value> {
        let mut out = Vec::new();
        while list.is_cons() {
            out.push(self.car(list));
            list = self.cdr(list);
        }
        out
    }

    fn reverse_list(&mut self, list: Value) -> Value {
        let mut out = NIL;
        let mut curr = list;
        while curr.is_cons() {
            let head = self.car(curr);
            out = self.heap.cons(head, out);
            if out.is_oom() {
                return out;
            }
            curr = self.cdr(curr);
        }
        out
    }

    fn make_list4(&mut self, a: Value, b: Value, c: Value, d: Value) -> Value {
        let mut out = self.heap.cons(d, NIL);
        for v in [c, b, a] {
            if out.is_oom() {
                return out;
            }
            out = self.heap.cons(v, out);
        }
        out
    }
}
