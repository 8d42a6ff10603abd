use crate::consts::ConstHeap;
use crate::heap::{car_val, cdr_val, Heap};
use crate::value::{CellId, Value, NIL};

/// Environments are association lists of `(key . value)` cells. Spines
/// built during evaluation are RAM cells; an environment captured by a
/// closure that was flattened into an image is constant, so reads go
/// through the region-transparent accessors. The first match along the
/// spine shadows later ones.

/// Find the value bound to `key`, walking the cdr chain.
pub fn lookup(heap: &Heap, consts: &ConstHeap, key: Value, env: Value) -> Option<Value> {
    lookup_binding(heap, consts, key, env).map(|b| cdr_val(heap, consts, b))
}

/// Find the binding cell for `key`. The returned value is the cell
/// itself, which may live in either region.
pub fn lookup_binding(heap: &Heap, consts: &ConstHeap, key: Value, env: Value) -> Option<Value> {
    let mut curr = env;
    while curr.is_cons() {
        let binding = car_val(heap, consts, curr);
        if binding.is_cons() && car_val(heap, consts, binding) == key {
            return Some(binding);
        }
        curr = cdr_val(heap, consts, curr);
    }
    None
}

/// Prepend a binding, returning the extended environment or the
/// out-of-memory symbol.
pub fn extend(heap: &mut Heap, key: Value, val: Value, env: Value) -> Value {
    let binding = heap.cons(key, val);
    if binding.is_oom() {
        return binding;
    }
    heap.cons(binding, env)
}

/// Overwrite an existing binding in place (letrec update). False when
/// the key is unbound in `env` or bound in constant memory.
pub fn modify(heap: &mut Heap, consts: &ConstHeap, env: Value, key: Value, val: Value) -> bool {
    match lookup_binding(heap, consts, key, env) {
        Some(Value::Cons(id)) if !id.is_const() => heap.set_cdr(id, val),
        _ => false,
    }
}

/// Result of a global-environment set.
pub enum SetResult {
    Updated,
    Prepended(Value),
    OutOfMemory,
}

/// Replace the value of `key` in the global environment, or prepend a
/// fresh binding (also the path that shadows an image-restored constant
/// binding). The caller swaps in the returned environment on
/// `Prepended`.
pub fn global_set(
    heap: &mut Heap,
    consts: &ConstHeap,
    global: Value,
    key: Value,
    val: Value,
) -> SetResult {
    if modify(heap, consts, global, key, val) {
        return SetResult::Updated;
    }
    let new_env = extend(heap, key, val, global);
    if new_env.is_oom() {
        SetResult::OutOfMemory
    } else {
        SetResult::Prepended(new_env)
    }
}

/// Shallow-copy the spine of `env`, sharing the binding cells. Closure
/// capture uses this: letrec updates through `modify` stay visible to
/// the captured copy, later prepends to the source do not.
pub fn copy_shallow(heap: &mut Heap, consts: &ConstHeap, env: Value) -> Value {
    let mut bindings = Vec::new();
    let mut curr = env;
    while curr.is_cons() {
        bindings.push(car_val(heap, consts, curr));
        curr = cdr_val(heap, consts, curr);
    }
    let mut copy = NIL;
    for &b in bindings.iter().rev() {
        copy = heap.cons(b, copy);
        if copy.is_oom() {
            return copy;
        }
    }
    copy
}

/// Bind `params` (a list of symbols, possibly in constant memory) to
/// `args` pairwise on top of `base`. Atomic: on any allocation failure
/// the partial environment is dropped and the out-of-memory symbol is
/// returned so the caller can GC and retry. Arity must already match.
pub fn build_params(
    heap: &mut Heap,
    consts: &ConstHeap,
    params: Value,
    args: Value,
    base: Value,
) -> Value {
    let mut env = base;
    let mut p = params;
    let mut a = args;
    while p.is_cons() {
        let key = car_val(heap, consts, p);
        let val = car_val(heap, consts, a);
        env = extend(heap, key, val, env);
        if env.is_oom() {
            return env;
        }
        p = cdr_val(heap, consts, p);
        a = cdr_val(heap, consts, a);
    }
    env
}

/// Binding-cell id of a RAM binding, for tests and diagnostics.
pub fn binding_cell(heap: &Heap, consts: &ConstHeap, key: Value, env: Value) -> Option<CellId> {
    match lookup_binding(heap, consts, key, env) {
        Some(Value::Cons(id)) => Some(id),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::sym;

    fn sym(n: u32) -> Value {
        Value::Symbol(crate::value::SymbolId(sym::RUNTIME_BASE + n))
    }

    fn fixture() -> (Heap, ConstHeap) {
        (Heap::new(32, 32), ConstHeap::new(32))
    }

    #[test]
    fn lookup_walks_and_shadows() {
        let (mut h, c) = fixture();
        let e = extend(&mut h, sym(0), Value::Int(1), NIL);
        let e = extend(&mut h, sym(1), Value::Int(2), e);
        let e = extend(&mut h, sym(0), Value::Int(3), e);
        assert_eq!(lookup(&h, &c, sym(0), e), Some(Value::Int(3)));
        assert_eq!(lookup(&h, &c, sym(1), e), Some(Value::Int(2)));
        assert_eq!(lookup(&h, &c, sym(2), e), None);
    }

    #[test]
    fn modify_updates_in_place() {
        let (mut h, c) = fixture();
        let e = extend(&mut h, sym(0), NIL, NIL);
        assert!(modify(&mut h, &c, e, sym(0), Value::Int(7)));
        assert_eq!(lookup(&h, &c, sym(0), e), Some(Value::Int(7)));
        assert!(!modify(&mut h, &c, e, sym(9), Value::Int(7)));
    }

    #[test]
    fn global_set_updates_or_prepends() {
        let (mut h, c) = fixture();
        let mut g = NIL;
        match global_set(&mut h, &c, g, sym(0), Value::Int(1)) {
            SetResult::Prepended(e) => g = e,
            _ => panic!("expected prepend"),
        }
        assert!(matches!(
            global_set(&mut h, &c, g, sym(0), Value::Int(2)),
            SetResult::Updated
        ));
        assert_eq!(lookup(&h, &c, sym(0), g), Some(Value::Int(2)));
    }

    #[test]
    fn copy_shares_binding_cells() {
        let (mut h, c) = fixture();
        let e = extend(&mut h, sym(0), NIL, NIL);
        let copy = copy_shallow(&mut h, &c, e);
        assert!(modify(&mut h, &c, e, sym(0), Value::Int(42)));
        // The update is visible through the copied spine.
        assert_eq!(lookup(&h, &c, sym(0), copy), Some(Value::Int(42)));
    }

    #[test]
    fn constant_bindings_read_but_do_not_mutate() {
        let (mut h, mut c) = fixture();
        let binding = c.append_cell(sym(0), Value::Int(5)).unwrap();
        let spine = c
            .append_cell(Value::Cons(binding), Value::Symbol(sym::NIL))
            .unwrap();
        let env = Value::Cons(spine);
        assert_eq!(lookup(&h, &c, sym(0), env), Some(Value::Int(5)));
        assert!(!modify(&mut h, &c, env, sym(0), Value::Int(6)));
        // global_set falls back to a RAM prepend that shadows.
        match global_set(&mut h, &c, env, sym(0), Value::Int(6)) {
            SetResult::Prepended(e) => {
                assert_eq!(lookup(&h, &c, sym(0), e), Some(Value::Int(6)));
            }
            _ => panic!("expected prepend"),
        }
    }

    #[test]
    fn build_params_binds_pairwise() {
        let (mut h, c) = fixture();
        let params = {
            let t = h.cons(sym(1), NIL);
            h.cons(sym(0), t)
        };
        let args = {
            let t = h.cons(Value::Int(2), NIL);
            h.cons(Value::Int(1), t)
        };
        let env = build_params(&mut h, &c, params, args, NIL);
        assert_eq!(lookup(&h, &c, sym(0), env), Some(Value::Int(1)));
        assert_eq!(lookup(&h, &c, sym(1), env), Some(Value::Int(2)));
    }

    #[test]
    fn build_params_reports_exhaustion() {
        let mut h = Heap::new(4, 8);
        let c = ConstHeap::new(1);
        let params = {
            let t = h.cons(sym(1), NIL);
            h.cons(sym(0), t)
        };
        let args = {
            let t = h.cons(Value::Int(2), NIL);
            h.cons(Value::Int(1), t)
        };
        // Zero cells remain; the first binding allocation must fail.
        assert!(build_params(&mut h, &c, params, args, NIL).is_oom());
    }
}
