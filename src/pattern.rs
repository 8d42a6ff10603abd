use crate::consts::ConstHeap;
use crate::fundamental::struct_eq;
use crate::heap::{car_val, cdr_val, Heap};
use crate::mem::AuxMem;
use crate::value::{sym, Value};

/// Message patterns for `recv`:
/// - `_` matches anything and binds nothing;
/// - an unreserved symbol matches anything and binds the message part;
/// - `(quote x)` matches exactly the symbol `x`;
/// - a cons pattern matches a cons and recurses on both halves;
/// - any other atom matches by structural equality.
///
/// On success `binds` holds the `(symbol, part)` pairs in match order;
/// on failure its contents are unspecified and the caller discards it.
pub fn match_pattern(
    heap: &Heap,
    mem: &AuxMem,
    consts: &ConstHeap,
    pattern: Value,
    msg: Value,
    binds: &mut Vec<(Value, Value)>,
) -> bool {
    match pattern {
        Value::Symbol(id) if id == sym::WILDCARD => true,
        Value::Symbol(id) if id.0 >= sym::RUNTIME_BASE => {
            binds.push((pattern, msg));
            true
        }
        Value::Cons(_) => {
            let head = car_val(heap, consts, pattern);
            if head == Value::Symbol(sym::QUOTE) {
                let quoted = car_val(heap, consts, cdr_val(heap, consts, pattern));
                return quoted == msg;
            }
            if !msg.is_cons() {
                return false;
            }
            match_pattern(
                heap,
                mem,
                consts,
                head,
                car_val(heap, consts, msg),
                binds,
            ) && match_pattern(
                heap,
                mem,
                consts,
                cdr_val(heap, consts, pattern),
                cdr_val(heap, consts, msg),
                binds,
            )
        }
        _ => struct_eq(heap, mem, consts, pattern, msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{SymbolId, NIL};

    struct Fixture {
        heap: Heap,
        mem: AuxMem,
        consts: ConstHeap,
    }

    fn fixture() -> Fixture {
        Fixture {
            heap: Heap::new(64, 64),
            mem: AuxMem::new(32),
            consts: ConstHeap::new(8),
        }
    }

    fn user(n: u32) -> Value {
        Value::Symbol(SymbolId(sym::RUNTIME_BASE + n))
    }

    fn try_match(fx: &Fixture, p: Value, m: Value) -> Option<Vec<(Value, Value)>> {
        let mut binds = Vec::new();
        if match_pattern(&fx.heap, &fx.mem, &fx.consts, p, m, &mut binds) {
            Some(binds)
        } else {
            None
        }
    }

    #[test]
    fn bare_symbol_binds() {
        let fx = fixture();
        let binds = try_match(&fx, user(0), Value::Int(42)).unwrap();
        assert_eq!(binds, vec![(user(0), Value::Int(42))]);
    }

    #[test]
    fn wildcard_matches_without_binding() {
        let fx = fixture();
        let binds = try_match(&fx, Value::Symbol(sym::WILDCARD), Value::Int(1)).unwrap();
        assert!(binds.is_empty());
    }

    #[test]
    fn literals_match_by_value() {
        let fx = fixture();
        assert!(try_match(&fx, Value::Int(3), Value::Int(3)).is_some());
        assert!(try_match(&fx, Value::Int(3), Value::Int(4)).is_none());
        assert!(try_match(&fx, NIL, NIL).is_some());
    }

    #[test]
    fn quoted_symbols_are_literal() {
        let mut fx = fixture();
        let x = user(7);
        let inner = fx.heap.cons(x, NIL);
        let quoted = fx.heap.cons(Value::Symbol(sym::QUOTE), inner);
        assert!(try_match(&fx, quoted, x).unwrap().is_empty());
        assert!(try_match(&fx, quoted, user(8)).is_none());
    }

    #[test]
    fn cons_patterns_recurse_and_bind() {
        let mut fx = fixture();
        // Pattern: (ping v), message: (ping 9)
        let ping = fx.heap.cons(user(1), NIL);
        let ping = fx.heap.cons(Value::Symbol(sym::QUOTE), ping);
        let tail = fx.heap.cons(user(2), NIL);
        let pat = fx.heap.cons(ping, tail);
        let mtail = fx.heap.cons(Value::Int(9), NIL);
        let msg = fx.heap.cons(user(1), mtail);
        let binds = try_match(&fx, pat, msg).unwrap();
        assert_eq!(binds, vec![(user(2), Value::Int(9))]);
        // Shape mismatch fails.
        assert!(try_match(&fx, pat, Value::Int(9)).is_none());
    }
}
