use crate::consts::ConstHeap;
use crate::fundamental::{as_num, Num};
use crate::heap::{car_val, cdr_val, Heap};
use crate::mem::AuxMem;
use crate::symbol::SymbolTable;
use crate::value::{sym, Value};

/// Render a value for the REPL and the done callback. Depth-bounded:
/// nesting past `max_depth` prints as `...`. Closures print with their
/// captured environment elided.
pub fn print_value(
    heap: &Heap,
    mem: &AuxMem,
    consts: &ConstHeap,
    symbols: &SymbolTable,
    v: Value,
    max_depth: usize,
) -> String {
    let mut out = String::new();
    write_value(heap, mem, consts, symbols, v, max_depth, &mut out);
    out
}

fn write_value(
    heap: &Heap,
    mem: &AuxMem,
    consts: &ConstHeap,
    symbols: &SymbolTable,
    v: Value,
    depth: usize,
    out: &mut String,
) {
    if depth == 0 {
        out.push_str("...");
        return;
    }
    match v {
        Value::Symbol(id) => match symbols.name(mem, id) {
            Some(name) => out.push_str(&name),
            None => out.push_str(&format!("sym-{}", id.0)),
        },
        Value::Int(n) => out.push_str(&n.to_string()),
        Value::Uint(n) => {
            out.push_str(&n.to_string());
            out.push('u');
        }
        Value::Char(c) => {
            out.push('\\');
            out.push(c as char);
        }
        Value::Boxed(_) => match as_num(heap, consts, v) {
            Some(Num::I32(n)) => out.push_str(&format!("{}i32", n)),
            Some(Num::U32(n)) => out.push_str(&format!("{}u32", n)),
            Some(Num::F32(n)) => out.push_str(&format_float(n as f64)),
            Some(Num::I64(n)) => out.push_str(&format!("{}i64", n)),
            Some(Num::U64(n)) => out.push_str(&format!("{}u64", n)),
            Some(Num::F64(n)) => {
                out.push_str(&format_float(n));
                out.push_str("f64");
            }
            _ => out.push_str("#<boxed>"),
        },
        Value::Array(_) => write_array(heap, mem, consts, v, out),
        Value::Cons(_) => write_list(heap, mem, consts, symbols, v, depth, out),
        Value::Raw(_) | Value::AuxRef(_) | Value::ConstRef(_) => out.push_str("#<internal>"),
    }
}

fn format_float(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() {
        format!("{:.1}", n)
    } else {
        n.to_string()
    }
}

fn write_list(
    heap: &Heap,
    mem: &AuxMem,
    consts: &ConstHeap,
    symbols: &SymbolTable,
    v: Value,
    depth: usize,
    out: &mut String,
) {
    // A closure drags its whole captured environment along; elide it.
    let head = car_val(heap, consts, v);
    let closure = head == Value::Symbol(sym::CLOSURE);
    out.push('(');
    let mut curr = v;
    let mut n = 0;
    loop {
        if closure && n == 3 {
            out.push_str(" ...");
            break;
        }
        if n > 0 {
            out.push(' ');
        }
        write_value(
            heap,
            mem,
            consts,
            symbols,
            car_val(heap, consts, curr),
            depth - 1,
            out,
        );
        n += 1;
        let tail = cdr_val(heap, consts, curr);
        match tail {
            Value::Cons(_) => curr = tail,
            t if t.is_nil() => break,
            t => {
                out.push_str(" . ");
                write_value(heap, mem, consts, symbols, t, depth - 1, out);
                break;
            }
        }
    }
    out.push(')');
}

fn write_array(heap: &Heap, mem: &AuxMem, consts: &ConstHeap, v: Value, out: &mut String) {
    let bytes = match v {
        Value::Array(id) if id.is_const() => match consts.cell(id.ix()) {
            Some((Value::ConstRef(hix), _)) => consts.array_bytes(hix).unwrap_or_default(),
            _ => Vec::new(),
        },
        Value::Array(id) => {
            let (size, data_ix) = heap.array_header(mem, id);
            mem.read_bytes(data_ix, size)
        }
        _ => Vec::new(),
    };
    // NUL-terminated printable contents render as a string.
    if bytes.last() == Some(&0) && bytes[..bytes.len() - 1].iter().all(|&b| (0x20..0x7f).contains(&b)) {
        out.push('"');
        out.push_str(&String::from_utf8_lossy(&bytes[..bytes.len() - 1]));
        out.push('"');
    } else {
        out.push('[');
        for (i, b) in bytes.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            out.push_str(&b.to_string());
        }
        out.push(']');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{NumKind, NIL};

    struct Fixture {
        heap: Heap,
        mem: AuxMem,
        consts: ConstHeap,
        symbols: SymbolTable,
    }

    fn fixture() -> Fixture {
        Fixture {
            heap: Heap::new(256, 128),
            mem: AuxMem::new(128),
            consts: ConstHeap::new(16),
            symbols: SymbolTable::new(),
        }
    }

    fn render(fx: &Fixture, v: Value) -> String {
        print_value(&fx.heap, &fx.mem, &fx.consts, &fx.symbols, v, 16)
    }

    #[test]
    fn atoms_render() {
        let mut fx = fixture();
        assert_eq!(render(&fx, Value::Int(-3)), "-3");
        assert_eq!(render(&fx, Value::Uint(7)), "7u");
        assert_eq!(render(&fx, NIL), "nil");
        assert_eq!(render(&fx, Value::Char(b'x')), "\\x");
        let f = fx.heap.alloc_boxed(NumKind::F32, 1.5f32.to_bits() as u64);
        assert_eq!(render(&fx, f), "1.5");
        let i = fx.heap.alloc_boxed(NumKind::I64, 9u64);
        assert_eq!(render(&fx, i), "9i64");
    }

    #[test]
    fn lists_render() {
        let mut fx = fixture();
        let t = fx.heap.cons(Value::Int(2), NIL);
        let l = fx.heap.cons(Value::Int(1), t);
        assert_eq!(render(&fx, l), "(1 2)");
        let d = fx.heap.cons(Value::Int(1), Value::Int(2));
        assert_eq!(render(&fx, d), "(1 . 2)");
    }

    #[test]
    fn strings_render_quoted() {
        let mut fx = fixture();
        let s = fx.heap.alloc_array_from(&mut fx.mem, b"hey", true);
        assert_eq!(render(&fx, s), "\"hey\"");
        let raw = fx.heap.alloc_array_from(&mut fx.mem, &[1, 2], false);
        assert_eq!(render(&fx, raw), "[1 2]");
    }

    #[test]
    fn depth_is_bounded() {
        let mut fx = fixture();
        let mut v = NIL;
        for _ in 0..40 {
            let inner = fx.heap.cons(v, NIL);
            v = inner;
        }
        let s = render(&fx, v);
        assert!(s.contains("..."));
    }
}
