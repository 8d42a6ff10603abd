use crate::error::{Result, RuntimeError};
use crate::value::{sym, CellId, NumKind, SymbolId, Value};

/// The erased state of a constant word, as flash presents it.
pub const EMPTY_WORD: u64 = u64::MAX;

// Word codec tags (low 8 bits; payload in the high 56).
const TAG_SYMBOL: u64 = 1;
const TAG_INT: u64 = 2;
const TAG_UINT: u64 = 3;
const TAG_CHAR: u64 = 4;
const TAG_CONS: u64 = 5;
const TAG_BOXED: u64 = 6;
const TAG_ARRAY: u64 = 7;
const TAG_RAW: u64 = 8;
const TAG_CONSTREF: u64 = 9;

/// Append-only region of immutable words. Cells are encoded as word
/// pairs (boxed numerics as a raw-header triple), arrays as a byte-count
/// word followed by packed payload words. Writes go through
/// `const_write`, which tolerates rewriting an identical word — so an
/// image restore over a warm region is a no-op — and treats a
/// conflicting rewrite as corruption.
pub struct ConstHeap {
    words: Vec<u64>,
    next: u32,
    write_fun: Option<Box<dyn FnMut(u32, u64) -> bool + Send>>,
}

fn encode(v: Value) -> Option<u64> {
    let (tag, payload) = match v {
        Value::Symbol(id) => (TAG_SYMBOL, id.0 as u64),
        Value::Int(n) => (TAG_INT, n as u32 as u64),
        Value::Uint(n) => (TAG_UINT, n as u64),
        Value::Char(c) => (TAG_CHAR, c as u64),
        Value::Cons(id) if id.is_const() => (TAG_CONS, id.ix() as u64),
        Value::Boxed(id) if id.is_const() => (TAG_BOXED, id.ix() as u64),
        Value::Array(id) if id.is_const() => (TAG_ARRAY, id.ix() as u64),
        Value::ConstRef(ix) => (TAG_CONSTREF, ix as u64),
        // RAM pointers and raw payloads have no standalone encoding.
        _ => return None,
    };
    Some(tag | (payload << 8))
}

fn decode(w: u64) -> Option<Value> {
    let payload = w >> 8;
    match w & 0xff {
        TAG_SYMBOL => Some(Value::Symbol(SymbolId(payload as u32))),
        TAG_INT => Some(Value::Int(payload as u32 as i32)),
        TAG_UINT => Some(Value::Uint(payload as u32)),
        TAG_CHAR => Some(Value::Char(payload as u8)),
        TAG_CONS => Some(Value::Cons(CellId::constant(payload as u32))),
        TAG_BOXED => Some(Value::Boxed(CellId::constant(payload as u32))),
        TAG_ARRAY => Some(Value::Array(CellId::constant(payload as u32))),
        TAG_CONSTREF => Some(Value::ConstRef(payload as u32)),
        _ => None,
    }
}

impl ConstHeap {
    pub fn new(capacity: usize) -> Self {
        ConstHeap {
            words: vec![EMPTY_WORD; capacity],
            next: 0,
            write_fun: None,
        }
    }

    /// Install a write-through hook (e.g. a flash programmer). The hook
    /// sees every accepted write.
    pub fn set_write_fun(&mut self, f: Box<dyn FnMut(u32, u64) -> bool + Send>) {
        self.write_fun = Some(f);
    }

    /// Write one word. Idempotent for an equal payload; a conflicting
    /// payload at a written index is a fatal condition.
    pub fn const_write(&mut self, ix: u32, w: u64) -> Result<()> {
        let i = ix as usize;
        if i >= self.words.len() {
            return Err(RuntimeError::Init("constant heap exhausted".into()));
        }
        if self.words[i] != EMPTY_WORD && self.words[i] != w {
            return Err(RuntimeError::ConstConflict(ix));
        }
        self.words[i] = w;
        if let Some(f) = &mut self.write_fun {
            if !f(ix, w) {
                return Err(RuntimeError::ConstConflict(ix));
            }
        }
        Ok(())
    }

    fn append_word(&mut self, w: u64) -> Option<u32> {
        let ix = self.next;
        if (ix as usize) >= self.words.len() {
            return None;
        }
        // Appends target fresh words, so const_write cannot conflict.
        self.const_write(ix, w).ok()?;
        self.next += 1;
        Some(ix)
    }

    /// Append a two-word cell. Both halves must be constant-encodable.
    pub fn append_cell(&mut self, car: Value, cdr: Value) -> Option<CellId> {
        let cw = encode(car)?;
        let dw = encode(cdr)?;
        let ix = self.append_word(cw)?;
        self.append_word(dw)?;
        Some(CellId::constant(ix))
    }

    /// Append a boxed numeric as a raw-header triple.
    pub fn append_boxed(&mut self, kind: NumKind, raw: u64) -> Option<CellId> {
        let ix = self.append_word(TAG_RAW)?;
        self.append_word(raw)?;
        self.append_word(encode(Value::Symbol(kind.marker()))?)?;
        Some(CellId::constant(ix))
    }

    /// Append a read-only byte array: header word with the byte count,
    /// then the packed payload, then the descriptor cell.
    pub fn append_array(&mut self, bytes: &[u8]) -> Option<CellId> {
        let hix = self.append_word(bytes.len() as u64)?;
        let nwords = crate::mem::bytes_to_words(bytes.len());
        for wi in 0..nwords {
            let mut w = 0u64;
            for bi in 0..8 {
                if let Some(&b) = bytes.get(wi * 8 + bi) {
                    w |= (b as u64) << (bi * 8);
                }
            }
            self.append_word(w)?;
        }
        self.append_cell(Value::ConstRef(hix), Value::Symbol(sym::ARRAY_TYPE))
    }

    /// Read the cell whose first word is at `ix`.
    pub fn cell(&self, ix: usize) -> Option<(Value, Value)> {
        let w0 = *self.words.get(ix)?;
        if w0 == TAG_RAW {
            let raw = *self.words.get(ix + 1)?;
            let cdr = decode(*self.words.get(ix + 2)?)?;
            Some((Value::Raw(raw), cdr))
        } else {
            let car = decode(w0)?;
            let cdr = decode(*self.words.get(ix + 1)?)?;
            Some((car, cdr))
        }
    }

    /// Byte contents of the read-only array whose header is at `hix`.
    pub fn array_bytes(&self, hix: u32) -> Option<Vec<u8>> {
        let len = *self.words.get(hix as usize)? as usize;
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            let w = *self.words.get(hix as usize + 1 + i / 8)?;
            out.push((w >> ((i % 8) * 8)) as u8);
        }
        Some(out)
    }

    pub fn next_ix(&self) -> u32 {
        self.next
    }

    /// Reposition the append point (image boot).
    pub fn set_next_ix(&mut self, ix: u32) {
        self.next = ix;
    }

    pub fn capacity(&self) -> usize {
        self.words.len()
    }

    /// The written prefix, for image save.
    pub fn written_words(&self) -> &[u64] {
        &self.words[..self.next as usize]
    }
}

/// Word codec, exposed for the image format.
pub fn encode_word(v: Value) -> Option<u64> {
    encode(v)
}

pub fn decode_word(w: u64) -> Option<Value> {
    decode(w)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent_writes_are_tolerated() {
        let mut c = ConstHeap::new(8);
        c.const_write(0, 42).unwrap();
        c.const_write(0, 42).unwrap();
        assert!(matches!(
            c.const_write(0, 43),
            Err(RuntimeError::ConstConflict(0))
        ));
    }

    #[test]
    fn cells_round_trip() {
        let mut c = ConstHeap::new(16);
        let inner = c.append_cell(Value::Int(1), Value::Symbol(sym::NIL)).unwrap();
        let outer = c.append_cell(Value::Int(2), Value::Cons(inner)).unwrap();
        let (car, cdr) = c.cell(outer.ix()).unwrap();
        assert_eq!(car, Value::Int(2));
        assert_eq!(cdr, Value::Cons(inner));
        let (car, cdr) = c.cell(inner.ix()).unwrap();
        assert_eq!(car, Value::Int(1));
        assert!(cdr.is_nil());
    }

    #[test]
    fn boxed_cells_carry_raw_bits() {
        let mut c = ConstHeap::new(16);
        let id = c.append_boxed(NumKind::F64, 1.5f64.to_bits()).unwrap();
        let (car, cdr) = c.cell(id.ix()).unwrap();
        assert_eq!(car, Value::Raw(1.5f64.to_bits()));
        assert_eq!(cdr, Value::Symbol(sym::RAW_F64));
    }

    #[test]
    fn arrays_round_trip() {
        let mut c = ConstHeap::new(32);
        let id = c.append_array(b"hello world").unwrap();
        let (car, cdr) = c.cell(id.ix()).unwrap();
        assert_eq!(cdr, Value::Symbol(sym::ARRAY_TYPE));
        let Value::ConstRef(hix) = car else { panic!() };
        assert_eq!(c.array_bytes(hix).unwrap(), b"hello world");
    }

    #[test]
    fn ram_pointers_are_rejected() {
        let mut c = ConstHeap::new(8);
        assert!(c.append_cell(Value::Cons(CellId::ram(3)), Value::Int(0)).is_none());
    }

    #[test]
    fn capacity_is_enforced() {
        let mut c = ConstHeap::new(3);
        assert!(c.append_cell(Value::Int(1), Value::Int(2)).is_some());
        assert!(c.append_cell(Value::Int(3), Value::Int(4)).is_none());
    }
}
