use crate::channel::CharChannel;
use crate::error::{Result, RuntimeError};
use crate::heap::Heap;
use crate::mem::AuxMem;
use crate::symbol::SymbolTable;
use crate::value::{sym, NumKind, Value, NIL};

/// Parses source text from a character channel into heap values:
/// lists and dotted pairs, `'` quote, line comments, integers with
/// unsigned/width suffixes, floats, strings (byte arrays with a trailing
/// NUL), `\c` character literals, and symbols.
///
/// The reader never triggers a collection: partially built expressions
/// live only in host locals the collector cannot see, so allocation
/// failure surfaces as a read error instead.
pub struct Reader<'a> {
    chan: &'a mut dyn CharChannel,
    heap: &'a mut Heap,
    mem: &'a mut AuxMem,
    symbols: &'a mut SymbolTable,
}

impl<'a> Reader<'a> {
    pub fn new(
        chan: &'a mut dyn CharChannel,
        heap: &'a mut Heap,
        mem: &'a mut AuxMem,
        symbols: &'a mut SymbolTable,
    ) -> Self {
        Reader {
            chan,
            heap,
            mem,
            symbols,
        }
    }

    /// Read one expression; `None` at end of input.
    pub fn read(&mut self) -> Result<Option<Value>> {
        self.skip_blank();
        if self.peek().is_none() {
            return Ok(None);
        }
        self.read_expr().map(Some)
    }

    fn peek(&self) -> Option<u8> {
        self.chan.peek(0)
    }

    fn advance(&mut self) -> Option<u8> {
        self.chan.get()
    }

    fn skip_blank(&mut self) {
        loop {
            while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
                self.advance();
            }
            if self.peek() == Some(b';') {
                while !matches!(self.peek(), None | Some(b'\n')) {
                    self.advance();
                }
            } else {
                return;
            }
        }
    }

    fn err(&self, msg: &str) -> RuntimeError {
        RuntimeError::Read(msg.into())
    }

    fn alloc(&mut self, car: Value, cdr: Value) -> Result<Value> {
        let v = self.heap.cons(car, cdr);
        if v.is_oom() {
            return Err(self.err("heap exhausted while reading"));
        }
        Ok(v)
    }

    fn read_expr(&mut self) -> Result<Value> {
        self.skip_blank();
        let ch = self.peek().ok_or_else(|| self.err("unexpected end of input"))?;
        match ch {
            b'(' => self.read_list(),
            b')' => Err(self.err("unexpected ')'")),
            b'\'' => {
                self.advance();
                let quoted = self.read_expr()?;
                let tail = self.alloc(quoted, NIL)?;
                self.alloc(Value::Symbol(sym::QUOTE), tail)
            }
            b'"' => self.read_string(),
            b'\\' => self.read_char(),
            _ => self.read_word(),
        }
    }

    /// `(a b c)`, `(a . b)`, `(a b . c)`.
    fn read_list(&mut self) -> Result<Value> {
        self.advance();
        let mut elements = Vec::new();
        let mut tail = NIL;
        loop {
            self.skip_blank();
            match self.peek() {
                None => return Err(self.err("unterminated list")),
                Some(b')') => {
                    self.advance();
                    break;
                }
                Some(b'.') if self.dot_is_separator() => {
                    self.advance();
                    tail = self.read_expr()?;
                    self.skip_blank();
                    if self.peek() != Some(b')') {
                        return Err(self.err("expected ')' after dotted tail"));
                    }
                    self.advance();
                    break;
                }
                Some(_) => elements.push(self.read_expr()?),
            }
        }
        let mut out = tail;
        for v in elements.into_iter().rev() {
            out = self.alloc(v, out)?;
        }
        Ok(out)
    }

    fn dot_is_separator(&self) -> bool {
        matches!(
            self.chan.peek(1),
            None | Some(b' ' | b'\t' | b'\n' | b'\r' | b'(' | b')')
        )
    }

    /// `"bytes"` with `\n`, `\t`, `\\`, `\"` escapes, stored as a byte
    /// array with a trailing NUL.
    fn read_string(&mut self) -> Result<Value> {
        self.advance();
        let mut bytes = Vec::new();
        loop {
            match self.advance() {
                None => return Err(self.err("unterminated string")),
                Some(b'"') => break,
                Some(b'\\') => {
                    let esc = self.advance().ok_or_else(|| self.err("unterminated escape"))?;
                    bytes.push(match esc {
                        b'n' => b'\n',
                        b't' => b'\t',
                        b'r' => b'\r',
                        b'0' => 0,
                        other => other,
                    });
                }
                Some(b) => bytes.push(b),
            }
        }
        let v = self.heap.alloc_array_from(self.mem, &bytes, true);
        if v.is_oom() {
            return Err(self.err("memory exhausted while reading string"));
        }
        Ok(v)
    }

    /// `\c` — a single character literal.
    fn read_char(&mut self) -> Result<Value> {
        self.advance();
        let c = self.advance().ok_or_else(|| self.err("unterminated character"))?;
        Ok(Value::Char(c))
    }

    fn is_delimiter(b: u8) -> bool {
        matches!(b, b' ' | b'\t' | b'\n' | b'\r' | b'(' | b')' | b';' | b'"')
    }

    /// An atom: number if it parses as one, symbol otherwise.
    fn read_word(&mut self) -> Result<Value> {
        let mut word = Vec::new();
        while let Some(b) = self.peek() {
            if Self::is_delimiter(b) {
                break;
            }
            word.push(b);
            self.advance();
        }
        let text = String::from_utf8(word).map_err(|_| self.err("invalid bytes in atom"))?;
        if text.is_empty() {
            return Err(self.err("empty atom"));
        }
        if let Some(v) = self.parse_number(&text)? {
            return Ok(v);
        }
        match self.symbols.intern(self.mem, &text) {
            Some(id) => Ok(Value::Symbol(id)),
            None => Err(self.err("symbol memory exhausted")),
        }
    }

    /// Numeric literals: `42`, `-7`, `42u`, width suffixes `i32 u32 i64
    /// u64 f32 f64`, and decimal floats (f32 unless suffixed `f64`).
    fn parse_number(&mut self, text: &str) -> Result<Option<Value>> {
        let first = text.as_bytes()[0];
        let starts_numeric = first.is_ascii_digit()
            || ((first == b'-' || first == b'+')
                && text.len() > 1
                && text.as_bytes()[1].is_ascii_digit());
        if !starts_numeric {
            return Ok(None);
        }
        let boxed = |heap: &mut Heap, kind: NumKind, raw: u64| -> Result<Option<Value>> {
            let v = heap.alloc_boxed(kind, raw);
            if v.is_oom() {
                return Err(RuntimeError::Read("heap exhausted while reading".into()));
            }
            Ok(Some(v))
        };
        for (suffix, kind) in [
            ("i64", NumKind::I64),
            ("u64", NumKind::U64),
            ("i32", NumKind::I32),
            ("u32", NumKind::U32),
            ("f64", NumKind::F64),
            ("f32", NumKind::F32),
        ] {
            if let Some(base) = text.strip_suffix(suffix) {
                let raw = match kind {
                    NumKind::I64 => base
                        .parse::<i64>()
                        .map(|n| n as u64)
                        .map_err(|_| self.err("malformed integer literal"))?,
                    NumKind::U64 => base
                        .parse::<u64>()
                        .map_err(|_| self.err("malformed integer literal"))?,
                    NumKind::I32 => base
                        .parse::<i32>()
                        .map(|n| n as u32 as u64)
                        .map_err(|_| self.err("malformed integer literal"))?,
                    NumKind::U32 => base
                        .parse::<u32>()
                        .map(|n| n as u64)
                        .map_err(|_| self.err("malformed integer literal"))?,
                    NumKind::F64 => base
                        .parse::<f64>()
                        .map(|n| n.to_bits())
                        .map_err(|_| self.err("malformed float literal"))?,
                    NumKind::F32 => base
                        .parse::<f32>()
                        .map(|n| n.to_bits() as u64)
                        .map_err(|_| self.err("malformed float literal"))?,
                };
                return boxed(self.heap, kind, raw);
            }
        }
        if let Some(base) = text.strip_suffix('u') {
            let n = base
                .parse::<u32>()
                .map_err(|_| self.err("malformed unsigned literal"))?;
            return Ok(Some(Value::Uint(n)));
        }
        if text.contains('.') {
            let n = text
                .parse::<f32>()
                .map_err(|_| self.err("malformed float literal"))?;
            return boxed(self.heap, NumKind::F32, n.to_bits() as u64);
        }
        let n = text
            .parse::<i32>()
            .map_err(|_| self.err("malformed integer literal"))?;
        Ok(Some(Value::Int(n)))
    }
}
