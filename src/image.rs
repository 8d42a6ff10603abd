//! Persisted heap images. An image carries the constant-heap contents,
//! the user symbol list, the flattened global environment, and an
//! optional startup expression. Booting an image restores the constant
//! heap through the idempotent write path, so restoring over a warm
//! region succeeds, and rebuilds the global environment spine in RAM so
//! later `define`s can mutate it.

use std::fs;
use std::path::Path;

use crate::consts::{decode_word, encode_word};
use crate::error::{Result, RuntimeError};
use crate::value::{SymbolId, Value, NIL};
use crate::Runtime;

const MAGIC: u64 = 0x454d_4252__4c53_5031; // "EMBR LSP1"
const VERSION: u64 = 1;

/// Flatten `v` into the constant heap, returning the constant-space
/// value. Immediates pass through; compound values are copied cell by
/// cell. Already-constant values are shared, not duplicated.
pub fn flatten(rt: &mut Runtime, v: Value) -> Result<Value> {
    let full = || RuntimeError::Image("constant heap full".into());
    match v {
        Value::Int(_) | Value::Uint(_) | Value::Char(_) | Value::Symbol(_) => Ok(v),
        Value::Cons(id) if id.is_const() => Ok(v),
        Value::Boxed(id) if id.is_const() => Ok(v),
        Value::Array(id) if id.is_const() => Ok(v),
        Value::Cons(id) => {
            let car = rt.heap.car_ram(id);
            let cdr = rt.heap.cdr_ram(id);
            let car = flatten(rt, car)?;
            let cdr = flatten(rt, cdr)?;
            let cell = rt.consts.append_cell(car, cdr).ok_or_else(full)?;
            Ok(Value::Cons(cell))
        }
        Value::Boxed(id) => {
            let (raw, kind) = rt
                .heap
                .boxed_parts(id)
                .ok_or_else(|| RuntimeError::Image("malformed boxed cell".into()))?;
            let cell = rt.consts.append_boxed(kind, raw).ok_or_else(full)?;
            Ok(Value::Boxed(cell))
        }
        Value::Array(id) => {
            let (size, data_ix) = rt.heap.array_header(&rt.mem, id);
            let bytes = rt.mem.read_bytes(data_ix, size);
            let cell = rt.consts.append_array(&bytes).ok_or_else(full)?;
            Ok(Value::Array(cell))
        }
        _ => Err(RuntimeError::Image("value has no constant form".into())),
    }
}

/// Flatten the global environment (and an optional startup expression)
/// and write the image to `path`.
pub fn save(rt: &mut Runtime, path: &Path, startup: Option<Value>) -> Result<()> {
    let mut flat_env = NIL;
    // Rebuild the alist in constant space, preserving order.
    let mut bindings = Vec::new();
    let mut curr = rt.global_env;
    while let Value::Cons(id) = curr {
        bindings.push(rt.heap.car_ram(id));
        curr = rt.heap.cdr_ram(id);
    }
    for &b in bindings.iter().rev() {
        let b = flatten(rt, b)?;
        flat_env = Value::Cons(
            rt.consts
                .append_cell(b, flat_env)
                .ok_or_else(|| RuntimeError::Image("constant heap full".into()))?,
        );
    }
    let startup = match startup {
        Some(v) => flatten(rt, v)?,
        None => NIL,
    };

    let env_word =
        encode_word(flat_env).ok_or_else(|| RuntimeError::Image("unencodable environment".into()))?;
    let startup_word =
        encode_word(startup).ok_or_else(|| RuntimeError::Image("unencodable startup".into()))?;

    let mut words: Vec<u64> = vec![
        MAGIC,
        VERSION,
        rt.heap.num_cells() as u64,
        rt.mem.num_words() as u64,
        rt.consts.next_ix() as u64,
        env_word,
        startup_word,
    ];
    words.extend_from_slice(rt.consts.written_words());

    let syms = rt.symbols.user_entries(&rt.mem);
    words.push(syms.len() as u64);
    for (id, name) in syms {
        words.push(id.0 as u64);
        words.push(name.len() as u64);
        for chunk in name.as_bytes().chunks(8) {
            let mut w = 0u64;
            for (i, &b) in chunk.iter().enumerate() {
                w |= (b as u64) << (i * 8);
            }
            words.push(w);
        }
    }

    let mut bytes = Vec::with_capacity(words.len() * 8);
    for w in words {
        bytes.extend_from_slice(&w.to_le_bytes());
    }
    fs::write(path, bytes)?;
    Ok(())
}

/// Restore an image into a fresh (or identically warm) runtime. Returns
/// the startup expression, if the image carries one.
pub fn boot(rt: &mut Runtime, path: &Path) -> Result<Option<Value>> {
    let bytes = fs::read(path)?;
    if bytes.len() % 8 != 0 || bytes.len() < 7 * 8 {
        return Err(RuntimeError::Image("truncated image".into()));
    }
    let words: Vec<u64> = bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect();
    if words[0] != MAGIC {
        return Err(RuntimeError::Image("bad magic".into()));
    }
    if words[1] != VERSION {
        return Err(RuntimeError::Image("unsupported version".into()));
    }
    let const_len = words[4] as usize;
    let env_word = words[5];
    let startup_word = words[6];
    let mut pos = 7;
    if words.len() < pos + const_len + 1 {
        return Err(RuntimeError::Image("truncated constant heap".into()));
    }
    for (ix, &w) in words[pos..pos + const_len].iter().enumerate() {
        rt.consts.const_write(ix as u32, w)?;
    }
    rt.consts.set_next_ix(const_len as u32);
    pos += const_len;

    let nsyms = words[pos] as usize;
    pos += 1;
    for _ in 0..nsyms {
        if words.len() < pos + 2 {
            return Err(RuntimeError::Image("truncated symbol record".into()));
        }
        let id = SymbolId(words[pos] as u32);
        let len = words[pos + 1] as usize;
        pos += 2;
        let nwords = crate::mem::bytes_to_words(len.max(1));
        if words.len() < pos + nwords {
            return Err(RuntimeError::Image("truncated symbol name".into()));
        }
        let mut name = Vec::with_capacity(len);
        for i in 0..len {
            name.push((words[pos + i / 8] >> ((i % 8) * 8)) as u8);
        }
        pos += nwords;
        let name = String::from_utf8(name)
            .map_err(|_| RuntimeError::Image("symbol name is not UTF-8".into()))?;
        if !rt.symbols.add_with_id(&rt.mem, &name, id) {
            return Err(RuntimeError::Image(format!("symbol conflict for {}", name)));
        }
    }

    let flat_env =
        decode_word(env_word).ok_or_else(|| RuntimeError::Image("bad environment root".into()))?;
    rt.global_env = unflatten_env(rt, flat_env)?;

    let startup =
        decode_word(startup_word).ok_or_else(|| RuntimeError::Image("bad startup root".into()))?;
    Ok(if startup.is_nil() { None } else { Some(startup) })
}

/// Copy the constant alist spine back into RAM cells so `define` can
/// mutate bindings; values keep pointing into constant space.
fn unflatten_env(rt: &mut Runtime, flat: Value) -> Result<Value> {
    let mut bindings = Vec::new();
    let mut curr = flat;
    while curr.is_cons() {
        let b = rt.car(curr);
        bindings.push((rt.car(b), rt.cdr(b)));
        curr = rt.cdr(curr);
    }
    let mut env = NIL;
    for &(k, v) in bindings.iter().rev() {
        let cell = rt.heap.cons(k, v);
        if cell.is_oom() {
            return Err(RuntimeError::Image("heap exhausted during boot".into()));
        }
        env = rt.heap.cons(cell, env);
        if env.is_oom() {
            return Err(RuntimeError::Image("heap exhausted during boot".into()));
        }
    }
    Ok(env)
}
