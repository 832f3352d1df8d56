// Tracing mark-sweep garbage collector and the heap arena it manages.
//
// Objects live in a `Vec<Option<Obj>>` rather than behind raw pointers: an
// `ObjRef` is just an index. This gives the "intrusive next-object link /
// mark bit" header the spec describes for free (the vec's slot order is the
// object list, and `marked[i]` is the mark bit) without reaching for
// `unsafe`. Freed slots are pushed onto a free list and reused by later
// allocations, which is the arena-allocated-cell approach the design notes
// call out as the ownership-disciplined alternative to raw pointers.

use crate::object::Obj;
use crate::table::Table;
use crate::value::Value;

/// Doubling factor applied to `next_gc` after every collection.
const HEAP_GROW_FACTOR: usize = 2;

/// A handle to a heap-resident `Obj`. Cheap to copy; stable across
/// collections (sweeping never moves survivors, it only frees slots).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(u32);

impl ObjRef {
    #[cfg(test)]
    pub fn from_raw(i: u32) -> Self {
        ObjRef(i)
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

pub fn hash_bytes(bytes: &[u8]) -> u32 {
    // FNV-1a, matching the source's string hashing.
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

pub struct Heap {
    objects: Vec<Option<Obj>>,
    marked: Vec<bool>,
    free_list: Vec<u32>,
    gray: Vec<ObjRef>,
    pub bytes_allocated: usize,
    pub next_gc: usize,
    pub stress_gc: bool,
    pub log_gc: bool,
    /// Process-wide string intern set. Value type is `()`: membership is
    /// the whole point, the key (an interned `ObjRef`) carries the content.
    pub strings: Table<()>,
    pub init_string: ObjRef,
}

const DEFAULT_NEXT_GC: usize = 1024 * 1024;

impl Heap {
    pub fn new() -> Self {
        let mut heap = Heap {
            objects: Vec::new(),
            marked: Vec::new(),
            free_list: Vec::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: DEFAULT_NEXT_GC,
            stress_gc: false,
            log_gc: false,
            strings: Table::new(),
            init_string: ObjRef(0),
        };
        // No roots exist yet, so this cannot trigger (or need to survive) a
        // collection; safe to use an allocation path that ignores GC roots.
        heap.init_string = heap.intern_bytes(b"init", |_| {});
        heap
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        self.objects[r.index()]
            .as_ref()
            .expect("dangling ObjRef: object was swept while still referenced")
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        self.objects[r.index()]
            .as_mut()
            .expect("dangling ObjRef: object was swept while still referenced")
    }

    fn bytes_of(&self, r: ObjRef) -> &[u8] {
        match self.get(r) {
            Obj::String(s) => &s.bytes,
            _ => &[],
        }
    }

    /// Intern `bytes`, allocating a new `String` object only if no equal
    /// content is already interned. `mark_roots` is invoked only if this
    /// allocation needs to trigger a collection first.
    pub fn intern_bytes(&mut self, bytes: &[u8], mark_roots: impl FnOnce(&mut Heap)) -> ObjRef {
        let hash = hash_bytes(bytes);
        if let Some(existing) = self.strings.find_by(hash, |r| self.bytes_of(r) == bytes) {
            return existing;
        }
        let size = bytes.len();
        let obj = Obj::String(crate::object::LString { bytes: bytes.into(), hash });
        let r = self.alloc(obj, size, mark_roots);
        self.strings.set(r, hash, ());
        r
    }

    /// Allocate a non-string object. Callers are responsible for making sure
    /// anything the new object depends on, but doesn't yet reach via the
    /// root set, is kept alive across this call (e.g. by having already
    /// pushed it to the VM's value stack, or linked it into the open
    /// upvalue list) — the standard "push before you allocate again" rule.
    pub fn alloc(&mut self, obj: Obj, size: usize, mark_roots: impl FnOnce(&mut Heap)) -> ObjRef {
        self.bytes_allocated += size;
        if self.stress_gc || self.bytes_allocated > self.next_gc {
            self.collect(mark_roots);
        }
        self.push_obj(obj)
    }

    fn push_obj(&mut self, obj: Obj) -> ObjRef {
        if let Some(i) = self.free_list.pop() {
            self.objects[i as usize] = Some(obj);
            self.marked[i as usize] = false;
            ObjRef(i)
        } else {
            self.objects.push(Some(obj));
            self.marked.push(false);
            ObjRef((self.objects.len() - 1) as u32)
        }
    }

    pub fn mark_object(&mut self, r: ObjRef) {
        if self.marked[r.index()] {
            return;
        }
        self.marked[r.index()] = true;
        self.gray.push(r);
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    pub fn mark_init_string(&mut self) {
        self.mark_object(self.init_string);
    }

    /// Follows an open upvalue's `next_open` link; used by root marking to
    /// walk the whole open-upvalue list without the caller needing to know
    /// its representation.
    pub fn upvalue_next_open(&self, r: ObjRef) -> Option<ObjRef> {
        match self.get(r) {
            Obj::Upvalue(u) => u.next_open,
            _ => None,
        }
    }

    pub fn collect(&mut self, mark_roots: impl FnOnce(&mut Heap)) {
        let before = self.bytes_allocated;
        mark_roots(self);
        self.trace_references();
        self.sweep_strings();
        self.sweep_objects();
        self.next_gc = (self.bytes_allocated.max(1)) * HEAP_GROW_FACTOR;
        if self.log_gc {
            eprintln!(
                "-- gc: {} -> {} bytes, next at {}",
                before, self.bytes_allocated, self.next_gc
            );
        }
    }

    fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }
    }

    fn blacken(&mut self, r: ObjRef) {
        let children: Vec<ObjRef> = {
            match self.get(r) {
                Obj::String(_) => Vec::new(),
                Obj::Native(n) => vec![n.name],
                Obj::Function(f) => {
                    let mut v: Vec<ObjRef> = f.name.into_iter().collect();
                    v.extend(f.chunk.constants.iter().filter_map(value_obj));
                    v
                }
                Obj::Closure(c) => {
                    let mut v = vec![c.function];
                    v.extend(c.upvalues.iter().copied());
                    v
                }
                Obj::Upvalue(u) => value_obj(&u.closed).into_iter().collect(),
                Obj::Class(c) => {
                    let mut v = vec![c.name];
                    v.extend(c.methods.values().filter_map(value_obj));
                    v
                }
                Obj::Instance(i) => {
                    let mut v = vec![i.class];
                    v.extend(i.fields.values().filter_map(value_obj));
                    v
                }
                Obj::BoundMethod(b) => {
                    let mut v = vec![b.method];
                    v.extend(value_obj(&b.receiver));
                    v
                }
            }
        };
        for child in children {
            self.mark_object(child);
        }
    }

    fn sweep_strings(&mut self) {
        let mut strings = std::mem::take(&mut self.strings);
        let marked = &self.marked;
        strings.retain(|r| marked[r.index()]);
        self.strings = strings;
    }

    fn sweep_objects(&mut self) {
        for i in 0..self.objects.len() {
            if self.objects[i].is_none() {
                continue;
            }
            if self.marked[i] {
                self.marked[i] = false;
            } else if let Some(obj) = self.objects[i].take() {
                self.bytes_allocated = self.bytes_allocated.saturating_sub(obj.approx_size());
                self.free_list.push(i as u32);
            }
        }
    }

    #[cfg(test)]
    pub fn live_count(&self) -> usize {
        self.objects.iter().filter(|o| o.is_some()).count()
    }
}

fn value_obj(v: &Value) -> Option<ObjRef> {
    match v {
        Value::Obj(r) => Some(*r),
        _ => None,
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::LString;

    #[test]
    fn interning_dedups_equal_content() {
        let mut heap = Heap::new();
        let a = heap.intern_bytes(b"hello", |_| {});
        let b = heap.intern_bytes(b"hello", |_| {});
        assert_eq!(a, b);
    }

    #[test]
    fn unmarked_objects_are_swept() {
        let mut heap = Heap::new();
        let before = heap.live_count();
        heap.alloc(
            Obj::String(LString { bytes: b"x".to_vec().into_boxed_slice(), hash: 1 }),
            1,
            |_| {},
        );
        assert_eq!(heap.live_count(), before + 1);
        // No roots mark the new object: collecting should free it again.
        heap.collect(|_| {});
        assert_eq!(heap.live_count(), before);
    }

    #[test]
    fn marked_objects_survive_collection() {
        let mut heap = Heap::new();
        let r = heap.alloc(
            Obj::String(LString { bytes: b"x".to_vec().into_boxed_slice(), hash: 1 }),
            1,
            |_| {},
        );
        heap.collect(|h| h.mark_object(r));
        assert!(heap.get(r).as_string().is_some());
    }
}
