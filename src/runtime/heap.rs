//! Engine heap and collector
//!
//! Objects live in a slot arena and are referenced by slot index. Collection
//! is a stop-the-world mark/sweep driven by the VM at interpreter safe
//! points, with duktape-style finalization:
//! - an unreachable object whose finalizer has not run is resurrected for
//!   the current cycle and queued for finalization
//! - once finalized, the next cycle that finds it unreachable frees it
//!
//! The heap only knows about slots; the VM supplies the root set and runs
//! the queued finalizers.

use crate::vm::value::{HeapData, HeapObject};

// =========================================================================
// Configuration
// =========================================================================

/// Configuration for one engine heap.
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Allocations between automatic collections.
    pub gc_threshold: usize,
    /// Maximum nesting of script and native calls.
    pub max_call_depth: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            gc_threshold: 4096,
            max_call_depth: 1000,
        }
    }
}

// =========================================================================
// Heap
// =========================================================================

/// Counters reported by one collection cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectStats {
    /// Slots freed by the sweep.
    pub freed: usize,
    /// Objects queued for finalization.
    pub finalizable: usize,
}

#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Option<HeapObject>>,
    free: Vec<usize>,
    live: usize,
    allocs_since_gc: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object and return its slot.
    pub fn alloc(&mut self, obj: HeapObject) -> usize {
        self.live += 1;
        self.allocs_since_gc += 1;
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(obj);
                slot
            }
            None => {
                self.slots.push(Some(obj));
                self.slots.len() - 1
            }
        }
    }

    pub fn alloc_data(&mut self, data: HeapData) -> usize {
        self.alloc(HeapObject::new(data))
    }

    pub fn get(&self, ptr: usize) -> Option<&HeapObject> {
        self.slots.get(ptr).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, ptr: usize) -> Option<&mut HeapObject> {
        self.slots.get_mut(ptr).and_then(Option::as_mut)
    }

    /// Every allocated object, in slot order.
    pub(crate) fn objects(&self) -> impl Iterator<Item = &HeapObject> {
        self.slots.iter().flatten()
    }

    /// Number of allocated objects.
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Check if the allocation budget since the last cycle is used up.
    pub fn should_collect(&self, threshold: usize) -> bool {
        self.allocs_since_gc >= threshold
    }

    /// Mark everything reachable from `roots`.
    pub(crate) fn mark(&mut self, roots: Vec<usize>) {
        let mut worklist = roots;
        while let Some(ptr) = worklist.pop() {
            let Some(obj) = self.get_mut(ptr) else {
                continue;
            };
            if obj.marked {
                continue;
            }
            obj.marked = true;
            worklist.extend(obj.children());
        }
    }

    /// Unmarked objects that still owe a finalizer call.
    pub(crate) fn unmarked_finalizable(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(ptr, slot)| {
                let obj = slot.as_ref()?;
                (!obj.marked && !obj.finalized && obj.has_finalizer()).then_some(ptr)
            })
            .collect()
    }

    /// Every object that still owes a finalizer call, reachable or not.
    pub(crate) fn all_finalizable(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(ptr, slot)| {
                let obj = slot.as_ref()?;
                (!obj.finalized && obj.has_finalizer()).then_some(ptr)
            })
            .collect()
    }

    pub(crate) fn set_finalized(&mut self, ptr: usize) {
        if let Some(obj) = self.get_mut(ptr) {
            obj.finalized = true;
        }
    }

    /// Free every unmarked slot and clear the marks of the survivors.
    pub(crate) fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for (ptr, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                Some(obj) if obj.marked => obj.marked = false,
                Some(_) => {
                    *slot = None;
                    self.free.push(ptr);
                    freed += 1;
                }
                None => {}
            }
        }
        self.live -= freed;
        self.allocs_since_gc = 0;
        freed
    }
}

#[cfg(test)]
mod tests {
    use crate::vm::value::{FINALIZER_PROP, JsValue};

    use super::*;

    #[test]
    fn test_alloc_reuses_freed_slots() {
        let mut heap = Heap::new();
        let a = heap.alloc_data(HeapData::Object);
        let _b = heap.alloc_data(HeapData::Object);
        heap.mark(vec![]);
        assert_eq!(heap.sweep(), 2);
        assert_eq!(heap.live_count(), 0);
        let c = heap.alloc_data(HeapData::Object);
        assert!(c == a || c == 1);
        assert_eq!(heap.live_count(), 1);
    }

    #[test]
    fn test_mark_follows_properties() {
        let mut heap = Heap::new();
        let leaf = heap.alloc_data(HeapData::Object);
        let root = heap.alloc_data(HeapData::Object);
        let orphan = heap.alloc_data(HeapData::Object);
        heap.get_mut(root)
            .unwrap()
            .props
            .set("child", JsValue::Object(leaf));

        heap.mark(vec![root]);
        assert_eq!(heap.sweep(), 1);
        assert!(heap.get(root).is_some());
        assert!(heap.get(leaf).is_some());
        assert!(heap.get(orphan).is_none());
    }

    #[test]
    fn test_finalizable_objects_are_reported_once() {
        let mut heap = Heap::new();
        let finalizer = heap.alloc_data(HeapData::Object);
        let target = heap.alloc_data(HeapData::Object);
        heap.get_mut(target)
            .unwrap()
            .internal
            .set(FINALIZER_PROP, JsValue::Object(finalizer));

        heap.mark(vec![]);
        assert_eq!(heap.unmarked_finalizable(), vec![target]);
        heap.set_finalized(target);
        assert!(heap.unmarked_finalizable().is_empty());
        assert!(heap.all_finalizable().is_empty());
    }

    #[test]
    fn test_threshold_resets_after_sweep() {
        let mut heap = Heap::new();
        for _ in 0..3 {
            heap.alloc_data(HeapData::Object);
        }
        assert!(heap.should_collect(3));
        heap.mark(vec![]);
        heap.sweep();
        assert!(!heap.should_collect(3));
    }
}
