//! Driving marking to a fixed point, and clearing what stayed unmarked.

use std::sync::atomic::Ordering;

use crate::heap::full::FullMarkingVisitor;
use crate::heap::marking_state::MarkingState;
use crate::heap::visitor::MarkingVisitor;
use crate::heap::worklist::{Ephemeron, WeakObjects};
use crate::vm::layout;
use crate::vm::{MaybeObject, ObjectModel};

/// Visit objects until the marking worklist is empty. Returns the number of bytes visited.
pub fn drain<'a, V: MarkingVisitor<'a>>(visitor: &mut V) -> usize {
    let mut bytes = 0;
    while let Some(object) = visitor.marking_worklists().pop() {
        bytes += visitor.visit(object);
    }
    bytes
}

/// Mark through ephemerons until no more values become reachable.
///
/// A value is marked once its key is. Each round drains the marking worklist, then
/// re-examines every discovered ephemeron. Pairs whose key is still unmarked wait for the
/// next round. Returns the number of bytes visited. Pairs left when the fixed point is
/// reached have dead keys and are dropped.
pub fn process_ephemerons<'a, M, S>(visitor: &mut FullMarkingVisitor<'a, M, S>) -> usize
where
    M: ObjectModel + 'a,
    S: MarkingState<M::Object> + 'a,
{
    let mut bytes = 0;
    let mut rounds = 0;
    loop {
        bytes += drain(visitor);
        rounds += 1;

        let mut progress = false;
        while let Some(ephemeron) = visitor.weak_objects().discovered_ephemerons.pop() {
            progress |= process_ephemeron(visitor, ephemeron);
        }
        while let Some(ephemeron) = visitor.weak_objects().next_ephemerons.pop() {
            visitor.weak_objects().discovered_ephemerons.push(ephemeron);
        }

        if !progress && visitor.marking_worklists().is_empty() {
            break;
        }
    }
    let dropped = std::iter::from_fn(|| visitor.weak_objects().discovered_ephemerons.pop()).count();
    debug!(
        "Ephemerons reached a fixed point after {} rounds, {} pairs with dead keys",
        rounds, dropped
    );
    bytes
}

/// Returns whether the value was marked.
fn process_ephemeron<'a, M, S>(
    visitor: &mut FullMarkingVisitor<'a, M, S>,
    Ephemeron { key, value }: Ephemeron<M::Object>,
) -> bool
where
    M: ObjectModel + 'a,
    S: MarkingState<M::Object> + 'a,
{
    let marking_state = visitor.marking_state();
    if marking_state.is_marked(key) {
        return visitor.mark_object(Some(key), value);
    }
    if marking_state.is_unmarked(value) {
        let weak_objects = visitor.weak_objects();
        weak_objects.next_ephemerons.push(Ephemeron { key, value });
    }
    false
}

fn is_dead<M: ObjectModel, S: MarkingState<M::Object>>(
    model: &M,
    marking_state: &S,
    value: MaybeObject<M::Object>,
) -> bool {
    match value.heap_object() {
        Some(object) => !model.in_read_only_space(object) && marking_state.is_unmarked(object),
        None => false,
    }
}

fn clear_if_dead<M: ObjectModel, S: MarkingState<M::Object>>(
    model: &M,
    marking_state: &S,
    host: M::Object,
    index: usize,
) -> bool {
    let value = model.load_field(host, index, Ordering::Relaxed);
    if is_dead(model, marking_state, value) {
        model.store_field(host, index, MaybeObject::Cleared, Ordering::Relaxed);
        true
    } else {
        false
    }
}

/// Clear every weak reference whose referent stayed unmarked: weak slots, the targets of
/// weak refs, the targets and unregister tokens of weak cells, and ephemeron entries with
/// dead keys. Returns the number of cleared references.
///
/// Must run after marking reached its fixed point and every visitor was published or
/// dropped. Transition arrays and code flushing candidates are left on their worklists.
pub fn clear_weak_references<M: ObjectModel, S: MarkingState<M::Object>>(
    model: &M,
    marking_state: &S,
    weak_objects: &WeakObjects<M::Object>,
) -> usize {
    let mut cleared = 0;

    for slot in weak_objects.weak_references.drain() {
        // The slot may have been overwritten since it was recorded.
        if let MaybeObject::Weak(_) = model.load_field(slot.host, slot.index, Ordering::Relaxed) {
            cleared += clear_if_dead(model, marking_state, slot.host, slot.index) as usize;
        }
    }

    for weak_ref in weak_objects.js_weak_refs.drain() {
        use layout::js_weak_ref::TARGET;
        cleared += clear_if_dead(model, marking_state, weak_ref, TARGET) as usize;
    }

    for weak_cell in weak_objects.weak_cells.drain() {
        use layout::weak_cell::{TARGET, UNREGISTER_TOKEN};
        cleared += clear_if_dead(model, marking_state, weak_cell, TARGET) as usize;
        cleared += clear_if_dead(model, marking_state, weak_cell, UNREGISTER_TOKEN) as usize;
    }

    for table in weak_objects.ephemeron_hash_tables.drain() {
        use layout::ephemeron_hash_table::{key_slot, number_of_entries, value_slot};
        for entry in 0..number_of_entries(model.field_count(table)) {
            if clear_if_dead(model, marking_state, table, key_slot(entry)) {
                model.store_field(
                    table,
                    value_slot(entry),
                    MaybeObject::Cleared,
                    Ordering::Relaxed,
                );
                cleared += 1;
            }
        }
    }

    debug!("Cleared {} weak references", cleared);
    cleared
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::mock_heap::{MarkingCycle, MockHeap};
    use crate::util::test_util::panic_after;
    use crate::vm::VisitorId;
    use layout::ephemeron_hash_table::{key_slot, value_slot};

    #[test]
    fn drain_counts_bytes() {
        let mut heap = MockHeap::new();
        let a = heap.build(VisitorId::JSObject).fields(2).finish();
        let b = heap.build(VisitorId::DataObject).fields(3).finish();
        heap.set_strong(a, 1, b);
        let cycle = MarkingCycle::new(&heap);
        let mut visitor = cycle.full_visitor();
        visitor.mark_root(a);
        assert_eq!(drain(&mut visitor), heap.size_of(a) + heap.size_of(b));
    }

    #[test]
    fn ephemeron_values_follow_their_keys() {
        let mut heap = MockHeap::new();
        let root = heap.build(VisitorId::JSObject).fields(3).finish();
        let table = heap
            .build(VisitorId::EphemeronHashTable)
            .entries(2)
            .finish();
        let key = heap.build(VisitorId::JSObject).fields(1).finish();
        let value = heap.build(VisitorId::JSObject).fields(2).finish();
        let value_child = heap.build(VisitorId::DataObject).finish();
        let dead_key = heap.build(VisitorId::DataObject).finish();
        let dead_value = heap.build(VisitorId::DataObject).finish();
        heap.set_strong(value, 1, value_child);
        heap.set_strong(table, key_slot(0), key);
        heap.set_strong(table, value_slot(0), value);
        heap.set_strong(table, key_slot(1), dead_key);
        heap.set_strong(table, value_slot(1), dead_value);
        let holder = heap.build(VisitorId::JSObject).fields(2).finish();
        heap.set_strong(holder, 1, key);
        // The table is pushed last, so it is visited before the key is found.
        heap.set_strong(root, 1, holder);
        heap.set_strong(root, 2, table);

        let cycle = MarkingCycle::new(&heap);
        {
            let mut visitor = cycle.full_visitor();
            visitor.mark_root(root);
            process_ephemerons(&mut visitor);
            assert!(visitor.weak_objects().discovered_ephemerons.pop().is_none());
        }
        assert!(cycle.is_marked(key));
        assert!(cycle.is_marked(value));
        assert!(cycle.is_marked(value_child));
        assert!(!cycle.is_marked(dead_key));
        assert!(!cycle.is_marked(dead_value));

        assert_eq!(
            clear_weak_references(&heap, &cycle.state, &cycle.weak_objects),
            1
        );
        assert_eq!(heap.load(table, key_slot(0)), MaybeObject::Strong(key));
        assert_eq!(heap.load(table, key_slot(1)), MaybeObject::Cleared);
        assert_eq!(heap.load(table, value_slot(1)), MaybeObject::Cleared);
    }

    #[test]
    fn chained_ephemerons_are_resolved() {
        // keys[i] keeps keys[i + 1] alive.
        const CHAIN: usize = 5;
        let mut heap = MockHeap::new();
        let table = heap
            .build(VisitorId::EphemeronHashTable)
            .entries(CHAIN)
            .finish();
        let keys: Vec<_> = (0..=CHAIN)
            .map(|_| heap.build(VisitorId::DataObject).finish())
            .collect();
        // Entries that unlock later keys come first.
        for i in 0..CHAIN {
            heap.set_strong(table, key_slot(CHAIN - 1 - i), keys[i]);
            heap.set_strong(table, value_slot(CHAIN - 1 - i), keys[i + 1]);
        }

        let cycle = MarkingCycle::new(&heap);
        {
            let mut visitor = cycle.full_visitor();
            visitor.mark_root(table);
            visitor.mark_root(keys[0]);
            process_ephemerons(&mut visitor);
        }
        assert!(keys.iter().all(|k| cycle.is_marked(*k)));
        assert_eq!(
            clear_weak_references(&heap, &cycle.state, &cycle.weak_objects),
            0
        );
    }

    #[test]
    fn dead_weak_references_are_cleared() {
        use layout::weak_cell::{TARGET, UNREGISTER_TOKEN};
        let mut heap = MockHeap::new();
        let array = heap.build(VisitorId::WeakFixedArray).fields(3).finish();
        let weak_ref = heap.build(VisitorId::JSWeakRef).finish();
        let cell = heap.build(VisitorId::WeakCell).finish();
        let live = heap.build(VisitorId::DataObject).finish();
        let dead = heap.build(VisitorId::DataObject).finish();
        let read_only = heap.build(VisitorId::DataObject).read_only().finish();
        heap.set_weak(array, 1, live);
        heap.set_weak(array, 2, dead);
        heap.set_strong(weak_ref, layout::js_weak_ref::TARGET, dead);
        heap.set_strong(cell, TARGET, dead);
        heap.set_strong(cell, UNREGISTER_TOKEN, read_only);

        let cycle = MarkingCycle::new(&heap);
        {
            let mut visitor = cycle.full_visitor();
            for root in [array, weak_ref, cell] {
                visitor.mark_root(root);
            }
            drain(&mut visitor);
            // Marked after the array was visited.
            visitor.mark_root(live);
            drain(&mut visitor);
        }
        assert_eq!(
            clear_weak_references(&heap, &cycle.state, &cycle.weak_objects),
            3
        );
        assert_eq!(heap.load(array, 1), MaybeObject::Weak(live));
        assert_eq!(heap.load(array, 2), MaybeObject::Cleared);
        assert_eq!(
            heap.load(weak_ref, layout::js_weak_ref::TARGET),
            MaybeObject::Cleared
        );
        assert_eq!(heap.load(cell, TARGET), MaybeObject::Cleared);
        assert_eq!(
            heap.load(cell, UNREGISTER_TOKEN),
            MaybeObject::Strong(read_only)
        );
    }

    #[test]
    fn parallel_marking_marks_each_object_once() {
        const OBJECTS: usize = 2000;
        const THREADS: usize = 4;
        panic_after(10_000, || {
            let mut heap = MockHeap::new();
            let objects: Vec<_> = (0..OBJECTS)
                .map(|_| heap.build(VisitorId::JSObject).fields(3).finish())
                .collect();
            // Every object points at two others, so many markers race for each object.
            for (i, object) in objects.iter().enumerate() {
                heap.set_strong(*object, 1, objects[(i * 7 + 1) % OBJECTS]);
                heap.set_strong(*object, 2, objects[(i + 1) % OBJECTS]);
            }

            let cycle = MarkingCycle::new(&heap);
            let bytes: usize = std::thread::scope(|s| {
                let handles: Vec<_> = (0..THREADS)
                    .map(|t| {
                        let cycle = &cycle;
                        let objects = &objects;
                        s.spawn(move || {
                            let mut visitor = cycle.full_visitor();
                            visitor.mark_root(objects[t * OBJECTS / THREADS]);
                            let mut bytes = 0;
                            // Keep stealing until every thread ran dry.
                            loop {
                                bytes += drain(&mut visitor);
                                visitor.publish();
                                if cycle.worklists.is_empty() {
                                    break;
                                }
                            }
                            bytes
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).sum()
            });
            assert!(objects.iter().all(|o| cycle.is_marked(*o)));
            assert_eq!(cycle.state.bitmap().count(), OBJECTS);
            // Each object is visited exactly once.
            assert_eq!(bytes, OBJECTS * heap.size_of(objects[0]));
        });
    }
}
