use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use smallock::{deallocate, live_superblocks, reclaim, Heap, SizeClass, SB_SIZE};

/// These Tests assert process-wide State like the Number of live
/// Super-Blocks, so they have to run one at a Time
static SERIAL: Mutex<()> = Mutex::new(());

fn locked() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

fn leaked_heap(slot_size: usize) -> &'static Heap {
    let size_class = Box::leak(Box::new(SizeClass::new(slot_size).unwrap()));
    Box::leak(Box::new(Heap::new(size_class)))
}

fn block_base(ptr: *mut u8) -> usize {
    (ptr as usize) & !(SB_SIZE - 1)
}

#[test]
fn single_slot_churn() {
    let _serial = locked();
    let heap = leaked_heap(64);

    for i in 0..10_000_u32 {
        let ptr = heap.allocate().unwrap();

        unsafe { ptr.as_ptr().cast::<u32>().write(i) };
        assert_eq!(i, unsafe { ptr.as_ptr().cast::<u32>().read() });

        unsafe { deallocate(ptr.as_ptr()) };
    }

    reclaim();

    let report = heap.check_consistency().unwrap();
    assert_eq!(false, report.active);
    assert_eq!(0, report.partial_descriptors);
    assert_eq!(0, live_superblocks());
}

#[test]
fn fill_one_superblock() {
    let _serial = locked();
    let heap = leaked_heap(64);
    let max_count = heap.size_class().max_count();
    assert_eq!(255, max_count);

    let slots: Vec<_> = (0..max_count)
        .map(|_| heap.allocate().unwrap().as_ptr())
        .collect();

    // All Slots are distinct and come out of one single Super-Block
    let distinct: HashSet<_> = slots.iter().map(|ptr| *ptr as usize).collect();
    assert_eq!(max_count, distinct.len());

    let first_block = block_base(slots[0]);
    for ptr in slots.iter() {
        assert_eq!(first_block, block_base(*ptr));
    }

    // The Block is full now, one more Allocation has to open a second one
    let extra = heap.allocate().unwrap().as_ptr();
    assert_ne!(first_block, block_base(extra));

    for ptr in slots {
        unsafe { deallocate(ptr) };
    }
    unsafe { deallocate(extra) };

    reclaim();

    let report = heap.check_consistency().unwrap();
    assert_eq!(false, report.active);
    assert_eq!(0, report.partial_descriptors);
    assert_eq!(0, live_superblocks());
}

#[test]
fn two_slot_blocks_churn() {
    let _serial = locked();

    // The largest served Slot-Size, every Super-Block only holds two
    // Slots, so Blocks fill and drain constantly
    let heap = leaked_heap(smallock::MAX_SMALL_SIZE);
    assert_eq!(2, heap.size_class().max_count());

    let first = heap.allocate().unwrap().as_ptr();
    let second = heap.allocate().unwrap().as_ptr();
    let third = heap.allocate().unwrap().as_ptr();

    // The first two fill one Block, the third opens another
    assert_eq!(block_base(first), block_base(second));
    assert_ne!(block_base(first), block_base(third));

    unsafe {
        deallocate(first);
        deallocate(second);
        deallocate(third);
    }

    reclaim();

    let report = heap.check_consistency().unwrap();
    assert_eq!(false, report.active);
    assert_eq!(0, report.partial_descriptors);
    assert_eq!(0, live_superblocks());
}

#[test]
fn minimum_slot_size() {
    let _serial = locked();

    // 4 Bytes is just enough for the Free-List Link, the Slot-Count is
    // clamped by the 10-bit Anchor-Fields
    let heap = leaked_heap(4);
    assert_eq!(1023, heap.size_class().max_count());

    let slots: Vec<_> = (0..1023)
        .map(|_| heap.allocate().unwrap().as_ptr())
        .collect();

    let distinct: HashSet<_> = slots.iter().map(|ptr| *ptr as usize).collect();
    assert_eq!(1023, distinct.len());

    for ptr in slots {
        unsafe { deallocate(ptr) };
    }

    reclaim();
    assert_eq!(0, live_superblocks());
}

#[test]
fn quiescent_roundtrip_is_stable() {
    let _serial = locked();
    let heap = leaked_heap(64);

    let keep = heap.allocate().unwrap();

    let before = heap.check_consistency().unwrap();

    // A full Alloc/Free-Cycle on a quiescent Heap has to leave nothing
    // behind but a bumped Tag
    let ptr = heap.allocate().unwrap();
    unsafe { deallocate(ptr.as_ptr()) };

    let after = heap.check_consistency().unwrap();
    assert_eq!(before, after);

    // The Checker itself is idempotent and side-effect-free
    assert_eq!(after, heap.check_consistency().unwrap());

    unsafe { deallocate(keep.as_ptr()) };

    reclaim();
    assert_eq!(0, live_superblocks());
}
