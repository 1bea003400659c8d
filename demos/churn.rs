use std::{ops::Div, thread};

use smallock::{deallocate, Heap, SizeClass};

const ITERATIONS: usize = 1000000;
const THREADS: usize = 4;

pub fn main() {
    let size_class = Box::leak(Box::new(SizeClass::new(64).unwrap()));
    let heap: &'static Heap = Box::leak(Box::new(Heap::new(size_class)));

    let ths: Vec<_> = (0..THREADS)
        .map(|_| {
            thread::spawn(move || {
                let start = std::time::Instant::now();
                for i in 0..ITERATIONS {
                    let ptr = heap.allocate().unwrap();
                    unsafe { (ptr.as_ptr() as *mut usize).write(i) };
                    unsafe { deallocate(ptr.as_ptr()) };
                }
                let duration = start.elapsed();

                let per_cycle = duration.div(ITERATIONS as u32);

                println!("Duration: {:?} / {}", duration, ITERATIONS);
                println!("Duration-Per-Cycle: {:?}", per_cycle);
            })
        })
        .collect();

    for th in ths {
        th.join().unwrap();
    }

    smallock::reclaim();
    println!("Live Super-Blocks: {}", smallock::live_superblocks());
}
