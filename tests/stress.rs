//! Mixed stress: hazard-pointer churn and RCU grace periods side by side.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use nazar::{
    HazardCell, HazardCtx, HazardNode, RcuDomain, ReaderTls, hp_get, hp_put, promote_to_ref,
    synchronize, synchronize_put,
};

#[repr(C)]
struct Node {
    node: HazardNode,
    generation: usize,
    drops: Arc<AtomicUsize>,
}

unsafe fn release_node(node: *mut HazardNode) {
    drop(unsafe { Box::from_raw(node as *mut Node) });
}

impl Drop for Node {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn hazard_churn_reclaims_everything() {
    const CELLS: usize = 4;
    const RUN_FOR: Duration = Duration::from_millis(500);

    let cells: Arc<Vec<HazardCell>> = Arc::new((0..CELLS).map(|_| HazardCell::new()).collect());
    let drops = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));

    let mut readers = Vec::new();
    for _ in 0..6 {
        let cells = cells.clone();
        let stop = stop.clone();
        readers.push(thread::spawn(move || {
            let mut rng = rand::thread_rng();
            while !stop.load(Ordering::Relaxed) {
                let cell = &cells[rng.gen_range(0..CELLS)];
                let mut ctx = HazardCtx::new();
                if hp_get(cell, &mut ctx) {
                    if rng.gen_bool(0.3) {
                        promote_to_ref(&mut ctx);
                    }
                    std::hint::black_box(unsafe { (*(ctx.node() as *const Node)).generation });
                    hp_put(&mut ctx);
                }
            }
        }));
    }

    let mut retired = 0usize;
    let mut generation = 0usize;
    let start = Instant::now();
    let mut rng = rand::thread_rng();
    while start.elapsed() < RUN_FOR {
        let cell = &cells[rng.gen_range(0..CELLS)];
        generation += 1;
        let fresh = Box::into_raw(Box::new(Node {
            node: HazardNode::new(release_node),
            generation,
            drops: drops.clone(),
        }));
        unsafe { cell.set(fresh as *mut HazardNode) };
        thread::yield_now();
        unsafe { cell.set(ptr::null_mut()) };
        unsafe { synchronize_put(fresh as *mut HazardNode) };
        retired += 1;

        if retired % 32 == 0 {
            synchronize(ptr::null());
        }
    }

    stop.store(true, Ordering::Relaxed);
    for r in readers {
        r.join().unwrap();
    }

    assert_eq!(drops.load(Ordering::SeqCst), retired);
}

#[test]
#[cfg_attr(miri, ignore)]
fn rcu_writers_and_readers_under_churn() {
    const RUN_FOR: Duration = Duration::from_millis(500);

    let domain = Arc::new(RcuDomain::new());
    let stop = Arc::new(AtomicBool::new(false));
    let gps = Arc::new(AtomicUsize::new(0));

    let mut readers = Vec::new();
    for _ in 0..4 {
        let domain = domain.clone();
        let stop = stop.clone();
        readers.push(thread::spawn(move || {
            let tls = ReaderTls::new();
            domain.register_thread(&tls);
            let mut rng = rand::thread_rng();
            let mut n = 0usize;
            while !stop.load(Ordering::Relaxed) {
                domain.read_lock(&tls);
                domain.read_unlock(&tls);
                n += 1;
                if n % 16 == 0 {
                    domain.quiescent_state(&tls);
                }
                if rng.gen_bool(0.01) {
                    // Extended quiescent window.
                    domain.thread_offline(&tls);
                    thread::yield_now();
                    domain.thread_online(&tls);
                }
            }
            domain.unregister_thread(&tls);
        }));
    }

    let mut writers = Vec::new();
    for _ in 0..3 {
        let domain = domain.clone();
        let stop = stop.clone();
        let gps = gps.clone();
        writers.push(thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                domain.synchronize(None);
                gps.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }

    thread::sleep(RUN_FOR);
    stop.store(true, Ordering::Relaxed);
    for w in writers {
        w.join().unwrap();
    }
    for r in readers {
        r.join().unwrap();
    }

    assert!(gps.load(Ordering::Relaxed) > 0, "no grace period completed");
}
