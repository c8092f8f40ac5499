use kernel_sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn basic_read_write_and_raii() {
    let l = RwLock::new(0_u32);

    {
        let mut g = l.write();
        *g = 41;
    }

    {
        let r1 = l.read();
        let r2 = l.read();
        assert_eq!(*r1 + *r2, 82);
    }

    {
        let mut g = l.write();
        *g += 1;
        assert_eq!(*g, 42);
    }
}

#[test]
fn try_semantics() {
    let l = RwLock::new(1u8);

    let r = l.try_read();
    assert!(r.is_some());
    assert!(l.try_read().is_some(), "readers must share");
    assert!(l.try_write().is_none(), "writer must wait for readers");
    drop(r);

    let w = l.try_write();
    assert!(w.is_some());
    assert!(l.try_read().is_none());
    assert!(l.try_write().is_none());
    drop(w);

    assert!(l.try_read().is_some());
}

#[test]
fn with_helpers_unlock() {
    let l = RwLock::new(String::from("a"));
    let len = l.with_write(|s| {
        s.push('b');
        s.len()
    });
    assert_eq!(len, 2);
    assert_eq!(l.with_read(Clone::clone), "ab");
    assert!(l.try_write().is_some());
}

#[test]
fn get_mut_and_into_inner() {
    let mut l = RwLock::new(vec![1, 2, 3]);
    l.get_mut().push(4);
    assert_eq!(l.read().as_slice(), &[1, 2, 3, 4]);
    assert_eq!(l.into_inner(), vec![1, 2, 3, 4]);
}

#[test]
fn writers_are_exclusive_against_readers_and_writers() {
    let threads = 8;
    let iters = 2_000;

    let lock = Arc::new(RwLock::new(0usize));
    let writers_in = Arc::new(AtomicUsize::new(0));
    let readers_in = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let mut handles = Vec::with_capacity(threads);
    for t in 0..threads {
        let lock = Arc::clone(&lock);
        let writers_in = Arc::clone(&writers_in);
        let readers_in = Arc::clone(&readers_in);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            for i in 0..iters {
                if (t + i) % 4 == 0 {
                    lock.with_write(|v| {
                        let prev = writers_in.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(prev, 0, "two writers inside");
                        assert_eq!(readers_in.load(Ordering::SeqCst), 0, "reader inside");
                        *v += 1;
                        writers_in.fetch_sub(1, Ordering::SeqCst);
                    });
                } else {
                    lock.with_read(|_| {
                        readers_in.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(writers_in.load(Ordering::SeqCst), 0, "writer inside");
                        readers_in.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                thread::yield_now();
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    let expected = (0..threads)
        .map(|t| (0..iters).filter(|i| (t + i) % 4 == 0).count())
        .sum::<usize>();
    assert_eq!(lock.with_read(|v| *v), expected);
}

#[test]
fn writer_is_not_starved_by_readers() {
    let lock = Arc::new(RwLock::new(0u64));
    let stop = Arc::new(AtomicBool::new(false));

    let mut readers = Vec::new();
    for _ in 0..4 {
        let lock = Arc::clone(&lock);
        let stop = Arc::clone(&stop);
        readers.push(thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let g = lock.read();
                std::hint::black_box(*g);
                drop(g);
            }
        }));
    }

    for _ in 0..100 {
        lock.with_write(|v| *v += 1);
    }
    stop.store(true, Ordering::Relaxed);

    for h in readers {
        h.join().unwrap();
    }
    assert_eq!(lock.with_read(|v| *v), 100);
}

#[test]
fn write_lock_is_released_on_panic() {
    let l = RwLock::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_write(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");

    assert_eq!(l.with_read(|v| *v), 123);
    assert!(l.try_write().is_some());
}

#[test]
fn rwlock_is_sync_for_send_sync_t() {
    fn takes_sync<S: Sync>(_s: &S) {}
    let l = RwLock::new(0u8);
    takes_sync(&l);
}
