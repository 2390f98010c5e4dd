use kernel_sync::SyncOnceCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn get_before_init_is_none() {
    let cell: SyncOnceCell<u32> = SyncOnceCell::new();
    assert!(cell.get().is_none());
}

#[test]
fn get_or_init_returns_the_stored_value() {
    let cell = SyncOnceCell::new();
    assert_eq!(*cell.get_or_init(|| 7u32), 7);
    assert_eq!(cell.get(), Some(&7));
}

#[test]
fn second_initializer_never_runs() {
    let cell = SyncOnceCell::new();
    assert_eq!(*cell.get_or_init(|| 1u32), 1);
    // the closure must not run again once a value is published
    assert_eq!(*cell.get_or_init(|| panic!("already initialized")), 1);
}

#[test]
fn racing_initializers_agree_and_run_once() {
    let threads = 8;
    let cell = Arc::new(SyncOnceCell::new());
    let runs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let mut handles = Vec::with_capacity(threads);
    for i in 0..threads {
        let cell = Arc::clone(&cell);
        let runs = Arc::clone(&runs);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            *cell.get_or_init(|| {
                runs.fetch_add(1, Ordering::SeqCst);
                i
            })
        }));
    }

    let values: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // exactly one closure ran and every thread saw its value
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    let first = values[0];
    assert!(values.iter().all(|&v| v == first));
    assert_eq!(cell.get(), Some(&first));
}
