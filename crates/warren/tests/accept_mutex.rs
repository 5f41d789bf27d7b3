use warren::{AcceptBackend, AcceptMutex};

fn acquire_with_retry(m: &mut AcceptMutex, pid: i32) -> bool {
    // The atomic backing uses a weak CAS, which may fail spuriously.
    (0..100).any(|_| m.try_acquire(pid))
}

#[test]
fn shared_atomic_has_one_holder() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("accept.shm");

    let mut master = AcceptMutex::create(AcceptBackend::SharedAtomic, &path).unwrap();
    let mut w1 = AcceptMutex::open(AcceptBackend::SharedAtomic, &path).unwrap();
    let mut w2 = AcceptMutex::open(AcceptBackend::SharedAtomic, &path).unwrap();

    assert_eq!(master.holder(), None);
    assert!(acquire_with_retry(&mut w1, 100));
    assert_eq!(master.holder(), Some(100));

    // Held: the competitor must lose every round.
    assert!(!acquire_with_retry(&mut w2, 200));

    while !w1.release(100) {}
    assert_eq!(master.holder(), None);
    assert!(acquire_with_retry(&mut w2, 200));
    assert_eq!(master.holder(), Some(200));

    // Master-side recovery after the holder dies without releasing.
    master.force_release(200);
    assert_eq!(master.holder(), None);
    master.destroy(&path);
}

#[test]
fn advisory_lock_has_one_holder() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("accept.lock");

    let mut master = AcceptMutex::create(AcceptBackend::AdvisoryLock, &path).unwrap();
    let mut w1 = AcceptMutex::open(AcceptBackend::AdvisoryLock, &path).unwrap();
    let mut w2 = AcceptMutex::open(AcceptBackend::AdvisoryLock, &path).unwrap();

    assert!(w1.try_acquire(100));
    assert!(!w2.try_acquire(200));

    assert!(w1.release(100));
    assert!(w2.try_acquire(200));
    assert!(w2.release(200));

    drop(w1);
    drop(w2);
    master.force_release(0);
    master.destroy(&path);
}
