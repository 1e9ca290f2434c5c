use std::collections::HashSet;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use nbassoc::{AssocIndex, Config, Item};

/// Tracks every record the reclaim callback destroys and panics on a repeat,
/// so a double reclamation cannot go unnoticed.
struct FreeTracker {
    freed: Mutex<HashSet<Vec<u8>>>,
    count: AtomicUsize,
}

impl FreeTracker {
    fn new() -> Arc<Self> {
        Arc::new(Self { freed: Mutex::new(HashSet::new()), count: AtomicUsize::new(0) })
    }

    fn count(&self) -> usize {
        self.count.load(Relaxed)
    }
}

fn tracked_index(config: Config, tracker: &Arc<FreeTracker>) -> Arc<AssocIndex> {
    let tracker = Arc::clone(tracker);
    AssocIndex::new(
        config,
        Box::new(move |item| {
            let boxed = unsafe { Box::from_raw(item.as_ptr()) };
            let fresh = tracker.freed.lock().unwrap().insert(boxed.value().to_vec());
            assert!(fresh, "record {:?} reclaimed twice", boxed.value());
            tracker.count.fetch_add(1, Relaxed);
        }),
    )
}

#[test]
fn concurrent_insert_delete_converges() {
    const THREADS: usize = 8;
    const OPS: usize = 10_000;
    const KEYS: usize = 100;

    let tracker = FreeTracker::new();
    let config = Config::builder().hashpower(4).num_threads(THREADS).build();
    let index = tracked_index(config, &tracker);

    let keys: Vec<Vec<u8>> = (0..KEYS).map(|k| format!("key{:03}", k).into_bytes()).collect();

    let mut tallies = Vec::with_capacity(THREADS);
    let mut locals = Vec::with_capacity(THREADS);

    crossbeam_utils::thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|id| {
                let index = Arc::clone(&index);
                let keys = &keys;
                scope.spawn(move |_| {
                    let mut rng = StdRng::seed_from_u64(0xfee1 + id as u64);
                    let mut local = index.local(id);
                    let mut inserts = vec![0u64; KEYS];
                    let mut deletes = vec![0u64; KEYS];
                    let mut seq = 0u64;

                    for _ in 0..OPS {
                        let k = rng.gen_range(0..KEYS);
                        let hv = index.hash(&keys[k]);
                        local.announce();

                        if rng.gen_bool(0.5) {
                            // record identities must be unique for the free
                            // tracker to spot a double reclamation
                            let value = format!("{}-{}", id, seq).into_bytes();
                            seq += 1;
                            if local.insert(Item::new(&keys[k], &value), hv).is_ok() {
                                inserts[k] += 1;
                            }
                        } else if local.delete(&keys[k], hv) {
                            deletes[k] += 1;
                        }

                        local.enter_quiescent();
                    }

                    // the handle must outlive every other worker: dropping it
                    // reclaims this thread's retirements immediately
                    (inserts, deletes, local)
                })
            })
            .collect();

        for handle in handles {
            let (inserts, deletes, local) = handle.join().unwrap();
            tallies.push((inserts, deletes));
            locals.push(local);
        }
    })
    .unwrap();

    // all workers have quiesced; their pending retirements may drain now
    drop(locals);

    let mut live = 0u64;
    let mut verifier = index.local(0);
    verifier.announce();

    for (k, key) in keys.iter().enumerate() {
        let ins: u64 = tallies.iter().map(|(ins, _)| ins[k]).sum();
        let del: u64 = tallies.iter().map(|(_, del)| del[k]).sum();
        let net = ins as i64 - del as i64;
        assert!(net == 0 || net == 1, "key {:?} has impossible net count {}", key, net);

        let found = verifier.find(key, index.hash(key)).is_some();
        assert_eq!(found, net == 1, "key {:?} live state diverges from its net count", key);
        live += net as u64;
    }

    assert_eq!(index.current_item_count(), live);

    verifier.enter_quiescent();
    drop(verifier);
    drop(index);

    // every successfully inserted record is reclaimed exactly once: deleted
    // ones through retirement, survivors at teardown
    let gross_inserts: u64 = tallies.iter().flat_map(|(ins, _)| ins.iter()).sum();
    assert_eq!(tracker.count() as u64, gross_inserts);
}

#[test]
fn expansion_keeps_every_key_reachable() {
    const SEEDS: usize = 2;
    const KEYS: usize = 32;

    let tracker = FreeTracker::new();
    let config = Config::builder()
        .hashpower(2)
        .max_hashpower(3)
        .num_threads(2)
        .maintenance_sleep(Duration::from_millis(1))
        .build();
    let index = tracked_index(config, &tracker);
    let maintenance = index.start_maintenance().unwrap();

    let keys: Vec<Vec<u8>> = (0..SEEDS)
        .map(|k| format!("seed{}", k).into_bytes())
        .chain((0..KEYS).map(|k| format!("k{}", k).into_bytes()))
        .collect();

    let published = AtomicUsize::new(0);
    let done = AtomicBool::new(false);
    let mut locals = Vec::new();

    thread::scope(|scope| {
        let writer = {
            let index = Arc::clone(&index);
            let keys = &keys;
            let published = &published;
            let done = &done;
            scope.spawn(move || {
                let mut local = index.local(0);
                for (n, key) in keys.iter().enumerate() {
                    local.announce();
                    let value = format!("v{}", n).into_bytes();
                    local
                        .insert(Item::new(key, &value), index.hash(key))
                        .unwrap_or_else(|_| panic!("unexpected duplicate for {:?}", key));
                    local.enter_quiescent();
                    published.store(n + 1, Release);
                }
                done.store(true, Release);
                local
            })
        };

        let reader = {
            let index = Arc::clone(&index);
            let keys = &keys;
            let published = &published;
            let done = &done;
            scope.spawn(move || {
                let mut rng = StdRng::seed_from_u64(0xbeef);
                let mut local = index.local(1);
                let deadline = Instant::now() + Duration::from_secs(60);

                loop {
                    let ready = published.load(Acquire);
                    if ready > 0 {
                        let key = &keys[rng.gen_range(0..ready)];
                        let hv = index.hash(key);

                        // a record is invisible for the instant between its
                        // unlink from the old bucket and its re-insert into
                        // the new one, so a miss is retried
                        let mut attempts = 0;
                        loop {
                            local.announce();
                            let found = local.find(key, hv).is_some();
                            local.enter_quiescent();
                            if found {
                                break;
                            }
                            attempts += 1;
                            assert!(
                                attempts < 10_000,
                                "inserted key {:?} stayed unreachable",
                                key
                            );
                        }
                    } else {
                        local.announce();
                        local.enter_quiescent();
                    }

                    let stats = index.stats();
                    if done.load(Acquire) && stats.hash_power_level == 3 && !stats.expanding {
                        break;
                    }
                    assert!(Instant::now() < deadline, "expansion did not complete");
                }
                local
            })
        };

        locals.push(writer.join().unwrap());
        locals.push(reader.join().unwrap());
    });

    drop(locals);

    assert_eq!(index.hashpower(), 3);
    assert_eq!(index.current_item_count(), (SEEDS + KEYS) as u64);

    let mut verifier = index.local(0);
    verifier.announce();
    for key in &keys {
        assert!(
            verifier.find(key, index.hash(key)).is_some(),
            "key {:?} lost across the expansion",
            key
        );
    }
    verifier.enter_quiescent();
    drop(verifier);

    index.stop_maintenance();
    maintenance.join().unwrap();
    drop(index);

    assert_eq!(tracker.count(), SEEDS + KEYS);
}

#[test]
fn replace_under_contention_never_hides_the_key() {
    const FINDS: usize = 100_000;

    let tracker = FreeTracker::new();
    let config = Config::builder().hashpower(2).num_threads(2).build();
    let index = tracked_index(config, &tracker);

    let key = b"swap";
    let hv = index.hash(key);
    let mut setup = index.local(0);
    setup.announce();
    setup.insert(Item::new(key, b"old"), hv).unwrap();
    setup.enter_quiescent();
    drop(setup);

    let mut locals = Vec::new();
    thread::scope(|scope| {
        let replacer = {
            let index = Arc::clone(&index);
            scope.spawn(move || {
                let mut local = index.local(0);
                local.announce();
                let old = local.find(key, hv).expect("the record was just inserted");
                let swapped = local.replace(unsafe { old.as_ref() }, Item::new(key, b"new"), hv);
                assert!(swapped);
                local.enter_quiescent();
                local
            })
        };

        let finder = {
            let index = Arc::clone(&index);
            scope.spawn(move || {
                let mut local = index.local(1);
                for _ in 0..FINDS {
                    local.announce();
                    let found = local.find(key, hv).expect("the key must never disappear");
                    let value = unsafe { found.as_ref().value() };
                    assert!(value == b"old" || value == b"new");
                    local.enter_quiescent();
                }
                local
            })
        };

        locals.push(replacer.join().unwrap());
        locals.push(finder.join().unwrap());
    });

    drop(locals);

    let mut local = index.local(0);
    local.announce();
    let found = local.find(key, hv).expect("the key survives the replace");
    assert_eq!(unsafe { found.as_ref().value() }, b"new");
    local.enter_quiescent();
    drop(local);
    drop(index);

    // the superseded record and, at teardown, its replacement
    assert_eq!(tracker.count(), 2);
}

#[test]
fn repeated_eviction_empties_buckets() {
    let tracker = FreeTracker::new();
    let config = Config::builder().hashpower(2).num_threads(1).build();
    let index = tracked_index(config, &tracker);

    let mut local = index.local(0);
    local.announce();
    for (hv, key) in [&b"a"[..], b"b", b"c", b"d"].iter().enumerate() {
        local.insert(Item::new(key, b"v"), hv as u32).unwrap();
    }

    let mut evicted = 0u64;
    for _ in 0..256 {
        evicted += local.try_evict(1, 0, 0);
        if evicted >= 4 {
            break;
        }
    }
    assert_eq!(evicted, 4, "every bucket decays to zero within a full sweep cycle");
    assert_eq!(index.current_item_count(), 0);

    local.enter_quiescent();
    drop(local);
    drop(index);
    assert_eq!(tracker.count(), 4);
}
