//! End-to-end admission scenarios and allocator properties.

use std::collections::BTreeSet;

use sandgrid_core::{ResourceLimits, Task};
use sandgrid_placement::allocate;

fn task(json: &str) -> Task {
    Task::from_json_str(json).unwrap()
}

fn caps(json: &str) -> ResourceLimits {
    ResourceLimits::from_json_str(json).unwrap()
}

fn tags(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|t| t.to_string()).collect()
}

#[test]
fn scenario_a_cpus_exhaust_after_two() {
    let tasks: Vec<Task> = (0..3)
        .map(|_| task(r#"{"limits": {"cpus": 2, "memory": "1g"}}"#))
        .collect();
    let alloc = allocate(&tasks, &caps(r#"{"cpus": 4, "memory": "4g"}"#), &tags(&[]), 10);
    assert_eq!(alloc.indices(), vec![0, 1]);
    assert_eq!(alloc.admitted[0].cpus_offset, 0);
    assert_eq!(alloc.admitted[1].cpus_offset, 2);
    assert_eq!(alloc.remaining.cpus, Some(0));
    assert_eq!(alloc.remaining.memory, Some(2 * 1024 * 1024 * 1024));
}

#[test]
fn scenario_b_exclusive_stops_nonempty_round() {
    let tasks = vec![
        task(r#"{"limits": {"cpus": 1}}"#),
        task(r#"{"limits": {"cpus": 1}, "exclusive": true}"#),
        task(r#"{"limits": {"cpus": 1}}"#),
    ];
    let alloc = allocate(&tasks, &caps(r#"{"cpus": 4}"#), &tags(&[]), 10);
    assert_eq!(alloc.indices(), vec![0]);
}

#[test]
fn scenario_c_exclusive_first_runs_alone() {
    let tasks = vec![
        task(r#"{"limits": {"cpus": 1}, "exclusive": true}"#),
        task(r#"{"limits": {"cpus": 1}}"#),
    ];
    let alloc = allocate(&tasks, &caps(r#"{"cpus": 4}"#), &tags(&[]), 10);
    assert_eq!(alloc.indices(), vec![0]);
    assert_eq!(alloc.remaining.cpus, Some(3));
}

#[test]
fn scenario_d_shared_image_costs_once() {
    let tasks: Vec<Task> = (0..2)
        .map(|_| task(r#"{"image": "img:latest", "limits": {"image": "500m"}}"#))
        .collect();
    let alloc = allocate(&tasks, &caps(r#"{"image": "700m"}"#), &tags(&[]), 10);
    assert_eq!(alloc.indices(), vec![0, 1]);
    assert_eq!(alloc.remaining.image, Some(200 * 1024 * 1024));
}

#[test]
fn distinct_images_each_cost_their_size() {
    let tasks = vec![
        task(r#"{"image": "a", "limits": {"image": "500m"}}"#),
        task(r#"{"image": "b", "limits": {"image": "500m"}}"#),
        task(r#"{"image": "a", "limits": {"image": "600m"}}"#),
    ];
    let alloc = allocate(&tasks, &caps(r#"{"image": "700m"}"#), &tags(&[]), 10);
    // "b" does not fit; the larger "a" only costs the extra 100m.
    assert_eq!(alloc.indices(), vec![0, 2]);
    assert_eq!(alloc.remaining.image, Some(100 * 1024 * 1024));
}

#[test]
fn tag_mismatch_skips_without_blocking() {
    let tasks = vec![
        task(r#"{"requires": ["gpu"], "limits": {"cpus": 1}}"#),
        task(r#"{"requires": ["fast"], "limits": {"cpus": 1}}"#),
    ];
    let alloc = allocate(&tasks, &caps(r#"{"cpus": 4}"#), &tags(&["fast"]), 10);
    assert_eq!(alloc.indices(), vec![1]);
}

#[test]
fn large_task_does_not_block_later_small_one() {
    let tasks = vec![
        task(r#"{"limits": {"cpus": 8}}"#),
        task(r#"{"limits": {"cpus": 2}}"#),
    ];
    let alloc = allocate(&tasks, &caps(r#"{"cpus": 4}"#), &tags(&[]), 10);
    assert_eq!(alloc.indices(), vec![1]);
    assert_eq!(alloc.admitted[0].cpus_offset, 0);
}

// ── Properties over generated pools ────────────────────────────────

/// Small deterministic generator so the pools are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) % bound
    }
}

fn generated_pool(rng: &mut Lcg) -> Vec<Task> {
    let n = 1 + rng.next(8) as usize;
    (0..n)
        .map(|_| {
            let mut t = Task::default();
            t.limits.cpus = Some(1 + rng.next(4) as u32);
            t.limits.memory = Some((1 + rng.next(4)) << 30);
            t.limits.pids = Some(10 + rng.next(100));
            t.exclusive = rng.next(6) == 0;
            t
        })
        .collect()
}

#[test]
fn admitted_batches_respect_capacity_exclusivity_and_offsets() {
    let mut rng = Lcg(7);
    for _ in 0..500 {
        let pool = generated_pool(&mut rng);
        let capacity = ResourceLimits {
            cpus: Some(1 + rng.next(8) as u32),
            memory: Some((1 + rng.next(8)) << 30),
            pids: Some(50 + rng.next(200)),
            ..Default::default()
        };
        let concurrency = 1 + rng.next(6) as usize;
        let alloc = allocate(&pool, &capacity, &BTreeSet::new(), concurrency);
        let admitted: Vec<&Task> = alloc.admitted.iter().map(|a| &pool[a.index]).collect();

        assert!(admitted.len() <= concurrency);

        let cpus: u32 = admitted.iter().map(|t| t.limits.cpus.unwrap()).sum();
        let memory: u64 = admitted.iter().map(|t| t.limits.memory.unwrap()).sum();
        let pids: u64 = admitted.iter().map(|t| t.limits.pids.unwrap()).sum();
        assert!(cpus <= capacity.cpus.unwrap());
        assert!(memory <= capacity.memory.unwrap());
        assert!(pids <= capacity.pids.unwrap());

        let exclusive = admitted.iter().filter(|t| t.exclusive).count();
        assert!(exclusive == 0 || admitted.len() == 1);

        let mut ranges: Vec<(u32, u32)> = alloc
            .admitted
            .iter()
            .map(|a| (a.cpus_offset, a.cpus_offset + pool[a.index].limits.cpus.unwrap()))
            .collect();
        ranges.sort();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "overlapping cpu ranges {ranges:?}");
        }

        let indices = alloc.indices();
        assert!(indices.windows(2).all(|w| w[0] < w[1]), "admission order preserved");
    }
}
