//! Scheduler dispatch benchmark
//!
//! Measures one full schedule/dispatch/account iteration against trees of
//! increasing depth, with every leaf backlogged.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use flowgate_common::{ManualClock, Resource, ResourceArr, Task};
use flowgate_sched::{Scheduler, TcTree};

struct UnitTask;

impl Task for UnitTask {
    fn run(&mut self) -> ResourceArr {
        [1, 0, 1, 512]
    }
}

fn flat_round_robin(leaves: usize) -> Scheduler<ManualClock> {
    let mut tree = TcTree::new();
    let root = tree.new_round_robin("root").unwrap();
    for i in 0..leaves {
        let leaf = tree.new_leaf(&format!("leaf-{}", i)).unwrap();
        tree.add_round_robin_child(root, leaf, 0).unwrap();
        tree.add_task(leaf, Box::new(UnitTask), 0).unwrap();
    }
    Scheduler::new(tree, root, ManualClock::new())
}

fn layered_tree() -> Scheduler<ManualClock> {
    let mut tree = TcTree::new();
    let root = tree.new_priority("root").unwrap();
    for (p, name) in [(10, "fast"), (1, "slow")] {
        let wfq = tree.new_weighted_fair(name, Resource::Packets).unwrap();
        tree.add_priority_child(root, wfq, p, 0).unwrap();
        for i in 0..4u32 {
            let leaf = tree.new_leaf(&format!("{}-{}", name, i)).unwrap();
            tree.add_weighted_fair_child(wfq, leaf, i + 1, 0).unwrap();
            tree.add_task(leaf, Box::new(UnitTask), 0).unwrap();
        }
    }
    Scheduler::new(tree, root, ManualClock::new())
}

fn dispatch_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("schedule_once");

    for leaves in [1usize, 8, 64] {
        let mut sched = flat_round_robin(leaves);
        group.bench_with_input(BenchmarkId::new("round_robin", leaves), &leaves, |b, _| {
            b.iter(|| {
                sched.schedule_once();
                black_box(sched.stats().cnt_dispatched)
            })
        });
    }

    let mut sched = layered_tree();
    group.bench_function("priority_over_weighted_fair", |b| {
        b.iter(|| {
            sched.schedule_once();
            black_box(sched.stats().cnt_dispatched)
        })
    });

    group.finish();
}

criterion_group!(benches, dispatch_benchmark);
criterion_main!(benches);
