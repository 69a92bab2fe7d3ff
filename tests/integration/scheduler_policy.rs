//! Scheduler contract under the installed agent policy.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use vrouter_agent::scheduler::{
    class, install_agent_task_policy, Scheduler, SchedulerConfig, TaskKey,
};

fn scheduler(workers: usize) -> Scheduler {
    let sched = Scheduler::new(SchedulerConfig {
        workers,
        ..Default::default()
    });
    install_agent_task_policy(&sched);
    sched
}

/// Spawns `n` tasks of `a` and `n` of `b` and records any overlap.
fn race_classes(sched: &Scheduler, a: &str, b: &str, n: u64) -> u32 {
    let a_id = sched.class_id(a);
    let b_id = sched.class_id(b);
    let a_running = Arc::new(AtomicI32::new(0));
    let b_running = Arc::new(AtomicI32::new(0));
    let violations = Arc::new(AtomicU32::new(0));

    for i in 0..n {
        for (class, mine, theirs) in [
            (a_id, Arc::clone(&a_running), Arc::clone(&b_running)),
            (b_id, Arc::clone(&b_running), Arc::clone(&a_running)),
        ] {
            let violations = Arc::clone(&violations);
            sched
                .submit_once(TaskKey::new(class, i), move || {
                    mine.fetch_add(1, Ordering::SeqCst);
                    if theirs.load(Ordering::SeqCst) > 0 {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    std::hint::black_box(0u64);
                    mine.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap();
        }
    }
    sched.wait_idle();
    violations.load(Ordering::SeqCst)
}

#[test]
fn policy_table_exclusions_hold_under_load() {
    let sched = scheduler(4);
    // Spot-check pairs from every row of the policy table, including
    // one-sided declarations that must hold symmetrically.
    for (a, b) in [
        (class::DB_TABLE, class::FLOW_HANDLER),
        (class::DB_TABLE, class::KSYNC),
        (class::FLOW_HANDLER, class::STATS_COLLECTOR),
        (class::SANDESH_RECV, class::DB_TABLE),
        (class::BGP_CONFIG, class::XMPP_STATE_MACHINE),
        (class::XMPP_STATE_MACHINE, class::IO_READER),
        (class::KSYNC, class::STATS_COLLECTOR),
    ] {
        assert_eq!(race_classes(&sched, a, b, 40), 0, "{a} vs {b} overlapped");
    }
    sched.shutdown();
}

#[test]
fn non_excluded_classes_do_overlap() {
    let sched = scheduler(4);
    let services = sched.class_id(class::SERVICES);
    let uve = sched.class_id(class::UVE);
    let peak = Arc::new(AtomicI32::new(0));
    let running = Arc::new(AtomicI32::new(0));

    for i in 0..16 {
        for class in [services, uve] {
            let peak = Arc::clone(&peak);
            let running = Arc::clone(&running);
            sched
                .submit_once(TaskKey::new(class, i), move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap();
        }
    }
    sched.wait_idle();
    assert!(
        peak.load(Ordering::SeqCst) > 1,
        "independent classes should run concurrently"
    );
    sched.shutdown();
}

#[test]
fn instance_fifo_survives_panics_and_load() {
    let sched = scheduler(4);
    let class_id = sched.class_id(class::SERVICES);
    let order = Arc::new(Mutex::new(Vec::new()));
    let panics = Arc::new(AtomicUsize::new(0));

    for i in 0..300u32 {
        if i % 50 == 17 {
            let panics = Arc::clone(&panics);
            sched
                .submit_once(TaskKey::new(class_id, 9), move || {
                    panics.fetch_add(1, Ordering::SeqCst);
                    panic!("injected failure");
                })
                .unwrap();
        }
        let order = Arc::clone(&order);
        sched
            .submit_once(TaskKey::new(class_id, 9), move || {
                order.lock().unwrap().push(i);
            })
            .unwrap();
    }
    sched.wait_idle();

    let order = order.lock().unwrap();
    let expected: Vec<u32> = (0..300).collect();
    assert_eq!(*order, expected, "FIFO broken by panicking tasks");
    assert_eq!(panics.load(Ordering::SeqCst), 6);
    sched.shutdown();
}
