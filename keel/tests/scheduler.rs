use keel::{
    Kernel, KernelError,
    config::SystemConfigurationBuilder,
    spinlock::SpinLock,
    thread::{self, Current, PRI_DEFAULT, ThreadBuilder, ThreadState},
    timer,
};
use std::sync::Arc;

fn boot() -> Arc<Kernel> {
    Kernel::boot(SystemConfigurationBuilder::new().quiet(true).build()).unwrap()
}

type Log = Arc<SpinLock<Vec<&'static str>>>;

fn record(log: &Log, what: &'static str) {
    let mut guard = log.lock();
    guard.push(what);
    guard.unlock();
}

fn take(log: &Log) -> Vec<&'static str> {
    let mut guard = log.lock();
    let v = std::mem::take(&mut *guard);
    guard.unlock();
    v
}

#[test]
fn higher_priority_thread_runs_at_creation() {
    let kernel = boot();
    kernel
        .run(|| {
            let log: Log = Arc::default();
            let l = log.clone();
            let handle = ThreadBuilder::new("high")
                .priority(PRI_DEFAULT + 1)
                .spawn(move || record(&l, "high"))
                .unwrap();
            record(&log, "main");
            handle.join();
            assert_eq!(take(&log), ["high", "main"]);
        })
        .unwrap();
}

#[test]
fn lower_priority_thread_waits_for_main() {
    let kernel = boot();
    kernel
        .run(|| {
            let log: Log = Arc::default();
            let l = log.clone();
            let handle = ThreadBuilder::new("low")
                .priority(PRI_DEFAULT - 1)
                .spawn(move || record(&l, "low"))
                .unwrap();
            assert_eq!(thread::get_state_by_tid(handle.tid), Ok(ThreadState::Ready));
            record(&log, "main");
            handle.join();
            assert_eq!(take(&log), ["main", "low"]);
        })
        .unwrap();
}

#[test]
fn lowering_priority_yields() {
    let kernel = boot();
    kernel
        .run(|| {
            let log: Log = Arc::default();
            let l = log.clone();
            let handle = ThreadBuilder::new("low")
                .priority(PRI_DEFAULT - 1)
                .spawn(move || record(&l, "low"))
                .unwrap();
            thread::set_priority(PRI_DEFAULT - 2);
            record(&log, "main");
            assert_eq!(thread::get_priority(), PRI_DEFAULT - 2);
            handle.join();
            assert_eq!(take(&log), ["low", "main"]);
        })
        .unwrap();
}

#[test]
fn time_slice_round_robin() {
    let kernel = boot();
    kernel
        .run(|| {
            let log: Log = Arc::default();
            let mut handles = Vec::new();
            for name in ["a", "b"] {
                let l = log.clone();
                handles.push(
                    ThreadBuilder::new(name)
                        .spawn(move || {
                            for _ in 0..3 {
                                record(&l, name);
                                timer::spin(4);
                            }
                        })
                        .unwrap(),
                );
            }
            for handle in handles {
                handle.join();
            }
            // Unblocked threads enter the ready queue at the front.
            assert_eq!(take(&log), ["b", "a", "b", "a", "b", "a"]);
        })
        .unwrap();
}

#[test]
fn yield_with_no_other_thread_returns() {
    let kernel = boot();
    kernel
        .run(|| {
            let me = Current::get_tid();
            Current::yield_now();
            assert_eq!(Current::get_tid(), me);
            assert_eq!(thread::get_state_by_tid(me), Ok(ThreadState::Running));
        })
        .unwrap();
}

#[test]
fn exited_thread_is_reaped() {
    let kernel = boot();
    kernel
        .run(|| {
            let free = kernel.machine().memory.free_kernel_frames();
            let handle = ThreadBuilder::new("short-lived").spawn(|| {}).unwrap();
            let tid = handle.tid;
            handle.join();
            assert_eq!(
                thread::get_state_by_tid(tid),
                Err(KernelError::InvalidArgument)
            );
            assert_eq!(kernel.machine().memory.free_kernel_frames(), free);
        })
        .unwrap();
}

#[test]
fn spawn_fails_without_kernel_pages() {
    let kernel = Kernel::boot(
        SystemConfigurationBuilder::new()
            .quiet(true)
            .kernel_frames(2)
            .build(),
    )
    .unwrap();
    kernel
        .run(|| {
            // The boot and idle threads own the two pages.
            assert_eq!(
                ThreadBuilder::new("extra").spawn(|| {}).err(),
                Some(KernelError::NoMemory)
            );
        })
        .unwrap();
}

#[test]
fn ticks_are_accounted_to_the_kernel() {
    let kernel = boot();
    kernel
        .run(|| {
            let before = thread::stats();
            timer::spin(10);
            let after = thread::stats();
            assert_eq!(after.kernel_ticks - before.kernel_ticks, 10);
            assert_eq!(after.user_ticks, 0);
            thread::print_stats();
        })
        .unwrap();
    assert!(kernel.machine().console.output().contains("10 kernel ticks"));
}

#[test]
fn power_off_halts_the_kernel() {
    let kernel = boot();
    let result = kernel.run(|| {
        ThreadBuilder::new("killer")
            .priority(PRI_DEFAULT + 1)
            .spawn(|| keel::kernel().power_off())
            .unwrap();
        thread::get_priority()
    });
    assert_eq!(result, Err(keel::Halted::PowerOff));
}
