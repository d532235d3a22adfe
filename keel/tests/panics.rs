use keel::{
    Kernel,
    config::SystemConfigurationBuilder,
    sync::Semaphore,
    thread::{self, ThreadBuilder, with_current},
};
use std::sync::Arc;

fn boot() -> Arc<Kernel> {
    Kernel::boot(SystemConfigurationBuilder::new().quiet(true).build()).unwrap()
}

#[test]
#[should_panic(expected = "Stack overflow detected")]
fn clobbered_magic_is_detected() {
    let kernel = boot();
    let _ = kernel.run(|| {
        let page = with_current(|th| th.page());
        kernel.machine().memory.write(page, &[0; 4]);
        thread::get_priority()
    });
}

#[test]
#[should_panic(expected = "every thread is blocked")]
fn deadlock_is_a_kernel_panic() {
    let kernel = boot();
    let _ = kernel.run(|| {
        let never = Semaphore::new(0, ());
        never.down();
    });
}

#[test]
#[should_panic(expected = "Kernel panic: boom")]
fn panic_on_another_thread_halts_the_machine() {
    let kernel = boot();
    let _ = kernel.run(|| {
        ThreadBuilder::new("faulty")
            .spawn(|| panic!("boom"))
            .unwrap()
            .join();
    });
}
