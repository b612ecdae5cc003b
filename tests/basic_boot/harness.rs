//! Custom test harness. There's no `std::test` here, so this is what
//! `kernel_test_bin` drives instead: a flat list of `TestEntry`s, run in
//! order, with the result reported back to the host over QEMU's isa-debug-exit
//! port.

use alloc::string::String;
use core::panic::PanicInfo;
use kernel::hlt_loop;

pub trait KernelTest {
    fn name(&self) -> &'static str;
    fn run(&self) -> TestResult;
}

impl<F> KernelTest for F
where
    F: Fn() -> TestResult,
{
    fn name(&self) -> &'static str {
        core::any::type_name::<F>()
    }

    fn run(&self) -> TestResult {
        self()
    }
}

#[derive(Debug)]
pub enum TestResult {
    Ok,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestGroup {
    Scheduler,
    Timer,
    Channel,
    Sync,
}

pub struct TestEntry {
    pub group: TestGroup,
    pub test: &'static dyn KernelTest,
}

pub fn tests() -> &'static [TestEntry] {
    &[
        // Scheduler — thread lifecycle, suspend/resume, the registry.
        TestEntry { group: TestGroup::Scheduler, test: &crate::scheduler_tests::test_new_thread_starts_waiting },
        TestEntry { group: TestGroup::Scheduler, test: &crate::scheduler_tests::test_registry_tracks_live_threads },
        TestEntry { group: TestGroup::Scheduler, test: &crate::scheduler_tests::test_suspend_resume_idle_thread },

        // Timers — heap bookkeeping that doesn't depend on ticks actually
        // firing.
        TestEntry { group: TestGroup::Timer, test: &crate::timer_tests::test_timer_heap_starts_empty },
        TestEntry { group: TestGroup::Timer, test: &crate::timer_tests::test_stop_before_fire_prevents_delivery },
        TestEntry { group: TestGroup::Timer, test: &crate::timer_tests::test_modify_reorders_next_deadline },

        // Waitable channels — non-blocking sends/waits, close semantics.
        TestEntry { group: TestGroup::Channel, test: &crate::channel_tests::test_buffered_send_then_wait },
        TestEntry { group: TestGroup::Channel, test: &crate::channel_tests::test_rendezvous_wait_without_sender_is_empty },
        TestEntry { group: TestGroup::Channel, test: &crate::channel_tests::test_close_wakes_pending_as_closed },
        TestEntry { group: TestGroup::Channel, test: &crate::channel_tests::test_select_prefers_ready_case },

        // Sync primitives — uncontended fast paths.
        TestEntry { group: TestGroup::Sync, test: &crate::sync_tests::test_word_lock_uncontended_round_trip },
        TestEntry { group: TestGroup::Sync, test: &crate::sync_tests::test_semaphore_permits_are_conserved },

        // Scheduler handoff — enables interrupts and never returns.
        // MUST remain last in the list.
        TestEntry { group: TestGroup::Scheduler, test: &crate::scheduler_tests::test_threads_run_and_stealing_spreads_them },
    ]
}

pub fn run_tests() -> ! {
    let all_tests = tests();
    log::info!("running {} kernel tests", all_tests.len());

    let mut failed = 0;
    for entry in all_tests {
        let result = entry.test.run();
        match result {
            TestResult::Ok => log::info!("{} [ok]", entry.test.name()),
            TestResult::Failed(msg) => {
                log::error!("{} [failed] - {}", entry.test.name(), msg);
                failed += 1;
            }
        }
    }

    if failed == 0 {
        log::info!("all tests passed!");
        exit_qemu(QemuExitCode::Success);
    } else {
        log::error!("{failed} test(s) failed");
        exit_qemu(QemuExitCode::Failed);
    }

    hlt_loop();
}

pub fn test_panic_handler(info: &PanicInfo) -> ! {
    log::error!("[failed]");
    log::error!("Error: {info}\n");
    exit_qemu(QemuExitCode::Failed);
    hlt_loop();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

pub fn exit_qemu(exit_code: QemuExitCode) {
    use x86_64::instructions::port::Port;

    unsafe {
        let mut port = Port::new(0xf4);
        port.write(exit_code as u32);
    }
}
