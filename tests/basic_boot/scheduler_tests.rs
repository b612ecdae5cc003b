//! Thread lifecycle, suspend/resume, the live-thread registry, and — as
//! the harness's terminal test — an actual multi-thread run through the
//! scheduler.

use crate::harness::TestResult;
use alloc::format;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use kernel::limine_requests::MP_REQUEST;
use kernel::memory::cpu_local_data::get_local;
use kernel::sched::scheduler;
use kernel::sched::thread::{Thread, ThreadStatus};
use kernel::time::tsc;
use kernel::{apic, gdt, interrupt, memory, time};

fn probe_entry(_: usize) -> ! {
    loop {
        core::hint::spin_loop();
    }
}

pub fn test_new_thread_starts_waiting() -> TestResult {
    let thread = Thread::new("probe", probe_entry, 0);
    let status = thread.status.load(Ordering::Acquire);
    if status == ThreadStatus::Waiting {
        TestResult::Ok
    } else {
        TestResult::Failed(format!("freshly created thread should start Waiting, got {status:?}"))
    }
}

pub fn test_registry_tracks_live_threads() -> TestResult {
    let thread = Thread::new("registry-probe", probe_entry, 0);
    let id = thread.id;

    let present = kernel::sched::registry::lock_all_threads().iter().any(|t| t.id == id);
    if !present {
        return TestResult::Failed(format!("thread {id:?} missing from registry right after creation"));
    }

    drop(thread);

    let still_present = kernel::sched::registry::lock_all_threads().iter().any(|t| t.id == id);
    if still_present {
        return TestResult::Failed(format!("thread {id:?} with no Arc left still resolves through the registry"));
    }

    TestResult::Ok
}

pub fn test_suspend_resume_idle_thread() -> TestResult {
    let thread = Thread::new("suspend-probe", probe_entry, 0);

    if !scheduler::suspend(&thread) {
        return TestResult::Failed("suspend() on a live thread should report it parked".into());
    }

    let status = thread.status.load(Ordering::Acquire);
    if status != ThreadStatus::Waiting {
        return TestResult::Failed(format!(
            "a thread never dispatched anywhere shouldn't have its status touched by suspend(), got {status:?}"
        ));
    }

    scheduler::resume(&thread);
    TestResult::Ok
}

const WORKER_COUNT: u32 = 4;
static DONE_COUNT: AtomicU32 = AtomicU32::new(0);
static SEEN_CPUS: AtomicU64 = AtomicU64::new(0);

fn spread_worker(_arg: usize) -> ! {
    let cpu = get_local();
    SEEN_CPUS.fetch_or(1 << cpu.kernel_id, Ordering::AcqRel);
    DONE_COUNT.fetch_add(1, Ordering::AcqRel);
    scheduler::drop_current()
}

fn spread_checker(_arg: usize) -> ! {
    let start = tsc::value();
    // TSC_HZ may be miscalibrated on whatever's running this, so the timeout
    // is generous rather than tied to a real wall-clock second.
    let timeout = tsc::TSC_HZ.load(Ordering::SeqCst).saturating_mul(1000).max(1);

    while DONE_COUNT.load(Ordering::Acquire) < WORKER_COUNT {
        if tsc::value().wrapping_sub(start) > timeout {
            log::error!(
                "test_threads_run_and_stealing_spreads_them [failed] - only {}/{WORKER_COUNT} workers completed",
                DONE_COUNT.load(Ordering::Acquire)
            );
            crate::harness::exit_qemu(crate::harness::QemuExitCode::Failed);
        }
        core::hint::spin_loop();
    }

    log::info!(
        "test_threads_run_and_stealing_spreads_them [ok] - ran on cpu mask {:#x}",
        SEEN_CPUS.load(Ordering::Acquire)
    );
    crate::harness::exit_qemu(crate::harness::QemuExitCode::Success);
    loop {
        core::hint::spin_loop();
    }
}

/// AP entry point for the handoff test, mirroring the real boot path: each
/// AP that comes up joins the same scheduler the BSP just handed off to.
unsafe extern "C" fn test_ap_entry(cpu: &limine::mp::Cpu) -> ! {
    unsafe { memory::cpu_local_data::init_ap(cpu) };

    gdt::init();
    interrupt::idt::init();
    apic::init_local_apic();
    time::lapic_timer::init();

    x86_64::instructions::interrupts::enable();
    memory::cpu_local_data::mark_current_cpu_ready();

    scheduler::startup()
}

/// Spawns worker threads, brings up any APs still parked by Limine, and
/// hands this CPU off to the scheduler. Never returns — `spread_checker`
/// reports pass/fail and exits QEMU itself once every worker has run.
pub fn test_threads_run_and_stealing_spreads_them() -> TestResult {
    DONE_COUNT.store(0, Ordering::SeqCst);
    SEEN_CPUS.store(0, Ordering::SeqCst);

    for n in 0..WORKER_COUNT as usize {
        scheduler::spawn("spread-worker", spread_worker, n);
    }
    scheduler::spawn("spread-checker", spread_checker, 0);

    if let Some(mp_response) = MP_REQUEST.get_response() {
        for cpu in mp_response.cpus() {
            if cpu.lapic_id != mp_response.bsp_lapic_id() {
                cpu.goto_address.write(test_ap_entry);
            }
        }
    }

    x86_64::instructions::interrupts::enable();
    memory::cpu_local_data::mark_current_cpu_ready();

    scheduler::startup()
}
