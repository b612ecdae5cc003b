#![no_std]
#![no_main]

extern crate alloc;
extern crate novarun as kernel;

use core::sync::atomic::{AtomicBool, Ordering};
use kernel::limine_requests::{BASE_REVISION, MP_REQUEST, RSDP_REQUEST};
use kernel::memory::cpu_local_data::get_local;
use kernel::sched::scheduler;
use kernel::{acpi, apic, gdt, hlt_loop, interrupt, ioapic, logger, memory, project_version, time};

#[unsafe(no_mangle)]
unsafe extern "C" fn kernel_main() -> ! {
    assert!(BASE_REVISION.is_supported());

    logger::init().unwrap();
    log::info!("novarun {}", project_version());

    unsafe { memory::global_allocator::init() };
    unsafe { memory::cpu_local_data::init_bsp() };
    log::info!("BSP cpu-local data initialized");

    interrupt::nmi_handler_state::init();
    gdt::init();
    interrupt::idt::init();

    let rsdp = RSDP_REQUEST.get_response().unwrap();
    let acpi_tables = acpi::parse(rsdp);
    apic::init_bsp(&acpi_tables);
    apic::init_local_apic();
    ioapic::init(&acpi_tables);

    time::tsc::calibrate();
    time::lapic_timer::init();

    spawn_demo_threads();

    let mp_response = MP_REQUEST.get_response().unwrap();
    for cpu in mp_response.cpus() {
        if cpu.lapic_id != mp_response.bsp_lapic_id() {
            cpu.goto_address.write(ap_entry);
        }
    }

    log::info!("BSP: enabling interrupts");
    x86_64::instructions::interrupts::enable();
    memory::cpu_local_data::mark_current_cpu_ready();

    scheduler::startup()
}

/// AP entry point, invoked by Limine directly on the new CPU's own stack.
unsafe extern "C" fn ap_entry(cpu: &limine::mp::Cpu) -> ! {
    log::info!("AP entry (lapic_id={})", cpu.lapic_id);
    unsafe { memory::cpu_local_data::init_ap(cpu) };

    gdt::init();
    interrupt::idt::init();
    apic::init_local_apic();
    time::lapic_timer::init();

    x86_64::instructions::interrupts::enable();
    memory::cpu_local_data::mark_current_cpu_ready();
    log::info!("AP {}: ready", get_local().kernel_id);

    scheduler::startup()
}

/// Spawns a handful of demo threads on the BSP's run queue to exercise the
/// scheduler (work stealing picks most of them up once APs come online).
fn spawn_demo_threads() {
    for n in 0..4 {
        scheduler::spawn("demo-worker", demo_worker, n);
    }
}

fn demo_worker(n: usize) -> ! {
    loop {
        log::trace!("demo-worker {n} tick");
        scheduler::yield_now();
    }
}

static DID_PANIC: AtomicBool = AtomicBool::new(false);

#[panic_handler]
fn rust_panic(info: &core::panic::PanicInfo) -> ! {
    memory::cpu_local_data::mark_current_cpu_crashed();
    if !DID_PANIC.swap(true, Ordering::Relaxed) {
        log::error!("{info}");
        interrupt::handle_panic_from_other_cpu();
    }
    hlt_loop();
}
