#![no_std]
#![no_main]

extern crate alloc;
extern crate novarun as kernel;

use core::panic::PanicInfo;
use kernel::limine_requests::{BASE_REVISION, RSDP_REQUEST};
use kernel::{acpi, apic, gdt, interrupt, ioapic, logger, memory, project_version, time};

mod channel_tests;
mod harness;
mod scheduler_tests;
mod sync_tests;
mod timer_tests;

#[unsafe(no_mangle)]
unsafe extern "C" fn kernel_main() -> ! {
    assert!(BASE_REVISION.is_supported());

    logger::init().unwrap();
    log::info!("novarun test harness {}", project_version());

    unsafe { memory::global_allocator::init() };
    unsafe { memory::cpu_local_data::init_bsp() };

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

    // Every test up to the harness's terminal one runs synchronously, right
    // here, with interrupts still off — only the terminal test (spawning
    // threads and handing off to the scheduler) needs them, and it enables
    // them itself once it's ready.
    harness::run_tests();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    harness::test_panic_handler(info);
}
