use core::cell::UnsafeCell;
use crate::memory::cpu_local_data::get_local;
use acpi::AcpiTables;
use acpi::platform::InterruptModel;
use force_send_sync::SendSync;
use raw_cpuid::CpuId;
use spin::Once;
use x2apic::lapic::LocalApicBuilder;
use x86_64::registers::model_specific::Msr;
use crate::interrupt::InterruptVector;

const IA32_X2APIC_SVR: u32 = 0x80F;

/// x2APIC ID of the boot CPU, discovered from ACPI's MADT so every other
/// CPU can target it without waiting for that CPU to start up.
pub static BSP_APIC_ID: Once<u32> = Once::new();

/// Verifies x2APIC support and checks the MADT parses. This kernel has no
/// xAPIC/MMIO fallback — the teacher hardware line this runs on always
/// reports x2APIC, and supporting the legacy MMIO register window would
/// mean dragging the page-table mapper back in for one struct's lifetime.
pub fn init_bsp(acpi_tables: &AcpiTables<impl acpi::Handler>) {
    assert!(cpu_has_x2apic(), "CPU does not support x2APIC");

    match InterruptModel::new(acpi_tables).unwrap().0 {
        InterruptModel::Apic(_) => {}
        interrupt_model => panic!("Unknown interrupt model: {:#?}", interrupt_model),
    };
}

/// This function needs to be called on all CPUs.
/// [`init_bsp`] must be called first.
pub fn init_local_apic() {
    get_local().local_apic.call_once(|| {
        UnsafeCell::new({
            let mut builder = LocalApicBuilder::new();
            builder.spurious_vector(u8::from(InterruptVector::LocalApicSpurious).into());
            builder.error_vector(u8::from(InterruptVector::LocalApicError).into());
            builder.timer_vector(u8::from(InterruptVector::LocalApicTimer).into());

            let mut local_apic = builder.build().unwrap();
            unsafe { local_apic.enable() }
            // The builder arms a Periodic timer (initial=10M, unmasked) by default.
            // Mask it immediately so no stray interrupt fires before lapic_timer::init().
            unsafe { local_apic.disable_timer() }
            unsafe { SendSync::new(local_apic) }
        })
    });

    BSP_APIC_ID.call_once(|| crate::memory::cpu_local_data::local_apic_id_of(0));
}

fn cpu_has_x2apic() -> bool {
    let cpuid = CpuId::new();

    match cpuid.get_feature_info() {
        Some(info) => info.has_x2apic(),
        None => false,
    }
}

pub fn is_enabled() -> bool {
    let svr = unsafe { Msr::new(IA32_X2APIC_SVR).read() };
    svr & (1 << 8) != 0
}

/// Send a fixed-delivery IPI to the given x2APIC ID on the given vector.
pub fn send_fixed_ipi(target_apic_id: u32, vector: u8) {
    // x2APIC ICR (MSR 0x830): destination in bits [63:32], vector in [7:0].
    let icr = ((target_apic_id as u64) << 32) | vector as u64;
    unsafe { Msr::new(0x830).write(icr) };
}

/// Send an IPI carrying one of the scheduler's own vectors (currently just
/// [`InterruptVector::Reschedule`]) to a specific x2APIC ID.
pub fn send_ipi_to(target_apic_id: u8, vector: InterruptVector) {
    send_fixed_ipi(target_apic_id as u32, vector.into());
}
