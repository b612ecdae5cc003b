use acpi::platform::interrupt::{InterruptSourceOverride, Polarity, TriggerMode};
use acpi::platform::InterruptModel;
use acpi::AcpiTables;
use alloc::boxed::Box;
use crate::memory::hhdm_offset::phys_to_virt;
use spin::Once;

struct IoApicInfo {
    /// Virtual address of the IOAPIC MMIO registers, in Limine's HHDM.
    base: *mut u32,
    /// GSI base for this IOAPIC.
    gsi_base: u32,
}

// Safety: IOAPIC MMIO is accessed only with proper synchronization via the
// spin::Once guard (init runs once) and individual register accesses are
// inherently atomic 32-bit MMIO reads/writes.
unsafe impl Send for IoApicInfo {}
unsafe impl Sync for IoApicInfo {}

struct IoApicState {
    info: IoApicInfo,
    interrupt_source_overrides: &'static [InterruptSourceOverride],
}

static IOAPIC: Once<IoApicState> = Once::new();

/// IOREGSEL register offset (index register)
const IOREGSEL: usize = 0x00;
/// IOWIN register offset (data register)
const IOWIN: usize = 0x10;

/// Redirection table entry registers start at index 0x10.
/// Each entry is two 32-bit registers (low + high).
const IOREDTBL_BASE: u8 = 0x10;

fn read_register(base: *mut u32, index: u8) -> u32 {
    unsafe {
        let reg_sel = base.byte_add(IOREGSEL);
        let reg_win = base.byte_add(IOWIN);
        core::ptr::write_volatile(reg_sel, index as u32);
        core::ptr::read_volatile(reg_win)
    }
}

fn write_register(base: *mut u32, index: u8, value: u32) {
    unsafe {
        let reg_sel = base.byte_add(IOREGSEL);
        let reg_win = base.byte_add(IOWIN);
        core::ptr::write_volatile(reg_sel, index as u32);
        core::ptr::write_volatile(reg_win, value);
    }
}

/// Read the maximum number of redirection entries from IOAPICVER register.
fn max_redirection_entries(base: *mut u32) -> u8 {
    let ver = read_register(base, 0x01);
    ((ver >> 16) & 0xFF) as u8
}

/// Mask all IOAPIC pins by setting the mask bit in each redirection entry.
fn mask_all(base: *mut u32) {
    let max_entries = max_redirection_entries(base);
    for i in 0..=max_entries {
        let reg_low = IOREDTBL_BASE + i * 2;
        let low = read_register(base, reg_low);
        // Set bit 16 (mask bit)
        write_register(base, reg_low, low | (1 << 16));
    }
}

/// Initialize the IOAPIC subsystem from ACPI tables.
///
/// The IOAPIC's MMIO page sits at a device address reported by the MADT;
/// Limine's HHDM covers it like any other physical page, so no explicit
/// page-table mapping is needed here.
pub fn init(acpi_tables: &AcpiTables<impl acpi::Handler>) {
    let apic_model = match InterruptModel::new(acpi_tables).unwrap().0 {
        InterruptModel::Apic(apic) => apic,
        _ => panic!("No APIC interrupt model found"),
    };

    // We only support a single IOAPIC for now
    let io_apic = apic_model.io_apics.first().expect("No IOAPIC found in ACPI tables");
    let virt_addr = phys_to_virt(io_apic.address as u64).as_mut_ptr::<u32>();

    let overrides: alloc::vec::Vec<InterruptSourceOverride> =
        apic_model.interrupt_source_overrides.into_iter().collect();
    let overrides_static: &'static [InterruptSourceOverride] =
        Box::leak(overrides.into_boxed_slice());

    IOAPIC.call_once(|| {
        let info = IoApicInfo {
            base: virt_addr,
            gsi_base: io_apic.global_system_interrupt_base,
        };

        // Mask all pins initially
        mask_all(info.base);

        log::info!(
            "IOAPIC initialized at phys={:#x}, virt={:#p}, GSI base={}",
            io_apic.address,
            virt_addr,
            io_apic.global_system_interrupt_base,
        );

        // Disable legacy PIC (mask all IRQs on 8259)
        if apic_model.also_has_legacy_pics {
            disable_legacy_pic();
        }

        IoApicState {
            info,
            interrupt_source_overrides: overrides_static,
        }
    });
}

/// Disable the legacy 8259 PIC by masking all IRQs.
fn disable_legacy_pic() {
    use x86::io::outb;
    unsafe {
        outb(0x21, 0xFF); // PIC1 data
        outb(0xA1, 0xFF); // PIC2 data
    }
    log::info!("Legacy 8259 PIC disabled");
}

/// Route an ISA IRQ to the specified APIC vector on the given destination APIC.
///
/// Handles ACPI interrupt source overrides (an ISA IRQ may be remapped to a
/// different GSI, polarity, or trigger mode than its default ISA behavior).
pub fn route_isa_irq(isa_irq: u8, vector: u8, dest_apic_id: u32) {
    let state = IOAPIC.get().expect("IOAPIC not initialized");

    let (gsi, polarity, trigger_mode) = state
        .interrupt_source_overrides
        .iter()
        .find(|iso| iso.isa_source == isa_irq)
        .map(|iso| (iso.global_system_interrupt, iso.polarity, iso.trigger_mode))
        .unwrap_or((isa_irq as u32, Polarity::SameAsBus, TriggerMode::SameAsBus));

    let pin = (gsi - state.info.gsi_base) as u8;

    let mut entry_low: u32 = vector as u32; // bits 0-7: vector
    // Delivery mode: fixed (000); destination mode: physical (bit 11 = 0)

    if let Polarity::ActiveLow = polarity {
        entry_low |= 1 << 13;
    }
    if let TriggerMode::Level = trigger_mode {
        entry_low |= 1 << 15;
    }
    // Unmask (bit 16 = 0, already clear)

    let entry_high: u32 = (dest_apic_id & 0xFF) << 24; // bits 56-63: destination

    let reg_low = IOREDTBL_BASE + pin * 2;
    let reg_high = reg_low + 1;

    write_register(state.info.base, reg_high, entry_high);
    write_register(state.info.base, reg_low, entry_low);

    log::info!(
        "IOAPIC: ISA IRQ{} -> GSI {} -> pin {} -> vector {:#x}, dest APIC {}",
        isa_irq,
        gsi,
        pin,
        vector,
        dest_apic_id,
    );
}
