//! Memory-adjacent scaffolding for the scheduler core.
//!
//! This kernel does not implement its own physical/virtual memory manager —
//! that subsystem is out of scope here. Every mapping we need (kernel image,
//! LAPIC/IOAPIC MSRs, ACPI tables) is satisfied either by MSR-only x2APIC
//! access or by Limine's higher-half direct map (HHDM), which covers all
//! usable, reclaimable and ACPI memory reported in the memory map.

pub mod cpu_local_data;
pub mod global_allocator;
pub mod guarded_stack;
pub mod hhdm_offset;
