use talc::{ErrOnOom, Span, Talc, Talck};

/// Size of the heap arena backing the global allocator.
pub const GLOBAL_ALLOCATOR_SIZE: usize = 4 * 0x400 * 0x400; // 4 MiB

/// Heap arena. Lives in the kernel's own `.bss`, so it is already mapped by
/// the loader before `kernel_main` ever runs — no frame allocator needed.
static mut HEAP: [u8; GLOBAL_ALLOCATOR_SIZE] = [0; GLOBAL_ALLOCATOR_SIZE];

#[global_allocator]
pub static GLOBAL_ALLOCATOR: Talck<spin::Mutex<()>, ErrOnOom> =
    Talck::new(Talc::new(ErrOnOom));

/// Claims the static heap arena for the global allocator.
///
/// # Safety
/// Must be called exactly once, before the first allocation, and only from
/// the bootstrap processor.
pub unsafe fn init() {
    let span = Span::from_base_size(&raw mut HEAP as *mut u8, GLOBAL_ALLOCATOR_SIZE);
    unsafe { GLOBAL_ALLOCATOR.lock().claim(span) }.expect("failed to claim heap arena");
}
