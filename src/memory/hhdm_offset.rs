use limine::request::HhdmRequest;
use spin::Once;
use x86_64::VirtAddr;

#[used]
#[unsafe(link_section = ".requests")]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

static HHDM_OFFSET: Once<u64> = Once::new();

/// Caches and returns the offset of Limine's higher-half direct map.
///
/// Must only be called after Limine has handed control to `kernel_main`;
/// panics otherwise.
pub fn hhdm_offset() -> VirtAddr {
    let offset = *HHDM_OFFSET.call_once(|| {
        HHDM_REQUEST
            .get_response()
            .expect("HHDM response missing")
            .offset()
    });
    VirtAddr::new(offset)
}

/// Translates a physical address into its HHDM-mapped kernel virtual address.
pub fn phys_to_virt(phys: u64) -> VirtAddr {
    hhdm_offset() + phys
}
