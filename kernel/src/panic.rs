use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};

/// Set on the first panic; a panic raised while reporting one skips
/// straight to the halt.
static PANICKED: AtomicBool = AtomicBool::new(false);

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();

    if PANICKED.swap(true, Ordering::Relaxed) {
        log::error!("Double panic detected. Halting.");
        endless_halt();
    }

    log::error!("PANIC: {}", info);
    endless_halt()
}

pub fn endless_halt() -> ! {
    x86_64::instructions::interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}
