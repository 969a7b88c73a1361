//! The host's 8250 console. The same physical port doubles as the guest's
//! emulated serial port: guest transmit bytes are funneled through
//! [`write_byte`] while the interrupt-enable register the guest thinks it
//! programs is shadowed by the hypervisor.

use core::fmt;

use spin::Mutex;
use uart_16550::SerialPort;
use x86_64::instructions::port::Port;

const COM1: u16 = 0x3F8;

static SERIAL1: Mutex<Option<SerialPort>> = Mutex::new(None);

pub fn init() {
    let mut port = unsafe { SerialPort::new(COM1) };
    port.init();
    *SERIAL1.lock() = Some(port);
}

/// Byte-level transmit, handed to the hypervisor as the guest's TX sink.
pub fn write_byte(byte: u8) {
    if let Some(port) = SERIAL1.lock().as_mut() {
        port.send_raw(byte);
    }
}

/// Enables the receive-data interrupt (IER bit 0) on the physical UART.
pub fn enable_interrupts() {
    let mut ier = Port::<u8>::new(COM1 + 1);
    unsafe { ier.write(0x01) };
}

pub(crate) fn print(args: fmt::Arguments) {
    use core::fmt::Write;

    if let Some(port) = SERIAL1.lock().as_mut() {
        port.write_fmt(args).ok();
    }
}
