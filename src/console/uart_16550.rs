use bitflags::bitflags;

use crate::arch::x86_64::pio::{Io, Pio, ReadOnly};

bitflags! {
    /// Line control flags
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct LineCtrlFlags: u8 {
        const DATA_8 = 0x03;
        const DLAB = 1 << 7;
    }
}

bitflags! {
    /// Line status flags
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct LineStsFlags: u8 {
        const INPUT_FULL = 1;
        // 1 to 4 unknown
        const OUTPUT_EMPTY = 1 << 5;
        // 6 and 7 unknown
    }
}

/// Divisor latch value for 115200 baud.
const DIVISOR_115200: u8 = 1;
/// Enable and clear both FIFOs, 14 byte threshold.
const FIFO_ENABLE_CLEAR: u8 = 0xC7;
/// DTR and RTS.
const MODEM_DTR_RTS: u8 = 0x03;

/// Serial port representation.
pub struct SerialPort<T: Io> {
    data: T,               // Data register, divisor low byte while DLAB is set
    int_en: T,             // Interrupt enable, divisor high byte while DLAB is set
    fifo_ctrl: T,          // FIFO control
    line_ctrl: T,          // Line control
    modem_ctrl: T,         // Modem control
    line_sts: ReadOnly<T>, // Line status
}

impl SerialPort<Pio<u8>> {
    /// Serial port with its registers at `base`..`base + 5`.
    pub const fn new(base: u16) -> SerialPort<Pio<u8>> {
        SerialPort {
            data: Pio::new(base),
            int_en: Pio::new(base + 1),
            fifo_ctrl: Pio::new(base + 2),
            line_ctrl: Pio::new(base + 3),
            modem_ctrl: Pio::new(base + 4),
            line_sts: ReadOnly::new(Pio::new(base + 5)),
        }
    }

    pub const fn base(&self) -> u16 {
        self.data.port()
    }
}

impl<T: Io<Value = u8>> SerialPort<T> {
    /// Build a port from its registers, `register(n)` returning register `n`.
    pub fn with_registers(mut register: impl FnMut(u16) -> T) -> Self {
        SerialPort {
            data: register(0),
            int_en: register(1),
            fifo_ctrl: register(2),
            line_ctrl: register(3),
            modem_ctrl: register(4),
            line_sts: ReadOnly::new(register(5)),
        }
    }

    /// Program 115200 8N1 with FIFOs on and all UART interrupts off.
    pub fn init(&mut self) {
        self.int_en.write(0x00);
        self.line_ctrl.write(LineCtrlFlags::DLAB.bits());
        self.data.write(DIVISOR_115200);
        self.int_en.write(0x00);
        self.line_ctrl.write(LineCtrlFlags::DATA_8.bits());
        self.fifo_ctrl.write(FIFO_ENABLE_CLEAR);
        self.modem_ctrl.write(MODEM_DTR_RTS);
    }

    fn line_sts(&self) -> LineStsFlags {
        LineStsFlags::from_bits_truncate(self.line_sts.read())
    }

    /// Sends a byte once the transmitter holding register is empty.
    pub fn send(&mut self, data: u8) {
        while !self.line_sts().contains(LineStsFlags::OUTPUT_EMPTY) {
            core::hint::spin_loop();
        }
        self.data.write(data)
    }

    /// Receives a byte if one is waiting.
    pub fn receive(&mut self) -> Option<u8> {
        if self.line_sts().contains(LineStsFlags::INPUT_FULL) {
            Some(self.data.read())
        } else {
            None
        }
    }

    /// Writes a byte, expanding `\n` to `\r\n` and backspace to an erase.
    pub fn write(&mut self, b: u8) {
        match b {
            8 | 0x7F => {
                self.send(8);
                self.send(b' ');
                self.send(8);
            }
            b'\n' => {
                self.send(b'\r');
                self.send(b'\n');
            }
            _ => {
                self.send(b);
            }
        }
    }
}

impl<T: Io<Value = u8>> core::fmt::Write for SerialPort<T> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for byte in s.bytes() {
            self.write(byte);
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Eight UART registers in memory, with a log of every write.
    #[derive(Default)]
    pub(crate) struct FakeUart {
        pub regs: [u8; 8],
        pub writes: Vec<(u16, u8)>,
    }

    impl FakeUart {
        pub fn sent(&self) -> Vec<u8> {
            self.writes.iter().filter(|(r, _)| *r == 0).map(|(_, v)| *v).collect()
        }
    }

    pub(crate) struct FakeReg {
        index: u16,
        uart: Rc<RefCell<FakeUart>>,
    }

    impl Io for FakeReg {
        type Value = u8;

        fn read(&self) -> u8 {
            self.uart.borrow().regs[self.index as usize]
        }

        fn write(&mut self, value: u8) {
            let mut uart = self.uart.borrow_mut();
            uart.writes.push((self.index, value));
            uart.regs[self.index as usize] = value;
        }
    }

    pub(crate) fn fake_port() -> (SerialPort<FakeReg>, Rc<RefCell<FakeUart>>) {
        let uart = Rc::new(RefCell::new(FakeUart::default()));
        uart.borrow_mut().regs[5] = LineStsFlags::OUTPUT_EMPTY.bits();
        let port = SerialPort::with_registers(|index| FakeReg { index, uart: uart.clone() });
        (port, uart)
    }

    #[test]
    fn test_init_programs_115200_8n1() {
        let (mut port, uart) = fake_port();
        port.init();

        assert_eq!(
            uart.borrow().writes,
            vec![(1, 0x00), (3, 0x80), (0, 0x01), (1, 0x00), (3, 0x03), (2, 0xC7), (4, 0x03)]
        );
    }

    #[test]
    fn test_newline_expanded() {
        let (mut port, uart) = fake_port();
        core::fmt::Write::write_str(&mut port, "ok\n").unwrap();
        assert_eq!(uart.borrow().sent(), b"ok\r\n".to_vec());
    }

    #[test]
    fn test_backspace_erases() {
        let (mut port, uart) = fake_port();
        port.write(0x7F);
        assert_eq!(uart.borrow().sent(), vec![8, b' ', 8]);
    }

    #[test]
    fn test_receive_only_when_input_full() {
        let (mut port, uart) = fake_port();
        assert_eq!(port.receive(), None);

        uart.borrow_mut().regs[0] = b'x';
        uart.borrow_mut().regs[5] |= LineStsFlags::INPUT_FULL.bits();
        assert_eq!(port.receive(), Some(b'x'));
    }
}
