/*
 * Hardware Access Capability
 *
 * Timer calibration, interrupt acknowledgement and the hypervisor console all
 * talk to the machine through this trait instead of calling the instruction
 * wrappers directly. The real implementation is `arch::x86_64::X86`; tests
 * substitute a recording fake.
 *
 * MMIO is deliberately not part of the trait: the MMIO primitives already
 * operate on plain addresses and can be exercised against ordinary memory.
 */

/// Per-width, per-operation access to ports and model-specific registers.
pub trait HwAccess {
    /// Single-byte port read (`in al, dx`).
    fn inb(&self, port: u16) -> u8;

    /// Single-byte port write (`out dx, al`).
    fn outb(&self, value: u8, port: u16);

    /// Four-byte port read (`in eax, dx`).
    fn inl(&self, port: u16) -> u32;

    /// 64-bit MSR read assembled from EDX:EAX.
    fn read_msr(&self, msr: u32) -> u64;

    /// 64-bit MSR write split into EDX:EAX.
    fn write_msr(&self, msr: u32, value: u64);

    /// Trap to the hypervisor with `code` and two arguments, returning RAX.
    fn hypercall(&self, code: u64, arg1: u64, arg2: u64) -> u64;

    /// Spin-loop hint used while busy-waiting on a device.
    fn relax(&self) {
        core::hint::spin_loop();
    }
}

impl<H: HwAccess + ?Sized> HwAccess for &H {
    fn inb(&self, port: u16) -> u8 {
        (**self).inb(port)
    }

    fn outb(&self, value: u8, port: u16) {
        (**self).outb(value, port)
    }

    fn inl(&self, port: u16) -> u32 {
        (**self).inl(port)
    }

    fn read_msr(&self, msr: u32) -> u64 {
        (**self).read_msr(msr)
    }

    fn write_msr(&self, msr: u32, value: u64) {
        (**self).write_msr(msr, value)
    }

    fn hypercall(&self, code: u64, arg1: u64, arg2: u64) -> u64 {
        (**self).hypercall(code, arg1, arg2)
    }

    fn relax(&self) {
        (**self).relax()
    }
}
