//! Peripheral set reachable through the bus's I/O window: the interrupt
//! controllers, button input register, and four timer-counters per CPU.
//!
//! Graphics, audio mixing, Wi-Fi, and firmware/RTC are external
//! collaborators reached only through the interfaces in [`crate::emu`]; they
//! are not modeled here.

pub mod interrupt;
pub mod keypad;
pub mod timer;

pub use interrupt::InterruptController;
pub use keypad::KeypadController;
pub use timer::Timer;

use interrupt::sources;

/// Peripheral subsystem shared by both CPUs' I/O windows.
#[derive(Debug, Clone)]
pub struct Peripherals {
    pub interrupt: InterruptController,
    pub keypad: KeypadController,
    /// Four timer-counters per CPU (indexed `[cpu][n]`).
    pub timers: [[Timer; 4]; 2],
}

impl Peripherals {
    pub fn new() -> Peripherals {
        Peripherals {
            interrupt: InterruptController::new(),
            keypad: KeypadController::new(),
            timers: Default::default(),
        }
    }

    pub fn reset(&mut self) {
        self.interrupt.reset();
        self.keypad.reset();
        self.timers = Default::default();
    }

    /// Advance `cpu`'s four timers by `cycles` and raise any overflow IRQs,
    /// chaining count-up-mode timers off their predecessor's overflow.
    pub fn tick_timers(&mut self, cpu: usize, cycles: u32) {
        const TIMER_SOURCES: [u32; 4] = [
            sources::TIMER0,
            sources::TIMER1,
            sources::TIMER2,
            sources::TIMER3,
        ];
        let mut cascaded = false;
        for i in 0..4 {
            let overflowed = if i > 0 && self.timers[cpu][i].count_up() {
                if cascaded {
                    self.timers[cpu][i].pulse()
                } else {
                    false
                }
            } else {
                self.timers[cpu][i].tick(cycles)
            };
            cascaded = overflowed;
            if overflowed {
                self.interrupt.raise(cpu, TIMER_SOURCES[i]);
            }
        }
    }

    /// Re-evaluate the button-IRQ condition and latch the keypad IRQ source
    /// on both CPUs if it's met -- the register is shared hardware.
    pub fn poll_keypad_irq(&mut self) {
        if self.keypad.irq_condition_met() {
            self.interrupt.raise(0, sources::KEYPAD);
            self.interrupt.raise(1, sources::KEYPAD);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.interrupt.to_bytes());
        buf.extend_from_slice(&self.keypad.to_bytes());
        for bank in &self.timers {
            for t in bank {
                buf.extend_from_slice(&t.to_bytes());
            }
        }
        buf
    }

    pub fn restore(&mut self, r: &mut crate::savestate::Reader) {
        self.interrupt.restore(r);
        self.keypad.restore(r);
        for bank in self.timers.iter_mut() {
            for t in bank.iter_mut() {
                t.restore(r);
            }
        }
    }
}

impl Default for Peripherals {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_peripherals_have_no_pending_irqs() {
        let p = Peripherals::new();
        assert!(!p.interrupt.irq_pending(0));
        assert!(!p.interrupt.irq_pending(1));
    }

    #[test]
    fn timer_overflow_raises_irq_on_requested_cpu() {
        let mut p = Peripherals::new();
        p.interrupt.set_ime(0, true);
        p.interrupt.set_ie(0, sources::TIMER0);
        p.timers[0][0].set_reload(0xFFFE);
        p.timers[0][0].write_control(0x80 | 0x40); // ENABLE | IRQ_ON_OVERFLOW
        p.tick_timers(0, 2);
        assert!(p.interrupt.irq_pending(0));
        assert!(!p.interrupt.irq_pending(1));
    }

    #[test]
    fn cascaded_timer_advances_on_predecessor_overflow() {
        let mut p = Peripherals::new();
        p.timers[0][0].set_reload(0xFFFF);
        p.timers[0][0].write_control(0x80);
        p.timers[0][1].write_control(0x80 | 0x04); // ENABLE | COUNT_UP
        p.tick_timers(0, 1);
        assert_eq!(p.timers[0][1].counter(), 1);
    }

    #[test]
    fn reset_clears_timers_and_interrupts() {
        let mut p = Peripherals::new();
        p.interrupt.raise(0, sources::TIMER0);
        p.timers[0][0].write_control(0x80);
        p.reset();
        assert!(!p.interrupt.irq_pending(0));
        assert!(!p.timers[0][0].is_enabled());
    }
}
