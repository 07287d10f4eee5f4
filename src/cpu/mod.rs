//! Dual-ISA (ARM + Thumb) CPU interpreter.
//!
//! One `Cpu` instance models either the ARMv5-class CPU A or the ARMv4T
//! CPU B; the two differ only in a handful of constants (exception vector
//! base, a narrower instruction subset for B) threaded through `CpuId`.
//!
//! Reference: this module's register-bank swap, condition table, and
//! pipeline-refill semantics are grounded on the emulated hardware's own
//! interpreter (`ARM.cpp`/`ARM.h`); the surrounding structure (a `Cpu`
//! value passed an explicit `&mut Bus`, banked registers kept always-live
//! rather than behind a per-mode struct) follows this crate's CPU module
//! layout.

mod condition;
mod decode_arm;
mod decode_thumb;
mod execute_arm;
mod execute_thumb;
mod shifter;
#[cfg(test)]
mod tests;

pub use condition::check_condition;
pub use shifter::{Shifted, ShifterCarry};

use crate::bus::{Bus, CpuId};
use crate::scheduler::Scheduler;

/// The 5-bit mode field values (§3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    User = 0x10,
    Fiq = 0x11,
    Irq = 0x12,
    Supervisor = 0x13,
    Abort = 0x17,
    Undefined = 0x1B,
    System = 0x1F,
}

impl Mode {
    pub fn from_bits(bits: u32) -> Option<Mode> {
        Some(match bits & 0x1F {
            0x10 => Mode::User,
            0x11 => Mode::Fiq,
            0x12 => Mode::Irq,
            0x13 => Mode::Supervisor,
            0x17 => Mode::Abort,
            0x1B => Mode::Undefined,
            0x1F => Mode::System,
            _ => return None,
        })
    }

    pub fn bits(self) -> u32 {
        self as u32
    }

    /// Whether this mode is privileged (anything but User). Determines
    /// which CPSR bits an MSR from this mode may touch.
    pub fn is_privileged(self) -> bool {
        !matches!(self, Mode::User)
    }
}

/// Program status register. Bit layout matches the real ARM encoding so the
/// raw value can be saved/restored byte-for-byte: top nibble N,Z,C,V; bit 5
/// Thumb state; bits 6/7 FIQ/IRQ disable; bits 0-4 mode field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Psr(pub u32);

impl Psr {
    const N: u32 = 1 << 31;
    const Z: u32 = 1 << 30;
    const C: u32 = 1 << 29;
    const V: u32 = 1 << 28;
    const THUMB: u32 = 1 << 5;
    const IRQ_DISABLE: u32 = 1 << 7;
    const FIQ_DISABLE: u32 = 1 << 6;

    pub fn mode(self) -> u32 {
        self.0 & 0x1F
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.0 = (self.0 & !0x1F) | mode.bits();
    }

    pub fn thumb(self) -> bool {
        self.0 & Self::THUMB != 0
    }

    pub fn set_thumb(&mut self, on: bool) {
        if on {
            self.0 |= Self::THUMB;
        } else {
            self.0 &= !Self::THUMB;
        }
    }

    pub fn irq_disabled(self) -> bool {
        self.0 & Self::IRQ_DISABLE != 0
    }

    pub fn set_irq_disabled(&mut self, on: bool) {
        if on {
            self.0 |= Self::IRQ_DISABLE;
        } else {
            self.0 &= !Self::IRQ_DISABLE;
        }
    }

    pub fn fiq_disabled(self) -> bool {
        self.0 & Self::FIQ_DISABLE != 0
    }

    pub fn n(self) -> bool {
        self.0 & Self::N != 0
    }
    pub fn z(self) -> bool {
        self.0 & Self::Z != 0
    }
    pub fn c(self) -> bool {
        self.0 & Self::C != 0
    }
    pub fn v(self) -> bool {
        self.0 & Self::V != 0
    }

    pub fn set_c(&mut self, c: bool) {
        if c {
            self.0 |= Self::C;
        } else {
            self.0 &= !Self::C;
        }
    }

    pub fn set_nz(&mut self, n: bool, z: bool) {
        self.0 &= !(Self::N | Self::Z);
        if n {
            self.0 |= Self::N;
        }
        if z {
            self.0 |= Self::Z;
        }
    }

    pub fn set_nzcv(&mut self, n: bool, z: bool, c: bool, v: bool) {
        self.0 &= !(Self::N | Self::Z | Self::C | Self::V);
        if n {
            self.0 |= Self::N;
        }
        if z {
            self.0 |= Self::Z;
        }
        if c {
            self.0 |= Self::C;
        }
        if v {
            self.0 |= Self::V;
        }
    }

    /// Condition-code nibble, used to index the 16-entry condition table.
    pub fn flags_nibble(self) -> u32 {
        self.0 >> 28
    }
}

/// Per-mode shadow registers (§3.1). FIQ banks r8-r14 plus SPSR; the other
/// four privileged modes bank only r13-r14 plus SPSR.
#[derive(Debug, Clone, Copy, Default)]
struct FiqBank {
    r8_12: [u32; 5],
    r13: u32,
    r14: u32,
    spsr: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct SmallBank {
    r13: u32,
    r14: u32,
    spsr: u32,
}

/// Tri-valued halt state (§3.1, §4.3 "Halt").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltState {
    Running,
    HaltedUntilIrq,
    /// A one-cycle halt pulse; the CPU resumes on the next check regardless
    /// of whether an IRQ is pending (the cross-IRQ-boundary semantics are
    /// left unspecified by the source -- see DESIGN.md Open Question).
    HaltedOnePulse,
}

/// External interrupt inputs checked after every instruction and every
/// event-callback return (§4.3 "IRQ entry", §5 "Ordering guarantees").
#[derive(Debug, Clone, Copy, Default)]
pub struct InterruptLines {
    pub master_enable: bool,
    pub enable: u32,
    pub flag: u32,
}

impl InterruptLines {
    pub fn pending(&self) -> bool {
        self.master_enable && (self.enable & self.flag) != 0
    }
}

pub struct Cpu {
    pub id: CpuId,
    pub r: [u32; 16],
    pub cpsr: Psr,

    fiq_bank: FiqBank,
    irq_bank: SmallBank,
    svc_bank: SmallBank,
    abt_bank: SmallBank,
    und_bank: SmallBank,

    /// Two prefetched instruction words (`NextInstr[0..1]`).
    pub next_instr: [u32; 2],

    pub exception_base: u32,
    pub halt: HaltState,
    pub irq: InterruptLines,

    /// Signed cycle ledger: consumed this slice minus the budget: negative
    /// while running, the overshoot (positive count owed back) once the
    /// slice completes.
    cycles: i64,
    slice_budget: i64,
}

impl Cpu {
    pub fn new(id: CpuId) -> Self {
        let exception_base = match id {
            CpuId::A => 0, // implementation-selectable; see Emu::new
            CpuId::B => 0,
        };
        Self {
            id,
            r: [0; 16],
            cpsr: Psr(0x1F),
            fiq_bank: FiqBank::default(),
            irq_bank: SmallBank::default(),
            svc_bank: SmallBank::default(),
            abt_bank: SmallBank::default(),
            und_bank: SmallBank::default(),
            next_instr: [0, 0],
            exception_base,
            halt: HaltState::Running,
            irq: InterruptLines::default(),
            cycles: 0,
            slice_budget: 0,
        }
    }

    pub fn reset(&mut self, bus: &mut Bus) {
        self.r = [0; 16];
        self.cpsr = Psr(0x000000D3); // Supervisor, IRQ+FIQ masked, ARM state
        self.fiq_bank = FiqBank::default();
        self.irq_bank = SmallBank::default();
        self.svc_bank = SmallBank::default();
        self.abt_bank = SmallBank::default();
        self.und_bank = SmallBank::default();
        self.halt = HaltState::Running;
        self.irq = InterruptLines::default();
        self.cycles = 0;

        self.exception_base = match self.id {
            CpuId::A => bus.arm9_exception_base,
            CpuId::B => 0,
        };
        self.jump_to(bus, self.exception_base, false);
    }

    /// Visible PC: current instruction address + 8 (ARM) or + 4 (Thumb),
    /// matching the fetch-ahead semantics of `r[15]` (§3.1).
    pub fn pc(&self) -> u32 {
        self.r[15]
    }

    /// Refill the pipeline at `addr`. If `restore_cpsr` is set (a
    /// flag-setting write to r15, or an MSR-driven mode exit), the current
    /// privileged mode's saved PSR is restored first and the Thumb state
    /// bit it carries decides ARM vs Thumb for the refetch (§4.3 "Mode
    /// transitions").
    pub fn jump_to(&mut self, bus: &mut Bus, addr: u32, restore_cpsr: bool) {
        let mut addr = addr;
        if restore_cpsr {
            self.restore_cpsr();
            if self.cpsr.thumb() {
                addr |= 1;
            } else {
                addr &= !1;
            }
        }

        if addr & 1 != 0 {
            let addr = addr & !1;
            self.r[15] = addr.wrapping_add(4);
            self.next_instr[0] = bus.read16(self.id, addr) as u32;
            self.next_instr[1] = bus.read16(self.id, addr.wrapping_add(2)) as u32;
            self.cpsr.set_thumb(true);
        } else {
            let addr = addr & !3;
            self.r[15] = addr.wrapping_add(8);
            self.next_instr[0] = bus.read32(self.id, addr);
            self.next_instr[1] = bus.read32(self.id, addr.wrapping_add(4));
            self.cpsr.set_thumb(false);
        }
    }

    /// Restore CPSR from the current mode's banked SPSR, then apply the
    /// resulting register-bank swap.
    pub fn restore_cpsr(&mut self) {
        let old = self.cpsr;
        let spsr = match Mode::from_bits(old.mode()) {
            Some(Mode::Fiq) => self.fiq_bank.spsr,
            Some(Mode::Irq) => self.irq_bank.spsr,
            Some(Mode::Supervisor) => self.svc_bank.spsr,
            Some(Mode::Abort) => self.abt_bank.spsr,
            Some(Mode::Undefined) => self.und_bank.spsr,
            _ => {
                log::warn!("attempt to restore CPSR under bad mode {:#04x}", old.mode());
                old.0
            }
        };
        self.cpsr = Psr(spsr);
        self.update_mode(old.mode(), self.cpsr.mode());
    }

    /// Swap the live registers for the outgoing/incoming mode banks. A
    /// mode-to-same-mode transition is a no-op (§3.1).
    pub fn update_mode(&mut self, old_mode: u32, new_mode: u32) {
        if old_mode == new_mode {
            return;
        }

        self.bank_out(old_mode);
        self.bank_in(new_mode);
    }

    fn bank_out(&mut self, mode: u32) {
        match Mode::from_bits(mode) {
            Some(Mode::Fiq) => {
                for i in 0..5 {
                    std::mem::swap(&mut self.r[8 + i], &mut self.fiq_bank.r8_12[i]);
                }
                std::mem::swap(&mut self.r[13], &mut self.fiq_bank.r13);
                std::mem::swap(&mut self.r[14], &mut self.fiq_bank.r14);
            }
            Some(Mode::Irq) => {
                std::mem::swap(&mut self.r[13], &mut self.irq_bank.r13);
                std::mem::swap(&mut self.r[14], &mut self.irq_bank.r14);
            }
            Some(Mode::Supervisor) => {
                std::mem::swap(&mut self.r[13], &mut self.svc_bank.r13);
                std::mem::swap(&mut self.r[14], &mut self.svc_bank.r14);
            }
            Some(Mode::Abort) => {
                std::mem::swap(&mut self.r[13], &mut self.abt_bank.r13);
                std::mem::swap(&mut self.r[14], &mut self.abt_bank.r14);
            }
            Some(Mode::Undefined) => {
                std::mem::swap(&mut self.r[13], &mut self.und_bank.r13);
                std::mem::swap(&mut self.r[14], &mut self.und_bank.r14);
            }
            _ => {}
        }
    }

    fn bank_in(&mut self, mode: u32) {
        // Symmetric to bank_out: swapping twice with the same bank storage
        // restores the live registers, which is exactly the "swap in" step.
        self.bank_out(mode);
    }

    /// Save the live CPSR into the target mode's SPSR slot (used on IRQ
    /// entry and by MSR-to-SPSR).
    fn save_spsr(&mut self, mode: u32, value: u32) {
        match Mode::from_bits(mode) {
            Some(Mode::Fiq) => self.fiq_bank.spsr = value,
            Some(Mode::Irq) => self.irq_bank.spsr = value,
            Some(Mode::Supervisor) => self.svc_bank.spsr = value,
            Some(Mode::Abort) => self.abt_bank.spsr = value,
            Some(Mode::Undefined) => self.und_bank.spsr = value,
            _ => {}
        }
    }

    pub fn spsr(&self, mode: u32) -> Option<u32> {
        match Mode::from_bits(mode) {
            Some(Mode::Fiq) => Some(self.fiq_bank.spsr),
            Some(Mode::Irq) => Some(self.irq_bank.spsr),
            Some(Mode::Supervisor) => Some(self.svc_bank.spsr),
            Some(Mode::Abort) => Some(self.abt_bank.spsr),
            Some(Mode::Undefined) => Some(self.und_bank.spsr),
            _ => None,
        }
    }

    pub fn set_spsr(&mut self, value: u32) {
        self.save_spsr(self.cpsr.mode(), value);
    }

    /// IRQ entry path (§4.3). Funnels through `update_mode` like every other
    /// mode transition.
    fn trigger_irq(&mut self, bus: &mut Bus) {
        if self.cpsr.irq_disabled() {
            return;
        }
        let old = self.cpsr;
        // r[15] already reads as (return address) + 8 in ARM state or + 4
        // in Thumb state; LR_irq wants exactly (return address) + 4 either
        // way, so ARM needs a -4 correction and Thumb needs none.
        let lr_offset: i64 = if old.thumb() { 0 } else { -4 };
        let mut new = old;
        new.0 &= !0xFF;
        new.0 |= 0xD2; // IRQ mode, IRQ+FIQ masked, ARM state
        self.cpsr = new;
        self.update_mode(old.mode(), new.mode());
        self.save_spsr(new.mode(), old.0);
        self.r[14] = (self.r[15] as i64 + lr_offset) as u32;
        self.jump_to(bus, self.exception_base.wrapping_add(0x18), false);
    }

    fn check_irq(&mut self, bus: &mut Bus) {
        if self.irq.pending() {
            match self.halt {
                HaltState::HaltedUntilIrq | HaltState::HaltedOnePulse => {
                    self.halt = HaltState::Running;
                }
                HaltState::Running => {}
            }
            self.trigger_irq(bus);
        }
    }

    pub fn halt_until_irq(&mut self) {
        self.halt = HaltState::HaltedUntilIrq;
    }

    /// Run until the cycle ledger reaches or exceeds `slice_cycles`, then
    /// return the actual cycles consumed. Overshoot is carried forward by
    /// the caller adjusting the next slice's budget, so no cycles are lost
    /// (§4.3 contract).
    pub fn execute(&mut self, bus: &mut Bus, _scheduler: &mut Scheduler, slice_cycles: i64) -> i64 {
        self.slice_budget = slice_cycles;
        self.cycles = 0;

        if matches!(self.halt, HaltState::HaltedUntilIrq) {
            // A halted CPU still consumes its full slice so the scheduler
            // advances (§4.3 "Halt").
            self.check_irq(bus);
            if matches!(self.halt, HaltState::HaltedUntilIrq) {
                return slice_cycles;
            }
        }

        while self.cycles < self.slice_budget {
            let consumed = self.step(bus);
            self.cycles += consumed;

            self.check_irq(bus);

            if matches!(self.halt, HaltState::HaltedUntilIrq) {
                self.cycles = self.slice_budget;
                break;
            }
            if matches!(self.halt, HaltState::HaltedOnePulse) {
                self.halt = HaltState::Running;
            }
        }

        self.cycles
    }

    /// Fetch-decode-execute one instruction, returning its cycle cost.
    fn step(&mut self, bus: &mut Bus) -> i64 {
        if self.cpsr.thumb() {
            self.step_thumb(bus)
        } else {
            self.step_arm(bus)
        }
    }

    /// Entry/exit invariant for both stepping functions: `r[15]` reads as
    /// (address of `cur_instr`) + 8 in ARM state, + 4 in Thumb, for the
    /// whole duration of `cur_instr`'s execution -- exactly what a real
    /// ARM instruction sees when it reads `r15` as an operand. Advancing
    /// the pipeline therefore has to happen *after* dispatch, and only if
    /// dispatch didn't already refill it via `jump_to` (a taken branch).
    fn step_arm(&mut self, bus: &mut Bus) -> i64 {
        let entry_pc = self.r[15];
        let cur_instr = self.next_instr[0];
        let cond = cur_instr >> 28;

        let cycles = if cond == 0xF {
            // BLX(imm), encoding `1111 101x ....`, is the sole
            // always-executed ARM instruction regardless of condition bits
            // (§4.3 "Branches").
            if (cur_instr & 0xFE000000) == 0xFA000000 {
                execute_arm::blx_imm(self, bus, cur_instr)
            } else {
                1
            }
        } else if !check_condition(cond, self.cpsr.flags_nibble()) {
            1
        } else {
            execute_arm::dispatch(self, bus, cur_instr)
        };

        if self.r[15] == entry_pc {
            self.next_instr[0] = self.next_instr[1];
            self.next_instr[1] = bus.read32(self.id, entry_pc);
            self.r[15] = entry_pc.wrapping_add(4);
        }
        cycles
    }

    fn step_thumb(&mut self, bus: &mut Bus) -> i64 {
        let entry_pc = self.r[15];
        let cur_instr = self.next_instr[0] as u16;

        let cycles = execute_thumb::dispatch(self, bus, cur_instr);

        if self.r[15] == entry_pc {
            self.next_instr[0] = self.next_instr[1];
            self.next_instr[1] = bus.read16(self.id, entry_pc) as u32;
            self.r[15] = entry_pc.wrapping_add(2);
        }
        cycles
    }
}

impl Cpu {
    /// Serialize register file, banks, pipeline latches, and halt/IRQ state.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for r in &self.r {
            buf.extend_from_slice(&r.to_le_bytes());
        }
        buf.extend_from_slice(&self.cpsr.0.to_le_bytes());
        for w in self.fiq_bank.r8_12 {
            buf.extend_from_slice(&w.to_le_bytes());
        }
        buf.extend_from_slice(&self.fiq_bank.r13.to_le_bytes());
        buf.extend_from_slice(&self.fiq_bank.r14.to_le_bytes());
        buf.extend_from_slice(&self.fiq_bank.spsr.to_le_bytes());
        for bank in [&self.irq_bank, &self.svc_bank, &self.abt_bank, &self.und_bank] {
            buf.extend_from_slice(&bank.r13.to_le_bytes());
            buf.extend_from_slice(&bank.r14.to_le_bytes());
            buf.extend_from_slice(&bank.spsr.to_le_bytes());
        }
        buf.extend_from_slice(&self.next_instr[0].to_le_bytes());
        buf.extend_from_slice(&self.next_instr[1].to_le_bytes());
        buf.extend_from_slice(&self.exception_base.to_le_bytes());
        buf.push(match self.halt {
            HaltState::Running => 0,
            HaltState::HaltedUntilIrq => 1,
            HaltState::HaltedOnePulse => 2,
        });
        buf.push(self.irq.master_enable as u8);
        buf.extend_from_slice(&self.irq.enable.to_le_bytes());
        buf.extend_from_slice(&self.irq.flag.to_le_bytes());
        buf
    }

    /// Restore state written by [`Cpu::to_bytes`]. `id` is not part of the
    /// payload; the caller keeps loading into the CPU it already owns.
    pub fn restore(&mut self, r: &mut crate::savestate::Reader) {
        for slot in self.r.iter_mut() {
            *slot = r.u32();
        }
        self.cpsr = Psr(r.u32());
        for slot in self.fiq_bank.r8_12.iter_mut() {
            *slot = r.u32();
        }
        self.fiq_bank.r13 = r.u32();
        self.fiq_bank.r14 = r.u32();
        self.fiq_bank.spsr = r.u32();
        for bank in [&mut self.irq_bank, &mut self.svc_bank, &mut self.abt_bank, &mut self.und_bank] {
            bank.r13 = r.u32();
            bank.r14 = r.u32();
            bank.spsr = r.u32();
        }
        self.next_instr[0] = r.u32();
        self.next_instr[1] = r.u32();
        self.exception_base = r.u32();
        self.halt = match r.u8() {
            1 => HaltState::HaltedUntilIrq,
            2 => HaltState::HaltedOnePulse,
            _ => HaltState::Running,
        };
        self.irq.master_enable = r.bool();
        self.irq.enable = r.u32();
        self.irq.flag = r.u32();
    }
}

#[cfg(test)]
mod psr_tests {
    use super::*;

    #[test]
    fn mode_bank_swap_is_reversible() {
        let mut cpu = Cpu::new(CpuId::A);
        cpu.r[13] = 0x1111;
        cpu.r[14] = 0x2222;
        cpu.update_mode(Mode::Supervisor.bits(), Mode::Irq.bits());
        cpu.r[13] = 0x3333;
        cpu.r[14] = 0x4444;
        cpu.update_mode(Mode::Irq.bits(), Mode::Supervisor.bits());
        assert_eq!(cpu.r[13], 0x1111);
        assert_eq!(cpu.r[14], 0x2222);
        cpu.update_mode(Mode::Supervisor.bits(), Mode::Irq.bits());
        assert_eq!(cpu.r[13], 0x3333);
        assert_eq!(cpu.r[14], 0x4444);
    }

    #[test]
    fn same_mode_transition_is_noop() {
        let mut cpu = Cpu::new(CpuId::A);
        cpu.r[13] = 0xAAAA;
        cpu.update_mode(Mode::User.bits(), Mode::User.bits());
        assert_eq!(cpu.r[13], 0xAAAA);
    }

    #[test]
    fn reset_vector_matches_spec_scenario_1() {
        let mut bus = Bus::new();
        bus.arm9_exception_base = 0xFFFF0000;
        let mut cpu = Cpu::new(CpuId::A);
        cpu.reset(&mut bus);
        assert_eq!(cpu.pc(), 0xFFFF0008);
        assert_eq!(cpu.cpsr.0 & 0xFF, 0xD3);
    }
}
