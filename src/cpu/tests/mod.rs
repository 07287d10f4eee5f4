mod instructions;
mod modes;

use crate::bus::{Bus, CpuId};
use crate::cpu::Cpu;

/// Build a CPU+Bus pair with `program` written to main RAM at
/// `0x02000000` and the CPU jumped there in ARM state.
pub fn harness(program: &[u32]) -> (Cpu, Bus) {
    let mut bus = Bus::new();
    for (i, word) in program.iter().enumerate() {
        bus.write32(CpuId::A, 0x02000000 + (i as u32) * 4, *word);
    }
    let mut cpu = Cpu::new(CpuId::A);
    cpu.jump_to(&mut bus, 0x02000000, false);
    (cpu, bus)
}

/// Run exactly `n` instructions. A slice budget of 1 cycle is enough:
/// every instruction consumes at least one cycle, so `execute` returns
/// after the first one runs.
pub fn step(cpu: &mut Cpu, bus: &mut Bus, scheduler: &mut crate::scheduler::Scheduler, n: usize) {
    for _ in 0..n {
        cpu.execute(bus, scheduler, 1);
    }
}

/// Like [`harness`], but writes a Thumb program and enters Thumb state.
pub fn harness_thumb(program: &[u16]) -> (Cpu, Bus) {
    let mut bus = Bus::new();
    for (i, half) in program.iter().enumerate() {
        bus.write16(CpuId::A, 0x02000000 + (i as u32) * 2, *half);
    }
    let mut cpu = Cpu::new(CpuId::A);
    cpu.jump_to(&mut bus, 0x02000001, false);
    (cpu, bus)
}
