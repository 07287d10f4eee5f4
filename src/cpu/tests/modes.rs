use crate::bus::{Bus, CpuId};
use crate::cpu::{Cpu, Mode};

#[test]
fn fiq_bank_swap_preserves_r8_through_r14() {
    let mut cpu = Cpu::new(CpuId::A);
    for i in 8..15 {
        cpu.r[i] = i as u32 * 0x1000;
    }
    cpu.update_mode(Mode::System.bits(), Mode::Fiq.bits());
    for i in 8..15 {
        cpu.r[i] = 0xFFFF_FFFF;
    }
    cpu.update_mode(Mode::Fiq.bits(), Mode::System.bits());
    for i in 8..15 {
        assert_eq!(cpu.r[i], i as u32 * 0x1000, "r{i} not restored after FIQ bank exit");
    }
}

#[test]
fn irq_entry_masks_irq_and_saves_spsr() {
    let mut bus = Bus::new();
    bus.arm9_exception_base = 0;
    let mut cpu = Cpu::new(CpuId::A);
    cpu.reset(&mut bus);
    cpu.cpsr.set_irq_disabled(false);
    let old_cpsr = cpu.cpsr;
    cpu.irq.master_enable = true;
    cpu.irq.enable = 1;
    cpu.irq.flag = 1;

    cpu.execute(&mut bus, &mut crate::scheduler::Scheduler::new(), 1);

    assert!(cpu.cpsr.irq_disabled());
    assert_eq!(cpu.spsr(Mode::Irq.bits()), Some(old_cpsr.0));
    assert_eq!(cpu.pc(), 0x18 + 8);
}

#[test]
fn svc_and_irq_banks_are_independent() {
    let mut cpu = Cpu::new(CpuId::A);
    cpu.update_mode(Mode::System.bits(), Mode::Supervisor.bits());
    cpu.r[13] = 0xAAAA;
    cpu.update_mode(Mode::Supervisor.bits(), Mode::Irq.bits());
    cpu.r[13] = 0xBBBB;
    cpu.update_mode(Mode::Irq.bits(), Mode::Supervisor.bits());
    assert_eq!(cpu.r[13], 0xAAAA);
}

#[test]
fn halt_until_irq_consumes_full_slice_then_resumes() {
    let mut bus = Bus::new();
    let mut cpu = Cpu::new(CpuId::A);
    cpu.reset(&mut bus);
    cpu.halt_until_irq();
    let mut sched = crate::scheduler::Scheduler::new();

    let consumed = cpu.execute(&mut bus, &mut sched, 100);
    assert_eq!(consumed, 100);

    cpu.irq.master_enable = true;
    cpu.irq.enable = 1;
    cpu.irq.flag = 1;
    cpu.cpsr.set_irq_disabled(false);
    cpu.execute(&mut bus, &mut sched, 1);
    assert_eq!(cpu.cpsr.mode(), Mode::Irq.bits());
}
