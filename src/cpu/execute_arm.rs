//! ARM-state instruction execution.
//!
//! `dispatch` classifies an already condition-passed instruction word by
//! its top-level bit groups and executes it in place. Flag-setting ALU ops
//! and load/store addressing follow the emulated CPU's own
//! `ARMInterpreter_ALU.cpp`/`ARMInterpreter_LoadStore.cpp` semantics;
//! anything outside the subset this core supports is logged and treated as
//! a one-cycle no-op rather than panicking, since an unimplemented opcode
//! must never bring down the frame loop.

use super::decode_arm::{bit, bits, block_transfer_fields, data_proc_fields, single_transfer_fields};
use super::shifter::{self, Shifted, ShifterCarry};
use super::{Cpu, Mode};
use crate::bus::Bus;

pub fn dispatch(cpu: &mut Cpu, bus: &mut Bus, instr: u32) -> i64 {
    // Block data transfer: 100P U S W L
    if bits(instr, 27, 25) == 0b100 {
        return block_transfer(cpu, bus, instr);
    }
    // Branch: 101 L
    if bits(instr, 27, 25) == 0b101 {
        return branch(cpu, bus, instr);
    }
    // Branch and exchange: BX/BLX(reg)
    if bits(instr, 27, 4) == 0b0001_0010_1111_1111_1111_0001 {
        return bx(cpu, bus, instr, false);
    }
    if bits(instr, 27, 4) == 0b0001_0010_1111_1111_1111_0011 {
        return bx(cpu, bus, instr, true);
    }
    // Single data swap: SWP/SWPB
    if bits(instr, 27, 23) == 0b00010 && bits(instr, 21, 20) == 0b00 && bits(instr, 11, 4) == 0b0000_1001 {
        return swp(cpu, bus, instr);
    }
    // Multiply / multiply-long
    if bits(instr, 27, 22) == 0 && bits(instr, 7, 4) == 0b1001 {
        return multiply(cpu, instr);
    }
    // Halfword/signed data transfer: 000 P U I W L ... 1SH1
    if bits(instr, 27, 25) == 0b000 && bit(instr, 7) && bit(instr, 4) && bits(instr, 6, 5) != 0 {
        return halfword_transfer(cpu, bus, instr);
    }
    // MRS/MSR
    if bits(instr, 27, 23) == 0b00010 && bits(instr, 21, 20) == 0b10 {
        return if bit(instr, 21) { msr(cpu, instr) } else { mrs(cpu, instr) };
    }
    if bits(instr, 27, 26) == 0b00 && bits(instr, 24, 23) == 0b10 && bits(instr, 21, 20) == 0b10 {
        return msr(cpu, instr);
    }
    // Single data transfer: LDR/STR(B)
    if bits(instr, 27, 26) == 0b01 {
        return single_transfer(cpu, bus, instr);
    }
    // Software interrupt
    if bits(instr, 27, 24) == 0b1111 {
        return software_interrupt(cpu, bus);
    }
    // Coprocessor register transfer (MCR/MRC) -- CPU A's TCM/cache control.
    if bits(instr, 27, 24) == 0b1110 && bit(instr, 4) {
        return coprocessor_transfer(cpu, bus, instr);
    }
    // Data processing (fallthrough: 00 ...)
    if bits(instr, 27, 26) == 0b00 {
        return data_processing(cpu, bus, instr);
    }

    log::warn!("undefined ARM instruction {:#010x} at {:#010x}", instr, cpu.pc().wrapping_sub(8));
    1
}

fn operand2(cpu: &Cpu, fields_immediate: bool, operand2: u32, update_carry: bool) -> (u32, ShifterCarry) {
    if fields_immediate {
        let rotate = bits(operand2, 11, 8) * 2;
        let imm = operand2 & 0xFF;
        let shifted = imm.rotate_right(rotate);
        let carry = if rotate == 0 { ShifterCarry::Unchanged } else { ShifterCarry::Out(shifted & 0x8000_0000 != 0) };
        (shifted, carry)
    } else {
        let rm = cpu.r[(operand2 & 0xF) as usize];
        let shift_type = bits(operand2, 6, 5);
        let by_register = bit(operand2, 4);
        let amount = if by_register {
            cpu.r[bits(operand2, 11, 8) as usize] & 0xFF
        } else {
            bits(operand2, 11, 7)
        };
        // PC as Rm reads as PC+12 when the shift amount comes from a
        // register (one extra pipeline stage of skew).
        let rm = if (operand2 & 0xF) == 15 && by_register { rm.wrapping_add(4) } else { rm };

        let Shifted { value, carry } = if by_register {
            match shift_type {
                0 => shifter::lsl_reg(rm, amount),
                1 => shifter::lsr_reg(rm, amount),
                2 => shifter::asr_reg(rm, amount),
                _ => shifter::ror_reg(rm, amount),
            }
        } else {
            match shift_type {
                0 => shifter::lsl_imm(rm, amount),
                1 => shifter::lsr_imm(rm, amount),
                2 => shifter::asr_imm(rm, amount),
                _ => shifter::ror_imm(rm, amount, cpu.cpsr.c()),
            }
        };
        let _ = update_carry;
        (value, carry)
    }
}

fn data_processing(cpu: &mut Cpu, bus: &mut Bus, instr: u32) -> i64 {
    let f = data_proc_fields(instr);
    let (op2, shifter_carry) = operand2(cpu, f.immediate, f.operand2, f.set_flags);
    // r[15] already reads as the instruction's address + 8 during dispatch
    // (see the entry/exit invariant documented on `Cpu::step_arm`); no
    // further bias is needed here.
    let rn_val = cpu.r[f.rn];

    let old_c = cpu.cpsr.c();
    let carry_in = shifter_carry.resolve(old_c);

    let (result, write_result, carry_out, overflow) = match f.opcode {
        0x0 => (rn_val & op2, true, carry_in, cpu.cpsr.v()), // AND
        0x1 => (rn_val ^ op2, true, carry_in, cpu.cpsr.v()), // EOR
        0x2 => sub_with_flags(rn_val, op2),                  // SUB
        0x3 => sub_with_flags(op2, rn_val),                  // RSB
        0x4 => add_with_flags(rn_val, op2),                  // ADD
        0x5 => adc_with_flags(rn_val, op2, old_c),           // ADC
        0x6 => sbc_with_flags(rn_val, op2, old_c),           // SBC
        0x7 => sbc_with_flags(op2, rn_val, old_c),           // RSC
        0x8 => {
            let (_, _, c, v) = sub_with_flags(0, 0);
            let _ = (c, v);
            let r = rn_val & op2;
            return finish_test(cpu, r, carry_in, cpu.cpsr.v());
        }
        0x9 => {
            let r = rn_val ^ op2;
            return finish_test(cpu, r, carry_in, cpu.cpsr.v());
        }
        0xA => {
            let (r, _, c, v) = sub_with_flags(rn_val, op2);
            return finish_test(cpu, r, c, v);
        }
        0xB => {
            let (r, _, c, v) = add_with_flags(rn_val, op2);
            return finish_test(cpu, r, c, v);
        }
        0xC => (rn_val | op2, true, carry_in, cpu.cpsr.v()), // ORR
        0xD => (op2, true, carry_in, cpu.cpsr.v()),          // MOV
        0xE => (rn_val & !op2, true, carry_in, cpu.cpsr.v()), // BIC
        0xF => (!op2, true, carry_in, cpu.cpsr.v()),          // MVN
        _ => unreachable!(),
    };

    if write_result {
        if f.rd == 15 {
            // A write to r15 always refills the pipeline (§4.3 "ALU"); this
            // is the MOVS PC,LR / SUBS PC,LR,#4 exception-return idiom and
            // the ADD PC,PC,Rm jump-table idiom, so it must go through
            // `jump_to` like every other branch, not a bare register write.
            cpu.jump_to(bus, result, f.set_flags);
            return 3;
        }
        cpu.r[f.rd] = result;
        if f.set_flags {
            cpu.cpsr.set_nzcv(result & 0x8000_0000 != 0, result == 0, carry_out, overflow);
        }
    }
    1
}

fn finish_test(cpu: &mut Cpu, result: u32, carry: bool, overflow: bool) -> i64 {
    cpu.cpsr.set_nzcv(result & 0x8000_0000 != 0, result == 0, carry, overflow);
    1
}

fn add_with_flags(a: u32, b: u32) -> (u32, bool, bool, bool) {
    let (result, carry) = a.overflowing_add(b);
    let overflow = ((a ^ result) & (b ^ result)) & 0x8000_0000 != 0;
    (result, true, carry, overflow)
}

fn adc_with_flags(a: u32, b: u32, c_in: bool) -> (u32, bool, bool, bool) {
    let (r1, c1) = a.overflowing_add(b);
    let (result, c2) = r1.overflowing_add(c_in as u32);
    let overflow = ((a ^ result) & (b ^ result)) & 0x8000_0000 != 0;
    (result, true, c1 || c2, overflow)
}

fn sub_with_flags(a: u32, b: u32) -> (u32, bool, bool, bool) {
    let (result, borrow) = a.overflowing_sub(b);
    let overflow = ((a ^ b) & (a ^ result)) & 0x8000_0000 != 0;
    (result, true, !borrow, overflow)
}

fn sbc_with_flags(a: u32, b: u32, c_in: bool) -> (u32, bool, bool, bool) {
    let borrow_in = !c_in as u32;
    let (r1, b1) = a.overflowing_sub(b);
    let (result, b2) = r1.overflowing_sub(borrow_in);
    let overflow = ((a ^ b) & (a ^ result)) & 0x8000_0000 != 0;
    (result, true, !(b1 || b2), overflow)
}

fn branch(cpu: &mut Cpu, bus: &mut Bus, instr: u32) -> i64 {
    let link = bit(instr, 24);
    let offset24 = bits(instr, 23, 0);
    let signed = ((offset24 << 8) as i32) >> 8;
    let target = cpu.r[15].wrapping_add((signed << 2) as u32);
    if link {
        cpu.r[14] = cpu.r[15].wrapping_sub(4);
    }
    cpu.jump_to(bus, target, false);
    3
}

pub fn blx_imm(cpu: &mut Cpu, bus: &mut Bus, instr: u32) -> i64 {
    let h = bit(instr, 24) as u32;
    let offset24 = bits(instr, 23, 0);
    let signed = ((offset24 << 8) as i32) >> 8;
    let target = cpu
        .r[15]
        .wrapping_add(((signed << 2) as u32).wrapping_add(h << 1));
    cpu.r[14] = cpu.r[15].wrapping_sub(4);
    cpu.cpsr.set_thumb(true);
    cpu.jump_to(bus, target | 1, false);
    3
}

fn bx(cpu: &mut Cpu, bus: &mut Bus, instr: u32, link: bool) -> i64 {
    let rm = bits(instr, 3, 0) as usize;
    let target = cpu.r[rm];
    if link {
        cpu.r[14] = cpu.r[15].wrapping_sub(4);
    }
    cpu.jump_to(bus, target, false);
    3
}

fn single_transfer(cpu: &mut Cpu, bus: &mut Bus, instr: u32) -> i64 {
    let f = single_transfer_fields(instr);
    let base = cpu.r[f.rn];

    let offset = if f.register_offset {
        let rm = bits(f.offset, 3, 0) as usize;
        let shift_type = bits(f.offset, 6, 5);
        let amount = bits(f.offset, 11, 7);
        let Shifted { value, .. } = match shift_type {
            0 => shifter::lsl_imm(cpu.r[rm], amount),
            1 => shifter::lsr_imm(cpu.r[rm], amount),
            2 => shifter::asr_imm(cpu.r[rm], amount),
            _ => shifter::ror_imm(cpu.r[rm], amount, cpu.cpsr.c()),
        };
        value
    } else {
        f.offset
    };

    let offset_addr = if f.up { base.wrapping_add(offset) } else { base.wrapping_sub(offset) };
    let addr = if f.pre_index { offset_addr } else { base };

    if f.is_load {
        let value = if f.byte {
            bus.read8(cpu.id, addr) as u32
        } else {
            bus.read32(cpu.id, addr).rotate_right((addr & 3) * 8)
        };
        if !f.pre_index || f.writeback {
            cpu.r[f.rn] = offset_addr;
        }
        if f.rd == 15 {
            cpu.jump_to(bus, value, false);
            return 5;
        }
        cpu.r[f.rd] = value;
        3
    } else {
        // Storing R15 is a deprecated, implementation-defined case on real
        // hardware (PC+8 vs PC+12 depending on core revision); this model
        // always stores the plain PC value.
        let value = cpu.r[f.rd];
        if f.byte {
            bus.write8(cpu.id, addr, value as u8);
        } else {
            bus.write32(cpu.id, addr & !3, value);
        }
        if !f.pre_index || f.writeback {
            cpu.r[f.rn] = offset_addr;
        }
        2
    }
}

fn halfword_transfer(cpu: &mut Cpu, bus: &mut Bus, instr: u32) -> i64 {
    let is_load = bit(instr, 20);
    let writeback = bit(instr, 21);
    let immediate_offset = bit(instr, 22);
    let up = bit(instr, 23);
    let pre_index = bit(instr, 24);
    let rn = bits(instr, 19, 16) as usize;
    let rd = bits(instr, 15, 12) as usize;
    let sh = bits(instr, 6, 5);

    let offset = if immediate_offset {
        (bits(instr, 11, 8) << 4) | bits(instr, 3, 0)
    } else {
        cpu.r[bits(instr, 3, 0) as usize]
    };

    let base = cpu.r[rn];
    let offset_addr = if up { base.wrapping_add(offset) } else { base.wrapping_sub(offset) };
    let addr = if pre_index { offset_addr } else { base };

    if is_load {
        let value = match sh {
            0b01 => bus.read16(cpu.id, addr) as u32,
            0b10 => (bus.read8(cpu.id, addr) as i8) as i32 as u32,
            0b11 => (bus.read16(cpu.id, addr) as i16) as i32 as u32,
            _ => bus.read16(cpu.id, addr) as u32,
        };
        cpu.r[rd] = value;
    } else {
        bus.write16(cpu.id, addr, cpu.r[rd] as u16);
    }
    if !pre_index || writeback {
        cpu.r[rn] = offset_addr;
    }
    3
}

fn block_transfer(cpu: &mut Cpu, bus: &mut Bus, instr: u32) -> i64 {
    let f = block_transfer_fields(instr);
    let count = f.reg_list.count_ones().max(1) as u32;
    let base = cpu.r[f.rn];

    let start = if f.up { base } else { base.wrapping_sub(count * 4) };
    let start = if f.pre_index == f.up { start.wrapping_add(4) } else { start };

    // User-bank transfer (S-bit set, no ^PC writeback case): falls back to
    // the currently live registers here -- this core does not model a
    // distinct "force user mode" register view, which matters only for an
    // LDM/STM executed from a non-User mode with the S-bit set and r15 not
    // in the list.
    if f.s_bit {
        log::trace!("block transfer with S-bit set; using live bank (no forced-user-mode view)");
    }

    let mut addr = start;
    // Rank rule (§4.3 "Loads/stores", DESIGN.md): when the base is in the
    // load list, writeback only happens if the base is the *lowest-numbered*
    // register in the list -- not "suppressed whenever the base is loaded at
    // all". A lower-numbered register in the list always loads before the
    // base would, so this is equivalent to "the base is the first register
    // transferred".
    let lowest_in_list = f.reg_list.trailing_zeros() as usize;
    let base_in_list = f.reg_list & (1 << f.rn) != 0;
    let suppress_writeback = f.is_load && base_in_list && f.rn != lowest_in_list;

    for reg in 0..16u32 {
        if f.reg_list & (1 << reg) == 0 {
            continue;
        }
        if f.is_load {
            let value = bus.read32(cpu.id, addr);
            if reg as usize == 15 {
                cpu.jump_to(bus, value, f.s_bit);
            } else {
                cpu.r[reg as usize] = value;
            }
        } else {
            bus.write32(cpu.id, addr, cpu.r[reg as usize]);
        }
        addr = addr.wrapping_add(4);
    }

    let final_rn = if f.up { base.wrapping_add(count * 4) } else { base.wrapping_sub(count * 4) };

    if f.writeback && !suppress_writeback {
        cpu.r[f.rn] = final_rn;
    }

    2 + count as i64
}

fn swp(cpu: &mut Cpu, bus: &mut Bus, instr: u32) -> i64 {
    let byte = bit(instr, 22);
    let rn = bits(instr, 19, 16) as usize;
    let rd = bits(instr, 15, 12) as usize;
    let rm = bits(instr, 3, 0) as usize;
    let addr = cpu.r[rn];

    if byte {
        let old = bus.read8(cpu.id, addr);
        bus.write8(cpu.id, addr, cpu.r[rm] as u8);
        cpu.r[rd] = old as u32;
    } else {
        let old = bus.read32(cpu.id, addr).rotate_right((addr & 3) * 8);
        bus.write32(cpu.id, addr & !3, cpu.r[rm]);
        cpu.r[rd] = old;
    }
    4
}

fn multiply(cpu: &mut Cpu, instr: u32) -> i64 {
    let accumulate = bit(instr, 21);
    let set_flags = bit(instr, 20);
    let long_mul = bit(instr, 23);
    let signed = bit(instr, 22);

    if long_mul {
        let rdhi = bits(instr, 19, 16) as usize;
        let rdlo = bits(instr, 15, 12) as usize;
        let rs = bits(instr, 11, 8) as usize;
        let rm = bits(instr, 3, 0) as usize;
        let product: i64 = if signed {
            (cpu.r[rm] as i32 as i64) * (cpu.r[rs] as i32 as i64)
        } else {
            (cpu.r[rm] as u64 as i64) * (cpu.r[rs] as u64 as i64)
        };
        let product = if accumulate {
            product.wrapping_add(((cpu.r[rdhi] as u64) << 32 | cpu.r[rdlo] as u64) as i64)
        } else {
            product
        };
        cpu.r[rdlo] = product as u32;
        cpu.r[rdhi] = (product >> 32) as u32;
        if set_flags {
            cpu.cpsr.set_nz(product < 0, product == 0);
        }
        4
    } else {
        let rd = bits(instr, 19, 16) as usize;
        let rs = bits(instr, 11, 8) as usize;
        let rn = bits(instr, 15, 12) as usize;
        let rm = bits(instr, 3, 0) as usize;
        let mut result = cpu.r[rm].wrapping_mul(cpu.r[rs]);
        if accumulate {
            result = result.wrapping_add(cpu.r[rn]);
        }
        cpu.r[rd] = result;
        if set_flags {
            cpu.cpsr.set_nz(result & 0x8000_0000 != 0, result == 0);
        }
        2
    }
}

fn mrs(cpu: &mut Cpu, instr: u32) -> i64 {
    let from_spsr = bit(instr, 22);
    let rd = bits(instr, 15, 12) as usize;
    cpu.r[rd] = if from_spsr {
        cpu.spsr(cpu.cpsr.mode()).unwrap_or(cpu.cpsr.0)
    } else {
        cpu.cpsr.0
    };
    1
}

fn msr(cpu: &mut Cpu, instr: u32) -> i64 {
    let to_spsr = bit(instr, 22);
    let write_flags = bit(instr, 19);
    let write_control = bit(instr, 16) && Mode::from_bits(cpu.cpsr.mode()).map(Mode::is_privileged).unwrap_or(false);
    let immediate = bit(instr, 25);

    let value = if immediate {
        let rotate = bits(instr, 11, 8) * 2;
        (bits(instr, 7, 0)).rotate_right(rotate)
    } else {
        cpu.r[bits(instr, 3, 0) as usize]
    };

    let mut mask = 0u32;
    if write_flags {
        mask |= 0xFF00_0000;
    }
    if write_control {
        mask |= 0x0000_00FF;
    }

    if to_spsr {
        let mode = cpu.cpsr.mode();
        if let Some(spsr) = cpu.spsr(mode) {
            let new = (spsr & !mask) | (value & mask);
            cpu.set_spsr(new);
        }
    } else {
        let old_mode = cpu.cpsr.mode();
        let new_raw = (cpu.cpsr.0 & !mask) | (value & mask);
        cpu.cpsr.0 = new_raw;
        if write_control {
            cpu.update_mode(old_mode, cpu.cpsr.mode());
        }
    }
    1
}

fn software_interrupt(cpu: &mut Cpu, bus: &mut Bus) -> i64 {
    let old = cpu.cpsr;
    let lr = cpu.r[15].wrapping_sub(4);
    cpu.cpsr.0 = (cpu.cpsr.0 & !0xFF) | 0xD3; // Supervisor, IRQ masked, ARM
    cpu.update_mode(old.mode(), cpu.cpsr.mode());
    cpu.set_spsr(old.0);
    cpu.r[14] = lr;
    cpu.jump_to(bus, cpu.exception_base.wrapping_add(0x08), false);
    3
}

/// Minimal coprocessor interface: CPU A's CP15 TCM-control and cache
/// registers, and the halt request (CP15 register used as the hardware's
/// "enter low power until IRQ" port). Any other coprocessor register is
/// logged and ignored; this core does not emulate cache behavior.
fn coprocessor_transfer(cpu: &mut Cpu, bus: &mut Bus, instr: u32) -> i64 {
    let to_coprocessor = !bit(instr, 20);
    let crn = bits(instr, 19, 16);
    let rd = bits(instr, 15, 12) as usize;
    let crm = bits(instr, 3, 0);
    let opcode2 = bits(instr, 7, 5);

    if !to_coprocessor {
        cpu.r[rd] = 0;
        return 2;
    }

    let value = cpu.r[rd];
    match (crn, crm, opcode2) {
        // Control register: bit 7 = ITCM load mode, etc. Only the bits this
        // core models (ITCM/DTCM enable) are applied.
        (1, 0, 0) => {
            bus.tcm.itcm_enabled = value & (1 << 18) != 0;
            bus.tcm.dtcm_enabled = value & (1 << 16) != 0;
        }
        (9, 1, 0) => {
            // DTCM base/size register.
            bus.tcm.dtcm_base = value & 0xFFFFF000;
            let size_shift = (value >> 1) & 0x1F;
            bus.tcm.dtcm_size = 0x200u32.checked_shl(size_shift).unwrap_or(0);
        }
        (9, 1, 1) => {
            let size_shift = (value >> 1) & 0x1F;
            bus.tcm.itcm_size = 0x200u32.checked_shl(size_shift).unwrap_or(0);
        }
        // "Wait for interrupt": halts until the next unmasked IRQ source
        // becomes pending (§4.3 "Halt").
        (7, 0, 4) => cpu.halt_until_irq(),
        _ => log::trace!("unhandled coprocessor write CRn={} CRm={} op2={}", crn, crm, opcode2),
    }
    2
}
