//! Barrel-shifter variants used by data-processing and single-transfer
//! addressing modes.
//!
//! ARM's shifter has eleven distinct cases once you split LSL/LSR/ASR/ROR
//! across immediate vs register shift amounts, plus RRX and the
//! shift-by-32-or-more special meanings -- all grounded on the emulated
//! CPU's own shifter macros.

/// A shifted value paired with the carry-out it produces, for instructions
/// that fold the shifter carry into the result flags.
#[derive(Debug, Clone, Copy)]
pub struct Shifted {
    pub value: u32,
    pub carry: ShifterCarry,
}

/// Whether a shift produced a meaningful carry-out. `Unchanged` covers the
/// register-shift-by-zero and LSL-by-register-with-amount-0 cases, where C
/// is left as-is rather than recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShifterCarry {
    Unchanged,
    Out(bool),
}

impl ShifterCarry {
    pub fn resolve(self, old_c: bool) -> bool {
        match self {
            ShifterCarry::Unchanged => old_c,
            ShifterCarry::Out(c) => c,
        }
    }
}

/// `LSL #imm`. `imm == 0` is the identity shift (carry unchanged).
pub fn lsl_imm(value: u32, imm: u32) -> Shifted {
    if imm == 0 {
        return Shifted { value, carry: ShifterCarry::Unchanged };
    }
    let carry = if imm <= 32 { (value >> (32 - imm)) & 1 != 0 } else { false };
    let shifted = if imm >= 32 { 0 } else { value << imm };
    Shifted { value: shifted, carry: ShifterCarry::Out(carry) }
}

/// `LSR #imm`. `imm == 0` in the encoding means "shift by 32".
pub fn lsr_imm(value: u32, imm: u32) -> Shifted {
    let imm = if imm == 0 { 32 } else { imm };
    let carry = if imm <= 32 { (value >> (imm - 1)) & 1 != 0 } else { false };
    let shifted = if imm >= 32 { 0 } else { value >> imm };
    Shifted { value: shifted, carry: ShifterCarry::Out(carry) }
}

/// `ASR #imm`. `imm == 0` means "shift by 32" (result is 0 or all-ones,
/// sign-extended).
pub fn asr_imm(value: u32, imm: u32) -> Shifted {
    let imm = if imm == 0 { 32 } else { imm };
    if imm >= 32 {
        let carry = value & 0x8000_0000 != 0;
        let shifted = if carry { 0xFFFF_FFFF } else { 0 };
        Shifted { value: shifted, carry: ShifterCarry::Out(carry) }
    } else {
        let carry = (value >> (imm - 1)) & 1 != 0;
        Shifted { value: (value as i32 >> imm) as u32, carry: ShifterCarry::Out(carry) }
    }
}

/// `ROR #imm`. `imm == 0` on the immediate form means RRX (rotate through
/// carry by one bit), not "rotate by 32".
pub fn ror_imm(value: u32, imm: u32, carry_in: bool) -> Shifted {
    if imm == 0 {
        let carry = value & 1 != 0;
        let shifted = (value >> 1) | ((carry_in as u32) << 31);
        return Shifted { value: shifted, carry: ShifterCarry::Out(carry) };
    }
    let amount = imm & 0x1F;
    let shifted = value.rotate_right(amount);
    let carry = if amount == 0 {
        value & 0x8000_0000 != 0
    } else {
        (value >> (amount - 1)) & 1 != 0
    };
    Shifted { value: shifted, carry: ShifterCarry::Out(carry) }
}

/// Register-specified shift amount (bottom byte of a register). All four
/// shift kinds share the "amount == 0 leaves C unchanged" rule, and the
/// immediate-form special cases (RRX, shift-by-32) do not apply here.
pub fn lsl_reg(value: u32, amount: u32) -> Shifted {
    match amount {
        0 => Shifted { value, carry: ShifterCarry::Unchanged },
        1..=31 => {
            let carry = (value >> (32 - amount)) & 1 != 0;
            Shifted { value: value << amount, carry: ShifterCarry::Out(carry) }
        }
        32 => Shifted { value: 0, carry: ShifterCarry::Out(value & 1 != 0) },
        _ => Shifted { value: 0, carry: ShifterCarry::Out(false) },
    }
}

pub fn lsr_reg(value: u32, amount: u32) -> Shifted {
    match amount {
        0 => Shifted { value, carry: ShifterCarry::Unchanged },
        1..=31 => {
            let carry = (value >> (amount - 1)) & 1 != 0;
            Shifted { value: value >> amount, carry: ShifterCarry::Out(carry) }
        }
        32 => Shifted { value: 0, carry: ShifterCarry::Out(value & 0x8000_0000 != 0) },
        _ => Shifted { value: 0, carry: ShifterCarry::Out(false) },
    }
}

pub fn asr_reg(value: u32, amount: u32) -> Shifted {
    match amount {
        0 => Shifted { value, carry: ShifterCarry::Unchanged },
        1..=31 => {
            let carry = (value >> (amount - 1)) & 1 != 0;
            Shifted { value: (value as i32 >> amount) as u32, carry: ShifterCarry::Out(carry) }
        }
        _ => {
            let carry = value & 0x8000_0000 != 0;
            let shifted = if carry { 0xFFFF_FFFF } else { 0 };
            Shifted { value: shifted, carry: ShifterCarry::Out(carry) }
        }
    }
}

pub fn ror_reg(value: u32, amount: u32) -> Shifted {
    if amount == 0 {
        return Shifted { value, carry: ShifterCarry::Unchanged };
    }
    let bits = amount & 0x1F;
    if bits == 0 {
        Shifted { value, carry: ShifterCarry::Out(value & 0x8000_0000 != 0) }
    } else {
        let shifted = value.rotate_right(bits);
        let carry = (value >> (bits - 1)) & 1 != 0;
        Shifted { value: shifted, carry: ShifterCarry::Out(carry) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsl_by_32_yields_zero_with_carry_from_bit0() {
        let s = lsl_reg(0b1, 32);
        assert_eq!(s.value, 0);
        assert_eq!(s.carry, ShifterCarry::Out(true));
    }

    #[test]
    fn lsl_imm_zero_is_identity_and_leaves_carry() {
        let s = lsl_imm(0x1234, 0);
        assert_eq!(s.value, 0x1234);
        assert_eq!(s.carry, ShifterCarry::Unchanged);
    }

    #[test]
    fn lsr_imm_zero_means_shift_by_32() {
        let s = lsr_imm(0x8000_0000, 0);
        assert_eq!(s.value, 0);
        assert_eq!(s.carry, ShifterCarry::Out(true));
    }

    #[test]
    fn asr_imm_zero_sign_extends_fully() {
        let s = asr_imm(0x8000_0000, 0);
        assert_eq!(s.value, 0xFFFF_FFFF);
        assert_eq!(s.carry, ShifterCarry::Out(true));

        let s = asr_imm(0x7FFF_FFFF, 0);
        assert_eq!(s.value, 0);
        assert_eq!(s.carry, ShifterCarry::Out(false));
    }

    #[test]
    fn ror_imm_zero_is_rrx() {
        let s = ror_imm(0b10, 0, true);
        assert_eq!(s.value, 0x8000_0001);
        assert_eq!(s.carry, ShifterCarry::Out(false));
    }

    #[test]
    fn ror_reg_by_zero_leaves_carry_unchanged() {
        let s = ror_reg(0x1234_5678, 0);
        assert_eq!(s.carry, ShifterCarry::Unchanged);
    }
}
