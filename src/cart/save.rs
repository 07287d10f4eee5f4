//! Auxiliary SPI save-memory state machine (§4.4).
//!
//! Covers the EEPROM/FLASH byte-at-a-time SPI protocol that the AUX-SPI
//! channel speaks directly, plus the NAND and homebrew-SD variants that are
//! instead driven by dedicated ROM-command opcodes routed here by the cart
//! slot.

/// Which save-memory chip, if any, is present behind the AUX-SPI channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveKind {
    None,
    /// EEPROM of 512 bytes or less: one address byte, RDLO/RDHI select halves.
    EepromSmall,
    /// EEPROM from 64 KiB to 1 MiB: two or three address bytes.
    EepromLarge,
    /// Multi-megabyte FLASH with page program and sector/page erase.
    Flash,
    /// NAND, staged through a 2 KiB buffer committed by ROM command.
    Nand,
    /// Homebrew SD card image, accessed in 512-byte sectors.
    HomebrewSd,
}

impl SaveKind {
    /// Pick a chip kind from a declared save-memory image size, the way a
    /// loader infers chip capacity from a save file's length.
    pub fn from_size(len: usize) -> SaveKind {
        match len {
            0 => SaveKind::None,
            1..=512 => SaveKind::EepromSmall,
            513..=0x10_0000 => SaveKind::EepromLarge,
            _ => SaveKind::Flash,
        }
    }

    fn addr_bytes(self, capacity: usize) -> usize {
        match self {
            SaveKind::EepromSmall => 1,
            SaveKind::EepromLarge if capacity <= 0x10000 => 2,
            SaveKind::EepromLarge => 3,
            SaveKind::Flash => 3,
            SaveKind::Nand | SaveKind::HomebrewSd | SaveKind::None => 0,
        }
    }
}

mod opcode {
    pub const WREN: u8 = 0x06;
    pub const WRDI: u8 = 0x04;
    pub const WRLO: u8 = 0x02;
    pub const WRHI: u8 = 0x0A;
    pub const RDLO: u8 = 0x03;
    pub const RDHI: u8 = 0x0B;
    pub const RDSR: u8 = 0x05;
    pub const WRSR: u8 = 0x01;
    pub const RDJEDEC: u8 = 0x9F;
    pub const FAST_READ: u8 = 0x0B;
    pub const SECTOR_ERASE: u8 = 0xD8;
    pub const PAGE_ERASE: u8 = 0xDB;
}

const STATUS_WEL: u8 = 1 << 1;
const STATUS_WIP: u8 = 1 << 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Command,
    Address { cmd: u8, addr: u32, shift: u32 },
    DummyByte { cmd: u8, addr: u32 },
    ReadLoop { addr: u32 },
    WriteLoop { addr: u32 },
}

/// Half-select for the tiny/regular EEPROM WRLO/WRHI/RDLO/RDHI command set.
fn half_base(cmd: u8, capacity: usize) -> u32 {
    match cmd {
        opcode::WRHI | opcode::RDHI => (capacity / 2) as u32,
        _ => 0,
    }
}

pub struct SaveMemory {
    pub kind: SaveKind,
    data: Vec<u8>,
    status: u8,
    phase: Phase,
    /// Offset/length of bytes written since the last deselect, pending a
    /// flush to the host persistence callback.
    dirty: Option<(u32, u32)>,
    /// NAND 2 KiB staging area, committed on ROM command 0x82.
    nand_stage: Vec<u8>,
    nand_stage_addr: u32,
    /// Homebrew SD staging sector, served/filled word-by-word.
    sd_stage: [u8; 512],
    sd_stage_pos: usize,
}

impl SaveMemory {
    pub fn new(kind: SaveKind, data: Vec<u8>) -> SaveMemory {
        SaveMemory {
            kind,
            data,
            status: 0,
            phase: Phase::Idle,
            dirty: None,
            nand_stage: vec![0u8; 2048],
            nand_stage_addr: 0,
            sd_stage: [0u8; 512],
            sd_stage_pos: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn write_enabled(&self) -> bool {
        self.status & STATUS_WEL != 0
    }

    fn mark_dirty(&mut self, offset: u32, len: u32) {
        self.dirty = Some(match self.dirty {
            Some((o, l)) => {
                let lo = o.min(offset);
                let hi = (o + l).max(offset + len);
                (lo, hi - lo)
            }
            None => (offset, len),
        });
    }

    /// Called when the AUX-SPI hold bit drops while the chip was selected.
    /// Returns the pending write range for the host to persist, if any.
    pub fn deselect(&mut self) -> Option<(u32, u32)> {
        self.phase = Phase::Idle;
        self.dirty.take()
    }

    /// Exchange one byte over the SPI-framed EEPROM/FLASH protocol.
    /// Returns the byte shifted out (MISO) for this clock.
    pub fn spi_byte(&mut self, byte: u8) -> u8 {
        let addr_bytes = self.kind.addr_bytes(self.data.len());
        match self.phase {
            Phase::Idle | Phase::Command => {
                match byte {
                    opcode::WREN => {
                        self.status |= STATUS_WEL;
                        self.phase = Phase::Idle;
                    }
                    opcode::WRDI => {
                        self.status &= !STATUS_WEL;
                        self.phase = Phase::Idle;
                    }
                    opcode::RDSR => {
                        self.phase = Phase::ReadLoop { addr: u32::MAX };
                    }
                    opcode::WRSR => {
                        self.phase = Phase::Address {
                            cmd: byte,
                            addr: 0,
                            shift: 1,
                        };
                    }
                    opcode::RDJEDEC => {
                        self.phase = Phase::ReadLoop { addr: u32::MAX - 1 };
                    }
                    _ if addr_bytes > 0 => {
                        self.phase = Phase::Address {
                            cmd: byte,
                            addr: half_base(byte, self.data.len()),
                            shift: addr_bytes as u32,
                        };
                    }
                    _ => self.phase = Phase::Idle,
                }
                0xFF
            }
            Phase::Address { cmd, addr, shift } => {
                let addr = (addr << 8) | byte as u32;
                let shift = shift - 1;
                if shift == 0 {
                    if cmd == opcode::WRSR {
                        self.status = (self.status & !0xFC) | (addr as u8 & 0xFC);
                        self.phase = Phase::Idle;
                    } else if self.kind == SaveKind::Flash && cmd == opcode::FAST_READ {
                        self.phase = Phase::DummyByte { cmd, addr };
                    } else if matches!(cmd, opcode::RDLO | opcode::RDHI) {
                        self.phase = Phase::ReadLoop { addr };
                    } else if self.kind == SaveKind::Flash && cmd == opcode::SECTOR_ERASE {
                        self.erase(addr & !0xFFF, 0x1000);
                        self.phase = Phase::Idle;
                    } else if self.kind == SaveKind::Flash && cmd == opcode::PAGE_ERASE {
                        self.erase(addr & !0xFF, 0x100);
                        self.phase = Phase::Idle;
                    } else {
                        self.phase = Phase::WriteLoop { addr };
                    }
                } else {
                    self.phase = Phase::Address { cmd, addr, shift };
                }
                0xFF
            }
            Phase::DummyByte { addr, .. } => {
                self.phase = Phase::ReadLoop { addr };
                0xFF
            }
            Phase::ReadLoop { addr } => {
                let out = if addr == u32::MAX {
                    self.status
                } else if addr == u32::MAX - 1 {
                    0xFF
                } else if (addr as usize) < self.data.len() {
                    self.data[addr as usize]
                } else {
                    0xFF
                };
                if addr != u32::MAX && addr != u32::MAX - 1 {
                    self.phase = Phase::ReadLoop { addr: addr.wrapping_add(1) };
                }
                out
            }
            Phase::WriteLoop { addr } => {
                if self.write_enabled() && (addr as usize) < self.data.len() {
                    self.data[addr as usize] = byte;
                    self.mark_dirty(addr, 1);
                }
                self.phase = Phase::WriteLoop { addr: addr.wrapping_add(1) };
                0xFF
            }
        }
    }

    fn erase(&mut self, start: u32, len: u32) {
        if !self.write_enabled() {
            return;
        }
        let start = start as usize;
        let end = (start + len as usize).min(self.data.len());
        for b in &mut self.data[start..end] {
            *b = 0xFF;
        }
        self.mark_dirty(start as u32, (end - start) as u32);
    }

    /// NAND ROM command 0x81: buffer `bytes` at `addr` in the staging area.
    pub fn nand_stage_write(&mut self, addr: u32, bytes: &[u8]) {
        self.nand_stage_addr = addr;
        let n = bytes.len().min(self.nand_stage.len());
        self.nand_stage[..n].copy_from_slice(&bytes[..n]);
    }

    /// NAND ROM command 0x82: commit the staged page into the backing image.
    pub fn nand_commit(&mut self) {
        let start = self.nand_stage_addr as usize;
        let end = (start + self.nand_stage.len()).min(self.data.len());
        if end > start {
            let n = end - start;
            self.data[start..end].copy_from_slice(&self.nand_stage[..n]);
            self.mark_dirty(start as u32, n as u32);
        }
    }

    /// Homebrew SD ROM command 0xC0: read a 512-byte sector into the
    /// staging buffer, then serve it word-by-word.
    pub fn sd_read_sector(&mut self, sector: u32) {
        let start = (sector as usize) * 512;
        self.sd_stage = [0xFF; 512];
        if start + 512 <= self.data.len() {
            self.sd_stage.copy_from_slice(&self.data[start..start + 512]);
        }
        self.sd_stage_pos = 0;
    }

    pub fn sd_read_word(&mut self) -> u32 {
        let pos = self.sd_stage_pos.min(508);
        let word = u32::from_le_bytes(self.sd_stage[pos..pos + 4].try_into().unwrap());
        self.sd_stage_pos += 4;
        word
    }

    /// Homebrew SD ROM command 0xC1: write a previously staged 512-byte
    /// sector back to the image.
    pub fn sd_write_sector(&mut self, sector: u32) {
        let start = (sector as usize) * 512;
        let end = (start + 512).min(self.data.len());
        if end > start {
            let n = end - start;
            self.data[start..start + n].copy_from_slice(&self.sd_stage[..n]);
            self.mark_dirty(start as u32, n as u32);
        }
    }

    pub fn sd_write_word(&mut self, word: u32) {
        let pos = self.sd_stage_pos.min(508);
        self.sd_stage[pos..pos + 4].copy_from_slice(&word.to_le_bytes());
        self.sd_stage_pos += 4;
    }

    /// Encode `phase` as a one-byte tag followed by its fields, zero-padded
    /// to a fixed width so every variant serializes to the same length.
    fn phase_to_bytes(phase: Phase) -> [u8; 13] {
        let mut buf = [0u8; 13];
        match phase {
            Phase::Idle => buf[0] = 0,
            Phase::Command => buf[0] = 1,
            Phase::Address { cmd, addr, shift } => {
                buf[0] = 2;
                buf[1] = cmd;
                buf[5..9].copy_from_slice(&addr.to_le_bytes());
                buf[9..13].copy_from_slice(&shift.to_le_bytes());
            }
            Phase::DummyByte { cmd, addr } => {
                buf[0] = 3;
                buf[1] = cmd;
                buf[5..9].copy_from_slice(&addr.to_le_bytes());
            }
            Phase::ReadLoop { addr } => {
                buf[0] = 4;
                buf[1..5].copy_from_slice(&addr.to_le_bytes());
            }
            Phase::WriteLoop { addr } => {
                buf[0] = 5;
                buf[1..5].copy_from_slice(&addr.to_le_bytes());
            }
        }
        buf
    }

    fn phase_from_bytes(buf: &[u8]) -> Phase {
        let field = |lo: usize, hi: usize| u32::from_le_bytes(buf[lo..hi].try_into().unwrap());
        match buf[0] {
            0 => Phase::Idle,
            1 => Phase::Command,
            2 => Phase::Address {
                cmd: buf[1],
                addr: field(5, 9),
                shift: field(9, 13),
            },
            3 => Phase::DummyByte { cmd: buf[1], addr: field(5, 9) },
            4 => Phase::ReadLoop { addr: field(1, 5) },
            5 => Phase::WriteLoop { addr: field(1, 5) },
            _ => Phase::Idle,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(self.kind as u8);
        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.data);
        buf.push(self.status);
        buf.extend_from_slice(&Self::phase_to_bytes(self.phase));
        match self.dirty {
            Some((o, l)) => {
                buf.push(1);
                buf.extend_from_slice(&o.to_le_bytes());
                buf.extend_from_slice(&l.to_le_bytes());
            }
            None => buf.push(0),
        }
        buf.extend_from_slice(&self.nand_stage);
        buf.extend_from_slice(&self.nand_stage_addr.to_le_bytes());
        buf.extend_from_slice(&self.sd_stage);
        buf.extend_from_slice(&(self.sd_stage_pos as u32).to_le_bytes());
        buf
    }

    pub fn restore(&mut self, r: &mut crate::savestate::Reader) {
        self.kind = match r.u8() {
            1 => SaveKind::EepromSmall,
            2 => SaveKind::EepromLarge,
            3 => SaveKind::Flash,
            4 => SaveKind::Nand,
            5 => SaveKind::HomebrewSd,
            _ => SaveKind::None,
        };
        let len = r.u32() as usize;
        self.data = r.bytes(len).to_vec();
        self.status = r.u8();
        self.phase = Self::phase_from_bytes(r.bytes(13));
        self.dirty = if r.bool() {
            Some((r.u32(), r.u32()))
        } else {
            None
        };
        self.nand_stage = r.bytes(2048).to_vec();
        self.nand_stage_addr = r.u32();
        self.sd_stage.copy_from_slice(r.bytes(512));
        self.sd_stage_pos = r.u32() as usize;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_eeprom_write_then_read_cycle() {
        let mut mem = SaveMemory::new(SaveKind::EepromSmall, vec![0u8; 512]);
        mem.spi_byte(opcode::WREN);
        mem.deselect();

        mem.spi_byte(opcode::WRLO);
        mem.spi_byte(0x10);
        mem.spi_byte(0xAB);
        mem.spi_byte(0xCD);
        let dirty = mem.deselect();
        assert_eq!(dirty, Some((0x10, 2)));

        mem.spi_byte(opcode::RDLO);
        mem.spi_byte(0x10);
        assert_eq!(mem.spi_byte(0), 0xAB);
        assert_eq!(mem.spi_byte(0), 0xCD);
        mem.deselect();
    }

    #[test]
    fn write_without_wren_is_ignored() {
        let mut mem = SaveMemory::new(SaveKind::EepromSmall, vec![0u8; 512]);
        mem.spi_byte(opcode::WRLO);
        mem.spi_byte(0x00);
        mem.spi_byte(0x42);
        assert_eq!(mem.deselect(), None);
        assert_eq!(mem.data()[0], 0);
    }

    #[test]
    fn flash_sector_erase_requires_wren_and_fills_ff() {
        let mut mem = SaveMemory::new(SaveKind::Flash, vec![0u8; 0x2000]);
        mem.data[0x100] = 0x55;
        mem.spi_byte(opcode::WREN);
        mem.deselect();
        mem.spi_byte(opcode::SECTOR_ERASE);
        mem.spi_byte(0x00);
        mem.spi_byte(0x10);
        mem.spi_byte(0x00);
        mem.deselect();
        assert_eq!(mem.data()[0x100], 0xFF);
    }

    #[test]
    fn nand_stage_then_commit() {
        let mut mem = SaveMemory::new(SaveKind::Nand, vec![0u8; 0x4000]);
        mem.nand_stage_write(0x800, &[1, 2, 3, 4]);
        mem.nand_commit();
        assert_eq!(&mem.data()[0x800..0x804], &[1, 2, 3, 4]);
    }

    #[test]
    fn sd_round_trip() {
        let mut mem = SaveMemory::new(SaveKind::HomebrewSd, vec![0u8; 1024]);
        mem.sd_read_sector(0);
        for i in 0..128u32 {
            mem.sd_write_word(i);
        }
        mem.sd_write_sector(0);
        mem.sd_read_sector(0);
        assert_eq!(mem.sd_read_word(), 0);
    }
}
