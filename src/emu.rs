//! Top-level orchestration context: owns both CPUs, the shared bus, and the
//! scheduler, and drives the frame loop described in §2 of the design notes.
//!
//! Everything here is glue. The hard engineering -- decode/execute, the bus's
//! region routing, the scheduler's delta chain, the cart protocol engine --
//! lives in their own modules; `Emu` just calls them in the order the
//! emulated hardware's own frame driver does, and owns the handful of pieces
//! of state (slice carry, cart ownership) that don't have a natural home on
//! any one of those modules.

use crate::bus::{Bus, CpuId};
use crate::cart::{CartEffect, CartSlot, CartVariant};
use crate::cpu::Cpu;
use crate::error::{CoreError, CoreResult};
use crate::io;
use crate::peripherals::interrupt::sources;
use crate::savestate::{write_section, Reader};
use crate::scheduler::{EventKind, Scheduler};

/// Total CPU-A cycles in one frame, and the per-iteration slice cap. Both
/// are taken verbatim from the emulated hardware's own frame driver, which
/// runs CPU-A for `560190<<1` cycles a frame in chunks no larger than 16
/// (or fewer, clipped to the next scheduled event).
const FRAME_CYCLES: i64 = 560_190 * 2;
const MAX_SLICE: i64 = 16;

/// The KEY1 key buffer lives at this byte offset inside the ARM7 BIOS image
/// on real hardware; `Key1::from_bios` indexes from byte 0 of whatever slice
/// it's handed, so this is where the orchestrator has to start it.
const KEY1_SEED_OFFSET: usize = 0x30;

/// Placeholder per-console KEY2 seed pair. Real hardware draws these from
/// firmware/NVRAM, which §1 places out of scope for this core; a fixed,
/// documented constant keeps the cipher's stream deterministic and testable
/// without modeling the firmware block that would otherwise supply it.
const KEY2_SEEDS: (u64, u64) = (0x0000_1234_5678_9ABC, 0x0000_FEDC_BA98_7654);

/// The two console revisions the ROM header's region mask distinguishes
/// between (§1 Non-goals). Currently the only observable difference this
/// core models is CPU A's exception-vector-base default (§3.1); both
/// variants resolve to the same value today (see DESIGN.md's Open
/// Questions), so the field is otherwise inert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleVariant {
    DsPhat,
    DsLite,
}

/// Why [`Emu::run_frame`] returned control to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A full frame's worth of CPU-A cycles ran to completion.
    FrameComplete,
    /// The scheduler's fixed-capacity event pool was exhausted mid-frame.
    /// Fatal per §7: the frame loop stops immediately rather than continuing
    /// on a scheduler that just silently dropped an event.
    SchedulerOverflow,
}

/// The emulation context: both CPUs, the shared bus, the scheduler, and the
/// handful of cross-frame bookkeeping fields the emulated hardware's own
/// frame driver keeps outside any one component (§9 "global mutable state").
pub struct Emu {
    cpu_a: Cpu,
    cpu_b: Cpu,
    bus: Bus,
    scheduler: Scheduler,
    console_variant: ConsoleVariant,

    /// Which CPU last wrote a ROM-command start to `ROMCTRL` -- and so
    /// which CPU's DMA bank and interrupt bank a pending cart effect should
    /// be routed to. No EXMEMCNT-equivalent cart-ownership register exists
    /// anywhere in this core's I/O map (see DESIGN.md); this is inferred
    /// from which CPU's slice the write was observed on instead.
    cart_owner: CpuId,

    /// Cross-frame slice-loop overshoot, mirroring the emulated hardware's
    /// own `ARM9Cycles`/`ARM7Cycles` bookkeeping -- persists across
    /// `run_frame` calls, only cleared by `reset`.
    carry_a: i64,
    carry_b: i64,

    /// Lid-closed flag. Recorded as inert context state rather than wired to
    /// any hardware register: the lid switch is GPIO/PMIC hardware this core
    /// places out of scope (§1). See `set_lid_closed`.
    lid_closed: bool,
}

impl Emu {
    pub fn new(console_variant: ConsoleVariant) -> Emu {
        let mut emu = Emu {
            cpu_a: Cpu::new(CpuId::A),
            cpu_b: Cpu::new(CpuId::B),
            bus: Bus::new(),
            scheduler: Scheduler::new(),
            console_variant,
            cart_owner: CpuId::B,
            carry_a: 0,
            carry_b: 0,
            lid_closed: false,
        };
        emu.reset();
        emu
    }

    /// Reset to the post-BIOS-boot state (§3.1 scenario 1): both CPUs jump
    /// through their exception-vector base, banked registers clear, the
    /// scheduler empties. BIOS images and the inserted cart, if any, survive
    /// a reset -- only `Bus::new` wipes them.
    pub fn reset(&mut self) {
        self.bus.reset();
        // Both revisions currently reset through the same high vector; see
        // DESIGN.md's Open Questions for why this is resolved rather than
        // left to vary by `console_variant`.
        let _ = self.console_variant;
        self.bus.arm9_exception_base = 0xFFFF_0000;
        self.cpu_a.reset(&mut self.bus);
        self.cpu_b.reset(&mut self.bus);
        self.scheduler.reset();
        self.cart_owner = CpuId::B;
        self.carry_a = 0;
        self.carry_b = 0;
    }

    pub fn load_bios_a(&mut self, image: &[u8]) {
        self.bus.load_bios_a(image);
    }

    pub fn load_bios_b(&mut self, image: &[u8]) {
        self.bus.load_bios_b(image);
    }

    /// Insert a cartridge. `save` seeds the save-memory chip's initial
    /// contents (or the homebrew-SD image); absent, an empty chip is created
    /// at the smallest capacity for its kind (§4.4).
    pub fn load_rom(&mut self, rom: Vec<u8>, save: Option<Vec<u8>>, variant: CartVariant) -> CoreResult<()> {
        let bios_b = self.bus.bios_b().as_slice();
        let seed_end = (KEY1_SEED_OFFSET + crate::cart::key1::KEY_BUF_WORDS * 4).min(bios_b.len());
        let seed = if seed_end > KEY1_SEED_OFFSET {
            &bios_b[KEY1_SEED_OFFSET..seed_end]
        } else {
            &[][..]
        };
        let cart = CartSlot::new(rom, save.unwrap_or_default(), variant, seed)?;
        self.bus.cart = Some(cart);
        Ok(())
    }

    pub fn eject_cart(&mut self) -> Option<CartSlot> {
        self.bus.cart.take()
    }

    /// The save-memory chip's (or homebrew-SD image's) current contents, for
    /// the host to persist. `NoCartridge` if nothing is inserted.
    pub fn cart_save_data(&self) -> CoreResult<&[u8]> {
        self.bus.cart.as_ref().map(|c| c.save_data()).ok_or(CoreError::NoCartridge)
    }

    pub fn press_button(&mut self, mask: u16) {
        self.bus.peripherals.keypad.press(mask);
        self.bus.peripherals.poll_keypad_irq();
    }

    pub fn release_button(&mut self, mask: u16) {
        self.bus.peripherals.keypad.release(mask);
    }

    /// Record the lid-closed state. See the field doc on `lid_closed`: this
    /// core has no lid-switch GPIO to fold the flag into, so it's recorded
    /// here rather than dropped, preserving the host API's shape for a
    /// future firmware-peripheral implementation.
    pub fn set_lid_closed(&mut self, closed: bool) {
        self.lid_closed = closed;
    }

    pub fn lid_closed(&self) -> bool {
        self.lid_closed
    }

    /// Drain the save-memory write staged this frame, if any (§6
    /// "persistence callbacks") -- an `(offset, len)` byte range of
    /// `cart_save_data()` the host should flush to durable storage.
    pub fn take_pending_save_write(&mut self) -> Option<(u32, u32)> {
        self.bus.take_pending_save_write()
    }

    /// Run one frame's worth of CPU-A cycles (§2), ticking CPU B, the
    /// timers, and the cart scheduler alongside it each slice.
    pub fn run_frame(&mut self) -> StopReason {
        let mut remaining = FRAME_CYCLES;

        while remaining > 0 {
            let slice = self
                .scheduler
                .cycles_to_next()
                .map(|next| next.min(MAX_SLICE))
                .unwrap_or(MAX_SLICE)
                .max(1)
                .min(remaining);

            self.sync_irq_lines(CpuId::A);
            let torun_a = (slice - self.carry_a).max(0);
            let c_a = self.cpu_a.execute(&mut self.bus, &mut self.scheduler, torun_a);
            self.carry_a = c_a - torun_a;
            self.apply_pending_bus_effects(CpuId::A);

            self.sync_irq_lines(CpuId::B);
            let torun_b = ((c_a - self.carry_b) & !1).max(0);
            let c_b = self.cpu_b.execute(&mut self.bus, &mut self.scheduler, torun_b >> 1) << 1;
            self.carry_b = c_b - torun_b;
            self.apply_pending_bus_effects(CpuId::B);

            self.bus.peripherals.tick_timers(io::bank(CpuId::A), c_a.max(0) as u32);
            self.bus.peripherals.tick_timers(io::bank(CpuId::B), c_b.max(0) as u32);

            self.run_scheduler_events(c_a);
            if self.scheduler.is_exhausted() {
                log::error!("scheduler pool exhausted mid-frame; stopping run_frame early");
                return StopReason::SchedulerOverflow;
            }

            remaining -= slice;
        }

        StopReason::FrameComplete
    }

    /// Mirror `bus.peripherals.interrupt`'s IE/IF/IME for `cpu` onto that
    /// CPU's own `irq: InterruptLines` copy. The CPU's IRQ check
    /// (`check_irq`) only ever consults its own copy, never the bus
    /// directly, so a write to IME/IE/IF only becomes visible to a CPU the
    /// next time its slice starts -- an approximation within the
    /// cycle-approximate scope §1 already disclaims (IRQ latency inside a
    /// slice is at most `MAX_SLICE` cycles late, never dropped).
    fn sync_irq_lines(&mut self, cpu: CpuId) {
        let bank = io::bank(cpu);
        let lines = match cpu {
            CpuId::A => &mut self.cpu_a.irq,
            CpuId::B => &mut self.cpu_b.irq,
        };
        lines.master_enable = self.bus.peripherals.interrupt.ime(bank);
        lines.enable = self.bus.peripherals.interrupt.ie(bank);
        lines.flag = self.bus.peripherals.interrupt.ifl(bank);
    }

    /// After `cpu`'s slice, apply whatever it staged on the bus that needs
    /// the scheduler or the other CPU's state: a ROMCnt control-start write,
    /// or CPU B's halt-on-IRQ request.
    fn apply_pending_bus_effects(&mut self, cpu: CpuId) {
        if let Some(val) = self.bus.take_pending_rom_cnt_write() {
            self.cart_owner = cpu;
            if let Some(cart) = self.bus.cart.as_mut() {
                cart.write_rom_cnt(val, KEY2_SEEDS, &mut self.scheduler);
            }
        }
        if cpu == CpuId::B && self.bus.take_pending_halt_b() {
            self.cpu_b.halt_until_irq();
        }
    }

    /// Advance the scheduler by this slice's CPU-A cycle count and dispatch
    /// whatever fired. The only event kind this core schedules is the cart
    /// engine's data-ready tick; its effects (a paced-DMA word and/or the
    /// transfer-done IRQ) are routed to whichever CPU owns the cart slot.
    fn run_scheduler_events(&mut self, cycles: i64) {
        let fired = self.scheduler.advance(cycles.max(0));
        for (kind, _param) in fired {
            match kind {
                EventKind::CartRomData => self.on_cart_data_ready(),
                #[cfg(test)]
                EventKind::TestProbe => {}
            }
        }
    }

    fn on_cart_data_ready(&mut self) {
        let effects = match self.bus.cart.as_mut() {
            Some(cart) => cart.on_data_ready(&mut self.scheduler),
            None => Vec::new(),
        };
        for effect in effects {
            match effect {
                CartEffect::DmaRequest { .. } => {
                    let word = self.bus.cart.as_mut().map(|c| c.read_data()).unwrap_or(0xFFFF_FFFF);
                    self.bus.set_cart_window(word);
                    let owner = self.cart_owner;
                    self.bus.step_special_dma(owner, |bus, src, dst, word32| {
                        if word32 {
                            let v = bus.read32(owner, src);
                            bus.write32(owner, dst, v);
                        } else {
                            let v = bus.read16(owner, src);
                            bus.write16(owner, dst, v);
                        }
                    });
                }
                CartEffect::TransferDoneIrq => {
                    let bank = io::bank(self.cart_owner);
                    self.bus.peripherals.interrupt.raise(bank, sources::CART_TRANSFER);
                }
            }
        }
    }
}

// ---------- State persistence ----------

const TAG_CPU_A: &[u8; 4] = b"CPUA";
const TAG_CPU_B: &[u8; 4] = b"CPUB";
const TAG_BUS: &[u8; 4] = b"BUS0";
const TAG_SCHED: &[u8; 4] = b"SCHD";
const TAG_EMU: &[u8; 4] = b"EMU0";

impl Emu {
    /// Serialize the whole context as a sequence of section-tagged buffers
    /// (§6), in a fixed order `load_state` expects back.
    ///
    /// The cart slot's ROM image is not captured (see `CartSlot::to_bytes`);
    /// a host restoring a savestate that had a cart inserted must call
    /// `load_rom` with the same cart before `load_state`, or the bus
    /// section's cart payload bytes are skipped rather than consumed and
    /// every section after it misreads.
    pub fn save_state(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_section(&mut buf, TAG_CPU_A, &self.cpu_a.to_bytes());
        write_section(&mut buf, TAG_CPU_B, &self.cpu_b.to_bytes());
        write_section(&mut buf, TAG_BUS, &self.bus.to_bytes());
        write_section(&mut buf, TAG_SCHED, &self.scheduler.to_bytes());

        let mut emu_payload = Vec::new();
        emu_payload.push(match self.cart_owner {
            CpuId::A => 0u8,
            CpuId::B => 1u8,
        });
        emu_payload.extend_from_slice(&self.carry_a.to_le_bytes());
        emu_payload.extend_from_slice(&self.carry_b.to_le_bytes());
        emu_payload.push(self.lid_closed as u8);
        write_section(&mut buf, TAG_EMU, &emu_payload);

        buf
    }

    pub fn load_state(&mut self, data: &[u8]) -> CoreResult<()> {
        let mut pos = 0;

        let mut r = Reader::section(data, &mut pos, "cpu-a", TAG_CPU_A)?;
        self.cpu_a.restore(&mut r);
        r.finish("cpu-a")?;

        let mut r = Reader::section(data, &mut pos, "cpu-b", TAG_CPU_B)?;
        self.cpu_b.restore(&mut r);
        r.finish("cpu-b")?;

        let mut r = Reader::section(data, &mut pos, "bus", TAG_BUS)?;
        self.bus.restore(&mut r);
        r.finish("bus")?;

        self.scheduler = Scheduler::restore(&mut Reader::section(data, &mut pos, "scheduler", TAG_SCHED)?);

        let mut r = Reader::section(data, &mut pos, "emu", TAG_EMU)?;
        self.cart_owner = if r.u8() == 0 { CpuId::A } else { CpuId::B };
        self.carry_a = r.i64();
        self.carry_b = r.i64();
        self.lid_closed = r.bool();
        r.finish("emu")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_rom() -> Vec<u8> {
        let mut rom = vec![0u8; 0x1000];
        rom[0x0C..0x10].copy_from_slice(b"ABCE");
        rom[0x20..0x24].copy_from_slice(&0x200u32.to_le_bytes()); // arm9 rom offset
        rom[0x28..0x2C].copy_from_slice(&0x100u32.to_le_bytes()); // arm9 size
        rom[0x30..0x34].copy_from_slice(&0x300u32.to_le_bytes()); // arm7 rom offset
        rom[0x38..0x3C].copy_from_slice(&0x100u32.to_le_bytes()); // arm7 size
        rom
    }

    #[test]
    fn new_emu_resets_both_cpus_to_their_exception_vector() {
        let emu = Emu::new(ConsoleVariant::DsLite);
        assert_eq!(emu.bus.arm9_exception_base, 0xFFFF_0000);
        assert_eq!(emu.cpu_a.pc(), 0xFFFF_0000u32.wrapping_add(8));
        assert_eq!(emu.cpu_b.pc(), 8);
    }

    #[test]
    fn run_frame_consumes_a_full_frame_of_cpu_a_cycles() {
        let mut emu = Emu::new(ConsoleVariant::DsPhat);
        let reason = emu.run_frame();
        assert_eq!(reason, StopReason::FrameComplete);
    }

    #[test]
    fn no_cartridge_reports_as_such() {
        let emu = Emu::new(ConsoleVariant::DsPhat);
        assert_eq!(emu.cart_save_data().unwrap_err(), CoreError::NoCartridge);
    }

    #[test]
    fn load_rom_accepts_a_minimal_header_and_seeds_key1_from_bios_b() {
        let mut emu = Emu::new(ConsoleVariant::DsPhat);
        emu.load_bios_b(&vec![0xAAu8; 0x4000]);
        emu.load_rom(minimal_rom(), None, CartVariant::Retail).unwrap();
        assert!(emu.bus.cart.is_some());
    }

    #[test]
    fn save_state_round_trips_carry_and_cart_owner() {
        let mut emu = Emu::new(ConsoleVariant::DsPhat);
        emu.carry_a = 3;
        emu.carry_b = -1;
        emu.cart_owner = CpuId::A;
        emu.lid_closed = true;
        let snap = emu.save_state();

        let mut restored = Emu::new(ConsoleVariant::DsPhat);
        restored.load_state(&snap).unwrap();
        assert_eq!(restored.carry_a, 3);
        assert_eq!(restored.carry_b, -1);
        assert_eq!(restored.cart_owner, CpuId::A);
        assert!(restored.lid_closed);
    }

    #[test]
    fn load_state_rejects_truncated_buffer() {
        let emu_snap = Emu::new(ConsoleVariant::DsPhat).save_state();
        let mut target = Emu::new(ConsoleVariant::DsPhat);
        let truncated = &emu_snap[..emu_snap.len() - 4];
        assert!(target.load_state(truncated).is_err());
    }

    #[test]
    fn press_and_release_button_do_not_panic_without_irq_enabled() {
        let mut emu = Emu::new(ConsoleVariant::DsPhat);
        emu.press_button(crate::peripherals::keypad::button::A);
        emu.release_button(crate::peripherals::keypad::button::A);
    }
}
