//! Dual-CPU handheld console emulator core.
//!
//! This crate provides a platform-agnostic emulation core with a stable C
//! ABI plus optional WASM bindings (`wasm` feature). No OS APIs are used —
//! all I/O is done through byte buffers and the host-supplied callbacks
//! described in §6 of the design notes.
//!
//! # Architecture
//!
//! - `memory` — fixed-capacity RAM/BIOS backing storage and WRAM bank views
//! - `bus` — region-based address decode, TCM overlay, banked WRAM, VRAM planes, I/O window
//! - `io` — I/O register addresses and the CPU-A/CPU-B peripheral-bank mapping
//! - `dma` — the four-channel DMA arbiter each CPU exposes
//! - `peripherals` — interrupt controller, keypad, timers
//! - `cpu` — dual-ISA (ARM + Thumb) interpreter, one instance per CPU
//! - `cart` — ROM-command protocol engine, KEY1/KEY2 crypto, AUX-SPI save memory
//! - `scheduler` — the global event queue both CPUs and the cart engine share
//! - `savestate` — the section-tagged binary envelope `Emu::save_state` writes
//! - `error` — the `CoreError`/`RomError` taxonomy
//! - `emu` — the top-level orchestration context and frame loop
//!
//! # Memory map (CPU A)
//!
//! | Base | Kind |
//! |---|---|
//! | `0x02000000` | Main RAM (4 MiB, mirrored by mask) |
//! | `0x03000000` | Shared WRAM (banked) |
//! | `0x04000000` | I/O |
//! | `0x05000000` | Palette RAM |
//! | `0x06000000` | VRAM (planes selected by sub-address) |
//! | `0x07000000` | OAM |
//! | `0x08000000` | Cart ROM window |
//! | `0xFFFF0000` | BIOS |

pub mod bus;
pub mod cart;
pub mod cpu;
pub mod dma;
pub mod emu;
pub mod error;
pub mod io;
pub mod memory;
pub mod peripherals;
pub mod savestate;
pub mod scheduler;

#[cfg(feature = "wasm")]
pub mod wasm;

pub use bus::CpuId;
pub use cart::CartVariant;
pub use emu::{ConsoleVariant, Emu, StopReason};
pub use error::{CoreError, CoreResult, RomError};

use std::ptr;
use std::slice;

/// Map a [`CoreError`] onto the small set of negative codes the C ABI can
/// carry across the boundary. Mirrors the error taxonomy in §7: load-time
/// and savestate failures are the only ones that ever reach this layer.
fn error_code(err: &CoreError) -> i32 {
    match err {
        CoreError::RomValidation(_) => -2,
        CoreError::SavestateMismatch { .. } => -3,
        CoreError::SchedulerOverflow { .. } => -4,
        CoreError::NoCartridge => -5,
    }
}

/// Create a new emulator instance for the given console revision (0 =
/// DS-Phat, 1 = DS-Lite; any other value falls back to DS-Phat). Returns
/// null on allocation failure.
#[no_mangle]
pub extern "C" fn emu_create(console_variant: i32) -> *mut Emu {
    let variant = match console_variant {
        1 => ConsoleVariant::DsLite,
        _ => ConsoleVariant::DsPhat,
    };
    let emu = Box::new(Emu::new(variant));
    Box::into_raw(emu)
}

/// Destroy an emulator instance. Safe to call with a null pointer.
#[no_mangle]
pub extern "C" fn emu_destroy(emu: *mut Emu) {
    if !emu.is_null() {
        unsafe {
            drop(Box::from_raw(emu));
        }
    }
}

/// Reset the emulator to its post-BIOS-boot state (§3.1 scenario 1). BIOS
/// images and any inserted cart survive a reset.
#[no_mangle]
pub extern "C" fn emu_reset(emu: *mut Emu) {
    if emu.is_null() {
        return;
    }
    unsafe { &mut *emu }.reset();
}

/// Load CPU-A's BIOS image.
#[no_mangle]
pub extern "C" fn emu_load_bios_a(emu: *mut Emu, data: *const u8, len: usize) {
    if emu.is_null() || data.is_null() {
        return;
    }
    let emu = unsafe { &mut *emu };
    let image = unsafe { slice::from_raw_parts(data, len) };
    emu.load_bios_a(image);
}

/// Load CPU-B's BIOS image. The KEY1 key schedule is seeded from this
/// image at `load_rom` time (§3.4).
#[no_mangle]
pub extern "C" fn emu_load_bios_b(emu: *mut Emu, data: *const u8, len: usize) {
    if emu.is_null() || data.is_null() {
        return;
    }
    let emu = unsafe { &mut *emu };
    let image = unsafe { slice::from_raw_parts(data, len) };
    emu.load_bios_b(image);
}

/// Insert a cartridge. `save_data`/`save_len` may be null/0 for a freshly
/// formatted chip. `variant` selects the cart kind (0=Retail, 1=RetailNand,
/// 2=RetailIr, 3=RetailBt, 4=Homebrew, 5=R4). Returns 0 on success, a
/// negative error code (see `error_code`) on ROM validation failure.
#[no_mangle]
pub extern "C" fn emu_load_rom(
    emu: *mut Emu,
    rom: *const u8,
    rom_len: usize,
    save_data: *const u8,
    save_len: usize,
    variant: i32,
) -> i32 {
    if emu.is_null() || rom.is_null() {
        return -1;
    }
    let emu = unsafe { &mut *emu };
    let rom_bytes = unsafe { slice::from_raw_parts(rom, rom_len) }.to_vec();
    let save = if save_data.is_null() || save_len == 0 {
        None
    } else {
        Some(unsafe { slice::from_raw_parts(save_data, save_len) }.to_vec())
    };
    let cart_variant = match variant {
        1 => CartVariant::RetailNand,
        2 => CartVariant::RetailIr,
        3 => CartVariant::RetailBt,
        4 => CartVariant::Homebrew,
        5 => CartVariant::R4,
        _ => CartVariant::Retail,
    };
    match emu.load_rom(rom_bytes, save, cart_variant) {
        Ok(()) => 0,
        Err(err) => error_code(&err),
    }
}

/// Eject the inserted cartridge, if any. The host is responsible for
/// persisting `emu_cart_save_data` before calling this.
#[no_mangle]
pub extern "C" fn emu_eject_cart(emu: *mut Emu) {
    if emu.is_null() {
        return;
    }
    let _ = unsafe { &mut *emu }.eject_cart();
}

/// Run one frame's worth of CPU-A cycles (§2). Returns 0 on a completed
/// frame, 1 if the scheduler's event pool was exhausted mid-frame (§7,
/// fatal).
#[no_mangle]
pub extern "C" fn emu_run_frame(emu: *mut Emu) -> i32 {
    if emu.is_null() {
        return -1;
    }
    match unsafe { &mut *emu }.run_frame() {
        StopReason::FrameComplete => 0,
        StopReason::SchedulerOverflow => 1,
    }
}

/// Press the buttons named by `mask` (keypad bit layout, §6).
#[no_mangle]
pub extern "C" fn emu_press_button(emu: *mut Emu, mask: u16) {
    if emu.is_null() {
        return;
    }
    unsafe { &mut *emu }.press_button(mask);
}

/// Release the buttons named by `mask`.
#[no_mangle]
pub extern "C" fn emu_release_button(emu: *mut Emu, mask: u16) {
    if emu.is_null() {
        return;
    }
    unsafe { &mut *emu }.release_button(mask);
}

/// Record the lid-closed state (§6). See `Emu::set_lid_closed`'s doc: no
/// lid-switch peripheral is modeled, so this is inert bookkeeping.
#[no_mangle]
pub extern "C" fn emu_set_lid_closed(emu: *mut Emu, closed: i32) {
    if emu.is_null() {
        return;
    }
    unsafe { &mut *emu }.set_lid_closed(closed != 0);
}

/// Pointer/length to the cart's current save-memory contents, for the host
/// to persist. Writes 0/null if no cartridge is inserted.
#[no_mangle]
pub extern "C" fn emu_cart_save_data(emu: *const Emu, len: *mut usize) -> *const u8 {
    if emu.is_null() {
        if !len.is_null() {
            unsafe { *len = 0 };
        }
        return ptr::null();
    }
    let emu = unsafe { &*emu };
    match emu.cart_save_data() {
        Ok(data) => {
            if !len.is_null() {
                unsafe { *len = data.len() };
            }
            data.as_ptr()
        }
        Err(_) => {
            if !len.is_null() {
                unsafe { *len = 0 };
            }
            ptr::null()
        }
    }
}

/// Drain the save-memory write staged this frame, if any (§6 "persistence
/// callbacks"). Returns 1 and writes `offset`/`len` if a write is pending,
/// 0 otherwise.
#[no_mangle]
pub extern "C" fn emu_take_pending_save_write(emu: *mut Emu, offset: *mut u32, len: *mut u32) -> i32 {
    if emu.is_null() {
        return 0;
    }
    match unsafe { &mut *emu }.take_pending_save_write() {
        Some((off, l)) => {
            if !offset.is_null() {
                unsafe { *offset = off };
            }
            if !len.is_null() {
                unsafe { *len = l };
            }
            1
        }
        None => 0,
    }
}

/// Serialize the whole context to a heap-allocated buffer. The caller owns
/// the returned buffer and must free it with `emu_free_buffer`.
#[no_mangle]
pub extern "C" fn emu_save_state(emu: *const Emu, out_len: *mut usize) -> *mut u8 {
    if emu.is_null() {
        if !out_len.is_null() {
            unsafe { *out_len = 0 };
        }
        return ptr::null_mut();
    }
    let mut buf = unsafe { &*emu }.save_state().into_boxed_slice();
    if !out_len.is_null() {
        unsafe { *out_len = buf.len() };
    }
    let ptr = buf.as_mut_ptr();
    std::mem::forget(buf);
    ptr
}

/// Free a buffer returned by `emu_save_state`.
#[no_mangle]
pub extern "C" fn emu_free_buffer(ptr: *mut u8, len: usize) {
    if ptr.is_null() {
        return;
    }
    unsafe {
        drop(Vec::from_raw_parts(ptr, len, len));
    }
}

/// Load a savestate written by `emu_save_state`. Returns 0 on success, a
/// negative error code on a section mismatch (§7); on failure the context
/// is left in its pre-load state.
#[no_mangle]
pub extern "C" fn emu_load_state(emu: *mut Emu, data: *const u8, len: usize) -> i32 {
    if emu.is_null() || data.is_null() {
        return -1;
    }
    let emu = unsafe { &mut *emu };
    let buf = unsafe { slice::from_raw_parts(data, len) };
    match emu.load_state(buf) {
        Ok(()) => 0,
        Err(err) => error_code(&err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_destroy_round_trips() {
        let emu = emu_create(0);
        assert!(!emu.is_null());
        emu_destroy(emu);
    }

    #[test]
    fn reset_on_null_is_a_no_op() {
        emu_reset(ptr::null_mut());
    }

    #[test]
    fn run_frame_reports_completion() {
        let emu = emu_create(1);
        assert_eq!(emu_run_frame(emu), 0);
        emu_destroy(emu);
    }

    #[test]
    fn save_and_load_state_round_trip_through_the_c_abi() {
        let emu = emu_create(0);
        emu_press_button(emu, 0x1);
        let mut len = 0usize;
        let buf = emu_save_state(emu, &mut len);
        assert!(!buf.is_null());
        assert!(len > 0);

        let target = emu_create(0);
        let rc = emu_load_state(target, buf, len);
        assert_eq!(rc, 0);

        emu_free_buffer(buf, len);
        emu_destroy(emu);
        emu_destroy(target);
    }

    #[test]
    fn cart_save_data_is_null_without_a_cartridge() {
        let emu = emu_create(0);
        let mut len = 1usize;
        let ptr = emu_cart_save_data(emu, &mut len);
        assert!(ptr.is_null());
        assert_eq!(len, 0);
        emu_destroy(emu);
    }
}
