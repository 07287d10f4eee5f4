//! WebAssembly bindings for the dual-CPU emulation core.
//!
//! This module provides JavaScript-friendly APIs using wasm-bindgen. It
//! mirrors the C ABI in the crate root but trades raw pointers for
//! `wasm-bindgen`'s `Vec<u8>`/`Option` marshaling, since WASM callers never
//! deal in C pointers directly.

use crate::cart::CartVariant;
use crate::emu::{ConsoleVariant, Emu, StopReason};
use wasm_bindgen::prelude::*;

/// WASM-friendly wrapper around the emulator. Unlike the C FFI, this owns
/// the emulator directly -- WASM is single-threaded so there's no need for
/// the raw-pointer create/destroy pair.
#[wasm_bindgen]
pub struct WasmEmu {
    inner: Emu,
}

#[wasm_bindgen]
impl WasmEmu {
    /// Create a new emulator instance. `console_variant` is 0 (DS-Phat) or
    /// 1 (DS-Lite); any other value falls back to DS-Phat.
    #[wasm_bindgen(constructor)]
    pub fn new(console_variant: i32) -> WasmEmu {
        console_error_panic_hook::set_once();
        let variant = if console_variant == 1 {
            ConsoleVariant::DsLite
        } else {
            ConsoleVariant::DsPhat
        };
        WasmEmu {
            inner: Emu::new(variant),
        }
    }

    /// Reset to the post-BIOS-boot state (§3.1 scenario 1).
    #[wasm_bindgen]
    pub fn reset(&mut self) {
        self.inner.reset();
    }

    /// Load CPU-A's BIOS image.
    #[wasm_bindgen(js_name = loadBiosA)]
    pub fn load_bios_a(&mut self, data: &[u8]) {
        self.inner.load_bios_a(data);
    }

    /// Load CPU-B's BIOS image. KEY1's key schedule is seeded from this
    /// image at `load_rom` time.
    #[wasm_bindgen(js_name = loadBiosB)]
    pub fn load_bios_b(&mut self, data: &[u8]) {
        self.inner.load_bios_b(data);
    }

    /// Insert a cartridge. `save` may be empty for a freshly formatted
    /// chip. `variant` selects the cart kind (0=Retail, 1=RetailNand,
    /// 2=RetailIr, 3=RetailBt, 4=Homebrew, 5=R4). Returns 0 on success, a
    /// negative error code on ROM validation failure (§7).
    #[wasm_bindgen(js_name = loadRom)]
    pub fn load_rom(&mut self, rom: Vec<u8>, save: Vec<u8>, variant: i32) -> i32 {
        let cart_variant = match variant {
            1 => CartVariant::RetailNand,
            2 => CartVariant::RetailIr,
            3 => CartVariant::RetailBt,
            4 => CartVariant::Homebrew,
            5 => CartVariant::R4,
            _ => CartVariant::Retail,
        };
        let save = if save.is_empty() { None } else { Some(save) };
        match self.inner.load_rom(rom, save, cart_variant) {
            Ok(()) => 0,
            Err(_) => -2,
        }
    }

    /// Eject the inserted cartridge, if any.
    #[wasm_bindgen(js_name = ejectCart)]
    pub fn eject_cart(&mut self) {
        let _ = self.inner.eject_cart();
    }

    /// Run one frame's worth of CPU-A cycles (§2). Returns 0 on a
    /// completed frame, 1 if the scheduler's event pool was exhausted
    /// mid-frame (§7, fatal).
    #[wasm_bindgen(js_name = runFrame)]
    pub fn run_frame(&mut self) -> i32 {
        match self.inner.run_frame() {
            StopReason::FrameComplete => 0,
            StopReason::SchedulerOverflow => 1,
        }
    }

    /// Press the buttons named by `mask` (keypad bit layout, §6).
    #[wasm_bindgen(js_name = pressButton)]
    pub fn press_button(&mut self, mask: u16) {
        self.inner.press_button(mask);
    }

    /// Release the buttons named by `mask`.
    #[wasm_bindgen(js_name = releaseButton)]
    pub fn release_button(&mut self, mask: u16) {
        self.inner.release_button(mask);
    }

    /// Record the lid-closed state. See `Emu::set_lid_closed`'s doc: no
    /// lid-switch peripheral is modeled, so this is inert bookkeeping.
    #[wasm_bindgen(js_name = setLidClosed)]
    pub fn set_lid_closed(&mut self, closed: bool) {
        self.inner.set_lid_closed(closed);
    }

    /// The cart's current save-memory contents, for the host to persist.
    /// Empty if no cartridge is inserted.
    #[wasm_bindgen(js_name = cartSaveData)]
    pub fn cart_save_data(&self) -> Vec<u8> {
        self.inner.cart_save_data().map(|d| d.to_vec()).unwrap_or_default()
    }

    /// Drain the save-memory write staged this frame, if any, as
    /// `[offset, len]`. Empty if nothing is pending.
    #[wasm_bindgen(js_name = takePendingSaveWrite)]
    pub fn take_pending_save_write(&mut self) -> Vec<u32> {
        match self.inner.take_pending_save_write() {
            Some((offset, len)) => vec![offset, len],
            None => Vec::new(),
        }
    }

    /// Serialize the whole context as a section-tagged byte buffer (§6).
    #[wasm_bindgen(js_name = saveState)]
    pub fn save_state(&self) -> Vec<u8> {
        self.inner.save_state()
    }

    /// Load a savestate written by `save_state`. Returns 0 on success, a
    /// negative error code on a section mismatch (§7); on failure the
    /// context is left in its pre-load state.
    #[wasm_bindgen(js_name = loadState)]
    pub fn load_state(&mut self, data: &[u8]) -> i32 {
        match self.inner.load_state(data) {
            Ok(()) => 0,
            Err(_) => -3,
        }
    }
}
