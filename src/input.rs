//! Keyboard input parsing: ANSI/VT byte stream to BIOS keycodes.
//!
//! The client side is a terminal, so keystrokes arrive as printable bytes,
//! C0 controls, and `ESC [` / `ESC O` sequences. A byte-at-a-time state
//! machine turns these into the 16-bit scancode/ASCII pairs the emulated
//! BIOS keyboard buffer expects.

use crate::emulator::KeyboardSink;

/// ASCII to PC scancode, indexed by the ASCII byte.
const ASCII_SCANCODE: [u8; 128] = [
    0x00, 0x1E, 0x30, 0x2E, 0x20, 0x12, 0x21, 0x22, 0x0E, 0x0F, 0x1C, 0x25, 0x26, 0x1C, 0x31, 0x18,
    0x19, 0x10, 0x13, 0x1F, 0x14, 0x16, 0x2F, 0x11, 0x2D, 0x15, 0x2C, 0x01, 0x2B, 0x1B, 0x07, 0x0C,
    0x39, 0x02, 0x28, 0x04, 0x05, 0x06, 0x08, 0x28, 0x0A, 0x0B, 0x09, 0x0D, 0x33, 0x0C, 0x34, 0x35,
    0x0B, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x27, 0x27, 0x33, 0x0D, 0x34, 0x35,
    0x03, 0x1E, 0x30, 0x2E, 0x20, 0x12, 0x21, 0x22, 0x23, 0x17, 0x24, 0x25, 0x26, 0x32, 0x31, 0x18,
    0x19, 0x10, 0x13, 0x1F, 0x14, 0x16, 0x2F, 0x11, 0x2D, 0x15, 0x2C, 0x1A, 0x2B, 0x1B, 0x07, 0x0C,
    0x29, 0x1E, 0x30, 0x2E, 0x20, 0x12, 0x21, 0x22, 0x23, 0x17, 0x24, 0x25, 0x26, 0x32, 0x31, 0x18,
    0x19, 0x10, 0x13, 0x1F, 0x14, 0x16, 0x2F, 0x11, 0x2D, 0x15, 0x2C, 0x1A, 0x2B, 0x1B, 0x29, 0x0E,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum State {
    #[default]
    Normal,
    AfterEsc,
    InCsi,
    InSs3,
}

/// Parser state machine fed from KEYBOARD_IN frames.
///
/// Bytes may arrive split across frames at arbitrary points; the machine
/// carries its state between calls so any split yields the same keys.
#[derive(Default)]
pub struct InputParser {
    state: State,
    csi_params: String,
}

/// Ordinary key: scancode in the high byte, ASCII in the low byte.
fn key(scancode: u8, ascii: u8) -> u16 {
    (scancode as u16) << 8 | ascii as u16
}

/// Extended key (arrows, nav cluster): ASCII byte is zero.
fn extended(scancode: u8) -> u16 {
    (scancode as u16) << 8
}

impl InputParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw terminal bytes, depositing each decoded key into the sink.
    pub fn feed(&mut self, bytes: &[u8], sink: &dyn KeyboardSink) {
        for &byte in bytes {
            if let Some(keycode) = self.step(byte) {
                sink.add_key(keycode);
            }
        }
    }

    fn step(&mut self, byte: u8) -> Option<u16> {
        match self.state {
            State::Normal => self.normal(byte),
            State::AfterEsc => self.after_esc(byte),
            State::InCsi => self.in_csi(byte),
            State::InSs3 => self.in_ss3(byte),
        }
    }

    fn normal(&mut self, byte: u8) -> Option<u16> {
        match byte {
            0x1B => {
                self.state = State::AfterEsc;
                None
            }
            0x7F => Some(key(0x0E, 0x08)), // DEL acts as Backspace
            0x0D => Some(key(0x1C, 0x0D)), // Enter
            0x09 => Some(key(0x0F, 0x09)), // Tab
            0x08 => Some(key(0x0E, 0x08)), // Backspace
            0x01..=0x1A => {
                // Ctrl+letter carries the control byte as ASCII
                let letter = b'a' + byte - 1;
                Some(key(ASCII_SCANCODE[letter as usize], byte))
            }
            0x20..=0x7E => Some(key(ASCII_SCANCODE[byte as usize], byte)),
            _ => None,
        }
    }

    fn after_esc(&mut self, byte: u8) -> Option<u16> {
        match byte {
            b'[' => {
                self.state = State::InCsi;
                self.csi_params.clear();
                None
            }
            b'O' => {
                self.state = State::InSs3;
                None
            }
            b'a'..=b'z' => {
                // Alt+letter
                self.state = State::Normal;
                Some(key(ASCII_SCANCODE[byte as usize], 0))
            }
            _ => {
                // Plain ESC; the pending byte is consumed with it
                self.state = State::Normal;
                Some(key(0x01, 0x1B))
            }
        }
    }

    fn in_csi(&mut self, byte: u8) -> Option<u16> {
        match byte {
            0x30..=0x3F => {
                self.csi_params.push(byte as char);
                None
            }
            0x40..=0x7E => {
                let keycode = match byte {
                    b'A' => Some(extended(0x48)), // Up
                    b'B' => Some(extended(0x50)), // Down
                    b'C' => Some(extended(0x4D)), // Right
                    b'D' => Some(extended(0x4B)), // Left
                    b'H' => Some(extended(0x47)), // Home
                    b'F' => Some(extended(0x4F)), // End
                    b'~' => self.tilde_key(),
                    _ => None,
                };
                self.csi_params.clear();
                self.state = State::Normal;
                keycode
            }
            _ => {
                self.state = State::Normal;
                None
            }
        }
    }

    /// `CSI P ~` keys, selected by the leading numeric parameter.
    fn tilde_key(&self) -> Option<u16> {
        let digits: String = self
            .csi_params
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        let param: u32 = digits.parse().unwrap_or(0);

        match param {
            1 => Some(extended(0x47)),  // Home
            2 => Some(extended(0x52)),  // Insert
            3 => Some(extended(0x53)),  // Delete
            4 => Some(extended(0x4F)),  // End
            5 => Some(extended(0x49)),  // PgUp
            6 => Some(extended(0x51)),  // PgDn
            11 => Some(key(0x3B, 0)),   // F1
            12 => Some(key(0x3C, 0)),   // F2
            13 => Some(key(0x3D, 0)),   // F3
            14 => Some(key(0x3E, 0)),   // F4
            15 => Some(key(0x3F, 0)),   // F5
            17 => Some(key(0x40, 0)),   // F6
            18 => Some(key(0x41, 0)),   // F7
            19 => Some(key(0x42, 0)),   // F8
            20 => Some(key(0x43, 0)),   // F9
            21 => Some(key(0x44, 0)),   // F10
            23 => Some(key(0x85, 0)),   // F11
            24 => Some(key(0x86, 0)),   // F12
            _ => None,
        }
    }

    fn in_ss3(&mut self, byte: u8) -> Option<u16> {
        self.state = State::Normal;
        match byte {
            b'A' => Some(extended(0x48)),
            b'B' => Some(extended(0x50)),
            b'C' => Some(extended(0x4D)),
            b'D' => Some(extended(0x4B)),
            b'P' => Some(key(0x3B, 0)), // F1
            b'Q' => Some(key(0x3C, 0)), // F2
            b'R' => Some(key(0x3D, 0)), // F3
            b'S' => Some(key(0x3E, 0)), // F4
            _ => None,
        }
    }
}
