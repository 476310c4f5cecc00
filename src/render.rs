//! ANSI output generation: full redraws and differential updates.
//!
//! The renderer tracks what the remote terminal currently shows (last
//! attribute, implicit cursor position) so it can elide redundant escape
//! sequences. Both update paths share one assembly buffer; the caller
//! flushes it as a single TEXT_OUT frame.

use crate::cp437;
use crate::screen::{Screen, TextCell};

/// White-on-black, the attribute a reset terminal shows.
pub const DEFAULT_ATTR: u8 = 0x07;

/// Vsyncs between forced full refreshes (about 2 s at 60 Hz), re-syncing
/// the terminal even when no diff was detected.
pub(crate) const FULL_REFRESH_INTERVAL: u32 = 120;

/// VGA foreground nibble to SGR color code.
const VGA_FG: [u8; 16] = [30, 34, 32, 36, 31, 35, 33, 37, 90, 94, 92, 96, 91, 95, 93, 97];

/// VGA background triplet to SGR color code.
const VGA_BG: [u8; 8] = [40, 44, 42, 46, 41, 45, 43, 47];

/// A cell the full redraw may omit at the end of a row: a space whose
/// background is black. Spaces with a colored background carry visible
/// state and are never skipped.
fn is_blank(cell: TextCell) -> bool {
    cell.character == b' ' && cell.attribute & 0x70 == 0
}

pub struct Renderer {
    buf: Vec<u8>,
    /// Attribute the terminal last saw, None when unknown.
    last_attr: Option<u8>,
    /// Where the terminal's next write would land, None when unknown.
    pos: Option<(usize, usize)>,
    force_redraw: bool,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    pub fn new() -> Self {
        Renderer {
            buf: Vec::with_capacity(16384),
            last_attr: None,
            pos: None,
            force_redraw: true,
        }
    }

    /// Request a full redraw and discard every assumption about terminal
    /// state, so the redraw cannot elide a needed sequence.
    pub fn invalidate(&mut self) {
        self.force_redraw = true;
        self.last_attr = None;
        self.pos = None;
    }

    /// Request a full redraw on the next render without discarding writer
    /// state (dimension or mode change, periodic refresh).
    pub fn request_full_redraw(&mut self) {
        self.force_redraw = true;
    }

    /// Produce the update payload for the current snapshot. The returned
    /// slice is valid until the next call.
    pub fn render(&mut self, screen: &Screen) -> &[u8] {
        self.buf.clear();

        let full = self.force_redraw;
        self.force_redraw = false;

        if full {
            self.full_redraw(screen);
        } else {
            self.diff_update(screen);
        }
        self.cursor_update(screen, full);

        &self.buf
    }

    fn full_redraw(&mut self, screen: &Screen) {
        // Hide the cursor before clearing so it does not flash at the home
        // position while the screen repaints.
        self.emit_cursor_visibility(false);
        self.emit_clear_screen();
        self.emit_set_attribute(DEFAULT_ATTR);

        for row in 0..screen.rows {
            if row > 0 {
                // Reset before the newline so a colored background cannot
                // bleed to the terminal's right edge.
                if self.last_attr != Some(DEFAULT_ATTR) {
                    self.emit_set_attribute(DEFAULT_ATTR);
                }
                self.buf.extend_from_slice(b"\r\n");
                self.pos = Some((row, 0));
            }

            let last_col = (0..screen.cols).rev().find(|&col| !is_blank(screen.cell(row, col)));
            if let Some(last_col) = last_col {
                for col in 0..=last_col {
                    let cell = screen.cell(row, col);
                    if self.last_attr != Some(cell.attribute) {
                        self.emit_set_attribute(cell.attribute);
                    }
                    self.emit_character(cell.character, screen.cols);
                }
            }

            if last_col != Some(screen.cols - 1) && self.last_attr != Some(DEFAULT_ATTR) {
                self.emit_set_attribute(DEFAULT_ATTR);
            }
        }
    }

    fn diff_update(&mut self, screen: &Screen) {
        for row in 0..screen.rows {
            for col in 0..screen.cols {
                let cell = screen.cell(row, col);
                if cell == screen.prev_cell(row, col) {
                    continue;
                }
                if self.pos != Some((row, col)) {
                    self.emit_move_cursor(row, col);
                }
                if self.last_attr != Some(cell.attribute) {
                    self.emit_set_attribute(cell.attribute);
                }
                self.emit_character(cell.character, screen.cols);
            }
        }
    }

    /// Position first, then change visibility: showing before moving would
    /// flash the cursor at its old location.
    fn cursor_update(&mut self, screen: &Screen, full: bool) {
        let cursor = screen.cursor;
        if full {
            // The redraw hid the cursor and moved it; restate both.
            if cursor.visible {
                self.emit_move_cursor(cursor.row as usize, cursor.col as usize);
            }
            self.emit_cursor_visibility(cursor.visible);
        } else if cursor != screen.prev_cursor {
            if cursor.visible {
                self.emit_move_cursor(cursor.row as usize, cursor.col as usize);
            }
            if cursor.visible != screen.prev_cursor.visible {
                self.emit_cursor_visibility(cursor.visible);
            }
        }
    }

    fn emit_move_cursor(&mut self, row: usize, col: usize) {
        let seq = format!("\x1b[{};{}H", row + 1, col + 1);
        self.buf.extend_from_slice(seq.as_bytes());
        self.pos = Some((row, col));
    }

    fn emit_set_attribute(&mut self, attr: u8) {
        let fg = VGA_FG[(attr & 0x0F) as usize];
        let bg = VGA_BG[((attr >> 4) & 0x07) as usize];
        let seq = if attr & 0x80 != 0 {
            format!("\x1b[0;{};{};5m", fg, bg)
        } else {
            format!("\x1b[0;{};{}m", fg, bg)
        };
        self.buf.extend_from_slice(seq.as_bytes());
        self.last_attr = Some(attr);
    }

    fn emit_character(&mut self, ch: u8, cols: usize) {
        let mut utf8 = [0u8; 4];
        self.buf
            .extend_from_slice(cp437::to_unicode(ch).encode_utf8(&mut utf8).as_bytes());

        if let Some((row, col)) = &mut self.pos {
            *col += 1;
            if *col >= cols {
                *col = 0;
                *row += 1;
            }
        }
    }

    fn emit_clear_screen(&mut self) {
        self.buf.extend_from_slice(b"\x1b[2J\x1b[H");
        self.pos = Some((0, 0));
    }

    fn emit_cursor_visibility(&mut self, visible: bool) {
        self.buf
            .extend_from_slice(if visible { b"\x1b[?25h" } else { b"\x1b[?25l" });
    }
}
