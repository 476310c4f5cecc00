//! Text-console streaming for PC emulators.
//!
//! Streams an emulator's VGA text screen to a remote terminal over a Unix
//! stream socket and relays the terminal's keystrokes back into the
//! emulated BIOS keyboard buffer. The wire protocol is channel-tagged
//! binary frames; screen updates are minimal ANSI/UTF-8 sequences computed
//! by diffing consecutive snapshots of character memory.
//!
//! The emulator embeds a [`TextStream`], calls [`TextStream::on_vsync`]
//! from its render thread on each vertical retrace, and supplies a
//! [`VideoSource`] view of its VGA state plus a [`KeyboardSink`] for
//! decoded keys. All socket reading happens on one background thread owned
//! by the stream.
//!
//! For emulators that prefer C-style lifecycle hooks, [`init`],
//! [`shutdown`], [`on_vsync`], and [`invalidate`] manage a single
//! process-wide instance.

pub mod cp437;
pub mod emulator;
pub mod input;
pub mod protocol;
pub mod render;
pub mod screen;
pub mod stream;

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;

pub use emulator::{KeyboardSink, VgaMode, VideoSource};
pub use stream::TextStream;

static INSTANCE: Mutex<Option<TextStream>> = Mutex::new(None);

/// Construct and enable the process-wide stream, bound to `primary_path`.
/// A second call while an instance exists is a no-op.
pub fn init(
    primary_path: &Path,
    bulk_path: Option<&Path>,
    sink: Arc<dyn KeyboardSink>,
) -> Result<()> {
    let mut instance = INSTANCE.lock().unwrap();
    if instance.is_some() {
        return Ok(());
    }

    let mut stream = TextStream::new(sink);
    stream.listen(primary_path, bulk_path)?;
    stream.set_enabled(true);
    *instance = Some(stream);
    Ok(())
}

/// Close and drop the process-wide stream, if any.
pub fn shutdown() {
    INSTANCE.lock().unwrap().take();
}

/// Vsync entry point for the process-wide stream.
pub fn on_vsync(video: &dyn VideoSource) {
    if let Some(stream) = INSTANCE.lock().unwrap().as_mut() {
        stream.on_vsync(video);
    }
}

/// Force a full redraw from the process-wide stream on the next vsync.
pub fn invalidate() {
    if let Some(stream) = INSTANCE.lock().unwrap().as_ref() {
        stream.invalidate();
    }
}
