//! The streaming session: socket lifecycle, handshake, and the vsync path.
//!
//! One `TextStream` owns the listening socket, at most one client
//! connection, and a background thread that does all inbound reading. The
//! emulator drives the outbound side by calling [`TextStream::on_vsync`]
//! from its render thread; the two sides share a handful of atomic flags
//! and a mutex-guarded write half of the connection.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use rustix::net::{recv, RecvFlags};
use tracing::{debug, info, warn};

use crate::emulator::{KeyboardSink, VgaMode, VideoSource};
use crate::input::InputParser;
use crate::protocol::{
    poll_readable, read_frame, write_frame, Capability, Channel, ControlMsg, PROTOCOL_VERSION,
};
use crate::render::{Renderer, FULL_REFRESH_INTERVAL};
use crate::screen::Screen;

/// Poll timeout while a client is connected.
const POLL_TIMEOUT_MS: u8 = 10;

/// Idle sleep while waiting for a connection.
const ACCEPT_RETRY: Duration = Duration::from_millis(50);

/// Capabilities this server is willing to serve. Mouse input is advertised
/// even though the handler is still a stub, so existing clients keep
/// negotiating it.
const SERVER_CAPS: [Capability; 3] = [
    Capability::TextOutput,
    Capability::KeyboardInput,
    Capability::MouseInput,
];

/// Coarse display-mode class published to the I/O thread, which has no
/// access to the video source when it answers a HELLO.
mod mode_class {
    pub const TEXT: u8 = 0;
    pub const GRAPHICS: u8 = 1;
    pub const OTHER: u8 = 2;
}

/// State shared between the emulator thread and the I/O thread. All flags
/// are relaxed atomics; a one-tick stale read at most skips or duplicates
/// one diff.
struct Shared {
    running: AtomicBool,
    enabled: AtomicBool,
    handshake_done: AtomicBool,
    mode_notified: AtomicBool,
    wants_text: AtomicBool,
    wants_graphics: AtomicBool,
    wants_audio: AtomicBool,
    /// Full-redraw request, consumed on the next vsync.
    invalidate: AtomicBool,
    /// Logical dimensions from the latest snapshot, for MODE_TEXT payloads
    /// built on the I/O thread.
    cols: AtomicU16,
    rows: AtomicU16,
    mode_class: AtomicU8,
    /// Write half of the client connection. Holding this lock across the
    /// header and payload of a frame is what keeps concurrent emitters
    /// from interleaving on the wire.
    conn: Mutex<Option<UnixStream>>,
    sink: Arc<dyn KeyboardSink>,
}

impl Shared {
    fn new(sink: Arc<dyn KeyboardSink>) -> Self {
        Shared {
            running: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            handshake_done: AtomicBool::new(false),
            mode_notified: AtomicBool::new(false),
            wants_text: AtomicBool::new(true),
            wants_graphics: AtomicBool::new(false),
            wants_audio: AtomicBool::new(false),
            invalidate: AtomicBool::new(false),
            cols: AtomicU16::new(80),
            rows: AtomicU16::new(25),
            mode_class: AtomicU8::new(mode_class::TEXT),
            conn: Mutex::new(None),
            sink,
        }
    }

    fn drop_client(&self) {
        *self.conn.lock().unwrap() = None;
        self.handshake_done.store(false, Ordering::Relaxed);
    }
}

/// Streams the emulator's text console to one client over a Unix socket.
pub struct TextStream {
    shared: Arc<Shared>,
    io_thread: Option<JoinHandle<()>>,
    primary_path: Option<PathBuf>,
    bulk_path: Option<PathBuf>,
    screen: Screen,
    renderer: Renderer,
    last_mode: VgaMode,
    vsync_count: u32,
}

impl TextStream {
    pub fn new(sink: Arc<dyn KeyboardSink>) -> Self {
        TextStream {
            shared: Arc::new(Shared::new(sink)),
            io_thread: None,
            primary_path: None,
            bulk_path: None,
            screen: Screen::new(),
            renderer: Renderer::new(),
            last_mode: VgaMode::Error,
            vsync_count: 0,
        }
    }

    /// Bind the primary socket and start the I/O thread. The bulk path is
    /// remembered for the secondary transport but not bound yet.
    pub fn listen(&mut self, primary_path: &Path, bulk_path: Option<&Path>) -> Result<()> {
        // Clean up a socket file left behind by an unclean shutdown.
        let _ = fs::remove_file(primary_path);

        let listener = UnixListener::bind(primary_path)
            .with_context(|| format!("failed to bind {}", primary_path.display()))?;
        listener
            .set_nonblocking(true)
            .context("failed to set listener non-blocking")?;

        self.primary_path = Some(primary_path.to_path_buf());
        self.bulk_path = bulk_path.map(Path::to_path_buf);

        self.shared.running.store(true, Ordering::Relaxed);
        let shared = Arc::clone(&self.shared);
        self.io_thread = Some(
            thread::Builder::new()
                .name("textstream-io".into())
                .spawn(move || io_thread_main(shared, listener))
                .context("failed to spawn I/O thread")?,
        );

        info!(
            path = %primary_path.display(),
            version = %format_args!("{}.{}", PROTOCOL_VERSION >> 8, PROTOCOL_VERSION & 0xFF),
            "listening"
        );
        Ok(())
    }

    /// Stop the I/O thread, close the endpoints, and remove the socket
    /// path. Safe to call more than once.
    pub fn close(&mut self) {
        self.shared.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.io_thread.take() {
            let _ = handle.join();
        }
        self.shared.drop_client();

        if let Some(path) = self.primary_path.take() {
            let _ = fs::remove_file(&path);
        }
        self.bulk_path = None;
    }

    pub fn is_connected(&self) -> bool {
        self.shared.conn.lock().unwrap().is_some()
    }

    /// Path reserved for the bulk transport. Accepted for forward
    /// compatibility; nothing is bound to it yet.
    pub fn bulk_path(&self) -> Option<&Path> {
        self.bulk_path.as_deref()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Relaxed)
    }

    /// Request a full redraw with no elision on the next vsync.
    pub fn invalidate(&self) {
        self.shared.invalidate.store(true, Ordering::Relaxed);
    }

    /// Called by the emulator on every vertical retrace. Snapshots the
    /// screen, renders an update, and flushes it as one TEXT_OUT frame.
    /// Never blocks on the network beyond the send lock.
    pub fn on_vsync(&mut self, video: &dyn VideoSource) {
        let shared = &self.shared;
        if !shared.enabled.load(Ordering::Relaxed)
            || !self.is_connected()
            || !shared.handshake_done.load(Ordering::Relaxed)
        {
            return;
        }

        self.vsync_count += 1;

        if shared.invalidate.swap(false, Ordering::Relaxed) {
            self.renderer.invalidate();
        }

        let mode = video.mode();
        if mode != self.last_mode {
            self.last_mode = mode;
            shared.mode_class.store(classify(mode), Ordering::Relaxed);
            shared.mode_notified.store(false, Ordering::Relaxed);
            send_mode_notification(shared);
            self.renderer.request_full_redraw();
        }

        if mode.is_text() && shared.wants_text.load(Ordering::Relaxed) {
            if self.vsync_count % FULL_REFRESH_INTERVAL == 0 {
                self.renderer.request_full_redraw();
            }

            let dims_changed = self.screen.snapshot(video);
            shared.cols.store(self.screen.cols as u16, Ordering::Relaxed);
            shared.rows.store(self.screen.rows as u16, Ordering::Relaxed);
            if dims_changed {
                self.renderer.request_full_redraw();
                send_mode_notification(shared);
            }

            let body = self.renderer.render(&self.screen);
            if !body.is_empty() {
                send_frame(shared, Channel::TextOut, body);
            }
            self.screen.commit();
        }
    }
}

impl Drop for TextStream {
    fn drop(&mut self) {
        self.close();
    }
}

fn classify(mode: VgaMode) -> u8 {
    if mode.is_text() {
        mode_class::TEXT
    } else if mode.is_graphics() {
        mode_class::GRAPHICS
    } else {
        mode_class::OTHER
    }
}

/// Send one frame on the shared connection, serialized by the conn lock.
/// Failures are reported and otherwise ignored; the next forced full
/// refresh repairs whatever a lost frame left behind.
fn send_frame(shared: &Shared, channel: Channel, payload: &[u8]) {
    let mut guard = shared.conn.lock().unwrap();
    if let Some(stream) = guard.as_mut() {
        if let Err(e) = write_frame(stream, channel, payload) {
            warn!(channel = channel as u8, error = %e, "frame write failed");
        }
    }
}

fn send_control(shared: &Shared, msg: ControlMsg, data: &[u8]) {
    let mut payload = Vec::with_capacity(1 + data.len());
    payload.push(msg as u8);
    payload.extend_from_slice(data);
    send_frame(shared, Channel::Control, &payload);
}

/// Advertise our version and capability set.
fn send_hello(shared: &Shared) {
    let mut data = Vec::with_capacity(3 + SERVER_CAPS.len());
    data.push((PROTOCOL_VERSION >> 8) as u8);
    data.push(PROTOCOL_VERSION as u8);
    data.push(SERVER_CAPS.len() as u8);
    data.extend(SERVER_CAPS.iter().map(|&cap| cap as u8));
    send_control(shared, ControlMsg::Hello, &data);
}

/// Tell the client what kind of display it is looking at. MODE_TEXT
/// carries the logical dimensions; graphics modes are announced as
/// unsupported until the bulk transport exists.
fn send_mode_notification(shared: &Shared) {
    if !shared.handshake_done.load(Ordering::Relaxed) {
        return;
    }

    match shared.mode_class.load(Ordering::Relaxed) {
        mode_class::TEXT => {
            let cols = shared.cols.load(Ordering::Relaxed);
            let rows = shared.rows.load(Ordering::Relaxed);
            let data = [
                (cols >> 8) as u8,
                cols as u8,
                (rows >> 8) as u8,
                rows as u8,
            ];
            send_control(shared, ControlMsg::ModeText, &data);
            shared.mode_notified.store(true, Ordering::Relaxed);
        }
        mode_class::GRAPHICS => {
            send_control(shared, ControlMsg::ModeUnsupported, &[]);
            shared.mode_notified.store(true, Ordering::Relaxed);
        }
        _ => {}
    }
}

/// Background loop: accept one client, then poll it for inbound frames
/// until it goes away or the stream is closed.
fn io_thread_main(shared: Arc<Shared>, listener: UnixListener) {
    let mut reader: Option<UnixStream> = None;
    let mut parser = InputParser::new();

    while shared.running.load(Ordering::Relaxed) {
        if reader.is_none() {
            match accept_client(&shared, &listener) {
                Some(stream) => reader = Some(stream),
                None => {
                    thread::sleep(ACCEPT_RETRY);
                    continue;
                }
            }
        }

        if let Some(stream) = reader.as_mut() {
            if !poll_readable(stream, POLL_TIMEOUT_MS) {
                continue;
            }
            match read_frame(stream) {
                Ok((channel, payload)) => {
                    if dispatch(&shared, &mut parser, channel, &payload) == Disposition::CloseClient
                    {
                        shared.drop_client();
                        reader = None;
                    }
                }
                Err(_) => {
                    // Distinguish an orderly close from a torn frame.
                    if connection_closed(stream) {
                        info!("client disconnected");
                        shared.drop_client();
                        reader = None;
                    }
                }
            }
        }
    }
}

fn accept_client(shared: &Shared, listener: &UnixListener) -> Option<UnixStream> {
    match listener.accept() {
        Ok((stream, _)) => {
            if let Err(e) = stream.set_nonblocking(true) {
                warn!(error = %e, "failed to set client non-blocking");
                return None;
            }
            let write_half = match stream.try_clone() {
                Ok(clone) => clone,
                Err(e) => {
                    warn!(error = %e, "failed to clone client stream");
                    return None;
                }
            };

            info!("client connected");
            shared.handshake_done.store(false, Ordering::Relaxed);
            shared.mode_notified.store(false, Ordering::Relaxed);
            *shared.conn.lock().unwrap() = Some(write_half);

            send_hello(shared);
            shared.invalidate.store(true, Ordering::Relaxed);
            Some(stream)
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock => None,
        Err(e) => {
            warn!(error = %e, "accept failed");
            None
        }
    }
}

/// Probe the connection with a non-blocking peek: EOF means the peer is
/// gone, would-block means the failed read was transient.
fn connection_closed(stream: &UnixStream) -> bool {
    let mut probe = [0u8; 1];
    match recv(stream, &mut probe, RecvFlags::PEEK | RecvFlags::DONTWAIT) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) if e.kind() == ErrorKind::WouldBlock => false,
        Err(_) => true,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    Keep,
    CloseClient,
}

fn dispatch(
    shared: &Shared,
    parser: &mut InputParser,
    channel: u8,
    payload: &[u8],
) -> Disposition {
    match Channel::from_raw(channel) {
        Some(Channel::Control) => handle_control(shared, payload),
        Some(Channel::KeyboardIn) => {
            parser.feed(payload, &*shared.sink);
            Disposition::Keep
        }
        Some(Channel::MouseIn) => {
            // Mouse protocol not specified yet; accept and drop.
            debug!(len = payload.len(), "mouse input ignored");
            Disposition::Keep
        }
        _ => {
            warn!(channel = %format_args!("{channel:#04x}"), "unknown channel");
            Disposition::Keep
        }
    }
}

fn handle_control(shared: &Shared, payload: &[u8]) -> Disposition {
    let Some((&opcode, data)) = payload.split_first() else {
        return Disposition::Keep;
    };

    match ControlMsg::from_raw(opcode) {
        Some(ControlMsg::Hello) => handle_hello(shared, data),
        Some(ControlMsg::Goodbye) => {
            info!("client sent goodbye");
            return Disposition::CloseClient;
        }
        Some(ControlMsg::Refresh) => {
            info!("refresh requested");
            shared.invalidate.store(true, Ordering::Relaxed);
        }
        Some(ControlMsg::Resize) => {
            // Server geometry is CRTC-driven; the request is noted only.
            if data.len() >= 4 {
                let cols = u16::from_be_bytes([data[0], data[1]]);
                let rows = u16::from_be_bytes([data[2], data[3]]);
                info!(cols, rows, "client resize ignored");
            }
        }
        Some(ControlMsg::CapsQuery) => {
            let mut reply = Vec::with_capacity(1 + SERVER_CAPS.len());
            reply.push(SERVER_CAPS.len() as u8);
            reply.extend(SERVER_CAPS.iter().map(|&cap| cap as u8));
            send_control(shared, ControlMsg::CapsReply, &reply);
        }
        Some(ControlMsg::CapsReply) => {
            debug!("unsolicited caps reply ignored");
        }
        _ => {
            warn!(opcode = %format_args!("{opcode:#04x}"), "unknown control message");
        }
    }
    Disposition::Keep
}

/// Parse the client HELLO: version word, capability count, capability
/// bytes. Undersized payloads leave the session pre-handshake.
fn handle_hello(shared: &Shared, data: &[u8]) {
    if data.len() < 3 {
        debug!(len = data.len(), "undersized hello dropped");
        return;
    }

    let version = u16::from_be_bytes([data[0], data[1]]);
    let cap_count = data[2] as usize;
    info!(
        version = %format_args!("{}.{}", version >> 8, version & 0xFF),
        caps = cap_count,
        "client hello"
    );

    let mut wants_text = false;
    let mut wants_graphics = false;
    let mut wants_audio = false;
    for &cap in data[3..].iter().take(cap_count) {
        match Capability::from_raw(cap) {
            Some(Capability::TextOutput) => wants_text = true,
            Some(
                Capability::GraphicsPng | Capability::GraphicsJpeg | Capability::GraphicsH264,
            ) => wants_graphics = true,
            Some(Capability::AudioPcm | Capability::AudioOpus) => wants_audio = true,
            _ => {}
        }
    }

    shared.wants_text.store(wants_text, Ordering::Relaxed);
    shared.wants_graphics.store(wants_graphics, Ordering::Relaxed);
    shared.wants_audio.store(wants_audio, Ordering::Relaxed);
    shared.handshake_done.store(true, Ordering::Relaxed);

    send_mode_notification(shared);
}
