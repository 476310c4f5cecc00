//! Shared fixtures: a fake emulator and a framed-protocol client.

// Each integration test binary compiles this module separately and uses its
// own subset of the helpers.
#![allow(dead_code)]

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use rustix::net::{recv, RecvFlags};
use tempfile::TempDir;
use textstream::protocol::{read_frame, Channel, ControlMsg};
use textstream::screen::{MAX_COLS, MAX_ROWS};
use textstream::{KeyboardSink, TextStream, VgaMode, VideoSource};

pub const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// In-memory stand-in for the emulator's video subsystem, preloaded with a
/// blank 80x25 text screen.
pub struct FakeVideo {
    pub mode: VgaMode,
    pub crtc_offset: u8,
    pub max_scan_line: u8,
    pub vertical_display_end: u16,
    pub cursor_start: u8,
    pub cursor_pos: u16,
    pub display_start: u32,
    pub memory: Vec<u8>,
}

impl FakeVideo {
    pub fn new_80x25() -> Self {
        let mut video = FakeVideo {
            mode: VgaMode::Text,
            crtc_offset: 40,
            max_scan_line: 15,
            vertical_display_end: 399,
            cursor_start: 0,
            cursor_pos: 0,
            display_start: 0,
            memory: vec![0; MAX_ROWS * MAX_COLS * 2],
        };
        video.fill(b' ', 0x07);
        video
    }

    pub fn fill(&mut self, ch: u8, attr: u8) {
        for cell in self.memory.chunks_exact_mut(2) {
            cell[0] = ch;
            cell[1] = attr;
        }
    }

    pub fn put(&mut self, row: usize, col: usize, ch: u8, attr: u8) {
        let cols = if self.crtc_offset > 0 {
            (self.crtc_offset as usize * 2).min(MAX_COLS)
        } else {
            80
        };
        let idx = (row * cols + col) * 2;
        self.memory[idx] = ch;
        self.memory[idx + 1] = attr;
    }

    pub fn set_cursor(&mut self, row: u16, col: u16) {
        let cols = if self.crtc_offset > 0 {
            self.crtc_offset as u16 * 2
        } else {
            80
        };
        self.cursor_pos = row * cols + col;
    }
}

impl VideoSource for FakeVideo {
    fn mode(&self) -> VgaMode {
        self.mode
    }
    fn crtc_offset(&self) -> u8 {
        self.crtc_offset
    }
    fn max_scan_line(&self) -> u8 {
        self.max_scan_line
    }
    fn vertical_display_end(&self) -> u16 {
        self.vertical_display_end
    }
    fn cursor_start(&self) -> u8 {
        self.cursor_start
    }
    fn cursor_location_high(&self) -> u8 {
        (self.cursor_pos >> 8) as u8
    }
    fn cursor_location_low(&self) -> u8 {
        self.cursor_pos as u8
    }
    fn display_start(&self) -> u32 {
        self.display_start
    }
    fn read_mem(&self, addr: u32) -> u8 {
        let idx = (addr - 0xB8000) as usize;
        self.memory.get(idx).copied().unwrap_or(0)
    }
}

/// Keyboard sink that records every injected keycode.
pub struct RecordingSink {
    keys: Mutex<Vec<u16>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        RecordingSink {
            keys: Mutex::new(Vec::new()),
        }
    }

    pub fn taken(&self) -> Vec<u16> {
        std::mem::take(&mut *self.keys.lock().unwrap())
    }
}

impl KeyboardSink for RecordingSink {
    fn add_key(&self, keycode: u16) {
        self.keys.lock().unwrap().push(keycode);
    }
}

/// A listening stream plus everything a test needs to drive it.
pub struct TestServer {
    pub stream: TextStream,
    pub sink: Arc<RecordingSink>,
    pub socket_path: PathBuf,
    _dir: TempDir,
}

pub fn start_server() -> TestServer {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });

    let dir = TempDir::new().expect("failed to create temp dir");
    let socket_path = dir.path().join("console.sock");

    let sink = Arc::new(RecordingSink::new());
    let mut stream = TextStream::new(sink.clone());
    stream
        .listen(&socket_path, None)
        .expect("failed to listen on test socket");
    stream.set_enabled(true);

    TestServer {
        stream,
        sink,
        socket_path,
        _dir: dir,
    }
}

pub fn connect(server: &TestServer) -> UnixStream {
    connect_path(&server.socket_path)
}

pub fn connect_path(path: &std::path::Path) -> UnixStream {
    let stream = UnixStream::connect(path).expect("failed to connect");
    stream
        .set_read_timeout(Some(CLIENT_READ_TIMEOUT))
        .expect("failed to set read timeout");
    stream
}

/// Receive one frame, panicking on protocol errors.
pub fn recv_frame(stream: &mut UnixStream) -> (u8, Vec<u8>) {
    read_frame(stream).expect("failed to read frame")
}

/// Receive frames until one arrives on the wanted channel.
pub fn recv_on(stream: &mut UnixStream, channel: Channel) -> Vec<u8> {
    for _ in 0..32 {
        let (got, payload) = recv_frame(stream);
        if got == channel as u8 {
            return payload;
        }
    }
    panic!("no frame on channel {:#04x}", channel as u8);
}

/// Send a frame with an arbitrary channel byte, bypassing the library's
/// writer so tests can exercise unknown channels.
pub fn send_raw_frame(stream: &mut UnixStream, channel: u8, payload: &[u8]) {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.push(channel);
    frame.push((payload.len() >> 16) as u8);
    frame.push((payload.len() >> 8) as u8);
    frame.push(payload.len() as u8);
    frame.extend_from_slice(payload);
    stream.write_all(&frame).expect("failed to send frame");
}

pub fn send_control(stream: &mut UnixStream, msg: ControlMsg, data: &[u8]) {
    let mut payload = vec![msg as u8];
    payload.extend_from_slice(data);
    send_raw_frame(stream, Channel::Control as u8, &payload);
}

pub fn send_keys(stream: &mut UnixStream, bytes: &[u8]) {
    send_raw_frame(stream, Channel::KeyboardIn as u8, bytes);
}

/// Run the handshake from the client side: consume the server HELLO, offer
/// text output plus keyboard input, and consume the MODE_TEXT reply, which
/// is returned.
pub fn handshake(stream: &mut UnixStream) -> Vec<u8> {
    let (channel, payload) = recv_frame(stream);
    assert_eq!(channel, Channel::Control as u8);
    assert_eq!(payload.first(), Some(&(ControlMsg::Hello as u8)));

    send_control(stream, ControlMsg::Hello, &[0x00, 0x01, 0x02, 0x01, 0x02]);
    recv_on(stream, Channel::Control)
}

/// Assert that nothing arrives within `wait`. Uses a peek so a later read
/// still sees whatever does arrive.
pub fn assert_no_frame(stream: &mut UnixStream, wait: Duration) {
    stream.set_read_timeout(Some(wait)).unwrap();
    let mut probe = [0u8; 1];
    match recv(&*stream, &mut probe, RecvFlags::PEEK) {
        Ok(0) => panic!("connection closed while expecting silence"),
        Ok(_) => {
            let (channel, payload) = recv_frame(stream);
            panic!("unexpected frame on channel {channel:#04x}: {payload:02x?}");
        }
        Err(e)
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut => {}
        Err(e) => panic!("peek failed: {e}"),
    }
    stream.set_read_timeout(Some(CLIENT_READ_TIMEOUT)).unwrap();
}

/// Wait for the background thread to process inbound frames.
pub fn settle() {
    std::thread::sleep(Duration::from_millis(150));
}
