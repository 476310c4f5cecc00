//! Wire protocol: channel-tagged frames over a Unix stream socket.
//!
//! Every frame is a one-byte channel tag, a three-byte big-endian payload
//! length, and the payload itself. Frames on the CONTROL channel carry a
//! one-byte opcode followed by opcode-specific data.

use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::warn;

/// Protocol version exchanged in both HELLO directions.
pub const PROTOCOL_VERSION: u16 = 0x0001;

/// Frame header: channel byte plus 24-bit length.
pub const HEADER_LEN: usize = 4;

/// Largest payload expressible in the 24-bit length field.
pub const MAX_PAYLOAD: usize = 0xFF_FFFF;

/// How long one readiness poll waits while completing a partial read.
const READ_POLL_MS: u8 = 10;

/// Readiness polls tolerated before a partial frame is abandoned.
const MAX_READ_SPINS: u32 = 10;

/// Frame channel tags. The graphics and audio values are reserved for the
/// bulk transports and are never emitted by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Channel {
    Control = 0x00,
    TextOut = 0x01,
    KeyboardIn = 0x02,
    MouseIn = 0x03,
    GfxRaw = 0x40,
    GfxPng = 0x41,
    GfxJpeg = 0x42,
    GfxH264 = 0x43,
    AudioPcm = 0x50,
    AudioOpus = 0x51,
}

impl Channel {
    pub fn from_raw(raw: u8) -> Option<Channel> {
        match raw {
            0x00 => Some(Channel::Control),
            0x01 => Some(Channel::TextOut),
            0x02 => Some(Channel::KeyboardIn),
            0x03 => Some(Channel::MouseIn),
            0x40 => Some(Channel::GfxRaw),
            0x41 => Some(Channel::GfxPng),
            0x42 => Some(Channel::GfxJpeg),
            0x43 => Some(Channel::GfxH264),
            0x50 => Some(Channel::AudioPcm),
            0x51 => Some(Channel::AudioOpus),
            _ => None,
        }
    }
}

/// CONTROL channel opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlMsg {
    Hello = 0x01,
    Goodbye = 0x02,
    ModeText = 0x10,
    ModeGraphics = 0x11,
    ModeUnsupported = 0x12,
    Refresh = 0x20,
    Resize = 0x21,
    CapsQuery = 0x30,
    CapsReply = 0x31,
}

impl ControlMsg {
    pub fn from_raw(raw: u8) -> Option<ControlMsg> {
        match raw {
            0x01 => Some(ControlMsg::Hello),
            0x02 => Some(ControlMsg::Goodbye),
            0x10 => Some(ControlMsg::ModeText),
            0x11 => Some(ControlMsg::ModeGraphics),
            0x12 => Some(ControlMsg::ModeUnsupported),
            0x20 => Some(ControlMsg::Refresh),
            0x21 => Some(ControlMsg::Resize),
            0x30 => Some(ControlMsg::CapsQuery),
            0x31 => Some(ControlMsg::CapsReply),
            _ => None,
        }
    }
}

/// Capability bytes listed in HELLO and CAPS_REPLY payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Capability {
    TextOutput = 0x01,
    KeyboardInput = 0x02,
    MouseInput = 0x03,
    GraphicsPng = 0x10,
    GraphicsJpeg = 0x11,
    GraphicsH264 = 0x12,
    AudioPcm = 0x20,
    AudioOpus = 0x21,
}

impl Capability {
    pub fn from_raw(raw: u8) -> Option<Capability> {
        match raw {
            0x01 => Some(Capability::TextOutput),
            0x02 => Some(Capability::KeyboardInput),
            0x03 => Some(Capability::MouseInput),
            0x10 => Some(Capability::GraphicsPng),
            0x11 => Some(Capability::GraphicsJpeg),
            0x12 => Some(Capability::GraphicsH264),
            0x20 => Some(Capability::AudioPcm),
            0x21 => Some(Capability::AudioOpus),
            _ => None,
        }
    }
}

/// Write one frame. Oversized payloads are dropped, and a short write is
/// reported without recovery; the next forced full refresh resynchronizes
/// the stream either way. Hard I/O errors propagate to the caller.
pub fn write_frame(stream: &mut UnixStream, channel: Channel, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_PAYLOAD {
        warn!(channel = channel as u8, len = payload.len(), "dropping oversized frame");
        return Ok(());
    }

    let len = payload.len();
    let header = [
        channel as u8,
        (len >> 16) as u8,
        (len >> 8) as u8,
        len as u8,
    ];

    let written = stream.write(&header)?;
    if written != HEADER_LEN {
        warn!(written, "short header write");
        return Ok(());
    }

    if !payload.is_empty() {
        let written = stream.write(payload)?;
        if written != len {
            warn!(written, len, "short payload write");
        }
    }

    Ok(())
}

/// Read one frame, returning the raw channel byte and the payload.
///
/// The stream may be non-blocking; partial reads are completed by polling
/// for readability, bounded so a stalled peer cannot wedge the caller. EOF
/// or a timeout fails the frame and the caller decides, via a peek probe,
/// whether the connection itself is gone.
pub fn read_frame(stream: &mut UnixStream) -> io::Result<(u8, Vec<u8>)> {
    let mut header = [0u8; HEADER_LEN];
    read_full(stream, &mut header)?;

    let channel = header[0];
    let len = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;

    let mut payload = vec![0u8; len];
    if len > 0 {
        read_full(stream, &mut payload)?;
    }

    Ok((channel, payload))
}

fn read_full(stream: &mut UnixStream, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    let mut spins = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                filled += n;
                spins = 0;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                spins += 1;
                if spins > MAX_READ_SPINS {
                    return Err(io::ErrorKind::TimedOut.into());
                }
                poll_readable(stream, READ_POLL_MS);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Poll one descriptor for readability, bounded by `timeout_ms`.
pub(crate) fn poll_readable(stream: &UnixStream, timeout_ms: u8) -> bool {
    let mut fds = [PollFd::new(stream.as_fd(), PollFlags::POLLIN)];
    matches!(poll(&mut fds, PollTimeout::from(timeout_ms)), Ok(n) if n > 0)
}
