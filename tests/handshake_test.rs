//! Session establishment: HELLO exchange, capabilities, mode announce.

use std::io::Read;
use std::time::Duration;

use textstream::protocol::{Channel, ControlMsg};

mod common;
use common::*;

#[test]
fn server_hello_is_sent_on_connect() {
    let server = start_server();
    let mut client = connect(&server);

    // Channel 0, length 7: HELLO, version 0.1, three capabilities
    // (text output, keyboard input, mouse input).
    let mut raw = [0u8; 11];
    client.read_exact(&mut raw).unwrap();
    assert_eq!(
        raw,
        [0x00, 0x00, 0x00, 0x07, 0x01, 0x00, 0x01, 0x03, 0x01, 0x02, 0x03]
    );
}

#[test]
fn client_hello_is_answered_with_mode_text() {
    let server = start_server();
    let mut client = connect(&server);

    let (channel, payload) = recv_frame(&mut client);
    assert_eq!(channel, Channel::Control as u8);
    assert_eq!(payload[0], ControlMsg::Hello as u8);

    // One capability: text output.
    send_control(&mut client, ControlMsg::Hello, &[0x00, 0x01, 0x01, 0x01]);

    // 80x25 before the first vsync has sampled anything.
    let reply = recv_on(&mut client, Channel::Control);
    assert_eq!(reply, [0x10, 0x00, 0x50, 0x00, 0x19]);
}

#[test]
fn undersized_hello_leaves_the_session_pre_handshake() {
    let server = start_server();
    let mut client = connect(&server);
    recv_frame(&mut client); // server hello

    send_control(&mut client, ControlMsg::Hello, &[0x00]);
    assert_no_frame(&mut client, Duration::from_millis(200));

    // A well-formed HELLO afterwards still completes the handshake.
    send_control(&mut client, ControlMsg::Hello, &[0x00, 0x01, 0x01, 0x01]);
    let reply = recv_on(&mut client, Channel::Control);
    assert_eq!(reply[0], ControlMsg::ModeText as u8);
}

#[test]
fn repeated_hello_is_idempotent() {
    let mut server = start_server();
    let mut client = connect(&server);
    handshake(&mut client);

    send_control(&mut client, ControlMsg::Hello, &[0x00, 0x01, 0x01, 0x01]);
    let reply = recv_on(&mut client, Channel::Control);
    assert_eq!(reply, [0x10, 0x00, 0x50, 0x00, 0x19]);

    // The session still streams normally afterwards.
    let video = FakeVideo::new_80x25();
    server.stream.on_vsync(&video);
    let body = recv_on(&mut client, Channel::TextOut);
    assert!(!body.is_empty());
}

#[test]
fn caps_query_is_answered_with_the_server_capability_set() {
    let server = start_server();
    let mut client = connect(&server);
    handshake(&mut client);

    send_control(&mut client, ControlMsg::CapsQuery, &[]);
    let reply = recv_on(&mut client, Channel::Control);
    assert_eq!(reply, [0x31, 0x03, 0x01, 0x02, 0x03]);
}

#[test]
fn unknown_control_opcode_is_dropped() {
    let server = start_server();
    let mut client = connect(&server);
    handshake(&mut client);

    send_raw_frame(&mut client, Channel::Control as u8, &[0x7E, 0xAA]);
    settle();

    // Connection is still usable.
    send_control(&mut client, ControlMsg::CapsQuery, &[]);
    let reply = recv_on(&mut client, Channel::Control);
    assert_eq!(reply[0], ControlMsg::CapsReply as u8);
}

#[test]
fn hello_capability_walk_honors_the_count_byte() {
    let server = start_server();
    let mut client = connect(&server);
    recv_frame(&mut client); // server hello

    // Count says one capability; the trailing graphics byte is padding the
    // walk must not read.
    send_control(
        &mut client,
        ControlMsg::Hello,
        &[0x00, 0x01, 0x01, 0x01, 0x10],
    );
    let reply = recv_on(&mut client, Channel::Control);
    assert_eq!(reply[0], ControlMsg::ModeText as u8);
}
