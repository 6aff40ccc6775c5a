mod common;

use common::initialized;
use jvmti_correlation::channel::{default_channel_path, ReturnChannel, ReturnFrame, RETURN_FRAME_SIZE};
use jvmti_correlation::AgentError;
use std::io::ErrorKind;
use std::os::unix::net::UnixDatagram;
use std::path::Path;

fn writer() -> UnixDatagram {
    UnixDatagram::unbound().unwrap()
}

/// Sends `count` copies of `message`, stopping early if the receive queue
/// fills up. Returns how many went out.
fn flood(to: &Path, message: &[u8], count: usize) -> usize {
    let socket = writer();
    socket.set_nonblocking(true).unwrap();
    for sent in 0..count {
        match socket.send_to(message, to) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => return sent,
            Err(e) => panic!("send failed: {e}"),
        }
    }
    count
}

#[test]
fn external_frame_lands_in_the_first_slot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("return.sock");
    let (agent, _runtime) = initialized();
    agent.open_return_channel(&path).unwrap();

    let frame: Vec<u8> = (0..24).collect();
    writer().send_to(&frame, &path).unwrap();

    let mut dst = [0xaau8; 240];
    assert_eq!(agent.receive_from_return_channel(&mut dst, 24), Ok(1));
    assert_eq!(dst[..24], frame[..]);
    assert!(dst[24..].iter().all(|b| *b == 0xaa));
    assert_eq!(agent.return_channel_path().as_deref(), Some(path.as_path()));
}

#[test]
fn short_datagrams_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let channel = ReturnChannel::open(dir.path().join("c")).unwrap();
    let peer = writer();
    peer.send_to(&[1; 10], channel.path()).unwrap();
    peer.send_to(&[2; 24], channel.path()).unwrap();

    let mut dst = [0u8; 48];
    assert_eq!(channel.receive(&mut dst, 24), Ok(1));
    assert_eq!(dst[..24], [2; 24]);
    channel.close().unwrap();
}

#[test]
fn oversized_datagrams_fill_their_slot() {
    let dir = tempfile::tempdir().unwrap();
    let channel = ReturnChannel::open(dir.path().join("c")).unwrap();
    writer().send_to(&[5; 30], channel.path()).unwrap();

    let mut dst = [0u8; 24];
    assert_eq!(channel.receive(&mut dst, 24), Ok(1));
    assert_eq!(dst, [5; 24]);
    channel.close().unwrap();
}

#[test]
fn empty_channel_reads_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let channel = ReturnChannel::open(dir.path().join("c")).unwrap();

    let mut dst = [7u8; 64];
    assert_eq!(channel.receive(&mut dst, 16), Ok(0));
    assert_eq!(dst, [7; 64]);
    channel.close().unwrap();
}

#[test]
fn reads_stop_at_the_last_whole_slot() {
    let dir = tempfile::tempdir().unwrap();
    let channel = ReturnChannel::open(dir.path().join("c")).unwrap();
    let peer = writer();
    for n in 1..=3u8 {
        peer.send_to(&[n; 5], channel.path()).unwrap();
    }

    let mut dst = [0u8; 14];
    assert_eq!(channel.receive(&mut dst, 5), Ok(2));
    assert_eq!(dst[..10], [1, 1, 1, 1, 1, 2, 2, 2, 2, 2]);
    assert_eq!(dst[10..], [0; 4]);
    assert_eq!(channel.receive(&mut dst, 5), Ok(1));
    assert_eq!(dst[..5], [3; 5]);
    assert_eq!(channel.receive(&mut dst, 5), Ok(0));
    channel.close().unwrap();
}

#[test]
fn a_queue_of_short_datagrams_drains_and_terminates() {
    let dir = tempfile::tempdir().unwrap();
    let channel = ReturnChannel::open(dir.path().join("c")).unwrap();
    let sent = flood(channel.path(), &[9; 3], 64);
    assert!(sent > 0);

    let mut dst = [0u8; 4 * 16];
    assert_eq!(channel.receive(&mut dst, 16), Ok(0));
    assert_eq!(channel.receive(&mut dst, 16), Ok(0));
    channel.close().unwrap();
}

#[test]
fn destination_smaller_than_a_slot_reads_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let channel = ReturnChannel::open(dir.path().join("c")).unwrap();
    writer().send_to(&[1; 8], channel.path()).unwrap();

    let mut dst = [0u8; 4];
    assert_eq!(channel.receive(&mut dst, 8), Ok(0));
    let mut dst = [0u8; 8];
    assert_eq!(channel.receive(&mut dst, 8), Ok(1));
    assert!(matches!(channel.receive(&mut dst, 0), Err(AgentError::InvalidArgument(_))));
    channel.close().unwrap();
}

#[test]
fn channel_is_single_instance() {
    let dir = tempfile::tempdir().unwrap();
    let (agent, _runtime) = initialized();

    assert!(matches!(agent.close_return_channel(), Err(AgentError::InvalidState(_))));
    assert!(matches!(agent.send_to_return_channel(b"x"), Err(AgentError::InvalidState(_))));
    assert!(matches!(
        agent.receive_from_return_channel(&mut [0u8; 8], 8),
        Err(AgentError::InvalidState(_))
    ));

    agent.open_return_channel(dir.path().join("a")).unwrap();
    assert!(matches!(
        agent.open_return_channel(dir.path().join("b")),
        Err(AgentError::InvalidState(_))
    ));
    assert!(!dir.path().join("b").exists());
}

#[test]
fn close_removes_the_socket_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("c");
    let (agent, _runtime) = initialized();

    agent.open_return_channel(&path).unwrap();
    assert!(path.exists());
    agent.close_return_channel().unwrap();
    assert!(!path.exists());
    assert!(agent.return_channel_path().is_none());

    // The path is free again.
    agent.open_return_channel(&path).unwrap();
}

#[test]
fn close_finishes_when_one_step_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("c");
    let (agent, _runtime) = initialized();
    agent.open_return_channel(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    let err = agent.close_return_channel().unwrap_err();
    assert!(matches!(err, AgentError::Transport { operation: "unlink", .. }), "{err}");
    assert!(agent.return_channel_path().is_none());

    // Neither the socket nor the path is left behind.
    agent.open_return_channel(&path).unwrap();
    agent.close_return_channel().unwrap();
    assert!(!path.exists());
}

#[test]
fn binding_an_existing_path_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("c");
    let first = ReturnChannel::open(&path).unwrap();

    let err = ReturnChannel::open(&path).unwrap_err();
    assert!(matches!(err, AgentError::Transport { operation: "bind", .. }), "{err}");
    first.close().unwrap();
}

#[test]
fn frames_sent_through_the_agent_come_back() {
    let dir = tempfile::tempdir().unwrap();
    let (agent, _runtime) = initialized();
    agent.open_return_channel(dir.path().join("c")).unwrap();
    let frame = ReturnFrame {
        trace_id: [1; 16],
        transaction_id: [2; 8],
        stack_trace_id: [3; 16],
        sample_count: 17,
    };

    agent.send_to_return_channel(&frame.encode()).unwrap();
    let mut dst = [0u8; 2 * RETURN_FRAME_SIZE];
    assert_eq!(agent.receive_from_return_channel(&mut dst, RETURN_FRAME_SIZE), Ok(1));
    assert_eq!(ReturnFrame::decode(&dst), Some(frame));
    assert_eq!(ReturnFrame::decode(&dst[..RETURN_FRAME_SIZE - 1]), None);
}

#[test]
fn default_path_is_in_the_temp_dir() {
    let path = default_channel_path();
    assert!(path.starts_with(std::env::temp_dir()));
    assert!(path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("jvmti_correlation_socket_")));
}
