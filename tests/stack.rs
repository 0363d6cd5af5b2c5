//! Ingress validation, socket-table exhaustion and stats output.

use std::time::Duration;

use ranp::header::{self, Flags, Header, Priority};
use ranp::testing;
use ranp::{
    NetStack, RxError, SocketKind, StackConfig, StackError, HEADER_SIZE, MAX_SOCKETS, POOL_SIZE,
};

fn frame(dst_node: u8, src_node: u8, dst_port: u8, src_port: u8, flags: Flags, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; HEADER_SIZE + payload.len()];
    let word = Header::new(dst_node, src_node, dst_port, src_port, flags).pack(Priority::Normal);
    header::write_word(word, &mut frame);
    frame[HEADER_SIZE..].copy_from_slice(payload);
    frame
}

#[test]
fn runt_frames_do_not_touch_the_pool() {
    let (stack, link, _inject, _read) = testing::dummy_stack(50);
    assert_eq!(stack.input(link, &[1, 2, 3]), Err(RxError::FrameTooShort));
    assert_eq!(stack.input(link, &[]), Err(RxError::FrameTooShort));
    assert_eq!(stack.pool().free_count(), POOL_SIZE);
}

#[test]
fn frames_for_other_nodes_are_dropped() {
    let (stack, link, _inject, _read) = testing::dummy_stack(50);
    let result = stack.input(link, &frame(77, 9, 1, 2, Flags::empty(), b"x"));
    assert_eq!(result, Err(RxError::WrongDestination(77)));
    assert_eq!(stack.pool().free_count(), POOL_SIZE);
}

#[test]
fn frames_without_a_socket_are_dropped() {
    let (stack, link, _inject, _read) = testing::dummy_stack(50);
    let result = stack.input(link, &frame(50, 9, 5, 2, Flags::empty(), &[0, b'x']));
    assert!(matches!(result, Err(RxError::NoSocket(_))));
    assert_eq!(stack.pool().free_count(), POOL_SIZE);
}

#[test]
fn overlong_frames_are_dropped() {
    let (stack, link, _inject, _read) = testing::dummy_stack(50);
    let oversize = vec![0u8; HEADER_SIZE + ranp::MTU + 1];
    assert_eq!(stack.input(link, &oversize), Err(RxError::FrameTooLong));
    assert_eq!(stack.pool().free_count(), POOL_SIZE);
}

#[test]
fn socket_table_exhaustion_and_reuse() {
    let stack = NetStack::new(StackConfig { local_node: 50 });
    let sockets: Vec<_> = (0..MAX_SOCKETS)
        .map(|_| stack.socket(SocketKind::Datagram).unwrap())
        .collect();
    assert!(matches!(
        stack.socket(SocketKind::Datagram),
        Err(StackError::NoFreeSocket)
    ));
    sockets[0].close().unwrap();
    let reopened = stack.socket(SocketKind::Reliable).unwrap();
    assert_eq!(reopened.kind(), SocketKind::Reliable);
}

#[test]
fn stats_cover_sockets_pool_and_routes() {
    let stack = NetStack::new(StackConfig { local_node: 50 });
    testing::loopback(&stack, "lo0").unwrap();
    stack.load_routes("50:lo0").unwrap();
    let server = stack.socket(SocketKind::Reliable).unwrap();
    server.bind(10).unwrap();
    server.listen(5).unwrap();
    let datagram = stack.socket(SocketKind::Datagram).unwrap();
    datagram.bind(20).unwrap();

    let mut out = String::new();
    stack.print_stats(&mut out).unwrap();
    assert!(out.contains("node 50"), "{}", out);
    assert!(out.contains("sockets: 2 active"), "{}", out);
    assert!(out.contains("Listening"), "{}", out);
    assert!(out.contains("port 10"), "{}", out);
    assert!(out.contains("port 20"), "{}", out);
    assert!(out.contains(&format!("pool: {}/{} packets free", POOL_SIZE, POOL_SIZE)), "{}", out);
    assert!(out.contains("routes: 1 entries over 1 links"), "{}", out);
}

#[test]
fn recv_timeout_is_distinct_from_reset() {
    let stack = NetStack::new(StackConfig { local_node: 50 });
    let socket = stack.socket(SocketKind::Reliable).unwrap();
    socket.bind(10).unwrap();
    let mut buf = [0u8; 4];
    assert!(matches!(
        socket.recv(&mut buf, Some(Duration::from_millis(20))),
        Err(StackError::Timeout)
    ));
}
