//! Fragmentation and reassembly over reliable sockets.

use std::thread;
use std::time::Duration;

use ranp::header::{self, Flags, Header, Priority};
use ranp::pool::PacketPool;
use ranp::sfp::{SFP_BEGIN, SFP_CHUNK, SFP_MORE};
use ranp::testing;
use ranp::{
    NetStack, Socket, SocketKind, StackConfig, StackError, HEADER_SIZE, POOL_SIZE,
};

fn loop_stack(node: u8) -> NetStack {
    let stack = NetStack::new(StackConfig { local_node: node });
    testing::loopback(&stack, "lo0").unwrap();
    stack.load_routes(&format!("{}:lo0", node)).unwrap();
    stack
}

fn connected_pair(stack: &NetStack) -> (Socket, Socket) {
    let server = stack.socket(SocketKind::Reliable).unwrap();
    server.bind(10).unwrap();
    server.listen(5).unwrap();
    let client = stack.socket(SocketKind::Reliable).unwrap();
    client.bind(11).unwrap();
    client.connect(stack.local_node(), 10).unwrap();
    let accepted = server.accept(Some(Duration::from_secs(1))).unwrap();
    (client, accepted)
}

fn wait_pool_full(pool: &PacketPool) {
    for _ in 0..200 {
        if pool.free_count() == POOL_SIZE {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("pool did not drain back to full: {} free", pool.free_count());
}

#[test]
fn fragmentation_round_trip() {
    let stack = loop_stack(50);
    let (client, accepted) = connected_pair(&stack);

    let message = vec![b'A'; 512];
    let sender = {
        let message = message.clone();
        thread::spawn(move || client.send_sfp(&message).unwrap())
    };

    let head = accepted.recv_sfp(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(sender.join().unwrap(), 512);

    let pool = stack.pool();
    let mut lengths = Vec::new();
    let mut reassembled = Vec::new();
    let mut cursor = Some(head);
    while let Some(packet) = cursor {
        cursor = pool.with(packet, |p| {
            lengths.push(p.len());
            reassembled.extend_from_slice(p.payload());
            p.next()
        });
    }
    assert_eq!(lengths, vec![SFP_CHUNK, SFP_CHUNK, SFP_CHUNK, SFP_CHUNK, 20]);
    assert_eq!(SFP_CHUNK, 123);
    assert_eq!(reassembled, message);

    pool.free_chain(Some(head));
    wait_pool_full(pool);
}

#[test]
fn single_fragment_message() {
    let stack = loop_stack(50);
    let (client, accepted) = connected_pair(&stack);

    let sender = thread::spawn(move || client.send_sfp(b"tiny").unwrap());
    let head = accepted.recv_sfp(Some(Duration::from_secs(2))).unwrap();
    assert_eq!(sender.join().unwrap(), 4);

    let pool = stack.pool();
    pool.with(head, |p| {
        assert_eq!(p.payload(), b"tiny");
        assert_eq!(p.next(), None);
    });
    pool.free_chain(Some(head));
    wait_pool_full(pool);
}

#[test]
fn empty_message_sends_one_fragment() {
    let stack = loop_stack(50);
    let (client, accepted) = connected_pair(&stack);

    let sender = thread::spawn(move || client.send_sfp(&[]).unwrap());
    let head = accepted.recv_sfp(Some(Duration::from_secs(2))).unwrap();
    assert_eq!(sender.join().unwrap(), 0);

    let pool = stack.pool();
    pool.with(head, |p| {
        assert!(p.is_empty());
        assert_eq!(p.next(), None);
    });
    pool.free_chain(Some(head));
    wait_pool_full(pool);
}

#[test]
fn sfp_is_refused_on_datagram_sockets() {
    let stack = loop_stack(50);
    let socket = stack.socket(SocketKind::Datagram).unwrap();
    socket.bind(20).unwrap();
    assert!(matches!(
        socket.send_sfp(b"nope"),
        Err(StackError::IllegalArgument)
    ));
    assert!(matches!(
        socket.recv_sfp(Some(Duration::from_millis(10))),
        Err(StackError::IllegalArgument)
    ));
}

#[test]
fn oversized_message_is_refused() {
    let stack = loop_stack(50);
    let (client, _accepted) = connected_pair(&stack);
    let too_big = vec![0u8; SFP_CHUNK * 256];
    assert!(matches!(
        client.send_sfp(&too_big),
        Err(StackError::TooLargePayload)
    ));
}

#[test]
fn out_of_sequence_fragment_aborts_reassembly() {
    let (stack, _link, inject, read) = testing::dummy_stack(50);
    stack.load_routes("99:mock0").unwrap();
    let server = stack.socket(SocketKind::Reliable).unwrap();
    server.bind(10).unwrap();
    server.listen(5).unwrap();

    let syn = {
        let mut frame = vec![0u8; HEADER_SIZE];
        let word = Header::new(50, 99, 10, 11, Flags::SYN).pack(Priority::Normal);
        header::write_word(word, &mut frame);
        frame
    };
    inject.send(syn).unwrap();
    read.recv_timeout(Duration::from_secs(1)).unwrap(); // SYN-ACK
    let accepted = server.accept(Some(Duration::from_secs(1))).unwrap();

    let fragment = |seq: u8, sfp: u8, byte: u8| {
        let mut frame = vec![0u8; HEADER_SIZE + 3];
        let word = Header::new(50, 99, 10, 11, Flags::empty()).pack(Priority::Normal);
        header::write_word(word, &mut frame);
        frame[HEADER_SIZE..].copy_from_slice(&[seq, sfp, byte]);
        frame
    };
    // Fragment 0 announces more to come; the next one skips id 1.
    inject.send(fragment(0, SFP_BEGIN | SFP_MORE, b'a')).unwrap();
    inject.send(fragment(1, SFP_MORE | 2, b'b')).unwrap();

    assert!(matches!(
        accepted.recv_sfp(Some(Duration::from_secs(1))),
        Err(StackError::BadFragment)
    ));
    wait_pool_full(stack.pool());
}
