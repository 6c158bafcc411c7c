//! Integration tests for the OPEN state: sending, receiving, resets and
//! recovery from a faulty link.

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rdp_over_udp::{
    connection::{ConnError, Connection, OpenOptions},
    packet::{flags, Packet},
    receiver::Receiver,
    sender::Sender,
    simulator::{SimNetwork, SimSocket, SimulatorConfig},
    state::ConnectionState,
    timer::{BackoffRetransmit, TimerConfig},
};

const SERVER_PORT: u16 = 9000;

fn pump(a: &mut Connection<SimSocket>, b: &mut Connection<SimSocket>) {
    for _ in 0..32 {
        let moved = a.poll().unwrap() | b.poll().unwrap();
        if !moved {
            return;
        }
    }
    panic!("endpoints never went quiet");
}

/// Run the handshake between a client and a server built from the given
/// connections and options.
fn connect(
    net: &SimNetwork,
    mut client: Connection<SimSocket>,
    client_opts: OpenOptions,
    mut server: Connection<SimSocket>,
    server_opts: OpenOptions,
) -> (Connection<SimSocket>, Connection<SimSocket>) {
    server.open(server_opts).unwrap();
    client.open(client_opts).unwrap();
    pump(&mut client, &mut server);
    assert_eq!(client.state(), ConnectionState::Open);
    assert_eq!(server.state(), ConnectionState::Open);
    assert_eq!(net.queued(SERVER_PORT), 0);
    (client, server)
}

fn established(net: &SimNetwork) -> (Connection<SimSocket>, Connection<SimSocket>) {
    connect(
        net,
        Connection::new(net.socket()),
        OpenOptions::active(SimNetwork::addr(SERVER_PORT)),
        Connection::new(net.socket()),
        OpenOptions::passive(SERVER_PORT),
    )
}

#[test]
fn send_advances_snd_nxt_until_window_fills() {
    let net = SimNetwork::default();
    let (mut client, _server) = connect(
        &net,
        Connection::new(net.socket()),
        OpenOptions::active(SimNetwork::addr(SERVER_PORT)).with_snd_max(10),
        Connection::new(net.socket()),
        OpenOptions::passive(SERVER_PORT),
    );
    let start = client.sender().snd_nxt;

    client.send(b"hello").unwrap();
    assert_eq!(client.sender().snd_nxt, start.wrapping_add(5));

    let sent = Packet::decode(&net.peek(SERVER_PORT)[0].0).unwrap();
    assert_eq!(sent.header.flags, 0);
    assert_eq!(sent.header.seq_num, start);
    assert_eq!(sent.header.ack_num, client.receiver().rcv_cur);
    assert_eq!(sent.data, b"hello");

    client.send(b"world!").unwrap();
    assert_eq!(client.sender().snd_nxt, start.wrapping_add(11));

    assert!(matches!(client.send(b"x"), Err(ConnError::WindowFull)));
    assert_eq!(client.sender().snd_nxt, start.wrapping_add(11));
}

#[test]
fn oversized_segment_is_rejected() {
    let net = SimNetwork::default();
    let (mut client, _server) = connect(
        &net,
        Connection::new(net.socket()),
        OpenOptions::active(SimNetwork::addr(SERVER_PORT)).with_snd_max(10),
        Connection::new(net.socket()),
        OpenOptions::passive(SERVER_PORT),
    );
    let before = client.sender().clone();

    match client.send(&[0u8; 11]) {
        Err(ConnError::SegmentTooLarge { len, max }) => assert_eq!((len, max), (11, 10)),
        other => panic!("expected SegmentTooLarge, got {other:?}"),
    }
    assert_eq!(*client.sender(), before);
    assert_eq!(net.queued(SERVER_PORT), 0);
    client.send(&[0u8; 10]).unwrap();
}

#[test]
fn data_is_delivered_and_acknowledged() {
    let net = SimNetwork::default();
    let (mut client, mut server) = established(&net);
    let client_iss = client.sender().snd_iss;

    client.send(b"hello").unwrap();
    assert!(server.poll().unwrap());
    assert_eq!(server.receiver().rcv_cur, client_iss.wrapping_add(5));
    assert_eq!(server.receiver().buffered(), b"hello");

    let ack = Packet::decode(&net.peek(client.source_port())[0].0).unwrap();
    assert_eq!(ack.header.flags, flags::ACK);
    assert_eq!(ack.header.ack_num, client_iss.wrapping_add(5));
    assert!(ack.data.is_empty());

    assert_eq!(server.receive().unwrap().as_deref(), Some(&b"hello"[..]));
    assert_eq!(server.receive().unwrap(), None);

    // The ACK changes nothing on the sending side.
    let before = client.sender().clone();
    assert!(client.poll().unwrap());
    assert_eq!(*client.sender(), before);
    assert_eq!(client.state(), ConnectionState::Open);
}

#[test]
fn echo_in_both_directions() {
    let net = SimNetwork::default();
    let (mut client, mut server) = established(&net);

    client.send(b"ping").unwrap();
    pump(&mut client, &mut server);
    let got = server.receive().unwrap().unwrap();
    server.send(&got).unwrap();
    pump(&mut client, &mut server);

    assert_eq!(client.receive().unwrap().as_deref(), Some(&b"ping"[..]));
}

#[test]
fn consecutive_segments_accumulate() {
    let net = SimNetwork::default();
    let (mut client, mut server) = established(&net);

    client.send(b"abc").unwrap();
    client.send(b"def").unwrap();
    pump(&mut client, &mut server);

    assert_eq!(server.receive().unwrap().as_deref(), Some(&b"abcdef"[..]));
}

#[test]
fn swapped_segments_are_reassembled() {
    let net = SimNetwork::default();
    let (mut client, mut server) = connect(
        &net,
        Connection::new(net.socket()).with_retransmit(BackoffRetransmit::default()),
        OpenOptions::active(SimNetwork::addr(SERVER_PORT)),
        Connection::new(net.socket()),
        OpenOptions::passive(SERVER_PORT),
    );
    let client_iss = client.sender().snd_iss;

    client.send(b"abc").unwrap();
    client.send(b"def").unwrap();
    let mut queued = net.peek(SERVER_PORT);
    net.flush(SERVER_PORT);
    queued.reverse();
    for (bytes, from) in queued {
        net.inject(SERVER_PORT, bytes, from);
    }

    // "def" first: held, and the ACK still points before the gap.
    assert!(server.poll().unwrap());
    assert_eq!(server.receiver().rcv_cur, client_iss);
    assert_eq!(server.receiver().held(), 1);
    assert!(client.poll().unwrap());
    assert_eq!(client.retransmit().pending(), 2);

    // "abc" fills the gap and releases "def".
    assert!(server.poll().unwrap());
    assert_eq!(server.receiver().rcv_cur, client_iss.wrapping_add(6));
    assert!(client.poll().unwrap());
    assert_eq!(client.retransmit().pending(), 0);

    assert_eq!(server.receive().unwrap().as_deref(), Some(&b"abcdef"[..]));
}

#[test]
fn reordering_link_delivers_every_byte() {
    let net = SimNetwork::default();
    let (mut client, mut server) = connect(
        &net,
        Connection::new(net.socket()),
        OpenOptions::active(SimNetwork::addr(SERVER_PORT)).with_snd_max(64),
        Connection::new(net.socket()),
        OpenOptions::passive(SERVER_PORT),
    );

    client.send(b"first ").unwrap();
    net.set_config(SimulatorConfig {
        reorder_rate: 1.0,
        ..SimulatorConfig::default()
    });
    client.send(b"second").unwrap();
    assert_eq!(net.stats().reordered, 1);
    pump(&mut client, &mut server);

    assert_eq!(server.receive().unwrap().as_deref(), Some(&b"first second"[..]));
    assert_eq!(server.receiver().held(), 0);
}

#[test]
fn inbound_rst_resets_everything() {
    let net = SimNetwork::default();
    let (mut client, mut server) = established(&net);

    client.send(b"pending").unwrap();
    assert!(server.poll().unwrap());
    assert!(!server.receiver().buffered().is_empty());

    client.close().unwrap();
    assert!(server.poll().unwrap());

    assert_eq!(server.state(), ConnectionState::Closed);
    assert_eq!(*server.sender(), Sender::default());
    assert_eq!(*server.receiver(), Receiver::default());
    assert!(matches!(server.receive(), Err(ConnError::NotOpen)));
}

#[test]
fn unexpected_packets_in_open_are_ignored() {
    let net = SimNetwork::default();
    let (mut client, mut server) = established(&net);
    let before = (server.sender().clone(), server.receiver().clone());
    let from = SimNetwork::addr(client.source_port());

    let stray_syn = Packet::new(client.source_port(), SERVER_PORT, 1, 0, flags::SYN, Vec::new());
    let stray_ack = Packet::new(client.source_port(), SERVER_PORT, 1, 0, flags::ACK, Vec::new());
    assert_eq!(server.process(stray_syn, from).unwrap(), None);
    assert_eq!(server.process(stray_ack.clone(), from).unwrap(), None);
    assert_eq!(server.process(stray_ack, from).unwrap(), None);

    assert_eq!(server.state(), ConnectionState::Open);
    assert_eq!((server.sender().clone(), server.receiver().clone()), before);
    assert_eq!(net.queued(client.source_port()), 0);
    assert!(!client.poll().unwrap());
}

#[test]
fn corrupt_payload_is_dropped() {
    let net = SimNetwork::default();
    let (client, mut server) = established(&net);

    let good = client.sender().data_packet(
        client.source_port(),
        SERVER_PORT,
        client.receiver().rcv_cur,
        b"intact".to_vec(),
    );
    let mut bad = good.encode();
    let last = bad.len() - 1;
    bad[last] ^= 0x01;
    net.inject(SERVER_PORT, bad, SimNetwork::addr(client.source_port()));

    assert!(server.poll().unwrap());
    assert_eq!(server.state(), ConnectionState::Open);
    assert_eq!(server.receive().unwrap(), None);
    assert_eq!(net.queued(client.source_port()), 0, "no ACK for a corrupt packet");

    net.inject(SERVER_PORT, good.encode(), SimNetwork::addr(client.source_port()));
    assert_eq!(server.receive().unwrap().as_deref(), Some(&b"intact"[..]));
}

#[test]
fn duplicated_datagrams_are_delivered_once() {
    let net = SimNetwork::default();
    let (mut client, mut server) = established(&net);
    net.set_config(SimulatorConfig {
        duplicate_rate: 1.0,
        ..SimulatorConfig::default()
    });

    client.send(b"once").unwrap();
    assert_eq!(net.queued(SERVER_PORT), 2);
    pump(&mut client, &mut server);

    assert_eq!(server.receive().unwrap().as_deref(), Some(&b"once"[..]));
    assert_eq!(server.receive().unwrap(), None);
}

#[test]
fn receive_buffer_overflow_drops_segment_without_ack() {
    let net = SimNetwork::default();
    let (mut client, mut server) = connect(
        &net,
        Connection::new(net.socket()),
        OpenOptions::active(SimNetwork::addr(SERVER_PORT)).with_snd_max(64),
        Connection::new(net.socket()),
        OpenOptions::passive(SERVER_PORT).with_rmax_buf(8),
    );

    client.send(b"12345").unwrap();
    assert!(server.poll().unwrap());
    net.flush(client.source_port());
    let rcv_cur = server.receiver().rcv_cur;

    client.send(b"67890").unwrap();
    assert!(server.poll().unwrap());
    assert_eq!(server.receiver().rcv_cur, rcv_cur);
    assert_eq!(net.queued(client.source_port()), 0);

    assert_eq!(server.receive().unwrap().as_deref(), Some(&b"12345"[..]));
}

#[test]
fn lost_data_stays_lost_without_retransmission() {
    let net = SimNetwork::default();
    let (mut client, mut server) = established(&net);

    net.set_config(SimulatorConfig {
        loss_rate: 1.0,
        ..SimulatorConfig::default()
    });
    client.send(b"gone").unwrap();
    net.set_config(SimulatorConfig::default());

    let later = Instant::now() + Duration::from_secs(120);
    assert_eq!(client.poll_timers(later).unwrap(), 0);
    pump(&mut client, &mut server);
    assert_eq!(server.receive().unwrap(), None);
}

#[test]
fn backoff_policy_recovers_lost_data() {
    let net = SimNetwork::default();
    let (mut client, mut server) = connect(
        &net,
        Connection::new(net.socket()).with_retransmit(BackoffRetransmit::default()),
        OpenOptions::active(SimNetwork::addr(SERVER_PORT)),
        Connection::new(net.socket()),
        OpenOptions::passive(SERVER_PORT),
    );

    net.set_config(SimulatorConfig {
        loss_rate: 1.0,
        ..SimulatorConfig::default()
    });
    client.send(b"retry").unwrap();
    net.set_config(SimulatorConfig::default());
    assert_eq!(client.retransmit().pending(), 1);

    assert_eq!(client.poll_timers(Instant::now()).unwrap(), 0);
    let later = Instant::now() + Duration::from_secs(2);
    assert_eq!(client.poll_timers(later).unwrap(), 1);

    pump(&mut client, &mut server);
    assert_eq!(server.receive().unwrap().as_deref(), Some(&b"retry"[..]));
    assert_eq!(client.retransmit().pending(), 0);
}

#[test]
fn backoff_policy_over_a_lossy_link() {
    let net = SimNetwork::default();
    let (mut client, mut server) = connect(
        &net,
        Connection::new(net.socket()).with_retransmit(BackoffRetransmit::new(TimerConfig {
            max_retries: 40,
            ..TimerConfig::default()
        })),
        OpenOptions::active(SimNetwork::addr(SERVER_PORT)).with_snd_max(64),
        Connection::new(net.socket()),
        OpenOptions::passive(SERVER_PORT),
    );
    net.set_config(SimulatorConfig {
        loss_rate: 0.3,
        duplicate_rate: 0.1,
        seed: 2024,
        ..SimulatorConfig::default()
    });

    client.send(b"through the storm").unwrap();

    // Advance a virtual clock far enough for every back-off step.
    let mut now = Instant::now();
    for _ in 0..40 {
        pump(&mut client, &mut server);
        if client.retransmit().pending() == 0 {
            break;
        }
        now += Duration::from_secs(70);
        client.poll_timers(now).unwrap();
    }

    assert_eq!(
        server.receive().unwrap().as_deref(),
        Some(&b"through the storm"[..])
    );
}

#[test]
fn single_bit_flips_in_covered_fields_fail_verification() {
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..500 {
        let len = rng.random_range(1..64);
        let data: Vec<u8> = (0..len).map(|_| rng.random()).collect();
        let packet = Packet::new(
            rng.random(),
            rng.random(),
            rng.random(),
            rng.random(),
            rng.random::<u8>() & 0x1f,
            data,
        );
        let bytes = packet.encode();

        // Ports, sequence and ack numbers, the checksum itself, and the payload.
        let covered: Vec<usize> = (2..6).chain(10..18).chain(20..bytes.len()).collect();
        let byte = covered[rng.random_range(0..covered.len())];
        let mut mutated = bytes.clone();
        mutated[byte] ^= 1u8 << rng.random_range(0..8u32);

        let decoded = Packet::decode(&mutated).expect("length fields untouched");
        assert!(
            !decoded.verify(),
            "undetected flip at byte {byte} of {packet}"
        );
    }
}

#[test]
fn random_packets_survive_the_wire() {
    let mut rng = StdRng::seed_from_u64(99);

    for _ in 0..200 {
        let len = rng.random_range(0..128);
        let data: Vec<u8> = (0..len).map(|_| rng.random()).collect();
        let packet = Packet::new(
            rng.random(),
            rng.random(),
            rng.random(),
            rng.random(),
            rng.random::<u8>() & 0x1f,
            data,
        );
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert!(decoded.verify());
        assert_eq!(decoded, packet);
    }
}
