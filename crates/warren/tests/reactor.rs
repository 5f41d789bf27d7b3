use std::{
    io::{Read, Write},
    net::TcpStream,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use warren::{Conduit, Server, ServerConfig, Task, network::frame, signal};
use warren_network::{ChannelPair, SockProto, frame::ChannelOpen};
use warren_utils::codec;

fn echo_server(port: u16, heartbeat: bool) -> Server {
    let cfg = ServerConfig::default()
        .with_accept_turn(false)
        .with_heartbeat(heartbeat)
        .with_timeout(Duration::from_millis(5))
        .with_tick(Duration::from_millis(10));
    let mut server = Server::new(cfg);
    server.on_task_setup(|task| {
        task.on(1, 0, |req, out| match out.reply_command(1, 1, req.buf) {
            Ok(()) => 0,
            Err(_) => -1,
        });
    });
    server.add_listener("127.0.0.1", port, SockProto::Tcp).unwrap();
    server
}

/// Drives the reactor on its own thread until `stop` flips.
fn drive(mut server: Server, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            server.recv_once().unwrap();
            server.check_tick();
        }
    })
}

fn connect(port: u16) -> TcpStream {
    for _ in 0..100 {
        if let Ok(s) = TcpStream::connect(("127.0.0.1", port)) {
            return s;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("server on port {port} never came up");
}

#[test]
fn tcp_echo_roundtrip() {
    let port = 47811;
    let mut server = echo_server(port, false);
    server.single_prepare().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let handle = drive(server, Arc::clone(&stop));

    let mut client = connect(port);
    client.set_read_timeout(Some(Duration::from_secs(1))).unwrap();

    let mut framed = Vec::new();
    frame::frame_command(&mut framed, 1, 0, b"hi!").unwrap();
    client.write_all(&framed).unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(frame::total_len(&reply), 6);
    assert_eq!(reply[4], frame::KIND_COMMAND);
    assert_eq!(u16::from_ne_bytes([reply[5], reply[6]]), codec::cmd_id(1, 1));
    assert_eq!(&reply[7..], b"hi!");

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

#[test]
fn max_size_frame_echo() {
    let port = 47812;
    let mut server = echo_server(port, false);
    server.single_prepare().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let handle = drive(server, Arc::clone(&stop));

    let mut client = connect(port);
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let body: Vec<u8> = (0..frame::MAX_TOTAL_LEN - 3).map(|i| i as u8).collect();
    let mut framed = Vec::new();
    frame::frame_command(&mut framed, 1, 0, &body).unwrap();
    assert_eq!(framed.len(), frame::PACKAGE_SIZE);
    client.write_all(&framed).unwrap();

    let mut reply = vec![0u8; frame::PACKAGE_SIZE];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(frame::total_len(&reply), frame::total_len(&framed));
    assert_eq!(&reply[7..], &body[..]);

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

#[test]
fn framing_abuse_drops_only_the_offender() {
    let port = 47813;
    let mut server = echo_server(port, false);
    server.single_prepare().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let handle = drive(server, Arc::clone(&stop));

    let mut bad = connect(port);
    bad.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
    bad.write_all(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]).unwrap();

    // The abusive task is removed; the client observes EOF or a reset.
    let mut sink = [0u8; 16];
    match bad.read(&mut sink) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected {n} bytes after framing abuse"),
        Err(_) => {}
    }

    // A well-behaved peer is unaffected.
    let mut good = connect(port);
    good.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
    let mut framed = Vec::new();
    frame::frame_command(&mut framed, 1, 0, b"ok").unwrap();
    good.write_all(&framed).unwrap();
    let mut reply = [0u8; 9];
    good.read_exact(&mut reply).unwrap();
    assert_eq!(&reply[7..], b"ok");

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

#[test]
fn heartbeat_timeout_reaps_a_silent_peer() {
    let port = 47814;
    let mut server = echo_server(port, true);
    server.single_prepare().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let handle = drive(server, Arc::clone(&stop));

    let mut client = connect(port);
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    // Never answer. The sweep sends keepalives and eventually hangs up.
    let mut sink = [0u8; 256];
    let mut saw_eof = false;
    for _ in 0..100 {
        match client.read(&mut sink) {
            Ok(0) => {
                saw_eof = true;
                break;
            }
            Ok(_) => {} // keepalive frames
            Err(_) => {
                saw_eof = true;
                break;
            }
        }
    }
    assert!(saw_eof, "silent peer was never reaped");

    stop.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

#[test]
fn graceful_quit_drains_and_exits() {
    let port = 47815;
    let mut server = echo_server(port, true);

    let handle = thread::spawn(move || server.single_start());

    let client = connect(port);
    thread::sleep(Duration::from_millis(50));

    // Graceful drain: accepts cease, lingering peers are reaped by the
    // heartbeat sweep, then the reactor returns cleanly.
    signal::request_quit();
    handle.join().unwrap().unwrap();

    drop(client);
    assert!(TcpStream::connect(("127.0.0.1", port)).is_err(), "listener survived the drain");
}

#[test]
fn channel_open_installs_a_peer_channel() {
    let cfg = ServerConfig::default()
        .with_accept_turn(false)
        .with_heartbeat(false)
        .with_timeout(Duration::from_millis(5));
    let mut server = Server::new(cfg);
    server.single_prepare().unwrap();

    let pair = ChannelPair::open().unwrap();
    let write_fd = unsafe { libc::dup(pair.write_end()) };
    assert!(write_fd >= 0);
    server.add_task(Task::new(Conduit::Channel(pair)), mio::Interest::READABLE).unwrap();
    let before = server.task_count();

    // Hand a listening socket to slot 5 over the bus.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let open = ChannelOpen {
        slot: 5,
        pid: 777,
        fd: {
            use std::os::fd::AsRawFd;
            listener.as_raw_fd()
        },
    };
    let mut framed = Vec::new();
    frame::frame_channel_open(&mut framed, &open).unwrap();
    let mut sender = ChannelPair::from_write_end(write_fd);
    assert_eq!(sender.send_bytes(&framed).unwrap(), framed.len());

    for _ in 0..100 {
        server.recv_once().unwrap();
        if server.task_count() > before {
            break;
        }
    }
    assert_eq!(server.task_count(), before + 1, "peer channel task missing");
}
