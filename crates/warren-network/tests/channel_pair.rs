use std::{mem, os::fd::RawFd, thread, time::Duration};

use warren_network::{
    ChannelPair, NetError,
    frame::{self, ChannelOpen},
};

fn fstat(fd: RawFd) -> (u64, u64) {
    let mut st: libc::stat = unsafe { mem::zeroed() };
    assert_eq!(unsafe { libc::fstat(fd, &mut st) }, 0);
    (st.st_dev, st.st_ino)
}

#[test]
fn command_frame_roundtrip() {
    let mut pair = ChannelPair::open().unwrap();

    let mut sent = Vec::new();
    frame::frame_command(&mut sent, 4, 2, b"work").unwrap();
    assert_eq!(pair.send_bytes(&sent).unwrap(), sent.len());

    let mut buf = [0u8; 256];
    let (n, fd) = pair.recv_bytes(&mut buf).unwrap();
    assert_eq!(&buf[..n], &sent[..]);
    assert!(fd.is_none());
}

#[test]
fn empty_read_is_benign() {
    let mut pair = ChannelPair::open().unwrap();
    let mut buf = [0u8; 64];
    let (n, fd) = pair.recv_bytes(&mut buf).unwrap();
    assert_eq!(n, 0);
    assert!(fd.is_none());
}

#[test]
fn peer_close_is_classified() {
    let mut pair = ChannelPair::open().unwrap();
    pair.close_end(0);
    let mut buf = [0u8; 64];
    assert!(matches!(pair.recv_bytes(&mut buf), Err(NetError::ClosedByPeer)));
}

#[test]
fn channel_open_passes_a_descriptor() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let listen_fd = {
        use std::os::fd::AsRawFd;
        listener.as_raw_fd()
    };

    let mut pair = ChannelPair::open().unwrap();
    let open = ChannelOpen { slot: 2, pid: unsafe { libc::getpid() }, fd: listen_fd };
    let mut framed = Vec::new();
    frame::frame_channel_open(&mut framed, &open).unwrap();
    assert_eq!(pair.send_bytes(&framed).unwrap(), framed.len());

    let mut buf = [0u8; 512];
    let (n, passed) = pair.recv_bytes(&mut buf).unwrap();
    assert_eq!(n, framed.len());
    let passed = passed.expect("descriptor should ride the control message");

    // Same open file description underneath.
    assert_eq!(fstat(listen_fd), fstat(passed));

    // The duplicated descriptor is a working listener: accept through it.
    let client = thread::spawn(move || {
        std::net::TcpStream::connect(addr).unwrap();
    });
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let mut accepted = -1;
    for _ in 0..200 {
        accepted = unsafe {
            libc::accept(passed, (&mut sa as *mut libc::sockaddr_in).cast(), &mut len)
        };
        if accepted >= 0 {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert!(accepted >= 0, "accept through the passed descriptor failed");
    client.join().unwrap();

    unsafe {
        libc::close(accepted);
        libc::close(passed);
    }
}
