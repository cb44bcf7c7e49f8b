mod common;

use adbd_client::config::DispatcherConfig;
use adbd_client::protocol::constants::VERSION;
use adbd_client::protocol::{AdbError, AdbMessage, Command};
use adbd_client::session::DispatcherStats;
use adbd_client::{ConnectionState, DisconnectReason, SocketState};
use bytes::Bytes;
use common::{classic_transport, handshake_result, open_socket, transport_with, DEVICE_BANNER};
use tokio::time::{timeout, Duration};

const QUIET: Duration = Duration::from_millis(100);

#[tokio::test]
async fn test_writes_routed_to_matching_socket() {
    let (transport, mut device) = classic_transport(4096);
    let mut first = open_socket(&transport, &mut device, "shell:a", 100, None).await;
    let mut second = open_socket(&transport, &mut device, "shell:b", 200, None).await;
    assert_ne!(first.local_id(), second.local_id());
    assert_ne!(first.local_id(), 0);

    device
        .send(AdbMessage::wrte(100, first.local_id(), Bytes::from_static(b"one")))
        .await;
    device
        .send(AdbMessage::wrte(200, second.local_id(), Bytes::from_static(b"two")))
        .await;

    assert_eq!(&first.read().await.unwrap()[..], b"one");
    assert_eq!(&second.read().await.unwrap()[..], b"two");

    // Classic mode acknowledges every WRTE right away.
    let okay = device.expect(Command::OKAY).await;
    assert_eq!((okay.arg0, okay.arg1), (first.local_id(), 100));
    let okay = device.expect(Command::OKAY).await;
    assert_eq!((okay.arg0, okay.arg1), (second.local_id(), 200));

    // Right local id, wrong remote id: dropped.
    device
        .send(AdbMessage::wrte(999, first.local_id(), Bytes::from_static(b"lost")))
        .await;
    device.expect_silence(QUIET).await;
    assert!(timeout(QUIET, first.read()).await.is_err());

    let stats = transport.stats().await.unwrap();
    assert_eq!(
        stats,
        DispatcherStats {
            local_sockets: 2,
            device_sockets: 0,
            pending_opens: 0,
            reverse_tunnels: 0,
        }
    );
}

#[tokio::test]
async fn test_local_close_handshake() {
    let (transport, mut device) = classic_transport(4096);
    let mut socket = open_socket(&transport, &mut device, "shell:", 11, None).await;
    let local_id = socket.local_id();

    socket.close();
    let clse = device.expect(Command::CLSE).await;
    assert_eq!((clse.arg0, clse.arg1), (local_id, 11));
    assert!(matches!(
        socket.write(&b"late"[..]).await,
        Err(AdbError::SocketClosed { .. })
    ));

    device.send(AdbMessage::clse(11, local_id)).await;
    assert!(socket.read().await.is_none());
    socket.closed().await;
    assert_eq!(socket.state(), SocketState::Closed);
    // No echo for a socket that was already half-closed.
    device.expect_silence(QUIET).await;

    assert_eq!(transport.stats().await.unwrap().local_sockets, 0);
}

#[tokio::test]
async fn test_device_close_is_answered() {
    let (transport, mut device) = classic_transport(4096);
    let mut socket = open_socket(&transport, &mut device, "shell:", 12, None).await;
    let local_id = socket.local_id();

    device.send(AdbMessage::clse(12, local_id)).await;
    let clse = device.expect(Command::CLSE).await;
    assert_eq!((clse.arg0, clse.arg1), (local_id, 12));

    assert!(socket.read().await.is_none());
    assert_eq!(socket.state(), SocketState::Closed);
    assert!(matches!(
        socket.write(&b"x"[..]).await,
        Err(AdbError::SocketClosed { local_id: id }) if id == local_id
    ));
    assert_eq!(transport.stats().await.unwrap(), DispatcherStats::default());
}

#[tokio::test]
async fn test_dropped_socket_sends_close() {
    let (transport, mut device) = classic_transport(4096);
    let socket = open_socket(&transport, &mut device, "shell:", 13, None).await;
    let local_id = socket.local_id();

    drop(socket);
    let clse = device.expect(Command::CLSE).await;
    assert_eq!((clse.arg0, clse.arg1), (local_id, 13));
}

#[tokio::test]
async fn test_refused_connect_leaves_others_working() {
    let (transport, mut device) = classic_transport(4096);
    let mut shell = open_socket(&transport, &mut device, "shell:", 1, None).await;

    let (refused, _) = tokio::join!(transport.connect("jdwp:1234"), async {
        let open = device.expect(Command::OPEN).await;
        assert_eq!(open.payload.as_ref(), b"jdwp:1234");
        device.send(AdbMessage::clse(0, open.arg0)).await;
    });
    match refused {
        Err(AdbError::SocketRefused { service }) => assert_eq!(service, "jdwp:1234"),
        other => panic!("expected refusal, got {:?}", other),
    }

    let (written, _) = tokio::join!(shell.write(&b"id\n"[..]), async {
        let wrte = device.expect(Command::WRTE).await;
        assert_eq!(wrte.payload.as_ref(), b"id\n");
        device.send(AdbMessage::okay(1, wrte.arg0)).await;
    });
    written.unwrap();

    let stats = transport.stats().await.unwrap();
    assert_eq!(stats.local_sockets, 1);
    assert_eq!(stats.pending_opens, 0);
}

#[tokio::test]
async fn test_teardown_fails_outstanding_operations() {
    let (transport, mut device) = classic_transport(4096);
    let socket = open_socket(&transport, &mut device, "shell:", 7, None).await;
    let (mut reader, mut writer) = socket.split();

    let write = tokio::spawn(async move {
        let result = writer.write(&b"data"[..]).await;
        (writer, result)
    });
    // Received but never acknowledged.
    device.expect(Command::WRTE).await;

    let (connect, _) = tokio::join!(transport.connect("sync:"), async move {
        device.expect(Command::OPEN).await;
        drop(device);
    });
    assert!(matches!(connect, Err(AdbError::TransportClosed)));

    let (mut writer, result) = write.await.unwrap();
    assert!(matches!(result, Err(AdbError::TransportClosed)));
    assert!(reader.read().await.is_none());

    assert_eq!(transport.disconnected().await, DisconnectReason::EndOfStream);
    assert_eq!(transport.state(), ConnectionState::Disconnected);
    assert!(matches!(
        transport.connect("shell:").await,
        Err(AdbError::TransportClosed)
    ));
    assert!(matches!(
        writer.write(&b"again"[..]).await,
        Err(AdbError::TransportClosed)
    ));
}

#[tokio::test]
async fn test_close_sends_clse_for_open_sockets() {
    let (transport, mut device) = classic_transport(4096);
    let mut first = open_socket(&transport, &mut device, "shell:a", 21, None).await;
    let second = open_socket(&transport, &mut device, "shell:b", 22, None).await;
    let ids = [(first.local_id(), 21), (second.local_id(), 22)];

    transport.close().await;
    assert_eq!(transport.disconnected().await, DisconnectReason::Closed);

    let mut closed: Vec<(u32, u32)> = device
        .drain_until_eof()
        .await
        .into_iter()
        .filter(|packet| packet.command == Command::CLSE)
        .map(|packet| (packet.arg0, packet.arg1))
        .collect();
    closed.sort();
    let mut expected = ids.to_vec();
    expected.sort();
    assert_eq!(closed, expected);

    assert!(first.read().await.is_none());
    assert!(matches!(
        first.write(&b"x"[..]).await,
        Err(AdbError::TransportClosed)
    ));
}

#[tokio::test]
async fn test_read_time_limit_tears_down_idle_connection() {
    let config = DispatcherConfig {
        read_time_limit_ms: Some(100),
        ..Default::default()
    };
    let (transport, _device) =
        transport_with(handshake_result(VERSION, 4096, DEVICE_BANNER, 0), config);

    let reason = timeout(Duration::from_secs(5), transport.disconnected())
        .await
        .unwrap();
    match reason {
        DisconnectReason::Error(message) => assert!(message.contains("read timed out")),
        other => panic!("expected a timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_read_time_limit_allows_slow_packet() {
    let config = DispatcherConfig {
        read_time_limit_ms: Some(300),
        ..Default::default()
    };
    let (transport, mut device) =
        transport_with(handshake_result(VERSION, 4096, DEVICE_BANNER, 0), config);
    let mut socket = open_socket(&transport, &mut device, "shell:", 6, None).await;

    // The packet takes over a second to arrive, but bytes never stop
    // for longer than 100 ms.
    let packet = AdbMessage::wrte(6, socket.local_id(), Bytes::from(vec![5u8; 32])).serialize();
    for piece in packet.chunks(4) {
        device.send_raw(piece).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert_eq!(&socket.read().await.unwrap()[..], &[5u8; 32][..]);
    let okay = device.expect(Command::OKAY).await;
    assert_eq!((okay.arg0, okay.arg1), (socket.local_id(), 6));
    assert_eq!(transport.state(), ConnectionState::Operational);
}

#[tokio::test]
async fn test_classic_writes_acknowledged_before_read() {
    let (transport, mut device) = classic_transport(4096);
    let mut socket = open_socket(&transport, &mut device, "logcat", 12, None).await;
    assert_eq!(socket.state(), SocketState::Open);

    for chunk in [&b"a"[..], &b"bb"[..], &b"ccc"[..]] {
        device
            .send(AdbMessage::wrte(12, socket.local_id(), Bytes::copy_from_slice(chunk)))
            .await;
        let okay = device.expect(Command::OKAY).await;
        assert_eq!((okay.arg0, okay.arg1), (socket.local_id(), 12));
    }

    // Nothing was read yet; the chunks wait in order.
    assert_eq!(&socket.read().await.unwrap()[..], b"a");
    assert_eq!(&socket.read().await.unwrap()[..], b"bb");
    assert_eq!(&socket.read().await.unwrap()[..], b"ccc");
}

#[tokio::test]
async fn test_okay_for_unknown_socket_is_closed() {
    let (_transport, mut device) = classic_transport(4096);
    device.send(AdbMessage::okay(5, 99)).await;

    let clse = device.expect(Command::CLSE).await;
    assert_eq!((clse.arg0, clse.arg1), (99, 5));
}

#[tokio::test]
async fn test_cnxn_after_handshake_is_fatal() {
    let (transport, mut device) = classic_transport(4096);
    device
        .send(AdbMessage::cnxn(0x01000001, 4096, DEVICE_BANNER))
        .await;

    match transport.disconnected().await {
        DisconnectReason::Error(message) => assert!(message.contains("CNXN")),
        other => panic!("expected an error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_local_ids_are_unique() {
    let (transport, mut device) = classic_transport(4096);
    let mut sockets = Vec::new();
    for remote_id in 1..=5 {
        sockets.push(open_socket(&transport, &mut device, "shell:", remote_id, None).await);
    }
    let mut ids: Vec<u32> = sockets.iter().map(|s| s.local_id()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 5);
    assert!(!ids.contains(&0));
}
