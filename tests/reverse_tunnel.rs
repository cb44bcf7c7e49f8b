mod common;

use adbd_client::protocol::{AdbMessage, Command};
use adbd_client::AdbSocket;
use bytes::Bytes;
use common::{classic_transport, delayed_transport};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

fn channel_handler() -> (
    impl Fn(AdbSocket) -> anyhow::Result<()> + Send + Sync,
    mpsc::UnboundedReceiver<AdbSocket>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |socket: AdbSocket| {
        tx.send(socket)
            .map_err(|_| anyhow::anyhow!("listener went away"))
    };
    (handler, rx)
}

#[tokio::test]
async fn test_reverse_tunnel_accepts_device_socket() {
    let (transport, mut device) = classic_transport(4096);
    let (handler, mut accepted) = channel_handler();
    let address = transport
        .add_reverse_tunnel(handler, Some("tcp:8080"))
        .await
        .unwrap();
    assert_eq!(address, "tcp:8080");

    device.send(AdbMessage::open(77, 0, "tcp:8080\0")).await;
    let okay = device.expect(Command::OKAY).await;
    assert_eq!(okay.arg1, 77);
    assert_ne!(okay.arg0, 0);
    assert!(okay.payload.is_empty());

    let mut socket = timeout(Duration::from_secs(5), accepted.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(socket.service(), "tcp:8080");
    assert_eq!(socket.remote_id(), 77);
    assert_eq!(socket.local_id(), okay.arg0);

    let (written, _) = tokio::join!(socket.write(&b"hello"[..]), async {
        let wrte = device.expect(Command::WRTE).await;
        assert_eq!((wrte.arg0, wrte.arg1), (okay.arg0, 77));
        assert_eq!(wrte.payload.as_ref(), b"hello");
        device.send(AdbMessage::okay(77, okay.arg0)).await;
    });
    written.unwrap();

    device
        .send(AdbMessage::wrte(77, okay.arg0, Bytes::from_static(b"world")))
        .await;
    assert_eq!(&socket.read().await.unwrap()[..], b"world");
    device.expect(Command::OKAY).await;

    let stats = transport.stats().await.unwrap();
    assert_eq!(stats.device_sockets, 1);
    assert_eq!(stats.reverse_tunnels, 1);
}

#[tokio::test]
async fn test_reverse_tunnel_handler_declines() {
    let (transport, mut device) = classic_transport(4096);
    transport
        .add_reverse_tunnel(
            |_socket: AdbSocket| -> anyhow::Result<()> { Err(anyhow::anyhow!("busy")) },
            Some("tcp:9000"),
        )
        .await
        .unwrap();

    device.send(AdbMessage::open(78, 0, "tcp:9000\0")).await;
    let clse = device.expect(Command::CLSE).await;
    assert_eq!((clse.arg0, clse.arg1), (0, 78));
    // The declined socket's own close names no live socket.
    device.expect_silence(Duration::from_millis(100)).await;

    assert_eq!(transport.stats().await.unwrap().device_sockets, 0);
}

#[tokio::test]
async fn test_unregistered_address_refused() {
    let (transport, mut device) = classic_transport(4096);
    let (handler, _accepted) = channel_handler();
    transport
        .add_reverse_tunnel(handler, Some("tcp:8080"))
        .await
        .unwrap();
    assert!(transport.remove_reverse_tunnel("tcp:8080").await.unwrap());
    assert!(!transport.remove_reverse_tunnel("tcp:8080").await.unwrap());

    device.send(AdbMessage::open(79, 0, "tcp:8080\0")).await;
    let clse = device.expect(Command::CLSE).await;
    assert_eq!((clse.arg0, clse.arg1), (0, 79));
}

#[tokio::test]
async fn test_generated_addresses_and_clear() {
    let (transport, _device) = classic_transport(4096);
    let (first_handler, _first) = channel_handler();
    let (second_handler, _second) = channel_handler();

    let first = transport
        .add_reverse_tunnel(first_handler, None)
        .await
        .unwrap();
    let second = transport
        .add_reverse_tunnel(second_handler, None)
        .await
        .unwrap();
    assert!(first.starts_with("localabstract:reverse_"));
    assert!(second.starts_with("localabstract:reverse_"));

    let registered = transport.stats().await.unwrap().reverse_tunnels;
    // Two random u32 suffixes collide with negligible probability.
    assert!(registered == 2 || first == second);

    transport.clear_reverse_tunnels().await.unwrap();
    assert_eq!(transport.stats().await.unwrap().reverse_tunnels, 0);
}

#[tokio::test]
async fn test_delayed_ack_reverse_socket() {
    let (transport, mut device) = delayed_transport(1024, 4096);
    let (handler, mut accepted) = channel_handler();
    transport
        .add_reverse_tunnel(handler, Some("localabstract:agent"))
        .await
        .unwrap();

    // arg1 is the device's receive budget for this socket.
    device
        .send(AdbMessage::open(80, 1500, "localabstract:agent\0"))
        .await;
    let okay = device.expect(Command::OKAY).await;
    assert_eq!(okay.arg1, 80);
    assert_eq!(&okay.payload[..], &4096u32.to_le_bytes()[..]);

    let socket = accepted.recv().await.unwrap();
    let (_reader, mut writer) = socket.split();
    let write = tokio::spawn(async move {
        let result = writer.write(vec![9u8; 2000]).await;
        (writer, result)
    });

    let first = device.expect(Command::WRTE).await;
    let second = device.expect(Command::WRTE).await;
    assert_eq!(first.payload.len() + second.payload.len(), 1500);
    device.expect_silence(Duration::from_millis(100)).await;

    device
        .send(AdbMessage::okay_with_ack(80, okay.arg0, 1500))
        .await;
    let last = device.expect(Command::WRTE).await;
    assert_eq!(last.payload.len(), 500);
    let (_writer, result) = write.await.unwrap();
    result.unwrap();
}

#[tokio::test]
async fn test_classic_open_with_local_id_refused() {
    let (transport, mut device) = classic_transport(4096);
    let (handler, _accepted) = channel_handler();
    transport
        .add_reverse_tunnel(handler, Some("tcp:8080"))
        .await
        .unwrap();

    // A nonzero arg1 in classic mode does not announce a new socket.
    device.send(AdbMessage::open(81, 5, "tcp:8080\0")).await;
    let clse = device.expect(Command::CLSE).await;
    assert_eq!((clse.arg0, clse.arg1), (0, 81));
    assert_eq!(transport.stats().await.unwrap().device_sockets, 0);
}
