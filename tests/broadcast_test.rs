//! Tests for best-effort broadcast when one client's transport is broken

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream, ReadBuf};
use tokio::time::{sleep, timeout, Duration};
use tokio_test::assert_ok;

use lobby::{ClientId, Config, ConnectionManager, SessionHandlers};

/// Stream that reads normally but fails every write
struct BrokenWriter {
    inner: DuplexStream,
}

impl AsyncRead for BrokenWriter {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for BrokenWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "peer stopped reading",
        )))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn manager_with(handlers: SessionHandlers) -> ConnectionManager {
    ConnectionManager::new(Arc::new(Config::default()), handlers)
}

async fn expect_text(stream: &mut DuplexStream, expected: &str) {
    let mut buf = vec![0u8; expected.len()];
    assert_ok!(
        timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .expect("timed out waiting for broadcast")
    );
    assert_eq!(String::from_utf8_lossy(&buf), expected);
}

async fn wait_for_count(manager: &ConnectionManager, expected: usize) {
    timeout(Duration::from_secs(5), async {
        while manager.client_count() != expected {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("client count never settled");
}

#[tokio::test]
async fn test_broadcast_survives_failing_client() {
    let ended = Arc::new(Mutex::new(Vec::<ClientId>::new()));
    let sink = Arc::clone(&ended);
    let manager = manager_with(SessionHandlers::new().on_disconnect(move |client| {
        sink.lock().unwrap().push(client.id());
    }));

    let (b_side, mut b) = duplex(4096);
    manager.accept_connection(b_side, None);
    expect_text(&mut b, "A new player joined!\n1 player is connected.\n").await;

    let (c_side, mut c) = duplex(4096);
    manager.accept_connection(c_side, None);
    let second_join = "A new player joined!\n2 players are connected.\n";
    expect_text(&mut b, second_join).await;
    expect_text(&mut c, second_join).await;

    // keep the peer alive so the broken client only fails on write
    let (broken_side, _broken_peer) = duplex(4096);
    let broken = manager.accept_connection(BrokenWriter { inner: broken_side }, None);

    let expected =
        "A new player joined!\n3 players are connected.\nA player has left!\n2 players are connected.\n";
    expect_text(&mut b, expected).await;
    expect_text(&mut c, expected).await;

    wait_for_count(&manager, 2).await;
    assert!(!manager.client_ids().contains(&broken.id()));
    assert_eq!(*ended.lock().unwrap(), vec![broken.id()]);

    let report = manager.broadcast("still here?\n");
    assert_eq!(report.delivered, 2);
    assert!(report.is_complete());
    expect_text(&mut b, "still here?\n").await;
    expect_text(&mut c, "still here?\n").await;
}

#[tokio::test]
async fn test_broadcast_order_matches_join_order() {
    let manager = manager_with(SessionHandlers::new());

    let mut streams = Vec::new();
    for _ in 0..3 {
        let (side, stream) = duplex(4096);
        manager.accept_connection(side, None);
        streams.push(stream);
    }

    let ids = manager.client_ids();
    assert_eq!(ids.len(), 3);
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));

    let report = manager.broadcast("go\n");
    assert_eq!(report.delivered, 3);
    assert_eq!(report.attempted(), 3);
}

#[tokio::test]
async fn test_handler_may_broadcast_from_callbacks() {
    let manager = manager_with(SessionHandlers::new());

    let lobby = manager.clone();
    manager.bind_handlers(SessionHandlers::new().on_connect(move |client| {
        lobby.broadcast(&format!("welcome {}\n", client.id().as_u64()));
    }));

    let (side, mut stream) = duplex(4096);
    let client = manager.accept_connection(side, None);

    let expected = format!(
        "A new player joined!\n1 player is connected.\nwelcome {}\n",
        client.id().as_u64()
    );
    expect_text(&mut stream, &expected).await;
}
