//! Modbus RTU and ASCII slave over in-memory serial links
//!
//! The master side writes raw frames into a `tokio::io::duplex` pipe. Tests
//! run on a paused clock so RTU silence detection and the master activity
//! timeout advance deterministically.

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use voltage_slave::codec::{crc16, lrc};
use voltage_slave::{
    Address, LoopStatus, MemoryTable, SerialConfig, SerialLink, ServerConfig, SlaveServer,
    StatsSnapshot, Transport,
};

type Outcome = (Vec<LoopStatus>, StatsSnapshot);

fn config(protocol: Transport, rs485_delay_ms: Option<u64>) -> ServerConfig {
    ServerConfig {
        protocol,
        rs485_delay_ms,
        serial: SerialConfig {
            device: "loopback".to_string(),
            ..SerialConfig::default()
        },
        ..ServerConfig::default()
    }
}

/// Start a server on `link` and drive it until shutdown
fn spawn_server<L: SerialLink + 'static>(
    config: ServerConfig,
    link: L,
) -> (CancellationToken, JoinHandle<Outcome>) {
    let mut server = SlaveServer::new(config);
    server.add_data_table(Address(1), MemoryTable::new(Address(1)));
    server.add_data_table(Address(2), MemoryTable::new(Address(2)));
    server.startup_with_link(link).unwrap();
    let token = server.shutdown_handle();

    let task = tokio::spawn(async move {
        let mut statuses = Vec::new();
        loop {
            match server.server_loop().await.unwrap() {
                LoopStatus::Shutdown => break,
                status => statuses.push(status),
            }
        }
        server.shutdown().await;
        (statuses, server.stats())
    });
    (token, task)
}

fn rtu_frame(address: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = vec![address];
    frame.extend_from_slice(pdu);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

fn ascii_frame(address: u8, pdu: &[u8]) -> String {
    let mut bytes = vec![address];
    bytes.extend_from_slice(pdu);
    bytes.push(lrc(&bytes));
    let hex: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
    format!(":{hex}\r\n")
}

async fn read_exact_len(master: &mut DuplexStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    master.read_exact(&mut buf).await.unwrap();
    buf
}

/// Duplex link that records every RTS transition
struct Rs485Link {
    inner: DuplexStream,
    rts: Arc<Mutex<Vec<bool>>>,
}

impl AsyncRead for Rs485Link {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Rs485Link {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl SerialLink for Rs485Link {
    fn set_rts(&mut self, level: bool) -> io::Result<()> {
        self.rts.lock().push(level);
        Ok(())
    }
}

// ============================================================================
// RTU
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_rtu_read_holding() {
    let (mut master, link) = tokio::io::duplex(512);
    let (token, task) = spawn_server(config(Transport::Rtu, None), link);

    master
        .write_all(&rtu_frame(1, &[0x03, 0x00, 0x00, 0x00, 0x02]))
        .await
        .unwrap();
    let response = read_exact_len(&mut master, 9).await;
    assert_eq!(response, rtu_frame(1, &[0x03, 0x04, 0x00, 0x00, 0x00, 0x00]));

    token.cancel();
    let (statuses, stats) = task.await.unwrap();
    assert!(statuses.contains(&LoopStatus::Served {
        slave: Address(1),
        function_code: 0x03,
        responded: true,
    }));
    assert_eq!(stats.requests, 1);
}

#[tokio::test(start_paused = true)]
async fn test_rtu_bad_crc_dropped() {
    let (mut master, link) = tokio::io::duplex(512);
    let (token, task) = spawn_server(config(Transport::Rtu, None), link);

    let mut corrupt = rtu_frame(1, &[0x06, 0x00, 0x00, 0x00, 0x2A]);
    let last = corrupt.len() - 1;
    corrupt[last] ^= 0xFF;
    master.write_all(&corrupt).await.unwrap();
    sleep(Duration::from_millis(20)).await;

    master
        .write_all(&rtu_frame(1, &[0x03, 0x00, 0x00, 0x00, 0x01]))
        .await
        .unwrap();
    // The register still reads zero: the corrupt write was never executed
    let response = read_exact_len(&mut master, 7).await;
    assert_eq!(response, rtu_frame(1, &[0x03, 0x02, 0x00, 0x00]));

    token.cancel();
    let (_, stats) = task.await.unwrap();
    assert_eq!(stats.frames_dropped, 1);
    assert_eq!(stats.requests, 1);
}

#[tokio::test(start_paused = true)]
async fn test_rtu_broadcast_silent() {
    let (mut master, link) = tokio::io::duplex(512);
    let (token, task) = spawn_server(config(Transport::Rtu, None), link);

    master
        .write_all(&rtu_frame(0, &[0x06, 0x00, 0x04, 0x12, 0x34]))
        .await
        .unwrap();
    sleep(Duration::from_millis(20)).await;

    master
        .write_all(&rtu_frame(2, &[0x03, 0x00, 0x04, 0x00, 0x01]))
        .await
        .unwrap();
    let response = read_exact_len(&mut master, 7).await;
    assert_eq!(response, rtu_frame(2, &[0x03, 0x02, 0x12, 0x34]));

    token.cancel();
    let (statuses, stats) = task.await.unwrap();
    assert!(statuses.contains(&LoopStatus::Served {
        slave: Address(0),
        function_code: 0x06,
        responded: false,
    }));
    assert_eq!(stats.broadcasts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_rtu_unregistered_slave_silent() {
    let (mut master, link) = tokio::io::duplex(512);
    let (token, task) = spawn_server(config(Transport::Rtu, None), link);

    master
        .write_all(&rtu_frame(9, &[0x03, 0x00, 0x00, 0x00, 0x01]))
        .await
        .unwrap();
    sleep(Duration::from_millis(20)).await;
    master
        .write_all(&rtu_frame(1, &[0x07]))
        .await
        .unwrap();

    let response = read_exact_len(&mut master, 5).await;
    assert_eq!(response, rtu_frame(1, &[0x07, 0x55]));

    token.cancel();
    let (_, stats) = task.await.unwrap();
    assert_eq!(stats.requests, 1);
}

#[tokio::test(start_paused = true)]
async fn test_rtu_rs485_drives_transmit_enable() {
    let (mut master, inner) = tokio::io::duplex(512);
    let rts = Arc::new(Mutex::new(Vec::new()));
    let link = Rs485Link {
        inner,
        rts: Arc::clone(&rts),
    };
    let (token, task) = spawn_server(config(Transport::Rtu, Some(5)), link);

    master
        .write_all(&rtu_frame(1, &[0x06, 0x00, 0x00, 0x00, 0x2A]))
        .await
        .unwrap();
    let response = read_exact_len(&mut master, 8).await;
    assert_eq!(response, rtu_frame(1, &[0x06, 0x00, 0x00, 0x00, 0x2A]));

    token.cancel();
    task.await.unwrap();
    assert_eq!(*rts.lock(), vec![true, false]);
}

#[tokio::test(start_paused = true)]
async fn test_idle_line_reports_timeout() {
    let (_master, link) = tokio::io::duplex(512);
    let mut server = SlaveServer::new(config(Transport::Rtu, None));
    server.add_data_table(Address(1), MemoryTable::new(Address(1)));
    server.set_timeout(Duration::from_secs(2)).unwrap();
    server.startup_with_link(link).unwrap();

    let started = tokio::time::Instant::now();
    assert_eq!(server.server_loop().await.unwrap(), LoopStatus::Timeout);
    assert!(started.elapsed() >= Duration::from_secs(2));
}

// ============================================================================
// ASCII
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_ascii_read_holding_lower_case() {
    let (mut master, link) = tokio::io::duplex(512);
    let (token, task) = spawn_server(config(Transport::Ascii, None), link);

    let request = ascii_frame(1, &[0x03, 0x00, 0x00, 0x00, 0x02]).to_ascii_lowercase();
    master.write_all(request.as_bytes()).await.unwrap();

    let expected = ascii_frame(1, &[0x03, 0x04, 0x00, 0x00, 0x00, 0x00]);
    let response = read_exact_len(&mut master, expected.len()).await;
    assert_eq!(response, expected.as_bytes());

    token.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_ascii_bad_lrc_dropped() {
    let (mut master, link) = tokio::io::duplex(512);
    let (token, task) = spawn_server(config(Transport::Ascii, None), link);

    master
        .write_all(b":010600000001F7\r\n")
        .await
        .unwrap();
    master
        .write_all(ascii_frame(1, &[0x03, 0x00, 0x00, 0x00, 0x01]).as_bytes())
        .await
        .unwrap();

    let expected = ascii_frame(1, &[0x03, 0x02, 0x00, 0x00]);
    let response = read_exact_len(&mut master, expected.len()).await;
    assert_eq!(response, expected.as_bytes());

    token.cancel();
    let (_, stats) = task.await.unwrap();
    assert_eq!(stats.frames_dropped, 1);
}

#[tokio::test(start_paused = true)]
async fn test_ascii_partial_frame_discarded_on_timeout() {
    let (mut master, link) = tokio::io::duplex(512);
    let mut server = SlaveServer::new(config(Transport::Ascii, None));
    server.add_data_table(Address(1), MemoryTable::new(Address(1)));
    server.startup_with_link(link).unwrap();

    master.write_all(b":0103000000").await.unwrap();
    assert_eq!(server.server_loop().await.unwrap(), LoopStatus::Timeout);

    // Remainder of the abandoned frame followed by a complete one
    let mut tail = b"02FA\r\n".to_vec();
    tail.extend_from_slice(ascii_frame(1, &[0x07]).as_bytes());
    master.write_all(&tail).await.unwrap();

    let status = server.server_loop().await.unwrap();
    assert_eq!(
        status,
        LoopStatus::Served {
            slave: Address(1),
            function_code: 0x07,
            responded: true,
        }
    );

    let expected = ascii_frame(1, &[0x07, 0x55]);
    let response = read_exact_len(&mut master, expected.len()).await;
    assert_eq!(response, expected.as_bytes());
}
