//! Serial line session (RTU / ASCII)
//!
//! One link, one request in flight. A step waits for the next valid frame up
//! to the master activity timeout, dispatches it and transmits the response
//! before returning.

use bytes::BytesMut;
use futures::StreamExt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::codec::{Encoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::stats::ServerStats;
use super::LoopStatus;
use crate::codec::{CharTiming, SerialCodec};
use crate::dispatcher::RequestDispatcher;
use crate::error::{Result, SlaveError};
use crate::registry::DataTableRegistry;
use crate::types::Adu;

#[cfg(feature = "serial")]
use super::config::{Parity, SerialConfig};

/// Byte stream of an opened serial port
///
/// The engine only needs reads, writes and, for RS-485, control of the
/// transmit enable line. Links without such a line keep the default.
pub trait SerialLink: AsyncRead + AsyncWrite + Unpin + Send {
    /// Drive the RTS line used as RS-485 transmit enable
    fn set_rts(&mut self, _level: bool) -> io::Result<()> {
        Ok(())
    }
}

impl SerialLink for tokio::io::DuplexStream {}

#[cfg(feature = "serial")]
impl SerialLink for tokio_serial::SerialStream {
    fn set_rts(&mut self, level: bool) -> io::Result<()> {
        tokio_serial::SerialPort::write_request_to_send(self, level).map_err(io::Error::from)
    }
}

/// Open and configure the serial device
#[cfg(feature = "serial")]
pub(crate) fn open_port(config: &SerialConfig) -> Result<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;

    let parity = match config.parity {
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::None => tokio_serial::Parity::None,
    };

    let data_bits = match config.data_bits {
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };

    let stop_bits = match config.stop_bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    };

    tokio_serial::new(&config.device, config.baud_rate)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .open_native_async()
        .map_err(|e| {
            SlaveError::transport(format!(
                "Failed to open serial port {}: {e}",
                config.device
            ))
        })
}

pub(crate) struct SerialSession {
    framed: FramedRead<Box<dyn SerialLink>, SerialCodec>,
    timing: CharTiming,
    rs485_delay: Option<Duration>,
}

impl SerialSession {
    pub(crate) fn new(
        link: Box<dyn SerialLink>,
        codec: SerialCodec,
        timing: CharTiming,
        rs485_delay: Option<Duration>,
    ) -> Self {
        Self {
            framed: FramedRead::new(link, codec),
            timing,
            rs485_delay,
        }
    }

    /// Wait for one request and answer it
    pub(crate) async fn step(
        &mut self,
        registry: &DataTableRegistry,
        stats: &ServerStats,
        master_timeout: Duration,
        token: &CancellationToken,
    ) -> Result<LoopStatus> {
        let deadline = Instant::now() + master_timeout;

        loop {
            let silence = self.framed.decoder().next_deadline();

            let received = tokio::select! {
                _ = token.cancelled() => return Ok(LoopStatus::Shutdown),
                frame = self.framed.next() => match frame {
                    Some(Ok(adu)) => Some(adu),
                    Some(Err(e)) => return Err(SlaveError::transport(format!("Serial read failed: {e}"))),
                    None => return Err(SlaveError::transport("Serial link closed")),
                },
                _ = sleep_until(silence.unwrap_or(deadline)), if silence.is_some() => {
                    self.framed.decoder_mut().poll_silence(Instant::now())
                },
                _ = sleep_until(deadline) => {
                    if self.framed.decoder().in_frame() {
                        debug!("Master timeout, discarding partial frame");
                    }
                    self.framed.decoder_mut().reset();
                    self.framed.read_buffer_mut().clear();
                    stats.record_dropped(self.framed.decoder_mut().take_dropped());
                    return Ok(LoopStatus::Timeout);
                },
            };

            stats.record_dropped(self.framed.decoder_mut().take_dropped());

            let Some(request) = received else {
                continue;
            };
            let slave = request.address();
            if !slave.is_broadcast() && !registry.contains(slave) {
                debug!("Frame for slave {} ignored", slave);
                continue;
            }

            return self.serve(request, registry, stats).await;
        }
    }

    async fn serve(
        &mut self,
        request: Adu,
        registry: &DataTableRegistry,
        stats: &ServerStats,
    ) -> Result<LoopStatus> {
        let slave = request.address();
        let function_code = request.pdu.function_code();

        let response = RequestDispatcher::handle(slave, &request.pdu, registry);
        stats.record_request(
            slave.is_broadcast(),
            response.as_ref().is_some_and(|pdu| pdu.is_exception()),
        );

        let responded = response.is_some();
        if let Some(pdu) = response {
            self.transmit(request.reply(pdu)).await?;
        }

        Ok(LoopStatus::Served {
            slave,
            function_code,
            responded,
        })
    }

    async fn transmit(&mut self, response: Adu) -> Result<()> {
        let mut buf = BytesMut::new();
        self.framed.decoder_mut().encode(response, &mut buf)?;

        let busy = self.timing.transmit_time(buf.len());
        let link = self.framed.get_mut();

        let Some(delay) = self.rs485_delay else {
            link.write_all(&buf).await?;
            link.flush().await?;
            return Ok(());
        };

        // Transmit enable stays asserted until the last character has left the line
        link.set_rts(true)?;
        let sent = async {
            link.write_all(&buf).await?;
            link.flush().await?;
            sleep(busy + delay).await;
            Ok::<(), io::Error>(())
        }
        .await;
        let released = link.set_rts(false);

        sent?;
        released?;
        Ok(())
    }
}
