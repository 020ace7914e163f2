//! Slave server orchestration
//!
//! [`SlaveServer`] owns the configuration, the data table registry and the
//! transport session chosen at startup. It never loops on its own:
//! [`SlaveServer::server_loop`] performs one step and reports what happened,
//! so the host decides when to stop.
//!
//! ```text
//! new(config) -> add_data_table(..) -> startup() -> server_loop()* -> shutdown()
//! ```

pub mod config;
mod serial;
pub mod stats;
mod tcp;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use config::{Parity, SerialConfig, ServerConfig, TcpConfig};
pub use serial::SerialLink;
pub use stats::{ServerStats, StatsSnapshot};

use crate::codec::{AsciiCodec, CharTiming, RtuCodec, SerialCodec};
use crate::error::{Result, SlaveError};
use crate::registry::{DataTableRegistry, SharedTable};
use crate::table::DataTable;
use crate::types::{Address, Transport};
use serial::SerialSession;
use tcp::TcpSession;

/// Accept-time predicate over the peer address of a TCP master
pub type AddressValidator = Arc<dyn Fn(&SocketAddr) -> bool + Send + Sync>;

/// Outcome of one [`SlaveServer::server_loop`] step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStatus {
    /// A request was dispatched; `responded` is false for broadcasts
    Served {
        slave: Address,
        function_code: u8,
        responded: bool,
    },
    /// TCP connection admitted
    Accepted(SocketAddr),
    /// TCP connection refused by the validator or the connection limit
    Rejected(SocketAddr),
    /// TCP connection ended (peer close, idle timeout, corrupt stream)
    Closed(SocketAddr),
    /// No valid request within the master activity timeout
    Timeout,
    /// Shutdown was requested through the shutdown handle
    Shutdown,
}

impl fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopStatus::Served {
                slave,
                function_code,
                responded,
            } => {
                write!(f, "slave {slave} served FC{function_code:02}")?;
                if !responded {
                    f.write_str(" (no response)")?;
                }
                Ok(())
            },
            LoopStatus::Accepted(peer) => write!(f, "connection from {peer} accepted"),
            LoopStatus::Rejected(peer) => write!(f, "connection from {peer} rejected"),
            LoopStatus::Closed(peer) => write!(f, "connection from {peer} closed"),
            LoopStatus::Timeout => f.write_str("master activity timeout"),
            LoopStatus::Shutdown => f.write_str("shutdown requested"),
        }
    }
}

/// Transport session selected at startup
enum Session {
    Serial(SerialSession),
    Tcp(TcpSession),
}

/// Modbus slave server for one transport
pub struct SlaveServer {
    config: ServerConfig,
    registry: Arc<DataTableRegistry>,
    stats: Arc<ServerStats>,
    session: Option<Session>,
    token: CancellationToken,
}

impl SlaveServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            registry: Arc::new(DataTableRegistry::new()),
            stats: Arc::new(ServerStats::default()),
            session: None,
            token: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &DataTableRegistry {
        &self.registry
    }

    /// Register (or replace) the table serving `address`
    ///
    /// TCP connections opened before the call keep the registry they were
    /// admitted with.
    pub fn add_data_table<T>(&mut self, address: Address, table: T) -> SharedTable
    where
        T: DataTable + 'static,
    {
        Arc::make_mut(&mut self.registry).add_data_table(address, table)
    }

    /// Register a table that is already shared with the host
    pub fn add_shared_table(&mut self, address: Address, table: SharedTable) {
        Arc::make_mut(&mut self.registry).add_shared(address, table);
    }

    /// Change the master activity timeout
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        config::check_master_timeout(millis)?;
        self.config.master_timeout_ms = millis;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        self.config.master_timeout()
    }

    /// Start the transport named by the configuration
    pub async fn startup(&mut self) -> Result<()> {
        match self.config.protocol {
            Transport::Tcp => self.startup_tcp(None).await.map(|_| ()),
            #[cfg(feature = "serial")]
            Transport::Rtu | Transport::Ascii => self.startup_serial(),
            #[cfg(not(feature = "serial"))]
            Transport::Rtu | Transport::Ascii => Err(SlaveError::illegal_argument(
                "serial support not compiled in, use startup_with_link",
            )),
        }
    }

    /// Bind the TCP listener
    ///
    /// `validator` is consulted once per accepted connection. Returns the
    /// bound address (useful with port 0).
    pub async fn startup_tcp(&mut self, validator: Option<AddressValidator>) -> Result<SocketAddr> {
        self.prepare(Transport::Tcp)?;

        let bind_addr = self.config.tcp.bind_addr();
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            error!("Cannot bind {}: {}", bind_addr, e);
            SlaveError::transport(format!("Failed to bind {bind_addr}: {e}"))
        })?;
        let local = listener.local_addr()?;

        info!(
            "Modbus TCP slave listening on {} ({} tables, max {} connections)",
            local,
            self.registry.len(),
            self.config.tcp.max_connections
        );

        self.session = Some(Session::Tcp(TcpSession::new(
            listener,
            validator,
            self.config.tcp.max_connections,
            self.config.connection_timeout(),
            self.token.clone(),
        )));
        Ok(local)
    }

    /// Open the configured serial device
    #[cfg(feature = "serial")]
    pub fn startup_serial(&mut self) -> Result<()> {
        self.prepare(self.config.protocol)?;
        if !self.config.protocol.is_serial() {
            return Err(SlaveError::illegal_argument("protocol is not a serial transport"));
        }

        let port = serial::open_port(&self.config.serial).inspect_err(|e| error!("{}", e))?;
        self.attach_serial(Box::new(port));
        Ok(())
    }

    /// Serve RTU/ASCII over an already opened byte stream
    pub fn startup_with_link<L>(&mut self, link: L) -> Result<()>
    where
        L: SerialLink + 'static,
    {
        self.prepare(self.config.protocol)?;
        if !self.config.protocol.is_serial() {
            return Err(SlaveError::illegal_argument("protocol is not a serial transport"));
        }

        self.attach_serial(Box::new(link));
        Ok(())
    }

    fn prepare(&self, protocol: Transport) -> Result<()> {
        if self.session.is_some() {
            return Err(SlaveError::protocol("server already started"));
        }
        if self.config.protocol != protocol {
            return Err(SlaveError::illegal_argument(format!(
                "configured protocol is {}, not {}",
                self.config.protocol, protocol
            )));
        }
        self.config.validate().inspect_err(|e| error!("Invalid configuration: {}", e))
    }

    fn attach_serial(&mut self, link: Box<dyn SerialLink>) {
        let serial = &self.config.serial;
        let timing = CharTiming::for_baud(serial.baud_rate);
        let codec = match self.config.protocol {
            Transport::Ascii => SerialCodec::Ascii(AsciiCodec::new()),
            _ => SerialCodec::Rtu(RtuCodec::with_timing(timing)),
        };

        info!(
            "Modbus {} slave on {} at {} baud, {}{}{} ({} tables)",
            self.config.protocol,
            serial.device,
            serial.baud_rate,
            serial.data_bits,
            parity_letter(serial.parity),
            serial.stop_bits,
            self.registry.len()
        );

        self.session = Some(Session::Serial(SerialSession::new(
            link,
            codec,
            timing,
            self.config.rs485_delay(),
        )));
    }

    /// Perform one step: serve one request, admit one connection or time out
    ///
    /// Frame errors never surface here. `Err` means the transport itself
    /// failed; check [`SlaveError::is_fatal`] before calling again.
    pub async fn server_loop(&mut self) -> Result<LoopStatus> {
        let timeout = self.config.master_timeout();
        match &mut self.session {
            None => Err(SlaveError::protocol("server not started")),
            Some(Session::Serial(session)) => {
                session
                    .step(&self.registry, &self.stats, timeout, &self.token)
                    .await
            },
            Some(Session::Tcp(session)) => {
                session.step(&self.registry, &self.stats, timeout).await
            },
        }
    }

    /// Token that makes the pending and all later `server_loop` calls return
    /// [`LoopStatus::Shutdown`]
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Close the transport
    ///
    /// TCP connections finish their current request; the serial port is
    /// released once no request is in flight.
    pub async fn shutdown(&mut self) {
        self.token.cancel();
        match self.session.take() {
            Some(Session::Tcp(session)) => session.close().await,
            Some(Session::Serial(_)) => info!("Serial port {} released", self.config.serial.device),
            None => {},
        }
        self.token = CancellationToken::new();
    }

    pub fn is_started(&self) -> bool {
        self.session.is_some()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Bound address of the TCP listener
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.session {
            Some(Session::Tcp(session)) => session.local_addr(),
            _ => None,
        }
    }
}

fn parity_letter(parity: Parity) -> char {
    match parity {
        Parity::None => 'N',
        Parity::Even => 'E',
        Parity::Odd => 'O',
    }
}
