use crate::command_map::{CommandMap, CommandMapError};
use crate::config::{ScopeConfig, ScopeContext};
use crate::poll_cycle::ServerControl;
use crate::simulator::{SimHandle, SimulatedScope};
use crate::transport::{Link, Transport, TransportError};
use crate::value_store::ValueStore;
use crate::waveform::ByteOrder;
use serialport::SerialPort;
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::sync::Arc;

const VENDOR: &str = "TEKTRONIX";
const SERIAL_BAUD_RATE: u32 = 9600;

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Invalid resource string {resource:?}: {reason}")]
    BadResource { resource: String, reason: String },

    #[error("Unsupported resource {resource:?}, use a ::SOCKET, ASRL or SIM resource")]
    Unsupported { resource: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("Instrument at the other end is not a Tektronix scope: {idn:?}")]
    WrongInstrument { idn: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Command table rejected: {0}")]
    Validation(#[from] CommandMapError),
}

/// Parsed instrument address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// Raw SCPI over TCP, `TCPIP::<host>::<port>::SOCKET`.
    Socket { host: String, port: u16 },
    /// `ASRL<path>::INSTR`; a bare number means a COM port.
    Serial { path: String },
    /// `SIM::<model>`, the built-in simulator.
    Simulated { model: String },
}

impl FromStr for Resource {
    type Err = ConnectorError;

    fn from_str(resource: &str) -> Result<Self, Self::Err> {
        let bad = |reason: &str| ConnectorError::BadResource {
            resource: resource.to_string(),
            reason: reason.to_string(),
        };
        let parts: Vec<&str> = resource.trim().split("::").collect();
        let kind = parts[0].to_uppercase();

        if kind.starts_with("TCPIP") {
            return match parts.as_slice() {
                [_, host, port, socket] if socket.eq_ignore_ascii_case("SOCKET") => {
                    let port = port.parse().map_err(|_| bad("port is not a number"))?;
                    if host.is_empty() {
                        return Err(bad("missing host"));
                    }
                    Ok(Self::Socket {
                        host: (*host).to_string(),
                        port,
                    })
                }
                _ => Err(ConnectorError::Unsupported {
                    resource: resource.to_string(),
                }),
            };
        }
        if kind.starts_with("ASRL") {
            let path = &parts[0]["ASRL".len()..];
            if path.is_empty() {
                return Err(bad("missing serial port"));
            }
            let path = if path.chars().all(|c| c.is_ascii_digit()) {
                format!("COM{path}")
            } else {
                path.to_string()
            };
            return Ok(Self::Serial { path });
        }
        if kind == "SIM" {
            let model = parts.get(1).filter(|m| !m.is_empty()).unwrap_or(&"MSO58");
            return Ok(Self::Simulated {
                model: (*model).to_string(),
            });
        }
        Err(ConnectorError::Unsupported {
            resource: resource.to_string(),
        })
    }
}

impl Link for TcpStream {
    fn clear_input(&mut self) -> io::Result<()> {
        self.set_nonblocking(true)?;
        let mut scratch = [0u8; 512];
        let drained = loop {
            match self.read(&mut scratch) {
                Ok(0) => break Ok(()),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.set_nonblocking(false)?;
        drained
    }
}

impl Link for Box<dyn SerialPort> {
    fn clear_input(&mut self) -> io::Result<()> {
        self.clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }
}

/// Open the byte stream named by the configured resource. The simulator also
/// hands back its control handle.
pub fn open(config: &ScopeConfig) -> Result<(Box<dyn Link>, Option<SimHandle>), ConnectorError> {
    match config.resource.parse::<Resource>()? {
        Resource::Socket { host, port } => {
            log::debug!("Connecting to {host}:{port}");
            let address = (host.as_str(), port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| ConnectorError::BadResource {
                    resource: config.resource.clone(),
                    reason: format!("{host} does not resolve"),
                })?;
            let stream = TcpStream::connect_timeout(&address, config.io_timeout)?;
            stream.set_read_timeout(Some(config.io_timeout))?;
            stream.set_nodelay(true)?;
            Ok((Box::new(stream), None))
        }
        Resource::Serial { path } => {
            log::debug!("Opening serial port {path}");
            let port = serialport::new(&path, SERIAL_BAUD_RATE)
                .timeout(config.io_timeout)
                .open()?;
            Ok((Box::new(port), None))
        }
        Resource::Simulated { model } => {
            log::info!("Using simulated {model} with {} channels", config.channels);
            let (scope, handle) = SimulatedScope::new(&model, config.channels);
            handle.set_auto_acquire(true);
            Ok((Box::new(scope), Some(handle)))
        }
    }
}

/// Ask the instrument who it is and clear its status registers.
pub fn identify(transport: &Transport) -> Result<String, ConnectorError> {
    let mut session = transport.lock();
    session.discard_input();
    let idn = session.query("*IDN?")?;
    if !idn.to_uppercase().contains(VENDOR) {
        return Err(ConnectorError::WrongInstrument { idn });
    }
    session.write("*CLS")?;
    log::info!("Connected to {idn}");
    Ok(idn)
}

/// Put the horizontal system under manual control and select 16-bit signed
/// binary curve transfers in the given byte order.
pub fn configure_scope(transport: &Transport, byte_order: ByteOrder) -> Result<(), TransportError> {
    let mut session = transport.lock();
    session.write("HOR:DEL:MOD ON")?;
    session.write("HOR:MODE MAN")?;
    session.write("HOR:MODE:MAN:CONFIG HORIZ")?;
    session.write(&format!(
        ":WFMO:ENC BIN;:WFMO:BN_F RI;:WFMO:BYT_N 2;:WFMO:BYT_O {}",
        byte_order.as_scpi()
    ))?;
    log::debug!("Data transfer set to RI/2 bytes/{}", byte_order.as_scpi());
    Ok(())
}

/// Bring an opened session up to a validated context.
pub fn establish(
    config: ScopeConfig,
    transport: Transport,
    store: Arc<dyn ValueStore>,
) -> Result<ScopeContext, ConnectorError> {
    identify(&transport)?;
    configure_scope(&transport, config.byte_order)?;

    let commands = CommandMap::build(config.channels);
    commands.validate(&transport)?;

    Ok(ScopeContext {
        transport: Arc::new(transport),
        store,
        commands: Arc::new(commands),
        control: Arc::new(ServerControl::new()),
        config: Arc::new(config),
    })
}

/// Open the configured resource and establish a context over it.
pub fn connect(
    config: ScopeConfig,
    store: Arc<dyn ValueStore>,
) -> Result<(ScopeContext, Option<SimHandle>), ConnectorError> {
    let (link, simulator) = open(&config)?;
    let ctx = establish(config, Transport::new(link), store)?;
    Ok((ctx, simulator))
}
