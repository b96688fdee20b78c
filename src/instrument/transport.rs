//! Device links used by instrument engines.
//!
//! Every link is blocking: an engine serializes its own commands and runs
//! them on the publishing thread, so a round trip simply blocks that thread
//! until the reply or the configured timeout.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs, UdpSocket};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::config::{Encoding, InstrumentConfig};
use crate::error::{ConfigError, TransportError};

/// How long [`Transport::read_available`] waits for unsolicited bytes.
pub const DRAIN_WAIT: Duration = Duration::from_millis(20);

const CHUNK: usize = 1024;

pub trait Transport: Send {
    fn kind(&self) -> &'static str;

    /// Sends one command, terminated, without waiting for a reply.
    fn write(&mut self, command: &str) -> Result<(), TransportError>;

    /// Sends one command and returns the next reply with its terminator
    /// stripped.
    fn query(&mut self, command: &str) -> Result<String, TransportError>;

    /// Bytes the device sent on its own since the last call. May be empty.
    fn read_available(&mut self) -> Result<Vec<u8>, TransportError> {
        Err(TransportError::Unsupported(self.kind()))
    }

    fn close(&mut self) {}
}

/// Bytes read past the end of the last reply, kept for the next one.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn take_line(&mut self, terminator: &[u8]) -> Option<Vec<u8>> {
        if terminator.is_empty() {
            return (!self.pending.is_empty()).then(|| std::mem::take(&mut self.pending));
        }
        let end = self
            .pending
            .windows(terminator.len())
            .position(|w| w == terminator)?;
        let line = self.pending[..end].to_vec();
        self.pending.drain(..end + terminator.len());
        Some(line)
    }

    fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    fn drain(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }
}

/// Termination and encoding shared by the line-oriented links.
#[derive(Debug, Clone)]
struct Framing {
    encoding: Encoding,
    write_termination: Vec<u8>,
    read_termination: Vec<u8>,
}

impl Framing {
    fn from_config(config: &InstrumentConfig) -> Result<Self, TransportError> {
        Ok(Self {
            encoding: config.encoding,
            write_termination: config.encoding.encode(&config.write_termination)?,
            read_termination: config.encoding.encode(&config.read_termination)?,
        })
    }

    fn frame(&self, command: &str) -> Result<Vec<u8>, TransportError> {
        let mut bytes = self.encoding.encode(command)?;
        bytes.extend_from_slice(&self.write_termination);
        Ok(bytes)
    }

    fn decode(&self, line: &[u8]) -> String {
        self.encoding.decode(line).trim().to_string()
    }
}

fn timed_out(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

pub(crate) fn require<'a>(
    config: &'a InstrumentConfig,
    field: &'static str,
    value: Option<&'a str>,
) -> Result<&'a str, ConfigError> {
    value.ok_or_else(|| ConfigError::MissingField {
        instrument: config.provider.clone(),
        field,
    })
}

pub(crate) fn connect_tcp(config: &InstrumentConfig) -> Result<TcpStream, TransportError> {
    let target = config
        .socket_address()
        .ok_or_else(|| TransportError::InvalidCommand("address and port are required".into()))?;
    let addr = target
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| TransportError::InvalidCommand(format!("cannot resolve {target}")))?;
    let stream = TcpStream::connect_timeout(&addr, config.timeout())?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(config.timeout()))?;
    stream.set_write_timeout(Some(config.timeout()))?;
    Ok(stream)
}

pub struct TcpTransport {
    stream: TcpStream,
    framing: Framing,
    buffer: LineBuffer,
    timeout: Duration,
}

impl TcpTransport {
    pub fn connect(config: &InstrumentConfig) -> Result<Self, TransportError> {
        let stream = connect_tcp(config)?;
        debug!(provider = %config.provider, peer = ?stream.peer_addr().ok(), "tcp link up");
        Ok(Self {
            stream,
            framing: Framing::from_config(config)?,
            buffer: LineBuffer::default(),
            timeout: config.timeout(),
        })
    }

    fn read_line(&mut self) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + self.timeout;
        let mut chunk = [0u8; CHUNK];
        loop {
            if let Some(line) = self.buffer.take_line(&self.framing.read_termination) {
                return Ok(line);
            }
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout);
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => self.buffer.extend(&chunk[..n]),
                Err(e) if timed_out(&e) => return Err(TransportError::Timeout),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Transport for TcpTransport {
    fn kind(&self) -> &'static str {
        "tcp"
    }

    fn write(&mut self, command: &str) -> Result<(), TransportError> {
        trace!(command, "tcp write");
        let bytes = self.framing.frame(command)?;
        self.stream.write_all(&bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    fn query(&mut self, command: &str) -> Result<String, TransportError> {
        self.write(command)?;
        let line = self.read_line()?;
        let reply = self.framing.decode(&line);
        trace!(command, reply = %reply, "tcp query");
        Ok(reply)
    }

    fn read_available(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut out = self.buffer.drain();
        self.stream.set_read_timeout(Some(DRAIN_WAIT))?;
        let mut chunk = [0u8; CHUNK];
        let result = match self.stream.read(&mut chunk) {
            Ok(0) => Err(TransportError::Closed),
            Ok(n) => {
                out.extend_from_slice(&chunk[..n]);
                Ok(())
            }
            Err(e) if timed_out(&e) => Ok(()),
            Err(e) => Err(e.into()),
        };
        self.stream.set_read_timeout(Some(self.timeout))?;
        result.map(|()| out)
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// One datagram per command; a reply is the next datagram received.
pub struct UdpTransport {
    socket: UdpSocket,
    framing: Framing,
}

impl UdpTransport {
    pub fn connect(config: &InstrumentConfig) -> Result<Self, TransportError> {
        let target = config
            .socket_address()
            .ok_or_else(|| TransportError::InvalidCommand("address and port are required".into()))?;
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(target.as_str())?;
        socket.set_read_timeout(Some(config.timeout()))?;
        Ok(Self {
            socket,
            framing: Framing::from_config(config)?,
        })
    }

    fn strip<'a>(&self, datagram: &'a [u8]) -> &'a [u8] {
        datagram
            .strip_suffix(self.framing.read_termination.as_slice())
            .unwrap_or(datagram)
    }
}

impl Transport for UdpTransport {
    fn kind(&self) -> &'static str {
        "udp"
    }

    fn write(&mut self, command: &str) -> Result<(), TransportError> {
        let bytes = self.framing.frame(command)?;
        self.socket.send(&bytes)?;
        Ok(())
    }

    fn query(&mut self, command: &str) -> Result<String, TransportError> {
        self.write(command)?;
        let mut datagram = [0u8; 65_507];
        let n = match self.socket.recv(&mut datagram) {
            Ok(n) => n,
            Err(e) if timed_out(&e) => return Err(TransportError::Timeout),
            Err(e) => return Err(e.into()),
        };
        Ok(self.framing.decode(self.strip(&datagram[..n])))
    }

    fn read_available(&mut self) -> Result<Vec<u8>, TransportError> {
        self.socket.set_nonblocking(true)?;
        let mut out = Vec::new();
        let mut datagram = [0u8; 65_507];
        let result = loop {
            match self.socket.recv(&mut datagram) {
                Ok(n) => out.extend_from_slice(&datagram[..n]),
                Err(e) if timed_out(&e) => break Ok(()),
                Err(e) => break Err(TransportError::from(e)),
            }
        };
        self.socket.set_nonblocking(false)?;
        result.map(|()| out)
    }
}

/// Runs `<script> <command>` once per command. The trimmed stdout is the
/// reply; a non-zero exit status is a failure carrying stderr.
pub struct ScriptTransport {
    program: String,
}

impl ScriptTransport {
    pub fn new(config: &InstrumentConfig) -> Result<Self, TransportError> {
        let program = require(config, "script", config.script.as_deref())
            .map_err(|e| TransportError::InvalidCommand(e.to_string()))?;
        Ok(Self {
            program: program.to_string(),
        })
    }

    fn run(&self, command: &str) -> Result<String, TransportError> {
        let output = Command::new(&self.program)
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| TransportError::Script(format!("{}: {e}", self.program)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(TransportError::Script(if stderr.is_empty() {
                format!("{} exited with {}", self.program, output.status)
            } else {
                stderr
            }));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Transport for ScriptTransport {
    fn kind(&self) -> &'static str {
        "script"
    }

    fn write(&mut self, command: &str) -> Result<(), TransportError> {
        self.run(command).map(drop)
    }

    fn query(&mut self, command: &str) -> Result<String, TransportError> {
        self.run(command)
    }
}

/// A simulator process speaking the instrument's line protocol on
/// stdin/stdout. Its output is pumped by a reader thread.
pub struct SimulationTransport {
    child: Child,
    stdin: ChildStdin,
    output: Receiver<Vec<u8>>,
    framing: Framing,
    buffer: LineBuffer,
    timeout: Duration,
}

impl SimulationTransport {
    pub fn spawn(config: &InstrumentConfig) -> Result<Self, TransportError> {
        let program = require(config, "simulation", config.simulation.as_deref())
            .map_err(|e| TransportError::InvalidCommand(e.to_string()))?;
        let mut child = Command::new(program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(TransportError::Closed);
        };

        let (tx, rx) = mpsc::channel();
        let name = format!("sim-{}", config.provider);
        thread::Builder::new().name(name).spawn(move || {
            let mut reader = BufReader::new(stdout);
            loop {
                let chunk = match reader.fill_buf() {
                    Ok([]) | Err(_) => break,
                    Ok(bytes) => bytes.to_vec(),
                };
                reader.consume(chunk.len());
                if tx.send(chunk).is_err() {
                    break;
                }
            }
        })?;

        debug!(provider = %config.provider, program, "simulator started");
        Ok(Self {
            child,
            stdin,
            output: rx,
            framing: Framing::from_config(config)?,
            buffer: LineBuffer::default(),
            timeout: config.timeout(),
        })
    }
}

impl Transport for SimulationTransport {
    fn kind(&self) -> &'static str {
        "simulation"
    }

    fn write(&mut self, command: &str) -> Result<(), TransportError> {
        let bytes = self.framing.frame(command)?;
        self.stdin.write_all(&bytes)?;
        self.stdin.flush()?;
        Ok(())
    }

    fn query(&mut self, command: &str) -> Result<String, TransportError> {
        self.write(command)?;
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(line) = self.buffer.take_line(&self.framing.read_termination) {
                return Ok(self.framing.decode(&line));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.output.recv_timeout(remaining) {
                Ok(chunk) => self.buffer.extend(&chunk),
                Err(RecvTimeoutError::Timeout) => return Err(TransportError::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Closed),
            }
        }
    }

    fn read_available(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut out = self.buffer.drain();
        loop {
            match self.output.try_recv() {
                Ok(chunk) => out.extend_from_slice(&chunk),
                Err(TryRecvError::Empty) => return Ok(out),
                Err(TryRecvError::Disconnected) if out.is_empty() => return Err(TransportError::Closed),
                Err(TryRecvError::Disconnected) => return Ok(out),
            }
        }
    }

    fn close(&mut self) {
        if let Err(e) = self.child.kill() {
            warn!(error = %e, "failed to stop simulator");
        }
        let _ = self.child.wait();
    }
}

impl Drop for SimulationTransport {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            self.close();
        }
    }
}
