//! Byte channel abstraction
//!
//! The engine talks to the device through a [`Channel`]: either a real
//! serial port or a TCP stream (the Ryder simulator listens on TCP). Both
//! expose a non-blocking "how many bytes are waiting" probe so the worker
//! loop never parks inside a read.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use serialport::SerialPort;

/// Abstraction over the byte stream to the device.
pub trait Channel: Read + Write + Send {
    /// Number of inbound bytes that can be read without blocking.
    ///
    /// Returns `ErrorKind::UnexpectedEof` once the peer has gone away.
    fn bytes_to_read(&mut self) -> io::Result<u32>;

    /// Discard any pending inbound bytes.
    fn clear_input(&mut self) -> io::Result<()>;
}

/// A serial port channel.
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Channel for SerialChannel {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.port
            .bytes_to_read()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

/// A TCP channel, used to talk to the Ryder simulator.
pub struct TcpChannel {
    stream: TcpStream,
}

impl TcpChannel {
    /// Connect to `host:port` with a short read timeout so reads never park
    /// the worker for long.
    pub fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_millis(100)))?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }
}

impl Read for TcpChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Channel for TcpChannel {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        // A non-blocking peek distinguishes "nothing yet" (WouldBlock) from
        // "peer closed" (readable with zero bytes).
        self.stream.set_nonblocking(true)?;
        let mut buf = [0u8; 4096];
        let result = self.stream.peek(&mut buf);
        self.stream.set_nonblocking(false)?;

        match result {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed connection",
            )),
            Ok(n) => Ok(n as u32),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.stream.set_nonblocking(true)?;
        let mut buf = [0u8; 1024];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    let _ = self.stream.set_nonblocking(false);
                    return Err(e);
                }
            }
        }
        self.stream.set_nonblocking(false)?;
        Ok(())
    }
}
