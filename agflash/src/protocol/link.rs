//! Echo-verified command link.
//!
//! The device console echoes every byte it receives. The host writes one
//! byte at a time and checks the echo before sending the next one; a wrong
//! or missing echo means the link cannot be trusted and the command is
//! abandoned before any response is read.
//!
//! Responses are framed by a line consisting of `{\r\n` (start, resets any
//! capture in progress) and a line consisting of `$` (end). Everything
//! between is the JSON result object, decoded by [`Response::decode`].

use {
    crate::{
        ensure_not_interrupted,
        error::{Error, Result},
        port::Port,
        protocol::{
            command::Command,
            response::{Reply, Response},
        },
    },
    log::{debug, trace},
    std::{
        io::ErrorKind,
        time::{Duration, Instant},
    },
};

/// Time allowed for each echoed byte.
pub const ECHO_TIMEOUT: Duration = Duration::from_secs(1);

/// Time allowed between lines once a response frame has started.
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Line that opens a response frame.
const FRAME_START: &str = "{\r\n";

/// Line that closes a response frame.
const FRAME_END: u8 = b'$';

/// Command link over a [`Port`].
pub struct CommandLink<P: Port> {
    port: P,
    echo_timeout: Duration,
    read_timeout: Duration,
}

impl<P: Port> CommandLink<P> {
    /// Wrap an open port.
    pub fn new(port: P) -> Self {
        Self {
            port,
            echo_timeout: ECHO_TIMEOUT,
            read_timeout: READ_TIMEOUT,
        }
    }

    /// Override the per-byte echo timeout.
    #[must_use]
    pub fn with_echo_timeout(mut self, timeout: Duration) -> Self {
        self.echo_timeout = timeout;
        self
    }

    /// Override the inter-line timeout used inside a response frame.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get a mutable reference to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the link and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Send a command and wait up to `timeout` for its response.
    pub fn send(&mut self, command: &Command, timeout: Duration) -> Result<Response> {
        self.write_command(command)?;
        let response = self.read_response(command.module(), timeout)?;
        debug!("{command} -> {}", response.label());
        Ok(response)
    }

    /// Send a command and require a `PASS` result.
    pub fn execute(
        &mut self,
        command: &Command,
        timeout: Duration,
    ) -> Result<Reply> {
        self.send(command, timeout)?
            .expect_pass(&command.to_string())
    }

    /// Write a command line, verifying the echo of every byte.
    pub fn write_command(&mut self, command: &Command) -> Result<()> {
        ensure_not_interrupted()?;
        self.port
            .clear_buffers()?;
        self.port
            .set_timeout(self.echo_timeout)?;

        trace!("> {command}");
        for &byte in command
            .to_line()
            .as_bytes()
        {
            self.port
                .write_all(&[byte])?;
            self.port
                .flush()?;
            let echoed = self.read_byte()?;
            if echoed != Some(byte) {
                return Err(Error::EchoMismatch {
                    expected: byte,
                    received: echoed,
                });
            }
        }
        Ok(())
    }

    /// Write bytes without echo verification (chunk payloads, handshake).
    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        ensure_not_interrupted()?;
        self.port
            .write_all(data)?;
        self.port
            .flush()?;
        Ok(())
    }

    /// Read one response frame for `module`.
    ///
    /// `timeout` bounds the wait for the frame to start; once it has, each
    /// further line must arrive within the inter-line timeout. A stream that
    /// ends before the closing `$` yields [`Response::Timeout`].
    pub fn read_response(&mut self, module: &str, timeout: Duration) -> Result<Response> {
        let deadline = Instant::now() + timeout;
        let mut captured = String::new();
        let mut started = false;

        loop {
            let wait = if started {
                self.read_timeout
            } else {
                deadline.saturating_duration_since(Instant::now())
            };
            if wait.is_zero() {
                return Ok(Response::Timeout);
            }

            let Some(line) = self.read_line(wait)? else {
                if !captured.is_empty() {
                    debug!("Incomplete {module} response: {captured:?}");
                }
                return Ok(Response::Timeout);
            };

            if line == FRAME_START {
                captured.clear();
                started = true;
            } else if line
                .trim_end()
                .as_bytes()
                == [FRAME_END]
            {
                return Ok(Response::decode(module, &captured));
            }
            captured.push_str(&line);
        }
    }

    /// Read one line (up to and including `\n`) within `timeout`.
    ///
    /// A lone `$` at the start of a line is returned immediately, since the
    /// device does not terminate it. Returns `None` when nothing arrived.
    pub fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        self.port
            .set_timeout(timeout)?;
        let deadline = Instant::now() + timeout;
        let mut line = Vec::new();

        loop {
            ensure_not_interrupted()?;
            match self.read_byte()? {
                Some(byte) => {
                    line.push(byte);
                    if byte == b'\n' || line == [FRAME_END] {
                        break;
                    }
                },
                None => break,
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        if line.is_empty() {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&line).into_owned();
        trace!("< {:?}", line);
        Ok(Some(line))
    }

    /// Read lines until one contains any of `needles`, or `timeout` passes.
    ///
    /// Returns the index of the needle that matched.
    pub fn wait_for(&mut self, needles: &[&str], timeout: Duration) -> Result<Option<usize>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if let Some(line) = self.read_line(remaining)? {
                if let Some(index) = needles
                    .iter()
                    .position(|needle| line.contains(needle))
                {
                    return Ok(Some(index));
                }
            }
        }
    }

    /// Close the underlying port.
    pub fn close(&mut self) -> Result<()> {
        self.port
            .close()
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self
            .port
            .read(&mut byte)
        {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if matches!(
                e.kind(),
                ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
            ) =>
            {
                Ok(None)
            },
            Err(e) => Err(e.into()),
        }
    }
}
