//! Scripted device console for tests.
//!
//! Echoes command bytes the way the device CLI does, swallows `WR_FW`
//! payloads of the announced length, and answers each completed command
//! through a handler closure. Reads on an empty buffer time out at once.

use {
    crate::{error::Result, port::Port},
    std::{
        collections::VecDeque,
        io::{self, Read, Write},
        time::Duration,
    },
};

type Handler = Box<dyn FnMut(&str, &[u8]) -> Option<String> + Send>;

/// Raw reply the host sends during the application handshake.
const RAW_TRIGGERS: &[&str] = &["Yes|EnterCLI"];

pub(crate) struct SimDevice {
    outbox: VecDeque<u8>,
    line: Vec<u8>,
    pending: Option<(String, usize)>,
    payload: Vec<u8>,
    handler: Handler,
    corrupt_echo_at: Option<usize>,
    echoed: usize,
    timeout: Duration,
    pub(crate) commands: Vec<String>,
    pub(crate) payloads: Vec<Vec<u8>>,
    pub(crate) written: usize,
    pub(crate) closed: bool,
}

impl SimDevice {
    pub(crate) fn new<F>(handler: F) -> Self
    where
        F: FnMut(&str, &[u8]) -> Option<String> + Send + 'static,
    {
        Self {
            outbox: VecDeque::new(),
            line: Vec::new(),
            pending: None,
            payload: Vec::new(),
            handler: Box::new(handler),
            corrupt_echo_at: None,
            echoed: 0,
            timeout: Duration::from_secs(1),
            commands: Vec::new(),
            payloads: Vec::new(),
            written: 0,
            closed: false,
        }
    }

    /// Device that answers PASS to everything.
    pub(crate) fn passing() -> Self {
        Self::new(|cmd, _| Some(pass(module_of(cmd), "{}")))
    }

    /// Replace the echo of the `index`-th byte with garbage.
    pub(crate) fn corrupt_echo_at(mut self, index: usize) -> Self {
        self.corrupt_echo_at = Some(index);
        self
    }

    /// Queue console output as if the device printed it unprompted.
    pub(crate) fn emit(&mut self, text: &str) {
        self.outbox
            .extend(text.as_bytes());
    }

    pub(crate) fn commands_starting_with(&self, prefix: &str) -> Vec<&str> {
        self.commands
            .iter()
            .filter(|c| c.starts_with(prefix))
            .map(String::as_str)
            .collect()
    }

    fn dispatch(&mut self, command: String, payload: &[u8]) {
        if let Some(reply) = (self.handler)(&command, payload) {
            self.emit(&reply);
        }
    }

    fn accept(&mut self, byte: u8) {
        if let Some((command, expected)) = self.pending.take() {
            self.payload.push(byte);
            if self.payload.len() == expected {
                let payload = std::mem::take(&mut self.payload);
                self.payloads.push(payload.clone());
                self.dispatch(command, &payload);
            } else {
                self.pending = Some((command, expected));
            }
            return;
        }

        let echo = if self.corrupt_echo_at == Some(self.echoed) {
            b'#'
        } else {
            byte
        };
        self.echoed += 1;
        self.outbox.push_back(echo);

        if byte == b'\n' {
            let command = String::from_utf8_lossy(&self.line)
                .trim()
                .to_string();
            self.line.clear();
            self.commands.push(command.clone());
            match payload_len(&command) {
                Some(0) | None => self.dispatch(command, &[]),
                Some(len) => self.pending = Some((command, len)),
            }
            return;
        }

        self.line.push(byte);
        let text = String::from_utf8_lossy(&self.line).to_string();
        if RAW_TRIGGERS.contains(&text.as_str()) {
            self.line.clear();
            self.commands.push(text.clone());
            self.dispatch(text, &[]);
        }
    }
}

fn payload_len(command: &str) -> Option<usize> {
    if !command.starts_with("FW_UPDATE WR_FW ") {
        return None;
    }
    command
        .split_whitespace()
        .last()?
        .parse()
        .ok()
}

/// Module name of a command line.
pub(crate) fn module_of(command: &str) -> &str {
    command
        .split_whitespace()
        .next()
        .unwrap_or_default()
}

/// Response frame as the device prints it.
pub(crate) fn frame(module: &str, result: &str, msg: &str, errno: i64) -> String {
    format!(
        "\r\n{{\r\n  \"{module}\": {{\r\n    \"RESULT\": \"{result}\",\r\n    \"MSG\": {msg},\r\n    \"ERRNO\": {errno}\r\n  }}\r\n}}\r\n$"
    )
}

pub(crate) fn pass(module: &str, msg: &str) -> String {
    frame(module, "PASS", msg, 0)
}

pub(crate) fn fail(module: &str, errno: i64) -> String {
    frame(module, "FAIL", "{}", errno)
}

impl Read for SimDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.outbox.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let mut n = 0;
        while n < buf.len() {
            let Some(byte) = self.outbox.pop_front() else {
                break;
            };
            buf[n] = byte;
            n += 1;
        }
        Ok(n)
    }
}

impl Write for SimDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            self.written += 1;
            self.accept(byte);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for SimDevice {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn baud_rate(&self) -> u32 {
        115200
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.outbox.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "sim"
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
