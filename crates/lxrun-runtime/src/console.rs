//! Interactive console attached to one of a container's ttys.
//!
//! The local terminal is switched to raw mode and bytes are relayed both
//! ways between it and the pty master obtained from the container's tty
//! service. `Ctrl+a` followed by `q` detaches.

use std::fs::File;
use std::io::{ErrorKind, Read, Stdout, Write};
use std::ops::ControlFlow;
use std::os::fd::{AsFd, OwnedFd};

use lxrun_common::constants::CONSOLE_ESCAPE;
use lxrun_common::error::{LxrunError, Result};
use lxrun_core::mainloop::EventLoop;
use lxrun_core::tty::{self, TtyClient};
use nix::sys::termios::{
    InputFlags, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices, Termios, tcgetattr,
    tcsetattr,
};

const BUFFER_SIZE: usize = 1024;

/// Recognizes the two-key detach sequence in the input stream.
///
/// The escape byte is held back until the next key decides what it was:
/// `q` detaches and neither byte is sent, a second escape sends a single
/// one, anything else sends both. A held escape carries over to the next
/// read.
#[derive(Debug, Clone, Copy)]
pub struct EscapeDetector {
    escape: u8,
    held: bool,
}

impl EscapeDetector {
    /// Detector for `escape` followed by `q`.
    #[must_use]
    pub const fn new(escape: u8) -> Self {
        Self {
            escape,
            held: false,
        }
    }

    /// Appends to `out` the part of `input` meant for the container.
    ///
    /// Breaks as soon as the detach sequence completes; bytes after it are
    /// dropped.
    pub fn filter(&mut self, input: &[u8], out: &mut Vec<u8>) -> ControlFlow<()> {
        for &byte in input {
            if self.held {
                self.held = false;
                match byte {
                    b'q' => return ControlFlow::Break(()),
                    b if b == self.escape => out.push(b),
                    b => out.extend_from_slice(&[self.escape, b]),
                }
            } else if byte == self.escape {
                self.held = true;
            } else {
                out.push(byte);
            }
        }
        ControlFlow::Continue(())
    }
}

impl Default for EscapeDetector {
    fn default() -> Self {
        Self::new(CONSOLE_ESCAPE)
    }
}

/// Returns `attrs` adjusted for raw relaying: no echo, no line editing, no
/// signal keys, no output post-processing, reads return after one byte.
#[must_use]
pub fn raw_attrs(attrs: &Termios) -> Termios {
    let mut raw = attrs.clone();
    raw.input_flags.insert(InputFlags::IGNPAR);
    raw.input_flags.remove(
        InputFlags::ISTRIP
            | InputFlags::INLCR
            | InputFlags::IGNCR
            | InputFlags::ICRNL
            | InputFlags::IXON
            | InputFlags::IXANY
            | InputFlags::IXOFF,
    );
    raw.local_flags.remove(
        LocalFlags::ISIG
            | LocalFlags::ICANON
            | LocalFlags::ECHO
            | LocalFlags::ECHOE
            | LocalFlags::ECHOK
            | LocalFlags::ECHONL
            | LocalFlags::IEXTEN,
    );
    raw.output_flags.remove(OutputFlags::OPOST);
    raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
    raw
}

/// Keeps a terminal in raw mode; the original settings come back on drop.
#[derive(Debug)]
pub struct RawMode {
    fd: OwnedFd,
    original: Termios,
}

impl RawMode {
    /// Switches the terminal behind `fd` to raw mode.
    ///
    /// # Errors
    ///
    /// Returns an error if `fd` is not a terminal or its settings cannot be
    /// changed.
    pub fn enter<F: AsFd>(fd: &F) -> Result<Self> {
        let fd = fd.as_fd().try_clone_to_owned().map_err(|e| LxrunError::Io {
            path: "terminal".into(),
            source: e,
        })?;
        let original = tcgetattr(&fd).map_err(|e| LxrunError::sys("tcgetattr", e))?;
        tcsetattr(&fd, SetArg::TCSAFLUSH, &raw_attrs(&original))
            .map_err(|e| LxrunError::sys("tcsetattr", e))?;
        Ok(Self { fd, original })
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if let Err(e) = tcsetattr(&self.fd, SetArg::TCSAFLUSH, &self.original) {
            tracing::warn!(error = %e, "failed to restore terminal settings");
        }
    }
}

/// A tty obtained from a container, ready to be attached to.
#[derive(Debug)]
pub struct Console {
    client: TtyClient,
    master: File,
    index: i32,
}

impl Console {
    /// Requests tty `index` (0 for any free one) from container `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is not running or has no tty to
    /// give.
    pub fn connect(name: &str, index: i32) -> Result<Self> {
        let (client, master, index) = tty::request(name, index)?;
        tracing::debug!(name, index, "tty obtained");
        Ok(Self {
            client,
            master: File::from(master),
            index,
        })
    }

    /// Index of the tty that was handed out.
    #[must_use]
    pub const fn index(&self) -> i32 {
        self.index
    }

    /// Relays between the local terminal and the tty until detached or the
    /// tty goes away. The terminal is restored on every path.
    ///
    /// # Errors
    ///
    /// Returns an error if stdin is not a terminal or relaying fails.
    pub fn attach(self) -> Result<()> {
        let stdin = std::io::stdin();
        let input = stdin.as_fd().try_clone_to_owned().map_err(|e| LxrunError::Io {
            path: "stdin".into(),
            source: e,
        })?;
        let _raw = RawMode::enter(&stdin)?;

        let mut relay = Relay {
            input: File::from(input),
            master: self.master,
            output: std::io::stdout(),
            escape: EscapeDetector::default(),
        };

        let mut lp = EventLoop::<Relay>::open(2)?;
        lp.add_handler(&relay.input, |_, _, _, relay: &mut Relay| relay.forward_input())?;
        lp.add_handler(&relay.master, |_, _, _, relay: &mut Relay| relay.forward_output())?;
        let result = lp.run(&mut relay);

        // The slot is freed once the connection closes.
        drop(self.client);
        result
    }
}

/// Relay state shared by the two handlers.
struct Relay {
    input: File,
    master: File,
    output: Stdout,
    escape: EscapeDetector,
}

impl Relay {
    fn forward_input(&mut self) -> Result<ControlFlow<()>> {
        let mut buf = [0u8; BUFFER_SIZE];
        let Some(n) = read_some(&mut self.input, &mut buf, "stdin")? else {
            return Ok(ControlFlow::Break(()));
        };

        let mut out = Vec::with_capacity(n + 1);
        let flow = self.escape.filter(&buf[..n], &mut out);
        if !out.is_empty() {
            write_all(&mut self.master, &out, "tty")?;
        }
        Ok(flow)
    }

    fn forward_output(&mut self) -> Result<ControlFlow<()>> {
        let mut buf = [0u8; BUFFER_SIZE];
        let Some(n) = read_some(&mut self.master, &mut buf, "tty")? else {
            return Ok(ControlFlow::Break(()));
        };
        write_all(&mut self.output, &buf[..n], "stdout")?;
        Ok(ControlFlow::Continue(()))
    }
}

/// Reads what is available; `None` at end of stream or when the pty has
/// lost its other side (`EIO`).
fn read_some(from: &mut impl Read, buf: &mut [u8], what: &str) -> Result<Option<usize>> {
    loop {
        match from.read(buf) {
            Ok(0) => return Ok(None),
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if e.raw_os_error() == Some(libc::EIO) => return Ok(None),
            Err(e) => {
                return Err(LxrunError::Io {
                    path: what.into(),
                    source: e,
                });
            }
        }
    }
}

fn write_all(to: &mut impl Write, buf: &[u8], what: &str) -> Result<()> {
    to.write_all(buf)
        .and_then(|()| to.flush())
        .map_err(|e| LxrunError::Io {
            path: what.into(),
            source: e,
        })
}
