//! Parent/child rendezvous across `clone(2)`.
//!
//! The channel is a connected `AF_UNIX` stream pair. After the clone each
//! process keeps exactly one end and the two walk through a fixed sequence:
//!
//! 1. child  -> parent: `READY`
//! 2. parent -> child:  `PROCEED` (sent once the pid-dependent setup is done)
//! 3. child  -> parent: end of stream on successful exec, or an error token
//!
//! Both sides are typestates, so a stage cannot be skipped or repeated.
//! Every message is one native-endian `i32`; anything shorter, an early end
//! of stream, or an unexpected value is a protocol failure.

use std::io::{ErrorKind, Read, Write};
use std::marker::PhantomData;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;

use lxrun_common::error::{LxrunError, Result};

use crate::fd::set_cloexec;

const TOKEN_SIZE: usize = std::mem::size_of::<i32>();

/// Fixed-width value exchanged over the channel.
///
/// Positive values are stage markers, negative values carry an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncToken(i32);

impl SyncToken {
    /// Child is alive and waiting for the parent.
    pub const READY: Self = Self(1);
    /// Parent has finished the pid-dependent setup.
    pub const PROCEED: Self = Self(2);

    /// Builds an error token from an errno-style code.
    #[must_use]
    pub const fn error(code: i32) -> Self {
        if code > 0 {
            Self(-code)
        } else if code == 0 {
            Self(-1)
        } else {
            Self(code)
        }
    }

    /// Returns the error code if this is an error token.
    #[must_use]
    pub const fn error_code(self) -> Option<i32> {
        if self.0 < 0 { Some(-self.0) } else { None }
    }

    const fn to_bytes(self) -> [u8; TOKEN_SIZE] {
        self.0.to_ne_bytes()
    }

    const fn from_bytes(bytes: [u8; TOKEN_SIZE]) -> Self {
        Self(i32::from_ne_bytes(bytes))
    }
}

/// Both ends of a freshly created channel.
#[derive(Debug)]
pub struct SyncChannel {
    parent: UnixStream,
    child: UnixStream,
}

impl SyncChannel {
    /// Creates a connected pair; both ends are close-on-exec.
    ///
    /// # Errors
    ///
    /// Returns an error if `socketpair(2)` fails.
    pub fn new() -> Result<Self> {
        let (parent, child) = UnixStream::pair().map_err(|e| LxrunError::Io {
            path: "socketpair".into(),
            source: e,
        })?;
        tracing::trace!("sync channel created");
        Ok(Self { parent, child })
    }

    /// Keeps the parent end and closes the child end.
    #[must_use]
    pub fn into_parent(self) -> ParentSync<AwaitReady> {
        drop(self.child);
        ParentSync::new(self.parent)
    }

    /// Keeps the child end, closing the parent end.
    ///
    /// The kept end is (re)marked close-on-exec so that a successful exec
    /// shows up on the parent side as end of stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor flags cannot be updated.
    pub fn into_child(self) -> Result<ChildSync<Announce>> {
        drop(self.parent);
        set_cloexec(&self.child)?;
        Ok(ChildSync::new(self.child))
    }

    /// Splits the pair for use by two threads of the same process.
    #[cfg(test)]
    #[must_use]
    pub(crate) fn split(self) -> (ParentSync<AwaitReady>, ChildSync<Announce>) {
        (ParentSync::new(self.parent), ChildSync::new(self.child))
    }
}

/// Parent stage: waiting for the child's `READY`.
#[derive(Debug)]
pub struct AwaitReady;
/// Parent stage: child is ready, pid-dependent setup in progress.
#[derive(Debug)]
pub struct Configuring;
/// Parent stage: `PROCEED` sent, waiting for exec or an error.
#[derive(Debug)]
pub struct AwaitExec;

/// Child stage: about to announce readiness.
#[derive(Debug)]
pub struct Announce;
/// Child stage: waiting for the parent's `PROCEED`.
#[derive(Debug)]
pub struct AwaitProceed;
/// Child stage: cleared to set up the namespaces and exec.
#[derive(Debug)]
pub struct Cleared;

/// Parent end of the handshake.
#[derive(Debug)]
pub struct ParentSync<S> {
    stream: UnixStream,
    _stage: PhantomData<S>,
}

impl<S> ParentSync<S> {
    const fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            _stage: PhantomData,
        }
    }

    fn advance<T>(self) -> ParentSync<T> {
        ParentSync {
            stream: self.stream,
            _stage: PhantomData,
        }
    }
}

impl ParentSync<AwaitReady> {
    /// Blocks until the child announces it is ready.
    ///
    /// # Errors
    ///
    /// Returns a protocol error on a short read, end of stream or unknown
    /// token, and [`LxrunError::ChildFailed`] on an error token.
    pub fn wait_ready(mut self) -> Result<ParentSync<Configuring>> {
        const STAGE: &str = "waiting for the child to be ready";
        match read_token(&mut self.stream, STAGE)? {
            Some(SyncToken::READY) => Ok(self.advance()),
            other => Err(unexpected(STAGE, other)),
        }
    }
}

impl ParentSync<Configuring> {
    /// Tells the child to continue its initialization.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the token cannot be written in full.
    pub fn proceed(mut self) -> Result<ParentSync<AwaitExec>> {
        write_token(&mut self.stream, SyncToken::PROCEED, "telling the child to proceed")?;
        Ok(self.advance())
    }
}

impl ParentSync<AwaitExec> {
    /// Blocks until the child has exec'd (end of stream) or failed.
    ///
    /// # Errors
    ///
    /// Returns [`LxrunError::ChildFailed`] on an error token and a protocol
    /// error on a short read or any other token.
    pub fn wait_exec(mut self) -> Result<()> {
        const STAGE: &str = "waiting for the child to exec";
        match read_token(&mut self.stream, STAGE)? {
            None => Ok(()),
            other => Err(unexpected(STAGE, other)),
        }
    }
}

/// Child end of the handshake.
#[derive(Debug)]
pub struct ChildSync<S> {
    stream: UnixStream,
    _stage: PhantomData<S>,
}

impl<S> ChildSync<S> {
    const fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            _stage: PhantomData,
        }
    }

    fn advance<T>(self) -> ChildSync<T> {
        ChildSync {
            stream: self.stream,
            _stage: PhantomData,
        }
    }

    /// Sends an error token so the parent never waits forever.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the token cannot be written in full.
    pub fn report_error(&mut self, code: i32) -> Result<()> {
        write_token(&mut self.stream, SyncToken::error(code), "reporting a child error")
    }
}

impl ChildSync<Announce> {
    /// Tells the parent the child is alive.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the token cannot be written in full.
    pub fn announce_ready(mut self) -> Result<ChildSync<AwaitProceed>> {
        write_token(&mut self.stream, SyncToken::READY, "announcing readiness")?;
        Ok(self.advance())
    }
}

impl ChildSync<AwaitProceed> {
    /// Blocks until the parent has finished its pid-dependent setup.
    ///
    /// # Errors
    ///
    /// Returns a protocol error on a short read, end of stream or any token
    /// other than `PROCEED`.
    pub fn wait_proceed(mut self) -> Result<ChildSync<Cleared>> {
        const STAGE: &str = "waiting for the parent to proceed";
        match read_token(&mut self.stream, STAGE)? {
            Some(SyncToken::PROCEED) => Ok(self.advance()),
            other => Err(unexpected(STAGE, other)),
        }
    }
}

impl AsFd for ChildSync<Cleared> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

fn unexpected(stage: &'static str, token: Option<SyncToken>) -> LxrunError {
    match token {
        None => LxrunError::protocol(stage, "peer closed the channel"),
        Some(t) => t.error_code().map_or_else(
            || LxrunError::protocol(stage, format!("unexpected token {}", t.0)),
            |code| LxrunError::ChildFailed { stage, code },
        ),
    }
}

/// Reads one token; `Ok(None)` means a clean end of stream.
fn read_token(stream: &mut UnixStream, stage: &'static str) -> Result<Option<SyncToken>> {
    let mut buf = [0u8; TOKEN_SIZE];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(TOKEN_SIZE) => return Ok(Some(SyncToken::from_bytes(buf))),
            Ok(n) => {
                return Err(LxrunError::protocol(
                    stage,
                    format!("short read of {n} bytes"),
                ));
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(LxrunError::protocol(stage, e.to_string())),
        }
    }
}

fn write_token(stream: &mut UnixStream, token: SyncToken, stage: &'static str) -> Result<()> {
    loop {
        match stream.write(&token.to_bytes()) {
            Ok(TOKEN_SIZE) => return Ok(()),
            Ok(n) => {
                return Err(LxrunError::protocol(
                    stage,
                    format!("short write of {n} bytes"),
                ));
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(LxrunError::protocol(stage, e.to_string())),
        }
    }
}
