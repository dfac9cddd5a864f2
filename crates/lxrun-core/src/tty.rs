//! Pseudo-terminal pool and the rendezvous that hands masters out.
//!
//! The supervisor pre-allocates a fixed number of pty pairs. External tools
//! connect to an abstract-namespace socket named after the container, send
//! a slot index with their credentials attached, and get the slot's master
//! descriptor back. A slot stays busy for as long as the client keeps its
//! connection open; the hang-up of that connection is the only thing that
//! frees it.
//!
//! Connections are registered with the event loop as soon as they are
//! accepted and read only once readable, so a silent client never holds up
//! the supervisor.
//!
//! Slot indices on the wire are 1-based; 0 asks for any free slot.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::ops::ControlFlow;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use lxrun_common::constants::tty_socket_name;
use lxrun_common::error::{self, LxrunError, Result};
use nix::sys::socket::UnixCredentials;
use nix::unistd::{getgid, getuid};

use crate::fd::set_cloexec;
use crate::fdpass;
use crate::mainloop::EventLoop;

/// One pseudo-terminal pair.
#[derive(Debug)]
pub struct PtyInfo {
    master: OwnedFd,
    slave: OwnedFd,
    slave_path: PathBuf,
    busy: Option<RawFd>,
}

impl PtyInfo {
    /// Path of the slave device, e.g. `/dev/pts/3`.
    #[must_use]
    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    /// Connection currently holding the slot, if any.
    #[must_use]
    pub const fn busy(&self) -> Option<RawFd> {
        self.busy
    }

    /// Master side of the pair.
    #[must_use]
    pub fn master(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }

    /// Slave side of the pair.
    #[must_use]
    pub fn slave(&self) -> BorrowedFd<'_> {
        self.slave.as_fd()
    }
}

/// Fixed-size, ordered pool of pseudo-terminals.
#[derive(Debug, Default)]
pub struct TtyInfo {
    ptys: Vec<PtyInfo>,
}

impl TtyInfo {
    /// Opens `count` pty pairs; every descriptor is close-on-exec.
    ///
    /// # Errors
    ///
    /// Returns an error if a pair cannot be opened or its slave name cannot
    /// be resolved. Pairs opened so far are closed again.
    pub fn allocate(count: usize) -> Result<Self> {
        let mut ptys = Vec::with_capacity(count);
        for index in 1..=count {
            let pty =
                nix::pty::openpty(None, None).map_err(|e| LxrunError::sys("openpty", e))?;
            set_cloexec(&pty.master)?;
            set_cloexec(&pty.slave)?;
            let slave_path =
                nix::unistd::ttyname(&pty.slave).map_err(|e| LxrunError::sys("ttyname", e))?;
            tracing::debug!(index, slave = %slave_path.display(), "pty allocated");
            ptys.push(PtyInfo {
                master: pty.master,
                slave: pty.slave,
                slave_path,
                busy: None,
            });
        }
        Ok(Self { ptys })
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ptys.len()
    }

    /// Whether the pool has no slots at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ptys.is_empty()
    }

    /// Slot by 1-based index.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&PtyInfo> {
        index.checked_sub(1).and_then(|i| self.ptys.get(i))
    }

    /// Slots in order, paired with their 1-based index.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &PtyInfo)> {
        self.ptys.iter().enumerate().map(|(i, pty)| (i + 1, pty))
    }

    /// Picks a slot for `request` and marks it busy with `holder`.
    ///
    /// A request of 0 takes the first free slot. Returns the 1-based index
    /// of the claimed slot.
    ///
    /// # Errors
    ///
    /// Returns [`LxrunError::TtyUnavailable`] if the requested slot is out
    /// of range or busy, or no slot is free.
    pub fn claim(&mut self, request: i32, holder: RawFd) -> Result<usize> {
        let unavailable = || LxrunError::TtyUnavailable { index: request };
        let slot = match usize::try_from(request) {
            Ok(0) => self
                .ptys
                .iter()
                .position(|p| p.busy.is_none())
                .ok_or_else(unavailable)?,
            Ok(index) => {
                let slot = index - 1;
                match self.ptys.get(slot) {
                    Some(pty) if pty.busy.is_none() => slot,
                    _ => return Err(unavailable()),
                }
            }
            Err(_) => return Err(unavailable()),
        };
        self.ptys[slot].busy = Some(holder);
        Ok(slot + 1)
    }

    /// Frees the slot held by `holder`, returning its 1-based index.
    pub fn release(&mut self, holder: RawFd) -> Option<usize> {
        let slot = self.ptys.iter().position(|p| p.busy == Some(holder))?;
        self.ptys[slot].busy = None;
        Some(slot + 1)
    }
}

/// An accepted connection; `slot` is set once its request was granted.
#[derive(Debug)]
struct Client {
    stream: UnixStream,
    slot: Option<usize>,
}

/// The pty pool together with its rendezvous socket.
#[derive(Debug)]
pub struct TtyService {
    info: TtyInfo,
    listener: UnixListener,
    clients: HashMap<RawFd, Client>,
    name: String,
}

impl TtyService {
    /// Allocates `count` ptys and starts listening on the container's
    /// rendezvous name.
    ///
    /// # Errors
    ///
    /// Returns an error if the ptys cannot be allocated or the socket cannot
    /// be bound (for instance because the name is already taken).
    pub fn open(name: &str, count: usize) -> Result<Self> {
        let info = TtyInfo::allocate(count)?;
        let socket_name = tty_socket_name(name);
        let listener = abstract_addr(&socket_name)
            .and_then(|addr| UnixListener::bind_addr(&addr))
            .map_err(|e| LxrunError::Io {
                path: PathBuf::from(format!("@{socket_name}")),
                source: e,
            })?;
        listener.set_nonblocking(true).map_err(|e| LxrunError::Io {
            path: PathBuf::from(format!("@{socket_name}")),
            source: e,
        })?;
        tracing::info!(name, ttys = count, socket = %socket_name, "tty service listening");
        Ok(Self {
            info,
            listener,
            clients: HashMap::new(),
            name: name.to_owned(),
        })
    }

    /// The pty pool.
    #[must_use]
    pub const fn info(&self) -> &TtyInfo {
        &self.info
    }

    /// Event loop registrations the service may hold at once: the listener,
    /// one holder per slot, and one more pending request than there are
    /// slots. Connections beyond that are turned away.
    #[must_use]
    pub fn max_registrations(&self) -> usize {
        2 + 2 * self.info.len()
    }

    /// Registers the listening socket with `lp`.
    ///
    /// Accepted connections are registered too. The first readiness of a
    /// connection carries its request; after the grant, the next one is its
    /// hang-up, which frees the slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the registration is rejected.
    pub fn register<C>(&self, lp: &mut EventLoop<C>) -> Result<()>
    where
        C: AsMut<Self> + 'static,
    {
        lp.add_handler(&self.listener, |_, _, lp, ctx: &mut C| {
            ctx.as_mut().accept_client(lp);
            Ok(ControlFlow::Continue(()))
        })
    }

    fn accept_client<C>(&mut self, lp: &mut EventLoop<C>)
    where
        C: AsMut<Self> + 'static,
    {
        let conn = match self.listener.accept() {
            Ok((conn, _)) => conn,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => return,
            Err(e) => {
                tracing::warn!(name = %self.name, error = %e, "failed to accept tty client");
                return;
            }
        };
        let fd = conn.as_raw_fd();

        let registered = prepare(&conn).and_then(|()| {
            lp.add_handler(&conn, |fd, _, lp, ctx: &mut C| {
                ctx.as_mut().client_ready(fd, lp);
                Ok(ControlFlow::Continue(()))
            })
        });
        match registered {
            Ok(()) => {
                let _ = self.clients.insert(fd, Client { stream: conn, slot: None });
                tracing::debug!(name = %self.name, fd, "tty client connected");
            }
            // Dropping the connection is the rejection.
            Err(e) => tracing::warn!(name = %self.name, fd, error = %e, "cannot track tty client"),
        }
    }

    fn client_ready<C>(&mut self, fd: RawFd, lp: &mut EventLoop<C>) {
        let Some(client) = self.clients.get(&fd) else {
            return;
        };

        // Clients never write after the request, so any readiness on a
        // granted connection is its hang-up.
        if client.slot.is_some() {
            self.disconnect(fd, lp);
            if let Some(index) = self.info.release(fd) {
                tracing::info!(name = %self.name, index, fd, "tty released");
            }
            return;
        }

        match serve(&mut self.info, &client.stream) {
            Ok(index) => {
                if let Some(client) = self.clients.get_mut(&fd) {
                    client.slot = Some(index);
                }
                tracing::info!(name = %self.name, index, fd, "tty handed out");
            }
            Err(e) => {
                self.disconnect(fd, lp);
                if e.kind() == error::ErrorKind::Recoverable {
                    tracing::info!(name = %self.name, fd, error = %e, "tty request refused");
                } else {
                    tracing::warn!(name = %self.name, fd, error = %e, "tty request failed");
                }
            }
        }
    }

    /// Unregisters and closes a client connection.
    fn disconnect<C>(&mut self, fd: RawFd, lp: &mut EventLoop<C>) {
        if let Err(e) = lp.del_handler(fd) {
            tracing::warn!(name = %self.name, fd, error = %e, "failed to unregister tty client");
        }
        drop(self.clients.remove(&fd));
    }
}

fn prepare(conn: &UnixStream) -> Result<()> {
    conn.set_nonblocking(true).map_err(|e| LxrunError::Io {
        path: PathBuf::from("tty client"),
        source: e,
    })?;
    fdpass::enable_credentials(conn)
}

/// Reads the request from a readable connection and claims its slot.
fn serve(info: &mut TtyInfo, conn: &UnixStream) -> Result<usize> {
    let Some((request, creds)) = fdpass::recv_with_credentials(conn)? else {
        return Err(LxrunError::protocol("receiving a tty request", "client hung up"));
    };
    authorize(creds.as_ref())?;

    let fd = conn.as_raw_fd();
    let index = info.claim(request, fd)?;
    let sent = info
        .get(index)
        .ok_or(LxrunError::TtyUnavailable { index: request })
        .and_then(|pty| fdpass::send_fd(conn, &pty.master, wire_index(index)));
    if let Err(e) = sent {
        let _ = info.release(fd);
        return Err(e);
    }
    Ok(index)
}

impl AsFd for TtyService {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.listener.as_fd()
    }
}

impl AsMut<Self> for TtyService {
    fn as_mut(&mut self) -> &mut Self {
        self
    }
}

/// Only root and the supervisor's own user may take a tty.
fn authorize(creds: Option<&UnixCredentials>) -> Result<()> {
    let Some(creds) = creds else {
        return Err(LxrunError::PermissionDenied {
            message: "tty client sent no credentials".into(),
        });
    };
    if creds.uid() == 0 {
        return Ok(());
    }
    if creds.uid() != getuid().as_raw() || creds.gid() != getgid().as_raw() {
        return Err(LxrunError::PermissionDenied {
            message: format!("uid {} may not take a tty", creds.uid()),
        });
    }
    Ok(())
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
const fn wire_index(index: usize) -> i32 {
    // Bounded by MAX_TTYS.
    index as i32
}

fn abstract_addr(name: &str) -> std::io::Result<SocketAddr> {
    SocketAddr::from_abstract_name(name.as_bytes())
}

/// Client side of the rendezvous.
///
/// The connection must stay open while the tty is in use; dropping it
/// frees the slot on the supervisor side.
#[derive(Debug)]
pub struct TtyClient {
    stream: UnixStream,
    request: i32,
}

impl TtyClient {
    /// Connects to the rendezvous socket of container `name`.
    ///
    /// # Errors
    ///
    /// Returns [`LxrunError::NotFound`] if nothing listens under that name.
    pub fn connect(name: &str) -> Result<Self> {
        let socket_name = tty_socket_name(name);
        let stream = abstract_addr(&socket_name)
            .and_then(|addr| UnixStream::connect_addr(&addr))
            .map_err(|e| {
                tracing::debug!(socket = %socket_name, error = %e, "connect failed");
                LxrunError::NotFound {
                    kind: "container",
                    id: name.to_owned(),
                }
            })?;
        Ok(Self { stream, request: 0 })
    }

    /// Sends the slot request; 0 asks for any free slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be sent.
    pub fn send_request(&mut self, index: i32) -> Result<()> {
        self.request = index;
        fdpass::send_with_credentials(&self.stream, index)
    }

    /// Waits for the master descriptor and the resolved 1-based index.
    ///
    /// # Errors
    ///
    /// Returns [`LxrunError::TtyUnavailable`] if the supervisor rejected the
    /// request by closing the connection.
    pub fn recv_reply(&self) -> Result<(OwnedFd, i32)> {
        let rejected = LxrunError::TtyUnavailable {
            index: self.request,
        };
        match fdpass::recv_fd(&self.stream) {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(rejected),
            Err(e) => {
                tracing::debug!(error = %e, "tty reply unreadable");
                Err(rejected)
            }
        }
    }
}

impl AsFd for TtyClient {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

/// Requests tty `index` (0 for any) from container `name`.
///
/// Returns the open connection along with the master and resolved index.
///
/// # Errors
///
/// Returns an error if the container is unreachable or refuses the request.
pub fn request(name: &str, index: i32) -> Result<(TtyClient, OwnedFd, i32)> {
    let mut client = TtyClient::connect(name)?;
    client.send_request(index)?;
    let (master, resolved) = client.recv_reply()?;
    Ok((client, master, resolved))
}
