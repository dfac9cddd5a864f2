//! Single-threaded, readiness-based descriptor dispatcher.
//!
//! An [`EventLoop`] maps registered descriptors to callbacks and blocks in
//! `epoll_wait(2)` until one of them becomes readable, has priority data, or
//! hangs up. Callbacks receive the loop itself so they can register new
//! descriptors or drop existing ones (their own included) before returning.
//!
//! Callbacks run cooperatively: they must never block. A callback returns
//! `Ok(ControlFlow::Continue(()))` to keep going, `Ok(ControlFlow::Break(()))`
//! to end the loop successfully, or an error to abort it.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

use lxrun_common::error::{LxrunError, Result};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

/// Boxed handler invoked when its descriptor becomes ready.
///
/// Arguments are the ready descriptor, the reported readiness flags, the
/// loop (for registry changes) and the shared context.
pub type Callback<C> =
    Box<dyn FnMut(RawFd, EpollFlags, &mut EventLoop<C>, &mut C) -> Result<ControlFlow<()>>>;

struct Slot<C> {
    /// `None` while the callback is executing.
    callback: Option<Callback<C>>,
    generation: u32,
}

/// Readiness dispatcher over a bounded set of descriptors.
pub struct EventLoop<C> {
    epoll: Epoll,
    slots: HashMap<RawFd, Slot<C>>,
    capacity: usize,
    generation: u32,
}

impl<C> EventLoop<C> {
    /// Creates an empty loop accepting at most `capacity` registrations.
    ///
    /// # Errors
    ///
    /// Returns an error if `capacity` is zero or `epoll_create1(2)` fails.
    pub fn open(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(LxrunError::Registry {
                message: "event loop capacity must be positive".into(),
            });
        }
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| LxrunError::sys("epoll_create1", e))?;
        tracing::trace!(capacity, "event loop opened");
        Ok(Self {
            epoll,
            slots: HashMap::with_capacity(capacity),
            capacity,
            generation: 0,
        })
    }

    /// Registers `callback` for `fd`.
    ///
    /// The descriptor must stay open until it is removed with
    /// [`del_handler`](Self::del_handler).
    ///
    /// # Errors
    ///
    /// Returns an error if `fd` is already registered, the loop is full, or
    /// `epoll_ctl(2)` fails.
    pub fn add_handler<F, H>(&mut self, fd: &F, callback: H) -> Result<()>
    where
        F: AsFd,
        H: FnMut(RawFd, EpollFlags, &mut Self, &mut C) -> Result<ControlFlow<()>> + 'static,
    {
        let raw = fd.as_fd().as_raw_fd();
        if self.slots.contains_key(&raw) {
            return Err(LxrunError::Registry {
                message: format!("descriptor {raw} is already registered"),
            });
        }
        if self.slots.len() >= self.capacity {
            return Err(LxrunError::Registry {
                message: format!("event loop is full ({} descriptors)", self.capacity),
            });
        }

        self.generation = self.generation.wrapping_add(1);
        let flags = EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI | EpollFlags::EPOLLHUP;
        let event = EpollEvent::new(flags, token(raw, self.generation));
        self.epoll
            .add(fd.as_fd(), event)
            .map_err(|e| LxrunError::sys("epoll_ctl(ADD)", e))?;

        let _ = self.slots.insert(
            raw,
            Slot {
                callback: Some(Box::new(callback)),
                generation: self.generation,
            },
        );
        tracing::trace!(fd = raw, "handler registered");
        Ok(())
    }

    /// Registers `callback` for a descriptor whose owner moves into the loop.
    ///
    /// The owner is dropped, closing the descriptor, when the registration
    /// is removed or the loop itself is dropped.
    ///
    /// # Errors
    ///
    /// Same as [`add_handler`](Self::add_handler); on error the owner is
    /// dropped.
    pub fn add_owned_handler<F, H>(&mut self, owner: F, mut callback: H) -> Result<()>
    where
        F: AsFd + 'static,
        H: FnMut(RawFd, EpollFlags, &mut Self, &mut C) -> Result<ControlFlow<()>> + 'static,
    {
        // SAFETY: `owner` moves into the callback below and so outlives the
        // registration made with this borrow.
        let borrowed = unsafe { BorrowedFd::borrow_raw(owner.as_fd().as_raw_fd()) };
        self.add_handler(&borrowed, move |fd, flags, lp, ctx| {
            let _owner = &owner;
            callback(fd, flags, lp, ctx)
        })
    }

    /// Removes the registration for `fd`.
    ///
    /// Safe to call from inside the callback currently running for `fd`:
    /// the callback is dropped once it returns, which also closes any
    /// descriptor it owns.
    ///
    /// # Errors
    ///
    /// Returns an error if `fd` is not registered or `epoll_ctl(2)` fails.
    pub fn del_handler(&mut self, fd: RawFd) -> Result<()> {
        // Held until after the epoll removal: dropping it may close `fd`.
        let Some(slot) = self.slots.remove(&fd) else {
            return Err(LxrunError::Registry {
                message: format!("descriptor {fd} is not registered"),
            });
        };
        // SAFETY: registered descriptors are required to stay open until
        // they are deregistered, which is happening right now.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let removed = self
            .epoll
            .delete(borrowed)
            .map_err(|e| LxrunError::sys("epoll_ctl(DEL)", e));
        drop(slot);
        removed?;
        tracing::trace!(fd, "handler removed");
        Ok(())
    }

    /// Returns whether `fd` is registered.
    #[must_use]
    pub fn contains(&self, fd: RawFd) -> bool {
        self.slots.contains_key(&fd)
    }

    /// Number of registered descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns whether no descriptor is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Dispatches events until a callback breaks or fails.
    ///
    /// An empty registry does not end the loop; neither does an interrupted
    /// wait, which is retried.
    ///
    /// # Errors
    ///
    /// Returns the first callback error, or the wait error if
    /// `epoll_wait(2)` fails with anything other than `EINTR`.
    pub fn run(&mut self, ctx: &mut C) -> Result<()> {
        loop {
            if self.run_once(ctx, None)?.is_break() {
                return Ok(());
            }
        }
    }

    /// Waits once, for at most `timeout_ms` milliseconds when given, and
    /// dispatches whatever became ready.
    ///
    /// # Errors
    ///
    /// Same as [`run`](Self::run).
    pub fn run_once(&mut self, ctx: &mut C, timeout_ms: Option<u16>) -> Result<ControlFlow<()>> {
        let timeout = timeout_ms.map_or(EpollTimeout::NONE, EpollTimeout::from);
        let mut events = vec![EpollEvent::empty(); self.capacity];

        let ready = loop {
            match self.epoll.wait(&mut events, timeout) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    tracing::error!(error = %e, "failed to wait for events");
                    return Err(LxrunError::sys("epoll_wait", e));
                }
            }
        };

        for event in &events[..ready] {
            if self.dispatch(*event, ctx)?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn dispatch(&mut self, event: EpollEvent, ctx: &mut C) -> Result<ControlFlow<()>> {
        let (fd, generation) = untoken(event.data());

        // The registration may have been removed, or replaced by a new one
        // for a recycled descriptor number, earlier in this batch.
        let Some(slot) = self.slots.get_mut(&fd) else {
            return Ok(ControlFlow::Continue(()));
        };
        if slot.generation != generation {
            return Ok(ControlFlow::Continue(()));
        }
        let Some(mut callback) = slot.callback.take() else {
            return Ok(ControlFlow::Continue(()));
        };

        let flow = callback(fd, event.events(), self, ctx);

        if let Some(slot) = self.slots.get_mut(&fd) {
            if slot.generation == generation {
                slot.callback = Some(callback);
            }
        }
        flow
    }
}

#[allow(clippy::cast_sign_loss)]
fn token(fd: RawFd, generation: u32) -> u64 {
    (u64::from(generation) << 32) | u64::from(fd as u32)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
const fn untoken(data: u64) -> (RawFd, u32) {
    (data as u32 as RawFd, (data >> 32) as u32)
}

impl<C> std::fmt::Debug for EventLoop<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("registered", &self.slots.len())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
