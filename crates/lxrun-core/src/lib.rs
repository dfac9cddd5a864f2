//! # lxrun-core
//!
//! Low-level Linux primitives for the lxrun container supervisor.
//!
//! This crate provides safe abstractions over:
//! - **Event multiplexing**: a single-threaded epoll dispatcher whose
//!   callbacks may add and remove registrations while it runs.
//! - **Synchronization**: the parent/child handshake around `clone(2)`.
//! - **Signal capture**: `SIGCHLD` delivered through a `signalfd`.
//! - **TTY service**: a pool of pseudo-terminals handed out over an
//!   abstract-namespace socket with descriptor passing.
//! - **Namespaces, cgroups and capabilities** used by the spawner.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! `// SAFETY:` documentation.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod capability;
pub mod cgroup;
pub mod fd;
pub mod fdpass;
pub mod filesystem;
pub mod mainloop;
pub mod namespace;
pub mod signal;
pub mod sync;
pub mod tty;
