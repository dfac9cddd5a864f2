//! Container lifecycle orchestration for lxrun.
//!
//! [`start::start`] is the entry point: it builds a
//! [`handler::ContainerHandler`], spawns the container init inside its
//! namespaces, supervises it until it exits and tears everything down.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod console;
pub mod handler;
pub mod monitor;
pub mod network;
pub mod poll;
pub mod setup;
pub mod spawn;
pub mod start;
pub mod state;
pub mod status;
