//! Descriptor and credential passing over local stream sockets.
//!
//! Every message carries a single native-endian `i32` as its payload. A
//! descriptor travels as `SCM_RIGHTS`, sender credentials as
//! `SCM_CREDENTIALS`. Nothing outside this module touches ancillary data.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};

use lxrun_common::error::{LxrunError, Result};
use nix::errno::Errno;
use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, UnixCredentials, recvmsg, sendmsg, setsockopt,
    sockopt,
};

const PAYLOAD_SIZE: usize = std::mem::size_of::<i32>();

/// Sends `fd` together with `value`.
///
/// # Errors
///
/// Returns an error if `sendmsg(2)` fails or sends a partial payload.
pub fn send_fd<S: AsFd, F: AsFd>(sock: &S, fd: &F, value: i32) -> Result<()> {
    let payload = value.to_ne_bytes();
    let iov = [IoSlice::new(&payload)];
    let fds = [fd.as_fd().as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    let sent = retry(|| {
        sendmsg::<()>(
            sock.as_fd().as_raw_fd(),
            &iov,
            &cmsg,
            MsgFlags::MSG_NOSIGNAL,
            None,
        )
    })
    .map_err(|e| LxrunError::sys("sendmsg(SCM_RIGHTS)", e))?;
    check_len(sent, "sending a descriptor")
}

/// Receives a descriptor and its accompanying value.
///
/// Returns `Ok(None)` when the peer closed the connection. The received
/// descriptor is close-on-exec.
///
/// # Errors
///
/// Returns an error if `recvmsg(2)` fails, the payload is short, or the
/// message carries no descriptor.
pub fn recv_fd<S: AsFd>(sock: &S) -> Result<Option<(OwnedFd, i32)>> {
    let mut payload = [0u8; PAYLOAD_SIZE];
    let mut space = nix::cmsg_space!([RawFd; 1]);
    let mut received = None;

    let bytes = {
        let mut iov = [IoSliceMut::new(&mut payload)];
        let raw = sock.as_fd().as_raw_fd();
        let msg = loop {
            match recvmsg::<()>(raw, &mut iov, Some(&mut space), MsgFlags::MSG_CMSG_CLOEXEC) {
                Err(Errno::EINTR) => {}
                other => break other.map_err(|e| LxrunError::sys("recvmsg(SCM_RIGHTS)", e))?,
            }
        };

        for cmsg in msg.cmsgs().map_err(|e| LxrunError::sys("recvmsg(SCM_RIGHTS)", e))? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                for raw in fds {
                    // SAFETY: the kernel just installed `raw` in our table and
                    // nothing else owns it.
                    let owned = unsafe { OwnedFd::from_raw_fd(raw) };
                    if received.is_none() {
                        received = Some(owned);
                    }
                }
            }
        }
        msg.bytes
    };

    if bytes == 0 {
        return Ok(None);
    }
    check_len(bytes, "receiving a descriptor")?;
    let fd = received.ok_or_else(|| {
        LxrunError::protocol("receiving a descriptor", "message carried no descriptor")
    })?;
    Ok(Some((fd, i32::from_ne_bytes(payload))))
}

/// Sends `value` with this process's credentials attached.
///
/// # Errors
///
/// Returns an error if `sendmsg(2)` fails or sends a partial payload.
pub fn send_with_credentials<S: AsFd>(sock: &S, value: i32) -> Result<()> {
    let payload = value.to_ne_bytes();
    let iov = [IoSlice::new(&payload)];
    let creds = UnixCredentials::new();
    let cmsg = [ControlMessage::ScmCredentials(&creds)];
    let sent = retry(|| {
        sendmsg::<()>(
            sock.as_fd().as_raw_fd(),
            &iov,
            &cmsg,
            MsgFlags::MSG_NOSIGNAL,
            None,
        )
    })
    .map_err(|e| LxrunError::sys("sendmsg(SCM_CREDENTIALS)", e))?;
    check_len(sent, "sending credentials")
}

/// Asks the kernel to attach sender credentials to received messages.
///
/// # Errors
///
/// Returns an error if `setsockopt(2)` fails.
pub fn enable_credentials<S: AsFd>(sock: &S) -> Result<()> {
    setsockopt(sock, sockopt::PassCred, &true)
        .map_err(|e| LxrunError::sys("setsockopt(SO_PASSCRED)", e))
}

/// Receives a value and the sender's credentials, if any were attached.
///
/// Returns `Ok(None)` when the peer closed the connection.
/// [`enable_credentials`] must have been called on `sock` beforehand.
///
/// # Errors
///
/// Returns an error if `recvmsg(2)` fails or the payload is short.
pub fn recv_with_credentials<S: AsFd>(sock: &S) -> Result<Option<(i32, Option<UnixCredentials>)>> {
    let mut payload = [0u8; PAYLOAD_SIZE];
    let mut space = nix::cmsg_space!(UnixCredentials);
    let mut creds = None;

    let bytes = {
        let mut iov = [IoSliceMut::new(&mut payload)];
        let raw = sock.as_fd().as_raw_fd();
        let msg = loop {
            match recvmsg::<()>(raw, &mut iov, Some(&mut space), MsgFlags::empty()) {
                Err(Errno::EINTR) => {}
                other => {
                    break other.map_err(|e| LxrunError::sys("recvmsg(SCM_CREDENTIALS)", e))?;
                }
            }
        };

        for cmsg in msg.cmsgs().map_err(|e| LxrunError::sys("recvmsg(SCM_CREDENTIALS)", e))? {
            if let ControlMessageOwned::ScmCredentials(c) = cmsg {
                creds = Some(c);
            }
        }
        msg.bytes
    };

    if bytes == 0 {
        return Ok(None);
    }
    check_len(bytes, "receiving credentials")?;
    Ok(Some((i32::from_ne_bytes(payload), creds)))
}

fn check_len(len: usize, stage: &'static str) -> Result<()> {
    if len == PAYLOAD_SIZE {
        Ok(())
    } else {
        Err(LxrunError::protocol(stage, format!("expected {PAYLOAD_SIZE} bytes, got {len}")))
    }
}

fn retry<T>(mut op: impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
    loop {
        match op() {
            Err(Errno::EINTR) => {}
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    #[test]
    fn descriptor_arrives_with_value() {
        let (a, b) = UnixStream::pair().unwrap();
        let (mut inner_a, inner_b) = UnixStream::pair().unwrap();

        send_fd(&a, &inner_b, 7).unwrap();
        drop(inner_b);
        let (fd, value) = recv_fd(&b).unwrap().unwrap();
        assert_eq!(value, 7);
        assert!(crate::fd::is_cloexec(&fd).unwrap());

        // The received descriptor is the other end of `inner_a`.
        let mut received = UnixStream::from(fd);
        inner_a.write_all(b"hi").unwrap();
        let mut buf = [0u8; 2];
        received.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn closed_peer_yields_none() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(a);
        assert!(recv_fd(&b).unwrap().is_none());
    }

    #[test]
    fn message_without_descriptor_is_rejected() {
        let (mut a, b) = UnixStream::pair().unwrap();
        a.write_all(&5i32.to_ne_bytes()).unwrap();
        let err = recv_fd(&b).unwrap_err();
        assert!(err.to_string().contains("no descriptor"));
    }

    #[test]
    fn credentials_identify_the_sender() {
        let (a, b) = UnixStream::pair().unwrap();
        enable_credentials(&b).unwrap();
        send_with_credentials(&a, 3).unwrap();

        let (value, creds) = recv_with_credentials(&b).unwrap().unwrap();
        assert_eq!(value, 3);
        let creds = creds.unwrap();
        assert_eq!(creds.uid(), nix::unistd::getuid().as_raw());
        assert_eq!(creds.pid(), nix::unistd::getpid().as_raw());
    }
}
