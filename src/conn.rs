// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Stream connection whose far end is published in a service namespace.
// Author: Lukas Bower

use std::fmt;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::time::Instant;

use log::{debug, info};

use crate::srv::{SrvError, SrvNamespace, SrvRegistration};

/// Address of a posted service, rendered as `/srv/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SrvAddr {
    name: String,
}

impl SrvAddr {
    /// Network family of the address.
    #[must_use]
    pub fn network(&self) -> &'static str {
        "srv"
    }

    /// Posted name without the `/srv/` prefix.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for SrvAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/srv/{}", self.name)
    }
}

/// The consumer end of a stream pair whose producer end has been posted.
///
/// Bytes written here come out of the posted end and vice versa, in order.
#[derive(Debug)]
pub struct SrvConn {
    stream: UnixStream,
    addr: SrvAddr,
    registration: SrvRegistration,
}

impl SrvConn {
    /// Create a linked stream pair and post its far end as `name`.
    ///
    /// On failure neither end survives.
    pub fn establish(name: &str, namespace: &dyn SrvNamespace) -> Result<Self, SrvError> {
        let (local, posted) = UnixStream::pair()?;
        let registration = namespace.post(name, posted)?;
        info!("service connection established at /srv/{name}");
        Ok(Self {
            stream: local,
            addr: SrvAddr {
                name: name.to_owned(),
            },
            registration,
        })
    }

    /// Another handle onto the local end, for use by a serving thread.
    pub fn try_clone_stream(&self) -> io::Result<UnixStream> {
        self.stream.try_clone()
    }

    /// Local address; the published name.
    #[must_use]
    pub fn local_addr(&self) -> &SrvAddr {
        &self.addr
    }

    /// Remote address; also the published name.
    #[must_use]
    pub fn remote_addr(&self) -> &SrvAddr {
        &self.addr
    }

    /// Shut the stream down and withdraw the posted name.
    ///
    /// Readers blocked on any clone of the local end observe end of file.
    pub fn close(self) -> Result<(), SrvError> {
        let result = match self.stream.shutdown(Shutdown::Both) {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => Err(SrvError::Io(err)),
            _ => Ok(()),
        };
        debug!("closing {}", self.addr);
        drop(self.registration);
        result
    }

    /// Deadlines are unsupported; always fails.
    pub fn set_deadline(&self, _deadline: Option<Instant>) -> Result<(), SrvError> {
        Err(SrvError::DeadlineUnsupported)
    }

    /// Deadlines are unsupported; always fails.
    pub fn set_read_deadline(&self, _deadline: Option<Instant>) -> Result<(), SrvError> {
        Err(SrvError::DeadlineUnsupported)
    }

    /// Deadlines are unsupported; always fails.
    pub fn set_write_deadline(&self, _deadline: Option<Instant>) -> Result<(), SrvError> {
        Err(SrvError::DeadlineUnsupported)
    }
}

impl Read for SrvConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for SrvConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::srv::ProcessSrv;
    use serial_test::serial;
    use std::time::Duration;

    #[test]
    #[serial]
    fn bytes_flow_both_ways_in_order() {
        let mut conn = SrvConn::establish("conn-unit-loop", &ProcessSrv).expect("establish");
        let mut peer = ProcessSrv::open("conn-unit-loop").expect("open");

        for chunk in [&b"one "[..], &b"two "[..], &b"three"[..]] {
            peer.write_all(chunk).expect("peer write");
        }
        let mut buf = [0u8; 13];
        conn.read_exact(&mut buf).expect("conn read");
        assert_eq!(&buf, b"one two three");

        conn.write_all(b"back").expect("conn write");
        let mut reply = [0u8; 4];
        peer.read_exact(&mut reply).expect("peer read");
        assert_eq!(&reply, b"back");
        conn.close().expect("close");
    }

    #[test]
    #[serial]
    fn addresses_name_the_service() {
        let conn = SrvConn::establish("conn-unit-addr", &ProcessSrv).expect("establish");
        assert_eq!(conn.local_addr().to_string(), "/srv/conn-unit-addr");
        assert_eq!(conn.remote_addr(), conn.local_addr());
        assert_eq!(conn.local_addr().network(), "srv");
        conn.close().expect("close");
    }

    #[test]
    #[serial]
    fn deadlines_always_fail() {
        let conn = SrvConn::establish("conn-unit-deadline", &ProcessSrv).expect("establish");
        let soon = Some(Instant::now() + Duration::from_secs(1));
        for deadline in [None, soon] {
            assert!(matches!(
                conn.set_deadline(deadline),
                Err(SrvError::DeadlineUnsupported)
            ));
            assert!(matches!(
                conn.set_read_deadline(deadline),
                Err(SrvError::DeadlineUnsupported)
            ));
            assert!(matches!(
                conn.set_write_deadline(deadline),
                Err(SrvError::DeadlineUnsupported)
            ));
        }
        conn.close().expect("close");
    }

    #[test]
    #[serial]
    fn second_establish_under_same_name_fails() {
        let first = SrvConn::establish("conn-unit-dup", &ProcessSrv).expect("establish");
        let err = SrvConn::establish("conn-unit-dup", &ProcessSrv).expect_err("duplicate");
        assert!(matches!(err, SrvError::NameTaken(_)));
        first.close().expect("close");
        let again = SrvConn::establish("conn-unit-dup", &ProcessSrv).expect("re-establish");
        again.close().expect("close");
    }

    #[test]
    #[serial]
    fn close_wakes_blocked_readers() {
        let conn = SrvConn::establish("conn-unit-close", &ProcessSrv).expect("establish");
        let mut reader = conn.try_clone_stream().expect("clone");
        let waiter = std::thread::spawn(move || {
            let mut buf = [0u8; 1];
            reader.read(&mut buf).expect("read after close")
        });
        std::thread::sleep(Duration::from_millis(20));
        conn.close().expect("close");
        assert_eq!(waiter.join().expect("reader thread"), 0);
        assert!(!ProcessSrv::is_posted("conn-unit-close"));
    }
}
