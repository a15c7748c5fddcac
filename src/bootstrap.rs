// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Wire the clock tree, identity stub and service connection together.
// Author: Lukas Bower

//! Process bootstrap.
//!
//! [`start`] builds the clock tree, posts a service connection and runs the
//! 9P dispatcher over it on a background thread. [`run`] is what the binary
//! calls: start against the host rendezvous directory, block until SIGINT or
//! SIGTERM, then tear the service down.

use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use timefs_9p::{NinepError, Server, DMDIR};

use crate::config::Config;
use crate::conn::{SrvAddr, SrvConn};
use crate::fs::{FsError, LeafBehavior, SynthTree};
use crate::srv::{SrvDir, SrvNamespace};
use crate::users::NoneUsers;

/// Name of the bounded clock file.
pub const TIME_FILE: &str = "time";
/// Name of the unbounded clock file.
pub const INFTIME_FILE: &str = "inftime";

/// Build the served tree: a root directory holding both clock files.
pub fn build_tree() -> Result<SynthTree, FsError> {
    let mut tree = SynthTree::new("/", NoneUsers::nobody(), None, DMDIR | 0o555);
    let root = tree.root();
    tree.add(
        root,
        TIME_FILE,
        NoneUsers::nobody(),
        None,
        0o444,
        Some(LeafBehavior::Bounded),
    )?;
    tree.add(
        root,
        INFTIME_FILE,
        NoneUsers::nobody(),
        None,
        0o444,
        Some(LeafBehavior::Unbounded),
    )?;
    Ok(tree)
}

/// A running clock service.
#[derive(Debug)]
pub struct Service {
    conn: SrvConn,
    worker: JoinHandle<std::result::Result<(), NinepError>>,
}

impl Service {
    /// Address the service is reachable at.
    #[must_use]
    pub fn addr(&self) -> &SrvAddr {
        self.conn.local_addr()
    }

    /// Withdraw the posted name and stop the dispatcher.
    ///
    /// Requests still in flight are abandoned.
    pub fn shutdown(self) -> Result<()> {
        let addr = self.conn.local_addr().clone();
        self.conn
            .close()
            .with_context(|| format!("closing {addr}"))?;
        match self.worker.join() {
            Ok(Ok(())) => debug!("dispatcher for {addr} stopped"),
            Ok(Err(err)) => warn!("dispatcher for {addr} stopped with error: {err}"),
            Err(_) => warn!("dispatcher for {addr} panicked"),
        }
        Ok(())
    }
}

/// Post the clock tree as `name` in `namespace` and start serving it.
pub fn start(name: &str, namespace: &dyn SrvNamespace) -> Result<Service> {
    let tree = build_tree().context("building clock tree")?;
    let conn = SrvConn::establish(name, namespace)
        .with_context(|| format!("posting service {name}"))?;
    let stream = conn
        .try_clone_stream()
        .context("duplicating service stream")?;
    let server = Server::new(Arc::new(tree), Arc::new(NoneUsers));
    let worker = server.spawn(stream);
    info!("serving clock files at {}", conn.local_addr());
    Ok(Service { conn, worker })
}

/// Install the SIGINT/SIGTERM handlers that end [`run`].
///
/// Signals arriving after this call are held until [`wait_for_signal`].
pub fn shutdown_signals() -> Result<Signals> {
    Signals::new([SIGINT, SIGTERM]).context("installing signal handlers")
}

/// Block until one of `signals` arrives and return its number.
pub fn wait_for_signal(signals: &mut Signals) -> Result<i32> {
    signals
        .forever()
        .next()
        .context("signal stream ended unexpectedly")
}

/// Serve until a shutdown signal arrives.
pub fn run(config: &Config) -> Result<()> {
    let signals = shutdown_signals()?;
    serve_until_signal(config, signals)
}

/// Post the service, then serve until one of `signals` arrives.
///
/// The handlers must already be installed so that a signal landing while
/// the service is being posted still withdraws it.
pub fn serve_until_signal(config: &Config, mut signals: Signals) -> Result<()> {
    let namespace = SrvDir::new(&config.srv_dir);
    let service = start(&config.service, &namespace)?;
    let signal = wait_for_signal(&mut signals)?;
    info!("signal {signal} received, shutting down");
    service.shutdown()
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::LevelFilter;
    use serial_test::serial;

    #[test]
    fn tree_holds_root_and_two_clocks() {
        let tree = build_tree().expect("tree");
        assert_eq!(tree.len(), 3);
        let root = tree.node(tree.root()).expect("root");
        assert_eq!(root.perm(), DMDIR | 0o555);
        assert_eq!(root.owner().name(), "nobody");
        for name in [TIME_FILE, INFTIME_FILE] {
            let id = tree.lookup(name).expect("clock present");
            let node = tree.node(id).expect("node");
            assert_eq!(node.perm(), 0o444);
            assert!(!node.is_dir());
        }
    }

    #[test]
    #[serial]
    fn signal_during_startup_still_withdraws_the_socket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config {
            service: "startup-signal".to_owned(),
            log_level: LevelFilter::Warn,
            srv_dir: dir.path().to_path_buf(),
        };
        let signals = shutdown_signals().expect("install handlers");
        signal_hook::low_level::raise(SIGTERM).expect("raise SIGTERM");
        serve_until_signal(&config, signals).expect("serve and shut down");
        assert!(!dir.path().join("startup-signal").exists());
    }
}
