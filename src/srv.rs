// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Service namespaces where stream endpoints are posted by name.
// Author: Lukas Bower

//! Service posting.
//!
//! A [`SrvNamespace`] takes ownership of one end of a stream and makes it
//! reachable under a name until the returned [`SrvRegistration`] is dropped.
//! [`ProcessSrv`] keeps posted ends in a process-global table for in-process
//! clients. [`SrvDir`] publishes a Unix socket in a host directory and relays
//! outside clients onto the posted end one at a time, a whole 9P frame at a
//! time.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fs;
use std::io;
use std::net::Shutdown;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use log::{debug, info, trace, warn};
use once_cell::sync::Lazy;
use thiserror::Error;
use timefs_9p::codec::{read_frame, write_frame};
use timefs_9p::MAX_MSIZE;

/// Environment variable naming the rendezvous directory used by [`SrvDir`].
pub const SRV_DIR_ENV: &str = "TIMEFS_SRV_DIR";

/// Rendezvous directory used when [`SRV_DIR_ENV`] is unset.
pub const DEFAULT_SRV_DIR: &str = "/tmp/srv";

/// Errors raised while posting or reaching a service.
#[derive(Debug, Error)]
pub enum SrvError {
    /// Another service already holds the name.
    #[error("/srv/{0}: name already posted")]
    NameTaken(String),
    /// The namespace refused the registration.
    #[error("/srv/{0}: registration denied")]
    RegistrationDenied(String),
    /// Nothing is posted under the name.
    #[error("/srv/{0}: not posted")]
    NotRegistered(String),
    /// Service connections carry no timeouts.
    #[error("deadlines are not supported on service connections")]
    DeadlineUnsupported,
    /// Any other I/O failure.
    #[error("srv i/o: {0}")]
    Io(#[from] io::Error),
}

/// A place where stream ends can be posted under a name.
pub trait SrvNamespace {
    /// Publish `end` as `name`; ownership of `end` moves into the namespace.
    ///
    /// On error `end` is dropped, closing it.
    fn post(&self, name: &str, end: UnixStream) -> Result<SrvRegistration, SrvError>;
}

/// Keeps a posted name alive; dropping it withdraws the service.
pub struct SrvRegistration {
    name: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl SrvRegistration {
    fn new(name: &str, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            name: name.to_owned(),
            release: Some(Box::new(release)),
        }
    }

    /// Name the service is posted under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for SrvRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SrvRegistration")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Drop for SrvRegistration {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
        debug!("withdrew /srv/{}", self.name);
    }
}

fn check_name(name: &str) -> Result<(), SrvError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(SrvError::RegistrationDenied(name.to_owned()));
    }
    Ok(())
}

static POSTED: Lazy<Mutex<HashMap<String, UnixStream>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn posted() -> MutexGuard<'static, HashMap<String, UnixStream>> {
    lock(&*POSTED)
}

/// Process-global service table.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessSrv;

impl ProcessSrv {
    /// Obtain a handle onto the end posted as `name`.
    ///
    /// Every handle shares the same underlying stream, as a reopened `/srv`
    /// file would.
    pub fn open(name: &str) -> Result<UnixStream, SrvError> {
        let table = posted();
        let end = table
            .get(name)
            .ok_or_else(|| SrvError::NotRegistered(name.to_owned()))?;
        Ok(end.try_clone()?)
    }

    /// Whether anything is posted as `name`.
    #[must_use]
    pub fn is_posted(name: &str) -> bool {
        posted().contains_key(name)
    }
}

impl SrvNamespace for ProcessSrv {
    fn post(&self, name: &str, end: UnixStream) -> Result<SrvRegistration, SrvError> {
        check_name(name)?;
        let mut table = posted();
        if table.contains_key(name) {
            return Err(SrvError::NameTaken(name.to_owned()));
        }
        table.insert(name.to_owned(), end);
        info!("posted /srv/{name} in process");
        let key = name.to_owned();
        Ok(SrvRegistration::new(name, move || {
            posted().remove(&key);
        }))
    }
}

/// Host rendezvous directory of Unix sockets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvDir {
    dir: PathBuf,
}

impl SrvDir {
    /// Use `dir` as the rendezvous directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Use [`SRV_DIR_ENV`] if set, [`DEFAULT_SRV_DIR`] otherwise.
    #[must_use]
    pub fn from_env() -> Self {
        match std::env::var_os(SRV_DIR_ENV) {
            Some(dir) if !dir.is_empty() => Self::new(dir),
            _ => Self::new(DEFAULT_SRV_DIR),
        }
    }

    /// The rendezvous directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Socket path for `name`.
    #[must_use]
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Connect to the service posted as `name`.
    pub fn connect(&self, name: &str) -> Result<UnixStream, SrvError> {
        UnixStream::connect(self.path_for(name)).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
                SrvError::NotRegistered(name.to_owned())
            }
            _ => SrvError::Io(err),
        })
    }
}

impl SrvNamespace for SrvDir {
    fn post(&self, name: &str, end: UnixStream) -> Result<SrvRegistration, SrvError> {
        check_name(name)?;
        fs::create_dir_all(&self.dir).map_err(|err| denied_or_io(name, err))?;
        let path = self.path_for(name);
        let listener = match UnixListener::bind(&path) {
            Ok(listener) => listener,
            Err(err) if is_taken(&err) => {
                reclaim_stale(name, &path)?;
                UnixListener::bind(&path).map_err(|err| bind_error(name, err))?
            }
            Err(err) => return Err(denied_or_io(name, err)),
        };
        let relay = Relay::start(listener, end, path.clone()).map_err(|err| {
            let _ = fs::remove_file(&path);
            SrvError::Io(err)
        })?;
        info!("posted /srv/{name} at {}", path.display());
        Ok(SrvRegistration::new(name, move || relay.stop()))
    }
}

fn is_taken(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::AddrInUse | io::ErrorKind::AlreadyExists
    )
}

fn bind_error(name: &str, err: io::Error) -> SrvError {
    if is_taken(&err) {
        SrvError::NameTaken(name.to_owned())
    } else {
        denied_or_io(name, err)
    }
}

// A socket nobody listens on is what a killed server leaves behind. Only
// sockets are reclaimed; a live listener or any other file keeps the name.
fn reclaim_stale(name: &str, path: &Path) -> Result<(), SrvError> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(denied_or_io(name, err)),
    };
    if !metadata.file_type().is_socket() {
        return Err(SrvError::NameTaken(name.to_owned()));
    }
    match UnixStream::connect(path) {
        Ok(_) => Err(SrvError::NameTaken(name.to_owned())),
        Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
            warn!("removing stale socket {}", path.display());
            match fs::remove_file(path) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => Err(denied_or_io(name, err)),
                _ => Ok(()),
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(denied_or_io(name, err)),
    }
}

fn denied_or_io(name: &str, err: io::Error) -> SrvError {
    if err.kind() == io::ErrorKind::PermissionDenied {
        SrvError::RegistrationDenied(name.to_owned())
    } else {
        SrvError::Io(err)
    }
}

/// Routing state shared by the two relay threads.
///
/// The dispatcher answers every request exactly once and in arrival order,
/// so recording the client behind each forwarded request is enough to route
/// replies. Replies owed to a client that has gone are discarded.
#[derive(Default)]
struct Routing {
    attached: Option<(u64, UnixStream)>,
    owners: VecDeque<u64>,
}

impl Routing {
    fn deliver(&mut self, frame: &[u8]) {
        let Some(owner) = self.owners.pop_front() else {
            warn!("srv dropping unsolicited reply");
            return;
        };
        match self.attached.as_mut() {
            Some((client, stream)) if *client == owner => {
                if let Err(err) = write_frame(stream, frame) {
                    debug!("srv client {owner} unreachable: {err}");
                    self.attached = None;
                }
            }
            _ => trace!("srv dropping reply for departed client {owner}"),
        }
    }

    fn detach(&mut self, client: u64) {
        if matches!(self.attached, Some((current, _)) if current == client) {
            self.attached = None;
        }
    }
}

/// Relays whole 9P frames between the posted end and one client at a time.
struct Relay {
    end: UnixStream,
    routing: Arc<Mutex<Routing>>,
    stopping: Arc<AtomicBool>,
    path: PathBuf,
}

impl Relay {
    fn start(listener: UnixListener, end: UnixStream, path: PathBuf) -> io::Result<Self> {
        let stopping = Arc::new(AtomicBool::new(false));
        let routing = Arc::new(Mutex::new(Routing::default()));

        let mut from_service = end.try_clone()?;
        let replies = Arc::clone(&routing);
        thread::spawn(move || loop {
            match read_frame(&mut from_service, MAX_MSIZE) {
                Ok(Some(frame)) => lock(&replies).deliver(&frame),
                Ok(None) => break,
                Err(err) => {
                    debug!("srv service stream ended: {err}");
                    break;
                }
            }
        });

        let mut to_service = end.try_clone()?;
        let requests = Arc::clone(&routing);
        let accept_stop = Arc::clone(&stopping);
        thread::spawn(move || {
            let mut next_client = 0u64;
            'accept: for incoming in listener.incoming() {
                if accept_stop.load(Ordering::Acquire) {
                    break;
                }
                let mut client = match incoming {
                    Ok(client) => client,
                    Err(err) => {
                        warn!("srv accept failed: {err}");
                        continue;
                    }
                };
                let reply_path = match client.try_clone() {
                    Ok(reply_path) => reply_path,
                    Err(err) => {
                        warn!("srv client dropped: {err}");
                        continue;
                    }
                };
                next_client += 1;
                let id = next_client;
                lock(&requests).attached = Some((id, reply_path));
                debug!("srv client {id} attached");
                loop {
                    // A frame cut short by a hangup is never forwarded.
                    let frame = match read_frame(&mut client, MAX_MSIZE) {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(err) => {
                            debug!("srv client {id} dropped: {err}");
                            break;
                        }
                    };
                    lock(&requests).owners.push_back(id);
                    if let Err(err) = write_frame(&mut to_service, &frame) {
                        debug!("srv service stream closed: {err}");
                        lock(&requests).detach(id);
                        break 'accept;
                    }
                }
                lock(&requests).detach(id);
                debug!("srv client {id} detached");
            }
        });

        Ok(Self {
            end,
            routing,
            stopping,
            path,
        })
    }

    fn stop(self) {
        self.stopping.store(true, Ordering::Release);
        if let Some((_, client)) = lock(&self.routing).attached.take() {
            let _ = client.shutdown(Shutdown::Both);
        }
        let _ = self.end.shutdown(Shutdown::Both);
        // Wake the accept loop so it observes the flag.
        let _ = UnixStream::connect(&self.path);
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("failed to remove {}: {err}", self.path.display());
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
