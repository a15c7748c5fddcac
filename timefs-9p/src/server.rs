// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Drive 9P2000 sessions over byte streams on behalf of a file tree.
// Author: Lukas Bower

//! Request dispatcher.
//!
//! [`Server`] owns the per-stream fid table and translates decoded requests
//! into calls on a [`Serve9p`] implementation. File trees only answer
//! questions about qids; everything protocol-shaped lives here.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, trace, warn};

use crate::codec::{encode_stat, read_frame, write_frame, Codec};
use crate::identity::{permits, User, Users};
use crate::types::*;
use crate::{NinepError, Result};

const PERMISSION_DENIED: &str = "permission denied";

/// Operations a file tree provides to the dispatcher.
///
/// Files are identified by the qids the tree hands out. Implementations are
/// shared between sessions, so every method takes `&self`.
pub trait Serve9p: Send + Sync + 'static {
    /// Qid of the tree root for an attaching user.
    fn attach(&self, user: &dyn User, aname: &str) -> Result<Qid>;

    /// Resolve `name` inside the directory `parent`. `..` names the parent.
    fn walk(&self, parent: &Qid, name: &str) -> Result<Qid>;

    /// Describe a file.
    fn stat(&self, qid: &Qid) -> Result<Stat>;

    /// Read up to `count` bytes of a regular file at `offset`.
    fn read(&self, qid: &Qid, offset: u64, count: u32) -> Result<Vec<u8>>;

    /// Describe the entries of a directory.
    fn read_dir(&self, qid: &Qid) -> Result<Vec<Stat>>;

    /// Hook invoked after a successful permission check on open.
    fn open(&self, _qid: &Qid, _mode: OpenMode) -> Result<()> {
        Ok(())
    }

    /// Create a file; read-only trees keep the default.
    fn create(&self, _parent: &Qid, _name: &str, _perm: u32, _mode: OpenMode) -> Result<Qid> {
        Err(PERMISSION_DENIED.to_owned())
    }

    /// Write to a file; read-only trees keep the default.
    fn write(&self, _qid: &Qid, _offset: u64, _data: &[u8]) -> Result<u32> {
        Err(PERMISSION_DENIED.to_owned())
    }

    /// Remove a file; read-only trees keep the default.
    fn remove(&self, _qid: &Qid) -> Result<()> {
        Err(PERMISSION_DENIED.to_owned())
    }

    /// Change file attributes; read-only trees keep the default.
    fn write_stat(&self, _qid: &Qid, _stat: &Stat) -> Result<()> {
        Err(PERMISSION_DENIED.to_owned())
    }

    /// Notification that a fid referring to `qid` was released.
    fn clunk(&self, _qid: &Qid) {}
}

/// 9P2000 server bound to a file tree and an identity provider.
pub struct Server<S> {
    fs: Arc<S>,
    users: Arc<dyn Users>,
    codec: Codec,
}

impl<S> Clone for Server<S> {
    fn clone(&self) -> Self {
        Self {
            fs: Arc::clone(&self.fs),
            users: Arc::clone(&self.users),
            codec: self.codec,
        }
    }
}

impl<S: Serve9p> Server<S> {
    /// Create a server for `fs`, resolving attach names through `users`.
    pub fn new(fs: Arc<S>, users: Arc<dyn Users>) -> Self {
        Self {
            fs,
            users,
            codec: Codec,
        }
    }

    /// Borrow the served tree.
    pub fn fs(&self) -> &Arc<S> {
        &self.fs
    }

    /// Serve requests arriving on `stream` until the peer closes it.
    ///
    /// Responses are written back to the same stream in request order.
    pub fn serve_stream<T: Read + Write>(
        &self,
        mut stream: T,
    ) -> std::result::Result<(), NinepError> {
        let mut session = Session::new();
        debug!("9p session started");
        loop {
            let frame = match read_frame(&mut stream, session.msize)? {
                Some(frame) => frame,
                None => break,
            };
            let reply = self.handle_frame(&mut session, &frame)?;
            write_frame(&mut stream, &reply)?;
        }
        debug!("9p session ended with {} fids outstanding", session.fids.len());
        for fid in session.fids.values() {
            self.fs.clunk(&fid.qid);
        }
        Ok(())
    }

    /// Run [`Server::serve_stream`] on a dedicated thread.
    pub fn spawn<T>(&self, stream: T) -> JoinHandle<std::result::Result<(), NinepError>>
    where
        T: Read + Write + Send + 'static,
    {
        let server = self.clone();
        thread::spawn(move || server.serve_stream(stream))
    }

    fn handle_frame(
        &self,
        session: &mut Session,
        frame: &[u8],
    ) -> std::result::Result<Vec<u8>, NinepError> {
        let request = match self.codec.decode_request(frame) {
            Ok(request) => request,
            Err(err) => {
                warn!("dropping undecodable request: {err}");
                let tag = u16::from_le_bytes([frame[5], frame[6]]);
                let response = Response {
                    tag,
                    body: ResponseBody::Error {
                        ename: err.to_string(),
                    },
                };
                return Ok(self.codec.encode_response(&response)?);
            }
        };
        trace!("<- tag {} {}", request.tag, request.body);
        let body = match self.dispatch(session, request.body) {
            Ok(body) => body,
            Err(ename) => ResponseBody::Error { ename },
        };
        trace!("-> tag {} {}", request.tag, body);
        let response = Response {
            tag: request.tag,
            body,
        };
        Ok(self.codec.encode_response(&response)?)
    }

    fn dispatch(&self, session: &mut Session, body: RequestBody) -> Result<ResponseBody> {
        if session.version.is_none() && !matches!(body, RequestBody::Version { .. }) {
            return Err("version not negotiated".to_owned());
        }
        match body {
            RequestBody::Version { msize, version } => Ok(session.negotiate(msize, &version)),
            RequestBody::Auth { .. } => Err("authentication not required".to_owned()),
            RequestBody::Flush { .. } => Ok(ResponseBody::Flush),
            RequestBody::Attach {
                fid,
                afid,
                uname,
                aname,
            } => self.handle_attach(session, fid, afid, &uname, &aname),
            RequestBody::Walk {
                fid,
                newfid,
                wnames,
            } => self.handle_walk(session, fid, newfid, &wnames),
            RequestBody::Open { fid, mode } => self.handle_open(session, fid, mode),
            RequestBody::Create {
                fid,
                name,
                perm,
                mode,
            } => {
                let entry = session.fid(fid)?;
                let qid = self.fs.create(&entry.qid, &name, perm, mode)?;
                let iounit = session.iounit();
                Ok(ResponseBody::Create { qid, iounit })
            }
            RequestBody::Read { fid, offset, count } => {
                self.handle_read(session, fid, offset, count)
            }
            RequestBody::Write { fid, offset, data } => {
                let entry = session.fid(fid)?;
                match entry.open {
                    Some(mode) if mode.allows_write() => {}
                    _ => return Err("fid not open for writing".to_owned()),
                }
                let count = self.fs.write(&entry.qid, offset, &data)?;
                Ok(ResponseBody::Write { count })
            }
            RequestBody::Clunk { fid } => {
                let entry = session
                    .fids
                    .remove(&fid)
                    .ok_or_else(|| unknown_fid(fid))?;
                self.fs.clunk(&entry.qid);
                Ok(ResponseBody::Clunk)
            }
            RequestBody::Remove { fid } => {
                // Tremove clunks the fid whether or not the removal succeeds.
                let entry = session
                    .fids
                    .remove(&fid)
                    .ok_or_else(|| unknown_fid(fid))?;
                let result = self.fs.remove(&entry.qid);
                self.fs.clunk(&entry.qid);
                result.map(|()| ResponseBody::Remove)
            }
            RequestBody::Stat { fid } => {
                let entry = session.fid(fid)?;
                let stat = self.fs.stat(&entry.qid)?;
                Ok(ResponseBody::Stat { stat })
            }
            RequestBody::Wstat { fid, stat } => {
                let entry = session.fid(fid)?;
                self.fs.write_stat(&entry.qid, &stat)?;
                Ok(ResponseBody::Wstat)
            }
        }
    }

    fn handle_attach(
        &self,
        session: &mut Session,
        fid: u32,
        afid: u32,
        uname: &str,
        aname: &str,
    ) -> Result<ResponseBody> {
        if afid != NOFID {
            return Err("authentication not required".to_owned());
        }
        if session.fids.contains_key(&fid) {
            return Err(format!("fid {fid} already in use"));
        }
        let user = self
            .users
            .uname2user(uname)
            .ok_or_else(|| format!("unknown user {uname}"))?;
        let qid = self.fs.attach(user.as_ref(), aname)?;
        debug!("attach fid {fid} as {} to '{aname}'", user.name());
        session.fids.insert(
            fid,
            Fid {
                qid,
                user,
                open: None,
            },
        );
        Ok(ResponseBody::Attach { qid })
    }

    fn handle_walk(
        &self,
        session: &mut Session,
        fid: u32,
        newfid: u32,
        wnames: &[String],
    ) -> Result<ResponseBody> {
        let source = session.fid(fid)?.clone();
        if source.open.is_some() {
            return Err(format!("cannot walk from open fid {fid}"));
        }
        if newfid != fid && session.fids.contains_key(&newfid) {
            return Err(format!("fid {newfid} already in use"));
        }
        let mut current = source.qid;
        let mut qids = Vec::with_capacity(wnames.len());
        for name in wnames {
            let step = self.walk_step(source.user.as_ref(), &current, name);
            match step {
                Ok(qid) => {
                    qids.push(qid);
                    current = qid;
                }
                Err(err) if qids.is_empty() => return Err(err),
                // A partial walk reports how far it got and leaves newfid unbound.
                Err(_) => return Ok(ResponseBody::Walk { qids }),
            }
        }
        session.fids.insert(
            newfid,
            Fid {
                qid: current,
                user: source.user,
                open: None,
            },
        );
        Ok(ResponseBody::Walk { qids })
    }

    fn walk_step(&self, user: &dyn User, dir: &Qid, name: &str) -> Result<Qid> {
        if !dir.ty().is_directory() {
            return Err("not a directory".to_owned());
        }
        self.check_access(user, dir, 0o1)?;
        self.fs.walk(dir, name)
    }

    fn handle_open(&self, session: &mut Session, fid: u32, mode: OpenMode) -> Result<ResponseBody> {
        let entry = session.fid(fid)?.clone();
        if entry.open.is_some() {
            return Err(format!("fid {fid} already open"));
        }
        if entry.qid.ty().is_directory() && (mode.allows_write() || mode.allows_exec()) {
            return Err("is a directory".to_owned());
        }
        let mut want = 0;
        if mode.allows_read() {
            want |= 0o4;
        }
        if mode.allows_write() {
            want |= 0o2;
        }
        if mode.allows_exec() {
            want |= 0o1;
        }
        self.check_access(entry.user.as_ref(), &entry.qid, want)?;
        if mode.remove_on_close() {
            return Err(PERMISSION_DENIED.to_owned());
        }
        self.fs.open(&entry.qid, mode)?;
        if let Some(slot) = session.fids.get_mut(&fid) {
            slot.open = Some(mode);
        }
        Ok(ResponseBody::Open {
            qid: entry.qid,
            iounit: session.iounit(),
        })
    }

    fn handle_read(
        &self,
        session: &mut Session,
        fid: u32,
        offset: u64,
        count: u32,
    ) -> Result<ResponseBody> {
        let entry = session.fid(fid)?;
        match entry.open {
            Some(mode) if mode.allows_read() => {}
            _ => return Err("fid not open for reading".to_owned()),
        }
        let count = count.min(session.iounit());
        let data = if entry.qid.ty().is_directory() {
            let entries = self.fs.read_dir(&entry.qid)?;
            directory_slice(&entries, offset, count)?
        } else {
            let mut data = self.fs.read(&entry.qid, offset, count)?;
            data.truncate(count as usize);
            data
        };
        Ok(ResponseBody::Read { data })
    }

    fn check_access(&self, user: &dyn User, qid: &Qid, want: u32) -> Result<()> {
        let stat = self.fs.stat(qid)?;
        let group = self.users.gname2group(&stat.gid);
        if permits(user, &stat.uid, group.as_deref(), stat.mode, want) {
            Ok(())
        } else {
            Err(PERMISSION_DENIED.to_owned())
        }
    }
}

// Directory reads hand out whole entries only, starting at the first entry
// whose encoding begins at or after `offset`.
fn directory_slice(entries: &[Stat], offset: u64, count: u32) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut position = 0u64;
    for entry in entries {
        let encoded = encode_stat(entry).map_err(|err| err.to_string())?;
        let start = position;
        position += encoded.len() as u64;
        if start < offset {
            continue;
        }
        if out.len() + encoded.len() > count as usize {
            break;
        }
        out.extend_from_slice(&encoded);
    }
    Ok(out)
}

fn unknown_fid(fid: u32) -> String {
    format!("unknown fid {fid}")
}

#[derive(Clone)]
struct Fid {
    qid: Qid,
    user: Arc<dyn User>,
    open: Option<OpenMode>,
}

struct Session {
    msize: u32,
    version: Option<String>,
    fids: HashMap<u32, Fid>,
}

impl Session {
    fn new() -> Self {
        Self {
            msize: MAX_MSIZE,
            version: None,
            fids: HashMap::new(),
        }
    }

    fn negotiate(&mut self, requested: u32, version: &str) -> ResponseBody {
        // A new Tversion aborts all outstanding fids.
        self.fids.clear();
        let msize = requested.min(MAX_MSIZE);
        if msize <= IOHDRSZ || !version.starts_with(VERSION) {
            self.version = None;
            return ResponseBody::Version {
                msize,
                version: "unknown".to_owned(),
            };
        }
        self.msize = msize;
        self.version = Some(VERSION.to_owned());
        ResponseBody::Version {
            msize,
            version: VERSION.to_owned(),
        }
    }

    fn iounit(&self) -> u32 {
        self.msize - IOHDRSZ
    }

    fn fid(&self, fid: u32) -> Result<&Fid> {
        self.fids.get(&fid).ok_or_else(|| unknown_fid(fid))
    }
}
