// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Minimal synchronous 9P2000 client used by tests and diagnostics.
// Author: Lukas Bower

//! Blocking client speaking one request at a time over a byte stream.

use std::fmt;
use std::io::{Read, Write};

use crate::codec::{decode_stats, read_frame, write_frame, Codec};
use crate::types::*;
use crate::NinepError;

/// Fid the client attaches to the tree root with.
pub const ROOT_FID: u32 = 0;

/// Client-side handle for a 9P2000 session.
pub struct Client<T> {
    stream: T,
    codec: Codec,
    next_tag: u16,
    next_fid: u32,
    msize: u32,
}

impl<T> fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("next_tag", &self.next_tag)
            .field("next_fid", &self.next_fid)
            .field("msize", &self.msize)
            .finish_non_exhaustive()
    }
}

impl<T: Read + Write> Client<T> {
    /// Wrap a connected stream. No messages are exchanged yet.
    pub fn new(stream: T) -> Self {
        Self {
            stream,
            codec: Codec,
            next_tag: 1,
            next_fid: ROOT_FID + 1,
            msize: MAX_MSIZE,
        }
    }

    /// Negotiate the protocol version, then attach [`ROOT_FID`] as `uname`.
    pub fn connect(stream: T, uname: &str) -> Result<Self, NinepError> {
        let mut client = Self::new(stream);
        client.version(MAX_MSIZE)?;
        client.attach(ROOT_FID, uname, "")?;
        Ok(client)
    }

    /// Recover the underlying stream.
    pub fn into_inner(self) -> T {
        self.stream
    }

    fn next_tag(&mut self) -> u16 {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);
        if self.next_tag == NOTAG {
            self.next_tag = 1;
        }
        tag
    }

    /// Allocate a fid number not yet handed out by this client.
    pub fn alloc_fid(&mut self) -> u32 {
        let fid = self.next_fid;
        self.next_fid = self.next_fid.wrapping_add(1);
        fid
    }

    fn transact_tagged(
        &mut self,
        tag: u16,
        body: RequestBody,
    ) -> Result<ResponseBody, NinepError> {
        let request = Request { tag, body };
        let encoded = self.codec.encode_request(&request)?;
        write_frame(&mut self.stream, &encoded)?;
        let frame = read_frame(&mut self.stream, self.msize)?.ok_or_else(|| {
            NinepError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            ))
        })?;
        let response = self.codec.decode_response(&frame)?;
        if response.tag != tag {
            return Err(NinepError::Protocol(format!(
                "response tag {} does not match request tag {tag}",
                response.tag
            )));
        }
        match response.body {
            ResponseBody::Error { ename } => Err(NinepError::Protocol(ename)),
            other => Ok(other),
        }
    }

    fn transact(&mut self, body: RequestBody) -> Result<ResponseBody, NinepError> {
        let tag = self.next_tag();
        self.transact_tagged(tag, body)
    }

    /// Negotiate the protocol version and maximum message size.
    pub fn version(&mut self, requested_msize: u32) -> Result<u32, NinepError> {
        let response = self.transact_tagged(
            NOTAG,
            RequestBody::Version {
                msize: requested_msize,
                version: VERSION.to_owned(),
            },
        )?;
        let ResponseBody::Version { msize, version } = response else {
            return Err(unexpected("Rversion"));
        };
        if version != VERSION {
            return Err(NinepError::Protocol(format!("unexpected version {version}")));
        }
        self.msize = msize;
        Ok(msize)
    }

    /// Attach `fid` to the root of the tree named `aname`.
    pub fn attach(&mut self, fid: u32, uname: &str, aname: &str) -> Result<Qid, NinepError> {
        let response = self.transact(RequestBody::Attach {
            fid,
            afid: NOFID,
            uname: uname.to_owned(),
            aname: aname.to_owned(),
        })?;
        let ResponseBody::Attach { qid } = response else {
            return Err(unexpected("Rattach"));
        };
        Ok(qid)
    }

    /// Walk from `fid` to `newfid` following the supplied path components.
    pub fn walk(
        &mut self,
        fid: u32,
        newfid: u32,
        path: &[&str],
    ) -> Result<Vec<Qid>, NinepError> {
        let response = self.transact(RequestBody::Walk {
            fid,
            newfid,
            wnames: path.iter().map(|name| (*name).to_owned()).collect(),
        })?;
        let ResponseBody::Walk { qids } = response else {
            return Err(unexpected("Rwalk"));
        };
        Ok(qids)
    }

    /// Open a fid with the specified mode.
    pub fn open(&mut self, fid: u32, mode: OpenMode) -> Result<(Qid, u32), NinepError> {
        let response = self.transact(RequestBody::Open { fid, mode })?;
        let ResponseBody::Open { qid, iounit } = response else {
            return Err(unexpected("Ropen"));
        };
        Ok((qid, iounit))
    }

    /// Read bytes from an opened fid.
    pub fn read(&mut self, fid: u32, offset: u64, count: u32) -> Result<Vec<u8>, NinepError> {
        let response = self.transact(RequestBody::Read { fid, offset, count })?;
        let ResponseBody::Read { data } = response else {
            return Err(unexpected("Rread"));
        };
        Ok(data)
    }

    /// Write bytes to an opened fid.
    pub fn write(&mut self, fid: u32, offset: u64, data: &[u8]) -> Result<u32, NinepError> {
        let response = self.transact(RequestBody::Write {
            fid,
            offset,
            data: data.to_vec(),
        })?;
        let ResponseBody::Write { count } = response else {
            return Err(unexpected("Rwrite"));
        };
        Ok(count)
    }

    /// Describe the file bound to `fid`.
    pub fn stat(&mut self, fid: u32) -> Result<Stat, NinepError> {
        let response = self.transact(RequestBody::Stat { fid })?;
        let ResponseBody::Stat { stat } = response else {
            return Err(unexpected("Rstat"));
        };
        Ok(stat)
    }

    /// Release a fid.
    pub fn clunk(&mut self, fid: u32) -> Result<(), NinepError> {
        let response = self.transact(RequestBody::Clunk { fid })?;
        let ResponseBody::Clunk = response else {
            return Err(unexpected("Rclunk"));
        };
        Ok(())
    }

    /// Walk to `path` from the root, open it for reading, read once and clunk.
    pub fn read_path(
        &mut self,
        path: &str,
        offset: u64,
        count: u32,
    ) -> Result<Vec<u8>, NinepError> {
        let fid = self.walk_open(path)?;
        let result = self.read(fid, offset, count);
        self.clunk(fid)?;
        result
    }

    /// List the entries of the directory at `path`.
    pub fn read_dir(&mut self, path: &str) -> Result<Vec<Stat>, NinepError> {
        let fid = self.walk_open(path)?;
        let mut stats = Vec::new();
        let mut offset = 0u64;
        let chunk_size = self.msize - IOHDRSZ;
        let result = loop {
            match self.read(fid, offset, chunk_size) {
                Ok(chunk) if chunk.is_empty() => break Ok(()),
                Ok(chunk) => {
                    offset += chunk.len() as u64;
                    match decode_stats(&chunk) {
                        Ok(mut batch) => stats.append(&mut batch),
                        Err(err) => break Err(NinepError::from(err)),
                    }
                }
                Err(err) => break Err(err),
            }
        };
        self.clunk(fid)?;
        result.map(|()| stats)
    }

    fn walk_open(&mut self, path: &str) -> Result<u32, NinepError> {
        let names: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
        let fid = self.alloc_fid();
        let qids = self.walk(ROOT_FID, fid, &names)?;
        if qids.len() != names.len() {
            return Err(NinepError::Protocol(format!("{path}: file does not exist")));
        }
        if let Err(err) = self.open(fid, OpenMode::READ) {
            self.clunk(fid)?;
            return Err(err);
        }
        Ok(fid)
    }
}

fn unexpected(expected: &str) -> NinepError {
    NinepError::Protocol(format!("expected {expected}"))
}
