// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Encode and decode 9P2000 wire messages and frame them on byte streams.
// Author: Lukas Bower

//! Encode/decode helpers for 9P2000 wire messages.

use std::io::{self, Read, Write};
use std::str;

use crate::types::*;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageType {
    Tversion = 100,
    Rversion = 101,
    Tauth = 102,
    Rauth = 103,
    Tattach = 104,
    Rattach = 105,
    Rerror = 107,
    Tflush = 108,
    Rflush = 109,
    Twalk = 110,
    Rwalk = 111,
    Topen = 112,
    Ropen = 113,
    Tcreate = 114,
    Rcreate = 115,
    Tread = 116,
    Rread = 117,
    Twrite = 118,
    Rwrite = 119,
    Tclunk = 120,
    Rclunk = 121,
    Tremove = 122,
    Rremove = 123,
    Tstat = 124,
    Rstat = 125,
    Twstat = 126,
    Rwstat = 127,
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MessageType::*;
        Ok(match value {
            100 => Tversion,
            101 => Rversion,
            102 => Tauth,
            103 => Rauth,
            104 => Tattach,
            105 => Rattach,
            107 => Rerror,
            108 => Tflush,
            109 => Rflush,
            110 => Twalk,
            111 => Rwalk,
            112 => Topen,
            113 => Ropen,
            114 => Tcreate,
            115 => Rcreate,
            116 => Tread,
            117 => Rread,
            118 => Twrite,
            119 => Rwrite,
            120 => Tclunk,
            121 => Rclunk,
            122 => Tremove,
            123 => Rremove,
            124 => Tstat,
            125 => Rstat,
            126 => Twstat,
            127 => Rwstat,
            other => return Err(CodecError::Unsupported(other)),
        })
    }
}

/// Stateless 9P2000 encoder/decoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec;

impl Codec {
    /// Encode a request into its wire representation.
    pub fn encode_request(&self, request: &Request) -> Result<Vec<u8>, CodecError> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&request.tag.to_le_bytes());
        let ty = match &request.body {
            RequestBody::Version { msize, version } => {
                payload.extend_from_slice(&msize.to_le_bytes());
                put_string(&mut payload, version)?;
                MessageType::Tversion
            }
            RequestBody::Auth { afid, uname, aname } => {
                payload.extend_from_slice(&afid.to_le_bytes());
                put_string(&mut payload, uname)?;
                put_string(&mut payload, aname)?;
                MessageType::Tauth
            }
            RequestBody::Flush { oldtag } => {
                payload.extend_from_slice(&oldtag.to_le_bytes());
                MessageType::Tflush
            }
            RequestBody::Attach {
                fid,
                afid,
                uname,
                aname,
            } => {
                payload.extend_from_slice(&fid.to_le_bytes());
                payload.extend_from_slice(&afid.to_le_bytes());
                put_string(&mut payload, uname)?;
                put_string(&mut payload, aname)?;
                MessageType::Tattach
            }
            RequestBody::Walk {
                fid,
                newfid,
                wnames,
            } => {
                payload.extend_from_slice(&fid.to_le_bytes());
                payload.extend_from_slice(&newfid.to_le_bytes());
                if wnames.len() > MAX_WELEM {
                    return Err(CodecError::InvalidPath);
                }
                payload.extend_from_slice(&(wnames.len() as u16).to_le_bytes());
                for name in wnames {
                    validate_component(name)?;
                    put_string(&mut payload, name)?;
                }
                MessageType::Twalk
            }
            RequestBody::Open { fid, mode } => {
                payload.extend_from_slice(&fid.to_le_bytes());
                payload.push(mode.bits());
                MessageType::Topen
            }
            RequestBody::Create {
                fid,
                name,
                perm,
                mode,
            } => {
                payload.extend_from_slice(&fid.to_le_bytes());
                put_string(&mut payload, name)?;
                payload.extend_from_slice(&perm.to_le_bytes());
                payload.push(mode.bits());
                MessageType::Tcreate
            }
            RequestBody::Read { fid, offset, count } => {
                payload.extend_from_slice(&fid.to_le_bytes());
                payload.extend_from_slice(&offset.to_le_bytes());
                payload.extend_from_slice(&count.to_le_bytes());
                MessageType::Tread
            }
            RequestBody::Write { fid, offset, data } => {
                payload.extend_from_slice(&fid.to_le_bytes());
                payload.extend_from_slice(&offset.to_le_bytes());
                put_data(&mut payload, data)?;
                MessageType::Twrite
            }
            RequestBody::Clunk { fid } => {
                payload.extend_from_slice(&fid.to_le_bytes());
                MessageType::Tclunk
            }
            RequestBody::Remove { fid } => {
                payload.extend_from_slice(&fid.to_le_bytes());
                MessageType::Tremove
            }
            RequestBody::Stat { fid } => {
                payload.extend_from_slice(&fid.to_le_bytes());
                MessageType::Tstat
            }
            RequestBody::Wstat { fid, stat } => {
                payload.extend_from_slice(&fid.to_le_bytes());
                put_stat_field(&mut payload, stat)?;
                MessageType::Twstat
            }
        };
        finish(ty, &payload)
    }

    /// Encode a response into its wire representation.
    pub fn encode_response(&self, response: &Response) -> Result<Vec<u8>, CodecError> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&response.tag.to_le_bytes());
        let ty = match &response.body {
            ResponseBody::Version { msize, version } => {
                payload.extend_from_slice(&msize.to_le_bytes());
                put_string(&mut payload, version)?;
                MessageType::Rversion
            }
            ResponseBody::Auth { aqid } => {
                put_qid(&mut payload, aqid);
                MessageType::Rauth
            }
            ResponseBody::Error { ename } => {
                put_string(&mut payload, ename)?;
                MessageType::Rerror
            }
            ResponseBody::Flush => MessageType::Rflush,
            ResponseBody::Attach { qid } => {
                put_qid(&mut payload, qid);
                MessageType::Rattach
            }
            ResponseBody::Walk { qids } => {
                if qids.len() > MAX_WELEM {
                    return Err(CodecError::InvalidPath);
                }
                payload.extend_from_slice(&(qids.len() as u16).to_le_bytes());
                for qid in qids {
                    put_qid(&mut payload, qid);
                }
                MessageType::Rwalk
            }
            ResponseBody::Open { qid, iounit } => {
                put_qid(&mut payload, qid);
                payload.extend_from_slice(&iounit.to_le_bytes());
                MessageType::Ropen
            }
            ResponseBody::Create { qid, iounit } => {
                put_qid(&mut payload, qid);
                payload.extend_from_slice(&iounit.to_le_bytes());
                MessageType::Rcreate
            }
            ResponseBody::Read { data } => {
                put_data(&mut payload, data)?;
                MessageType::Rread
            }
            ResponseBody::Write { count } => {
                payload.extend_from_slice(&count.to_le_bytes());
                MessageType::Rwrite
            }
            ResponseBody::Clunk => MessageType::Rclunk,
            ResponseBody::Remove => MessageType::Rremove,
            ResponseBody::Stat { stat } => {
                put_stat_field(&mut payload, stat)?;
                MessageType::Rstat
            }
            ResponseBody::Wstat => MessageType::Rwstat,
        };
        finish(ty, &payload)
    }

    /// Decode a request from the wire representation.
    pub fn decode_request(&self, bytes: &[u8]) -> Result<Request, CodecError> {
        let (ty, payload) = decode_message(bytes)?;
        let mut cursor = Cursor::new(payload);
        let tag = cursor.u16()?;
        let body = match ty {
            MessageType::Tversion => RequestBody::Version {
                msize: cursor.u32()?,
                version: cursor.string()?,
            },
            MessageType::Tauth => RequestBody::Auth {
                afid: cursor.u32()?,
                uname: cursor.string()?,
                aname: cursor.string()?,
            },
            MessageType::Tflush => RequestBody::Flush {
                oldtag: cursor.u16()?,
            },
            MessageType::Tattach => RequestBody::Attach {
                fid: cursor.u32()?,
                afid: cursor.u32()?,
                uname: cursor.string()?,
                aname: cursor.string()?,
            },
            MessageType::Twalk => {
                let fid = cursor.u32()?;
                let newfid = cursor.u32()?;
                let nwname = cursor.u16()? as usize;
                if nwname > MAX_WELEM {
                    return Err(CodecError::InvalidPath);
                }
                let mut wnames = Vec::with_capacity(nwname);
                for _ in 0..nwname {
                    let name = cursor.string()?;
                    validate_component(&name)?;
                    wnames.push(name);
                }
                RequestBody::Walk {
                    fid,
                    newfid,
                    wnames,
                }
            }
            MessageType::Topen => RequestBody::Open {
                fid: cursor.u32()?,
                mode: OpenMode::from_bits(cursor.u8()?),
            },
            MessageType::Tcreate => RequestBody::Create {
                fid: cursor.u32()?,
                name: cursor.string()?,
                perm: cursor.u32()?,
                mode: OpenMode::from_bits(cursor.u8()?),
            },
            MessageType::Tread => RequestBody::Read {
                fid: cursor.u32()?,
                offset: cursor.u64()?,
                count: cursor.u32()?,
            },
            MessageType::Twrite => RequestBody::Write {
                fid: cursor.u32()?,
                offset: cursor.u64()?,
                data: cursor.data()?,
            },
            MessageType::Tclunk => RequestBody::Clunk { fid: cursor.u32()? },
            MessageType::Tremove => RequestBody::Remove { fid: cursor.u32()? },
            MessageType::Tstat => RequestBody::Stat { fid: cursor.u32()? },
            MessageType::Twstat => {
                let fid = cursor.u32()?;
                let _n = cursor.u16()?;
                RequestBody::Wstat {
                    fid,
                    stat: cursor.stat()?,
                }
            }
            other => return Err(CodecError::Unsupported(other as u8)),
        };
        Ok(Request { tag, body })
    }

    /// Decode a response from the wire representation.
    pub fn decode_response(&self, bytes: &[u8]) -> Result<Response, CodecError> {
        let (ty, payload) = decode_message(bytes)?;
        let mut cursor = Cursor::new(payload);
        let tag = cursor.u16()?;
        let body = match ty {
            MessageType::Rversion => ResponseBody::Version {
                msize: cursor.u32()?,
                version: cursor.string()?,
            },
            MessageType::Rauth => ResponseBody::Auth {
                aqid: cursor.qid()?,
            },
            MessageType::Rerror => ResponseBody::Error {
                ename: cursor.string()?,
            },
            MessageType::Rflush => ResponseBody::Flush,
            MessageType::Rattach => ResponseBody::Attach { qid: cursor.qid()? },
            MessageType::Rwalk => {
                let count = cursor.u16()? as usize;
                if count > MAX_WELEM {
                    return Err(CodecError::InvalidPath);
                }
                let mut qids = Vec::with_capacity(count);
                for _ in 0..count {
                    qids.push(cursor.qid()?);
                }
                ResponseBody::Walk { qids }
            }
            MessageType::Ropen => ResponseBody::Open {
                qid: cursor.qid()?,
                iounit: cursor.u32()?,
            },
            MessageType::Rcreate => ResponseBody::Create {
                qid: cursor.qid()?,
                iounit: cursor.u32()?,
            },
            MessageType::Rread => ResponseBody::Read {
                data: cursor.data()?,
            },
            MessageType::Rwrite => ResponseBody::Write {
                count: cursor.u32()?,
            },
            MessageType::Rclunk => ResponseBody::Clunk,
            MessageType::Rremove => ResponseBody::Remove,
            MessageType::Rstat => {
                let _n = cursor.u16()?;
                ResponseBody::Stat {
                    stat: cursor.stat()?,
                }
            }
            MessageType::Rwstat => ResponseBody::Wstat,
            other => return Err(CodecError::Unsupported(other as u8)),
        };
        Ok(Response { tag, body })
    }
}

/// Encode a request using the default codec.
pub fn encode_request(req: &Request) -> Result<Vec<u8>, CodecError> {
    Codec.encode_request(req)
}

/// Encode a response using the default codec.
pub fn encode_response(res: &Response) -> Result<Vec<u8>, CodecError> {
    Codec.encode_response(res)
}

/// Decode a request using the default codec.
pub fn decode_request(bytes: &[u8]) -> Result<Request, CodecError> {
    Codec.decode_request(bytes)
}

/// Decode a response using the default codec.
pub fn decode_response(bytes: &[u8]) -> Result<Response, CodecError> {
    Codec.decode_response(bytes)
}

/// Serialise a directory entry in the `stat[n]` layout used by directory reads.
pub fn encode_stat(stat: &Stat) -> Result<Vec<u8>, CodecError> {
    let mut body = Vec::with_capacity(64);
    body.extend_from_slice(&stat.ty.to_le_bytes());
    body.extend_from_slice(&stat.dev.to_le_bytes());
    put_qid(&mut body, &stat.qid);
    body.extend_from_slice(&stat.mode.to_le_bytes());
    body.extend_from_slice(&stat.atime.to_le_bytes());
    body.extend_from_slice(&stat.mtime.to_le_bytes());
    body.extend_from_slice(&stat.length.to_le_bytes());
    put_string(&mut body, &stat.name)?;
    put_string(&mut body, &stat.uid)?;
    put_string(&mut body, &stat.gid)?;
    put_string(&mut body, &stat.muid)?;
    let size: u16 = body
        .len()
        .try_into()
        .map_err(|_| CodecError::StringTooLong(body.len()))?;
    let mut out = Vec::with_capacity(body.len() + 2);
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Parse a sequence of directory entries as returned by a directory read.
pub fn decode_stats(bytes: &[u8]) -> Result<Vec<Stat>, CodecError> {
    let mut cursor = Cursor::new(bytes);
    let mut stats = Vec::new();
    while !cursor.is_empty() {
        stats.push(cursor.stat()?);
    }
    Ok(stats)
}

/// Read one size-prefixed frame from `reader`.
///
/// Returns `Ok(None)` on a clean end of stream before the first size byte.
pub fn read_frame<R: Read>(reader: &mut R, msize: u32) -> io::Result<Option<Vec<u8>>> {
    let mut size_buf = [0u8; 4];
    let mut filled = 0;
    while filled < size_buf.len() {
        match reader.read(&mut size_buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    let size = u32::from_le_bytes(size_buf);
    if size < 7 || size > msize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            CodecError::TooBig { size, msize },
        ));
    }
    let mut frame = vec![0u8; size as usize];
    frame[..4].copy_from_slice(&size_buf);
    reader.read_exact(&mut frame[4..])?;
    Ok(Some(frame))
}

/// Write one encoded frame to `writer` and flush it.
pub fn write_frame<W: Write>(writer: &mut W, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame)?;
    writer.flush()
}

fn finish(ty: MessageType, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let size = payload.len() + 5;
    let declared: u32 = size.try_into().map_err(|_| CodecError::LengthMismatch {
        declared: u32::MAX,
        actual: size,
    })?;
    let mut buffer = Vec::with_capacity(size);
    buffer.extend_from_slice(&declared.to_le_bytes());
    buffer.push(ty as u8);
    buffer.extend_from_slice(payload);
    Ok(buffer)
}

fn decode_message(bytes: &[u8]) -> Result<(MessageType, &[u8]), CodecError> {
    if bytes.len() < 7 {
        return Err(CodecError::Truncated);
    }
    let declared = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if declared as usize != bytes.len() {
        return Err(CodecError::LengthMismatch {
            declared,
            actual: bytes.len(),
        });
    }
    let ty = MessageType::try_from(bytes[4])?;
    Ok((ty, &bytes[5..]))
}

fn validate_component(component: &str) -> Result<(), CodecError> {
    if component.is_empty() || component.contains('/') {
        return Err(CodecError::InvalidPath);
    }
    Ok(())
}

fn put_qid(buffer: &mut Vec<u8>, qid: &Qid) {
    buffer.push(qid.ty().into());
    buffer.extend_from_slice(&qid.version().to_le_bytes());
    buffer.extend_from_slice(&qid.path().to_le_bytes());
}

fn put_string(buffer: &mut Vec<u8>, value: &str) -> Result<(), CodecError> {
    let len: u16 = value
        .len()
        .try_into()
        .map_err(|_| CodecError::StringTooLong(value.len()))?;
    buffer.extend_from_slice(&len.to_le_bytes());
    buffer.extend_from_slice(value.as_bytes());
    Ok(())
}

fn put_data(buffer: &mut Vec<u8>, data: &[u8]) -> Result<(), CodecError> {
    let count: u32 = data
        .len()
        .try_into()
        .map_err(|_| CodecError::LengthMismatch {
            declared: u32::MAX,
            actual: data.len(),
        })?;
    buffer.extend_from_slice(&count.to_le_bytes());
    buffer.extend_from_slice(data);
    Ok(())
}

// Rstat and Twstat wrap the stat in a second length prefix.
fn put_stat_field(buffer: &mut Vec<u8>, stat: &Stat) -> Result<(), CodecError> {
    let encoded = encode_stat(stat)?;
    let n: u16 = encoded
        .len()
        .try_into()
        .map_err(|_| CodecError::StringTooLong(encoded.len()))?;
    buffer.extend_from_slice(&n.to_le_bytes());
    buffer.extend_from_slice(&encoded);
    Ok(())
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(len).ok_or(CodecError::Truncated)?;
        if end > self.buf.len() {
            return Err(CodecError::Truncated);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    fn data(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn qid(&mut self) -> Result<Qid, CodecError> {
        let ty = QidType::from_raw(self.u8()?);
        let version = self.u32()?;
        let path = self.u64()?;
        Ok(Qid::new(ty, version, path))
    }

    fn stat(&mut self) -> Result<Stat, CodecError> {
        let size = self.u16()? as usize;
        let body = self.take(size)?;
        let mut inner = Cursor::new(body);
        Ok(Stat {
            ty: inner.u16()?,
            dev: inner.u32()?,
            qid: inner.qid()?,
            mode: inner.u32()?,
            atime: inner.u32()?,
            mtime: inner.u32()?,
            length: inner.u64()?,
            name: inner.string()?,
            uid: inner.string()?,
            gid: inner.string()?,
            muid: inner.string()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stat() -> Stat {
        Stat {
            ty: 0,
            dev: 0,
            qid: Qid::new(QidType::FILE, 0, 7),
            mode: 0o444,
            atime: 1,
            mtime: 2,
            length: 0,
            name: "time".to_owned(),
            uid: "nobody".to_owned(),
            gid: "nobody".to_owned(),
            muid: String::new(),
        }
    }

    #[test]
    fn version_frame_matches_reference_bytes() {
        let req = Request {
            tag: NOTAG,
            body: RequestBody::Version {
                msize: 8192,
                version: VERSION.to_owned(),
            },
        };
        let frame = encode_request(&req).expect("encode");
        let expected: &[u8] = &[
            19, 0, 0, 0, 100, 0xff, 0xff, 0x00, 0x20, 0, 0, 6, 0, b'9', b'P', b'2', b'0', b'0',
            b'0',
        ];
        assert_eq!(frame, expected);
    }

    #[test]
    fn reject_walks_beyond_element_limit() {
        let req = Request {
            tag: 1,
            body: RequestBody::Walk {
                fid: 1,
                newfid: 2,
                wnames: vec!["a".to_owned(); MAX_WELEM + 1],
            },
        };
        assert_eq!(encode_request(&req), Err(CodecError::InvalidPath));
    }

    #[test]
    fn reject_slash_in_walk_component() {
        let req = Request {
            tag: 1,
            body: RequestBody::Walk {
                fid: 1,
                newfid: 2,
                wnames: vec!["a/b".to_owned()],
            },
        };
        assert_eq!(encode_request(&req), Err(CodecError::InvalidPath));
    }

    #[test]
    fn detect_truncated_frames() {
        let req = Request {
            tag: 1,
            body: RequestBody::Read {
                fid: 1,
                offset: 0,
                count: 10,
            },
        };
        let mut frame = encode_request(&req).expect("encode");
        frame.truncate(frame.len() - 2);
        let len = frame.len() as u32;
        frame[..4].copy_from_slice(&len.to_le_bytes());
        assert_eq!(decode_request(&frame), Err(CodecError::Truncated));
    }

    #[test]
    fn detect_length_mismatch() {
        let req = Request {
            tag: 1,
            body: RequestBody::Clunk { fid: 3 },
        };
        let mut frame = encode_request(&req).expect("encode");
        frame.push(0);
        assert!(matches!(
            decode_request(&frame),
            Err(CodecError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn stat_response_carries_double_length_prefix() {
        let res = Response {
            tag: 4,
            body: ResponseBody::Stat {
                stat: sample_stat(),
            },
        };
        let frame = encode_response(&res).expect("encode");
        let n = u16::from_le_bytes([frame[7], frame[8]]) as usize;
        let size = u16::from_le_bytes([frame[9], frame[10]]) as usize;
        assert_eq!(n, size + 2);
        assert_eq!(frame.len(), 9 + n);
        assert_eq!(decode_response(&frame).expect("decode"), res);
    }

    #[test]
    fn directory_listing_decodes_back_to_entries() {
        let mut listing = encode_stat(&sample_stat()).expect("encode");
        let mut other = sample_stat();
        other.name = "inftime".to_owned();
        listing.extend(encode_stat(&other).expect("encode"));
        let stats = decode_stats(&listing).expect("decode");
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[1].name, "inftime");
    }

    #[test]
    fn read_frame_reports_clean_eof() {
        let mut empty: &[u8] = &[];
        assert!(read_frame(&mut empty, MAX_MSIZE).expect("eof").is_none());
    }

    #[test]
    fn read_frame_rejects_oversized_frames() {
        let mut data: &[u8] = &[0xff, 0xff, 0, 0, 100];
        let err = read_frame(&mut data, MAX_MSIZE).expect_err("oversized");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
