// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Exercise the 9P2000 dispatcher end to end over a socket pair.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use timefs_9p::codec::{encode_request, read_frame};
use timefs_9p::{
    decode_response, Client, Group, NinepError, OpenMode, Qid, QidType, Request, RequestBody,
    ResponseBody, Serve9p, Server, Stat, User, Users, DMDIR, MAX_MSIZE,
};

const ROOT: u64 = 0;
const HELLO: u64 = 1;
const GREETING: &[u8] = b"hello, world\n";

#[derive(Debug)]
struct Glenda;

impl User for Glenda {
    fn name(&self) -> &str {
        "glenda"
    }
    fn id(&self) -> i32 {
        1
    }
    fn groups(&self) -> Vec<Arc<dyn Group>> {
        Vec::new()
    }
    fn is_member(&self, _group: &dyn Group) -> bool {
        false
    }
}

struct OneUser;

impl Users for OneUser {
    fn uid2user(&self, uid: i32) -> Option<Arc<dyn User>> {
        (uid == 1).then(|| Arc::new(Glenda) as Arc<dyn User>)
    }
    fn uname2user(&self, uname: &str) -> Option<Arc<dyn User>> {
        (uname == "glenda").then(|| Arc::new(Glenda) as Arc<dyn User>)
    }
    fn gid2group(&self, _gid: i32) -> Option<Arc<dyn Group>> {
        None
    }
    fn gname2group(&self, _gname: &str) -> Option<Arc<dyn Group>> {
        None
    }
}

struct HelloFs;

fn qid_for(path: u64) -> Qid {
    if path == ROOT {
        Qid::new(QidType::DIRECTORY, 0, ROOT)
    } else {
        Qid::new(QidType::FILE, 0, path)
    }
}

impl Serve9p for HelloFs {
    fn attach(&self, _user: &dyn User, _aname: &str) -> timefs_9p::Result<Qid> {
        Ok(qid_for(ROOT))
    }

    fn walk(&self, parent: &Qid, name: &str) -> timefs_9p::Result<Qid> {
        match (parent.path(), name) {
            (ROOT, "hello") => Ok(qid_for(HELLO)),
            (ROOT, "..") => Ok(qid_for(ROOT)),
            _ => Err("file does not exist".to_owned()),
        }
    }

    fn stat(&self, qid: &Qid) -> timefs_9p::Result<Stat> {
        let (name, mode) = if qid.path() == ROOT {
            ("/", DMDIR | 0o555)
        } else {
            ("hello", 0o444)
        };
        Ok(Stat {
            ty: 0,
            dev: 0,
            qid: qid_for(qid.path()),
            mode,
            atime: 0,
            mtime: 0,
            length: GREETING.len() as u64,
            name: name.to_owned(),
            uid: "glenda".to_owned(),
            gid: "glenda".to_owned(),
            muid: String::new(),
        })
    }

    fn read(&self, _qid: &Qid, offset: u64, count: u32) -> timefs_9p::Result<Vec<u8>> {
        let start = (offset as usize).min(GREETING.len());
        let end = (start + count as usize).min(GREETING.len());
        Ok(GREETING[start..end].to_vec())
    }

    fn read_dir(&self, _qid: &Qid) -> timefs_9p::Result<Vec<Stat>> {
        Ok(vec![self.stat(&qid_for(HELLO))?])
    }
}

fn connect() -> Client<UnixStream> {
    let (server_end, client_end) = UnixStream::pair().expect("socket pair");
    let server = Server::new(Arc::new(HelloFs), Arc::new(OneUser));
    server.spawn(server_end);
    Client::connect(client_end, "glenda").expect("version and attach")
}

#[test]
fn reads_a_file_through_walk_and_open() {
    let mut client = connect();
    let data = client.read_path("/hello", 0, 64).expect("read /hello");
    assert_eq!(data, GREETING);
    let tail = client.read_path("/hello", 7, 64).expect("read tail");
    assert_eq!(tail, b"world\n");
}

#[test]
fn directory_reads_return_stat_entries() {
    let mut client = connect();
    let entries = client.read_dir("/").expect("list root");
    let names: Vec<&str> = entries.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["hello"]);
}

#[test]
fn partial_walk_reports_prefix_and_leaves_newfid_unbound() {
    let mut client = connect();
    let fid = client.alloc_fid();
    let qids = client
        .walk(0, fid, &["hello", "deeper"])
        .expect("partial walk is not an error");
    assert_eq!(qids.len(), 1);
    assert!(matches!(client.stat(fid), Err(NinepError::Protocol(_))));
}

#[test]
fn missing_first_element_is_an_error() {
    let mut client = connect();
    let fid = client.alloc_fid();
    let err = client.walk(0, fid, &["missing"]).expect_err("walk fails");
    assert!(err.to_string().contains("does not exist"));
}

#[test]
fn write_open_on_read_only_file_is_denied() {
    let mut client = connect();
    let fid = client.alloc_fid();
    client.walk(0, fid, &["hello"]).expect("walk");
    let err = client.open(fid, OpenMode::WRITE).expect_err("open for write");
    assert!(err.to_string().contains("permission denied"));
}

#[test]
fn unknown_users_cannot_attach() {
    let (server_end, client_end) = UnixStream::pair().expect("socket pair");
    Server::new(Arc::new(HelloFs), Arc::new(OneUser)).spawn(server_end);
    let mut client = Client::new(client_end);
    client.version(MAX_MSIZE).expect("version");
    let err = client.attach(0, "bootes", "").expect_err("attach");
    assert!(err.to_string().contains("unknown user"));
}

#[test]
fn version_clamps_msize_and_rejects_foreign_dialects() {
    let (server_end, mut client_end) = UnixStream::pair().expect("socket pair");
    Server::new(Arc::new(HelloFs), Arc::new(OneUser)).spawn(server_end);

    let request = Request {
        tag: 0xffff,
        body: RequestBody::Version {
            msize: 65536,
            version: "9P2000.u".to_owned(),
        },
    };
    client_end
        .write_all(&encode_request(&request).expect("encode"))
        .expect("send");
    let frame = read_frame(&mut client_end, MAX_MSIZE)
        .expect("read")
        .expect("frame");
    let response = decode_response(&frame).expect("decode");
    assert_eq!(
        response.body,
        ResponseBody::Version {
            msize: MAX_MSIZE,
            version: "9P2000".to_owned(),
        }
    );

    let request = Request {
        tag: 0xffff,
        body: RequestBody::Version {
            msize: 4096,
            version: "styx".to_owned(),
        },
    };
    client_end
        .write_all(&encode_request(&request).expect("encode"))
        .expect("send");
    let frame = read_frame(&mut client_end, MAX_MSIZE)
        .expect("read")
        .expect("frame");
    let response = decode_response(&frame).expect("decode");
    assert!(matches!(
        response.body,
        ResponseBody::Version { ref version, .. } if version == "unknown"
    ));
}

#[test]
fn session_ends_cleanly_when_client_hangs_up() {
    let (server_end, client_end) = UnixStream::pair().expect("socket pair");
    let handle = Server::new(Arc::new(HelloFs), Arc::new(OneUser)).spawn(server_end);
    let client = Client::connect(client_end, "glenda").expect("connect");
    drop(client);
    handle
        .join()
        .expect("server thread")
        .expect("clean shutdown");
}
