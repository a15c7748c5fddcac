// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Drive the posted clock service end to end with a 9P client.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use serial_test::serial;
use tempfile::tempdir;
use timefs::bootstrap::{self, INFTIME_FILE, TIME_FILE};
use timefs::fs::leaf::TIMESTAMP_FORMAT;
use timefs::{ProcessSrv, SrvDir, SrvError};
use timefs_9p::codec::encode_request;
use timefs_9p::{Client, OpenMode, Request, RequestBody, DMDIR, MAX_MSIZE, NOFID, NOTAG};

fn parse(bytes: &[u8]) -> DateTime<FixedOffset> {
    let text = std::str::from_utf8(bytes).expect("utf-8 timestamp");
    DateTime::parse_from_str(text.trim_end_matches('\n'), TIMESTAMP_FORMAT)
        .unwrap_or_else(|err| panic!("unparseable timestamp {text:?}: {err}"))
}

fn client_for(name: &str) -> Client<UnixStream> {
    let stream = ProcessSrv::open(name).expect("open posted service");
    Client::connect(stream, "glenda").expect("version and attach")
}

#[test]
#[serial]
fn bounded_clock_reads_parse_and_advance() {
    let service = bootstrap::start("it-bounded", &ProcessSrv).expect("start");
    let mut client = client_for("it-bounded");

    let first = client.read_path("/time", 0, MAX_MSIZE).expect("first read");
    assert_eq!(first.len(), 35);
    thread::sleep(Duration::from_millis(5));
    let second = client.read_path("/time", 0, MAX_MSIZE).expect("second read");
    assert!(parse(&second) >= parse(&first));

    let past_end = client.read_path("/time", 35, MAX_MSIZE).expect("read past end");
    assert!(past_end.is_empty());
    let tail = client.read_path("/time", 20, MAX_MSIZE).expect("read tail");
    assert_eq!(tail.len(), 15);

    drop(client);
    service.shutdown().expect("shutdown");
}

#[test]
#[serial]
fn unbounded_clock_never_ends() {
    let service = bootstrap::start("it-unbounded", &ProcessSrv).expect("start");
    let mut client = client_for("it-unbounded");
    for offset in [0, 36, 1 << 40] {
        let line = client
            .read_path("/inftime", offset, MAX_MSIZE)
            .expect("read inftime");
        assert!(line.ends_with(b"\n"));
        parse(&line);
    }
    drop(client);
    service.shutdown().expect("shutdown");
}

#[test]
#[serial]
fn root_lists_both_clocks_owned_by_nobody() {
    let service = bootstrap::start("it-listing", &ProcessSrv).expect("start");
    let mut client = client_for("it-listing");
    let entries = client.read_dir("/").expect("list root");
    let names: Vec<&str> = entries.iter().map(|stat| stat.name.as_str()).collect();
    assert_eq!(names, [TIME_FILE, INFTIME_FILE]);
    for entry in &entries {
        assert_eq!(entry.mode, 0o444);
        assert_eq!(entry.uid, "nobody");
        assert_eq!(entry.gid, "nobody");
    }

    let root = client.stat(0).expect("stat root");
    assert_eq!(root.mode, DMDIR | 0o555);
    drop(client);
    service.shutdown().expect("shutdown");
}

#[test]
#[serial]
fn missing_files_and_writes_are_refused() {
    let service = bootstrap::start("it-refusals", &ProcessSrv).expect("start");
    let mut client = client_for("it-refusals");

    let err = client.read_path("/missing", 0, 64).expect_err("missing file");
    assert!(err.to_string().contains("does not exist"));

    let fid = client.alloc_fid();
    client.walk(0, fid, &["time"]).expect("walk time");
    let err = client.open(fid, OpenMode::WRITE).expect_err("open for write");
    assert!(err.to_string().contains("permission denied"));

    drop(client);
    service.shutdown().expect("shutdown");
}

#[test]
#[serial]
fn names_are_exclusive_and_released_on_shutdown() {
    let service = bootstrap::start("it-exclusive", &ProcessSrv).expect("start");
    assert_eq!(service.addr().to_string(), "/srv/it-exclusive");

    let err = bootstrap::start("it-exclusive", &ProcessSrv).expect_err("duplicate start");
    assert!(matches!(
        err.downcast_ref::<SrvError>(),
        Some(SrvError::NameTaken(_))
    ));

    service.shutdown().expect("shutdown");
    assert!(!ProcessSrv::is_posted("it-exclusive"));
    let again = bootstrap::start("it-exclusive", &ProcessSrv).expect("restart");
    again.shutdown().expect("shutdown");
}

#[test]
fn rendezvous_directory_serves_outside_clients() {
    let dir = tempdir().expect("tempdir");
    let srv = SrvDir::new(dir.path());
    let service = bootstrap::start("clock", &srv).expect("start");
    assert!(srv.path_for("clock").exists());

    let stream = srv.connect("clock").expect("connect");
    let mut client = Client::connect(stream, "nobody").expect("version and attach");
    let now = client.read_path("/time", 0, MAX_MSIZE).expect("read time");
    parse(&now);
    drop(client);

    service.shutdown().expect("shutdown");
    assert!(!srv.path_for("clock").exists());
    assert!(matches!(srv.connect("clock"), Err(SrvError::NotRegistered(_))));
}

#[test]
fn rendezvous_directory_accepts_clients_in_turn() {
    let dir = tempdir().expect("tempdir");
    let srv = SrvDir::new(dir.path());
    let service = bootstrap::start("turns", &srv).expect("start");

    for _ in 0..2 {
        let stream = srv.connect("turns").expect("connect");
        let mut client = Client::connect(stream, "nobody").expect("version and attach");
        let line = client
            .read_path("/inftime", 0, MAX_MSIZE)
            .expect("read inftime");
        assert!(line.ends_with(b"\n"));
    }

    service.shutdown().expect("shutdown");
}

#[test]
fn clients_hanging_up_mid_conversation_do_not_leak_replies() {
    let dir = tempdir().expect("tempdir");
    let srv = SrvDir::new(dir.path());
    let service = bootstrap::start("hangups", &srv).expect("start");

    for round in 0..50 {
        let mut quitter = srv.connect("hangups").expect("connect quitter");
        let version = Request {
            tag: NOTAG,
            body: RequestBody::Version {
                msize: MAX_MSIZE,
                version: "9P2000".to_owned(),
            },
        };
        let attach = Request {
            tag: 7,
            body: RequestBody::Attach {
                fid: 0,
                afid: NOFID,
                uname: "glenda".to_owned(),
                aname: String::new(),
            },
        };
        for request in [&version, &attach] {
            quitter
                .write_all(&encode_request(request).expect("encode"))
                .expect("send");
        }
        if round % 2 == 1 {
            // Leave half a frame behind as well.
            let clunk = encode_request(&Request {
                tag: 8,
                body: RequestBody::Clunk { fid: 0 },
            })
            .expect("encode");
            quitter.write_all(&clunk[..5]).expect("send partial");
        }
        drop(quitter);

        let stream = srv.connect("hangups").expect("connect");
        let mut client = Client::connect(stream, "nobody")
            .unwrap_or_else(|err| panic!("round {round}: {err}"));
        let now = client
            .read_path("/time", 0, MAX_MSIZE)
            .unwrap_or_else(|err| panic!("round {round}: {err}"));
        parse(&now);
    }

    service.shutdown().expect("shutdown");
}
