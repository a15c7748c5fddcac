// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Expose a SynthTree to the 9P dispatcher.
// Author: Lukas Bower

use timefs_9p::{Qid, Serve9p, Stat, User};

use super::{FsError, NodeId, SynthTree};

impl SynthTree {
    fn resolve(&self, qid: &Qid) -> timefs_9p::Result<NodeId> {
        self.node_for_qid(qid).map_err(to_wire)
    }
}

fn to_wire(err: FsError) -> String {
    err.to_string()
}

impl Serve9p for SynthTree {
    fn attach(&self, _user: &dyn User, _aname: &str) -> timefs_9p::Result<Qid> {
        self.qid(self.root()).map_err(to_wire)
    }

    fn walk(&self, parent: &Qid, name: &str) -> timefs_9p::Result<Qid> {
        let dir = self.resolve(parent)?;
        let next = SynthTree::walk(self, dir, name).map_err(to_wire)?;
        self.qid(next).map_err(to_wire)
    }

    fn stat(&self, qid: &Qid) -> timefs_9p::Result<Stat> {
        let node = self.resolve(qid)?;
        SynthTree::stat(self, node).map_err(to_wire)
    }

    fn read(&self, qid: &Qid, offset: u64, count: u32) -> timefs_9p::Result<Vec<u8>> {
        let node = self.resolve(qid)?;
        let count = usize::try_from(count).unwrap_or(usize::MAX);
        SynthTree::read(self, node, offset, count).map_err(to_wire)
    }

    fn read_dir(&self, qid: &Qid) -> timefs_9p::Result<Vec<Stat>> {
        let dir = self.resolve(qid)?;
        self.children(dir)
            .map_err(to_wire)?
            .into_iter()
            .map(|child| SynthTree::stat(self, child).map_err(to_wire))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LeafBehavior;
    use crate::users::{NoneUsers, UserNone};
    use timefs_9p::DMDIR;

    fn clocks() -> SynthTree {
        let mut tree = SynthTree::new("/", NoneUsers::nobody(), None, DMDIR | 0o555);
        let root = tree.root();
        let clocks = [
            ("time", LeafBehavior::Bounded),
            ("inftime", LeafBehavior::Unbounded),
        ];
        for (name, behavior) in clocks {
            tree.add(root, name, NoneUsers::nobody(), None, 0o444, Some(behavior))
                .expect("add clock");
        }
        tree
    }

    #[test]
    fn attach_walk_and_read() {
        let tree = clocks();
        let root = Serve9p::attach(&tree, &UserNone, "").expect("attach");
        assert!(root.ty().is_directory());
        let time = Serve9p::walk(&tree, &root, "time").expect("walk time");
        let data = Serve9p::read(&tree, &time, 0, 8192).expect("read");
        assert_eq!(data.len(), 35);
        let up = Serve9p::walk(&tree, &time, "..").expect("walk up");
        assert_eq!(up, root);
    }

    #[test]
    fn missing_names_surface_as_wire_errors() {
        let tree = clocks();
        let root = Serve9p::attach(&tree, &UserNone, "").expect("attach");
        let err = Serve9p::walk(&tree, &root, "missing").expect_err("walk missing");
        assert_eq!(err, "/missing: file does not exist");
    }

    #[test]
    fn root_listing_names_both_clocks() {
        let tree = clocks();
        let root = Serve9p::attach(&tree, &UserNone, "").expect("attach");
        let names: Vec<String> = Serve9p::read_dir(&tree, &root)
            .expect("read dir")
            .into_iter()
            .map(|stat| stat.name)
            .collect();
        assert_eq!(names, ["time", "inftime"]);
    }
}
