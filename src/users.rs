// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Identity provider that answers every question with "nobody".
// Author: Lukas Bower

//! Identity stub.
//!
//! Every uid, user name, gid and group name resolves to the same synthetic
//! `nobody` user or group, and membership checks always succeed. No access
//! control is performed; permission bits on the tree are the only gate.

use std::sync::Arc;

use timefs_9p::{Group, User, Users};

/// Name shared by the synthetic user and group.
pub const NOBODY: &str = "nobody";

/// Numeric id reported for the synthetic identities.
pub const NOBODY_ID: i32 = -1;

/// The synthetic user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserNone;

/// The synthetic group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupNone;

/// Identity provider resolving everything to [`UserNone`] and [`GroupNone`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NoneUsers;

impl NoneUsers {
    /// The `nobody` user as a shareable trait object.
    #[must_use]
    pub fn nobody() -> Arc<dyn User> {
        Arc::new(UserNone)
    }

    /// The `nobody` group as a shareable trait object.
    #[must_use]
    pub fn nobody_group() -> Arc<dyn Group> {
        Arc::new(GroupNone)
    }
}

impl User for UserNone {
    fn name(&self) -> &str {
        NOBODY
    }

    fn id(&self) -> i32 {
        NOBODY_ID
    }

    fn groups(&self) -> Vec<Arc<dyn Group>> {
        vec![NoneUsers::nobody_group()]
    }

    fn is_member(&self, _group: &dyn Group) -> bool {
        true
    }
}

impl Group for GroupNone {
    fn name(&self) -> &str {
        NOBODY
    }

    fn id(&self) -> i32 {
        NOBODY_ID
    }

    fn members(&self) -> Vec<Arc<dyn User>> {
        vec![NoneUsers::nobody()]
    }
}

impl Users for NoneUsers {
    fn uid2user(&self, _uid: i32) -> Option<Arc<dyn User>> {
        Some(Self::nobody())
    }

    fn uname2user(&self, _uname: &str) -> Option<Arc<dyn User>> {
        Some(Self::nobody())
    }

    fn gid2group(&self, _gid: i32) -> Option<Arc<dyn Group>> {
        Some(Self::nobody_group())
    }

    fn gname2group(&self, _gname: &str) -> Option<Arc<dyn Group>> {
        Some(Self::nobody_group())
    }
}
