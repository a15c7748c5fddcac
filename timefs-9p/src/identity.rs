// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Identity interfaces consulted by file trees and the 9P dispatcher.
// Author: Lukas Bower

//! Users and groups as seen by the dispatcher.
//!
//! The server resolves the `uname` of every attach through a [`Users`]
//! provider and checks open modes against the permission bits of the file
//! using the resolved [`User`]. Providers must never block.

use std::fmt;
use std::sync::Arc;

/// A user known to an identity provider.
pub trait User: fmt::Debug + Send + Sync {
    /// Login name.
    fn name(&self) -> &str;
    /// Numeric identifier, `-1` when the provider has none.
    fn id(&self) -> i32;
    /// Groups the user belongs to.
    fn groups(&self) -> Vec<Arc<dyn Group>>;
    /// Check membership of `group`.
    fn is_member(&self, group: &dyn Group) -> bool;
}

/// A group known to an identity provider.
pub trait Group: fmt::Debug + Send + Sync {
    /// Group name.
    fn name(&self) -> &str;
    /// Numeric identifier, `-1` when the provider has none.
    fn id(&self) -> i32;
    /// Members of the group.
    fn members(&self) -> Vec<Arc<dyn User>>;
}

/// Identity provider mapping ids and names to users and groups.
pub trait Users: Send + Sync {
    /// Resolve a numeric user id.
    fn uid2user(&self, uid: i32) -> Option<Arc<dyn User>>;
    /// Resolve a user name.
    fn uname2user(&self, uname: &str) -> Option<Arc<dyn User>>;
    /// Resolve a numeric group id.
    fn gid2group(&self, gid: i32) -> Option<Arc<dyn Group>>;
    /// Resolve a group name.
    fn gname2group(&self, gname: &str) -> Option<Arc<dyn Group>>;
}

/// Classic owner/group/other permission check for `want` (an `rwx` triple).
///
/// `perm` is the full file mode; only its low nine bits are consulted.
#[must_use]
pub fn permits(
    user: &dyn User,
    owner: &str,
    group: Option<&dyn Group>,
    perm: u32,
    want: u32,
) -> bool {
    let want = want & 0o7;
    if perm & want == want {
        return true;
    }
    if user.name() == owner && (perm >> 6) & want == want {
        return true;
    }
    match group {
        Some(group) if user.is_member(group) => (perm >> 3) & want == want,
        _ => false,
    }
}
