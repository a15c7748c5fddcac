// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Clock file server library: synthetic tree, identity stub and service posting.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! `timefs` serves a read-only tree holding two clock files, `/time` and
//! `/inftime`, over 9P2000. The far end of the serving connection is posted
//! under a service name so clients can find it.

pub mod bootstrap;
/// Command-line flags, environment overrides and logging setup.
pub mod config;
/// Service connections whose far end lives in a service namespace.
pub mod conn;
pub mod fs;
pub mod srv;
pub mod users;

pub use bootstrap::{build_tree, start, Service};
pub use config::{Cli, Config};
pub use conn::{SrvAddr, SrvConn};
pub use fs::{FsError, LeafBehavior, NodeId, SynthTree};
pub use srv::{ProcessSrv, SrvDir, SrvError, SrvNamespace, SrvRegistration};
pub use users::NoneUsers;
