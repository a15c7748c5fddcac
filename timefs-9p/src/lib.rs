// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Provide the 9P2000 codec, dispatcher and client used by timefs.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Plan 9 file protocol plumbing.
//!
//! * [`codec`] frames and parses 9P2000 messages.
//! * [`identity`] defines the user and group interfaces consulted on attach
//!   and open.
//! * [`server`] hosts the [`Serve9p`] seam and the [`Server`] dispatcher that
//!   drives one byte stream per session.
//! * [`client`] is a small blocking client for tests and diagnostics.
//!
//! Only the classic dialect is spoken; `9P2000.u` and `9P2000.L` requests
//! are answered as plain `9P2000`.

use std::io;

use thiserror::Error;

pub mod client;
pub mod codec;
pub mod identity;
pub mod server;
mod types;

pub use client::Client;
pub use codec::{decode_request, decode_response, encode_request, encode_response, Codec};
pub use identity::{Group, User, Users};
pub use server::{Serve9p, Server};
pub use types::*;

/// Result type used across the [`Serve9p`] seam; errors travel as `Rerror` text.
pub type Result<T> = std::result::Result<T, String>;

/// Errors surfaced by sessions and clients.
#[derive(Debug, Error)]
pub enum NinepError {
    /// Codec failure while parsing or serialising frames.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    /// Transport failure on the underlying stream.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// Error reported by the peer in an `Rerror`.
    #[error("{0}")]
    Protocol(String),
}
