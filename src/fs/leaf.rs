// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Clock leaf behaviours whose content is computed on every read.
// Author: Lukas Bower

use chrono::{DateTime, Local, TimeZone};

/// `chrono` format of the timestamps served by the clock files.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f %z";

/// How a leaf produces its bytes.
///
/// Reads never touch the tree and keep no state between calls, so a
/// behaviour may be invoked from any number of threads at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafBehavior {
    /// The current time as a finite, offset-addressable string.
    Bounded,
    /// The current time plus a newline on every read, whatever the offset.
    Unbounded,
}

impl LeafBehavior {
    /// Produce at most `count` bytes of content at `offset`.
    ///
    /// An empty result means end of file; it is never an error.
    #[must_use]
    pub fn read(&self, offset: u64, count: usize) -> Vec<u8> {
        self.read_at(&Local::now(), offset, count)
    }

    /// Same as [`LeafBehavior::read`] against a fixed instant.
    #[must_use]
    pub fn read_at<Tz: TimeZone>(&self, now: &DateTime<Tz>, offset: u64, count: usize) -> Vec<u8>
    where
        Tz::Offset: std::fmt::Display,
    {
        match self {
            Self::Bounded => {
                let text = format_timestamp(now);
                let bytes = text.as_bytes();
                match usize::try_from(offset) {
                    Ok(start) if start < bytes.len() => {
                        let end = bytes.len().min(start.saturating_add(count));
                        bytes[start..end].to_vec()
                    }
                    _ => Vec::new(),
                }
            }
            Self::Unbounded => {
                let mut line = format_timestamp(now).into_bytes();
                line.push(b'\n');
                line.truncate(count);
                line
            }
        }
    }
}

/// Render `now` the way the clock files present it.
#[must_use]
pub fn format_timestamp<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    now.format(TIMESTAMP_FORMAT).to_string()
}
