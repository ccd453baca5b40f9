// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt;

use serde::{Deserialize, Serialize};

/// What to do with an inbound lease when a connection's queue is full.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DropPolicy {
    /// Discard the incoming lease.
    #[default]
    DropNewest,
    /// Evict the oldest queued lease, lowest priority first.
    DropOldest,
    /// Spin (then yield) until the queue has room.
    Block,
    /// Accepted alias of `DropOldest`; no coalescing key is defined.
    Coalesce,
}

impl fmt::Display for DropPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DropNewest => "DROP_NEWEST",
            Self::DropOldest => "DROP_OLDEST",
            Self::Block => "BLOCK",
            Self::Coalesce => "COALESCE",
        };
        f.write_str(s)
    }
}
