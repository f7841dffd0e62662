//! Fusion negotiation between adjacent stages.
//!
//! A consumer asks its upstream, through [`FusionAware::request_fusion`], whether the
//! two can share one queue. The answer is always a subset of the request.
//!
//! [`FusionAware::request_fusion`]: crate::core::FusionAware::request_fusion

use std::fmt;
use std::ops::{BitAnd, BitOr};

/// Bit set of fusion modes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FusionMode(u8);

impl FusionMode {
    /// Not fused; plain push protocol.
    pub const NONE: FusionMode = FusionMode(0);
    /// All items are available synchronously; poll until empty means done.
    pub const SYNC: FusionMode = FusionMode(1);
    /// Items arrive asynchronously; availability is still signalled.
    pub const ASYNC: FusionMode = FusionMode(2);
    /// Either SYNC or ASYNC.
    pub const ANY: FusionMode = FusionMode(3);
    /// The requester sits on an execution-context boundary.
    pub const BOUNDARY: FusionMode = FusionMode(4);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        FusionMode(bits & 0b111)
    }

    pub const fn contains(self, other: FusionMode) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub const fn is_none(self) -> bool {
        self.0 & Self::ANY.0 == 0
    }

    /// Drop the BOUNDARY flag.
    pub const fn without_boundary(self) -> Self {
        FusionMode(self.0 & !Self::BOUNDARY.0)
    }
}

impl BitOr for FusionMode {
    type Output = FusionMode;

    fn bitor(self, rhs: Self) -> Self {
        FusionMode(self.0 | rhs.0)
    }
}

impl BitAnd for FusionMode {
    type Output = FusionMode;

    fn bitand(self, rhs: Self) -> Self {
        FusionMode(self.0 & rhs.0)
    }
}

impl fmt::Debug for FusionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() && !self.contains(Self::BOUNDARY) {
            return write!(f, "NONE");
        }
        let mut parts = Vec::new();
        if self.contains(Self::SYNC) {
            parts.push("SYNC");
        }
        if self.contains(Self::ASYNC) {
            parts.push("ASYNC");
        }
        if self.contains(Self::BOUNDARY) {
            parts.push("BOUNDARY");
        }
        write!(f, "{}", parts.join("|"))
    }
}

/// Grant the first supported mode of a request.
///
/// `supported` is what the upstream can do (SYNC and/or ASYNC). SYNC wins over ASYNC
/// when both are possible since it needs no availability signalling.
pub fn negotiate(requested: FusionMode, supported: FusionMode) -> FusionMode {
    if requested.contains(FusionMode::SYNC) && supported.contains(FusionMode::SYNC) {
        FusionMode::SYNC
    } else if requested.contains(FusionMode::ASYNC) && supported.contains(FusionMode::ASYNC) {
        FusionMode::ASYNC
    } else {
        FusionMode::NONE
    }
}

/// Negotiation for stages that run a user callback inside `poll`.
///
/// Such a stage forwards the request to its own upstream, unless the requester is an
/// execution-context boundary: fusing would move the callback onto the other side of
/// the boundary.
pub fn negotiate_transitive<F>(requested: FusionMode, upstream: F) -> FusionMode
where
    F: FnOnce(FusionMode) -> FusionMode,
{
    if requested.contains(FusionMode::BOUNDARY) {
        return FusionMode::NONE;
    }
    upstream(requested)
}

/// Encoding of the negotiated source mode for storage in an `AtomicU8`.
pub(crate) const fn mode_to_u8(mode: FusionMode) -> u8 {
    mode.0 & FusionMode::ANY.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_preferred_over_async() {
        assert_eq!(negotiate(FusionMode::ANY, FusionMode::ANY), FusionMode::SYNC);
        assert_eq!(negotiate(FusionMode::ASYNC, FusionMode::ANY), FusionMode::ASYNC);
        assert_eq!(negotiate(FusionMode::SYNC, FusionMode::ASYNC), FusionMode::NONE);
    }

    #[test]
    fn boundary_flag_is_ignored_by_queue_owners() {
        let requested = FusionMode::ANY | FusionMode::BOUNDARY;
        assert_eq!(negotiate(requested, FusionMode::SYNC), FusionMode::SYNC);
    }

    #[test]
    fn boundary_blocks_transitive_fusion() {
        let granted = negotiate_transitive(FusionMode::ANY | FusionMode::BOUNDARY, |_| {
            panic!("upstream must not be asked")
        });
        assert_eq!(granted, FusionMode::NONE);

        let granted = negotiate_transitive(FusionMode::ANY, |m| negotiate(m, FusionMode::ASYNC));
        assert_eq!(granted, FusionMode::ASYNC);
    }

    #[test]
    fn debug_lists_flags() {
        assert_eq!(format!("{:?}", FusionMode::ANY | FusionMode::BOUNDARY), "SYNC|ASYNC|BOUNDARY");
        assert_eq!(format!("{:?}", FusionMode::NONE), "NONE");
    }
}
