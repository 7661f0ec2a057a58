//! `FrameID` addressing.
//!
//! Grounded in `original_source/include/ftl/protocol/frameid.hpp`-style
//! packed identifiers: a frameset index and a source index, either of which
//! may be the wildcard value 255.

use serde::{Deserialize, Serialize};

/// 255 in either position of a `FrameID` means "wildcard".
pub const ALL_FRAMES: u8 = 255;
pub const ALL_FRAMESETS: u8 = 255;

/// Addresses one source within one frameset: `(frameset, source)`.
///
/// Totally ordered and hashable so it can key maps (the muxer's output map,
/// the net stream's per-client table) and sets (`frames()`/`enabled()`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FrameID {
    pub frameset: u8,
    pub source: u8,
}

impl FrameID {
    pub const fn new(frameset: u8, source: u8) -> Self {
        Self { frameset, source }
    }

    /// `255/255` - every frame in every frameset.
    pub const fn all() -> Self {
        Self::new(ALL_FRAMESETS, ALL_FRAMES)
    }

    pub const fn is_wildcard_frameset(&self) -> bool {
        self.frameset == ALL_FRAMESETS
    }

    pub const fn is_wildcard_source(&self) -> bool {
        self.source == ALL_FRAMES
    }

    /// True for any of the three wildcard shapes: `255/255`, `fs/255`, `255/src`.
    pub const fn is_wildcard(&self) -> bool {
        self.is_wildcard_frameset() || self.is_wildcard_source()
    }

    /// Does this (possibly wildcarded) id match a concrete frame id?
    pub fn matches(&self, concrete: FrameID) -> bool {
        (self.is_wildcard_frameset() || self.frameset == concrete.frameset)
            && (self.is_wildcard_source() || self.source == concrete.source)
    }
}

impl std::fmt::Display for FrameID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.frameset, self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_is_double_wildcard() {
        let id = FrameID::all();
        assert!(id.is_wildcard_frameset());
        assert!(id.is_wildcard_source());
        assert!(id.is_wildcard());
    }

    #[test]
    fn matches_exact() {
        let id = FrameID::new(1, 2);
        assert!(id.matches(FrameID::new(1, 2)));
        assert!(!id.matches(FrameID::new(1, 3)));
    }

    #[test]
    fn matches_frameset_wildcard() {
        let id = FrameID::new(ALL_FRAMESETS, 2);
        assert!(id.matches(FrameID::new(1, 2)));
        assert!(id.matches(FrameID::new(9, 2)));
        assert!(!id.matches(FrameID::new(9, 3)));
    }

    #[test]
    fn matches_source_wildcard() {
        let id = FrameID::new(1, ALL_FRAMES);
        assert!(id.matches(FrameID::new(1, 0)));
        assert!(id.matches(FrameID::new(1, 254)));
        assert!(!id.matches(FrameID::new(2, 0)));
    }

    #[test]
    fn matches_all_wildcard() {
        let id = FrameID::all();
        assert!(id.matches(FrameID::new(4, 5)));
    }

    #[test]
    fn ordering_is_total() {
        let mut ids = vec![FrameID::new(2, 0), FrameID::new(1, 5), FrameID::new(1, 0)];
        ids.sort();
        assert_eq!(ids, vec![FrameID::new(1, 0), FrameID::new(1, 5), FrameID::new(2, 0)]);
    }

    #[test]
    fn display_format() {
        assert_eq!(FrameID::new(1, 2).to_string(), "1/2");
    }
}
