//! The Anchor is the single 64-bit Word through which all State-Changes of
//! a Descriptor are performed, partitioned as
//!
//! | Bits    | Field   | Meaning                                           |
//! |---------|---------|---------------------------------------------------|
//! | 0..10   | `avail` | Index of the first free Slot in the Super-Block   |
//! | 10..20  | `count` | Number of currently free Slots                    |
//! | 20..22  | `state` | Full / Partial / Empty                            |
//! | 22..64  | `tag`   | Monotonic Update-Counter, guards against ABA      |
//!
//! The 10-bit `avail`/`count` Fields are what limits a Super-Block to less
//! than 1024 Slots

use super::anchor_state::AnchorState;

const FIELD_MASK: u64 = 0x3ff;
const COUNT_SHIFT: u64 = 10;
const STATE_SHIFT: u64 = 20;
const TAG_SHIFT: u64 = 22;

/// The largest Value the `tag` Field can hold before wrapping around
pub const TAG_MASK: u64 = (1 << 42) - 1;

/// The unpacked View of a Descriptors Anchor-Word
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct Anchor {
    /// The Index of the first available Slot in the Super-Block, the Head
    /// of the In-Block Free-List. Undefined while the State is Full
    pub avail: u32,
    /// The Number of free Slots in the Super-Block
    pub count: u32,
    /// The Fill-State of the Super-Block
    pub state: AnchorState,
    /// Bumped on every successful Anchor-Update, never reset for the
    /// Lifetime of a Descriptor
    pub tag: u64,
}

impl From<u64> for Anchor {
    fn from(raw: u64) -> Self {
        Self {
            avail: (raw & FIELD_MASK) as u32,
            count: ((raw >> COUNT_SHIFT) & FIELD_MASK) as u32,
            state: ((raw >> STATE_SHIFT) & 0b11).into(),
            tag: raw >> TAG_SHIFT,
        }
    }
}
impl From<Anchor> for u64 {
    fn from(raw: Anchor) -> Self {
        let avail_bits = raw.avail as u64 & FIELD_MASK;
        let count_bits = (raw.count as u64 & FIELD_MASK) << COUNT_SHIFT;
        let state_bits: u64 = u64::from(raw.state) << STATE_SHIFT;
        let tag_bits = (raw.tag & TAG_MASK) << TAG_SHIFT;

        avail_bits | count_bits | state_bits | tag_bits
    }
}

impl Anchor {
    /// The Anchor of a freshly carved Super-Block, where Slot 0 has already
    /// been handed to the Caller that created it
    ///
    /// With a single-Slot Super-Block there is nothing left after Slot 0
    /// and the Block starts out Full
    pub fn initial(max_count: u32, tag: u64) -> Self {
        let count = max_count - 1;
        Self {
            avail: 1,
            count,
            state: if count == 0 {
                AnchorState::Full
            } else {
                AnchorState::Partial
            },
            tag,
        }
    }

    /// The Anchor of a drained Super-Block, used when a Descriptor is
    /// abandoned before it was ever published
    pub fn drained(max_count: u32, tag: u64) -> Self {
        Self {
            avail: 0,
            count: max_count,
            state: AnchorState::Empty,
            tag,
        }
    }

    /// Bumps the Tag for the next Anchor-Version, wrapping inside the
    /// 42 available Bits
    pub fn next_tag(&self) -> u64 {
        self.tag.wrapping_add(1) & TAG_MASK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u64_to_anchor() {
        assert_eq!(
            Anchor {
                avail: 0x155,
                count: 0x2aa,
                state: AnchorState::Partial,
                tag: 0x155_5555_5555,
            },
            Anchor::from(0x5555_5555_555a_a955)
        );
        assert_eq!(
            Anchor {
                avail: 1,
                count: 254,
                state: AnchorState::Partial,
                tag: 0,
            },
            Anchor::from(0x13f801)
        );
        assert_eq!(
            Anchor {
                avail: 0x3ff,
                count: 0,
                state: AnchorState::Full,
                tag: 1,
            },
            Anchor::from(0x6003ff)
        );
    }

    #[test]
    fn anchor_to_u64() {
        assert_eq!(
            0x5555_5555_555a_a955_u64,
            Anchor {
                avail: 0x155,
                count: 0x2aa,
                state: AnchorState::Partial,
                tag: 0x155_5555_5555,
            }
            .into(),
        );
        assert_eq!(
            0x1cffc00_u64,
            Anchor {
                avail: 0,
                count: 1023,
                state: AnchorState::Empty,
                tag: 7,
            }
            .into(),
        );
        // The widest encodable Anchor still fits the Word exactly
        assert_eq!(
            0xffff_ffff_ffef_ffff_u64,
            Anchor {
                avail: 0x3ff,
                count: 0x3ff,
                state: AnchorState::Full,
                tag: TAG_MASK,
            }
            .into(),
        );
    }

    #[test]
    fn roundtrip() {
        let anchor = Anchor {
            avail: 17,
            count: 254,
            state: AnchorState::Partial,
            tag: 0x123_4567,
        };

        assert_eq!(anchor, Anchor::from(u64::from(anchor)));
    }

    #[test]
    fn initial_anchor() {
        let anchor = Anchor::initial(255, 0);
        assert_eq!(1, anchor.avail);
        assert_eq!(254, anchor.count);
        assert_eq!(AnchorState::Partial, anchor.state);

        // A single-Slot Block is immediately Full
        let anchor = Anchor::initial(1, 3);
        assert_eq!(0, anchor.count);
        assert_eq!(AnchorState::Full, anchor.state);
        assert_eq!(3, anchor.tag);
    }

    #[test]
    fn tag_wraps_inside_its_bits() {
        let anchor = Anchor {
            avail: 0,
            count: 0,
            state: AnchorState::Full,
            tag: TAG_MASK,
        };

        assert_eq!(0, anchor.next_tag());
    }
}
