//! `.debug_loc` location lists.
//!
//! A list is a run of `[lowpc, highpc) -> expression` entries terminated by
//! a `(0, 0)` pair. Entry bounds are offsets from the applicable base
//! address, which starts at the owning compilation unit's low pc and is
//! replaced by base-address directives (an entry whose first word is
//! all ones) per DWARF 4 section 2.6.2.

use crate::dwarf::EndianArcSlice;
use crate::error::{Error, Result};
use gimli::{DebugLoc, DebugLocLists, Encoding, LocationLists, LocationListsOffset, RawLocListEntry};

pub struct LocList {
    locations: LocationLists<EndianArcSlice>,
}

impl LocList {
    pub fn new(debug_loc: DebugLoc<EndianArcSlice>, debug_loclists: DebugLocLists<EndianArcSlice>) -> Self {
        Self {
            locations: LocationLists::new(debug_loc, debug_loclists),
        }
    }

    /// Return the expression of the first entry at `offset` covering `pc`.
    ///
    /// `base_addr` is the owning unit's low pc and `pc` is the link-time
    /// (unrelocated) program counter.
    pub fn find_entry(
        &self,
        offset: u64,
        encoding: Encoding,
        base_addr: u64,
        pc: u64,
    ) -> Result<gimli::Expression<EndianArcSlice>> {
        let not_found = || Error::LoclistEntryNotFound {
            offset,
            relpc: pc.saturating_sub(base_addr),
        };

        let mut raw = self
            .locations
            .raw_locations(LocationListsOffset(offset as usize), encoding)
            .map_err(|_| not_found())?;

        let mut base = base_addr;
        loop {
            let entry = match raw.next() {
                Ok(Some(entry)) => entry,
                // end-of-list sentinel reached, or the data is malformed
                Ok(None) | Err(_) => return Err(not_found()),
            };

            match entry {
                RawLocListEntry::BaseAddress { addr } => base = addr,
                RawLocListEntry::AddressOrOffsetPair { begin, end, data }
                | RawLocListEntry::OffsetPair { begin, end, data } => {
                    if pc >= base.wrapping_add(begin) && pc < base.wrapping_add(end) {
                        return Ok(data);
                    }
                }
                RawLocListEntry::StartEnd { begin, end, data } => {
                    if pc >= begin && pc < end {
                        return Ok(data);
                    }
                }
                RawLocListEntry::StartLength { begin, length, data } => {
                    if pc >= begin && pc < begin + length {
                        return Ok(data);
                    }
                }
                // DWARF 5 forms needing .debug_addr are not produced for
                // version <= 4 units
                _ => continue,
            }
        }
    }
}
