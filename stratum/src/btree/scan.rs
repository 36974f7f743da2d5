//! Range scans walk the leaf chain between two `Iid` bounds.

use crate::error::{EngineError, Result};
use crate::page::Rid;
use crate::NO_PAGE;

use super::{Iid, Index};

/// Iterator from a lower-bound `Iid` (inclusive) to an upper-bound `Iid`
/// (exclusive). Advancement within a leaf bumps the slot; at the end of
/// a leaf it follows `next_leaf`. No page stays pinned between steps.
pub struct IndexScan<'a> {
    index: &'a Index,
    iid: Iid,
    end: Iid,
}

impl<'a> IndexScan<'a> {
    pub(super) fn new(index: &'a Index, begin: Iid, end: Iid) -> Result<Self> {
        let mut scan = Self {
            index,
            iid: begin,
            end,
        };
        scan.settle()?;
        Ok(scan)
    }

    pub fn iid(&self) -> Iid {
        self.iid
    }

    pub fn is_end(&self) -> bool {
        self.iid == self.end || self.iid.page_no == NO_PAGE
    }

    /// The record id under the cursor.
    pub fn rid(&self) -> Result<Rid> {
        if self.is_end() {
            return Err(EngineError::IndexEntryNotFound);
        }
        self.index.get_rid(self.iid)
    }

    /// Moves the cursor one entry forward.
    pub fn next(&mut self) -> Result<()> {
        if self.is_end() {
            return Ok(());
        }
        self.iid.slot_no += 1;
        self.settle()
    }

    /// A bound may point one past the last slot of a mid-chain leaf;
    /// hop leaves until the cursor rests on a real entry or the end.
    fn settle(&mut self) -> Result<()> {
        let _latch = self.index.tree_latch().read().unwrap();
        loop {
            if self.is_end() {
                return Ok(());
            }
            let guard = self.index.fetch(self.iid.page_no)?;
            let page = guard.read();
            let layout = self.index.layout();
            if (self.iid.slot_no as usize) < layout.num_keys(&page) {
                return Ok(());
            }
            let next_leaf = layout.header(&page).next_leaf;
            if next_leaf == NO_PAGE {
                self.iid = self.end;
                return Ok(());
            }
            self.iid = Iid::new(next_leaf, 0);
        }
    }
}
