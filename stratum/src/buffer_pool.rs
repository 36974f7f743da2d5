//! Manages the buffer pool: a fixed array of frames caching disk pages,
//! with pin counts, dirty tracking and LRU replacement. Frame bookkeeping
//! lives under a single mutex; page contents are guarded by a per-frame
//! `RwLock` that doubles as the page latch.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::trace;

use crate::disk::{DiskManager, FileId};
use crate::error::{EngineError, Result};
use crate::page::{Page, PageId};
use crate::PageNo;

/// A single frame in the buffer pool.
struct Frame {
    page: RwLock<Page>,
}

#[derive(Clone, Copy)]
struct FrameMeta {
    page_id: Option<PageId>,
    pin_count: u32,
    dirty: bool,
}

/// LRU list of unpinned frames: frames enter at the back when their pin
/// count drops to zero and leave from the front when evicted, or
/// anywhere when re-pinned.
struct LruReplacer {
    queue: VecDeque<usize>,
}

impl LruReplacer {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    fn victim(&mut self) -> Option<usize> {
        self.queue.pop_front()
    }

    fn pin(&mut self, frame_idx: usize) {
        self.queue.retain(|&idx| idx != frame_idx);
    }

    fn unpin(&mut self, frame_idx: usize) {
        if !self.queue.contains(&frame_idx) {
            self.queue.push_back(frame_idx);
        }
    }
}

struct PoolState {
    page_table: HashMap<PageId, usize>,
    free_list: Vec<usize>,
    replacer: LruReplacer,
    meta: Vec<FrameMeta>,
}

pub struct BufferPool {
    disk: Arc<DiskManager>,
    frames: Vec<Arc<Frame>>,
    state: Mutex<PoolState>,
}

/// An RAII pin on one page. `read`/`write` take the page latch; dropping
/// the guard unpins the page, carrying the dirty bit picked up by
/// `write`. This guarantees the unpin on every return path.
pub struct PageGuard<'a> {
    pool: &'a BufferPool,
    frame: Arc<Frame>,
    page_id: PageId,
    dirty: Cell<bool>,
}

impl std::fmt::Debug for PageGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageGuard")
            .field("page_id", &self.page_id)
            .field("dirty", &self.dirty.get())
            .finish()
    }
}

impl PageGuard<'_> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.frame.page.read().unwrap()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        self.dirty.set(true);
        self.frame.page.write().unwrap()
    }

    /// Marks the page dirty without taking the latch, for callers that
    /// mutated through an earlier `write` borrow.
    pub fn mark_dirty(&self) {
        self.dirty.set(true);
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.pool.unpin_page(self.page_id, self.dirty.get());
    }
}

impl BufferPool {
    pub fn new(disk: Arc<DiskManager>, num_frames: usize) -> Self {
        let mut frames = Vec::with_capacity(num_frames);
        let mut free_list = Vec::with_capacity(num_frames);
        let mut meta = Vec::with_capacity(num_frames);
        for i in 0..num_frames {
            frames.push(Arc::new(Frame {
                page: RwLock::new(Page::new(PageId::new(0, 0))),
            }));
            free_list.push(num_frames - 1 - i);
            meta.push(FrameMeta {
                page_id: None,
                pin_count: 0,
                dirty: false,
            });
        }
        Self {
            disk,
            frames,
            state: Mutex::new(PoolState {
                page_table: HashMap::new(),
                free_list,
                replacer: LruReplacer::new(),
                meta,
            }),
        }
    }

    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    fn guard(&self, frame_idx: usize, page_id: PageId) -> PageGuard<'_> {
        PageGuard {
            pool: self,
            frame: self.frames[frame_idx].clone(),
            page_id,
            dirty: Cell::new(false),
        }
    }

    /// Picks a reusable frame: free list first, then the LRU victim.
    /// Writes the evicted page back if it was dirty.
    fn take_victim(&self, state: &mut PoolState) -> Result<usize> {
        let frame_idx = if let Some(idx) = state.free_list.pop() {
            idx
        } else if let Some(idx) = state.replacer.victim() {
            idx
        } else {
            return Err(EngineError::NoFreeFrame);
        };

        debug_assert_eq!(state.meta[frame_idx].pin_count, 0);
        if let Some(old_id) = state.meta[frame_idx].page_id.take() {
            if state.meta[frame_idx].dirty {
                trace!("evicting dirty page {old_id}");
                let page = self.frames[frame_idx].page.read().unwrap();
                self.disk.write_page(old_id.fd, old_id.page_no, &page.data[..])?;
                state.meta[frame_idx].dirty = false;
            }
            state.page_table.remove(&old_id);
        }
        Ok(frame_idx)
    }

    /// Returns the page pinned, reading it from disk if it is not
    /// resident. Fails with [`EngineError::NoFreeFrame`] when every frame
    /// is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PageGuard<'_>> {
        let mut state = self.state.lock().unwrap();
        if let Some(&frame_idx) = state.page_table.get(&page_id) {
            state.meta[frame_idx].pin_count += 1;
            state.replacer.pin(frame_idx);
            return Ok(self.guard(frame_idx, page_id));
        }

        let frame_idx = self.take_victim(&mut state)?;
        {
            let mut page = self.frames[frame_idx].page.write().unwrap();
            page.id = page_id;
            if let Err(e) = self.disk.read_page(page_id.fd, page_id.page_no, &mut page.data[..]) {
                state.free_list.push(frame_idx);
                return Err(e);
            }
        }
        state.meta[frame_idx] = FrameMeta {
            page_id: Some(page_id),
            pin_count: 1,
            dirty: false,
        };
        state.page_table.insert(page_id, frame_idx);
        Ok(self.guard(frame_idx, page_id))
    }

    /// Allocates a fresh zeroed page in `fd` and returns it pinned and
    /// dirty. `page_no` forces the number, which recovery uses to restore
    /// pages at their original position.
    pub fn new_page(&self, fd: FileId, page_no: Option<PageNo>) -> Result<PageGuard<'_>> {
        let mut state = self.state.lock().unwrap();

        if let Some(no) = page_no {
            // Recovery may demand a page that is already resident.
            if let Some(&frame_idx) = state.page_table.get(&PageId::new(fd, no)) {
                state.meta[frame_idx].pin_count += 1;
                state.replacer.pin(frame_idx);
                return Ok(self.guard(frame_idx, PageId::new(fd, no)));
            }
        }

        let frame_idx = self.take_victim(&mut state)?;
        let page_no = match page_no {
            Some(no) => {
                self.disk.set_next_page_no(fd, no + 1)?;
                no
            }
            None => self.disk.allocate_page(fd)?,
        };
        let page_id = PageId::new(fd, page_no);
        {
            let mut page = self.frames[frame_idx].page.write().unwrap();
            page.reset(page_id);
        }
        state.meta[frame_idx] = FrameMeta {
            page_id: Some(page_id),
            pin_count: 1,
            dirty: true,
        };
        state.page_table.insert(page_id, frame_idx);
        Ok(self.guard(frame_idx, page_id))
    }

    /// Drops one pin and ORs in the dirty bit. Returns false if the page
    /// is not resident or was not pinned.
    fn unpin_page(&self, page_id: PageId, dirty: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(&frame_idx) = state.page_table.get(&page_id) else {
            return false;
        };
        let meta = &mut state.meta[frame_idx];
        if meta.pin_count == 0 {
            return false;
        }
        meta.pin_count -= 1;
        meta.dirty |= dirty;
        if meta.pin_count == 0 {
            state.replacer.unpin(frame_idx);
        }
        true
    }

    /// Writes one resident page back to disk and clears its dirty bit.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(&frame_idx) = state.page_table.get(&page_id) else {
            return Ok(false);
        };
        let page = self.frames[frame_idx].page.read().unwrap();
        self.disk.write_page(page_id.fd, page_id.page_no, &page.data[..])?;
        drop(page);
        state.meta[frame_idx].dirty = false;
        Ok(true)
    }

    /// Flushes every dirty page of one file.
    pub fn flush_all_pages(&self, fd: FileId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let targets: Vec<(PageId, usize)> = state
            .page_table
            .iter()
            .filter(|(id, _)| id.fd == fd)
            .map(|(&id, &idx)| (id, idx))
            .collect();
        for (page_id, frame_idx) in targets {
            if state.meta[frame_idx].dirty {
                let page = self.frames[frame_idx].page.read().unwrap();
                self.disk.write_page(page_id.fd, page_id.page_no, &page.data[..])?;
                drop(page);
                state.meta[frame_idx].dirty = false;
            }
        }
        Ok(())
    }

    /// Flushes every dirty page of every file; checkpoint and shutdown.
    pub fn flush_everything(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let targets: Vec<(PageId, usize)> = state
            .page_table
            .iter()
            .map(|(&id, &idx)| (id, idx))
            .collect();
        for (page_id, frame_idx) in targets {
            if state.meta[frame_idx].dirty {
                let page = self.frames[frame_idx].page.read().unwrap();
                self.disk.write_page(page_id.fd, page_id.page_no, &page.data[..])?;
                drop(page);
                state.meta[frame_idx].dirty = false;
            }
        }
        Ok(())
    }

    /// Evicts one page without writing it anywhere, returning false if it
    /// is still pinned. Used when a B+tree merge or a table drop returns
    /// the page to the free pool.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(&frame_idx) = state.page_table.get(&page_id) else {
            return Ok(true);
        };
        if state.meta[frame_idx].pin_count > 0 {
            return Ok(false);
        }
        state.page_table.remove(&page_id);
        state.replacer.pin(frame_idx);
        state.meta[frame_idx] = FrameMeta {
            page_id: None,
            pin_count: 0,
            dirty: false,
        };
        state.free_list.push(frame_idx);
        Ok(true)
    }

    /// Evicts every resident page of one file, for table/index drops.
    pub fn delete_all_pages(&self, fd: FileId) -> Result<()> {
        let ids: Vec<PageId> = {
            let state = self.state.lock().unwrap();
            state
                .page_table
                .keys()
                .filter(|id| id.fd == fd)
                .copied()
                .collect()
        };
        for id in ids {
            if !self.delete_page(id)? {
                return Err(EngineError::Internal(format!(
                    "page {id} still pinned during file drop"
                )));
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let state = self.state.lock().unwrap();
        state
            .page_table
            .get(&page_id)
            .map(|&idx| state.meta[idx].pin_count)
    }
}
