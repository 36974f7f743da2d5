//! The slotted-page record store. Every table file has a header page
//! (record size, page count, free-page list head) followed by record
//! pages: a small header, a slot-occupancy bitmap and a fixed-size slot
//! array. Pages with free slots form a singly-linked free-page list
//! rooted in the file header.

use std::sync::{Arc, Mutex};

use log::trace;

use crate::bitmap;
use crate::buffer_pool::{BufferPool, PageGuard};
use crate::disk::{DiskManager, FileId};
use crate::error::{EngineError, Result};
use crate::page::{PageId, Rid};
use crate::{PageNo, NO_PAGE, PAGE_SIZE};

/// Page 0 of a table file.
pub const FILE_HEADER_PAGE: PageNo = 0;
/// The first page that can hold records.
pub const FIRST_RECORD_PAGE: PageNo = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct TableFileHeader {
    record_size: u32,
    num_pages: u32,
    records_per_page: u32,
    bitmap_size: u32,
    first_free_page: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RecordPageHeader {
    next_free_page: i32,
    num_records: u32,
}

const PAGE_HEADER_SIZE: usize = std::mem::size_of::<RecordPageHeader>();

/// Largest slot count such that header + bitmap + slots fit in a page.
fn records_per_page_for(record_size: usize) -> usize {
    let usable = PAGE_SIZE - PAGE_HEADER_SIZE;
    let mut n = usable / record_size.max(1);
    while n > 0 && PAGE_HEADER_SIZE + bitmap::size_for(n) + n * record_size > PAGE_SIZE {
        n -= 1;
    }
    n
}

/// Handle on one open table file.
pub struct TableFile {
    name: String,
    fd: FileId,
    disk: Arc<DiskManager>,
    pool: Arc<BufferPool>,
    header: Mutex<TableFileHeader>,
}

impl TableFile {
    /// Creates the file on disk with its header page. `record_size` must
    /// leave room for at least one slot per page.
    pub fn create(disk: &Arc<DiskManager>, file_name: &str, record_size: usize) -> Result<()> {
        let records_per_page = records_per_page_for(record_size);
        if record_size == 0 || records_per_page == 0 {
            return Err(EngineError::Internal(format!(
                "record size {record_size} does not fit a {PAGE_SIZE}-byte page"
            )));
        }
        disk.create_file(file_name)?;
        let fd = disk.open_file(file_name)?;
        let header = TableFileHeader {
            record_size: record_size as u32,
            num_pages: 1,
            records_per_page: records_per_page as u32,
            bitmap_size: bitmap::size_for(records_per_page) as u32,
            first_free_page: NO_PAGE,
        };
        save_header(disk, fd, &header)?;
        Ok(())
    }

    /// Opens an existing table file, loading its header.
    pub fn open(
        disk: Arc<DiskManager>,
        pool: Arc<BufferPool>,
        name: &str,
        file_name: &str,
    ) -> Result<Self> {
        let fd = disk.open_file(file_name)?;
        let mut buf = vec![0u8; PAGE_SIZE];
        disk.read_page(fd, FILE_HEADER_PAGE, &mut buf)?;
        let mut header: TableFileHeader =
            unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const TableFileHeader) };
        // A crash can persist the header ahead of the pages it counts;
        // clamp to what the file really holds and let recovery recreate
        // the rest from the log.
        let on_disk = disk.pages_on_disk(fd)?;
        if header.num_pages as PageNo > on_disk {
            header.num_pages = on_disk.max(1) as u32;
        }
        if header.first_free_page >= header.num_pages as PageNo {
            header.first_free_page = NO_PAGE;
        }
        disk.set_next_page_no(fd, header.num_pages as PageNo)?;
        Ok(Self {
            name: name.to_string(),
            fd,
            disk,
            pool,
            header: Mutex::new(header),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fd(&self) -> FileId {
        self.fd
    }

    pub fn record_size(&self) -> usize {
        self.header.lock().unwrap().record_size as usize
    }

    pub fn records_per_page(&self) -> usize {
        self.header.lock().unwrap().records_per_page as usize
    }

    pub fn num_pages(&self) -> PageNo {
        self.header.lock().unwrap().num_pages as PageNo
    }

    pub fn first_free_page(&self) -> PageNo {
        self.header.lock().unwrap().first_free_page
    }

    fn bitmap_range(&self) -> (usize, usize) {
        let header = self.header.lock().unwrap();
        (PAGE_HEADER_SIZE, header.bitmap_size as usize)
    }

    fn slot_offset(&self, slot_no: i32) -> usize {
        let header = self.header.lock().unwrap();
        PAGE_HEADER_SIZE
            + header.bitmap_size as usize
            + slot_no as usize * header.record_size as usize
    }

    /// Fetches a record page, rejecting page numbers outside the file.
    fn fetch_record_page(&self, page_no: PageNo) -> Result<PageGuard<'_>> {
        let num_pages = self.num_pages();
        if page_no < FIRST_RECORD_PAGE || page_no >= num_pages {
            return Err(EngineError::PageNotExist {
                file: self.name.clone(),
                page_no,
            });
        }
        self.pool.fetch_page(PageId::new(self.fd, page_no))
    }

    /// Fetches a record page for recovery, creating it (zeroed, linked
    /// into the free list) if the file has never held it.
    fn fetch_or_create_page(&self, page_no: PageNo) -> Result<PageGuard<'_>> {
        if page_no < FIRST_RECORD_PAGE {
            return Err(EngineError::PageNotExist {
                file: self.name.clone(),
                page_no,
            });
        }
        {
            let header = self.header.lock().unwrap();
            if page_no < header.num_pages as PageNo {
                drop(header);
                if let Ok(guard) = self.pool.fetch_page(PageId::new(self.fd, page_no)) {
                    return Ok(guard);
                }
            }
        }
        let guard = self.pool.new_page(self.fd, Some(page_no))?;
        {
            let mut header = self.header.lock().unwrap();
            let mut page = guard.write();
            page.write_at(
                0,
                &RecordPageHeader {
                    next_free_page: header.first_free_page,
                    num_records: 0,
                },
            );
            header.first_free_page = page_no;
            if page_no as u32 >= header.num_pages {
                header.num_pages = page_no as u32 + 1;
            }
            save_header(&self.disk, self.fd, &header)?;
        }
        Ok(guard)
    }

    /// Returns the record at `rid`, or `None` if the slot is unoccupied.
    pub fn get_record(&self, rid: Rid) -> Result<Option<Vec<u8>>> {
        let guard = self.fetch_record_page(rid.page_no)?;
        let page = guard.read();
        let (bm_off, bm_len) = self.bitmap_range();
        if !bitmap::is_set(page.bytes(bm_off, bm_len), rid.slot_no as usize) {
            return Ok(None);
        }
        let off = self.slot_offset(rid.slot_no);
        Ok(Some(page.bytes(off, self.record_size()).to_vec()))
    }

    /// Inserts into the first free slot of the first free page, creating
    /// a page if the free list is empty. Returns the new rid.
    pub fn insert_record(&self, buf: &[u8]) -> Result<Rid> {
        self.check_len(buf)?;
        loop {
            let guard = self.acquire_free_page()?;
            let page_no = guard.page_id().page_no;
            if let Some(rid) = self.insert_into_page(&guard, page_no, buf)? {
                return Ok(rid);
            }
            // The free-list head filled up under a concurrent writer;
            // unlink it and pick another page.
            let mut page = guard.write();
            let mut page_hdr: RecordPageHeader = page.read_at(0);
            self.unlink_from_free_list(page_no, &mut page_hdr)?;
            page.write_at(0, &page_hdr);
        }
    }

    fn insert_into_page(
        &self,
        guard: &PageGuard<'_>,
        page_no: PageNo,
        buf: &[u8],
    ) -> Result<Option<Rid>> {
        let (bm_off, bm_len) = self.bitmap_range();
        let records_per_page = self.records_per_page();

        let mut page = guard.write();
        let Some(slot_no) = bitmap::first_unset(page.bytes(bm_off, bm_len), records_per_page)
        else {
            return Ok(None);
        };
        let off = self.slot_offset(slot_no as i32);
        page.bytes_mut(off, buf.len()).copy_from_slice(buf);
        bitmap::set(page.bytes_mut(bm_off, bm_len), slot_no);

        let mut page_hdr: RecordPageHeader = page.read_at(0);
        page_hdr.num_records += 1;
        if page_hdr.num_records as usize >= records_per_page {
            self.unlink_from_free_list(page_no, &mut page_hdr)?;
        }
        page.write_at(0, &page_hdr);
        Ok(Some(Rid::new(page_no, slot_no as i32)))
    }

    /// Inserts at a fixed rid; recovery replay and abort rollback. Pages
    /// that do not exist are created; an occupied slot means the effect
    /// already applies, so it is left alone.
    pub fn insert_at(&self, rid: Rid, buf: &[u8]) -> Result<()> {
        self.check_len(buf)?;
        let guard = self.fetch_or_create_page(rid.page_no)?;
        let (bm_off, bm_len) = self.bitmap_range();
        let records_per_page = self.records_per_page();

        let mut page = guard.write();
        if bitmap::is_set(page.bytes(bm_off, bm_len), rid.slot_no as usize) {
            trace!("insert_at {}/{rid}: slot already occupied", self.name);
            return Ok(());
        }
        let off = self.slot_offset(rid.slot_no);
        page.bytes_mut(off, buf.len()).copy_from_slice(buf);
        bitmap::set(page.bytes_mut(bm_off, bm_len), rid.slot_no as usize);

        let mut page_hdr: RecordPageHeader = page.read_at(0);
        page_hdr.num_records += 1;
        if page_hdr.num_records as usize >= records_per_page {
            self.unlink_from_free_list(rid.page_no, &mut page_hdr)?;
        }
        page.write_at(0, &page_hdr);
        Ok(())
    }

    /// Clears the slot. A slot that is already empty is a no-op.
    pub fn delete_record(&self, rid: Rid) -> Result<()> {
        let guard = self.fetch_record_page(rid.page_no)?;
        self.delete_in_page(&guard, rid)
    }

    /// Recovery variant of delete: tolerates absent pages.
    pub fn delete_at(&self, rid: Rid) -> Result<()> {
        let guard = self.fetch_or_create_page(rid.page_no)?;
        self.delete_in_page(&guard, rid)
    }

    fn delete_in_page(&self, guard: &PageGuard<'_>, rid: Rid) -> Result<()> {
        let (bm_off, bm_len) = self.bitmap_range();
        let records_per_page = self.records_per_page();
        let record_size = self.record_size();

        let mut page = guard.write();
        if !bitmap::is_set(page.bytes(bm_off, bm_len), rid.slot_no as usize) {
            trace!("delete {}/{rid}: slot already empty", self.name);
            return Ok(());
        }
        bitmap::reset(page.bytes_mut(bm_off, bm_len), rid.slot_no as usize);
        let off = self.slot_offset(rid.slot_no);
        page.bytes_mut(off, record_size).fill(0);

        let mut page_hdr: RecordPageHeader = page.read_at(0);
        let was_full = page_hdr.num_records as usize >= records_per_page;
        page_hdr.num_records -= 1;
        if was_full {
            // Full -> non-full: back onto the free list, at the head.
            let mut header = self.header.lock().unwrap();
            page_hdr.next_free_page = header.first_free_page;
            header.first_free_page = rid.page_no;
            save_header(&self.disk, self.fd, &header)?;
        }
        page.write_at(0, &page_hdr);
        Ok(())
    }

    /// Overwrites the slot in place. An empty slot is a no-op.
    pub fn update_record(&self, rid: Rid, buf: &[u8]) -> Result<()> {
        self.check_len(buf)?;
        let guard = self.fetch_record_page(rid.page_no)?;
        self.update_in_page(&guard, rid, buf)
    }

    /// Recovery variant of update: tolerates absent pages.
    pub fn update_at(&self, rid: Rid, buf: &[u8]) -> Result<()> {
        self.check_len(buf)?;
        let guard = self.fetch_or_create_page(rid.page_no)?;
        self.update_in_page(&guard, rid, buf)
    }

    fn update_in_page(&self, guard: &PageGuard<'_>, rid: Rid, buf: &[u8]) -> Result<()> {
        let (bm_off, bm_len) = self.bitmap_range();
        let mut page = guard.write();
        if !bitmap::is_set(page.bytes(bm_off, bm_len), rid.slot_no as usize) {
            trace!("update {}/{rid}: slot is empty", self.name);
            return Ok(());
        }
        let off = self.slot_offset(rid.slot_no);
        page.bytes_mut(off, buf.len()).copy_from_slice(buf);
        Ok(())
    }

    fn check_len(&self, buf: &[u8]) -> Result<()> {
        let record_size = self.record_size();
        if buf.len() != record_size {
            return Err(EngineError::Internal(format!(
                "record of {} bytes in table {} with record size {}",
                buf.len(),
                self.name,
                record_size
            )));
        }
        Ok(())
    }

    /// First page with a free slot, creating one when the list is empty.
    /// A free-list head lost to a crash is dropped and replaced.
    fn acquire_free_page(&self) -> Result<PageGuard<'_>> {
        let first_free = self.first_free_page();
        if first_free == NO_PAGE {
            return self.create_record_page();
        }
        match self.fetch_record_page(first_free) {
            Ok(guard) => Ok(guard),
            Err(EngineError::PageNotExist { .. }) => {
                let mut header = self.header.lock().unwrap();
                if header.first_free_page == first_free {
                    header.first_free_page = NO_PAGE;
                    save_header(&self.disk, self.fd, &header)?;
                }
                drop(header);
                self.create_record_page()
            }
            Err(e) => Err(e),
        }
    }

    fn create_record_page(&self) -> Result<PageGuard<'_>> {
        let guard = self.pool.new_page(self.fd, None)?;
        let page_no = guard.page_id().page_no;
        let mut header = self.header.lock().unwrap();
        debug_assert_eq!(page_no as u32, header.num_pages);
        {
            let mut page = guard.write();
            page.write_at(
                0,
                &RecordPageHeader {
                    next_free_page: header.first_free_page,
                    num_records: 0,
                },
            );
        }
        header.num_pages = header.num_pages.max(page_no as u32 + 1);
        header.first_free_page = page_no;
        save_header(&self.disk, self.fd, &header)?;
        Ok(guard)
    }

    fn unlink_from_free_list(&self, page_no: PageNo, page_hdr: &mut RecordPageHeader) -> Result<()> {
        let mut header = self.header.lock().unwrap();
        if header.first_free_page == page_no {
            header.first_free_page = page_hdr.next_free_page;
            save_header(&self.disk, self.fd, &header)?;
        }
        page_hdr.next_free_page = NO_PAGE;
        Ok(())
    }

    /// Occupancy of one page, for consistency checks.
    pub fn page_record_count(&self, page_no: PageNo) -> Result<(u32, usize)> {
        let guard = self.fetch_record_page(page_no)?;
        let page = guard.read();
        let page_hdr: RecordPageHeader = page.read_at(0);
        let (bm_off, bm_len) = self.bitmap_range();
        let popcount = bitmap::count(page.bytes(bm_off, bm_len), self.records_per_page());
        Ok((page_hdr.num_records, popcount))
    }

    /// Writes the header and every dirty page of this file back to disk.
    pub fn flush(&self) -> Result<()> {
        let header = self.header.lock().unwrap();
        save_header(&self.disk, self.fd, &header)?;
        drop(header);
        self.pool.flush_all_pages(self.fd)
    }

    pub fn scan(&self) -> Result<TableScan<'_>> {
        let mut scan = TableScan {
            table: self,
            rid: Rid::new(NO_PAGE, -1),
        };
        scan.next()?;
        Ok(scan)
    }
}

fn save_header(disk: &Arc<DiskManager>, fd: FileId, header: &TableFileHeader) -> Result<()> {
    let mut buf = vec![0u8; PAGE_SIZE];
    unsafe {
        std::ptr::write_unaligned(buf.as_mut_ptr() as *mut TableFileHeader, *header);
    }
    disk.write_page(fd, FILE_HEADER_PAGE, &buf)
}

/// Forward scan over every occupied slot in page-then-slot order. The
/// end position is the `(NO_PAGE, -1)` sentinel. Pages are fetched and
/// unpinned on each step; nothing stays pinned between calls.
pub struct TableScan<'a> {
    table: &'a TableFile,
    rid: Rid,
}

impl TableScan<'_> {
    pub fn rid(&self) -> Rid {
        self.rid
    }

    pub fn is_end(&self) -> bool {
        self.rid.page_no == NO_PAGE
    }

    /// Advances to the next occupied slot, or to the end sentinel.
    pub fn next(&mut self) -> Result<()> {
        let num_pages = self.table.num_pages();
        let records_per_page = self.table.records_per_page();
        let (bm_off, bm_len) = self.table.bitmap_range();

        let (mut page_no, mut slot_no) = if self.rid.page_no == NO_PAGE {
            (FIRST_RECORD_PAGE, 0)
        } else {
            (self.rid.page_no, self.rid.slot_no + 1)
        };

        while page_no < num_pages {
            let guard = self.table.fetch_record_page(page_no)?;
            let page = guard.read();
            if let Some(found) =
                bitmap::next_set(page.bytes(bm_off, bm_len), slot_no as usize, records_per_page)
            {
                self.rid = Rid::new(page_no, found as i32);
                return Ok(());
            }
            page_no += 1;
            slot_no = 0;
        }
        self.rid = Rid::new(NO_PAGE, -1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPool;
    use tempfile::tempdir;

    fn open_table(dir: &std::path::Path, record_size: usize) -> TableFile {
        let disk = Arc::new(DiskManager::open(dir).unwrap());
        let pool = Arc::new(BufferPool::new(disk.clone(), 64));
        TableFile::create(&disk, "t.tbl", record_size).unwrap();
        TableFile::open(disk, pool, "t", "t.tbl").unwrap()
    }

    fn record(record_size: usize, tag: u8) -> Vec<u8> {
        let mut buf = vec![0u8; record_size];
        buf[0] = tag;
        buf
    }

    #[test]
    fn test_insert_get_round_trip() {
        let dir = tempdir().unwrap();
        let table = open_table(dir.path(), 16);
        let rid = table.insert_record(&record(16, 7)).unwrap();
        assert_eq!(rid, Rid::new(1, 0));
        let got = table.get_record(rid).unwrap().unwrap();
        assert_eq!(got[0], 7);
    }

    #[test]
    fn test_get_on_empty_slot_is_none() {
        let dir = tempdir().unwrap();
        let table = open_table(dir.path(), 16);
        table.insert_record(&record(16, 1)).unwrap();
        assert!(table.get_record(Rid::new(1, 5)).unwrap().is_none());
    }

    #[test]
    fn test_fetch_invalid_page_fails() {
        let dir = tempdir().unwrap();
        let table = open_table(dir.path(), 16);
        match table.get_record(Rid::new(9, 0)) {
            Err(EngineError::PageNotExist { page_no: 9, .. }) => {}
            other => panic!("expected PageNotExist, got {other:?}"),
        }
    }

    #[test]
    fn test_insert_delete_restores_page_state() {
        let dir = tempdir().unwrap();
        let table = open_table(dir.path(), 16);
        let before_free = table.first_free_page();

        let rid = table.insert_record(&record(16, 3)).unwrap();
        let (count_after, pop_after) = table.page_record_count(rid.page_no).unwrap();
        assert_eq!(count_after, 1);
        assert_eq!(pop_after, 1);

        table.delete_record(rid).unwrap();
        let (count, pop) = table.page_record_count(rid.page_no).unwrap();
        assert_eq!(count, 0);
        assert_eq!(pop, 0);
        assert!(table.get_record(rid).unwrap().is_none());
        // The (now empty) page stays on the free list.
        assert_ne!(table.first_free_page(), before_free);
    }

    #[test]
    fn test_full_page_leaves_free_list() {
        let dir = tempdir().unwrap();
        // Large records keep the per-page slot count small.
        let record_size = 1000;
        let table = open_table(dir.path(), record_size);
        let per_page = table.records_per_page();

        let mut rids = Vec::new();
        for i in 0..per_page {
            rids.push(table.insert_record(&record(record_size, i as u8)).unwrap());
        }
        // Page 1 filled up and left the list.
        assert!(rids.iter().all(|r| r.page_no == 1));
        assert_eq!(table.first_free_page(), NO_PAGE);

        // The next insert opens page 2.
        let rid = table.insert_record(&record(record_size, 99)).unwrap();
        assert_eq!(rid.page_no, 2);
        assert_eq!(table.first_free_page(), 2);

        // Deleting from the full page links it back in, at the head.
        table.delete_record(rids[0]).unwrap();
        assert_eq!(table.first_free_page(), 1);

        // And the freed slot is the next one reused.
        let reused = table.insert_record(&record(record_size, 50)).unwrap();
        assert_eq!(reused, rids[0]);
    }

    #[test]
    fn test_update_overwrites_in_place() {
        let dir = tempdir().unwrap();
        let table = open_table(dir.path(), 16);
        let rid = table.insert_record(&record(16, 1)).unwrap();
        table.update_record(rid, &record(16, 2)).unwrap();
        table.update_record(rid, &record(16, 2)).unwrap();
        assert_eq!(table.get_record(rid).unwrap().unwrap()[0], 2);
    }

    #[test]
    fn test_scan_in_page_slot_order() {
        let dir = tempdir().unwrap();
        let table = open_table(dir.path(), 16);
        let mut expected = Vec::new();
        for i in 0..10u8 {
            expected.push(table.insert_record(&record(16, i)).unwrap());
        }
        table.delete_record(expected.remove(4)).unwrap();

        let mut got = Vec::new();
        let mut scan = table.scan().unwrap();
        while !scan.is_end() {
            got.push(scan.rid());
            scan.next().unwrap();
        }
        assert_eq!(got, expected);
    }

    #[test]
    fn test_scan_empty_table_hits_sentinel() {
        let dir = tempdir().unwrap();
        let table = open_table(dir.path(), 16);
        let scan = table.scan().unwrap();
        assert!(scan.is_end());
        assert_eq!(scan.rid(), Rid::new(NO_PAGE, -1));
    }

    #[test]
    fn test_insert_at_creates_missing_page() {
        let dir = tempdir().unwrap();
        let table = open_table(dir.path(), 16);
        table.insert_at(Rid::new(3, 2), &record(16, 8)).unwrap();
        assert_eq!(table.get_record(Rid::new(3, 2)).unwrap().unwrap()[0], 8);
        assert!(table.num_pages() >= 4);
    }

    #[test]
    fn test_insert_at_occupied_slot_is_noop() {
        let dir = tempdir().unwrap();
        let table = open_table(dir.path(), 16);
        let rid = table.insert_record(&record(16, 1)).unwrap();
        table.insert_at(rid, &record(16, 9)).unwrap();
        assert_eq!(table.get_record(rid).unwrap().unwrap()[0], 1);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let rid;
        {
            let disk = Arc::new(DiskManager::open(dir.path()).unwrap());
            let pool = Arc::new(BufferPool::new(disk.clone(), 64));
            TableFile::create(&disk, "t.tbl", 16).unwrap();
            let table = TableFile::open(disk, pool, "t", "t.tbl").unwrap();
            rid = table.insert_record(&record(16, 42)).unwrap();
            table.flush().unwrap();
        }
        let disk = Arc::new(DiskManager::open(dir.path()).unwrap());
        let pool = Arc::new(BufferPool::new(disk.clone(), 64));
        let table = TableFile::open(disk, pool, "t", "t.tbl").unwrap();
        assert_eq!(table.get_record(rid).unwrap().unwrap()[0], 42);
    }
}
