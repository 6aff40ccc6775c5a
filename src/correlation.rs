//! Correlation buffers shared with the external profiler.
//!
//! Two regions are published: one per thread (kept in thread-local storage,
//! written only by its own thread) and one for the whole process (held by the
//! agent). The memory belongs to whoever supplied it, usually a direct
//! `ByteBuffer` on the Java side; the registry only records where it is and
//! hands out bounded views over it.

use std::cell::Cell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// An externally owned, fixed-size memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
}

// The region is plain memory; synchronisation is the writers' contract.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Describes `len` bytes at `ptr`. `None` for a null address.
    ///
    /// # Safety
    ///
    /// `ptr..ptr + len` must stay valid for reads and writes until the region
    /// is unpublished, and every writer must serialise with the others.
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Region { ptr, len })
    }

    /// Leaks a boxed buffer into a region that lives for the rest of the
    /// process.
    pub fn leak(buf: Box<[u8]>) -> Self {
        let len = buf.len();
        let ptr = Box::leak(buf).as_mut_ptr();
        Region { ptr: NonNull::new(ptr).unwrap_or(NonNull::dangling()), len }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A view over the first `capacity` bytes, `None` if the region is
    /// smaller than that.
    pub fn view(&self, capacity: usize) -> Option<BufferView> {
        (capacity <= self.len).then_some(BufferView { ptr: self.ptr, len: capacity })
    }

    /// Copies `bytes` to `offset`. Returns `false` without writing if they
    /// would not fit.
    ///
    /// # Safety
    ///
    /// The memory must still be alive: a copy of a region outlives the slot
    /// it was read from, so it may point at a buffer that was unpublished
    /// and freed since.
    pub unsafe fn write_at(&self, offset: usize, bytes: &[u8]) -> bool {
        match offset.checked_add(bytes.len()) {
            Some(end) if end <= self.len => {
                ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(offset), bytes.len());
                true
            }
            _ => false,
        }
    }
}

/// A read-only, non-owning window onto a published region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferView {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for BufferView {}
unsafe impl Sync for BufferView {}

impl BufferView {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The viewed bytes.
    ///
    /// # Safety
    ///
    /// The backing region must still be alive and no thread may write to it
    /// while the slice is in use.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }
}

thread_local! {
    static THREAD_STORAGE: Cell<Option<Region>> = const { Cell::new(None) };
}

/// Publishes (or with `None`, clears) the calling thread's region.
pub fn set_thread_storage(region: Option<Region>) {
    THREAD_STORAGE.with(|slot| slot.set(region));
}

/// The calling thread's published region.
pub fn thread_storage() -> Option<Region> {
    THREAD_STORAGE.with(Cell::get)
}

/// A view over the calling thread's region, `None` if nothing is published
/// or `capacity` exceeds it.
pub fn alias_thread_storage(capacity: usize) -> Option<BufferView> {
    thread_storage()?.view(capacity)
}

/// The process-wide region slot.
///
/// Address and length are published separately; readers racing a replacement
/// may observe a mixed pair, which the external synchronisation of writers is
/// expected to rule out.
#[derive(Debug, Default)]
pub struct ProcessStorage {
    ptr: AtomicPtr<u8>,
    len: AtomicUsize,
}

impl ProcessStorage {
    pub const fn new() -> Self {
        ProcessStorage { ptr: AtomicPtr::new(ptr::null_mut()), len: AtomicUsize::new(0) }
    }

    pub fn set(&self, region: Option<Region>) {
        match region {
            Some(region) => {
                self.len.store(region.len, Ordering::Release);
                self.ptr.store(region.as_ptr(), Ordering::Release);
            }
            None => {
                self.ptr.store(ptr::null_mut(), Ordering::Release);
                self.len.store(0, Ordering::Release);
            }
        }
    }

    pub fn get(&self) -> Option<Region> {
        let ptr = NonNull::new(self.ptr.load(Ordering::Acquire))?;
        Some(Region { ptr, len: self.len.load(Ordering::Acquire) })
    }

    pub fn alias(&self, capacity: usize) -> Option<BufferView> {
        self.get()?.view(capacity)
    }
}

/// Byte layouts the external profiler reads from (and writes to) the
/// correlation regions. All integers are native-endian.
pub mod layout {
    use super::Region;

    pub const THREAD_TRACE_ID_OFFSET: usize = 0;
    pub const THREAD_SPAN_ID_OFFSET: usize = 16;
    pub const THREAD_FLAGS_OFFSET: usize = 24;
    pub const THREAD_TRANSACTION_ID_OFFSET: usize = 32;
    pub const THREAD_STORAGE_SIZE: usize = 40;
    /// Set in the thread flags while a trace is active on the thread.
    pub const TRACE_ACTIVE_FLAG: u32 = 1 << 8;

    pub const PROCESS_PROTOCOL_VERSION_OFFSET: usize = 0;
    pub const PROCESS_SERVICE_NAME_LEN_OFFSET: usize = 8;
    pub const PROCESS_SERVICE_NAME_OFFSET: usize = 16;
    pub const PROCESS_STORAGE_SIZE: usize = 4096;
    pub const PROTOCOL_VERSION: u64 = 1;

    /// Trace identity of the span currently running on a thread.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ThreadCorrelation {
        pub trace_id: [u8; 16],
        pub span_id: [u8; 8],
        pub transaction_id: [u8; 8],
    }

    impl ThreadCorrelation {
        /// Writes the record and raises the active flag. `false` if the region
        /// is smaller than [`THREAD_STORAGE_SIZE`].
        ///
        /// # Safety
        ///
        /// As for [`Region::write_at`].
        pub unsafe fn activate(&self, region: &Region) -> bool {
            region.len() >= THREAD_STORAGE_SIZE
                && region.write_at(THREAD_TRACE_ID_OFFSET, &self.trace_id)
                && region.write_at(THREAD_SPAN_ID_OFFSET, &self.span_id)
                && region.write_at(THREAD_TRANSACTION_ID_OFFSET, &self.transaction_id)
                && region.write_at(THREAD_FLAGS_OFFSET, &TRACE_ACTIVE_FLAG.to_ne_bytes())
        }

        /// Clears the active flag; the ids are left for the profiler to ignore.
        ///
        /// # Safety
        ///
        /// As for [`Region::write_at`].
        pub unsafe fn deactivate(region: &Region) -> bool {
            region.write_at(THREAD_FLAGS_OFFSET, &0u32.to_ne_bytes())
        }
    }

    /// Writes the process record. `false` if `service_name` does not fit.
    ///
    /// # Safety
    ///
    /// As for [`Region::write_at`].
    pub unsafe fn write_process_record(region: &Region, service_name: &str) -> bool {
        let name = service_name.as_bytes();
        PROCESS_SERVICE_NAME_OFFSET + name.len() <= region.len()
            && region.write_at(PROCESS_PROTOCOL_VERSION_OFFSET, &PROTOCOL_VERSION.to_ne_bytes())
            && region.write_at(PROCESS_SERVICE_NAME_LEN_OFFSET, &(name.len() as u64).to_ne_bytes())
            && region.write_at(PROCESS_SERVICE_NAME_OFFSET, name)
    }
}
