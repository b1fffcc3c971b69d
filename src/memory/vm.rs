use std::fmt;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum MemError {
    BreakFailed(std::io::Error),
    MapFailed(std::io::Error),
    UnmapFailed(std::io::Error),
    InitFailed(String),
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemError::BreakFailed(e) => write!(f, "program break extension failed: {e}"),
            MemError::MapFailed(e) => write!(f, "page mapping failed: {e}"),
            MemError::UnmapFailed(e) => write!(f, "page unmapping failed: {e}"),
            MemError::InitFailed(msg) => write!(f, "heap initialization failed: {msg}"),
        }
    }
}

impl std::error::Error for MemError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MemError::BreakFailed(e) | MemError::MapFailed(e) | MemError::UnmapFailed(e) => Some(e),
            MemError::InitFailed(_) => None,
        }
    }
}

/// Abstract interface for the two OS memory primitives the heap consumes:
/// grow-only data-segment extension and anonymous page mappings.
pub(crate) trait OsMemOps {
    /// Current program break.
    fn current_break() -> Result<NonNull<u8>, MemError>;

    /// Grow the data segment by `n` bytes. Returns the base of the new
    /// region (the previous break). The segment is never shrunk back.
    unsafe fn extend_break(n: usize) -> Result<NonNull<u8>, MemError>;

    /// Map `n` bytes of private anonymous read-write memory. The kernel
    /// zero-fills fresh anonymous pages; callers rely on that.
    unsafe fn map_pages(n: usize) -> Result<NonNull<u8>, MemError>;

    /// Unmap a range previously obtained from [`map_pages`](Self::map_pages).
    /// After this the range must not be touched.
    unsafe fn unmap_pages(ptr: NonNull<u8>, n: usize) -> Result<(), MemError>;

    /// OS page size.
    fn page_size() -> usize;
}

pub(crate) struct PlatformMemOps;

#[cfg(unix)]
mod unix {
    use super::{MemError, NonNull, OsMemOps, PlatformMemOps};
    use std::io;

    fn break_of(raw: *mut libc::c_void) -> Result<NonNull<u8>, MemError> {
        if raw == usize::MAX as *mut libc::c_void {
            return Err(MemError::BreakFailed(io::Error::last_os_error()));
        }
        NonNull::new(raw.cast::<u8>())
            .ok_or_else(|| MemError::BreakFailed(io::Error::other("sbrk returned null")))
    }

    impl OsMemOps for PlatformMemOps {
        fn current_break() -> Result<NonNull<u8>, MemError> {
            // Safety: FFI call to sbrk; increment 0 only queries.
            break_of(unsafe { libc::sbrk(0) })
        }

        unsafe fn extend_break(n: usize) -> Result<NonNull<u8>, MemError> {
            if n > isize::MAX as usize {
                return Err(MemError::BreakFailed(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("break increment {n} exceeds isize::MAX"),
                )));
            }
            // Checked above: the increment fits in isize.
            let increment = n as libc::intptr_t;
            // Safety: FFI call to sbrk.
            break_of(unsafe { libc::sbrk(increment) })
        }

        unsafe fn map_pages(n: usize) -> Result<NonNull<u8>, MemError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    n,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(MemError::MapFailed(io::Error::last_os_error()));
            }

            NonNull::new(ptr.cast::<u8>())
                .ok_or_else(|| MemError::MapFailed(io::Error::other("mmap returned null")))
        }

        unsafe fn unmap_pages(ptr: NonNull<u8>, n: usize) -> Result<(), MemError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), n) } != 0 {
                return Err(MemError::UnmapFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use std::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // 64-bit targets only; a positive c_long fits in usize there.
                usize::try_from(raw).expect("page size fits in usize")
            })
        }
    }
}
