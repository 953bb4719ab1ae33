//! Read-only file mapping, in bounded windows
// (c) 2024 Ross Younger

#![allow(unsafe_code)] // mmap and munmap have no safe wrapper in rustix

use std::{
    ffi::c_void,
    fmt,
    fs::File,
    io,
    path::Path,
    ptr,
};

use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};

/// A file opened for reading, with a read-only mapping of (part of) its contents.
///
/// At most `window` bytes of the file are mapped at any one time. The mapping slides
/// forward as the caller asks for later offsets, so very large files do not exhaust
/// the address space.
///
/// The file handle and the current mapping are released when this struct is dropped.
///
/// # Caution
/// If another process truncates the file while it is mapped, reading the mapping
/// may raise `SIGBUS`. This is inherent to memory-mapped I/O.
pub(crate) struct MappedFile {
    file: File,
    length: u64,
    window_size: usize,
    window: Option<Window>,
}

impl MappedFile {
    /// Opens and maps the first window of a file.
    ///
    /// An empty file is not mapped at all; zero-length mappings are not permitted.
    pub(crate) fn open(path: &Path, window: u64) -> io::Result<Self> {
        let file = File::open(path)?;
        let meta = file.metadata()?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a regular file",
            ));
        }
        let page = rustix::param::page_size();
        let window = usize::try_from(window).unwrap_or(usize::MAX);
        // Window must be a whole number of pages, as mapping offsets have to be page aligned
        let window_size = std::cmp::max(page, window / page * page);

        let mut result = Self {
            file,
            length: meta.len(),
            window_size,
            window: None,
        };
        if result.length > 0 {
            result.remap(0)?;
        }
        Ok(result)
    }

    /// Length of the file when it was opened
    pub(crate) fn len(&self) -> u64 {
        self.length
    }

    /// Size of the current mapping, in bytes
    #[cfg(test)]
    pub(crate) fn mapped_len(&self) -> usize {
        self.window.as_ref().map_or(0, |w| w.len)
    }

    /// Returns the mapped bytes from `offset` to the end of the window containing it.
    ///
    /// Moves the window if `offset` lies outside the current one.
    /// Returns an empty slice at or beyond end of file.
    pub(crate) fn slice_from(&mut self, offset: u64) -> io::Result<&[u8]> {
        if offset >= self.length {
            return Ok(&[]);
        }
        if !self.window.as_ref().is_some_and(|w| w.contains(offset)) {
            self.remap(offset)?;
        }
        let Some(window) = self.window.as_ref() else {
            return Ok(&[]);
        };
        let start = usize::try_from(offset - window.offset).map_err(io::Error::other)?;
        Ok(&window.as_slice()[start..])
    }

    fn remap(&mut self, offset: u64) -> io::Result<()> {
        // The old window is unmapped before the new one is created
        self.window = None;
        let size = self.window_size as u64;
        let aligned = offset / size * size;
        let len = usize::try_from(std::cmp::min(size, self.length - aligned))
            .map_err(io::Error::other)?;
        self.window = Some(Window::map(&self.file, aligned, len)?);
        Ok(())
    }
}

impl fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedFile")
            .field("length", &self.length)
            .field("window_size", &self.window_size)
            .field("window", &self.window.as_ref().map(|w| (w.offset, w.len)))
            .finish_non_exhaustive()
    }
}

/// One live mapping
struct Window {
    base: *mut c_void,
    len: usize,
    offset: u64,
}

impl Window {
    fn map(file: &File, offset: u64, len: usize) -> io::Result<Self> {
        // SAFETY: We ask the kernel to choose the address (null hint), so no existing
        // mapping is replaced. `len` is non-zero and `offset` is page aligned; the kernel
        // validates both against the file and reports failure via the result.
        let base = unsafe {
            mmap(
                ptr::null_mut(),
                len,
                ProtFlags::READ,
                MapFlags::PRIVATE,
                file,
                offset,
            )
        }?;
        Ok(Self { base, len, offset })
    }

    fn contains(&self, offset: u64) -> bool {
        offset >= self.offset && offset - self.offset < self.len as u64
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: `base` points to a live read-only mapping of exactly `len` bytes,
        // which stays mapped until this Window is dropped. The returned slice borrows self.
        unsafe { std::slice::from_raw_parts(self.base.cast::<u8>(), self.len) }
    }
}

impl Drop for Window {
    fn drop(&mut self) {
        // SAFETY: `base` and `len` are exactly those returned by and passed to mmap,
        // and this is the only place the region is unmapped.
        let _ = unsafe { munmap(self.base, self.len) };
    }
}

#[cfg(test)]
mod test {
    use super::MappedFile;
    use pretty_assertions::assert_eq;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    fn file_with(content: &[u8]) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content).unwrap();
        f.flush().unwrap();
        f
    }

    fn pattern(len: usize) -> Vec<u8> {
        #[allow(clippy::cast_possible_truncation)]
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn whole_file_in_one_window() {
        let data = pattern(10_000);
        let f = file_with(&data);
        let mut m = MappedFile::open(f.path(), 1 << 20).unwrap();
        assert_eq!(m.len(), 10_000);
        assert_eq!(m.slice_from(0).unwrap(), &data[..]);
        assert_eq!(m.slice_from(9_990).unwrap(), &data[9_990..]);
        assert!(m.slice_from(10_000).unwrap().is_empty());
    }

    #[test]
    fn windows_reassemble_the_file() {
        let page = rustix::param::page_size();
        let data = pattern(page * 3 + page / 2);
        let f = file_with(&data);
        let mut m = MappedFile::open(f.path(), page as u64).unwrap();
        assert_eq!(m.mapped_len(), page);

        let mut out = Vec::new();
        let mut offset = 0u64;
        loop {
            let slice = m.slice_from(offset).unwrap();
            if slice.is_empty() {
                break;
            }
            assert!(slice.len() <= page);
            out.extend_from_slice(slice);
            offset += slice.len() as u64;
        }
        assert_eq!(out, data);
    }

    #[test]
    fn odd_offsets_within_windows() {
        let page = rustix::param::page_size();
        let data = pattern(page * 2);
        let f = file_with(&data);
        let mut m = MappedFile::open(f.path(), 1).unwrap(); // rounds up to one page
        let s = m.slice_from(page as u64 + 17).unwrap();
        assert_eq!(s, &data[page + 17..]);
        let s = m.slice_from(5).unwrap();
        assert_eq!(s, &data[5..page]);
    }

    #[test]
    fn empty_file_is_not_mapped() {
        let f = file_with(b"");
        let mut m = MappedFile::open(f.path(), 4096).unwrap();
        assert_eq!(m.len(), 0);
        assert_eq!(m.mapped_len(), 0);
        assert!(m.slice_from(0).unwrap().is_empty());
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(MappedFile::open(&dir.path().join("nope"), 4096).is_err());
    }

    #[test]
    fn directory_is_refused() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(MappedFile::open(dir.path(), 4096).is_err());
    }
}
