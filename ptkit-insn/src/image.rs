//! The traced memory image.
//!
//! The instruction-flow decoder reads code bytes through an [`Image`]: a set
//! of file-backed sections indexed by address space and virtual address,
//! with an optional read callback for addresses outside any section and an
//! optional callback to load binaries lazily when a new CR3 shows up.
//!
//! An image may be shared between decoders through [`SharedImage`]; it locks
//! internally and must not be mutated while another decoder is mid-decode.

use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use memmap2::Mmap;
use ptkit_packet::Error;

/// The CR3 value standing for "unknown, match any".
pub const NO_CR3: u64 = u64::MAX;

/// An address space identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Asid {
    /// The CR3 value, or [`NO_CR3`]
    pub cr3: u64,
}

impl Asid {
    /// An identifier for the address space rooted at `cr3`.
    #[must_use]
    pub const fn new(cr3: u64) -> Self {
        Asid { cr3 }
    }

    /// The wildcard identifier.
    #[must_use]
    pub const fn unknown() -> Self {
        Asid { cr3: NO_CR3 }
    }

    /// Whether two identifiers select the same address space.
    ///
    /// An unknown CR3 matches anything.
    #[must_use]
    pub fn matches(&self, other: &Asid) -> bool {
        self.cr3 == NO_CR3 || other.cr3 == NO_CR3 || self.cr3 == other.cr3
    }
}

impl Default for Asid {
    fn default() -> Self {
        Asid::unknown()
    }
}

/// A fallback for reading memory not covered by any section.
pub trait ReadMemory: Send {
    /// Read up to `buffer.len()` bytes from `asid` at `ip`.
    ///
    /// Returns the number of bytes read; [`Error::Nomap`] if nothing is
    /// mapped there.
    fn read_memory(&mut self, buffer: &mut [u8], asid: &Asid, ip: u64) -> Result<usize, Error>;
}

/// A hook for loading binaries lazily.
///
/// Called once when the decoder meets a CR3 it has no sections for; the
/// implementation may add sections to `image` and the failed lookup is
/// retried exactly once.
pub trait ResolveCr3: Send {
    /// Make the memory of `cr3` available in `image`.
    fn new_cr3(&mut self, image: &mut Image, cr3: u64, ip: u64) -> Result<(), Error>;
}

/// A file-backed section of traced memory.
#[derive(Debug, Clone)]
struct Section {
    filename: PathBuf,
    map: Arc<Mmap>,
    offset: u64,
    size: u64,
    asid: Asid,
    vaddr: u64,
}

impl Section {
    fn contains(&self, asid: &Asid, ip: u64) -> bool {
        self.asid.matches(asid) && self.vaddr <= ip && ip - self.vaddr < self.size
    }

    fn overlaps(&self, other: &Section) -> bool {
        self.asid.matches(&other.asid)
            && self.vaddr < other.vaddr + other.size
            && other.vaddr < self.vaddr + self.size
    }

    /// Copy bytes at `ip` into `buffer`; stops at the section end.
    #[expect(clippy::cast_possible_truncation)]
    fn read(&self, buffer: &mut [u8], ip: u64) -> usize {
        let skip = ip - self.vaddr;
        let count = buffer.len().min((self.size - skip) as usize);
        let begin = (self.offset + skip) as usize;
        buffer[..count].copy_from_slice(&self.map[begin..begin + count]);
        count
    }
}

/// The traced memory image.
#[derive(Default)]
pub struct Image {
    name: Option<String>,
    sections: Vec<Section>,
    read_fallback: Option<Box<dyn ReadMemory>>,
    cr3_resolver: Option<Box<dyn ResolveCr3>>,
}

impl Image {
    /// An empty image with an optional name.
    #[must_use]
    pub fn new(name: Option<&str>) -> Self {
        Image {
            name: name.map(str::to_owned),
            ..Image::default()
        }
    }

    /// The image name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Add `size` bytes starting at `offset` in `filename`, loaded at the
    /// virtual address `vaddr` in the address space `asid`.
    ///
    /// The section is silently truncated to the size of the file. Fails with
    /// [`Error::BadImage`] if it would overlap an existing section, with
    /// [`Error::Invalid`] if the file cannot be mapped or `offset` lies
    /// behind its end.
    pub fn add_file(
        &mut self,
        filename: &Path,
        offset: u64,
        size: u64,
        asid: Asid,
        vaddr: u64,
    ) -> Result<(), Error> {
        let file = File::open(filename).map_err(|_| Error::Invalid)?;
        // SAFETY: the mapping is read-only and the file is caller-managed.
        let map = unsafe { Mmap::map(&file) }.map_err(|_| Error::Invalid)?;

        let file_size = map.len() as u64;
        if offset >= file_size {
            return Err(Error::Invalid);
        }
        let size = size.min(file_size - offset);
        if size == 0 {
            return Err(Error::Invalid);
        }

        let section = Section {
            filename: filename.to_owned(),
            map: Arc::new(map),
            offset,
            size,
            asid,
            vaddr,
        };
        if self.sections.iter().any(|have| have.overlaps(&section)) {
            return Err(Error::BadImage);
        }
        self.sections.push(section);
        Ok(())
    }

    /// Remove all sections loaded from `filename` into `asid`.
    ///
    /// Returns the number of removed sections.
    pub fn remove_by_filename(&mut self, filename: &Path, asid: &Asid) -> usize {
        let before = self.sections.len();
        self.sections
            .retain(|section| section.filename != filename || !section.asid.matches(asid));
        before - self.sections.len()
    }

    /// Remove all sections loaded into `asid`.
    ///
    /// Returns the number of removed sections.
    pub fn remove_by_asid(&mut self, asid: &Asid) -> usize {
        let before = self.sections.len();
        self.sections.retain(|section| !section.asid.matches(asid));
        before - self.sections.len()
    }

    /// Add all sections of `other`; sections that would overlap existing
    /// ones are skipped.
    ///
    /// Returns the number of skipped sections.
    pub fn copy_from(&mut self, other: &Image) -> usize {
        let mut ignored = 0;
        for section in &other.sections {
            if self.sections.iter().any(|have| have.overlaps(section)) {
                ignored += 1;
                continue;
            }
            self.sections.push(section.clone());
        }
        ignored
    }

    /// Install or remove the fallback for addresses outside any section.
    pub fn set_memory_callback(&mut self, callback: Option<Box<dyn ReadMemory>>) {
        self.read_fallback = callback;
    }

    /// Install or remove the lazy binary loading hook.
    pub fn set_new_cr3_callback(&mut self, callback: Option<Box<dyn ResolveCr3>>) {
        self.cr3_resolver = callback;
    }

    /// Read up to `buffer.len()` bytes from `asid` at `ip`.
    ///
    /// Sections are searched first, then the memory callback. Returns the
    /// number of bytes read or [`Error::Nomap`].
    pub fn read(&mut self, buffer: &mut [u8], asid: &Asid, ip: u64) -> Result<usize, Error> {
        if buffer.is_empty() {
            return Err(Error::Invalid);
        }
        if let Some(section) = self
            .sections
            .iter()
            .find(|section| section.contains(asid, ip))
        {
            return Ok(section.read(buffer, ip));
        }
        match self.read_fallback.as_mut() {
            Some(fallback) => fallback.read_memory(buffer, asid, ip),
            None => Err(Error::Nomap),
        }
    }

    /// Run the lazy binary loading hook for `cr3`.
    ///
    /// Returns whether a hook ran; the caller retries its lookup once.
    pub(crate) fn resolve_cr3(&mut self, cr3: u64, ip: u64) -> Result<bool, Error> {
        let Some(mut resolver) = self.cr3_resolver.take() else {
            return Ok(false);
        };
        let result = resolver.new_cr3(self, cr3, ip);
        // The hook may have installed a replacement for itself.
        if self.cr3_resolver.is_none() {
            self.cr3_resolver = Some(resolver);
        }
        result.map(|()| true)
    }
}

/// A reference-counted, internally locked [`Image`].
#[derive(Clone, Default)]
pub struct SharedImage(Arc<Mutex<Image>>);

impl SharedImage {
    /// Share `image`.
    #[must_use]
    pub fn new(image: Image) -> Self {
        SharedImage(Arc::new(Mutex::new(image)))
    }

    /// Lock the image for access.
    ///
    /// Fails with [`Error::BadLock`] if a previous user panicked while
    /// holding the lock.
    pub fn lock(&self) -> Result<MutexGuard<'_, Image>, Error> {
        self.0.lock().map_err(|_| Error::BadLock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// A file with known content, removed on drop.
    struct TempFile {
        path: PathBuf,
    }

    impl TempFile {
        fn with_bytes(tag: &str, bytes: &[u8]) -> Self {
            let mut path = std::env::temp_dir();
            path.push(format!("ptkit-image-test-{}-{tag}", std::process::id()));
            File::create(&path).unwrap().write_all(bytes).unwrap();
            TempFile { path }
        }
    }

    impl Drop for TempFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    #[test]
    fn reads_through_sections() {
        let file = TempFile::with_bytes("read", &[0x11, 0x22, 0x33, 0x44]);
        let mut image = Image::new(Some("test"));
        image
            .add_file(&file.path, 1, 2, Asid::new(0x1000), 0x40_0000)
            .unwrap();

        let mut buffer = [0u8; 4];
        let read = image
            .read(&mut buffer, &Asid::new(0x1000), 0x40_0001)
            .unwrap();
        assert_eq!(read, 1);
        assert_eq!(buffer[0], 0x33);

        assert_eq!(
            image.read(&mut buffer, &Asid::new(0x1000), 0x40_0002),
            Err(Error::Nomap)
        );
        assert_eq!(
            image.read(&mut buffer, &Asid::new(0x2000), 0x40_0000),
            Err(Error::Nomap)
        );
        // The wildcard identifier matches any recorded address space.
        assert!(image
            .read(&mut buffer, &Asid::unknown(), 0x40_0000)
            .is_ok());
    }

    #[test]
    fn sections_are_truncated_to_the_file() {
        let file = TempFile::with_bytes("truncate", &[0xaa; 8]);
        let mut image = Image::new(None);
        image
            .add_file(&file.path, 4, 100, Asid::unknown(), 0x1000)
            .unwrap();

        let mut buffer = [0u8; 16];
        let read = image.read(&mut buffer, &Asid::unknown(), 0x1000).unwrap();
        assert_eq!(read, 4);
    }

    #[test]
    fn overlapping_sections_are_rejected() {
        let file = TempFile::with_bytes("overlap", &[0u8; 64]);
        let mut image = Image::new(None);
        image
            .add_file(&file.path, 0, 64, Asid::new(1), 0x1000)
            .unwrap();
        assert_eq!(
            image.add_file(&file.path, 0, 64, Asid::new(1), 0x1020),
            Err(Error::BadImage)
        );
        // A different address space does not overlap.
        image
            .add_file(&file.path, 0, 64, Asid::new(2), 0x1020)
            .unwrap();
    }

    #[test]
    fn removal_counts_sections() {
        let file = TempFile::with_bytes("remove", &[0u8; 16]);
        let mut image = Image::new(None);
        image
            .add_file(&file.path, 0, 16, Asid::new(1), 0x1000)
            .unwrap();
        image
            .add_file(&file.path, 0, 16, Asid::new(2), 0x1000)
            .unwrap();

        assert_eq!(image.remove_by_asid(&Asid::new(1)), 1);
        assert_eq!(image.remove_by_filename(&file.path, &Asid::unknown()), 1);
        assert_eq!(image.remove_by_filename(&file.path, &Asid::unknown()), 0);
    }

    #[test]
    fn copy_counts_ignored_overlaps() {
        let file = TempFile::with_bytes("copy", &[0u8; 32]);
        let mut first = Image::new(None);
        first
            .add_file(&file.path, 0, 16, Asid::new(1), 0x1000)
            .unwrap();
        first
            .add_file(&file.path, 16, 16, Asid::new(1), 0x2000)
            .unwrap();

        let mut second = Image::new(None);
        second
            .add_file(&file.path, 0, 16, Asid::new(1), 0x1008)
            .unwrap();

        assert_eq!(second.copy_from(&first), 1);
        let mut buffer = [0u8; 1];
        assert!(second.read(&mut buffer, &Asid::new(1), 0x2000).is_ok());
    }

    #[test]
    fn callback_covers_unmapped_memory() {
        struct Backing;
        impl ReadMemory for Backing {
            fn read_memory(
                &mut self,
                buffer: &mut [u8],
                _asid: &Asid,
                ip: u64,
            ) -> Result<usize, Error> {
                if ip == 0x9000 {
                    buffer[0] = 0x90;
                    Ok(1)
                } else {
                    Err(Error::Nomap)
                }
            }
        }

        let mut image = Image::new(None);
        image.set_memory_callback(Some(Box::new(Backing)));

        let mut buffer = [0u8; 1];
        assert_eq!(image.read(&mut buffer, &Asid::unknown(), 0x9000), Ok(1));
        assert_eq!(buffer[0], 0x90);
        assert_eq!(
            image.read(&mut buffer, &Asid::unknown(), 0x9001),
            Err(Error::Nomap)
        );

        image.set_memory_callback(None);
        assert_eq!(
            image.read(&mut buffer, &Asid::unknown(), 0x9000),
            Err(Error::Nomap)
        );
    }
}
