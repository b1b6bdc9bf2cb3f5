//! Abstractions to access a raw flash image.
//!
//! Every layer reads through [ImageSource], which only needs positional reads of a finite byte
//! range. The whole image never has to be resident: a [FileImage] serves each read with a single
//! positional `read`, while byte slices (owned, borrowed, or memory-mapped by the caller) are
//! served directly.

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

/// Convenience methods for operating on `[u8]`s that represent flash contents
pub trait PageUtil {
    /// Does this region contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A seekable, finite, read-only byte source.
///
/// `read_at` takes `&self`, so one source can be shared by several threads as long as the
/// implementation does not keep a shared cursor.
pub trait ImageSource {
    /// Total size of the image in bytes
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill `buf` with the bytes starting at `offset`; reading past the end is an
    /// `UnexpectedEof` error.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
}

impl ImageSource for [u8] {
    fn len(&self) -> u64 {
        <[u8]>::len(self) as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let src = usize::try_from(offset)
            .ok()
            .and_then(|start| self.get(start..start.checked_add(buf.len())?))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("read of {} bytes at {offset:#x} past end of image", buf.len()),
                )
            })?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

impl ImageSource for Vec<u8> {
    fn len(&self) -> u64 {
        self.as_slice().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.as_slice().read_at(offset, buf)
    }
}

impl<T: ImageSource + ?Sized> ImageSource for &T {
    fn len(&self) -> u64 {
        (**self).len()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_at(offset, buf)
    }
}

impl<T: ImageSource + ?Sized> ImageSource for Arc<T> {
    fn len(&self) -> u64 {
        (**self).len()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_at(offset, buf)
    }
}

/// An image file accessed with positional reads
#[derive(Debug)]
pub struct FileImage {
    #[cfg(unix)]
    file: File,

    #[cfg(not(unix))]
    file: std::sync::Mutex<File>,

    len: u64,
}

impl FileImage {
    /// Wrap an already-open file; its current length is taken as the image size.
    pub fn new(file: File) -> io::Result<Self> {
        let len = file.metadata()?.len();

        #[cfg(not(unix))]
        let file = std::sync::Mutex::new(file);

        Ok(Self { file, len })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::new(File::open(path)?)
    }
}

impl ImageSource for FileImage {
    fn len(&self) -> u64 {
        self.len
    }

    #[cfg(unix)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;

        self.file.read_exact_at(buf, offset)
    }

    #[cfg(not(unix))]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        use std::io::{Read, Seek, SeekFrom};

        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "image file lock poisoned"))?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }
}

#[test]
fn test_slice_source() {
    let image: Vec<u8> = (0..64u8).collect();

    let mut buf = [0u8; 4];
    image.read_at(8, &mut buf).unwrap();
    assert_eq!(buf, [8, 9, 10, 11]);

    assert!(image.read_at(62, &mut buf).is_err());
    assert!(image.read_at(u64::MAX, &mut buf).is_err());
    assert_eq!(ImageSource::len(&image), 64);
}

#[test]
fn test_file_source() -> anyhow::Result<()> {
    use std::io::Write;

    let path = std::env::temp_dir().join(format!("ubifs-reader-{}.img", std::process::id()));
    File::create(&path)?.write_all(&[0xFF; 100])?;

    let image = FileImage::open(&path)?;
    let mut buf = [0u8; 10];
    image.read_at(90, &mut buf)?;
    assert!(buf.is_erased());
    assert!(image.read_at(95, &mut buf).is_err());
    assert_eq!(image.len(), 100);

    std::fs::remove_file(&path)?;
    Ok(())
}
