//! File-backed block device
//!
//! One image file per layer. Positional I/O is done with seek + read/write
//! under a mutex; reads past the end of the file return zeros so a freshly
//! created image behaves like a zero-filled disk of its declared size.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use livemerge_core::{BlockDevice, LayerLocation};
use parking_lot::Mutex;

/// Image file with positional I/O
#[derive(Debug)]
pub struct FileDevice {
    location: LayerLocation,
    path: PathBuf,
    file: Mutex<File>,
}

impl FileDevice {
    /// Create (or truncate) an image file of `len` bytes
    pub fn create(path: &Path, len: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;
        Ok(Self::from_file(path, file))
    }

    /// Open an existing image file
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self::from_file(path, file))
    }

    fn from_file(path: &Path, file: File) -> Self {
        Self {
            location: LayerLocation::File(path.to_path_buf()),
            path: path.to_path_buf(),
            file: Mutex::new(file),
        }
    }

    /// Path of the image file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf[filled..].fill(0);
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)
    }

    fn len(&self) -> u64 {
        self.file.lock().metadata().map(|m| m.len()).unwrap_or(0)
    }

    fn resize(&self, new_len: u64) -> io::Result<()> {
        self.file.lock().set_len(new_len)
    }

    fn flush(&self) -> io::Result<()> {
        self.file.lock().sync_data()
    }

    fn location(&self) -> &LayerLocation {
        &self.location
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_sets_length() {
        let dir = TempDir::new().unwrap();
        let dev = FileDevice::create(&dir.path().join("BASE.img"), 4096).unwrap();
        assert_eq!(dev.len(), 4096);
        assert_eq!(
            dev.location(),
            &LayerLocation::File(dir.path().join("BASE.img"))
        );
    }

    #[test]
    fn test_read_write_round_trip() {
        let dir = TempDir::new().unwrap();
        let dev = FileDevice::create(&dir.path().join("S1.img"), 8192).unwrap();
        dev.write_at(1024, &[2u8; 2048]).unwrap();

        let mut buf = vec![0u8; 4096];
        dev.read_at(0, &mut buf).unwrap();
        assert!(buf[..1024].iter().all(|b| *b == 0));
        assert!(buf[1024..3072].iter().all(|b| *b == 2));
        assert!(buf[3072..].iter().all(|b| *b == 0));
        dev.flush().unwrap();
    }

    #[test]
    fn test_read_past_end_is_zero() {
        let dir = TempDir::new().unwrap();
        let dev = FileDevice::create(&dir.path().join("S2.img"), 512).unwrap();
        dev.write_at(0, &[9u8; 512]).unwrap();
        let mut buf = vec![0xFFu8; 1024];
        dev.read_at(0, &mut buf).unwrap();
        assert!(buf[..512].iter().all(|b| *b == 9));
        assert!(buf[512..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_reopen_preserves_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("BASE.img");
        {
            let dev = FileDevice::create(&path, 4096).unwrap();
            dev.write_at(512, b"pattern").unwrap();
            dev.flush().unwrap();
        }
        let dev = FileDevice::open(&path).unwrap();
        let mut buf = [0u8; 7];
        dev.read_at(512, &mut buf).unwrap();
        assert_eq!(&buf, b"pattern");
    }
}
