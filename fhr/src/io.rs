//! Positional volume abstraction over the platform file layer. The engine
//! only ever touches storage through absolute-offset reads and writes plus an
//! explicit durability barrier, so the whole region machinery can run against
//! a plain file or an in-memory buffer alike.

use std::fs::File;
use std::io;
use std::sync::Mutex;


/// A storage volume addressed by absolute byte offsets. Reads and writes take
/// a shared reference so that concurrent readers of the same underlying file
/// don't need exclusive access.
pub trait Volume {

    /// Read exactly `buf.len()` bytes starting at `offset`.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    /// Write all of `buf` starting at `offset`, extending the volume if the
    /// range lies past the current end.
    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;

    /// Block until every previous write has reached stable storage.
    fn sync(&self) -> io::Result<()>;

    /// Current length of the volume in bytes.
    fn len(&self) -> io::Result<u64>;

}


/// A volume backed by a regular file, using the platform's positional I/O so
/// that readers never contend on a shared cursor.
pub struct FileVolume {
    file: File,
}

impl FileVolume {

    pub fn new(file: File) -> Self {
        Self { file }
    }

}

#[cfg(unix)]
impl Volume for FileVolume {

    #[inline]
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        std::os::unix::fs::FileExt::read_exact_at(&self.file, buf, offset)
    }

    #[inline]
    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        std::os::unix::fs::FileExt::write_all_at(&self.file, buf, offset)
    }

    #[inline]
    fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    #[inline]
    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

}

#[cfg(windows)]
impl Volume for FileVolume {

    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            match self.file.seek_read(buf, offset) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn write_all_at(&self, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            match self.file.seek_write(buf, offset) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    #[inline]
    fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    #[inline]
    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

}


/// A growable in-memory volume. This is mostly useful to unit-test the region
/// file machinery without touching the file system, including crash
/// simulations that corrupt specific bytes between commits.
#[derive(Default)]
pub struct MemVolume {
    data: Mutex<Vec<u8>>,
}

impl MemVolume {

    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data: Mutex::new(data) }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data.into_inner().unwrap_or_default()
    }

}

impl Volume for MemVolume {

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let data = self.data.lock().unwrap();
        let start = offset as usize;
        let end = start.checked_add(buf.len())
            .ok_or(io::ErrorKind::InvalidInput)?;
        if end > data.len() {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut data = self.data.lock().unwrap();
        let start = offset as usize;
        let end = start.checked_add(buf.len())
            .ok_or(io::ErrorKind::InvalidInput)?;
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.data.lock().unwrap().len() as u64)
    }

}
