use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Component, Path, PathBuf},
};

use log::debug;
use sleepy_core::host::{FileSystem, FsError};

/// Device paths such as `/usr/sleepData.dat` mapped under a host directory.
#[derive(Debug, Clone)]
pub struct PosixFileSystem {
    root: PathBuf,
}

impl PosixFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Only normal components are kept, so `..` cannot leave the root.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let mut resolved = self.root.clone();
        for component in Path::new(path).components() {
            if let Component::Normal(part) = component {
                resolved.push(part);
            }
        }
        resolved
    }

    fn resolve_for_write(&self, path: &str) -> Result<PathBuf, FsError> {
        let resolved = self.resolve(path);
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(resolved)
    }
}

impl FileSystem for PosixFileSystem {
    fn read_at(&self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        let mut file = File::open(self.resolve(path))?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(file.read(buf)?)
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<(), FsError> {
        let resolved = self.resolve_for_write(path)?;
        fs::write(&resolved, data)?;
        debug!("fs: wrote {} bytes to {}", data.len(), resolved.display());
        Ok(())
    }

    fn append(&self, path: &str, data: &[u8]) -> Result<(), FsError> {
        let resolved = self.resolve_for_write(path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(resolved)?;
        file.write_all(data)?;
        Ok(())
    }

    fn size(&self, path: &str) -> Result<u64, FsError> {
        Ok(fs::metadata(self.resolve(path))?.len())
    }

    fn remove(&self, path: &str) -> Result<(), FsError> {
        Ok(fs::remove_file(self.resolve(path))?)
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        let target = self.resolve_for_write(to)?;
        Ok(fs::rename(self.resolve(from), target)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (tempfile::TempDir, PosixFileSystem) {
        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(err) => panic!("tempdir: {}", err),
        };
        let fs = PosixFileSystem::new(dir.path());
        (dir, fs)
    }

    #[test]
    fn device_paths_stay_under_root() {
        let (dir, fs) = scratch();
        assert_eq!(fs.resolve("/usr/sleepData.dat"), dir.path().join("usr/sleepData.dat"));
        assert_eq!(fs.resolve("/usr/../../etc/passwd"), dir.path().join("usr/etc/passwd"));
    }

    #[test]
    fn write_append_and_read_back() {
        let (_dir, fs) = scratch();
        assert_eq!(fs.write("/usr/events.txt", b"{\"a\":1}\n"), Ok(()));
        assert_eq!(fs.append("/usr/events.txt", b"{\"b\":2}\n"), Ok(()));
        assert_eq!(fs.size("/usr/events.txt"), Ok(16));

        let mut buf = [0u8; 8];
        assert_eq!(fs.read_at("/usr/events.txt", 8, &mut buf), Ok(8));
        assert_eq!(&buf, b"{\"b\":2}\n");
        assert_eq!(fs.read_at("/usr/events.txt", 16, &mut buf), Ok(0));
        assert_eq!(fs.read_prefix("/usr/events.txt", 4), Ok(b"{\"a\"".to_vec()));
    }

    #[test]
    fn append_creates_missing_file() {
        let (_dir, fs) = scratch();
        assert_eq!(fs.append("/usr/new.txt", b"x"), Ok(()));
        assert_eq!(fs.size("/usr/new.txt"), Ok(1));
    }

    #[test]
    fn missing_files_report_not_found() {
        let (_dir, fs) = scratch();
        let mut buf = [0u8; 4];
        assert_eq!(fs.read_at("/usr/none", 0, &mut buf), Err(FsError::NotFound));
        assert_eq!(fs.size("/usr/none"), Err(FsError::NotFound));
        assert_eq!(fs.remove("/usr/none"), Err(FsError::NotFound));
    }

    #[test]
    fn rename_replaces_target() {
        let (_dir, fs) = scratch();
        assert_eq!(fs.write("/usr/a.tmp", b"new"), Ok(()));
        assert_eq!(fs.write("/usr/a.txt", b"old contents"), Ok(()));
        assert_eq!(fs.rename("/usr/a.tmp", "/usr/a.txt"), Ok(()));
        assert_eq!(fs.size("/usr/a.txt"), Ok(3));
        assert_eq!(fs.size("/usr/a.tmp"), Err(FsError::NotFound));
    }
}
