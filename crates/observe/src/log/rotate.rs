use flate2::{Compression, write::GzEncoder};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// When and how a log file is rotated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    /// Size in bytes after which the next write rotates. `0` never rotates.
    pub max_size: u64,
    /// Number of backups kept next to the live file. With `0` a rotation
    /// just truncates.
    pub backup_count: u32,
    /// Gzip every backup except the newest one.
    pub compress: bool,
}

/// Path of backup number `index` for the live file at `path`:
/// `app.log.1`, `app.log.2.gz`, ...
pub fn backup_path(path: &Path, index: u32, compressed: bool) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{index}"));
    if compressed {
        name.push(".gz");
    }
    PathBuf::from(name)
}

/// An append-only file that moves itself aside once it grows past the
/// policy's size.
///
/// Writes are whole records: a record never straddles two files.
#[derive(Debug)]
pub(crate) struct RotatingFile {
    path: PathBuf,
    policy: RotationPolicy,
    file: Option<File>,
    size: u64,
}

impl RotatingFile {
    pub fn open(path: PathBuf, policy: RotationPolicy) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self { path, policy, file: Some(file), size })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_record(&mut self, record: &[u8]) -> io::Result<()> {
        let limit = self.policy.max_size;
        if limit > 0 && self.size > 0 && self.size + record.len() as u64 > limit {
            self.rotate()?;
        }
        let file = match self.file.take() {
            Some(file) => file,
            None => OpenOptions::new().create(true).append(true).open(&self.path)?,
        };
        let file = self.file.insert(file);
        file.write_all(record)?;
        self.size += record.len() as u64;
        Ok(())
    }

    /// Shift every backup up by one, dropping the oldest, and start a fresh
    /// live file.
    pub fn rotate(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        let count = self.policy.backup_count;
        if count > 0 {
            for compressed in [false, true] {
                remove_if_exists(&backup_path(&self.path, count, compressed))?;
            }
            for index in (1..count).rev() {
                for compressed in [false, true] {
                    let from = backup_path(&self.path, index, compressed);
                    if from.exists() {
                        fs::rename(&from, backup_path(&self.path, index + 1, compressed))?;
                    }
                }
            }
            if self.path.exists() {
                fs::rename(&self.path, backup_path(&self.path, 1, false))?;
            }
            let second = backup_path(&self.path, 2, false);
            if self.policy.compress && second.exists() {
                gzip(&second, &backup_path(&self.path, 2, true))?;
                fs::remove_file(&second)?;
            }
        }
        self.truncate()?;
        tracing::debug!(path = %self.path.display(), backups = count, "rotated log file");
        Ok(())
    }

    /// Empty the live file without touching any backup.
    pub fn truncate(&mut self) -> io::Result<()> {
        self.file = Some(OpenOptions::new().create(true).write(true).truncate(true).open(&self.path)?);
        self.size = 0;
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn gzip(from: &Path, to: &Path) -> io::Result<()> {
    let mut encoder = GzEncoder::new(File::create(to)?, Compression::default());
    io::copy(&mut File::open(from)?, &mut encoder)?;
    encoder.finish()?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    fn policy(max_size: u64, backup_count: u32, compress: bool) -> RotationPolicy {
        RotationPolicy { max_size, backup_count, compress }
    }

    #[test]
    fn test_rotates_when_full() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs/general_app.log");
        let mut file = RotatingFile::open(path.clone(), policy(10, 2, false)).unwrap();
        file.write_record(b"first 01\n").unwrap();
        file.write_record(b"second 2\n").unwrap();
        file.write_record(b"third 03\n").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "third 03\n");
        assert_eq!(fs::read_to_string(backup_path(&path, 1, false)).unwrap(), "second 2\n");
        assert_eq!(fs::read_to_string(backup_path(&path, 2, false)).unwrap(), "first 01\n");
    }

    #[test]
    fn test_oldest_backup_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        let mut file = RotatingFile::open(path.clone(), policy(0, 2, false)).unwrap();
        for line in ["a\n", "b\n", "c\n", "d\n"] {
            file.write_record(line.as_bytes()).unwrap();
            file.rotate().unwrap();
        }
        assert_eq!(fs::read_to_string(backup_path(&path, 1, false)).unwrap(), "d\n");
        assert_eq!(fs::read_to_string(backup_path(&path, 2, false)).unwrap(), "c\n");
        assert!(!backup_path(&path, 3, false).exists());
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn test_older_backups_are_compressed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        let mut file = RotatingFile::open(path.clone(), policy(0, 3, true)).unwrap();
        for line in ["one\n", "two\n", "three\n"] {
            file.write_record(line.as_bytes()).unwrap();
            file.rotate().unwrap();
        }
        assert_eq!(fs::read_to_string(backup_path(&path, 1, false)).unwrap(), "three\n");
        assert!(!backup_path(&path, 2, false).exists());

        let mut text = String::new();
        GzDecoder::new(File::open(backup_path(&path, 3, true)).unwrap()).read_to_string(&mut text).unwrap();
        assert_eq!(text, "one\n");
    }

    #[test]
    fn test_no_backups_truncates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        let mut file = RotatingFile::open(path.clone(), policy(4, 0, false)).unwrap();
        file.write_record(b"abc\n").unwrap();
        file.write_record(b"def\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "def\n");
        assert!(!backup_path(&path, 1, false).exists());
    }

    #[test]
    fn test_reopen_keeps_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        RotatingFile::open(path.clone(), policy(8, 1, false)).unwrap().write_record(b"12345\n").unwrap();
        let mut file = RotatingFile::open(path.clone(), policy(8, 1, false)).unwrap();
        file.write_record(b"678\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "678\n");
        assert_eq!(fs::read_to_string(backup_path(&path, 1, false)).unwrap(), "12345\n");
    }
}
