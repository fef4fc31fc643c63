use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use log::trace;

use super::traits::{IOResult, StorageIO};

/// File-backed storage.
pub struct LocalStorageProvider {
    file: File,
    file_path: PathBuf,
    file_len: u64,
}

impl LocalStorageProvider {
    /// Creates (or truncates) `location/name`, creating `location` if needed.
    pub fn create(location: &Path, name: &str) -> IOResult<LocalStorageProvider> {
        if !location.exists() {
            fs::create_dir_all(location)?;
        }

        let file_path = location.join(name);

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&file_path)?;

        trace!("Created {}", file_path.display());

        Ok(Self::from_file(file, file_path, 0))
    }

    /// Opens an existing file for reading and writing.
    pub fn open(file_path: &Path) -> IOResult<LocalStorageProvider> {
        let file = OpenOptions::new().read(true).write(true).open(file_path)?;
        let file_len = file.metadata()?.len();

        Ok(Self::from_file(file, file_path.to_path_buf(), file_len))
    }

    fn from_file(file: File, file_path: PathBuf, file_len: u64) -> LocalStorageProvider {
        LocalStorageProvider {
            file,
            file_path,
            file_len,
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }
}

impl StorageIO for LocalStorageProvider {
    fn write_data(&mut self, position: u64, buffer: &[u8]) -> IOResult<()> {
        self.file.seek(SeekFrom::Start(position))?;
        self.file.write_all(buffer)?;
        self.file_len = self.file_len.max(position + buffer.len() as u64);
        Ok(())
    }

    fn read_data_into_buffer(&mut self, position: &mut u64, buffer: &mut [u8]) -> IOResult<()> {
        self.file.seek(SeekFrom::Start(*position))?;
        self.file.read_exact(buffer)?;
        *position += buffer.len() as u64;
        Ok(())
    }

    fn append_data(&mut self, buffer: &[u8]) -> IOResult<()> {
        let position = self.file_len;
        self.write_data(position, buffer)
    }

    fn get_len(&mut self) -> IOResult<u64> {
        Ok(self.file_len)
    }

    fn flush(&mut self) -> IOResult<()> {
        self.file.flush()
    }

    fn get_location(&self) -> Option<String> {
        Some(self.file_path.to_string_lossy().into_owned())
    }

    fn drop_io(&mut self) -> IOResult<()> {
        self.file_len = 0;
        fs::remove_file(&self.file_path)
    }
}

#[cfg(test)]
mod tests {
    use temp_testdir::TempDir;

    use super::*;

    #[test]
    fn test_write_append_read() {
        let temp = TempDir::default();
        let mut io = LocalStorageProvider::create(temp.as_ref(), "data.bin").unwrap();

        io.append_data(&[1, 2, 3]).unwrap();
        io.append_data(&[4, 5]).unwrap();
        io.write_data(1, &[9]).unwrap();
        io.flush().unwrap();
        assert_eq!(io.get_len().unwrap(), 5);

        let mut position = 0;
        assert_eq!(io.read_data(&mut position, 5).unwrap(), vec![1, 9, 3, 4, 5]);
        assert_eq!(position, 5);

        let mut position = 4;
        assert!(io.read_data(&mut position, 2).is_err());

        let path = io.path().to_path_buf();
        let mut reopened = LocalStorageProvider::open(&path).unwrap();
        assert_eq!(reopened.get_len().unwrap(), 5);

        reopened.drop_io().unwrap();
        assert!(!path.exists());
    }
}
