use std::{
    io::{self, ErrorKind},
    sync::{Arc, RwLock},
};

use super::traits::{IOResult, StorageIO};

/// In-memory storage. Clones share the same bytes.
#[derive(Clone, Default)]
pub struct MemoryStorageProvider {
    vec: Arc<RwLock<Vec<u8>>>,
}

impl MemoryStorageProvider {
    pub fn new() -> MemoryStorageProvider {
        MemoryStorageProvider::default()
    }
}

fn poisoned() -> io::Error {
    io::Error::other("memory storage lock poisoned")
}

impl StorageIO for MemoryStorageProvider {
    fn write_data(&mut self, position: u64, buffer: &[u8]) -> IOResult<()> {
        let mut vec = self.vec.write().map_err(|_| poisoned())?;
        let start = position as usize;
        let end = start + buffer.len();

        if vec.len() < end {
            vec.resize(end, 0);
        }

        vec[start..end].copy_from_slice(buffer);
        Ok(())
    }

    fn read_data_into_buffer(&mut self, position: &mut u64, buffer: &mut [u8]) -> IOResult<()> {
        let vec = self.vec.read().map_err(|_| poisoned())?;
        let start = *position as usize;
        let end = start + buffer.len();

        if end > vec.len() {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("read of {}..{} past {} bytes", start, end, vec.len()),
            ));
        }

        buffer.copy_from_slice(&vec[start..end]);
        *position += buffer.len() as u64;
        Ok(())
    }

    fn append_data(&mut self, buffer: &[u8]) -> IOResult<()> {
        self.vec.write().map_err(|_| poisoned())?.extend_from_slice(buffer);
        Ok(())
    }

    fn get_len(&mut self) -> IOResult<u64> {
        Ok(self.vec.read().map_err(|_| poisoned())?.len() as u64)
    }

    fn flush(&mut self) -> IOResult<()> {
        Ok(())
    }

    fn get_location(&self) -> Option<String> {
        None
    }

    fn drop_io(&mut self) -> IOResult<()> {
        self.vec.write().map_err(|_| poisoned())?.clear();
        Ok(())
    }
}
