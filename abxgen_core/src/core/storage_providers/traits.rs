pub type IOError = std::io::Error;
pub type IOResult<T> = std::result::Result<T, IOError>;

/// Byte storage backing a dataset.
pub trait StorageIO: Send + Sync + 'static {
    fn write_data(&mut self, position: u64, buffer: &[u8]) -> IOResult<()>;

    /// Reads `length` bytes at `position` and advances it.
    fn read_data(&mut self, position: &mut u64, length: u32) -> IOResult<Vec<u8>> {
        let mut buffer = vec![0; length as usize];
        self.read_data_into_buffer(position, &mut buffer)?;
        Ok(buffer)
    }

    /// Fills `buffer` from `position` and advances it. Fails with
    /// `UnexpectedEof` when the storage is too short.
    fn read_data_into_buffer(&mut self, position: &mut u64, buffer: &mut [u8]) -> IOResult<()>;

    fn append_data(&mut self, buffer: &[u8]) -> IOResult<()>;

    fn get_len(&mut self) -> IOResult<u64>;

    fn flush(&mut self) -> IOResult<()>;

    fn get_location(&self) -> Option<String>;

    /// Releases the backing storage.
    fn drop_io(&mut self) -> IOResult<()>;
}
