//! Fixed-width integer datasets.
//!
//! Layout: a 32 byte header followed by little-endian rows of
//! `columns` values of `item_type`.
//!
//! ```text
//! 0..4    magic "ABXD"
//! 4       version
//! 5       item type byte
//! 6..8    reserved
//! 8..12   column count (u32)
//! 12..20  row count (u64)
//! 20..24  CRC-32 of bytes 0..20
//! 24..32  reserved
//! ```

use byteorder::{ByteOrder, LittleEndian};
use log::trace;

use crate::{
    READ_BATCH_SIZE, WRITE_BATCH_SIZE,
    core::{
        error::{AbxError, Result},
        type_fitting::IntType,
    },
};

use super::{CRC, traits::StorageIO};

pub const DATASET_MAGIC: &[u8; 4] = b"ABXD";
pub const DATASET_VERSION: u8 = 1;
pub const HEADER_SIZE: u64 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetHeader {
    pub item_type: IntType,
    pub columns: u32,
    pub rows: u64,
}

impl DatasetHeader {
    pub fn row_size(&self) -> usize {
        self.columns as usize * self.item_type.size()
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE as usize] {
        let mut bytes = [0u8; HEADER_SIZE as usize];
        bytes[0..4].copy_from_slice(DATASET_MAGIC);
        bytes[4] = DATASET_VERSION;
        bytes[5] = self.item_type.to_byte();
        LittleEndian::write_u32(&mut bytes[8..12], self.columns);
        LittleEndian::write_u64(&mut bytes[12..20], self.rows);
        let crc = CRC.checksum(&bytes[0..20]);
        LittleEndian::write_u32(&mut bytes[20..24], crc);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<DatasetHeader> {
        if bytes.len() < HEADER_SIZE as usize || &bytes[0..4] != DATASET_MAGIC {
            return Err(AbxError::InvalidData("not a dataset".to_string()));
        }

        if bytes[4] != DATASET_VERSION {
            return Err(AbxError::InvalidData(format!("unsupported dataset version {}", bytes[4])));
        }

        let crc = LittleEndian::read_u32(&bytes[20..24]);
        if crc != CRC.checksum(&bytes[0..20]) {
            return Err(AbxError::InvalidData("dataset header checksum mismatch".to_string()));
        }

        let item_type = IntType::from_byte(bytes[5])
            .ok_or_else(|| AbxError::InvalidData(format!("unknown item type byte {}", bytes[5])))?;

        let columns = LittleEndian::read_u32(&bytes[8..12]);
        if columns == 0 {
            return Err(AbxError::InvalidData("dataset has no columns".to_string()));
        }

        Ok(DatasetHeader {
            item_type,
            columns,
            rows: LittleEndian::read_u64(&bytes[12..20]),
        })
    }
}

/// Buffered, append-only dataset writer. Rows land in call order; the row
/// count is fixed by [`DatasetWriter::finish`].
pub struct DatasetWriter<S: StorageIO> {
    io: S,
    header: DatasetHeader,
    buffer: Vec<u8>,
    batch_bytes: usize,
}

impl<S: StorageIO> DatasetWriter<S> {
    pub fn new(mut io: S, columns: usize, item_type: IntType, row_capacity_hint: u64) -> Result<Self> {
        if columns == 0 {
            return Err(AbxError::InvalidData("dataset needs at least one column".to_string()));
        }

        let header = DatasetHeader {
            item_type,
            columns: columns as u32,
            rows: 0,
        };

        io.write_data(0, &header.to_bytes())?;

        let capacity = (row_capacity_hint as usize)
            .saturating_mul(header.row_size())
            .min(WRITE_BATCH_SIZE);

        Ok(Self {
            io,
            header,
            buffer: Vec::with_capacity(capacity),
            batch_bytes: WRITE_BATCH_SIZE,
        })
    }

    /// Caps the bytes buffered before they reach storage.
    pub fn set_batch_bytes(&mut self, batch_bytes: usize) -> Result<()> {
        self.batch_bytes = batch_bytes.max(1);

        if self.buffer.len() >= self.batch_bytes {
            self.flush_buffer()?;
        }
        self.buffer.shrink_to(self.batch_bytes);

        Ok(())
    }

    pub fn columns(&self) -> usize {
        self.header.columns as usize
    }

    pub fn item_type(&self) -> IntType {
        self.header.item_type
    }

    /// Rows appended so far.
    pub fn rows(&self) -> u64 {
        self.header.rows
    }

    /// Appends row-major `values`.
    pub fn append(&mut self, values: &[u64]) -> Result<()> {
        let columns = self.columns();

        if values.len() % columns != 0 {
            return Err(AbxError::InvalidData(format!(
                "{} values do not fill rows of {} columns",
                values.len(),
                columns
            )));
        }

        let item_size = self.header.item_type.size();
        let mut rest = values;

        while !rest.is_empty() {
            let room = (self.batch_bytes.saturating_sub(self.buffer.len()) / item_size).clamp(1, rest.len());
            let (piece, tail) = rest.split_at(room);

            self.reserve(piece.len() * item_size);
            self.header.item_type.encode_into(piece, &mut self.buffer);
            rest = tail;

            if self.buffer.len() >= self.batch_bytes {
                self.flush_buffer()?;
            }
        }

        self.header.rows += (values.len() / columns) as u64;

        Ok(())
    }

    /// Grows the buffer geometrically, never past the batch size.
    fn reserve(&mut self, additional: usize) {
        let needed = self.buffer.len() + additional;

        if needed > self.buffer.capacity() {
            let target = needed.max((self.buffer.capacity() * 2).min(self.batch_bytes));
            self.buffer.reserve_exact(target - self.buffer.len());
        }
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.io.append_data(&self.buffer)?;
            self.buffer.clear();
        }
        Ok(())
    }

    /// Flushes pending rows and writes the final row count. Returns it.
    pub fn finish(mut self) -> Result<u64> {
        self.flush_buffer()?;
        self.io.write_data(0, &self.header.to_bytes())?;
        self.io.flush()?;

        trace!(
            "Finished dataset {:?} with {} rows",
            self.io.get_location(),
            self.header.rows
        );

        Ok(self.header.rows)
    }
}

/// Streams a dataset back in chunks of `chunk_rows` rows.
pub struct DatasetReader<S: StorageIO> {
    io: S,
    header: DatasetHeader,
    next_row: u64,
    chunk_rows: usize,
    scratch: Vec<u8>,
    batch_bytes: usize,
}

impl<S: StorageIO> DatasetReader<S> {
    pub fn new(mut io: S, chunk_rows: usize) -> Result<Self> {
        let mut position = 0;
        let bytes = io.read_data(&mut position, HEADER_SIZE as u32).map_err(|e| {
            AbxError::InvalidData(format!("cannot read dataset header: {}", e))
        })?;
        let header = DatasetHeader::from_bytes(&bytes)?;

        let expected = HEADER_SIZE + header.rows * header.row_size() as u64;
        let len = io.get_len()?;
        if len < expected {
            return Err(AbxError::InvalidData(format!(
                "dataset holds {} bytes, header announces {}",
                len, expected
            )));
        }

        Ok(Self {
            io,
            header,
            next_row: 0,
            chunk_rows: chunk_rows.max(1),
            scratch: Vec::new(),
            batch_bytes: READ_BATCH_SIZE,
        })
    }

    pub fn rows(&self) -> u64 {
        self.header.rows
    }

    pub fn columns(&self) -> usize {
        self.header.columns as usize
    }

    pub fn item_type(&self) -> IntType {
        self.header.item_type
    }

    pub fn set_chunk_rows(&mut self, chunk_rows: usize) {
        self.chunk_rows = chunk_rows.max(1);
    }

    /// Caps the raw bytes held while decoding a chunk. At least one row is
    /// fetched at a time.
    pub fn set_batch_bytes(&mut self, batch_bytes: usize) {
        self.batch_bytes = batch_bytes.max(1);
        self.scratch = Vec::new();
    }

    /// Moves the cursor to `row`.
    pub fn seek_row(&mut self, row: u64) {
        self.next_row = row.min(self.header.rows);
    }

    /// Next chunk of row-major values, `None` at end of stream.
    pub fn read(&mut self) -> Result<Option<Vec<u64>>> {
        let mut values = Vec::new();

        match self.read_into(&mut values)? {
            0 => Ok(None),
            _ => Ok(Some(values)),
        }
    }

    /// Replaces the content of `values` with the next chunk and returns its
    /// row count, 0 at end of stream. The capacity of `values` is reused.
    pub fn read_into(&mut self, values: &mut Vec<u64>) -> Result<usize> {
        values.clear();

        let remaining = self.header.rows - self.next_row;
        if remaining == 0 {
            return Ok(0);
        }

        let rows = remaining.min(self.chunk_rows as u64);
        let row_size = self.header.row_size();
        let rows_per_batch = (self.batch_bytes / row_size).max(1) as u64;

        values.reserve_exact(rows as usize * self.columns());

        let mut left = rows;
        while left > 0 {
            let batch = left.min(rows_per_batch);
            let len = batch as usize * row_size;

            self.scratch.clear();
            self.scratch.reserve_exact(len);
            self.scratch.resize(len, 0);

            let mut position = HEADER_SIZE + self.next_row * row_size as u64;
            self.io.read_data_into_buffer(&mut position, &mut self.scratch)?;
            self.header.item_type.decode_into(&self.scratch, values);

            self.next_row += batch;
            left -= batch;
        }

        Ok(rows as usize)
    }

    /// Every remaining value.
    pub fn read_all(&mut self) -> Result<Vec<u64>> {
        let mut values = Vec::new();
        while let Some(chunk) = self.read()? {
            values.extend_from_slice(&chunk);
        }
        Ok(values)
    }
}
