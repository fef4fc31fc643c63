use crate::core::{
    error::{AbxError, Result},
    storage_providers::{
        dataset::{DatasetReader, DatasetWriter},
        traits::StorageIO,
    },
};

/// Removes duplicates from a sorted single column stream in one pass.
///
/// Each chunk is deduplicated locally; a duplicate can only straddle two
/// chunks at the seam, so the first key of a chunk is dropped when it equals
/// the last key written. Returns the rows written.
pub fn dedup_sorted<S: StorageIO, T: StorageIO>(
    input: &mut DatasetReader<S>,
    output: &mut DatasetWriter<T>,
) -> Result<u64> {
    if input.columns() != 1 || output.columns() != 1 {
        return Err(AbxError::InvalidData("dedup needs single column datasets".to_string()));
    }

    let mut last: Option<u64> = None;
    let mut written = 0u64;

    while let Some(mut chunk) = input.read()? {
        chunk.dedup();

        let start = match (chunk.first(), last) {
            (Some(first), Some(last)) if *first == last => 1,
            _ => 0,
        };

        if start < chunk.len() {
            last = chunk.last().copied();
            output.append(&chunk[start..])?;
            written += (chunk.len() - start) as u64;
        }
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{storage_providers::memory::MemoryStorageProvider, type_fitting::IntType};

    fn run(values: &[u64], chunk_rows: usize) -> Vec<u64> {
        let input_io = MemoryStorageProvider::new();
        let mut writer = DatasetWriter::new(input_io.clone(), 1, IntType::U16, 0).unwrap();
        writer.append(values).unwrap();
        writer.finish().unwrap();

        let mut input = DatasetReader::new(input_io, chunk_rows).unwrap();
        let output_io = MemoryStorageProvider::new();
        let mut output = DatasetWriter::new(output_io.clone(), 1, IntType::U16, 0).unwrap();
        let written = dedup_sorted(&mut input, &mut output).unwrap();
        assert_eq!(output.finish().unwrap(), written);

        DatasetReader::new(output_io, 100).unwrap().read_all().unwrap()
    }

    #[test]
    fn test_duplicates_across_seams() {
        let values = [1, 1, 2, 2, 2, 2, 3, 5, 5, 5, 8];
        for chunk_rows in [1, 2, 3, 4, 100] {
            assert_eq!(run(&values, chunk_rows), vec![1, 2, 3, 5, 8]);
        }
    }

    #[test]
    fn test_dedup_is_idempotent() {
        let once = run(&[0, 0, 4, 4, 6, 7, 7], 2);
        assert_eq!(run(&once, 2), once);
        assert_eq!(run(&once, 1), once);
    }
}
