use std::{
    fs::{self, File},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use log::debug;

use crate::core::{
    error::{AbxError, Result},
    type_fitting::IntType,
};

use super::{
    dataset::{DatasetReader, DatasetWriter},
    file_sync::LocalStorageProvider,
};

pub const DATASET_EXTENSION: &str = "ds";
pub const TABLE_EXTENSION: &str = "tbl";

/// A directory of datasets and string tables. `group` names a
/// sub-directory, the empty group is the root.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    root: PathBuf,
}

impl DatasetStore {
    pub fn open(path: impl AsRef<Path>) -> Result<DatasetStore> {
        let root = path.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(DatasetStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn group_dir(&self, group: &str) -> PathBuf {
        if group.is_empty() {
            self.root.clone()
        } else {
            self.root.join(group)
        }
    }

    pub fn dataset_path(&self, group: &str, name: &str) -> PathBuf {
        self.group_dir(group).join(format!("{}.{}", name, DATASET_EXTENSION))
    }

    pub fn table_path(&self, group: &str, name: &str) -> PathBuf {
        self.group_dir(group).join(format!("{}.{}", name, TABLE_EXTENSION))
    }

    pub fn create_dataset(
        &self,
        group: &str,
        name: &str,
        row_capacity_hint: u64,
        column_count: usize,
        item_type: IntType,
    ) -> Result<DatasetWriter<LocalStorageProvider>> {
        let io = LocalStorageProvider::create(&self.group_dir(group), &format!("{}.{}", name, DATASET_EXTENSION))?;
        DatasetWriter::new(io, column_count, item_type, row_capacity_hint)
    }

    pub fn open_dataset(&self, group: &str, name: &str, chunk_rows: usize) -> Result<DatasetReader<LocalStorageProvider>> {
        let io = LocalStorageProvider::open(&self.dataset_path(group, name))?;
        DatasetReader::new(io, chunk_rows)
    }

    pub fn remove_dataset(&self, group: &str, name: &str) -> Result<()> {
        fs::remove_file(self.dataset_path(group, name))?;
        Ok(())
    }

    /// Writes a tab separated string table with a header line.
    pub fn write_table(&self, group: &str, name: &str, header: &[String], rows: &[Vec<String>]) -> Result<()> {
        let dir = self.group_dir(group);
        fs::create_dir_all(&dir)?;

        let path = self.table_path(group, name);
        let mut out = BufWriter::new(File::create(&path)?);

        writeln!(out, "{}", header.join("\t"))?;
        for row in rows {
            if row.iter().any(|field| field.contains(['\t', '\n'])) {
                return Err(AbxError::InvalidData(format!(
                    "table {} field contains a tab or a newline",
                    path.display()
                )));
            }
            writeln!(out, "{}", row.join("\t"))?;
        }

        out.flush()?;
        debug!("Wrote {} rows to {}", rows.len(), path.display());

        Ok(())
    }

    pub fn read_table(&self, group: &str, name: &str) -> Result<(Vec<String>, Vec<Vec<String>>)> {
        let path = self.table_path(group, name);
        let mut lines = BufReader::new(File::open(&path)?).lines();

        let header = match lines.next() {
            Some(line) => split_fields(&line?),
            None => {
                return Err(AbxError::InvalidData(format!("{} has no header", path.display())));
            }
        };

        let mut rows = Vec::new();
        for line in lines {
            rows.push(split_fields(&line?));
        }

        Ok((header, rows))
    }
}

fn split_fields(line: &str) -> Vec<String> {
    if line.is_empty() {
        Vec::new()
    } else {
        line.split('\t').map(|f| f.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use temp_testdir::TempDir;

    use super::*;

    #[test]
    fn test_datasets_and_tables() {
        let temp = TempDir::default();
        let store = DatasetStore::open(temp.as_ref()).unwrap();

        let mut writer = store.create_dataset("regressors", "talker_A", 2, 1, IntType::U8).unwrap();
        writer.append(&[3, 1]).unwrap();
        writer.finish().unwrap();

        assert!(store.dataset_path("regressors", "talker_A").exists());
        let mut reader = store.open_dataset("regressors", "talker_A", 10).unwrap();
        assert_eq!(reader.read_all().unwrap(), vec![3, 1]);

        let header = vec!["file".to_string(), "onset".to_string()];
        let rows = vec![vec!["f1".to_string(), "0.1".to_string()]];
        store.write_table("features", "0", &header, &rows).unwrap();
        assert_eq!(store.read_table("features", "0").unwrap(), (header, rows));

        store.remove_dataset("regressors", "talker_A").unwrap();
        assert!(store.open_dataset("regressors", "talker_A", 10).is_err());
    }
}
