use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use itertools::Itertools;
use log::{debug, info};

use crate::core::error::{AbxError, Result};

/// Character reserved for synthetic column names and `.item` section markers.
pub const RESERVED_CHAR: char = '#';

/// One attribute column, interned as level codes.
///
/// Levels are sorted, so code order equals value order.
#[derive(Debug, Clone)]
pub struct AttributeColumn {
    pub name: String,
    pub levels: Vec<String>,
    pub codes: Vec<u32>,
}

impl AttributeColumn {
    pub fn from_values(name: &str, values: &[String]) -> AttributeColumn {
        let mut levels: Vec<String> = Vec::new();
        let mut codes = vec![0u32; values.len()];

        // Rows in value order: a new level starts at every value change.
        for row in (0..values.len()).sorted_by(|a, b| values[*a].cmp(&values[*b])) {
            if levels.last() != Some(&values[row]) {
                levels.push(values[row].clone());
            }
            codes[row] = (levels.len() - 1) as u32;
        }

        AttributeColumn {
            name: name.to_string(),
            levels,
            codes,
        }
    }

    pub fn nb_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn level_code(&self, value: &str) -> Option<u32> {
        self.levels
            .binary_search_by(|level| level.as_str().cmp(value))
            .ok()
            .map(|code| code as u32)
    }
}

/// Row-indexed attribute table. Row `i` is item `i`.
#[derive(Debug, Clone, Default)]
pub struct ItemTable {
    columns: Vec<AttributeColumn>,
    len: usize,
}

impl ItemTable {
    /// Builds a table from row-major values.
    pub fn new(names: &[&str], rows: &[Vec<String>]) -> Result<ItemTable> {
        validate_names(names)?;

        for (i, row) in rows.iter().enumerate() {
            if row.len() != names.len() {
                return Err(AbxError::InvalidData(format!(
                    "row {} has {} attribute values, expected {}",
                    i,
                    row.len(),
                    names.len()
                )));
            }
        }

        let columns = names
            .iter()
            .enumerate()
            .map(|(col, name)| {
                let values: Vec<String> = rows.iter().map(|row| row[col].clone()).collect();
                AttributeColumn::from_values(name, &values)
            })
            .collect();

        Ok(ItemTable {
            columns,
            len: rows.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, index: usize) -> &AttributeColumn {
        &self.columns[index]
    }

    #[inline]
    pub fn code(&self, row: usize, column: usize) -> u32 {
        self.columns[column].codes[row]
    }

    #[inline]
    pub fn value(&self, row: usize, column: usize) -> &str {
        let col = &self.columns[column];
        &col.levels[col.codes[row] as usize]
    }
}

/// Feature payload kept next to the attributes, e.g. `file onset offset`.
#[derive(Debug, Clone, Default)]
pub struct FeatureTable {
    pub names: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl FeatureTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in the order given by `rows`.
    pub fn select(&self, rows: &[u32]) -> FeatureTable {
        FeatureTable {
            names: self.names.clone(),
            rows: rows.iter().map(|r| self.rows[*r as usize].clone()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ItemDatabase {
    pub attributes: ItemTable,
    pub features: FeatureTable,
}

impl ItemDatabase {
    pub fn from_rows(
        attribute_names: &[&str],
        attributes: &[Vec<String>],
        feature_names: &[&str],
        features: Vec<Vec<String>>,
    ) -> Result<ItemDatabase> {
        if !features.is_empty() && features.len() != attributes.len() {
            return Err(AbxError::InvalidData(format!(
                "{} feature rows for {} items",
                features.len(),
                attributes.len()
            )));
        }

        for (i, row) in features.iter().enumerate() {
            if row.len() != feature_names.len() {
                return Err(AbxError::InvalidData(format!(
                    "row {} has {} feature values, expected {}",
                    i,
                    row.len(),
                    feature_names.len()
                )));
            }
        }

        let attributes = ItemTable::new(attribute_names, attributes)?;

        // Without a payload the feature columns are dropped.
        let features = if features.is_empty() {
            FeatureTable {
                names: Vec::new(),
                rows: vec![Vec::new(); attributes.len()],
            }
        } else {
            FeatureTable {
                names: feature_names.iter().map(|n| n.to_string()).collect(),
                rows: features,
            }
        };

        Ok(ItemDatabase {
            attributes,
            features,
        })
    }

    /// Loads an ABX `.item` file.
    ///
    /// The header line is split in sections opened by `#`-prefixed tokens:
    /// the first section names the feature columns, the following ones the
    /// attribute columns, e.g. `#file onset offset #phone context talker`.
    pub fn load(path: impl AsRef<Path>) -> Result<ItemDatabase> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let mut lines = reader.lines();

        let header = loop {
            match lines.next() {
                Some(line) => {
                    let line = line?;
                    if !line.trim().is_empty() {
                        break line;
                    }
                }
                None => {
                    return Err(AbxError::InvalidData(format!(
                        "{} has no header line",
                        path.display()
                    )));
                }
            }
        };

        let (feature_names, attribute_names) = parse_header(&header)?;
        let width = feature_names.len() + attribute_names.len();

        let mut features = Vec::new();
        let mut attributes = Vec::new();

        for (line_number, line) in lines.enumerate() {
            let line = line?;
            let fields: Vec<&str> = line.split_whitespace().collect();

            if fields.is_empty() {
                continue;
            }

            if fields.len() != width {
                return Err(AbxError::InvalidData(format!(
                    "{}:{}: expected {} fields, found {}",
                    path.display(),
                    line_number + 2,
                    width,
                    fields.len()
                )));
            }

            let (feature_fields, attribute_fields) = fields.split_at(feature_names.len());
            features.push(feature_fields.iter().map(|f| f.to_string()).collect());
            attributes.push(attribute_fields.iter().map(|f| f.to_string()).collect());
        }

        let attribute_refs: Vec<&str> = attribute_names.iter().map(|n| n.as_str()).collect();
        let feature_refs: Vec<&str> = feature_names.iter().map(|n| n.as_str()).collect();

        let database = ItemDatabase::from_rows(&attribute_refs, &attributes, &feature_refs, features)?;

        info!(
            "Loaded {} items with attributes {:?} from {}",
            database.attributes.len(),
            attribute_names,
            path.display()
        );

        Ok(database)
    }
}

fn parse_header(header: &str) -> Result<(Vec<String>, Vec<String>)> {
    let mut sections: Vec<Vec<String>> = Vec::new();

    for token in header.split_whitespace() {
        if let Some(name) = token.strip_prefix(RESERVED_CHAR) {
            let mut section = Vec::new();
            if !name.is_empty() {
                section.push(name.to_string());
            }
            sections.push(section);
        } else {
            match sections.last_mut() {
                Some(section) => section.push(token.to_string()),
                None => {
                    return Err(AbxError::InvalidData(format!(
                        "header must start with a '{}' section marker: {}",
                        RESERVED_CHAR, header
                    )));
                }
            }
        }
    }

    if sections.len() < 2 {
        return Err(AbxError::InvalidData(format!(
            "header needs a feature section and an attribute section: {}",
            header
        )));
    }

    let features = sections.remove(0);
    let attributes: Vec<String> = sections.into_iter().flatten().collect();

    debug!("Parsed .item header: features {:?}, attributes {:?}", features, attributes);

    Ok((features, attributes))
}

fn validate_names(names: &[&str]) -> Result<()> {
    for name in names {
        if name.contains(RESERVED_CHAR) {
            return Err(AbxError::Configuration(format!(
                "attribute name '{}' contains the reserved character '{}'",
                name, RESERVED_CHAR
            )));
        }
    }

    if names.iter().duplicates().next().is_some() {
        return Err(AbxError::InvalidData(format!(
            "duplicated attribute names in {:?}",
            names
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use temp_testdir::TempDir;

    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_levels_are_sorted_and_coded_in_order() {
        let column = AttributeColumn::from_values("talker", &strings(&["bob", "alice", "bob", "carol"]));
        assert_eq!(column.levels, strings(&["alice", "bob", "carol"]));
        assert_eq!(column.codes, vec![1, 0, 1, 2]);
        assert_eq!(column.level_code("carol"), Some(2));
        assert_eq!(column.level_code("dave"), None);

        let empty = AttributeColumn::from_values("talker", &[]);
        assert!(empty.levels.is_empty() && empty.codes.is_empty());
    }

    #[test]
    fn test_feature_rows_match_their_names() {
        let attributes = vec![strings(&["a"]), strings(&["b"])];

        let ragged = ItemDatabase::from_rows(&["phone"], &attributes, &["file", "onset"], vec![strings(&["f1", "0"]), strings(&["f2"])]);
        assert!(matches!(ragged, Err(AbxError::InvalidData(_))));

        let bare = ItemDatabase::from_rows(&["phone"], &attributes, &["file"], Vec::new()).unwrap();
        assert!(bare.features.names.is_empty());
        assert_eq!(bare.features.len(), 2);

        let full = ItemDatabase::from_rows(&["phone"], &attributes, &["file"], vec![strings(&["f1"]), strings(&["f2"])]).unwrap();
        assert_eq!(full.features.select(&[1]).rows, vec![strings(&["f2"])]);
    }

    #[test]
    fn test_item_table_rejects_reserved_names() {
        let result = ItemTable::new(&["#on"], &[strings(&["a"])]);
        assert!(matches!(result, Err(AbxError::Configuration(_))));
    }

    #[test]
    fn test_load_item_file() {
        let temp = TempDir::default();
        let dir: &Path = temp.as_ref();
        let path = dir.join("data.item");

        let mut file = File::create(&path).unwrap();
        writeln!(file, "#file onset offset #phone talker").unwrap();
        writeln!(file, "f1 0.0 0.1 a t1").unwrap();
        writeln!(file, "f1 0.1 0.2 b t1").unwrap();
        writeln!(file, "").unwrap();
        writeln!(file, "f2 0.0 0.1 a t2").unwrap();
        drop(file);

        let db = ItemDatabase::load(&path).unwrap();
        assert_eq!(db.attributes.len(), 3);
        assert_eq!(db.features.names, strings(&["file", "onset", "offset"]));
        let phone = db.attributes.column_index("phone").unwrap();
        assert_eq!(db.attributes.value(1, phone), "b");
        assert_eq!(db.features.rows[2], strings(&["f2", "0.0", "0.1"]));
    }

    #[test]
    fn test_load_rejects_ragged_rows() {
        let temp = TempDir::default();
        let dir: &Path = temp.as_ref();
        let path = dir.join("ragged.item");

        let mut file = File::create(&path).unwrap();
        writeln!(file, "#file onset offset #phone").unwrap();
        writeln!(file, "f1 0.0 0.1 a extra").unwrap();
        drop(file);

        assert!(matches!(ItemDatabase::load(&path), Err(AbxError::InvalidData(_))));
    }
}
