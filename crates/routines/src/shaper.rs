use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Serialize, Serializer};
use taskline_contracts::{ExpectedReturn, RawResult, Record, Table};

/// A raw result reshaped for the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Shaped {
    Rows(Table),
    Tables(Vec<Table>),
    /// Result sets keyed by caller-supplied names, in name order.
    Named(Vec<(String, Table)>),
    RowsAffected(u64),
}

impl Shaped {
    pub fn rows(&self) -> Option<&Table> {
        match self {
            Shaped::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn first_row(&self) -> Option<&Record> {
        self.rows().and_then(|rows| rows.first())
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        match self {
            Shaped::Named(tables) => tables
                .iter()
                .find(|(table_name, _)| table_name == name)
                .map(|(_, table)| table),
            _ => None,
        }
    }

    /// Result sets in order; named tables follow name order.
    pub fn into_tables(self) -> Vec<Table> {
        match self {
            Shaped::Rows(rows) => vec![rows],
            Shaped::Tables(tables) => tables,
            Shaped::Named(tables) => tables.into_iter().map(|(_, table)| table).collect(),
            Shaped::RowsAffected(_) => Vec::new(),
        }
    }
}

impl Serialize for Shaped {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Shaped::Rows(rows) => rows.serialize(serializer),
            Shaped::Tables(tables) => tables.serialize(serializer),
            Shaped::Named(tables) => {
                let mut map = serializer.serialize_map(Some(tables.len()))?;
                for (name, table) in tables {
                    map.serialize_entry(name, table)?;
                }
                map.end()
            }
            Shaped::RowsAffected(count) => {
                let mut out = serializer.serialize_struct("RowsAffected", 1)?;
                out.serialize_field("rowsAffected", count)?;
                out.end()
            }
        }
    }
}

/// Count mismatch between returned result sets and requested names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameMismatch {
    pub tables: usize,
    pub names: usize,
}

pub fn name_mismatch(raw: &RawResult, names: Option<&[String]>) -> Option<NameMismatch> {
    let names = names.filter(|names| !names.is_empty())?;
    (names.len() != raw.tables.len()).then_some(NameMismatch {
        tables: raw.tables.len(),
        names: names.len(),
    })
}

/// Pure reshaping; never touches the database.
///
/// `Single` yields the first result set (empty when there is none). `Multi`
/// yields every result set, keyed by `names` when given: surplus result sets
/// are dropped and surplus names map to empty tables. `None` yields only the
/// affected-row count.
pub fn shape(raw: RawResult, expected: ExpectedReturn, names: Option<&[String]>) -> Shaped {
    match expected {
        ExpectedReturn::Single => Shaped::Rows(raw.tables.into_iter().next().unwrap_or_default()),
        ExpectedReturn::Multi => match names.filter(|names| !names.is_empty()) {
            Some(names) => {
                let mut tables = raw.tables.into_iter();
                Shaped::Named(
                    names
                        .iter()
                        .map(|name| (name.clone(), tables.next().unwrap_or_default()))
                        .collect(),
                )
            }
            None => Shaped::Tables(raw.tables),
        },
        ExpectedReturn::None => Shaped::RowsAffected(raw.rows_affected),
    }
}
