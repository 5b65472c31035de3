use std::io::Read;

use crate::{
    error::{DbError, DbResult},
    io::{ByteWriter, Decodeable, Encodeable},
    types::PageNum,
};

pub const META_PAGE_NUM: PageNum = 0;

/// Stamped into the meta page at create time and verified at open.
pub const VERSION: &str = "mini-db 0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int,
    Float,
    Text,
}

impl ColumnType {
    pub fn tag(&self) -> u8 {
        match self {
            ColumnType::Int => 0,
            ColumnType::Float => 1,
            ColumnType::Text => 2,
        }
    }

    pub fn from_tag(tag: u8) -> DbResult<Self> {
        match tag {
            0 => Ok(ColumnType::Int),
            1 => Ok(ColumnType::Float),
            2 => Ok(ColumnType::Text),
            _ => Err(DbError::corrupt(&format!("unknown column type {}", tag))),
        }
    }
}

/// Persistent handle to a column's B+Tree. This is a weak relation:
/// the tree's pages belong to the pager, and the live tree object is
/// rebuilt from these fields on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMeta {
    pub root: PageNum,
    pub first_leaf: PageNum,
    pub last_leaf: PageNum,
    pub key_size: u16,
    pub value_size: u16,
}

impl Encodeable for IndexMeta {
    fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.write(&self.root);
        writer.write(&self.first_leaf);
        writer.write(&self.last_leaf);
        writer.write(&self.key_size);
        writer.write(&self.value_size);
        writer.to_bytes()
    }
}

impl Decodeable for IndexMeta {
    fn decode_from<R: Read>(reader: &mut R) -> DbResult<Self> {
        Ok(Self {
            root: u32::decode_from(reader)?,
            first_leaf: u32::decode_from(reader)?,
            last_leaf: u32::decode_from(reader)?,
            key_size: u16::decode_from(reader)?,
            value_size: u16::decode_from(reader)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ColumnDefine {
    pub name: String,
    pub column_type: ColumnType,
    pub column_id: u16,
    pub index: Option<IndexMeta>,
}

impl Encodeable for ColumnDefine {
    fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.write(&self.name);
        writer.write(&self.column_type.tag());
        writer.write(&self.column_id);
        match &self.index {
            Some(index) => {
                writer.write(&true);
                writer.write_raw(&index.encode());
            }
            None => writer.write(&false),
        }
        writer.to_bytes()
    }
}

impl Decodeable for ColumnDefine {
    fn decode_from<R: Read>(reader: &mut R) -> DbResult<Self> {
        let name = String::decode_from(reader)?;
        let column_type = ColumnType::from_tag(u8::decode_from(reader)?)?;
        let column_id = u16::decode_from(reader)?;
        let index = if bool::decode_from(reader)? {
            Some(IndexMeta::decode_from(reader)?)
        } else {
            None
        };
        Ok(Self {
            name,
            column_type,
            column_id,
            index,
        })
    }
}

/// Everything the engine knows about one table. The first column is
/// the primary key by convention.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub table_name: String,
    pub table_id: u16,
    pub columns: Vec<ColumnDefine>,
    pub first_page_num: PageNum,
    pub last_page_num: PageNum,
}

impl TableInfo {
    pub fn column(&self, name: &str) -> Option<&ColumnDefine> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn primary_key(&self) -> &ColumnDefine {
        &self.columns[0]
    }
}

impl Encodeable for TableInfo {
    fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.write(&self.table_name);
        writer.write(&self.table_id);
        writer.write(&(self.columns.len() as u8));
        for column in &self.columns {
            writer.write_raw(&column.encode());
        }
        writer.write(&self.first_page_num);
        writer.write(&self.last_page_num);
        writer.to_bytes()
    }
}

impl Decodeable for TableInfo {
    fn decode_from<R: Read>(reader: &mut R) -> DbResult<Self> {
        let table_name = String::decode_from(reader)?;
        let table_id = u16::decode_from(reader)?;
        let count = u8::decode_from(reader)?;
        let mut columns = Vec::with_capacity(count as usize);
        for _ in 0..count {
            columns.push(ColumnDefine::decode_from(reader)?);
        }
        Ok(Self {
            table_name,
            table_id,
            columns,
            first_page_num: u32::decode_from(reader)?,
            last_page_num: u32::decode_from(reader)?,
        })
    }
}

/// Payload of page 0: the version string and the table catalog.
pub struct MetaData {
    version: String,
    tables: Vec<TableInfo>,
}

impl MetaData {
    pub fn new() -> Self {
        Self {
            version: VERSION.to_string(),
            tables: Vec::new(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn tables(&self) -> &[TableInfo] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables.iter().find(|t| t.table_name == name)
    }

    pub fn table_mut(&mut self, name: &str) -> Option<&mut TableInfo> {
        self.tables.iter_mut().find(|t| t.table_name == name)
    }

    pub fn table_by_id(&self, table_id: u16) -> Option<&TableInfo> {
        self.tables.iter().find(|t| t.table_id == table_id)
    }

    pub fn table_by_id_mut(&mut self, table_id: u16) -> Option<&mut TableInfo> {
        self.tables.iter_mut().find(|t| t.table_id == table_id)
    }

    pub fn next_table_id(&self) -> u16 {
        self.tables.len() as u16
    }

    pub fn add_table(&mut self, table: TableInfo) {
        self.tables.push(table);
    }
}

/// # Format
///
/// - version string
/// - 1 byte: table count
/// - tables in creation order
impl Encodeable for MetaData {
    fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.write(&self.version);
        writer.write(&(self.tables.len() as u8));
        for table in &self.tables {
            writer.write_raw(&table.encode());
        }
        writer.to_bytes()
    }
}

impl Decodeable for MetaData {
    fn decode_from<R: Read>(reader: &mut R) -> DbResult<Self> {
        let version = String::decode_from(reader)?;
        let count = u8::decode_from(reader)?;
        let mut tables = Vec::with_capacity(count as usize);
        for _ in 0..count {
            tables.push(TableInfo::decode_from(reader)?);
        }
        Ok(Self { version, tables })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn sample_meta() -> MetaData {
        let mut meta = MetaData::new();
        meta.add_table(TableInfo {
            table_name: "student".to_string(),
            table_id: 0,
            columns: vec![
                ColumnDefine {
                    name: "id".to_string(),
                    column_type: ColumnType::Int,
                    column_id: 0,
                    index: Some(IndexMeta {
                        root: 1,
                        first_leaf: 1,
                        last_leaf: 1,
                        key_size: 8,
                        value_size: 4,
                    }),
                },
                ColumnDefine {
                    name: "name".to_string(),
                    column_type: ColumnType::Text,
                    column_id: 1,
                    index: None,
                },
            ],
            first_page_num: 2,
            last_page_num: 2,
        });
        meta
    }

    #[test]
    fn test_round_trip() {
        let meta = sample_meta();
        let mut reader = Cursor::new(meta.encode());
        let decoded = MetaData::decode_from(&mut reader).unwrap();

        assert_eq!(decoded.version(), VERSION);
        let table = decoded.table("student").unwrap();
        assert_eq!(table.table_id, 0);
        assert_eq!(table.columns.len(), 2);
        assert_eq!(table.primary_key().name, "id");
        assert_eq!(
            table.primary_key().index.as_ref().unwrap().key_size,
            8
        );
        assert!(table.column("name").unwrap().index.is_none());
        assert_eq!(table.first_page_num, 2);
    }

    #[test]
    fn test_lookup_by_id() {
        let meta = sample_meta();
        assert!(meta.table_by_id(0).is_some());
        assert!(meta.table_by_id(1).is_none());
        assert_eq!(meta.next_table_id(), 1);
    }
}
