//! ISO9660 images for catalog media
//!
//! Builds the image described by a Media node's `iso` property: a volume
//! identifier, a system identifier and inline files keyed by path. The image
//! carries the primary volume descriptor only, with no Joliet or Rock Ridge
//! extensions. Names are upper-cased and any character outside
//! `A-Z 0-9 _ -` becomes `_`; file names keep their last extension.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tempfile::NamedTempFile;
use tracing::debug;
use vcloud_common::{Error, Result};

const SECTOR: usize = 2048;
const PRIMARY_DESCRIPTOR: usize = 16;
const TERMINATOR: usize = 17;
const PATH_TABLES: usize = 18;
const MAX_NAME: usize = 31;

/// The `iso` node property
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IsoImage {
    #[serde(default)]
    pub vol_ident: Option<String>,
    #[serde(default)]
    pub sys_ident: Option<String>,
    /// Path to content; non-string content is written as JSON
    #[serde(default)]
    pub files: Map<String, Value>,
}

impl IsoImage {
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|err| Error::InvalidConfig(format!("Invalid iso property: {}", err)))
    }

    /// Render the whole image.
    pub fn build(&self, now: DateTime<Utc>) -> Result<Vec<u8>> {
        let mut root = Dir::default();
        for (path, content) in &self.files {
            let bytes = match content {
                Value::String(text) => text.clone().into_bytes(),
                other => other.to_string().into_bytes(),
            };
            root.insert(path, bytes)?;
        }
        let layout = Layout::new(&root);
        Ok(layout.render(self, now))
    }

    /// Write the image to a temporary `.iso` file, removed on drop.
    pub async fn write_temp(&self) -> Result<NamedTempFile> {
        let bytes = self.build(Utc::now())?;
        let file = tempfile::Builder::new().suffix(".iso").tempfile()?;
        tokio::fs::write(file.path(), &bytes).await?;
        debug!("Wrote {} byte ISO to {}", bytes.len(), file.path().display());
        Ok(file)
    }
}

#[derive(Default)]
struct Dir {
    dirs: BTreeMap<String, Dir>,
    files: BTreeMap<String, Vec<u8>>,
}

impl Dir {
    fn insert(&mut self, path: &str, content: Vec<u8>) -> Result<()> {
        let parts: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
        let Some((file, parents)) = parts.split_last() else {
            return Err(Error::InvalidConfig(format!("Invalid ISO file path {:?}", path)));
        };
        let mut dir = self;
        for part in parents {
            dir = dir.dirs.entry(dir_name(part)).or_default();
        }
        let name = file_name(file);
        if dir.files.insert(name.clone(), content).is_some() {
            return Err(Error::InvalidConfig(format!(
                "ISO file {} collides with another file named {}",
                path, name
            )));
        }
        Ok(())
    }
}

fn d_chars(name: &str) -> String {
    name.chars()
        .map(|c| match c.to_ascii_uppercase() {
            c @ ('A'..='Z' | '0'..='9' | '_' | '-') => c,
            _ => '_',
        })
        .collect()
}

fn dir_name(name: &str) -> String {
    d_chars(name).chars().take(MAX_NAME).collect()
}

/// `NAME.EXT;1`, shortening the stem first.
fn file_name(name: &str) -> String {
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (d_chars(stem), d_chars(ext)),
        _ => (d_chars(name), String::new()),
    };
    let ext: String = ext.chars().take(MAX_NAME - 4).collect();
    let stem: String = stem.chars().take(MAX_NAME - 3 - ext.len()).collect();
    format!("{}.{};1", stem, ext)
}

fn sectors(len: usize) -> usize {
    len.div_ceil(SECTOR)
}

fn record_len(id_len: usize) -> usize {
    let len = 33 + id_len;
    len + len % 2
}

/// Bytes a directory extent takes; records never straddle a sector.
fn extent_len(records: impl Iterator<Item = usize>) -> usize {
    let mut offset = 0;
    for len in records {
        if offset % SECTOR + len > SECTOR {
            offset = sectors(offset) * SECTOR;
        }
        offset += len;
    }
    sectors(offset).max(1) * SECTOR
}

enum Child {
    Dir(usize),
    File(usize),
}

struct DirSlot {
    /// Empty for the root
    name: String,
    /// 1-based number of the parent in the path table
    parent: usize,
    children: Vec<(String, Child)>,
    lba: usize,
    size: usize,
}

struct FileSlot<'a> {
    content: &'a [u8],
    lba: usize,
}

struct Layout<'a> {
    dirs: Vec<DirSlot>,
    files: Vec<FileSlot<'a>>,
    path_table_size: usize,
    path_table_sectors: usize,
    total_sectors: usize,
}

impl<'a> Layout<'a> {
    fn new(root: &'a Dir) -> Self {
        // Breadth first, children by name: the order the path table needs
        let mut queue: Vec<&'a Dir> = vec![root];
        let mut dirs = vec![DirSlot {
            name: String::new(),
            parent: 1,
            children: vec![],
            lba: 0,
            size: 0,
        }];
        let mut files = Vec::new();
        let mut i = 0;
        while i < queue.len() {
            let dir = queue[i];
            let mut children = Vec::new();
            for (name, sub) in &dir.dirs {
                children.push((name.clone(), Child::Dir(dirs.len())));
                queue.push(sub);
                dirs.push(DirSlot {
                    name: name.clone(),
                    parent: i + 1,
                    children: vec![],
                    lba: 0,
                    size: 0,
                });
            }
            for (name, content) in &dir.files {
                children.push((name.clone(), Child::File(files.len())));
                files.push(FileSlot {
                    content: content.as_slice(),
                    lba: 0,
                });
            }
            children.sort_by(|a, b| a.0.cmp(&b.0));
            dirs[i].children = children;
            i += 1;
        }

        let path_table_size: usize = dirs
            .iter()
            .map(|dir| {
                let id_len = dir.name.len().max(1);
                8 + id_len + id_len % 2
            })
            .sum();
        let path_table_sectors = sectors(path_table_size).max(1);

        let mut next = PATH_TABLES + 2 * path_table_sectors;
        for dir in dirs.iter_mut() {
            let records = [34, 34]
                .into_iter()
                .chain(dir.children.iter().map(|(name, _)| record_len(name.len())));
            dir.size = extent_len(records);
            dir.lba = next;
            next += dir.size / SECTOR;
        }
        for file in files.iter_mut() {
            file.lba = next;
            next += sectors(file.content.len());
        }

        Self {
            dirs,
            files,
            path_table_size,
            path_table_sectors,
            total_sectors: next,
        }
    }

    fn render(&self, image: &IsoImage, now: DateTime<Utc>) -> Vec<u8> {
        let mut out = vec![0u8; self.total_sectors * SECTOR];
        let stamp = record_date(now);

        let pvd = &mut out[PRIMARY_DESCRIPTOR * SECTOR..(PRIMARY_DESCRIPTOR + 1) * SECTOR];
        pvd[0] = 1;
        pvd[1..6].copy_from_slice(b"CD001");
        pvd[6] = 1;
        padded(&mut pvd[8..40], image.sys_ident.as_deref().unwrap_or_default());
        padded(&mut pvd[40..72], image.vol_ident.as_deref().unwrap_or_default());
        both_u32(&mut pvd[80..88], self.total_sectors as u32);
        both_u16(&mut pvd[120..124], 1);
        both_u16(&mut pvd[124..128], 1);
        both_u16(&mut pvd[128..132], SECTOR as u16);
        both_u32(&mut pvd[132..140], self.path_table_size as u32);
        pvd[140..144].copy_from_slice(&(PATH_TABLES as u32).to_le_bytes());
        let m_table = PATH_TABLES + self.path_table_sectors;
        pvd[148..152].copy_from_slice(&(m_table as u32).to_be_bytes());
        let root = &self.dirs[0];
        pvd[156..190].copy_from_slice(&dir_record(&[0], root.lba, root.size, true, &stamp));
        for field in [190..318, 318..446, 446..574, 574..702, 702..739, 739..776, 776..813] {
            padded(&mut pvd[field], "");
        }
        pvd[813..830].copy_from_slice(&volume_date(Some(now)));
        pvd[830..847].copy_from_slice(&volume_date(Some(now)));
        pvd[847..864].copy_from_slice(&volume_date(None));
        pvd[864..881].copy_from_slice(&volume_date(None));
        pvd[881] = 1;

        let terminator = &mut out[TERMINATOR * SECTOR..(TERMINATOR + 1) * SECTOR];
        terminator[0] = 255;
        terminator[1..6].copy_from_slice(b"CD001");
        terminator[6] = 1;

        let mut l_offset = PATH_TABLES * SECTOR;
        let mut m_offset = m_table * SECTOR;
        for dir in &self.dirs {
            let id: &[u8] = if dir.name.is_empty() { &[0] } else { dir.name.as_bytes() };
            let len = 8 + id.len() + id.len() % 2;
            for (offset, big_endian) in [(l_offset, false), (m_offset, true)] {
                let entry = &mut out[offset..offset + len];
                entry[0] = id.len() as u8;
                if big_endian {
                    entry[2..6].copy_from_slice(&(dir.lba as u32).to_be_bytes());
                    entry[6..8].copy_from_slice(&(dir.parent as u16).to_be_bytes());
                } else {
                    entry[2..6].copy_from_slice(&(dir.lba as u32).to_le_bytes());
                    entry[6..8].copy_from_slice(&(dir.parent as u16).to_le_bytes());
                }
                entry[8..8 + id.len()].copy_from_slice(id);
            }
            l_offset += len;
            m_offset += len;
        }

        for dir in &self.dirs {
            let parent = &self.dirs[dir.parent - 1];
            let mut records = vec![
                dir_record(&[0], dir.lba, dir.size, true, &stamp),
                dir_record(&[1], parent.lba, parent.size, true, &stamp),
            ];
            for (name, child) in &dir.children {
                records.push(match child {
                    Child::Dir(index) => {
                        let sub = &self.dirs[*index];
                        dir_record(name.as_bytes(), sub.lba, sub.size, true, &stamp)
                    }
                    Child::File(index) => {
                        let file = &self.files[*index];
                        dir_record(name.as_bytes(), file.lba, file.content.len(), false, &stamp)
                    }
                });
            }
            let start = dir.lba * SECTOR;
            let mut offset = 0;
            for record in records {
                if offset % SECTOR + record.len() > SECTOR {
                    offset = sectors(offset) * SECTOR;
                }
                out[start + offset..start + offset + record.len()].copy_from_slice(&record);
                offset += record.len();
            }
        }

        for file in &self.files {
            let start = file.lba * SECTOR;
            out[start..start + file.content.len()].copy_from_slice(file.content);
        }
        out
    }
}

fn both_u32(field: &mut [u8], value: u32) {
    field[..4].copy_from_slice(&value.to_le_bytes());
    field[4..8].copy_from_slice(&value.to_be_bytes());
}

fn both_u16(field: &mut [u8], value: u16) {
    field[..2].copy_from_slice(&value.to_le_bytes());
    field[2..4].copy_from_slice(&value.to_be_bytes());
}

fn padded(field: &mut [u8], text: &str) {
    field.fill(b' ');
    let len = text.len().min(field.len());
    field[..len].copy_from_slice(&text.as_bytes()[..len]);
}

fn record_date(now: DateTime<Utc>) -> [u8; 7] {
    [
        (now.year() - 1900).clamp(0, 255) as u8,
        now.month() as u8,
        now.day() as u8,
        now.hour() as u8,
        now.minute() as u8,
        now.second() as u8,
        0,
    ]
}

/// Digits `YYYYMMDDHHMMSScc` and a zero GMT offset; all zeros when unset.
fn volume_date(when: Option<DateTime<Utc>>) -> [u8; 17] {
    let digits = match when {
        Some(t) => t.format("%Y%m%d%H%M%S00").to_string(),
        None => "0".repeat(16),
    };
    let mut field = [0u8; 17];
    field[..16].copy_from_slice(&digits.as_bytes()[..16]);
    field
}

fn dir_record(id: &[u8], lba: usize, size: usize, is_dir: bool, stamp: &[u8; 7]) -> Vec<u8> {
    let mut record = vec![0u8; record_len(id.len())];
    record[0] = record.len() as u8;
    both_u32(&mut record[2..10], lba as u32);
    both_u32(&mut record[10..18], size as u32);
    record[18..25].copy_from_slice(stamp);
    record[25] = if is_dir { 0x02 } else { 0 };
    both_u16(&mut record[28..32], 1);
    record[32] = id.len() as u8;
    record[33..33 + id.len()].copy_from_slice(id);
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn extent(record: &[u8]) -> (usize, usize) {
        let lba = u32::from_le_bytes(record[2..6].try_into().unwrap()) as usize;
        let len = u32::from_le_bytes(record[10..14].try_into().unwrap()) as usize;
        (lba, len)
    }

    /// Follow directory records from the root to `path`.
    fn read<'a>(image: &'a [u8], path: &[&str]) -> Option<&'a [u8]> {
        let pvd = PRIMARY_DESCRIPTOR * SECTOR;
        let (mut lba, mut len) = extent(&image[pvd + 156..pvd + 190]);
        for want in path {
            let data = &image[lba * SECTOR..lba * SECTOR + len];
            let mut offset = 0;
            let mut found = None;
            while offset < data.len() {
                let record_len = data[offset] as usize;
                if record_len == 0 {
                    offset = (offset / SECTOR + 1) * SECTOR;
                    continue;
                }
                let record = &data[offset..offset + record_len];
                if &record[33..33 + record[32] as usize] == want.as_bytes() {
                    found = Some(extent(record));
                    break;
                }
                offset += record_len;
            }
            (lba, len) = found?;
        }
        Some(&image[lba * SECTOR..lba * SECTOR + len])
    }

    fn cidata(files: Value) -> IsoImage {
        IsoImage::from_value(&json!({"vol_ident": "cidata", "sys_ident": "", "files": files}))
            .unwrap()
    }

    #[test]
    fn test_names() {
        assert_eq!(file_name("content.json"), "CONTENT.JSON;1");
        assert_eq!(file_name("user-data"), "USER-DATA.;1");
        assert_eq!(file_name("a.tar.gz"), "A_TAR.GZ;1");
        assert_eq!(dir_name("openstack.d"), "OPENSTACK_D");
        assert_eq!(file_name(&"x".repeat(40)).len(), MAX_NAME);
    }

    #[test]
    fn test_volume_descriptors() {
        let now = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        let image = cidata(json!({"meta-data": "instance-id: web-1"}))
            .build(now)
            .unwrap();

        assert_eq!(image.len() % SECTOR, 0);
        let pvd = &image[PRIMARY_DESCRIPTOR * SECTOR..];
        assert_eq!(&pvd[1..6], b"CD001");
        assert_eq!(&pvd[40..48], b"cidata  ");
        let total = u32::from_le_bytes(pvd[80..84].try_into().unwrap()) as usize;
        assert_eq!(total * SECTOR, image.len());
        assert_eq!(&pvd[813..827], b"20240506070809");
        assert_eq!(image[TERMINATOR * SECTOR], 255);
    }

    #[test]
    fn test_nested_files_are_readable() {
        let image = cidata(json!({
            "ISO/FOLDER/content.json": "test content",
            "user-data": {"hostname": "web-1"},
        }))
        .build(Utc::now())
        .unwrap();

        assert_eq!(
            read(&image, &["ISO", "FOLDER", "CONTENT.JSON;1"]),
            Some(&b"test content"[..])
        );
        assert_eq!(
            read(&image, &["USER-DATA.;1"]),
            Some(&br#"{"hostname":"web-1"}"#[..])
        );
        assert!(read(&image, &["ISO", "MISSING.;1"]).is_none());
    }

    #[test]
    fn test_many_files_span_directory_sectors() {
        let files: Map<String, Value> = (0..80)
            .map(|i| (format!("data/file-{:03}.txt", i), json!(format!("payload {}", i))))
            .collect();
        let image = cidata(Value::Object(files)).build(Utc::now()).unwrap();

        assert_eq!(read(&image, &["DATA", "FILE-079.TXT;1"]), Some(&b"payload 79"[..]));
    }

    #[test]
    fn test_colliding_names_are_rejected() {
        let err = cidata(json!({"a.txt": "one", "A.TXT": "two"}))
            .build(Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
