//! Packed item and file header codec (on-disk layout, little-endian, no
//! alignment padding). See `original_source/include/uicc/fs/common.h` for the
//! layout this mirrors.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

pub const ITEM_HDR_LEN: usize = 10;
pub const FILE_NAME_LEN: usize = 17; // 16 usable bytes + NUL terminator
const FILE_EXT_LEN: usize = 2 + 1 + FILE_NAME_LEN; // id + sid + name
pub const ADF_AID_RID_LEN: usize = 5;
pub const ADF_AID_PIX_LEN: usize = 11;
pub const ADF_AID_LEN: usize = ADF_AID_RID_LEN + ADF_AID_PIX_LEN;
const ADF_EXTRA_LEN: usize = ADF_AID_LEN;
const RECORD_EXTRA_LEN: usize = 1;

pub const FID_MF: u16 = 0x3F00;
pub const ID_MISSING: u16 = 0;
pub const SID_MISSING: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    FileMf,
    FileAdf,
    FileDf,
    EfTransparent,
    EfLinearFixed,
    EfCyclic,
    DatoBerTlv,
    Hex,
    Ascii,
}

impl ItemType {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => ItemType::FileMf,
            2 => ItemType::FileAdf,
            3 => ItemType::FileDf,
            4 => ItemType::EfTransparent,
            5 => ItemType::EfLinearFixed,
            6 => ItemType::EfCyclic,
            7 => ItemType::DatoBerTlv,
            8 => ItemType::Hex,
            9 => ItemType::Ascii,
            _ => return None,
        })
    }

    fn to_u8(self) -> u8 {
        match self {
            ItemType::FileMf => 1,
            ItemType::FileAdf => 2,
            ItemType::FileDf => 3,
            ItemType::EfTransparent => 4,
            ItemType::EfLinearFixed => 5,
            ItemType::EfCyclic => 6,
            ItemType::DatoBerTlv => 7,
            ItemType::Hex => 8,
            ItemType::Ascii => 9,
        }
    }

    /// MF, ADF, or DF: an item that can hold children.
    pub fn is_folder(self) -> bool {
        matches!(self, ItemType::FileMf | ItemType::FileAdf | ItemType::FileDf)
    }

    /// Anything carrying a `FileHeader` extension (as opposed to a bare
    /// payload-encoding item type like `Hex`/`Ascii`/`DatoBerTlv`, which only
    /// ever appear inside a JSON-imported EF's content and are never walked
    /// as tree items by this core).
    pub fn is_file(self) -> bool {
        matches!(
            self,
            ItemType::FileMf
                | ItemType::FileAdf
                | ItemType::FileDf
                | ItemType::EfTransparent
                | ItemType::EfLinearFixed
                | ItemType::EfCyclic
        )
    }

    pub fn is_record_ef(self) -> bool {
        matches!(self, ItemType::EfLinearFixed | ItemType::EfCyclic)
    }
}

/// Life cycle status, ISO 7816-4:2020 p.31 sec.7.4.10.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lcs {
    OperActiv = 1,
    OperDeactiv = 2,
    Term = 3,
}

impl Lcs {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Lcs::OperActiv,
            2 => Lcs::OperDeactiv,
            3 => Lcs::Term,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ItemHeader {
    pub size: u32,
    pub lcs: Lcs,
    pub item_type: ItemType,
    /// Computed in-memory only, from the caller-supplied tree-relative base.
    /// Never read from or written to the disk buffer.
    pub offset_trel: u32,
    pub offset_prel: u32,
}

impl ItemHeader {
    pub(crate) fn parse(raw: &[u8], offset_trel: u32) -> Result<Self> {
        if raw.len() < ITEM_HDR_LEN {
            return Err(Error::Failure("item header truncated".into()));
        }
        let size = LittleEndian::read_u32(&raw[0..4]);
        if size == 0 {
            return Err(Error::InvalidItem("item size is zero".into()));
        }
        let lcs =
            Lcs::from_u8(raw[4]).ok_or_else(|| Error::InvalidItem("unrecognized lcs".into()))?;
        let item_type = ItemType::from_u8(raw[5])
            .ok_or_else(|| Error::InvalidItem("unrecognized item type".into()))?;
        let offset_prel = LittleEndian::read_u32(&raw[6..10]);
        Ok(ItemHeader { size, lcs, item_type, offset_trel, offset_prel })
    }

    fn write(&self, out: &mut Vec<u8>) {
        let mut raw = [0u8; ITEM_HDR_LEN];
        LittleEndian::write_u32(&mut raw[0..4], self.size);
        raw[4] = self.lcs as u8;
        raw[5] = self.item_type.to_u8();
        LittleEndian::write_u32(&mut raw[6..10], self.offset_prel);
        out.extend_from_slice(&raw);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdfAid {
    pub rid: [u8; ADF_AID_RID_LEN],
    pub pix: [u8; ADF_AID_PIX_LEN],
}

#[derive(Debug, Clone, Copy)]
pub enum FileExtra {
    None,
    Adf(AdfAid),
    Record { rcrd_size: u8 },
}

/// An in-memory snapshot of a file's header, parsed out of a tree buffer at
/// some offset. Cheap to clone; holds no reference back into the buffer.
#[derive(Debug, Clone)]
pub struct File {
    pub item: ItemHeader,
    pub id: u16,
    pub sid: u8,
    pub name: [u8; FILE_NAME_LEN],
    pub extra: FileExtra,
}

impl File {
    /// The name up to (not including) its first NUL byte.
    pub fn name_str(&self) -> &str {
        let nul = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..nul]).unwrap_or("")
    }

    /// Total header length (item header + file extension + type-specific
    /// extra), i.e. the offset from this file's header start to its payload.
    pub fn header_len(&self) -> u32 {
        let extra = match self.extra {
            FileExtra::None => 0,
            FileExtra::Adf(_) => ADF_EXTRA_LEN,
            FileExtra::Record { .. } => RECORD_EXTRA_LEN,
        };
        (ITEM_HDR_LEN + FILE_EXT_LEN + extra) as u32
    }

    pub fn data_size(&self) -> u32 {
        self.item.size - self.header_len()
    }

    pub fn rcrd_size(&self) -> Option<u8> {
        match self.extra {
            FileExtra::Record { rcrd_size } => Some(rcrd_size),
            _ => None,
        }
    }

    pub fn aid(&self) -> Option<&AdfAid> {
        match &self.extra {
            FileExtra::Adf(aid) => Some(aid),
            _ => None,
        }
    }

    /// Parse a file header out of `buf` at `offset_trel`. The item header's
    /// type discriminant must be one of the file-shaped item types.
    pub(crate) fn parse(buf: &[u8], offset_trel: u32) -> Result<Self> {
        let off = offset_trel as usize;
        if buf.len() < off + ITEM_HDR_LEN {
            return Err(Error::Failure("item header out of bounds".into()));
        }
        let item = ItemHeader::parse(&buf[off..off + ITEM_HDR_LEN], offset_trel)?;
        if !item.item_type.is_file() {
            return Err(Error::InvalidItem("item at offset is not a file".into()));
        }

        let ext_off = off + ITEM_HDR_LEN;
        if buf.len() < ext_off + FILE_EXT_LEN {
            return Err(Error::Failure("file header out of bounds".into()));
        }
        let id = LittleEndian::read_u16(&buf[ext_off..ext_off + 2]);
        let sid = buf[ext_off + 2];
        let mut name = [0u8; FILE_NAME_LEN];
        name.copy_from_slice(&buf[ext_off + 3..ext_off + 3 + FILE_NAME_LEN]);

        let extra_off = ext_off + FILE_EXT_LEN;
        let extra = match item.item_type {
            ItemType::FileAdf => {
                if buf.len() < extra_off + ADF_EXTRA_LEN {
                    return Err(Error::Failure("adf header out of bounds".into()));
                }
                let mut rid = [0u8; ADF_AID_RID_LEN];
                rid.copy_from_slice(&buf[extra_off..extra_off + ADF_AID_RID_LEN]);
                let mut pix = [0u8; ADF_AID_PIX_LEN];
                pix.copy_from_slice(
                    &buf[extra_off + ADF_AID_RID_LEN..extra_off + ADF_EXTRA_LEN],
                );
                FileExtra::Adf(AdfAid { rid, pix })
            }
            ItemType::EfLinearFixed | ItemType::EfCyclic => {
                if buf.len() < extra_off + RECORD_EXTRA_LEN {
                    return Err(Error::Failure("record header out of bounds".into()));
                }
                FileExtra::Record { rcrd_size: buf[extra_off] }
            }
            _ => FileExtra::None,
        };

        Ok(File { item, id, sid, name, extra })
    }

    /// Serialize this header back into packed on-disk form. Used by test
    /// fixtures and by anything building a disk image in memory (see the
    /// `DiskBuilder` seam in `fs::disk`).
    pub fn write(&self, out: &mut Vec<u8>) {
        self.item.write(out);
        let mut ext = [0u8; FILE_EXT_LEN];
        LittleEndian::write_u16(&mut ext[0..2], self.id);
        ext[2] = self.sid;
        ext[3..3 + FILE_NAME_LEN].copy_from_slice(&self.name);
        out.extend_from_slice(&ext);
        match &self.extra {
            FileExtra::None => {}
            FileExtra::Adf(aid) => {
                out.extend_from_slice(&aid.rid);
                out.extend_from_slice(&aid.pix);
            }
            FileExtra::Record { rcrd_size } => out.push(*rcrd_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn padded_name(s: &str) -> [u8; FILE_NAME_LEN] {
        let mut name = [0u8; FILE_NAME_LEN];
        name[..s.len()].copy_from_slice(s.as_bytes());
        name
    }

    #[test]
    fn round_trips_a_transparent_ef_header() {
        let file = File {
            item: ItemHeader {
                size: ITEM_HDR_LEN as u32 + FILE_EXT_LEN as u32 + 4,
                lcs: Lcs::OperActiv,
                item_type: ItemType::EfTransparent,
                offset_trel: 0,
                offset_prel: 0,
            },
            id: 0x2F00,
            sid: 7,
            name: padded_name("EFTEST"),
            extra: FileExtra::None,
        };
        let mut buf = Vec::new();
        file.write(&mut buf);
        buf.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);

        let parsed = File::parse(&buf, 0).unwrap();
        assert_eq!(parsed.id, 0x2F00);
        assert_eq!(parsed.sid, 7);
        assert_eq!(parsed.name_str(), "EFTEST");
        assert_eq!(parsed.data_size(), 4);
        assert!(parsed.item.item_type.is_file());
        assert!(!parsed.item.item_type.is_folder());
    }

    #[test]
    fn rejects_zero_size() {
        let mut raw = vec![0u8; ITEM_HDR_LEN];
        raw[5] = ItemType::FileMf.to_u8();
        assert!(matches!(
            ItemHeader::parse(&raw, 0),
            Err(Error::InvalidItem(_))
        ));
    }

    #[test]
    fn rejects_unknown_type_discriminant() {
        let mut raw = vec![0u8; ITEM_HDR_LEN];
        LittleEndian::write_u32(&mut raw[0..4], 10);
        raw[4] = Lcs::OperActiv as u8;
        raw[5] = 0xFF;
        assert!(matches!(
            ItemHeader::parse(&raw, 0),
            Err(Error::InvalidItem(_))
        ));
    }

    #[test]
    fn linear_fixed_header_reports_record_size() {
        let file = File {
            item: ItemHeader {
                size: ITEM_HDR_LEN as u32 + FILE_EXT_LEN as u32 + RECORD_EXTRA_LEN as u32 + 32,
                lcs: Lcs::OperActiv,
                item_type: ItemType::EfLinearFixed,
                offset_trel: 0,
                offset_prel: 0,
            },
            id: 0x6F01,
            sid: 1,
            name: padded_name(""),
            extra: FileExtra::Record { rcrd_size: 16 },
        };
        let mut buf = Vec::new();
        file.write(&mut buf);
        buf.extend(std::iter::repeat(0u8).take(32));
        let parsed = File::parse(&buf, 0).unwrap();
        assert_eq!(parsed.rcrd_size(), Some(16));
        assert_eq!(parsed.data_size(), 32);
        assert!(parsed.item.item_type.is_record_ef());
    }
}
