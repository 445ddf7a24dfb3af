//! Virtual address (VA) state machine (§3 "Virtual address", §4.5).
//! Grounded on `original_source/src/fs/va.c` (`va_select_file`,
//! `swicc_va_select_adf`, `swicc_va_select_file_id`/`_sid`, `swicc_va_reset`)
//! for the selection-update table and atomic-on-failure behavior.

use crate::error::{Error, Result};
use crate::fs::disk::Disk;
use crate::fs::item::{File, ItemType, ADF_AID_PIX_LEN, ADF_AID_RID_LEN, FID_MF};

/// Relative-to-what a `select_file_path` call resolves against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathType {
    /// Path is relative to the MF; its first component must be `0x3F00`.
    Mf,
    /// Path is relative to the current DF.
    Df,
}

/// The card's current selection. All fields are cleared together by every
/// successful selection (§3 "Virtual address": "All other VA fields ...
/// are cleared on every selection").
#[derive(Debug, Clone, Default)]
pub struct Va {
    pub cur_tree: Option<u8>,
    pub cur_adf: Option<File>,
    pub cur_df: Option<File>,
    pub cur_ef: Option<File>,
    pub cur_file: Option<File>,
    pub cur_rcrd: Option<u8>,
    /// Reserved for a future data-object command set (§4.5 Open Questions:
    /// `METH_DO`/`METH_DO_PARENT` are rejected before dispatch). Unused by
    /// the operations specified here.
    pub cur_do: Option<()>,
}

impl Va {
    pub fn new() -> Self {
        Va::default()
    }

    /// The file SELECT's response composition should describe: `cur_ef` if
    /// set, else `cur_df`.
    pub fn file_selected(&self) -> Option<(&File, bool)> {
        if let Some(ef) = &self.cur_ef {
            Some((ef, false))
        } else {
            self.cur_df.as_ref().map(|df| (df, true))
        }
    }

    /// Apply the ISO 7816-4:2020 p.22 sec.7.2.2 selection-update rule for a
    /// successful selection of `file` found in tree `tree_idx`. Atomic on
    /// failure: `self` is untouched unless the whole update succeeds.
    fn select_file(&mut self, disk: &Disk, tree_idx: u8, file: File) -> Result<()> {
        let tree = disk
            .tree(tree_idx)
            .ok_or_else(|| Error::Failure("selected tree index out of range".into()))?;
        let root = tree.root()?;

        let mut next = Va::new();
        match file.item.item_type {
            ItemType::FileMf | ItemType::FileAdf => {
                next.cur_tree = Some(tree_idx);
                next.cur_adf = Some(file.clone());
                next.cur_df = Some(file.clone());
                next.cur_file = Some(file);
            }
            ItemType::FileDf => {
                next.cur_tree = Some(tree_idx);
                next.cur_adf = Some(root);
                next.cur_df = Some(file.clone());
                next.cur_file = Some(file);
            }
            ItemType::EfTransparent | ItemType::EfLinearFixed | ItemType::EfCyclic => {
                let parent = tree
                    .parent_of(&file)?
                    .ok_or_else(|| Error::Failure("EF has no parent".into()))?;
                next.cur_tree = Some(tree_idx);
                next.cur_adf = Some(root);
                next.cur_df = Some(parent);
                next.cur_ef = Some(file.clone());
                next.cur_file = Some(file);
            }
            _ => return Err(Error::Failure("item type cannot be selected".into())),
        }
        *self = next;
        Ok(())
    }

    /// `select_file_id` — ID LUT lookup across the whole disk.
    pub fn select_file_id(&mut self, disk: &Disk, fid: u16) -> Result<()> {
        let (tree_idx, file) = disk.lookup_id(fid)?;
        self.select_file(disk, tree_idx, file)
    }

    /// `select_file_sid` — SID LUT lookup within the current tree.
    pub fn select_file_sid(&mut self, disk: &Disk, sid: u8) -> Result<()> {
        let tree_idx = self.cur_tree.ok_or(Error::FileNotFound)?;
        let tree = disk
            .tree(tree_idx)
            .ok_or_else(|| Error::Failure("current tree index out of range".into()))?;
        let file = tree.lookup_sid(sid)?;
        self.select_file(disk, tree_idx, file)
    }

    /// `select_adf` — scan ADF trees (tree index ≥ 1; tree 0 is always the
    /// MF) comparing RID then PIX, first match wins.
    pub fn select_adf(&mut self, disk: &Disk, aid: &[u8], pix_len: usize) -> Result<()> {
        if aid.len() < ADF_AID_RID_LEN + pix_len || pix_len > ADF_AID_PIX_LEN {
            return Err(Error::BadParam("ADF AID too short".into()));
        }
        let rid = &aid[..ADF_AID_RID_LEN];
        let pix = &aid[ADF_AID_RID_LEN..ADF_AID_RID_LEN + pix_len];
        for (tree_idx, tree) in disk.trees().iter().enumerate().skip(1) {
            let root = tree.root()?;
            if root.item.item_type != ItemType::FileAdf {
                return Err(Error::Failure("non-MF tree root is not an ADF".into()));
            }
            if let Some(root_aid) = root.aid() {
                if root_aid.rid == *rid && root_aid.pix[..pix_len] == *pix {
                    return self.select_file(disk, tree_idx as u8, root);
                }
            }
        }
        Err(Error::FileNotFound)
    }

    /// `select_parent_df` — the parent folder of the current DF (SELECT
    /// P1 method 0x03). `FileNotFound` if the current DF has no parent
    /// (it is the MF or an ADF root).
    pub fn select_parent_df(&mut self, disk: &Disk) -> Result<()> {
        let tree_idx = self.cur_tree.ok_or(Error::FileNotFound)?;
        let tree = disk
            .tree(tree_idx)
            .ok_or_else(|| Error::Failure("current tree index out of range".into()))?;
        let cur_df = self.cur_df.clone().ok_or(Error::FileNotFound)?;
        let parent = tree.parent_of(&cur_df)?.ok_or(Error::FileNotFound)?;
        self.select_file(disk, tree_idx, parent)
    }

    /// `select_file_dfname` — linear scan of the current tree for a DF
    /// whose name matches exactly, restricted to direct children of the
    /// current DF. Decided semantics; see DESIGN.md.
    pub fn select_file_dfname(&mut self, disk: &Disk, name: &[u8]) -> Result<()> {
        let tree_idx = self.cur_tree.ok_or(Error::FileNotFound)?;
        let tree = disk
            .tree(tree_idx)
            .ok_or_else(|| Error::Failure("current tree index out of range".into()))?;
        let cur_df = self.cur_df.clone().ok_or(Error::FileNotFound)?;

        let mut found: Option<File> = None;
        tree.walk::<Error>(|file| {
            if found.is_some() || file.item.item_type != ItemType::FileDf {
                return Ok(());
            }
            let is_direct_child = file.item.offset_prel != 0
                && file.item.offset_trel - file.item.offset_prel == cur_df.item.offset_trel;
            if is_direct_child && file.name_str().as_bytes() == name {
                found = Some(file.clone());
            }
            Ok(())
        })?;

        match found {
            Some(file) => self.select_file(disk, tree_idx, file),
            None => Err(Error::FileNotFound),
        }
    }

    /// Descend into a direct child of the current DF, identified by FID.
    /// Shared by both `select_file_path` modes (§4.5).
    fn select_path_child(&mut self, disk: &Disk, fid: u16) -> Result<()> {
        let tree_idx = self.cur_tree.ok_or(Error::FileNotFound)?;
        let tree = disk
            .tree(tree_idx)
            .ok_or_else(|| Error::Failure("current tree index out of range".into()))?;
        let cur_df = self.cur_df.clone().ok_or(Error::FileNotFound)?;

        let (found_tree_idx, file) = disk.lookup_id(fid)?;
        if found_tree_idx != tree_idx {
            return Err(Error::FileNotFound);
        }
        let parent = tree.parent_of(&file)?.ok_or(Error::FileNotFound)?;
        if parent.item.offset_trel != cur_df.item.offset_trel {
            return Err(Error::FileNotFound);
        }
        self.select_file(disk, tree_idx, file)
    }

    /// `select_file_path` — consume `path` as a sequence of 16-bit FIDs,
    /// descending one direct child at a time (§4.5). `Mf` mode requires the
    /// first component to be `0x3F00` and starts from the MF; `Df` mode
    /// starts from the current DF.
    pub fn select_file_path(&mut self, disk: &Disk, path_type: PathType, path: &[u16]) -> Result<()> {
        if path.is_empty() {
            return Err(Error::BadParam("path must contain at least one ID".into()));
        }
        match path_type {
            PathType::Mf => {
                let (first, rest) = path.split_first().expect("checked non-empty");
                if *first != FID_MF {
                    return Err(Error::FileNotFound);
                }
                self.select_file_id(disk, FID_MF)?;
                for &fid in rest {
                    self.select_path_child(disk, fid)?;
                }
            }
            PathType::Df => {
                for &fid in path {
                    self.select_path_child(disk, fid)?;
                }
            }
        }
        Ok(())
    }

    /// `select_record_idx` — only valid when `cur_ef` is linear-fixed or
    /// cyclic; `idx` must be within the EF's record count.
    pub fn select_record_idx(&mut self, disk: &Disk, idx: u8) -> Result<()> {
        let tree_idx = self.cur_tree.ok_or(Error::FileNotFound)?;
        let ef = self.cur_ef.as_ref().ok_or(Error::FileNotFound)?;
        if !ef.item.item_type.is_record_ef() {
            return Err(Error::Failure("current EF is not a record EF".into()));
        }
        let tree = disk
            .tree(tree_idx)
            .ok_or_else(|| Error::Failure("current tree index out of range".into()))?;
        let count = tree.record_count(ef)?;
        if idx as u32 >= count {
            return Err(Error::FileNotFound);
        }
        self.cur_rcrd = Some(idx);
        Ok(())
    }

    /// `reset()` — clear VA then select the MF.
    pub fn reset(&mut self, disk: &Disk) -> Result<()> {
        *self = Va::new();
        self.select_file_id(disk, FID_MF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::disk::Disk;
    use crate::fs::item::{FileExtra, ItemHeader, ItemType, Lcs};

    fn packed_file(
        item_type: ItemType,
        offset_prel: u32,
        id: u16,
        sid: u8,
        name: &str,
        extra: FileExtra,
        data_len: u32,
    ) -> (File, Vec<u8>) {
        let mut n = [0u8; 17];
        n[..name.len()].copy_from_slice(name.as_bytes());
        let probe = File {
            item: ItemHeader { size: 0, lcs: Lcs::OperActiv, item_type, offset_trel: 0, offset_prel },
            id,
            sid,
            name: n,
            extra,
        };
        let header_len = probe.header_len();
        let file = File {
            item: ItemHeader {
                size: header_len + data_len,
                lcs: Lcs::OperActiv,
                item_type,
                offset_trel: 0,
                offset_prel,
            },
            ..probe
        };
        let mut bytes = Vec::new();
        file.write(&mut bytes);
        bytes.extend(std::iter::repeat(0u8).take(data_len as usize));
        (file, bytes)
    }

    /// MF(3F00) -> DF(7F10) -> EF_TRANSPARENT(6F01, sid=1)
    fn sample_disk() -> Disk {
        let (_, mf_tpl) =
            packed_file(ItemType::FileMf, 0, FID_MF, 0, "", FileExtra::None, 0);
        let mf_header_len = File::parse(&mf_tpl, 0).unwrap().header_len();

        let (_, ef_tpl) = packed_file(
            ItemType::EfTransparent,
            0,
            0x6F01,
            1,
            "EF",
            FileExtra::None,
            4,
        );
        let df_header_len = {
            let (_, df_probe) =
                packed_file(ItemType::FileDf, mf_header_len, 0x7F10, 0, "DF", FileExtra::None, 0);
            File::parse(&df_probe, 0).unwrap().header_len()
        };
        let mut ef = File::parse(&ef_tpl, 0).unwrap();
        ef.item.offset_prel = df_header_len;
        let mut ef_bytes = Vec::new();
        ef.write(&mut ef_bytes);
        ef_bytes.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);

        let df_size = df_header_len + ef_bytes.len() as u32;
        let mut df = File::parse(&{
            let (_, b) = packed_file(ItemType::FileDf, mf_header_len, 0x7F10, 0, "DF", FileExtra::None, 0);
            b
        }, 0)
        .unwrap();
        df.item.size = df_size;
        let mut df_bytes = Vec::new();
        df.write(&mut df_bytes);
        df_bytes.extend_from_slice(&ef_bytes);

        let mf_size = mf_header_len + df_bytes.len() as u32;
        let mut mf = File::parse(&mf_tpl, 0).unwrap();
        mf.item.size = mf_size;
        let mut tree_bytes = Vec::new();
        mf.write(&mut tree_bytes);
        tree_bytes.extend_from_slice(&df_bytes);

        let mut disk_bytes = Vec::new();
        disk_bytes.extend_from_slice(crate::fs::disk::DISK_MAGIC);
        disk_bytes.extend_from_slice(&tree_bytes);
        Disk::load(std::io::Cursor::new(disk_bytes)).unwrap()
    }

    #[test]
    fn select_mf_sets_df_and_file_but_not_ef() {
        let disk = sample_disk();
        let mut va = Va::new();
        va.select_file_id(&disk, FID_MF).unwrap();
        assert_eq!(va.cur_df.as_ref().unwrap().id, FID_MF);
        assert_eq!(va.cur_adf.as_ref().unwrap().id, FID_MF);
        assert_eq!(va.cur_file.as_ref().unwrap().id, FID_MF);
        assert!(va.cur_ef.is_none());
    }

    #[test]
    fn select_ef_sets_parent_df() {
        let disk = sample_disk();
        let mut va = Va::new();
        va.select_file_id(&disk, 0x6F01).unwrap();
        assert_eq!(va.cur_ef.as_ref().unwrap().id, 0x6F01);
        assert_eq!(va.cur_df.as_ref().unwrap().id, 0x7F10);
        assert_eq!(va.cur_adf.as_ref().unwrap().id, FID_MF);
    }

    #[test]
    fn failed_selection_leaves_va_unchanged() {
        let disk = sample_disk();
        let mut va = Va::new();
        va.select_file_id(&disk, FID_MF).unwrap();
        let before = va.cur_file.as_ref().unwrap().id;
        assert!(va.select_file_id(&disk, 0x9999).is_err());
        assert_eq!(va.cur_file.as_ref().unwrap().id, before);
    }

    #[test]
    fn reset_matches_mf_selection() {
        let disk = sample_disk();
        let mut va = Va::new();
        va.select_file_id(&disk, 0x6F01).unwrap();
        va.reset(&disk).unwrap();
        assert_eq!(va.cur_file.as_ref().unwrap().id, FID_MF);
        assert!(va.cur_ef.is_none());
        assert!(va.cur_rcrd.is_none());
    }

    #[test]
    fn path_from_mf_descends_children() {
        let disk = sample_disk();
        let mut va = Va::new();
        va.select_file_path(&disk, PathType::Mf, &[FID_MF, 0x7F10, 0x6F01]).unwrap();
        assert_eq!(va.cur_ef.as_ref().unwrap().id, 0x6F01);
    }

    #[test]
    fn path_from_mf_rejects_wrong_first_id() {
        let disk = sample_disk();
        let mut va = Va::new();
        assert!(matches!(
            va.select_file_path(&disk, PathType::Mf, &[0x1234]),
            Err(Error::FileNotFound)
        ));
    }
}
