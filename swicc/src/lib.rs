pub mod apdu;
pub mod bertlv;
pub mod error;
pub mod fs;

pub use apdu::{Cmd, HandlerCtx, ProprietaryHandler, Response, Staging};
pub use error::{Error, Result};
pub use fs::{Disk, Va};

use std::io::Read;

/// A card instance: a loaded disk, the current virtual address, and the
/// response staging buffer (§3, §5). One `Card` processes one APDU
/// exchange at a time; there is no internal concurrency.
pub struct Card {
    disk: Disk,
    va: Va,
    staging: Staging,
    proprietary: Option<Box<dyn ProprietaryHandler>>,
}

impl Card {
    /// Load a disk image from any `Read` source and select the MF (§4.2,
    /// §4.5 `reset`).
    pub fn load<R: Read>(reader: R) -> Result<Self> {
        let disk = Disk::load(reader)?;
        let mut va = Va::new();
        va.reset(&disk)?;
        Ok(Card { disk, va, staging: Staging::new(), proprietary: None })
    }

    /// Register a handler for proprietary-class (`0x8X`/`0x9X`/`0xAX`) CLA
    /// bytes. Without one, proprietary commands are rejected with `6D00`.
    pub fn register_proprietary_handler(&mut self, handler: Box<dyn ProprietaryHandler>) {
        self.proprietary = Some(handler);
    }

    /// The current virtual address, for inspection by tests or a transport
    /// layer that needs to know what's selected.
    pub fn va(&self) -> &Va {
        &self.va
    }

    pub fn disk(&self) -> &Disk {
        &self.disk
    }

    /// Reset: clear the VA and staging buffer, reselect the MF (§5
    /// "Cancellation"). Does not reload the disk.
    pub fn reset(&mut self) -> Result<()> {
        self.staging.reset();
        self.va.reset(&self.disk)
    }

    /// Process one command APDU round (§4.7, §4.8). `procedure_count` is
    /// the caller's count of prior procedure-byte exchanges for this same
    /// logical command; pass `0` for the first round.
    pub fn transmit(&mut self, raw: &[u8], procedure_count: u32) -> Response {
        let cmd = match Cmd::parse(raw) {
            Ok(cmd) => cmd,
            Err(_) => return Response::status_pair(apdu::sw::UNKNOWN_ERROR),
        };
        let mut ctx = HandlerCtx { disk: &self.disk, va: &mut self.va, staging: &mut self.staging };
        apdu::dispatch(&mut ctx, &cmd, procedure_count, self.proprietary.as_deref_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::item::{File, FileExtra, ItemHeader, ItemType, Lcs, FID_MF};

    fn packed(
        item_type: ItemType,
        offset_prel: u32,
        id: u16,
        sid: u8,
        name: &str,
        extra: FileExtra,
        data: &[u8],
    ) -> Vec<u8> {
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
                size: header_len + data.len() as u32,
                lcs: Lcs::OperActiv,
                item_type,
                offset_trel: 0,
                offset_prel,
            },
            ..probe
        };
        let mut out = Vec::new();
        file.write(&mut out);
        out.extend_from_slice(data);
        out
    }

    /// MF(3F00) -> EF_TRANSPARENT(6F01, sid=1, 40 bytes of data)
    fn sample_disk_bytes() -> Vec<u8> {
        let mf_header_len = {
            let tpl = packed(ItemType::FileMf, 0, FID_MF, 0, "", FileExtra::None, &[]);
            File::parse(&tpl, 0).unwrap().header_len()
        };
        let ef = packed(
            ItemType::EfTransparent,
            mf_header_len,
            0x6F01,
            1,
            "EFTEST",
            FileExtra::None,
            &[0xAAu8; 40],
        );
        let mf_size = mf_header_len + ef.len() as u32;
        let mf_tpl = packed(ItemType::FileMf, 0, FID_MF, 0, "", FileExtra::None, &[]);
        let mut mf = File::parse(&mf_tpl, 0).unwrap();
        mf.item.size = mf_size;
        let mut tree = Vec::new();
        mf.write(&mut tree);
        tree.extend_from_slice(&ef);

        let mut bytes = Vec::new();
        bytes.extend_from_slice(fs::disk::DISK_MAGIC);
        bytes.extend_from_slice(&tree);
        bytes
    }

    #[test]
    fn load_selects_mf() {
        let card = Card::load(std::io::Cursor::new(sample_disk_bytes())).unwrap();
        assert_eq!(card.va().cur_file.as_ref().unwrap().id, FID_MF);
    }

    #[test]
    fn select_mf_by_fid_over_transmit() {
        let mut card = Card::load(std::io::Cursor::new(sample_disk_bytes())).unwrap();
        let header_only = [0x00, 0xA4, 0x00, 0x0C, 0x02];
        let ack = card.transmit(&header_only, 0);
        assert_eq!(ack.sw1, 0x61);
        assert_eq!(ack.sw2, 0x02);

        let full = [0x00, 0xA4, 0x00, 0x0C, 0x02, 0x3F, 0x00];
        let resp = card.transmit(&full, 1);
        assert_eq!((resp.sw1, resp.sw2), (0x90, 0x00));
    }

    #[test]
    fn select_fcp_then_get_response_drains() {
        let mut card = Card::load(std::io::Cursor::new(sample_disk_bytes())).unwrap();
        let select_cmd = [0x00, 0xA4, 0x00, 0x04, 0x02, 0x3F, 0x00];
        let resp = card.transmit(&select_cmd, 1);
        assert_eq!(resp.sw1, 0x61);
        let announced = resp.sw2;
        assert!(announced > 0);

        let get_response = [0x00, 0xC0, 0x00, 0x00, announced];
        let ack = card.transmit(&get_response, 0);
        assert_eq!((ack.sw1, ack.sw2), (0x61, 0x00));
        let drained = card.transmit(&get_response, 1);
        assert_eq!((drained.sw1, drained.sw2), (0x90, 0x00));
        assert_eq!(drained.data.len(), announced as usize);

        let again = [0x00, 0xC0, 0x00, 0x00, 0x01];
        card.transmit(&again, 0);
        let drained_again = card.transmit(&again, 1);
        assert_eq!((drained_again.sw1, drained_again.sw2), (0x62, 0x82));
    }

    #[test]
    fn read_binary_round_trip() {
        let mut card = Card::load(std::io::Cursor::new(sample_disk_bytes())).unwrap();
        card.transmit(&[0x00, 0xA4, 0x00, 0x0C, 0x02, 0x6F, 0x01], 0);
        card.transmit(&[0x00, 0xA4, 0x00, 0x0C, 0x02, 0x6F, 0x01], 1);
        let read_cmd = [0x00, 0xB0, 0x00, 0x00, 40];
        card.transmit(&read_cmd, 0);
        let resp = card.transmit(&read_cmd, 1);
        assert_eq!((resp.sw1, resp.sw2), (0x90, 0x00));
        assert_eq!(resp.data.len(), 40);
    }

    #[test]
    fn proprietary_cla_without_handler_is_rejected() {
        let mut card = Card::load(std::io::Cursor::new(sample_disk_bytes())).unwrap();
        let resp = card.transmit(&[0x80, 0x00, 0x00, 0x00], 0);
        assert_eq!((resp.sw1, resp.sw2), (0x6D, 0x00));
    }

    #[test]
    fn invalid_cla_is_rejected() {
        let mut card = Card::load(std::io::Cursor::new(sample_disk_bytes())).unwrap();
        let resp = card.transmit(&[0x01, 0x00, 0x00, 0x00], 0);
        assert_eq!((resp.sw1, resp.sw2), (0x6E, 0x00));
    }

    #[test]
    fn reset_reselects_mf_after_navigating_away() {
        let mut card = Card::load(std::io::Cursor::new(sample_disk_bytes())).unwrap();
        card.transmit(&[0x00, 0xA4, 0x00, 0x0C, 0x02, 0x6F, 0x01], 0);
        card.transmit(&[0x00, 0xA4, 0x00, 0x0C, 0x02, 0x6F, 0x01], 1);
        assert_eq!(card.va().cur_ef.as_ref().unwrap().id, 0x6F01);

        card.reset().unwrap();
        assert_eq!(card.va().cur_file.as_ref().unwrap().id, FID_MF);
        assert!(card.va().cur_ef.is_none());
    }
}
