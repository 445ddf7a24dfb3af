//! SELECT, READ BINARY, READ RECORD, GET RESPONSE (§4.8.1-4.8.4). Grounded
//! on `original_source/src/apduh.c`'s `apduh_select`, `apduh_bin_read`,
//! `apduh_rcrd_read`, `apduh_res_get`.

use crate::apdu::{sw, Cmd, HandlerCtx, Response};
use crate::bertlv::{self, Ctx as TlvCtx, Sink, Tag};
use crate::error::Error;
use crate::fs::item::{ItemType, ADF_AID_RID_LEN, ADF_AID_LEN};
use crate::fs::va::PathType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SelectMethod {
    Fid,
    ChildDf,
    ChildEf,
    ParentDf,
    DfName,
    PathFromMf,
    PathFromDf,
}

fn decode_select_method(p1: u8) -> Option<SelectMethod> {
    match p1 {
        0x00 => Some(SelectMethod::Fid),
        0x01 => Some(SelectMethod::ChildDf),
        0x02 => Some(SelectMethod::ChildEf),
        0x03 => Some(SelectMethod::ParentDf),
        0x04 => Some(SelectMethod::DfName),
        0x08 => Some(SelectMethod::PathFromMf),
        0x09 => Some(SelectMethod::PathFromDf),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseTemplate {
    Fci,
    Fcp,
    Fmd,
    Absent,
}

fn decode_response_template(p2: u8) -> ResponseTemplate {
    match (p2 >> 2) & 0x03 {
        0 => ResponseTemplate::Fci,
        1 => ResponseTemplate::Fcp,
        2 => ResponseTemplate::Fmd,
        _ => ResponseTemplate::Absent,
    }
}

/// Parse `data` as a sequence of big-endian 16-bit FIDs (§4.5 path descent).
fn decode_fid_path(data: &[u8]) -> Option<Vec<u16>> {
    if data.is_empty() || data.len() % 2 != 0 {
        return None;
    }
    Some(data.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect())
}

pub fn select(ctx: &mut HandlerCtx, cmd: &Cmd, procedure_count: u32) -> Response {
    if cmd.p2 & 0xF0 != 0 {
        return Response::status_pair(sw::INCORRECT_P1P2);
    }
    let Some(method) = decode_select_method(cmd.p1) else {
        return Response::status_pair(sw::WRONG_P1P2);
    };
    if cmd.data.is_empty() && procedure_count == 0 && cmd.p3 > 0 {
        return Response::status_pair(sw::more_available(cmd.p3));
    }
    if procedure_count >= 1 && cmd.data.len() != cmd.p3 as usize {
        return Response::status_pair(sw::WRONG_LC);
    }
    let template = decode_response_template(cmd.p2);
    // Only the FIRST occurrence is supported; DF-name and path methods reject
    // anything else outright (§4.8.1, matching the source's `occ` check).
    let occurrence_first = cmd.p2 & 0x03 == 0x00;

    let selection_result = match method {
        SelectMethod::Fid => {
            if cmd.data.len() == 2 {
                let fid = u16::from_be_bytes([cmd.data[0], cmd.data[1]]);
                ctx.va.select_file_id(ctx.disk, fid)
            } else if (ADF_AID_RID_LEN..=ADF_AID_LEN).contains(&cmd.data.len()) {
                let pix_len = cmd.data.len() - ADF_AID_RID_LEN;
                ctx.va.select_adf(ctx.disk, &cmd.data, pix_len)
            } else {
                // Neither a bare FID nor AID-length data; the source falls
                // through to a generic error here rather than 6A00 (§4.8.1,
                // `apduh_select`'s `METH_MF_DF_EF` case).
                return Response::status_pair(sw::UNKNOWN_ERROR);
            }
        }
        SelectMethod::ChildDf | SelectMethod::ChildEf => {
            if cmd.data.len() != 2 {
                return Response::status_pair(sw::WRONG_P1P2);
            }
            let fid = u16::from_be_bytes([cmd.data[0], cmd.data[1]]);
            ctx.va.select_file_path(ctx.disk, PathType::Df, &[fid])
        }
        SelectMethod::ParentDf => ctx.va.select_parent_df(ctx.disk),
        SelectMethod::DfName => {
            if cmd.data.is_empty() || !occurrence_first {
                return Response::status_pair(sw::UNKNOWN_ERROR);
            }
            ctx.va.select_file_dfname(ctx.disk, &cmd.data)
        }
        SelectMethod::PathFromMf | SelectMethod::PathFromDf => {
            if !occurrence_first {
                return Response::status_pair(sw::UNKNOWN_ERROR);
            }
            match decode_fid_path(&cmd.data) {
                Some(path) => {
                    let path_type =
                        if method == SelectMethod::PathFromMf { PathType::Mf } else { PathType::Df };
                    ctx.va.select_file_path(ctx.disk, path_type, &path)
                }
                None => return Response::status_pair(sw::WRONG_P1P2),
            }
        }
    };

    if let Err(e) = selection_result {
        return match e {
            Error::FileNotFound => Response::status_pair(sw::NOT_FOUND),
            _ => Response::status_pair(sw::UNKNOWN_ERROR),
        };
    }

    if template == ResponseTemplate::Absent {
        return Response::status_pair(sw::NORMAL);
    }

    let Some((file, is_folder)) = ctx.va.file_selected() else {
        return Response::status_pair(sw::UNKNOWN_ERROR);
    };
    let file = file.clone();

    let build_fcp = |ctx: &mut TlvCtx, sink: &mut Sink| -> crate::error::Result<()> {
        let mut fcp = ctx.nstd_start();
        let descr = file_descriptor_byte(file.item.item_type);
        fcp.enc_data(sink, &[descr, DATA_CODING_BYTE])?;
        fcp.enc_hdr(sink, Tag::one(0x82))?;
        if file.id != 0 {
            fcp.enc_data(sink, &file.id.to_be_bytes())?;
            fcp.enc_hdr(sink, Tag::one(0x83))?;
        }
        fcp.enc_data(sink, &[file.item.lcs as u8])?;
        fcp.enc_hdr(sink, Tag::one(0x8A))?;
        fcp.enc_data(sink, &file.data_size().to_be_bytes())?;
        fcp.enc_hdr(sink, Tag::one(0x80))?;
        if is_folder {
            fcp.enc_data(sink, &file.name[..16])?;
            fcp.enc_hdr(sink, Tag::one(0x84))?;
        } else if file.sid != 0 {
            fcp.enc_data(sink, &[file.sid])?;
            fcp.enc_hdr(sink, Tag::one(0x88))?;
        }
        ctx.nstd_end(fcp);
        ctx.enc_hdr(sink, Tag::one(0x62))
    };
    let build_fmd = |ctx: &mut TlvCtx, sink: &mut Sink| -> crate::error::Result<()> {
        let fmd = ctx.nstd_start();
        ctx.nstd_end(fmd);
        ctx.enc_hdr(sink, Tag::one(0x64))
    };

    let encoded = bertlv::encode(|root, sink| {
        match template {
            ResponseTemplate::Fcp => build_fcp(root, sink)?,
            ResponseTemplate::Fmd => build_fmd(root, sink)?,
            ResponseTemplate::Fci => {
                let mut inner = root.nstd_start();
                build_fcp(&mut inner, sink)?;
                build_fmd(&mut inner, sink)?;
                root.nstd_end(inner);
                root.enc_hdr(sink, Tag::one(0x6F))?;
            }
            ResponseTemplate::Absent => unreachable!("handled above"),
        }
        Ok(())
    });

    match encoded {
        Ok(bytes) if bytes.len() <= 256 => {
            if ctx.staging.stage(&bytes).is_err() {
                ctx.staging.reset();
                return Response::status_pair(sw::UNKNOWN_ERROR);
            }
            Response::status_pair((0x61, bytes.len() as u8))
        }
        _ => {
            ctx.staging.reset();
            Response::status_pair(sw::UNKNOWN_ERROR)
        }
    }
}

const DATA_CODING_BYTE: u8 = 0x21;

fn file_descriptor_byte(item_type: ItemType) -> u8 {
    match item_type {
        ItemType::FileMf | ItemType::FileAdf | ItemType::FileDf => 0x38,
        ItemType::EfTransparent => 0x01,
        ItemType::EfLinearFixed => 0x02,
        ItemType::EfCyclic => 0x06,
        _ => 0x00,
    }
}

pub fn read_binary(ctx: &mut HandlerCtx, cmd: &Cmd, procedure_count: u32) -> Response {
    // This command carries no data, only Le; the transport still gets one
    // ACK-ALL round expecting 0 bytes before the read is actually performed.
    if procedure_count == 0 {
        return Response::status_pair(sw::ACK_ALL_NO_DATA);
    }
    if !cmd.data.is_empty() {
        return Response::status_pair(sw::WRONG_LC);
    }

    let sid_mode = cmd.p1 & 0x80 != 0;
    let (offset, file) = if sid_mode {
        if cmd.p1 & 0x60 != 0 {
            return Response::status_pair(sw::INCORRECT_P1P2);
        }
        let sid = cmd.p1 & 0x1F;
        let Some(tree_idx) = ctx.va.cur_tree else {
            return Response::status_pair(sw::NO_CURRENT_EF);
        };
        let Some(tree) = ctx.disk.tree(tree_idx) else {
            return Response::status_pair(sw::UNKNOWN_ERROR);
        };
        let file = match tree.lookup_sid(sid) {
            Ok(f) => f,
            Err(Error::FileNotFound) => return Response::status_pair(sw::NOT_FOUND),
            Err(_) => return Response::status_pair(sw::UNKNOWN_ERROR),
        };
        (cmd.p2 as u32, file)
    } else {
        let Some(file) = ctx.va.cur_ef.clone() else {
            return Response::status_pair(sw::NO_CURRENT_EF);
        };
        let offset = (((cmd.p1 & 0x7F) as u32) << 8) | cmd.p2 as u32;
        (offset, file)
    };

    if file.item.item_type != ItemType::EfTransparent {
        return Response::status_pair(sw::CMD_INCOMPATIBLE);
    }
    let data_size = file.data_size();
    if offset >= data_size {
        return Response::status_pair(sw::WRONG_P1P2);
    }

    let Some(tree) = ctx.va.cur_tree.and_then(|idx| ctx.disk.tree(idx)) else {
        return Response::status_pair(sw::UNKNOWN_ERROR);
    };
    let bytes = match tree.data_bytes(&file) {
        Ok(b) => b,
        Err(_) => return Response::status_pair(sw::UNKNOWN_ERROR),
    };

    let le = cmd.p3 as u32;
    let avail = data_size - offset;
    let read_len = le.min(avail) as usize;
    let out = bytes[offset as usize..offset as usize + read_len].to_vec();

    if sid_mode {
        if ctx.va.select_file_sid(ctx.disk, file.sid).is_err() {
            return Response::status_pair(sw::UNKNOWN_ERROR);
        }
    }

    if read_len as u32 == le {
        Response::with_data(out, sw::NORMAL)
    } else {
        Response::with_data(out, sw::EOF_WARNING)
    }
}

pub fn read_record(ctx: &mut HandlerCtx, cmd: &Cmd, procedure_count: u32) -> Response {
    if procedure_count == 0 {
        return Response::status_pair(sw::ACK_ALL_NO_DATA);
    }
    if !cmd.data.is_empty() {
        return Response::status_pair(sw::WRONG_LC);
    }

    let p2_val = (cmd.p2 >> 3) & 0x1F;
    let bit2 = (cmd.p2 >> 2) & 1;
    let low2 = cmd.p2 & 0x03;

    // Selection by record ID, and reading a run of many records, are not
    // implemented (§4.8.3).
    if bit2 == 0 || p2_val == 0x1F {
        return Response::status_pair((0x6A, 0x81));
    }
    // low2 == 0b11 is RFU for the record-number method; the other three
    // values (this one, to-last, from-last) are all served identically below
    // — the source only ever reads the single record at P1, regardless of
    // which of the three it is.
    if low2 == 0b11 || cmd.p1 == 0x00 || cmd.p1 == 0xFF {
        return Response::status_pair(sw::INCORRECT_P1P2);
    }
    let idx = cmd.p1 - 1;

    let (file, sid_used) = if p2_val == 0 {
        let Some(file) = ctx.va.cur_ef.clone() else {
            return Response::status_pair(sw::NO_CURRENT_EF);
        };
        (file, None)
    } else {
        let Some(tree_idx) = ctx.va.cur_tree else {
            return Response::status_pair(sw::NO_CURRENT_EF);
        };
        let Some(tree) = ctx.disk.tree(tree_idx) else {
            return Response::status_pair(sw::UNKNOWN_ERROR);
        };
        match tree.lookup_sid(p2_val) {
            Ok(f) => (f, Some(p2_val)),
            Err(Error::FileNotFound) => return Response::status_pair(sw::NOT_FOUND),
            Err(_) => return Response::status_pair(sw::UNKNOWN_ERROR),
        }
    };

    if !file.item.item_type.is_record_ef() {
        return Response::status_pair(sw::CMD_INCOMPATIBLE);
    }
    let Some(tree) = ctx.va.cur_tree.and_then(|i| ctx.disk.tree(i)) else {
        return Response::status_pair(sw::UNKNOWN_ERROR);
    };
    let count = match tree.record_count(&file) {
        Ok(c) => c,
        Err(_) => return Response::status_pair(sw::UNKNOWN_ERROR),
    };
    if idx as u32 >= count {
        return Response::status_pair(sw::RECORD_NOT_FOUND);
    }
    let rcrd_size = file.rcrd_size().expect("checked is_record_ef above");
    if cmd.p3 != rcrd_size {
        return Response::status_pair(sw::wrong_le(rcrd_size));
    }
    let bytes = match tree.record_bytes(&file, idx) {
        Ok(b) => b.to_vec(),
        Err(_) => return Response::status_pair(sw::UNKNOWN_ERROR),
    };

    if let Some(sid) = sid_used {
        if ctx.va.select_file_sid(ctx.disk, sid).is_err() {
            return Response::status_pair(sw::UNKNOWN_ERROR);
        }
    }
    if ctx.va.select_record_idx(ctx.disk, idx).is_err() {
        return Response::status_pair(sw::UNKNOWN_ERROR);
    }

    Response::with_data(bytes, sw::NORMAL)
}

pub fn get_response(ctx: &mut HandlerCtx, cmd: &Cmd, procedure_count: u32) -> Response {
    if procedure_count == 0 {
        return Response::status_pair(sw::ACK_ALL_NO_DATA);
    }
    // No Lc field is present on this command, so any data at all means the
    // APDU itself is malformed, not just wrong-length (§4.8.4).
    if !cmd.data.is_empty() {
        return Response::status_pair(sw::NO_LC_EXPECTED);
    }
    if cmd.p1 != 0 || cmd.p2 != 0 {
        return Response::status_pair(sw::INCORRECT_P1P2);
    }
    if cmd.p3 == 0 {
        return Response::status_pair(sw::NORMAL);
    }
    let le = cmd.p3 as usize;
    let avail = ctx.staging.remaining();
    if avail < le {
        return Response::status_pair(sw::EOF_WARNING);
    }
    let data = ctx.staging.drain(le).to_vec();
    let remaining = avail - le;
    if remaining == 0 {
        Response::with_data(data, sw::NORMAL)
    } else if let Ok(remaining_u8) = u8::try_from(remaining) {
        Response::with_data(data, sw::more_available(remaining_u8))
    } else {
        Response::with_data(data, sw::UNKNOWN_ERROR)
    }
}
