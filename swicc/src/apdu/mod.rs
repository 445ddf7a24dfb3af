//! APDU command decoding, status words, and dispatch (§4.7, §4.8.5).
//! Grounded on `original_source/src/apduh.c`'s `uicc_apduh_demux` (CLA
//! classification, per-INS dispatch) and `uicc_apduh_pro` (procedure byte
//! accounting).

pub mod handlers;

use crate::error::Result;
use crate::fs::{Disk, Va};

/// Status word pairs used throughout the handler set (§6 "Status word set").
pub mod sw {
    pub const NORMAL: (u8, u8) = (0x90, 0x00);
    pub const EOF_WARNING: (u8, u8) = (0x62, 0x82);
    pub const WRONG_LC: (u8, u8) = (0x67, 0x02);
    pub const CMD_INCOMPATIBLE: (u8, u8) = (0x69, 0x81);
    pub const NO_CURRENT_EF: (u8, u8) = (0x69, 0x86);
    pub const WRONG_P1P2: (u8, u8) = (0x6A, 0x00);
    pub const NOT_FOUND: (u8, u8) = (0x6A, 0x82);
    pub const RECORD_NOT_FOUND: (u8, u8) = (0x6A, 0x83);
    pub const INCORRECT_P1P2: (u8, u8) = (0x6A, 0x86);
    pub const INS_NOT_SUPPORTED: (u8, u8) = (0x6D, 0x00);
    pub const CLA_NOT_SUPPORTED: (u8, u8) = (0x6E, 0x00);
    pub const UNKNOWN_ERROR: (u8, u8) = (0x6F, 0x00);
    /// `6100` — ACK-ALL procedure byte for a command with no Lc data,
    /// requesting 0 bytes from the transport before the handler proceeds.
    pub const ACK_ALL_NO_DATA: (u8, u8) = (0x61, 0x00);
    /// `6701` — the command has no Lc field at all, so any data sent is a
    /// malformed APDU rather than merely the wrong length.
    pub const NO_LC_EXPECTED: (u8, u8) = (0x67, 0x01);

    /// `61XX` — normal, XX more bytes available via GET RESPONSE.
    pub fn more_available(count: u8) -> (u8, u8) {
        (0x61, count)
    }

    /// `6CXX` — wrong Le, XX is the correct Le.
    pub fn wrong_le(correct: u8) -> (u8, u8) {
        (0x6C, correct)
    }
}

/// INS byte constants for the handlers implemented here (§4.8).
pub mod ins {
    pub const SELECT: u8 = 0xA4;
    pub const READ_BINARY: u8 = 0xB0;
    pub const READ_BINARY_ODD: u8 = 0xB1;
    pub const READ_RECORD: u8 = 0xB2;
    pub const READ_RECORD_ODD: u8 = 0xB3;
    pub const GET_RESPONSE: u8 = 0xC0;
}

/// CLA byte classification (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaClass {
    /// `0x00`: interindustry, basic logical channel. Logical channels
    /// beyond the basic one are out of scope (see SPEC_FULL Non-goals).
    Interindustry,
    /// `0x8X`, `0x9X`, `0xAX`.
    Proprietary,
    /// Anything else: reserved or malformed.
    Invalid,
}

pub fn classify_cla(cla: u8) -> ClaClass {
    let hi = cla & 0xF0;
    if hi == 0x00 && cla & 0x0F == 0x00 {
        ClaClass::Interindustry
    } else if matches!(hi, 0x80 | 0x90 | 0xA0) {
        ClaClass::Proprietary
    } else {
        ClaClass::Invalid
    }
}

/// A decoded command header, plus whatever data bytes are available for
/// this round of a (possibly multi-round) procedure-byte exchange.
#[derive(Debug, Clone)]
pub struct Cmd {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    /// Either Lc or Le depending on direction; interpreted per handler.
    pub p3: u8,
    pub data: Vec<u8>,
}

impl Cmd {
    /// Parse a short-form APDU header (§4.7). `raw` must be at least 4
    /// bytes (CLA INS P1 P2); a 5th byte is P3; anything past that is data
    /// already supplied for this round (case 3/4 sent in one shot, as
    /// opposed to arriving after an ACK-ALL procedure byte).
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 4 {
            return Err(crate::error::Error::BadParam("apdu shorter than 4 bytes".into()));
        }
        let (cla, ins, p1, p2) = (raw[0], raw[1], raw[2], raw[3]);
        let (p3, data) = match raw.len() {
            4 => (0u8, Vec::new()),
            5 => (raw[4], Vec::new()),
            _ => (raw[4], raw[5..].to_vec()),
        };
        Ok(Cmd { cla, ins, p1, p2, p3, data })
    }
}

/// A decoded response: data bytes plus a status word.
#[derive(Debug, Clone)]
pub struct Response {
    pub sw1: u8,
    pub sw2: u8,
    pub data: Vec<u8>,
}

impl Response {
    pub fn status(sw1: u8, sw2: u8) -> Self {
        Response { sw1, sw2, data: Vec::new() }
    }

    pub fn status_pair((sw1, sw2): (u8, u8)) -> Self {
        Response::status(sw1, sw2)
    }

    pub fn with_data(data: Vec<u8>, (sw1, sw2): (u8, u8)) -> Self {
        Response { sw1, sw2, data }
    }

    pub fn sw(&self) -> u16 {
        ((self.sw1 as u16) << 8) | self.sw2 as u16
    }
}

/// The 256-byte response staging buffer, drained across GET RESPONSE
/// rounds (§3 "Response staging buffer").
#[derive(Debug, Clone)]
pub struct Staging {
    buf: [u8; 256],
    len: usize,
    offset: usize,
}

impl Default for Staging {
    fn default() -> Self {
        Staging { buf: [0u8; 256], len: 0, offset: 0 }
    }
}

impl Staging {
    pub fn new() -> Self {
        Staging::default()
    }

    pub fn reset(&mut self) {
        self.len = 0;
        self.offset = 0;
    }

    /// Stage `data` for draining. Fails if it exceeds capacity.
    pub fn stage(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.buf.len() {
            return Err(crate::error::Error::Failure("staging buffer overflow".into()));
        }
        self.buf[..data.len()].copy_from_slice(data);
        self.len = data.len();
        self.offset = 0;
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.len - self.offset
    }

    /// Take up to `count` bytes starting at the current offset, advancing it.
    pub fn drain(&mut self, count: usize) -> &[u8] {
        let take = count.min(self.remaining());
        let start = self.offset;
        self.offset += take;
        &self.buf[start..start + take]
    }
}

/// Borrowed card state a handler needs: the loaded disk (read-only during
/// command handling, §5), the current selection, and the staging buffer.
pub struct HandlerCtx<'a> {
    pub disk: &'a Disk,
    pub va: &'a mut Va,
    pub staging: &'a mut Staging,
}

/// A proprietary-class command handler, registered by the embedder. Not
/// driven by anything in the interindustry handler set itself.
pub trait ProprietaryHandler {
    fn handle(&mut self, ctx: &mut HandlerCtx, cmd: &Cmd, procedure_count: u32) -> Response;
}

/// Dispatch one command (§4.8.5): classify CLA, then route by INS for the
/// interindustry class, to the registered handler for the proprietary
/// class, or reject RFU/invalid classes outright.
pub fn dispatch(
    ctx: &mut HandlerCtx,
    cmd: &Cmd,
    procedure_count: u32,
    proprietary: Option<&mut (dyn ProprietaryHandler + '_)>,
) -> Response {
    match classify_cla(cmd.cla) {
        ClaClass::Invalid => Response::status_pair(sw::CLA_NOT_SUPPORTED),
        ClaClass::Proprietary => match proprietary {
            Some(handler) => handler.handle(ctx, cmd, procedure_count),
            None => Response::status_pair(sw::INS_NOT_SUPPORTED),
        },
        ClaClass::Interindustry => match cmd.ins {
            ins::SELECT => handlers::select(ctx, cmd, procedure_count),
            ins::READ_BINARY => handlers::read_binary(ctx, cmd, procedure_count),
            ins::READ_BINARY_ODD => Response::status_pair(sw::INS_NOT_SUPPORTED),
            ins::READ_RECORD => handlers::read_record(ctx, cmd, procedure_count),
            ins::READ_RECORD_ODD => Response::status_pair(sw::INS_NOT_SUPPORTED),
            ins::GET_RESPONSE => handlers::get_response(ctx, cmd, procedure_count),
            _ => Response::status_pair(sw::INS_NOT_SUPPORTED),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_basic_channel_as_interindustry() {
        assert_eq!(classify_cla(0x00), ClaClass::Interindustry);
        assert_eq!(classify_cla(0x01), ClaClass::Invalid);
        assert_eq!(classify_cla(0x80), ClaClass::Proprietary);
        assert_eq!(classify_cla(0x94), ClaClass::Proprietary);
        assert_eq!(classify_cla(0xA2), ClaClass::Proprietary);
        assert_eq!(classify_cla(0xF0), ClaClass::Invalid);
    }

    #[test]
    fn parses_header_only_and_full_commands() {
        let header_only = Cmd::parse(&[0x00, 0xA4, 0x04, 0x00, 0x02]).unwrap();
        assert_eq!(header_only.p3, 2);
        assert!(header_only.data.is_empty());

        let full = Cmd::parse(&[0x00, 0xA4, 0x04, 0x00, 0x02, 0x3F, 0x00]).unwrap();
        assert_eq!(full.data, vec![0x3F, 0x00]);
    }

    #[test]
    fn staging_drains_across_rounds() {
        let mut staging = Staging::new();
        staging.stage(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(staging.drain(3), &[1, 2, 3]);
        assert_eq!(staging.remaining(), 2);
        assert_eq!(staging.drain(10), &[4, 5]);
        assert_eq!(staging.remaining(), 0);
    }
}
