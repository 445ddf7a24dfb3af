//! Two-pass BER-TLV encoder (§4.6). No direct teacher analogue exists in the
//! example pack; the shape here is translated from `original_source/src/apduh.c`'s
//! `uicc_dato_bertlv_enc_*` call sequence (dry-run measure, then real emit)
//! into an owned, borrow-checker-friendly builder.
//!
//! Content is written back-to-front: a value's bytes land at the current
//! tail of the output, then its length, then its tag, so that a nested
//! composite's length — known only once every child has been emitted — can
//! be prepended without shifting anything already written.

use crate::error::{Error, Result};

/// A validated 1-4 byte BER-TLV tag.
#[derive(Debug, Clone, Copy)]
pub struct Tag {
    bytes: [u8; 4],
    len: u8,
}

impl Tag {
    /// The common case: a single-byte tag, e.g. `0x62` (FCP template).
    pub fn one(byte: u8) -> Self {
        Tag { bytes: [byte, 0, 0, 0], len: 1 }
    }

    /// Validate a 1-4 byte tag per ISO 7816-4 tag encoding: a single byte
    /// whose low 5 bits are not all set, or a leading byte with low 5 bits
    /// all set followed by 1-3 continuation bytes (bit 7 set on all but the
    /// last).
    pub fn new(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() || bytes.len() > 4 {
            return Err(Error::BadParam("tag must be 1 to 4 bytes".into()));
        }
        let multi_byte_form = bytes[0] & 0x1F == 0x1F;
        if multi_byte_form {
            if bytes.len() < 2 {
                return Err(Error::BadParam("multi-byte tag needs a continuation byte".into()));
            }
            if bytes[1..bytes.len() - 1].iter().any(|b| b & 0x80 == 0) {
                return Err(Error::BadParam("tag continuation byte missing bit 8".into()));
            }
            if bytes[bytes.len() - 1] & 0x80 != 0 {
                return Err(Error::BadParam("tag's final byte must clear bit 8".into()));
            }
        } else if bytes.len() != 1 {
            return Err(Error::BadParam("single-byte tag form given extra bytes".into()));
        }
        let mut arr = [0u8; 4];
        arr[..bytes.len()].copy_from_slice(bytes);
        Ok(Tag { bytes: arr, len: bytes.len() as u8 })
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

/// The shared output sink. `dry()` only counts bytes; `real()` writes into
/// an exactly-sized buffer (obtained from a prior dry run).
pub struct Sink<'a> {
    buf: Option<&'a mut [u8]>,
    end: usize,
}

impl<'a> Sink<'a> {
    pub fn dry() -> Self {
        Sink { buf: None, end: 0 }
    }

    pub fn real(buf: &'a mut [u8]) -> Self {
        Sink { buf: Some(buf), end: 0 }
    }

    /// Bytes written (or counted, in dry mode) so far.
    pub fn len(&self) -> usize {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end == 0
    }

    fn prepend(&mut self, bytes: &[u8]) -> Result<()> {
        match &mut self.buf {
            None => {
                self.end += bytes.len();
                Ok(())
            }
            Some(buf) => {
                let total = buf.len();
                let new_end = self
                    .end
                    .checked_add(bytes.len())
                    .ok_or_else(|| Error::Failure("bertlv length overflow".into()))?;
                if new_end > total {
                    return Err(Error::Failure("bertlv encoder buffer too short".into()));
                }
                let write_end = total - self.end;
                let write_start = total - new_end;
                buf[write_start..write_end].copy_from_slice(bytes);
                self.end = new_end;
                Ok(())
            }
        }
    }
}

fn encode_length(len: usize) -> Vec<u8> {
    if len < 0x80 {
        return vec![len as u8];
    }
    let mut digits = Vec::new();
    let mut n = len;
    while n > 0 {
        digits.insert(0, (n & 0xFF) as u8);
        n >>= 8;
    }
    let mut out = Vec::with_capacity(digits.len() + 1);
    out.push(0x80 | digits.len() as u8);
    out.extend(digits);
    out
}

/// One encoding scope: either the top-level composite or a nested one
/// forked via `nstd_start`. Tracks the total bytes emitted into this scope
/// and the bytes emitted since the last completed tag (awaiting `enc_hdr`
/// to wrap them).
#[derive(Debug, Clone, Copy, Default)]
pub struct Ctx {
    written: usize,
    pending: usize,
}

impl Ctx {
    pub fn new() -> Self {
        Ctx::default()
    }

    /// Append raw value bytes, to be wrapped by the next `enc_hdr` call.
    pub fn enc_data(&mut self, sink: &mut Sink, data: &[u8]) -> Result<()> {
        sink.prepend(data)?;
        self.written += data.len();
        self.pending += data.len();
        Ok(())
    }

    /// Wrap the pending (not yet tagged) bytes with `tag`'s length then tag
    /// octets, completing one TLV unit.
    pub fn enc_hdr(&mut self, sink: &mut Sink, tag: Tag) -> Result<()> {
        let len_bytes = encode_length(self.pending);
        sink.prepend(&len_bytes)?;
        self.written += len_bytes.len();
        sink.prepend(tag.as_bytes())?;
        self.written += tag.as_bytes().len();
        self.pending = 0;
        Ok(())
    }

    /// Fork a nested scope starting at this context's current position. The
    /// child accumulates its own sibling TLVs independently.
    pub fn nstd_start(&self) -> Ctx {
        Ctx { written: self.written, pending: 0 }
    }

    /// Close a nested scope: the bytes the child wrote become this
    /// context's pending value, ready for a following `enc_hdr` to wrap
    /// under the composite's own tag.
    pub fn nstd_end(&mut self, child: Ctx) {
        let value_len = child.written - self.written;
        self.written = child.written;
        self.pending = value_len;
    }
}

/// Run `build` twice — once to measure, once to emit into an exactly-sized
/// buffer — and return the encoded bytes.
pub fn encode(build: impl Fn(&mut Ctx, &mut Sink) -> Result<()>) -> Result<Vec<u8>> {
    let mut dry_ctx = Ctx::new();
    let mut dry_sink = Sink::dry();
    build(&mut dry_ctx, &mut dry_sink)?;
    let len = dry_sink.len();

    let mut buf = vec![0u8; len];
    let mut real_ctx = Ctx::new();
    let mut real_sink = Sink::real(&mut buf);
    build(&mut real_ctx, &mut real_sink)?;
    debug_assert_eq!(real_sink.len(), len);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_primitive_tlv() {
        let out = encode(|ctx, sink| {
            ctx.enc_data(sink, &[0xAA, 0xBB])?;
            ctx.enc_hdr(sink, Tag::one(0x80))
        })
        .unwrap();
        assert_eq!(out, vec![0x80, 0x02, 0xAA, 0xBB]);
    }

    #[test]
    fn sibling_tlvs_in_one_context() {
        // Siblings built back-to-front end up in REVERSE of call order
        // (§4.6: "emission order ... is reverse of reading order").
        let out = encode(|ctx, sink| {
            ctx.enc_data(sink, &[0x01])?;
            ctx.enc_hdr(sink, Tag::one(0x82))?;
            ctx.enc_data(sink, &[0x3F, 0x00])?;
            ctx.enc_hdr(sink, Tag::one(0x83))
        })
        .unwrap();
        assert_eq!(out, vec![0x83, 0x02, 0x3F, 0x00, 0x82, 0x01, 0x01]);
    }

    #[test]
    fn nested_composite_wraps_children() {
        let out = encode(|ctx, sink| {
            let mut inner = ctx.nstd_start();
            inner.enc_data(sink, &[0x01])?;
            inner.enc_hdr(sink, Tag::one(0x82))?;
            ctx.nstd_end(inner);
            ctx.enc_hdr(sink, Tag::one(0x62))
        })
        .unwrap();
        assert_eq!(out, vec![0x62, 0x03, 0x82, 0x01, 0x01]);
    }

    #[test]
    fn empty_composite_is_zero_length() {
        let out = encode(|ctx, sink| {
            let inner = ctx.nstd_start();
            ctx.nstd_end(inner);
            ctx.enc_hdr(sink, Tag::one(0x64))
        })
        .unwrap();
        assert_eq!(out, vec![0x64, 0x00]);
    }

    #[test]
    fn dry_run_length_matches_real_run() {
        let build = |ctx: &mut Ctx, sink: &mut Sink| -> Result<()> {
            ctx.enc_data(sink, &[0; 40])?;
            ctx.enc_hdr(sink, Tag::one(0x80))
        };
        let mut dry_ctx = Ctx::new();
        let mut dry_sink = Sink::dry();
        build(&mut dry_ctx, &mut dry_sink).unwrap();
        let out = encode(build).unwrap();
        assert_eq!(dry_sink.len(), out.len());
    }

    #[test]
    fn long_form_length_used_past_127_bytes() {
        let out = encode(|ctx, sink| {
            ctx.enc_data(sink, &vec![0u8; 200])?;
            ctx.enc_hdr(sink, Tag::one(0x80))
        })
        .unwrap();
        assert_eq!(&out[..3], &[0x80, 0x81, 200]);
        assert_eq!(out.len(), 203);
    }

    #[test]
    fn rejects_malformed_multi_byte_tag() {
        assert!(Tag::new(&[0x1F]).is_err());
        assert!(Tag::new(&[0x1F, 0x80, 0x80]).is_err());
        assert!(Tag::new(&[0x5F, 0x01]).is_ok());
    }
}
