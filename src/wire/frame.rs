//! The 24-byte binary KV frame header and framing-extras section (spec §4.A, §6).
//!
//! Grounded in `other_examples/…couchbase-rs…memdx-ops_core.rs` (`RequestPacket`/
//! `ResponsePacket`/`Magic`) for the shape of a memcached-binary-protocol frame, rewritten
//! around this crate's own byte layout rather than that crate's `Dispatcher` abstraction.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, KvStatus, Result};

pub(crate) const HEADER_LEN: usize = 24;

/// Distinguishes request/response and flexible-vs-classic framing (spec §4.A).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Magic {
    Request = 0x80,
    RequestFlexible = 0x08,
    Response = 0x81,
    ResponseFlexible = 0x18,
}

impl Magic {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0x80 => Ok(Self::Request),
            0x08 => Ok(Self::RequestFlexible),
            0x81 => Ok(Self::Response),
            0x18 => Ok(Self::ResponseFlexible),
            other => Err(Error::parsing_failure(format!("unrecognized frame magic {other:#x}"))),
        }
    }

    pub(crate) fn is_flexible(self) -> bool {
        matches!(self, Self::RequestFlexible | Self::ResponseFlexible)
    }

    pub(crate) fn is_response(self) -> bool {
        matches!(self, Self::Response | Self::ResponseFlexible)
    }
}

bitflags::bitflags! {
    /// Datatype byte: may mark the value as JSON, snappy-compressed, and/or carrying xattrs.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Datatype: u8 {
        const RAW = 0x00;
        const JSON = 0x01;
        const COMPRESSED = 0x02;
        const XATTR = 0x04;
    }
}

/// One fully-framed binary KV message, header plus body sections. Encoding/decoding here is
/// pure — no I/O — per the wire-codec contract in spec §4.A.
#[derive(Clone, Debug)]
pub(crate) struct KvFrame {
    pub(crate) magic: Magic,
    pub(crate) opcode: u8,
    pub(crate) datatype: Datatype,
    /// Request vbucket id, or response status code — same wire slot (spec §4.A).
    pub(crate) vbucket_or_status: u16,
    pub(crate) opaque: u32,
    pub(crate) cas: u64,
    pub(crate) framing_extras: Vec<u8>,
    pub(crate) extras: Vec<u8>,
    pub(crate) key: Vec<u8>,
    pub(crate) value: Vec<u8>,
}

impl KvFrame {
    /// Assembles a request frame. `framing_extras` is empty unless durability/preserve-expiry
    /// is in play, in which case `magic` must be [`Magic::RequestFlexible`].
    pub(crate) fn request(
        opcode: u8,
        vbucket: u16,
        opaque: u32,
        cas: u64,
        datatype: Datatype,
        framing_extras: Vec<u8>,
        extras: Vec<u8>,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> Self {
        let magic = if framing_extras.is_empty() {
            Magic::Request
        } else {
            Magic::RequestFlexible
        };
        Self {
            magic,
            opcode,
            datatype,
            vbucket_or_status: vbucket,
            opaque,
            cas,
            framing_extras,
            extras,
            key,
            value,
        }
    }

    pub(crate) fn status(&self) -> KvStatus {
        KvStatus::from_wire(self.vbucket_or_status)
    }

    /// Serializes the frame to its 24-byte-header-plus-body wire form.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let framing_and_extras_len = self.framing_extras.len() + self.extras.len();
        let body_len = framing_and_extras_len + self.key.len() + self.value.len();
        let mut buf = Vec::with_capacity(HEADER_LEN + body_len);

        buf.push(self.magic as u8);
        buf.push(self.opcode);

        let mut scratch = [0u8; 8];
        BigEndian::write_u16(&mut scratch[..2], self.key.len() as u16);
        buf.extend_from_slice(&scratch[..2]);

        // extras_len and framing-extras length share byte 4: for flexible framing this byte is
        // the combined framing-extras length, and extras_len is folded into `total_body_len`
        // accounting the same as classic framing (extras always directly follow framing extras).
        buf.push(if self.magic.is_flexible() {
            self.framing_extras.len() as u8
        } else {
            self.extras.len() as u8
        });
        buf.push(self.datatype.bits());

        BigEndian::write_u16(&mut scratch[..2], self.vbucket_or_status);
        buf.extend_from_slice(&scratch[..2]);

        BigEndian::write_u32(&mut scratch[..4], body_len as u32);
        buf.extend_from_slice(&scratch[..4]);

        BigEndian::write_u32(&mut scratch[..4], self.opaque);
        buf.extend_from_slice(&scratch[..4]);

        BigEndian::write_u64(&mut scratch[..8], self.cas);
        buf.extend_from_slice(&scratch[..8]);

        debug_assert_eq!(buf.len(), HEADER_LEN);
        buf.extend_from_slice(&self.framing_extras);
        buf.extend_from_slice(&self.extras);
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);
        buf
    }

    /// Parses the 24-byte header only, returning the header fields and `total_body_len` so the
    /// caller knows how many more bytes to read before calling [`Self::decode_body`].
    pub(crate) fn decode_header(header: &[u8; HEADER_LEN]) -> Result<ParsedHeader> {
        let magic = Magic::from_byte(header[0])?;
        let opcode = header[1];
        let key_len = BigEndian::read_u16(&header[2..4]);
        let extras_or_framing_len = header[4];
        let datatype =
            Datatype::from_bits(header[5]).ok_or_else(|| Error::parsing_failure("invalid datatype byte"))?;
        let vbucket_or_status = BigEndian::read_u16(&header[6..8]);
        let total_body_len = BigEndian::read_u32(&header[8..12]);
        let opaque = BigEndian::read_u32(&header[12..16]);
        let cas = BigEndian::read_u64(&header[16..24]);

        Ok(ParsedHeader {
            magic,
            opcode,
            key_len,
            extras_or_framing_len,
            datatype,
            vbucket_or_status,
            total_body_len,
            opaque,
            cas,
        })
    }

    /// Splits a fully-read body (`total_body_len` bytes) into framing-extras/extras/key/value
    /// per the parsed header, and assembles the complete frame.
    ///
    /// The wire only carries one extras-length byte, which means something different depending
    /// on framing: for classic frames it is `extras_len` directly; for flexible frames it is
    /// `framing_extras_len`, and `extras_len` itself is never sent — every command that uses
    /// flexible framing also has a fixed, opcode-known extras size, so the caller (the per-op
    /// decoder in `wire::kv_ops`) supplies it as `flexible_extras_len`. Classic frames ignore
    /// that parameter.
    pub(crate) fn decode_body(header: ParsedHeader, body: Vec<u8>, flexible_extras_len: usize) -> Result<Self> {
        let mut offset = 0usize;
        let (framing_extras, extras_len) = if header.magic.is_flexible() {
            let len = header.extras_or_framing_len as usize;
            let slice = body
                .get(offset..offset + len)
                .ok_or_else(|| Error::parsing_failure("frame shorter than its framing-extras length"))?
                .to_vec();
            offset += len;
            (slice, flexible_extras_len)
        } else {
            (Vec::new(), header.extras_or_framing_len as usize)
        };

        let extras = body
            .get(offset..offset + extras_len)
            .ok_or_else(|| Error::parsing_failure("frame shorter than its extras length"))?
            .to_vec();
        offset += extras_len;

        let key_len = header.key_len as usize;
        let key = body
            .get(offset..offset + key_len)
            .ok_or_else(|| Error::parsing_failure("frame shorter than its key length"))?
            .to_vec();
        offset += key_len;

        let value = body.get(offset..).unwrap_or_default().to_vec();

        Ok(Self {
            magic: header.magic,
            opcode: header.opcode,
            datatype: header.datatype,
            vbucket_or_status: header.vbucket_or_status,
            opaque: header.opaque,
            cas: header.cas,
            framing_extras,
            extras,
            key,
            value,
        })
    }
}

/// Header fields parsed ahead of reading the variable-length body, so the connection's read
/// loop knows how many more bytes to pull off the socket (spec §4.B).
#[derive(Clone, Copy, Debug)]
pub(crate) struct ParsedHeader {
    pub(crate) magic: Magic,
    pub(crate) opcode: u8,
    pub(crate) key_len: u16,
    pub(crate) extras_or_framing_len: u8,
    pub(crate) datatype: Datatype,
    pub(crate) vbucket_or_status: u16,
    pub(crate) total_body_len: u32,
    pub(crate) opaque: u32,
    pub(crate) cas: u64,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_round_trips_through_encode_and_decode() {
        let frame = KvFrame::request(
            0x01, // Set
            42,
            7,
            0,
            Datatype::JSON,
            Vec::new(),
            vec![0, 0, 0, 0, 0, 0, 0, 0],
            b"k1".to_vec(),
            b"{\"a\":1}".to_vec(),
        );
        let bytes = frame.encode();
        assert_eq!(bytes.len(), HEADER_LEN + 8 + 2 + 7);

        let mut header_bytes = [0u8; HEADER_LEN];
        header_bytes.copy_from_slice(&bytes[..HEADER_LEN]);
        let header = KvFrame::decode_header(&header_bytes).unwrap();
        assert_eq!(header.opcode, 0x01);
        assert_eq!(header.key_len, 2);
        assert_eq!(header.total_body_len as usize, 8 + 2 + 7);

        let body = bytes[HEADER_LEN..].to_vec();
        let decoded = KvFrame::decode_body(header, body, 0).unwrap();
        assert_eq!(decoded.key, b"k1");
        assert_eq!(decoded.value, b"{\"a\":1}");
        assert_eq!(decoded.opaque, 7);
    }

    #[test]
    fn response_status_maps_to_kv_status() {
        let frame = KvFrame {
            magic: Magic::Response,
            opcode: 0x01,
            datatype: Datatype::RAW,
            vbucket_or_status: 0x01,
            opaque: 1,
            cas: 0,
            framing_extras: Vec::new(),
            extras: Vec::new(),
            key: Vec::new(),
            value: Vec::new(),
        };
        assert_eq!(frame.status(), KvStatus::from_wire(0x01));
    }
}
