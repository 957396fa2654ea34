use thiserror::Error;

use crate::{BINARY_REQ_MAGIC, BINARY_RES_MAGIC, text::KEY_MAX_LENGTH};

pub const HEADER_LEN: usize = 24;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// First byte of a latched-binary request was not 0x80. Fatal for the
    /// connection.
    #[error("bad request magic {0:#04x}")]
    BadMagic(u8),
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    /// extlen/keylen/bodylen do not match the opcode's frame schema.
    #[error("invalid frame for opcode")]
    Schema,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Quit = 0x07,
    Flush = 0x08,
    GetQ = 0x09,
    Noop = 0x0a,
    Version = 0x0b,
    GetK = 0x0c,
    GetKQ = 0x0d,
    Append = 0x0e,
    Prepend = 0x0f,
    Stat = 0x10,
    SetQ = 0x11,
    AddQ = 0x12,
    ReplaceQ = 0x13,
    DeleteQ = 0x14,
    IncrementQ = 0x15,
    DecrementQ = 0x16,
    QuitQ = 0x17,
    FlushQ = 0x18,
    AppendQ = 0x19,
    PrependQ = 0x1a,
}

impl Opcode {
    pub fn from_u8(raw: u8) -> Result<Self, FrameError> {
        use Opcode::*;
        Ok(match raw {
            0x00 => Get,
            0x01 => Set,
            0x02 => Add,
            0x03 => Replace,
            0x04 => Delete,
            0x05 => Increment,
            0x06 => Decrement,
            0x07 => Quit,
            0x08 => Flush,
            0x09 => GetQ,
            0x0a => Noop,
            0x0b => Version,
            0x0c => GetK,
            0x0d => GetKQ,
            0x0e => Append,
            0x0f => Prepend,
            0x10 => Stat,
            0x11 => SetQ,
            0x12 => AddQ,
            0x13 => ReplaceQ,
            0x14 => DeleteQ,
            0x15 => IncrementQ,
            0x16 => DecrementQ,
            0x17 => QuitQ,
            0x18 => FlushQ,
            0x19 => AppendQ,
            0x1a => PrependQ,
            other => return Err(FrameError::UnknownOpcode(other)),
        })
    }

    /// The non-quiet opcode this one executes as.
    pub fn base(self) -> Self {
        use Opcode::*;
        match self {
            GetQ => Get,
            GetKQ => GetK,
            SetQ => Set,
            AddQ => Add,
            ReplaceQ => Replace,
            DeleteQ => Delete,
            IncrementQ => Increment,
            DecrementQ => Decrement,
            QuitQ => Quit,
            FlushQ => Flush,
            AppendQ => Append,
            PrependQ => Prepend,
            other => other,
        }
    }

    /// Quiet variants suppress success replies; quiet GETs also turn
    /// misses into silence.
    pub fn is_quiet(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            GetQ | GetKQ |
                SetQ |
                AddQ |
                ReplaceQ |
                DeleteQ |
                IncrementQ |
                DecrementQ |
                QuitQ |
                FlushQ |
                AppendQ |
                PrependQ
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    Ok = 0x0000,
    KeyNotFound = 0x0001,
    KeyExists = 0x0002,
    TooBig = 0x0003,
    InvalidArgs = 0x0004,
    NotStored = 0x0005,
    UnknownCommand = 0x0081,
    OutOfMemory = 0x0082,
}

/// The fixed request header, fields in host order; the wire is big-endian.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestHeader {
    pub opcode: Opcode,
    pub keylen: u16,
    pub extlen: u8,
    pub bodylen: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl RequestHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, FrameError> {
        assert!(buf.len() >= HEADER_LEN, "short binary header");
        if buf[0] != BINARY_REQ_MAGIC {
            return Err(FrameError::BadMagic(buf[0]));
        }
        let header = Self {
            opcode: Opcode::from_u8(buf[1])?,
            keylen: u16::from_be_bytes([buf[2], buf[3]]),
            extlen: buf[4],
            bodylen: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            opaque: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            cas: u64::from_be_bytes(buf[16..24].try_into().expect("8 byte slice")),
        };
        header.validate()?;
        Ok(header)
    }

    /// `bodylen − keylen − extlen`, the value payload length.
    pub fn value_len(&self) -> usize {
        (self.bodylen as usize)
            .saturating_sub(self.keylen as usize)
            .saturating_sub(self.extlen as usize)
    }

    fn validate(&self) -> Result<(), FrameError> {
        use Opcode::*;
        let keylen = self.keylen as usize;
        let extlen = self.extlen as usize;
        let Some(value) =
            (self.bodylen as usize).checked_sub(keylen).and_then(|v| v.checked_sub(extlen))
        else {
            return Err(FrameError::Schema);
        };
        if keylen > KEY_MAX_LENGTH {
            return Err(FrameError::Schema);
        }
        let ok = match self.opcode.base() {
            Get | GetK => extlen == 0 && keylen > 0 && value == 0,
            Set | Add | Replace => extlen == 8 && keylen > 0,
            Append | Prepend => extlen == 0 && keylen > 0,
            Delete => extlen == 0 && keylen > 0 && value == 0,
            Increment | Decrement => extlen == 20 && keylen > 0 && value == 0,
            Quit | Noop | Version => extlen == 0 && keylen == 0 && value == 0,
            Flush => (extlen == 0 || extlen == 4) && keylen == 0 && value == 0,
            Stat => extlen == 0 && value == 0,
            _ => unreachable!("base() returns non-quiet opcodes"),
        };
        if ok { Ok(()) } else { Err(FrameError::Schema) }
    }
}

/// Response header builder; `encode` emits the 24 wire bytes in network
/// order (the 64-bit CAS included). The opcode is the raw wire byte so
/// error responses can echo opcodes the server does not know.
#[derive(Clone, Copy, Debug)]
pub struct ResponseHeader {
    pub opcode: u8,
    pub keylen: u16,
    pub extlen: u8,
    pub status: Status,
    pub bodylen: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl ResponseHeader {
    pub fn new(req: &RequestHeader, status: Status) -> Self {
        Self {
            opcode: req.opcode as u8,
            keylen: 0,
            extlen: 0,
            status,
            bodylen: 0,
            opaque: req.opaque,
            cas: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = BINARY_RES_MAGIC;
        out[1] = self.opcode;
        out[2..4].copy_from_slice(&self.keylen.to_be_bytes());
        out[4] = self.extlen;
        // out[5]: datatype, always raw bytes
        out[6..8].copy_from_slice(&(self.status as u16).to_be_bytes());
        out[8..12].copy_from_slice(&self.bodylen.to_be_bytes());
        out[12..16].copy_from_slice(&self.opaque.to_be_bytes());
        out[16..24].copy_from_slice(&self.cas.to_be_bytes());
        out
    }
}

/// Extras of SET/ADD/REPLACE: flags then expiration.
pub fn parse_store_extras(extras: &[u8]) -> (u32, u32) {
    let flags = u32::from_be_bytes(extras[..4].try_into().expect("4 byte slice"));
    let exptime = u32::from_be_bytes(extras[4..8].try_into().expect("4 byte slice"));
    (flags, exptime)
}

/// Extras of INCREMENT/DECREMENT: delta, initial value, expiration.
/// An expiration of `0xffffffff` means "do not create on miss".
pub fn parse_delta_extras(extras: &[u8]) -> (u64, u64, u32) {
    let delta = u64::from_be_bytes(extras[..8].try_into().expect("8 byte slice"));
    let initial = u64::from_be_bytes(extras[8..16].try_into().expect("8 byte slice"));
    let exptime = u32::from_be_bytes(extras[16..20].try_into().expect("4 byte slice"));
    (delta, initial, exptime)
}

pub const DELTA_NO_CREATE: u32 = 0xffff_ffff;

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_header(opcode: u8, keylen: u16, extlen: u8, bodylen: u32) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = BINARY_REQ_MAGIC;
        buf[1] = opcode;
        buf[2..4].copy_from_slice(&keylen.to_be_bytes());
        buf[4] = extlen;
        buf[8..12].copy_from_slice(&bodylen.to_be_bytes());
        buf
    }

    #[test]
    fn parses_a_get() {
        let header = RequestHeader::parse(&raw_header(0x00, 3, 0, 3)).unwrap();
        assert_eq!(header.opcode, Opcode::Get);
        assert_eq!(header.keylen, 3);
        assert_eq!(header.value_len(), 0);
    }

    #[test]
    fn bad_magic_is_fatal() {
        let mut buf = raw_header(0x00, 3, 0, 3);
        buf[0] = 0x79;
        assert_eq!(RequestHeader::parse(&buf).unwrap_err(), FrameError::BadMagic(0x79));
    }

    #[test]
    fn schema_mismatches() {
        // GET with extras.
        assert_eq!(
            RequestHeader::parse(&raw_header(0x00, 3, 4, 7)).unwrap_err(),
            FrameError::Schema
        );
        // SET without extras.
        assert_eq!(
            RequestHeader::parse(&raw_header(0x01, 3, 0, 8)).unwrap_err(),
            FrameError::Schema
        );
        // bodylen smaller than keylen.
        assert_eq!(
            RequestHeader::parse(&raw_header(0x04, 8, 0, 3)).unwrap_err(),
            FrameError::Schema
        );
        // Oversized key.
        assert_eq!(
            RequestHeader::parse(&raw_header(0x00, 300, 0, 300)).unwrap_err(),
            FrameError::Schema
        );
        // NOOP with a body.
        assert_eq!(
            RequestHeader::parse(&raw_header(0x0a, 0, 0, 1)).unwrap_err(),
            FrameError::Schema
        );
    }

    #[test]
    fn quiet_maps_to_base() {
        assert_eq!(Opcode::GetKQ.base(), Opcode::GetK);
        assert_eq!(Opcode::SetQ.base(), Opcode::Set);
        assert!(Opcode::SetQ.is_quiet());
        assert!(!Opcode::Set.is_quiet());
    }

    #[test]
    fn incr_schema_and_extras() {
        let header = RequestHeader::parse(&raw_header(0x05, 3, 20, 23)).unwrap();
        assert_eq!(header.opcode, Opcode::Increment);

        let mut extras = [0u8; 20];
        extras[..8].copy_from_slice(&5u64.to_be_bytes());
        extras[8..16].copy_from_slice(&100u64.to_be_bytes());
        extras[16..20].copy_from_slice(&DELTA_NO_CREATE.to_be_bytes());
        assert_eq!(parse_delta_extras(&extras), (5, 100, DELTA_NO_CREATE));
    }

    #[test]
    fn response_encodes_network_order() {
        let req = RequestHeader::parse(&raw_header(0x01, 1, 8, 9)).unwrap();
        let mut res = ResponseHeader::new(&req, Status::Ok);
        res.cas = 0x0102_0304_0506_0708;
        res.bodylen = 4;
        let wire = res.encode();
        assert_eq!(wire[0], BINARY_RES_MAGIC);
        assert_eq!(wire[1], 0x01);
        assert_eq!(&wire[8..12], &4u32.to_be_bytes());
        assert_eq!(&wire[16..24], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
