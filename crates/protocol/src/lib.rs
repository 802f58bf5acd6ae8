//! Wire protocol spoken between the HLHV queen and its cells.
//!
//! Every message on a cell connection is a *frame*: a u32 big-endian length
//! prefix, a one-byte kind code, then the payload. Control frames carry a
//! JSON object; the body frames ([`FrameKind::HttpReqBody`] and
//! [`FrameKind::HttpResBody`]) carry raw bytes.
//!
//! [`codec::FrameReader`] and [`codec::FrameWriter`] wrap any async stream
//! half and speak this format. Payload types live at the crate root and
//! serialize with the exact field names cells expect on the wire.

pub mod codec;
mod error;
mod frame;

pub use error::FrameError;
pub use frame::{
    Accept, ConnKind, HttpReqEnd, HttpReqHead, HttpResEnd, HttpResHead, HttpResWant, IAm, Mount,
    NeedBand, Unmount,
};

/// Kind code carried in the first payload byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Logon request, the first frame on any new connection.
    IAm = 0x00,
    /// Logon acknowledgement from the queen.
    Accept = 0x01,
    /// Queen asks the cell to dial additional bands.
    NeedBand = 0x02,
    /// Cell asks to register a host+path pattern.
    Mount = 0x10,
    /// Cell asks to drop its registered pattern.
    Unmount = 0x11,
    /// Head of a forwarded HTTP request.
    HttpReqHead = 0x20,
    /// One chunk of forwarded request body.
    HttpReqBody = 0x21,
    /// End of the forwarded request body.
    HttpReqEnd = 0x22,
    /// Cell asks for the request body, bounded by a byte cap.
    HttpResWant = 0x30,
    /// Status code and headers of the cell's response.
    HttpResHead = 0x31,
    /// One chunk of response body.
    HttpResBody = 0x32,
    /// End of the response.
    HttpResEnd = 0x33,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(code: u8) -> Result<Self, FrameError> {
        match code {
            0x00 => Ok(Self::IAm),
            0x01 => Ok(Self::Accept),
            0x02 => Ok(Self::NeedBand),
            0x10 => Ok(Self::Mount),
            0x11 => Ok(Self::Unmount),
            0x20 => Ok(Self::HttpReqHead),
            0x21 => Ok(Self::HttpReqBody),
            0x22 => Ok(Self::HttpReqEnd),
            0x30 => Ok(Self::HttpResWant),
            0x31 => Ok(Self::HttpResHead),
            0x32 => Ok(Self::HttpResBody),
            0x33 => Ok(Self::HttpResEnd),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}
