//! Wire codec. Every datagram is one frame; all fields are little-endian
//! and the checksum always covers the bytes that follow it.
//!
//! Control frame, exactly 8 bytes:
//! crc16 (2) | command (2) | app_id (2) | app_version (2)
//!
//! Data frame, strictly more than 8 bytes:
//! crc32 (4) | app_id (2) | app_version (2) | payload

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use keel::crc;
use std::io;

/// Size of a control frame, and of the header preceding data bytes.
pub const HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Command {
    Connect = 1,
    Disconnect = 2,
}

/// Why a datagram failed to decode. Every case is a silent drop.
#[derive(Debug, Eq, PartialEq)]
pub enum FrameError {
    Runt,
    Oversize,
    Checksum,
    BadCommand,
}

impl From<io::Error> for FrameError {
    #[inline]
    fn from(_: io::Error) -> Self {
        FrameError::Runt
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum Frame<'a> {
    Control {
        command: Command,
        app_id: u16,
        app_version: u16,
    },
    Data {
        app_id: u16,
        app_version: u16,
        payload: &'a [u8],
    },
}

impl<'a> Frame<'a> {
    #[inline]
    pub fn app_id(&self) -> u16 {
        match *self {
            Frame::Control { app_id, .. } => app_id,
            Frame::Data { app_id, .. } => app_id,
        }
    }

    #[inline]
    pub fn app_version(&self) -> u16 {
        match *self {
            Frame::Control { app_version, .. } => app_version,
            Frame::Data { app_version, .. } => app_version,
        }
    }

    /// Decodes one datagram, verifying its checksum.
    pub fn decode(datagram: &'a [u8], max_payload_size: usize) -> Result<Frame<'a>, FrameError> {
        if datagram.len() < HEADER_SIZE {
            return Err(FrameError::Runt);
        }

        let mut reader = datagram;

        if datagram.len() == HEADER_SIZE {
            let expected = reader.read_u16::<LittleEndian>()?;
            if crc::crc16(&datagram[2..], 0) != expected {
                return Err(FrameError::Checksum);
            }

            let command = reader.read_u16::<LittleEndian>()?;
            let app_id = reader.read_u16::<LittleEndian>()?;
            let app_version = reader.read_u16::<LittleEndian>()?;

            let command = match command {
                1 => Command::Connect,
                2 => Command::Disconnect,
                _ => return Err(FrameError::BadCommand),
            };

            return Ok(Frame::Control {
                command,
                app_id,
                app_version,
            });
        }

        if datagram.len() > max_payload_size + HEADER_SIZE {
            return Err(FrameError::Oversize);
        }

        let expected = reader.read_u32::<LittleEndian>()?;
        if crc::crc32(&datagram[4..], 0) != expected {
            return Err(FrameError::Checksum);
        }

        let app_id = reader.read_u16::<LittleEndian>()?;
        let app_version = reader.read_u16::<LittleEndian>()?;

        Ok(Frame::Data {
            app_id,
            app_version,
            payload: &datagram[HEADER_SIZE..],
        })
    }
}

/// Encodes a control frame.
pub fn encode_control(command: Command, app_id: u16, app_version: u16) -> [u8; HEADER_SIZE] {
    let mut frame = [0u8; HEADER_SIZE];

    {
        let mut writer = &mut frame[2..];
        writer
            .write_u16::<LittleEndian>(command as u16)
            .expect("Error writing command");
        writer
            .write_u16::<LittleEndian>(app_id)
            .expect("Error writing app id");
        writer
            .write_u16::<LittleEndian>(app_version)
            .expect("Error writing app version");
    }

    let checksum = crc::crc16(&frame[2..], 0);
    LittleEndian::write_u16(&mut frame[..2], checksum);

    frame
}

/// Encodes a data frame into `out`, which must hold `payload.len() + 8`
/// bytes. Returns the datagram length.
pub fn encode_data(out: &mut [u8], app_id: u16, app_version: u16, payload: &[u8]) -> usize {
    let total = HEADER_SIZE + payload.len();

    {
        let mut writer = &mut out[4..];
        writer
            .write_u16::<LittleEndian>(app_id)
            .expect("Error writing app id");
        writer
            .write_u16::<LittleEndian>(app_version)
            .expect("Error writing app version");
    }
    out[HEADER_SIZE..total].copy_from_slice(payload);

    let checksum = crc::crc32(&out[4..total], 0);
    LittleEndian::write_u32(&mut out[..4], checksum);

    total
}
