/// Frame decoding and reading resolution for the MKR sensor board
use log::debug;
use std::num::ParseIntError;

use crate::error::{FrameError, ResolveError};
use crate::models::{Channel, DecodedFrame, MeasurementSet, CHANNEL_COUNT, DATA_LEN, FRAME_LEN};
use crate::utils::now_local;

/// Raw byte value meaning "no data captured at this position"
///
/// A genuine zero byte cannot be told apart from this; both decode to 0.
const NO_DATA: u8 = 0;

/// Render a byte as lowercase hex text and parse it back as base 16
pub fn hex_round_trip(byte: u8) -> Result<u8, ParseIntError> {
    u8::from_str_radix(&format!("{:x}", byte), 16)
}

/// Decode the 16 data bytes of a raw frame
///
/// The frame must be at least [`FRAME_LEN`] bytes long (data + terminator);
/// anything past the 16th byte is ignored.
pub fn decode(frame: &[u8]) -> Result<DecodedFrame, FrameError> {
    decode_with(frame, hex_round_trip)
}

/// Decode with a caller-supplied per-byte step; zero bytes never reach `hex`
pub fn decode_with<F>(frame: &[u8], mut hex: F) -> Result<DecodedFrame, FrameError>
where
    F: FnMut(u8) -> Result<u8, ParseIntError>,
{
    if frame.len() < FRAME_LEN {
        return Err(FrameError::TooShort {
            actual: frame.len(),
            required: FRAME_LEN,
        });
    }

    let mut decoded = [0u8; DATA_LEN];
    for (index, (slot, &byte)) in decoded.iter_mut().zip(frame).enumerate() {
        *slot = match byte {
            NO_DATA => 0,
            _ => hex(byte).map_err(|source| FrameError::HexDigit { index, source })?,
        };
    }

    debug!("Decoded payload: {:?}", decoded);
    Ok(DecodedFrame(decoded))
}

/// Combine a channel's low and high byte into a scaled reading
pub fn resolve(decoded: &DecodedFrame, channel: &Channel) -> Result<f64, ResolveError> {
    let byte_at = |index: usize| {
        decoded.get(index).ok_or(ResolveError::IndexOutOfRange {
            channel: channel.name,
            index,
            len: DATA_LEN,
        })
    };
    let low = byte_at(channel.low)?;
    let high = byte_at(channel.high)?;

    let combined = u16::from_le_bytes([low, high]);
    Ok(f64::from(combined) / channel.scale)
}

/// Resolve every channel of the table in order and stamp the capture time
pub fn resolve_all(
    decoded: &DecodedFrame,
    channels: &[Channel; CHANNEL_COUNT],
) -> Result<MeasurementSet, ResolveError> {
    let mut readings = [0.0; CHANNEL_COUNT];
    for (reading, channel) in readings.iter_mut().zip(channels) {
        *reading = resolve(decoded, channel)?;
        debug!("{}: {}", channel.name, reading);
    }

    Ok(MeasurementSet::valid(readings, now_local()))
}
