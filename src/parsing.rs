//! Binary parsing utilities for the Crownstone UART protocol
//!
//! Covers the payloads that are re-emitted as-is after wrapping. Dense
//! telemetry payloads are left to a [`PayloadDecoder`](crate::decoders::PayloadDecoder).

use crate::error::Error;
use crate::events::{
    AssetIdReport, AssetMacReport, HelloPacket, LogArrayRecord, LogHeader, LogRecord,
    ResultPacket,
};
use crate::Result;

/// Read a little-endian u16 from a byte slice
pub fn read_u16_le(data: &[u8], offset: usize) -> Result<u16> {
    if offset + 2 > data.len() {
        return Err(Error::decode("Buffer too short for u16"));
    }
    Ok(u16::from_le_bytes([data[offset], data[offset + 1]]))
}

/// Read a little-endian u32 from a byte slice
pub fn read_u32_le(data: &[u8], offset: usize) -> Result<u32> {
    if offset + 4 > data.len() {
        return Err(Error::decode("Buffer too short for u32"));
    }
    Ok(u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ]))
}

/// Read a single byte
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8> {
    data.get(offset)
        .copied()
        .ok_or_else(|| Error::decode("Buffer too short for u8"))
}

/// Read a signed byte
pub fn read_i8(data: &[u8], offset: usize) -> Result<i8> {
    read_u8(data, offset).map(|b| b as i8)
}

/// Read a fixed-size byte array
pub fn read_bytes<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N]> {
    if offset + N > data.len() {
        return Err(Error::decode(format!("Buffer too short for {} bytes", N)));
    }
    let mut arr = [0u8; N];
    arr.copy_from_slice(&data[offset..offset + N]);
    Ok(arr)
}

/// Render a little-endian MAC address as `AA:BB:CC:DD:EE:FF`
pub fn format_mac_address(mac: &[u8; 6]) -> String {
    mac.iter()
        .rev()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Map every byte onto the char with the same code point
pub fn bytes_to_latin1(data: &[u8]) -> String {
    data.iter().map(|&b| b as char).collect()
}

/// Keep only the 7-bit ASCII bytes of a console log line
pub fn ascii_only(data: &[u8]) -> String {
    data.iter()
        .filter(|b| b.is_ascii())
        .map(|&b| b as char)
        .collect()
}

/// Parse a hello reply (2 bytes)
///
/// Format: `[SPHERE_UID][STATUS_FLAGS]`
pub fn parse_hello(data: &[u8]) -> Result<HelloPacket> {
    if data.len() < 2 {
        return Err(Error::decode(format!(
            "Hello packet too short: {} bytes",
            data.len()
        )));
    }

    let status = data[1];
    Ok(HelloPacket {
        sphere_uid: data[0],
        encryption_required: status & 0x01 != 0,
        has_been_set_up: status & 0x02 != 0,
        hub_mode: status & 0x04 != 0,
        has_error: status & 0x08 != 0,
    })
}

/// Parse a result packet
///
/// Format: `[TYPE_L][TYPE_H][CODE_L][CODE_H][SIZE_L][SIZE_H][PAYLOAD...]`
pub fn parse_result_packet(data: &[u8]) -> Result<ResultPacket> {
    let command_type = read_u16_le(data, 0)?;
    let result_code = read_u16_le(data, 2)?;
    let size = read_u16_le(data, 4)? as usize;

    if data.len() < 6 + size {
        return Err(Error::decode(format!(
            "Result packet announces {} payload bytes, {} available",
            size,
            data.len() - 6
        )));
    }

    Ok(ResultPacket {
        command_type,
        result_code,
        payload: data[6..6 + size].to_vec(),
    })
}

/// Parse the header shared by log records and log arrays (8 bytes)
fn parse_log_header(data: &[u8]) -> Result<LogHeader> {
    let file_name_hash = read_u32_le(data, 0)?;
    let line_number = read_u16_le(data, 4)?;
    let level = read_u8(data, 6)?;
    let flags = read_u8(data, 7)?;

    Ok(LogHeader {
        file_name_hash,
        line_number,
        level,
        new_line: flags & 0x01 != 0,
    })
}

/// Parse a binary log record
///
/// Format: `[HEADER (8)][NUM_ARGS]` followed by `[SIZE][DATA...]` per argument
pub fn parse_log(data: &[u8]) -> Result<LogRecord> {
    let header = parse_log_header(data)?;
    let num_args = read_u8(data, 8)? as usize;

    let mut args = Vec::with_capacity(num_args);
    let mut offset = 9;
    for _ in 0..num_args {
        let size = read_u8(data, offset)? as usize;
        offset += 1;
        if offset + size > data.len() {
            return Err(Error::decode(format!(
                "Log argument of {} bytes exceeds payload",
                size
            )));
        }
        args.push(data[offset..offset + size].to_vec());
        offset += size;
    }

    Ok(LogRecord { header, args })
}

/// Parse a binary log array
///
/// Format: `[HEADER (8)][ELEMENT_TYPE][ELEMENT_SIZE][ELEMENTS...]`
pub fn parse_log_array(data: &[u8]) -> Result<LogArrayRecord> {
    let header = parse_log_header(data)?;
    let element_type = read_u8(data, 8)?;
    let element_size = read_u8(data, 9)?;

    let body = &data[10..];
    if element_size == 0 {
        if !body.is_empty() {
            return Err(Error::decode("Log array with zero element size"));
        }
        return Ok(LogArrayRecord {
            header,
            element_type,
            element_size,
            elements: Vec::new(),
        });
    }

    if body.len() % element_size as usize != 0 {
        return Err(Error::decode(format!(
            "Log array of {} bytes is not a multiple of element size {}",
            body.len(),
            element_size
        )));
    }

    let elements = body
        .chunks(element_size as usize)
        .map(|chunk| chunk.to_vec())
        .collect();

    Ok(LogArrayRecord {
        header,
        element_type,
        element_size,
        elements,
    })
}

/// Parse an asset MAC/RSSI report (8 bytes)
///
/// Format: `[MAC (6, little endian)][RSSI][CHANNEL]`
pub fn parse_asset_mac_report(data: &[u8]) -> Result<AssetMacReport> {
    let mac: [u8; 6] = read_bytes(data, 0)?;
    let rssi = read_i8(data, 6)?;
    let channel = read_u8(data, 7)?;

    Ok(AssetMacReport {
        mac_address: format_mac_address(&mac),
        rssi,
        channel,
    })
}

/// Parse an asset id/RSSI report (6 bytes)
///
/// Format: `[ASSET_ID (3)][FILTER_BITMASK][RSSI][CHANNEL]`
pub fn parse_asset_id_report(data: &[u8]) -> Result<AssetIdReport> {
    let asset_id: [u8; 3] = read_bytes(data, 0)?;
    let filter_bitmask = read_u8(data, 3)?;
    let rssi = read_i8(data, 4)?;
    let channel = read_u8(data, 5)?;

    Ok(AssetIdReport {
        asset_id,
        filter_bitmask,
        rssi,
        channel,
    })
}
