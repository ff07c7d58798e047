//! Hex formatting for frame dumps

use std::fmt::Write;

/// Space-separated uppercase hex, cut after `limit` bytes
/// Example: [0x00, 0x01, 0x00] with limit 2 -> "00 01 .. (3B)"
pub fn dump(data: &[u8], limit: usize) -> String {
    let shown = &data[..data.len().min(limit)];
    let mut result = String::with_capacity(shown.len() * 3 + 8);
    for (i, byte) in shown.iter().enumerate() {
        if i > 0 {
            result.push(' ');
        }
        // Writing to String buffer is infallible
        let _ = write!(&mut result, "{:02X}", byte);
    }
    if data.len() > limit {
        let _ = write!(&mut result, " .. ({}B)", data.len());
    }
    result
}

/// Parses "0x1234", "1234h" or plain decimal register values
pub fn parse_u16(text: &str) -> Option<u16> {
    let text = text.trim();
    if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .or_else(|| text.strip_suffix('h'))
    {
        return u16::from_str_radix(hex, 16).ok();
    }
    text.parse().ok()
}
