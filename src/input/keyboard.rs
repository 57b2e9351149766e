//! Keyboard Input
//!
//! Physical-code to virtual-key translation and the binary keyboard
//! messages. Codes are location-independent QWERTY identifiers; anything
//! without a mapping is dropped silently.

use crate::utils::ByteBuffer;

/// Modifier mask bits.
pub const MOD_SHIFT: u8 = 0x01;
pub const MOD_CTRL: u8 = 0x02;
pub const MOD_ALT: u8 = 0x04;
pub const MOD_META: u8 = 0x08;

const TAG_KEY: u8 = 0;
const TAG_TEXT: u8 = 1;

/// Map a physical key code to the server's virtual-key value.
///
/// The enumeration is the Windows VK set, which the streaming host expects
/// regardless of the client platform.
pub fn virtual_key(code: &str) -> Option<u16> {
    // Letters and digits are dense ranges.
    if let Some(letter) = code.strip_prefix("Key") {
        let mut chars = letter.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            if c.is_ascii_uppercase() {
                return Some(0x41 + (c as u16 - 'A' as u16));
            }
        }
        return None;
    }
    if let Some(digit) = code.strip_prefix("Digit") {
        let mut chars = digit.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            if c.is_ascii_digit() {
                return Some(0x30 + (c as u16 - '0' as u16));
            }
        }
        return None;
    }
    // Numpad digits; named numpad keys fall through to the table below.
    if let Some(n) = code.strip_prefix("Numpad").and_then(|s| s.parse::<u16>().ok()) {
        return (n <= 9).then_some(0x60 + n);
    }
    if let Some(n) = code.strip_prefix('F').and_then(|s| s.parse::<u16>().ok()) {
        return (1..=12).contains(&n).then_some(0x70 + n - 1);
    }

    let vk = match code {
        "Escape" => 0x1B,
        "Enter" | "NumpadEnter" => 0x0D,
        "Backspace" => 0x08,
        "Tab" => 0x09,
        "Space" => 0x20,
        "CapsLock" => 0x14,
        "ShiftLeft" => 0xA0,
        "ShiftRight" => 0xA1,
        "ControlLeft" => 0xA2,
        "ControlRight" => 0xA3,
        "AltLeft" => 0xA4,
        "AltRight" => 0xA5,
        "MetaLeft" => 0x5B,
        "MetaRight" => 0x5C,
        "ContextMenu" => 0x5D,
        "ArrowLeft" => 0x25,
        "ArrowUp" => 0x26,
        "ArrowRight" => 0x27,
        "ArrowDown" => 0x28,
        "Home" => 0x24,
        "End" => 0x23,
        "PageUp" => 0x21,
        "PageDown" => 0x22,
        "Insert" => 0x2D,
        "Delete" => 0x2E,
        "PrintScreen" => 0x2C,
        "ScrollLock" => 0x91,
        "Pause" => 0x13,
        "NumLock" => 0x90,
        "NumpadMultiply" => 0x6A,
        "NumpadAdd" => 0x6B,
        "NumpadSubtract" => 0x6D,
        "NumpadDecimal" => 0x6E,
        "NumpadDivide" => 0x6F,
        "Semicolon" => 0xBA,
        "Equal" => 0xBB,
        "Comma" => 0xBC,
        "Minus" => 0xBD,
        "Period" => 0xBE,
        "Slash" => 0xBF,
        "Backquote" => 0xC0,
        "BracketLeft" => 0xDB,
        "Backslash" => 0xDC,
        "BracketRight" => 0xDD,
        "Quote" => 0xDE,
        _ => return None,
    };
    Some(vk)
}

/// Tag 0: keydown/keyup.
pub fn serialize_key(buf: &mut ByteBuffer, is_down: bool, modifiers: u8, key_code: u16) -> Vec<u8> {
    buf.clear();
    buf.put_u8(TAG_KEY);
    buf.put_u8(is_down as u8);
    buf.put_u8(modifiers);
    buf.put_u16(key_code);
    buf.as_slice().to_vec()
}

/// Tag 1: UTF-8 text injection. Truncated at 255 bytes on a char boundary.
pub fn serialize_text(buf: &mut ByteBuffer, text: &str) -> Vec<u8> {
    let mut bytes = text.as_bytes();
    if bytes.len() > 255 {
        let mut end = 255;
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        bytes = &bytes[..end];
    }

    buf.clear();
    buf.put_u8(TAG_TEXT);
    buf.put_u8(bytes.len() as u8);
    buf.put_bytes(bytes);
    buf.as_slice().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letters_digits_and_function_keys() {
        assert_eq!(virtual_key("KeyA"), Some(0x41));
        assert_eq!(virtual_key("KeyZ"), Some(0x5A));
        assert_eq!(virtual_key("Digit0"), Some(0x30));
        assert_eq!(virtual_key("Digit9"), Some(0x39));
        assert_eq!(virtual_key("F1"), Some(0x70));
        assert_eq!(virtual_key("F12"), Some(0x7B));
        assert_eq!(virtual_key("Numpad7"), Some(0x67));
    }

    #[test]
    fn unmapped_codes_are_none() {
        assert_eq!(virtual_key("F13"), None);
        assert_eq!(virtual_key("MediaPlayPause"), None);
        assert_eq!(virtual_key("KeyAA"), None);
        assert_eq!(virtual_key(""), None);
    }

    #[test]
    fn key_message_layout() {
        let mut buf = ByteBuffer::new();
        let frame = serialize_key(&mut buf, true, MOD_SHIFT | MOD_CTRL, 0x41);
        assert_eq!(frame, vec![0, 1, 0x03, 0x00, 0x41]);

        let frame = serialize_key(&mut buf, false, 0, 0x0D);
        assert_eq!(frame, vec![0, 0, 0, 0x00, 0x0D]);
    }

    #[test]
    fn text_message_layout() {
        let mut buf = ByteBuffer::new();
        let frame = serialize_text(&mut buf, "hi");
        assert_eq!(frame, vec![1, 2, b'h', b'i']);
    }

    #[test]
    fn text_truncates_on_char_boundary() {
        let mut buf = ByteBuffer::new();
        let long = "é".repeat(200); // 400 bytes
        let frame = serialize_text(&mut buf, &long);
        let len = frame[1] as usize;
        assert!(len <= 255);
        assert!(std::str::from_utf8(&frame[2..2 + len]).is_ok());
    }
}
