use std::fs;
use std::path::Path;

use crate::error::{ExportError, Result};

/// テキストファイルの文字コード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Utf16Le { bom: bool },
}

const UTF16LE_BOM: [u8; 2] = [0xFF, 0xFE];
const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

/// UTF-8として読めればUTF-8、読めなければUTF-16LE
pub fn decode(bytes: &[u8]) -> Result<(String, TextEncoding)> {
    if let Some(rest) = bytes.strip_prefix(&UTF16LE_BOM) {
        return Ok((decode_utf16le(rest)?, TextEncoding::Utf16Le { bom: true }));
    }
    let body = bytes.strip_prefix(&UTF8_BOM).unwrap_or(bytes);
    // ASCIIのUTF-16LEはNULを含む正しいUTF-8にもなるのでNULで見分ける
    if !body.contains(&0) {
        if let Ok(text) = std::str::from_utf8(body) {
            return Ok((text.to_string(), TextEncoding::Utf8));
        }
    }
    Ok((decode_utf16le(bytes)?, TextEncoding::Utf16Le { bom: false }))
}

fn decode_utf16le(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(ExportError::Format("odd number of bytes in UTF-16 text".to_string()));
    }
    let units: Vec<u16> = bytes.chunks_exact(2).map(|pair| u16::from_le_bytes([pair[0], pair[1]])).collect();
    String::from_utf16(&units).map_err(|e| ExportError::Format(format!("invalid UTF-16 text: {}", e)))
}

pub fn encode(text: &str, encoding: TextEncoding) -> Vec<u8> {
    match encoding {
        TextEncoding::Utf8 => text.as_bytes().to_vec(),
        TextEncoding::Utf16Le { bom } => {
            let mut bytes = Vec::with_capacity(text.len() * 2 + 2);
            if bom {
                bytes.extend_from_slice(&UTF16LE_BOM);
            }
            for unit in text.encode_utf16() {
                bytes.extend_from_slice(&unit.to_le_bytes());
            }
            bytes
        }
    }
}

pub fn read_text(path: &Path) -> Result<(String, TextEncoding)> {
    decode(&fs::read(path)?)
}
