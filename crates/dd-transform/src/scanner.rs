//! Single-pass JSON scanner
//!
//! Works directly on the input bytes. Strings are returned raw (escapes
//! validated, not decoded) so keys compare without allocating; values are
//! decoded straight into the output buffer by [`decode_into`].

use crate::output::Writer;
use crate::TransformError;

/// Deepest nesting [`Scanner::skip_value`] follows.
const MAX_DEPTH: u32 = 64;

/// A string as it appears in the input, between its quotes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct JsonStr<'s> {
    pub raw: &'s [u8],
    /// Input offset of the first byte after the opening quote.
    pub start: usize,
}

pub(crate) struct Scanner<'s> {
    bytes: &'s [u8],
    pos: usize,
}

impl<'s> Scanner<'s> {
    pub fn new(bytes: &'s [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Scanner positioned at `pos`, used to revisit a value seen earlier.
    pub fn at(bytes: &'s [u8], pos: usize) -> Self {
        Self { bytes, pos }
    }

    pub fn source(&self) -> &'s [u8] {
        self.bytes
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn error(&self) -> TransformError {
        TransformError::InvalidInput { position: self.pos }
    }

    fn skip_ws(&mut self) {
        while let Some(b' ' | b'\t' | b'\n' | b'\r') = self.bytes.get(self.pos).copied() {
            self.pos += 1;
        }
    }

    /// Next significant byte, not consumed.
    pub fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.bytes.get(self.pos).copied()
    }

    pub fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub fn expect(&mut self, byte: u8) -> Result<(), TransformError> {
        if self.eat(byte) {
            Ok(())
        } else {
            Err(self.error())
        }
    }

    /// Only whitespace may follow the root value.
    pub fn finish(&mut self) -> Result<(), TransformError> {
        self.skip_ws();
        if self.pos == self.bytes.len() {
            Ok(())
        } else {
            Err(self.error())
        }
    }

    /// Key of the next member of an object whose `{` has been consumed, or
    /// `None` once its `}` is consumed.
    pub fn next_key(&mut self, first: &mut bool) -> Result<Option<JsonStr<'s>>, TransformError> {
        if self.eat(b'}') {
            return Ok(None);
        }
        if !*first {
            self.expect(b',')?;
        }
        *first = false;
        let key = self.string()?;
        self.expect(b':')?;
        Ok(Some(key))
    }

    /// Whether another element follows in an array whose `[` has been
    /// consumed. Consumes the `]` at the end.
    pub fn next_element(&mut self, first: &mut bool) -> Result<bool, TransformError> {
        if self.eat(b']') {
            return Ok(false);
        }
        if !*first {
            self.expect(b',')?;
        }
        *first = false;
        Ok(true)
    }

    /// Consume a `null` literal if one is next.
    pub fn null(&mut self) -> Result<bool, TransformError> {
        if self.peek() == Some(b'n') {
            self.literal(b"null")?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn boolean(&mut self) -> Result<bool, TransformError> {
        match self.peek() {
            Some(b't') => self.literal(b"true").map(|_| true),
            Some(b'f') => self.literal(b"false").map(|_| false),
            _ => Err(self.error()),
        }
    }

    fn literal(&mut self, text: &[u8]) -> Result<(), TransformError> {
        if self.bytes[self.pos..].starts_with(text) {
            self.pos += text.len();
            Ok(())
        } else {
            Err(self.error())
        }
    }

    /// Raw text of a number.
    pub fn number(&mut self) -> Result<&'s [u8], TransformError> {
        self.skip_ws();
        let start = self.pos;
        while let Some(b'0'..=b'9' | b'-' | b'+' | b'.' | b'e' | b'E') = self.bytes.get(self.pos).copied() {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.error());
        }
        Ok(&self.bytes[start..self.pos])
    }

    pub fn string(&mut self) -> Result<JsonStr<'s>, TransformError> {
        self.expect(b'"')?;
        let start = self.pos;
        loop {
            match self.bytes.get(self.pos).copied() {
                None => return Err(self.error()),
                Some(b'"') => break,
                Some(b'\\') => {
                    self.pos += 1;
                    match self.bytes.get(self.pos).copied() {
                        Some(b'"' | b'\\' | b'/' | b'b' | b'f' | b'n' | b'r' | b't') => self.pos += 1,
                        Some(b'u') => {
                            let digits = self.bytes.get(self.pos + 1..self.pos + 5).ok_or_else(|| self.error())?;
                            if !digits.iter().all(u8::is_ascii_hexdigit) {
                                return Err(self.error());
                            }
                            self.pos += 5;
                        }
                        _ => return Err(self.error()),
                    }
                }
                Some(0x00..=0x1f) => return Err(self.error()),
                Some(_) => self.pos += 1,
            }
        }
        let raw = &self.bytes[start..self.pos];
        self.pos += 1;
        Ok(JsonStr { raw, start })
    }

    /// Skip one value of any type.
    pub fn skip_value(&mut self) -> Result<(), TransformError> {
        self.skip(0)
    }

    fn skip(&mut self, depth: u32) -> Result<(), TransformError> {
        if depth > MAX_DEPTH {
            return Err(self.error());
        }
        match self.peek() {
            Some(b'"') => self.string().map(|_| ()),
            Some(b'{') => {
                self.pos += 1;
                let mut first = true;
                while self.next_key(&mut first)?.is_some() {
                    self.skip(depth + 1)?;
                }
                Ok(())
            }
            Some(b'[') => {
                self.pos += 1;
                let mut first = true;
                while self.next_element(&mut first)? {
                    self.skip(depth + 1)?;
                }
                Ok(())
            }
            Some(b't') => self.literal(b"true"),
            Some(b'f') => self.literal(b"false"),
            Some(b'n') => self.literal(b"null"),
            Some(b'-' | b'0'..=b'9') => self.number().map(|_| ()),
            _ => Err(self.error()),
        }
    }
}

/// Decode a raw JSON string into `writer` as the body of a structured
/// header string: `"` and `\` are backslash escaped.
pub(crate) fn decode_into(text: JsonStr<'_>, writer: &mut Writer<'_>) -> Result<(), TransformError> {
    let raw = text.raw;
    let invalid = |i: usize| TransformError::InvalidInput { position: text.start + i };
    let mut i = 0;
    while i < raw.len() {
        let byte = raw[i];
        if byte != b'\\' {
            writer.push(byte);
            i += 1;
            continue;
        }
        let escape = raw.get(i + 1).copied().ok_or_else(|| invalid(i))?;
        i += 2;
        let decoded = match escape {
            b'"' => {
                writer.push_bytes(b"\\\"");
                continue;
            }
            b'\\' => {
                writer.push_bytes(b"\\\\");
                continue;
            }
            b'/' => '/',
            b'b' => '\u{8}',
            b'f' => '\u{c}',
            b'n' => '\n',
            b'r' => '\r',
            b't' => '\t',
            b'u' => {
                let high = hex4(raw, i).ok_or_else(|| invalid(i))?;
                i += 4;
                let code = if (0xd800..0xdc00).contains(&high) {
                    if raw.get(i..i + 2) != Some(b"\\u".as_slice()) {
                        return Err(invalid(i));
                    }
                    let low = hex4(raw, i + 2).ok_or_else(|| invalid(i))?;
                    if !(0xdc00..0xe000).contains(&low) {
                        return Err(invalid(i));
                    }
                    i += 6;
                    0x10000 + ((high - 0xd800) << 10) + (low - 0xdc00)
                } else {
                    high
                };
                char::from_u32(code).ok_or_else(|| invalid(i))?
            }
            _ => return Err(invalid(i - 1)),
        };
        let mut utf8 = [0u8; 4];
        writer.push_bytes(decoded.encode_utf8(&mut utf8).as_bytes());
    }
    Ok(())
}

fn hex4(raw: &[u8], at: usize) -> Option<u32> {
    let digits = raw.get(at..at + 4)?;
    digits
        .iter()
        .try_fold(0u32, |acc, &d| Some(acc * 16 + (d as char).to_digit(16)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_nested_values() {
        let json = br#"{"a": [1, -2.5e3, {"b": [true, false, null]}], "c": "x\"y"} tail"#;
        let mut scanner = Scanner::new(json);
        scanner.skip_value().unwrap();
        assert_eq!(&json[scanner.position()..], b" tail");
    }

    #[test]
    fn rejects_trailing_commas() {
        for json in [&br#"{"a": 1,}"#[..], br#"[1,]"#, br#"{,}"#] {
            assert!(Scanner::new(json).skip_value().is_err(), "{}", String::from_utf8_lossy(json));
        }
    }

    #[test]
    fn reports_position_of_bad_escape() {
        let mut scanner = Scanner::new(br#""ab\qc""#);
        assert_eq!(scanner.string().unwrap_err(), TransformError::InvalidInput { position: 4 });
    }

    #[test]
    fn decodes_escapes_for_header_strings() {
        let json = r#""a\"b\\c é 😀""#.as_bytes();
        let text = Scanner::new(json).string().unwrap();
        let mut buffer = [0u8; 64];
        let mut writer = Writer::new(&mut buffer);
        decode_into(text, &mut writer).unwrap();
        let len = writer.len();
        assert_eq!(std::str::from_utf8(&buffer[..len]).unwrap(), "a\\\"b\\\\c é 😀");
    }

    #[test]
    fn rejects_lone_surrogate() {
        let text = Scanner::new(br#""\ud83d x""#).string().unwrap();
        let mut buffer = [0u8; 16];
        let mut writer = Writer::new(&mut buffer);
        assert!(decode_into(text, &mut writer).is_err());
    }
}
