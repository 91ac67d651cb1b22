//! Output buffer and header pair collections

use std::ops::Range;

use crate::TransformError;

/// Pairs a [`HeaderArray`] holds.
pub const HEADER_ARRAY_CAPACITY: usize = 8;

/// Receives each completed header value as its range in the buffer and the
/// bytes in that range.
pub(crate) type Sink<'a> = dyn FnMut(&'static str, Range<usize>, &[u8]) -> Result<(), TransformError> + 'a;

/// Appends header values to a caller supplied buffer.
///
/// Writing carries on past the end of the buffer without storing anything,
/// so `len` always reports the bytes a complete transform needs. Once a
/// value has not fitted no further values are delivered.
pub(crate) struct Writer<'b> {
    buffer: &'b mut [u8],
    len: usize,
    overflowed: bool,
    pairs: usize,
}

impl<'b> Writer<'b> {
    pub fn new(buffer: &'b mut [u8]) -> Self {
        Self {
            buffer,
            len: 0,
            overflowed: false,
            pairs: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn push(&mut self, byte: u8) {
        if let Some(slot) = self.buffer.get_mut(self.len) {
            *slot = byte;
        }
        self.len += 1;
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        let end = self.len + bytes.len();
        if end <= self.buffer.len() {
            self.buffer[self.len..end].copy_from_slice(bytes);
        }
        self.len = end;
    }

    /// Deliver the value written since `start`.
    pub fn finish(&mut self, name: &'static str, start: usize, sink: &mut Sink<'_>) -> Result<(), TransformError> {
        if self.overflowed || self.len > self.buffer.len() {
            self.overflowed = true;
            return Ok(());
        }
        sink(name, start..self.len, &self.buffer[start..self.len])?;
        self.pairs += 1;
        Ok(())
    }

    pub fn outcome(&self) -> TransformOutcome {
        TransformOutcome {
            written: self.len,
            buffer_too_small: self.overflowed,
            pairs: self.pairs,
        }
    }
}

/// Result of one transform call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransformOutcome {
    /// Buffer bytes the complete set of values needs.
    pub written: usize,
    /// The buffer was shorter than `written`; retry with a larger one.
    pub buffer_too_small: bool,
    /// Pairs delivered.
    pub pairs: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderPair<'b> {
    pub name: &'static str,
    pub value: &'b str,
}

/// Fixed capacity list of header pairs whose values borrow the transform
/// buffer.
#[derive(Debug, Clone)]
pub struct HeaderArray<'b> {
    pairs: [HeaderPair<'b>; HEADER_ARRAY_CAPACITY],
    len: usize,
}

impl<'b> Default for HeaderArray<'b> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'b> HeaderArray<'b> {
    pub fn new() -> Self {
        Self {
            pairs: [HeaderPair { name: "", value: "" }; HEADER_ARRAY_CAPACITY],
            len: 0,
        }
    }

    pub fn push(&mut self, pair: HeaderPair<'b>) -> Result<(), TransformError> {
        let slot = self.pairs.get_mut(self.len).ok_or(TransformError::InsufficientCapacity)?;
        *slot = pair;
        self.len += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        HEADER_ARRAY_CAPACITY
    }

    pub fn as_slice(&self) -> &[HeaderPair<'b>] {
        &self.pairs[..self.len]
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderPair<'b>> {
        self.as_slice().iter()
    }

    /// Value of the first pair named `name`, ignoring case.
    pub fn get(&self, name: &str) -> Option<&'b str> {
        self.iter().find(|p| p.name.eq_ignore_ascii_case(name)).map(|p| p.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_counts_past_the_buffer() {
        let mut buffer = [0u8; 4];
        let mut delivered = Vec::new();
        let mut sink = |name: &'static str, _: Range<usize>, value: &[u8]| -> Result<(), TransformError> {
            delivered.push((name, value.to_vec()));
            Ok(())
        };
        let mut writer = Writer::new(&mut buffer);

        writer.push_bytes(b"ab");
        writer.finish("one", 0, &mut sink).unwrap();
        writer.push_bytes(b"cde");
        writer.finish("two", 2, &mut sink).unwrap();
        writer.push(b'f');
        writer.finish("three", 5, &mut sink).unwrap();

        let outcome = writer.outcome();
        assert_eq!(outcome.written, 6);
        assert!(outcome.buffer_too_small);
        assert_eq!(outcome.pairs, 1);
        assert_eq!(delivered, vec![("one", b"ab".to_vec())]);
    }

    #[test]
    fn header_array_is_bounded() {
        let mut array = HeaderArray::new();
        for _ in 0..HEADER_ARRAY_CAPACITY {
            array.push(HeaderPair { name: "sec-ch-ua", value: "" }).unwrap();
        }
        assert_eq!(
            array.push(HeaderPair { name: "sec-ch-ua", value: "" }),
            Err(TransformError::InsufficientCapacity)
        );
        assert_eq!(array.len(), array.capacity());
        assert_eq!(array.get("SEC-CH-UA"), Some(""));
    }
}
