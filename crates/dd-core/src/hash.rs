//! Hash functions for DeviceDetect
//!
//! Two families live here:
//!
//! - A Rabin-Karp rolling hash used by the graph engine to fingerprint
//!   substrings of the evidence at candidate character positions.
//! - CRC32 for data set integrity checking.
//!
//! # Rolling hash
//!
//! `h(s) = s[0]*P^(n-1) + s[1]*P^(n-2) + ... + s[n-1]` with wrapping `u32`
//! arithmetic and `P = 997`. The final character always carries multiplier 1,
//! so two strings that differ only in their last byte hash `|a - b|` apart.
//! The graph engine's `difference` tolerance relies on this.

/// Multiplier for the rolling hash.
pub const RK_PRIME: u32 = 997;

/// Hash a byte slice with the rolling hash.
#[inline]
pub fn rk_hash(data: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &b in data {
        h = h.wrapping_mul(RK_PRIME).wrapping_add(b as u32);
    }
    h
}

/// `RK_PRIME^(length-1)`, the weight of the character leaving the window.
#[inline]
pub fn rk_power(length: usize) -> u32 {
    let mut p: u32 = 1;
    for _ in 1..length {
        p = p.wrapping_mul(RK_PRIME);
    }
    p
}

/// Rolling window over a byte string.
///
/// Yields `(start, hash)` for every window of `length` bytes starting at
/// `from..=to`. Windows that would run past the end of the data are not
/// produced.
pub struct RollingWindows<'a> {
    data: &'a [u8],
    length: usize,
    power: u32,
    next: usize,
    last: usize,
    hash: u32,
    started: bool,
}

impl<'a> RollingWindows<'a> {
    pub fn new(data: &'a [u8], length: usize, from: usize, to: usize) -> Self {
        let last = if length == 0 || data.len() < length {
            0
        } else {
            to.min(data.len() - length)
        };
        let empty = length == 0 || data.len() < length || from > last;
        Self {
            data,
            length,
            power: rk_power(length),
            next: if empty { 1 } else { from },
            last: if empty { 0 } else { last },
            hash: 0,
            started: false,
        }
    }
}

impl Iterator for RollingWindows<'_> {
    type Item = (usize, u32);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next > self.last {
            return None;
        }
        let pos = self.next;
        if self.started {
            let out = self.data[pos - 1] as u32;
            let inc = self.data[pos + self.length - 1] as u32;
            self.hash = self
                .hash
                .wrapping_sub(out.wrapping_mul(self.power))
                .wrapping_mul(RK_PRIME)
                .wrapping_add(inc);
        } else {
            self.hash = rk_hash(&self.data[pos..pos + self.length]);
            self.started = true;
        }
        self.next += 1;
        Some((pos, self.hash))
    }
}

static CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u32;
        let mut j = 0;
        while j < 8 {
            c = if c & 1 != 0 {
                0xedb88320 ^ (c >> 1)
            } else {
                c >> 1
            };
            j += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
};

/// Incremental CRC32 (IEEE 802.3), for inputs read in chunks.
#[derive(Debug, Clone, Copy)]
pub struct Crc32 {
    crc: u32,
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc32 {
    pub const fn new() -> Self {
        Self { crc: 0xffffffff }
    }

    pub fn update(&mut self, data: &[u8]) {
        let mut crc = self.crc;
        for &byte in data {
            crc = CRC32_TABLE[((crc ^ byte as u32) & 0xff) as usize] ^ (crc >> 8);
        }
        self.crc = crc;
    }

    pub fn finish(&self) -> u32 {
        self.crc ^ 0xffffffff
    }
}

/// Compute CRC32 for data set integrity checking.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc32::new();
    crc.update(data);
    crc.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rk_hash_consistent() {
        assert_eq!(rk_hash(b"iPhone"), rk_hash(b"iPhone"));
        assert_ne!(rk_hash(b"iPhone"), rk_hash(b"iPad"));
    }

    #[test]
    fn test_rk_hash_last_char_delta() {
        let a = rk_hash(b"Chrome/90");
        let b = rk_hash(b"Chrome/93");
        assert_eq!(b.wrapping_sub(a), 3);
    }

    #[test]
    fn test_rolling_matches_direct() {
        let data = b"Mozilla/5.0 (Linux; Android 14)";
        let windows: Vec<_> = RollingWindows::new(data, 7, 0, data.len()).collect();
        assert_eq!(windows.len(), data.len() - 7 + 1);
        for (pos, h) in windows {
            assert_eq!(h, rk_hash(&data[pos..pos + 7]), "window at {pos}");
        }
    }

    #[test]
    fn test_rolling_respects_bounds() {
        let data = b"abcdef";
        let windows: Vec<_> = RollingWindows::new(data, 2, 2, 3).map(|(p, _)| p).collect();
        assert_eq!(windows, vec![2, 3]);

        assert_eq!(RollingWindows::new(data, 10, 0, 5).count(), 0);
        assert_eq!(RollingWindows::new(data, 2, 5, 9).count(), 0);
        assert_eq!(RollingWindows::new(data, 0, 0, 5).count(), 0);
    }

    #[test]
    fn test_crc32_known_value() {
        assert_eq!(crc32(b"123456789"), 0xcbf43926);
    }

    #[test]
    fn test_crc32_incremental() {
        let mut crc = Crc32::new();
        crc.update(b"1234");
        crc.update(b"56789");
        assert_eq!(crc.finish(), crc32(b"123456789"));
    }

    #[test]
    fn test_crc32_detects_changes() {
        assert_ne!(crc32(&[1u8, 2, 3]), crc32(&[1u8, 2, 4]));
    }
}
