//! GHEV and SUA field mapping
//!
//! Both documents are single objects read in one pass. Each recognised
//! member becomes one or two header values as soon as it has been read, so
//! pairs come out in document order.

use crate::output::{Sink, Writer};
use crate::scanner::{decode_into, JsonStr, Scanner};
use crate::{
    TransformError, SEC_CH_UA, SEC_CH_UA_ARCH, SEC_CH_UA_BITNESS, SEC_CH_UA_FULL_VERSION_LIST, SEC_CH_UA_MOBILE,
    SEC_CH_UA_MODEL, SEC_CH_UA_PLATFORM, SEC_CH_UA_PLATFORM_VERSION,
};

/// Input document kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Format {
    /// `getHighEntropyValues()` result
    Ghev,
    /// OpenRTB structured user agent
    Sua,
}

impl Format {
    pub fn transform(self, json: &[u8], writer: &mut Writer<'_>, sink: &mut Sink<'_>) -> Result<(), TransformError> {
        let mut scanner = Scanner::new(json);
        scanner.expect(b'{')?;
        let mut first = true;
        while let Some(key) = scanner.next_key(&mut first)? {
            let mut out = Out {
                scanner: &mut scanner,
                writer: &mut *writer,
                sink: &mut *sink,
            };
            match (self, key.raw) {
                (Format::Ghev, b"brands") => out.brand_list(SEC_CH_UA)?,
                (Format::Ghev, b"fullVersionList") | (Format::Sua, b"browsers") => {
                    out.brand_list(SEC_CH_UA_FULL_VERSION_LIST)?
                }
                (Format::Ghev, b"mobile") => out.boolean(SEC_CH_UA_MOBILE)?,
                (Format::Sua, b"mobile") => out.flag(SEC_CH_UA_MOBILE)?,
                (Format::Ghev, b"platform") => out.string(SEC_CH_UA_PLATFORM)?,
                (Format::Ghev, b"platformVersion") => out.string(SEC_CH_UA_PLATFORM_VERSION)?,
                (Format::Sua, b"platform") => out.platform()?,
                (_, b"architecture") => out.string(SEC_CH_UA_ARCH)?,
                (_, b"bitness") => out.string(SEC_CH_UA_BITNESS)?,
                (_, b"model") => out.string(SEC_CH_UA_MODEL)?,
                _ => {
                    log::trace!("skipping member '{}'", String::from_utf8_lossy(key.raw));
                    out.scanner.skip_value()?
                }
            }
        }
        scanner.finish()
    }
}

/// A brand and version read from a brand object before rendering.
struct Brand<'s> {
    brand: JsonStr<'s>,
    version: Option<Version<'s>>,
}

enum Version<'s> {
    Text(JsonStr<'s>),
    /// Offset of the `[` of an array of version segments.
    Segments(usize),
}

struct Out<'a, 's, 'b, 'k> {
    scanner: &'a mut Scanner<'s>,
    writer: &'a mut Writer<'b>,
    sink: &'a mut Sink<'k>,
}

impl<'s> Out<'_, 's, '_, '_> {
    /// `"value"`, omitted when null.
    fn string(&mut self, name: &'static str) -> Result<(), TransformError> {
        if self.scanner.null()? {
            return Ok(());
        }
        let text = self.scanner.string()?;
        let start = self.writer.len();
        self.quoted(text)?;
        self.writer.finish(name, start, self.sink)
    }

    /// `?1` or `?0` from a JSON boolean.
    fn boolean(&mut self, name: &'static str) -> Result<(), TransformError> {
        if self.scanner.null()? {
            return Ok(());
        }
        let value = self.scanner.boolean()?;
        self.sf_boolean(name, value)
    }

    /// `?1` or `?0` from the number `1` or `0`.
    fn flag(&mut self, name: &'static str) -> Result<(), TransformError> {
        if self.scanner.null()? {
            return Ok(());
        }
        let at = self.scanner.position();
        let value = match self.scanner.number()? {
            b"1" => true,
            b"0" => false,
            _ => return Err(TransformError::InvalidInput { position: at }),
        };
        self.sf_boolean(name, value)
    }

    fn sf_boolean(&mut self, name: &'static str, value: bool) -> Result<(), TransformError> {
        let start = self.writer.len();
        self.writer.push_bytes(if value { b"?1" } else { b"?0" });
        self.writer.finish(name, start, self.sink)
    }

    /// `"A";v="1", "B";v="2"`. Null entries are left out; an empty list
    /// gives an empty value.
    fn brand_list(&mut self, name: &'static str) -> Result<(), TransformError> {
        if self.scanner.null()? {
            return Ok(());
        }
        self.scanner.expect(b'[')?;
        let start = self.writer.len();
        let mut first = true;
        let mut rendered = 0;
        while self.scanner.next_element(&mut first)? {
            if self.scanner.null()? {
                continue;
            }
            let brand = self.brand()?;
            let version = brand
                .version
                .ok_or(TransformError::InvalidInput { position: self.scanner.position() })?;
            if rendered > 0 {
                self.writer.push_bytes(b", ");
            }
            self.quoted(brand.brand)?;
            self.writer.push_bytes(b";v=");
            self.version(version)?;
            rendered += 1;
        }
        self.writer.finish(name, start, self.sink)
    }

    /// SUA `platform`: the brand and, when given, the version.
    fn platform(&mut self) -> Result<(), TransformError> {
        if self.scanner.null()? {
            return Ok(());
        }
        let platform = self.brand()?;

        let start = self.writer.len();
        self.quoted(platform.brand)?;
        self.writer.finish(SEC_CH_UA_PLATFORM, start, self.sink)?;

        if let Some(version) = platform.version {
            let start = self.writer.len();
            self.version(version)?;
            self.writer.finish(SEC_CH_UA_PLATFORM_VERSION, start, self.sink)?;
        }
        Ok(())
    }

    /// Read a `{"brand": ..., "version": ...}` object in any member order.
    fn brand(&mut self) -> Result<Brand<'s>, TransformError> {
        self.scanner.expect(b'{')?;
        let mut brand = None;
        let mut version = None;
        let mut first = true;
        while let Some(key) = self.scanner.next_key(&mut first)? {
            match key.raw {
                b"brand" => brand = Some(self.scanner.string()?),
                b"version" => {
                    version = match self.scanner.peek() {
                        Some(b'"') => Some(Version::Text(self.scanner.string()?)),
                        Some(b'[') => {
                            let at = self.scanner.position();
                            self.scanner.skip_value()?;
                            Some(Version::Segments(at))
                        }
                        Some(b'n') => {
                            self.scanner.null()?;
                            None
                        }
                        _ => return Err(self.scanner.error()),
                    }
                }
                _ => self.scanner.skip_value()?,
            }
        }
        let brand = brand.ok_or_else(|| self.scanner.error())?;
        Ok(Brand { brand, version })
    }

    fn version(&mut self, version: Version<'s>) -> Result<(), TransformError> {
        match version {
            Version::Text(text) => self.quoted(text),
            Version::Segments(at) => {
                // Revisit the array, already checked by skip_value.
                let mut segments = Scanner::at(self.scanner.source(), at);
                segments.expect(b'[')?;
                self.writer.push(b'"');
                let mut first = true;
                let mut count = 0;
                while segments.next_element(&mut first)? {
                    if segments.null()? {
                        continue;
                    }
                    let segment = segments.string()?;
                    if count > 0 {
                        self.writer.push(b'.');
                    }
                    decode_into(segment, self.writer)?;
                    count += 1;
                }
                self.writer.push(b'"');
                Ok(())
            }
        }
    }

    fn quoted(&mut self, text: JsonStr<'_>) -> Result<(), TransformError> {
        self.writer.push(b'"');
        decode_into(text, self.writer)?;
        self.writer.push(b'"');
        Ok(())
    }
}
