//! DeviceDetect Client Hint Transforms
//!
//! Converts User-Agent Client Hints delivered as JSON into the HTTP headers a
//! browser would have sent, so they can be added to detection evidence:
//!
//! - the result of `navigator.userAgentData.getHighEntropyValues()` (GHEV),
//!   raw or Base64 encoded,
//! - an OpenRTB structured user agent (SUA).
//!
//! Values are rendered into a caller supplied buffer. When the buffer is too
//! short the outcome says so and reports the size needed; retrying with a
//! buffer of that size succeeds.

mod hints;
mod output;
mod scanner;

use base64::Engine as _;

use hints::Format;
use output::{Sink, Writer};

pub use output::{HeaderArray, HeaderPair, TransformOutcome, HEADER_ARRAY_CAPACITY};

pub const SEC_CH_UA: &str = "sec-ch-ua";
pub const SEC_CH_UA_ARCH: &str = "sec-ch-ua-arch";
pub const SEC_CH_UA_BITNESS: &str = "sec-ch-ua-bitness";
pub const SEC_CH_UA_FULL_VERSION_LIST: &str = "sec-ch-ua-full-version-list";
pub const SEC_CH_UA_MOBILE: &str = "sec-ch-ua-mobile";
pub const SEC_CH_UA_MODEL: &str = "sec-ch-ua-model";
pub const SEC_CH_UA_PLATFORM: &str = "sec-ch-ua-platform";
pub const SEC_CH_UA_PLATFORM_VERSION: &str = "sec-ch-ua-platform-version";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransformError {
    /// Malformed or unexpected JSON. The position is where the problem
    /// became visible to the scanner, which may be after its cause.
    #[error("Invalid input at byte {position}")]
    InvalidInput { position: usize },
    #[error("Invalid Base64 input")]
    InvalidBase64,
    #[error("More header pairs than the array holds")]
    InsufficientCapacity,
}

// =============================================================================
// Iterative
// =============================================================================

/// Transform GHEV JSON, calling `callback` with each header pair.
pub fn from_ghev_json<F>(json: &str, buffer: &mut [u8], callback: F) -> Result<TransformOutcome, TransformError>
where
    F: FnMut(&'static str, &str),
{
    stream(Format::Ghev, json.as_bytes(), buffer, callback)
}

/// Transform Base64 encoded GHEV JSON.
pub fn from_ghev_base64<F>(base64: &str, buffer: &mut [u8], callback: F) -> Result<TransformOutcome, TransformError>
where
    F: FnMut(&'static str, &str),
{
    let json = decode_base64(base64)?;
    stream(Format::Ghev, &json, buffer, callback)
}

/// Transform OpenRTB SUA JSON.
pub fn from_sua_json<F>(json: &str, buffer: &mut [u8], callback: F) -> Result<TransformOutcome, TransformError>
where
    F: FnMut(&'static str, &str),
{
    stream(Format::Sua, json.as_bytes(), buffer, callback)
}

// =============================================================================
// Eager
// =============================================================================

pub fn from_ghev_json_to_array<'b>(
    json: &str,
    buffer: &'b mut [u8],
) -> Result<(HeaderArray<'b>, TransformOutcome), TransformError> {
    collect(Format::Ghev, json.as_bytes(), buffer)
}

pub fn from_ghev_base64_to_array<'b>(
    base64: &str,
    buffer: &'b mut [u8],
) -> Result<(HeaderArray<'b>, TransformOutcome), TransformError> {
    let json = decode_base64(base64)?;
    collect(Format::Ghev, &json, buffer)
}

pub fn from_sua_json_to_array<'b>(
    json: &str,
    buffer: &'b mut [u8],
) -> Result<(HeaderArray<'b>, TransformOutcome), TransformError> {
    collect(Format::Sua, json.as_bytes(), buffer)
}

fn decode_base64(input: &str) -> Result<Vec<u8>, TransformError> {
    base64::engine::general_purpose::STANDARD
        .decode(input.trim())
        .map_err(|e| {
            log::debug!("client hints payload is not Base64: {e}");
            TransformError::InvalidBase64
        })
}

fn utf8(value: &[u8], start: usize) -> Result<&str, TransformError> {
    std::str::from_utf8(value).map_err(|e| TransformError::InvalidInput {
        position: start + e.valid_up_to(),
    })
}

fn stream<F>(format: Format, json: &[u8], buffer: &mut [u8], mut callback: F) -> Result<TransformOutcome, TransformError>
where
    F: FnMut(&'static str, &str),
{
    let mut writer = Writer::new(buffer);
    let sink: &mut Sink<'_> = &mut |name, range, value| {
        callback(name, utf8(value, range.start)?);
        Ok(())
    };
    format.transform(json, &mut writer, sink)?;
    Ok(writer.outcome())
}

fn collect<'b>(
    format: Format,
    json: &[u8],
    buffer: &'b mut [u8],
) -> Result<(HeaderArray<'b>, TransformOutcome), TransformError> {
    let mut found = [("", 0usize, 0usize); HEADER_ARRAY_CAPACITY];
    let mut count = 0;
    let outcome = {
        let mut writer = Writer::new(&mut *buffer);
        let sink: &mut Sink<'_> = &mut |name, range, _| {
            let slot = found.get_mut(count).ok_or(TransformError::InsufficientCapacity)?;
            *slot = (name, range.start, range.end);
            count += 1;
            Ok(())
        };
        format.transform(json, &mut writer, sink)?;
        writer.outcome()
    };

    let buffer: &'b [u8] = buffer;
    let mut array = HeaderArray::new();
    for &(name, start, end) in &found[..count] {
        array.push(HeaderPair {
            name,
            value: utf8(&buffer[start..end], start)?,
        })?;
    }
    Ok((array, outcome))
}

#[cfg(test)]
mod tests {
    use base64::Engine as _;

    use super::*;

    const GHEV: &str = r#"{
        "architecture": "x86",
        "bitness": "64",
        "brands": [
            {"brand": "Chromium", "version": "120"},
            {"brand": "Not_A Brand", "version": "8"},
            {"brand": "Google Chrome", "version": "120"}
        ],
        "fullVersionList": [
            {"brand": "Chromium", "version": "120.0.6099.71"},
            {"brand": "Google Chrome", "version": "120.0.6099.71"}
        ],
        "mobile": false,
        "model": "",
        "platform": "Windows",
        "platformVersion": "15.0.0"
    }"#;

    const SUA: &str = r#"{
        "source": 2,
        "browsers": [
            {"brand": "Chromium", "version": ["120", "0", "6099", "71"]},
            {"version": ["120", "0", "6099", "71"], "brand": "Google Chrome"}
        ],
        "platform": {"brand": "Android", "version": ["13", "0", "0"]},
        "mobile": 1,
        "architecture": "arm",
        "bitness": "64",
        "model": "Pixel 7"
    }"#;

    fn pairs(array: &HeaderArray<'_>) -> Vec<(&'static str, String)> {
        array.iter().map(|p| (p.name, p.value.to_string())).collect()
    }

    #[test]
    fn ghev_maps_every_field() {
        let mut buffer = vec![0u8; 512];
        let (array, outcome) = from_ghev_json_to_array(GHEV, &mut buffer).unwrap();
        assert!(!outcome.buffer_too_small);
        assert_eq!(outcome.pairs, 8);
        assert_eq!(array.len(), 8);

        assert_eq!(
            pairs(&array),
            vec![
                (SEC_CH_UA_ARCH, "\"x86\"".to_string()),
                (SEC_CH_UA_BITNESS, "\"64\"".to_string()),
                (
                    SEC_CH_UA,
                    "\"Chromium\";v=\"120\", \"Not_A Brand\";v=\"8\", \"Google Chrome\";v=\"120\"".to_string()
                ),
                (
                    SEC_CH_UA_FULL_VERSION_LIST,
                    "\"Chromium\";v=\"120.0.6099.71\", \"Google Chrome\";v=\"120.0.6099.71\"".to_string()
                ),
                (SEC_CH_UA_MOBILE, "?0".to_string()),
                (SEC_CH_UA_MODEL, "\"\"".to_string()),
                (SEC_CH_UA_PLATFORM, "\"Windows\"".to_string()),
                (SEC_CH_UA_PLATFORM_VERSION, "\"15.0.0\"".to_string()),
            ]
        );
    }

    #[test]
    fn base64_matches_raw_json() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(GHEV);

        let mut raw_buffer = vec![0u8; 512];
        let (raw, _) = from_ghev_json_to_array(GHEV, &mut raw_buffer).unwrap();
        let mut encoded_buffer = vec![0u8; 512];
        let (decoded, _) = from_ghev_base64_to_array(&encoded, &mut encoded_buffer).unwrap();

        assert_eq!(raw.as_slice(), decoded.as_slice());
    }

    #[test]
    fn short_buffer_reports_size_needed() {
        let mut small = vec![0u8; 10];
        let mut seen = Vec::new();
        let outcome = from_ghev_json(GHEV, &mut small, |name, _| seen.push(name)).unwrap();
        assert!(outcome.buffer_too_small);
        assert!(outcome.written > 10);
        assert_eq!(outcome.pairs, seen.len());
        assert_eq!(seen, vec![SEC_CH_UA_ARCH, SEC_CH_UA_BITNESS]);

        let mut resized = vec![0u8; outcome.written];
        let mut count = 0;
        let retry = from_ghev_json(GHEV, &mut resized, |_, _| count += 1).unwrap();
        assert!(!retry.buffer_too_small);
        assert_eq!(retry.written, outcome.written);
        assert_eq!(count, 8);
    }

    #[test]
    fn short_buffer_retry_for_sua() {
        let mut empty = Vec::new();
        let outcome = from_sua_json(SUA, &mut empty, |_, _| {}).unwrap();
        assert!(outcome.buffer_too_small);
        assert_eq!(outcome.pairs, 0);

        let mut resized = vec![0u8; outcome.written];
        let (array, retry) = from_sua_json_to_array(SUA, &mut resized).unwrap();
        assert!(!retry.buffer_too_small);
        assert_eq!(array.len(), 7);
    }

    #[test]
    fn sua_maps_browsers_and_platform() {
        let mut buffer = vec![0u8; 512];
        let (array, _) = from_sua_json_to_array(SUA, &mut buffer).unwrap();
        assert_eq!(
            array.get(SEC_CH_UA_FULL_VERSION_LIST),
            Some("\"Chromium\";v=\"120.0.6099.71\", \"Google Chrome\";v=\"120.0.6099.71\"")
        );
        assert_eq!(array.get(SEC_CH_UA_PLATFORM), Some("\"Android\""));
        assert_eq!(array.get(SEC_CH_UA_PLATFORM_VERSION), Some("\"13.0.0\""));
        assert_eq!(array.get(SEC_CH_UA_MOBILE), Some("?1"));
        assert_eq!(array.get(SEC_CH_UA_ARCH), Some("\"arm\""));
        assert_eq!(array.get(SEC_CH_UA_BITNESS), Some("\"64\""));
        assert_eq!(array.get(SEC_CH_UA_MODEL), Some("\"Pixel 7\""));
        assert_eq!(array.get(SEC_CH_UA), None);
    }

    #[test]
    fn empty_brand_list_is_present_and_empty() {
        let mut buffer = vec![0u8; 64];
        let (array, _) = from_ghev_json_to_array(r#"{"brands": []}"#, &mut buffer).unwrap();
        assert_eq!(array.len(), 1);
        assert_eq!(array.get(SEC_CH_UA), Some(""));
    }

    #[test]
    fn null_brand_entries_are_skipped() {
        let mut buffer = vec![0u8; 64];
        let json = r#"{"brands": [null, {"brand": "A", "version": "1"}, null, {"brand": "B", "version": "2"}]}"#;
        let (array, _) = from_ghev_json_to_array(json, &mut buffer).unwrap();
        assert_eq!(array.get(SEC_CH_UA), Some("\"A\";v=\"1\", \"B\";v=\"2\""));
    }

    #[test]
    fn null_fields_and_unknown_members_are_left_out() {
        let json = r#"{
            "wow64": false,
            "formFactors": ["Desktop"],
            "extra": {"a": [1, {"b": null}], "c": "d"},
            "model": null,
            "brands": null,
            "mobile": true
        }"#;
        let mut buffer = vec![0u8; 64];
        let (array, _) = from_ghev_json_to_array(json, &mut buffer).unwrap();
        assert_eq!(array.as_slice(), [HeaderPair { name: SEC_CH_UA_MOBILE, value: "?1" }]);
    }

    #[test]
    fn escaped_strings_stay_quoted() {
        let mut buffer = vec![0u8; 64];
        let json = r#"{"model": "Pixel \"7\" é"}"#;
        let (array, _) = from_ghev_json_to_array(json, &mut buffer).unwrap();
        assert_eq!(array.get(SEC_CH_UA_MODEL), Some("\"Pixel \\\"7\\\" é\""));
    }

    #[test]
    fn malformed_input_is_rejected() {
        let mut buffer = vec![0u8; 256];
        let cases = [
            (r#"{"brands": [{"brand": "A", "version": "1"}"#, None),
            ("[1]", Some(0)),
            ("", Some(0)),
            (r#"{"mobile": "yes"}"#, Some(11)),
            (r#"{"model": "x"} trailing"#, Some(15)),
            (r#"{"brands": [{"version": "1"}]}"#, None),
        ];
        for (json, position) in cases {
            let err = from_ghev_json(json, &mut buffer, |_, _| {}).unwrap_err();
            match (err, position) {
                (TransformError::InvalidInput { position: found }, Some(expected)) => {
                    assert_eq!(found, expected, "{json}")
                }
                (TransformError::InvalidInput { .. }, None) => {}
                (other, _) => panic!("{json}: {other:?}"),
            }
        }

        let err = from_sua_json(r#"{"mobile": 2}"#, &mut buffer, |_, _| {}).unwrap_err();
        assert_eq!(err, TransformError::InvalidInput { position: 11 });
    }

    #[test]
    fn invalid_base64_is_reported() {
        let mut buffer = vec![0u8; 64];
        assert_eq!(
            from_ghev_base64("***", &mut buffer, |_, _| {}).unwrap_err(),
            TransformError::InvalidBase64
        );
    }

    #[test]
    fn repeated_members_overflow_the_array() {
        let json = r#"{"bitness": "64", "bitness": "64", "bitness": "64", "bitness": "64", "bitness": "64",
            "bitness": "64", "bitness": "64", "bitness": "64", "bitness": "64"}"#;
        let mut buffer = vec![0u8; 256];
        assert_eq!(
            from_ghev_json_to_array(json, &mut buffer).unwrap_err(),
            TransformError::InsufficientCapacity
        );

        let mut count = 0;
        let outcome = from_ghev_json(json, &mut buffer, |_, _| count += 1).unwrap();
        assert_eq!((count, outcome.pairs), (9, 9));
    }
}
