//! Byte-level JSON helpers for the per-reading hot path.
//!
//! Metric names and tags are validated to a conservative character class at
//! construction, so they are written without escaping. Free-form text
//! (descriptions, unit names in metadata documents) goes through serde_json
//! instead.

/// Writes `s` as a JSON string, assuming it needs no escaping.
pub(crate) fn write_raw_string(buf: &mut Vec<u8>, s: &str) {
    buf.push(b'"');
    buf.extend_from_slice(s.as_bytes());
    buf.push(b'"');
}

/// Writes a finite `f64` as a JSON number: integers without a fraction,
/// everything else in shortest-round-trip form.
pub(crate) fn write_number(buf: &mut Vec<u8>, value: f64) {
    debug_assert!(value.is_finite());
    if value.fract() == 0.0 && value.abs() < (i64::MAX as f64) {
        let mut writer = itoa::Buffer::new();
        buf.extend_from_slice(writer.format(value as i64).as_bytes());
    } else {
        let mut writer = ryu::Buffer::new();
        buf.extend_from_slice(writer.format(value).as_bytes());
    }
}

/// Writes a tag set as a JSON object.
pub(crate) fn write_tags_object(buf: &mut Vec<u8>, tags: &packhorse::TagSet) {
    buf.push(b'{');
    let mut first = true;
    for (name, value) in tags.iter() {
        if !first {
            buf.push(b',');
        }
        first = false;
        write_raw_string(buf, name);
        buf.push(b':');
        write_raw_string(buf, value);
    }
    buf.push(b'}');
}

/// Writes a tag set as a JSON array of `"name:value"` strings.
pub(crate) fn write_tags_array(buf: &mut Vec<u8>, tags: &packhorse::TagSet) {
    buf.push(b'[');
    let mut first = true;
    for (name, value) in tags.iter() {
        if !first {
            buf.push(b',');
        }
        first = false;
        buf.push(b'"');
        buf.extend_from_slice(name.as_bytes());
        buf.push(b':');
        buf.extend_from_slice(value.as_bytes());
        buf.push(b'"');
    }
    buf.push(b']');
}

/// Trims one trailing separator byte, if present.
pub(crate) fn trim_trailing(chunk: &[u8], separator: u8) -> &[u8] {
    match chunk.last() {
        Some(last) if *last == separator => &chunk[..chunk.len() - 1],
        _ => chunk,
    }
}
