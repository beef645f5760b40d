//! The StatsD line protocol writer.

use std::io::Write as _;

use packhorse::{MetricReading, MetricType, SerializeError};

/// Writes one reading as a StatsD line:
/// `<name>:<value>|<c|g>[|#<k>:<v>,…]\n`.
///
/// Counters and cumulative counters are `c`, gauges are `g`. Integral values
/// are written without a fraction; everything else gets exactly five decimal
/// places.
pub(crate) fn write_line(buf: &mut Vec<u8>, reading: &MetricReading) -> Result<(), SerializeError> {
    if !reading.value().is_finite() {
        return Err(SerializeError::NonFiniteValue {
            name: reading.name_with_suffix().to_string(),
        });
    }

    buf.extend_from_slice(reading.name_with_suffix().as_bytes());
    buf.push(b':');
    write_value(buf, reading.value());
    buf.push(b'|');
    buf.push(match reading.metric_type() {
        MetricType::Counter | MetricType::CumulativeCounter => b'c',
        MetricType::Gauge => b'g',
    });

    let mut wrote_tag = false;
    for (name, value) in reading.tags().iter() {
        if wrote_tag {
            buf.push(b',');
        } else {
            buf.extend_from_slice(b"|#");
            wrote_tag = true;
        }
        buf.extend_from_slice(name.as_bytes());
        buf.push(b':');
        buf.extend_from_slice(value.as_bytes());
    }

    buf.push(b'\n');
    Ok(())
}

fn write_value(buf: &mut Vec<u8>, value: f64) {
    if value.fract() == 0.0 && value.abs() < (i64::MAX as f64) {
        let mut writer = itoa::Buffer::new();
        buf.extend_from_slice(writer.format(value as i64).as_bytes());
    } else {
        // Vec<u8> writes cannot fail.
        let _ = write!(buf, "{value:.5}");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    use packhorse::{MetricReading, MetricType, TagSet};

    use super::write_line;

    fn reading(
        name: &str,
        metric_type: MetricType,
        value: f64,
        tags: &[(&str, &str)],
    ) -> MetricReading {
        let local: Vec<_> =
            tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        MetricReading::new(
            Arc::from(name),
            metric_type,
            value,
            TagSet::merge(name, &[], &local, None, None).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    fn line(reading: &MetricReading) -> String {
        let mut buf = Vec::new();
        write_line(&mut buf, reading).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn known_cases() {
        let cases = [
            (reading("req", MetricType::Counter, 7.0, &[("env", "p")]), "req:7|c|#env:p\n"),
            (reading("ext", MetricType::CumulativeCounter, 3.0, &[("env", "p")]), "ext:3|c|#env:p\n"),
            (reading("cpu", MetricType::Gauge, 0.5, &[("host", "a")]), "cpu:0.50000|g|#host:a\n"),
            (
                reading("mem", MetricType::Gauge, 1024.0, &[("host", "a"), ("env", "p")]),
                "mem:1024|g|#env:p,host:a\n",
            ),
            (reading("neg", MetricType::Gauge, -2.25, &[("host", "a")]), "neg:-2.25000|g|#host:a\n"),
        ];

        for (reading, expected) in &cases {
            assert_eq!(line(reading), *expected);
        }
    }

    #[test]
    fn non_finite_values_are_rejected() {
        let mut buf = Vec::new();
        let err =
            write_line(&mut buf, &reading("bad", MetricType::Gauge, f64::NAN, &[("h", "a")]))
                .unwrap_err();
        assert!(matches!(err, packhorse::SerializeError::NonFiniteValue { .. }));
        assert!(buf.is_empty() || !buf.contains(&b'\n'), "no complete line on failure");
    }

    proptest! {
        #[test]
        fn lines_are_well_formed(
            value in proptest::num::f64::NORMAL | proptest::num::f64::ZERO,
            tag_value in "[a-z0-9]{1,12}",
        ) {
            let reading = reading("m", MetricType::Gauge, value, &[("t", &tag_value)]);
            let rendered = line(&reading);

            prop_assert!(rendered.ends_with('\n'));
            let body = rendered.trim_end();
            let (name_value, rest) = body.split_once('|').unwrap();
            let (name, value_str) = name_value.split_once(':').unwrap();
            prop_assert_eq!(name, "m");
            prop_assert!(value_str.parse::<f64>().is_ok());
            prop_assert!(rest.starts_with('g'));
            let expected_tag = format!("#t:{}", tag_value);
            prop_assert!(rest.contains(&expected_tag));
        }
    }
}
