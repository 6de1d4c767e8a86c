//! Serializers turn metrics into bytes for an output sink to ship out.

use crate::metric::{FieldValue, Metric};

/// Converts metrics into a wire/text representation.
pub trait Serializer: Send {
    fn serialize(&self, metric: &Metric) -> anyhow::Result<Vec<u8>>;

    /// Serializes a batch. The default implementation serializes each
    /// metric individually and concatenates the results; a serializer with
    /// a real batch framing (e.g. a JSON array) should override this.
    fn serialize_batch(&self, metrics: &[Metric]) -> anyhow::Result<Vec<u8>> {
        let mut out = Vec::new();
        for metric in metrics {
            out.extend(self.serialize(metric)?);
        }
        Ok(out)
    }
}

/// A minimal line-protocol-style text serializer:
/// `name,tag=value,... field=value,... timestamp_ns`
pub struct TextSerializer;

impl TextSerializer {
    fn format_field(value: &FieldValue) -> String {
        match value {
            FieldValue::Float(f) => format!("{f}"),
            FieldValue::Int(i) => format!("{i}i"),
            FieldValue::UInt(u) => format!("{u}u"),
            FieldValue::Str(s) => format!("{:?}", s),
            FieldValue::Bool(b) => format!("{b}"),
        }
    }
}

impl Serializer for TextSerializer {
    fn serialize(&self, metric: &Metric) -> anyhow::Result<Vec<u8>> {
        let mut line = metric.name().to_string();
        for (k, v) in metric.tags() {
            line.push(',');
            line.push_str(k);
            line.push('=');
            line.push_str(v);
        }
        line.push(' ');
        let fields: Vec<String> = metric
            .fields()
            .iter()
            .map(|(k, v)| format!("{k}={}", Self::format_field(v)))
            .collect();
        line.push_str(&fields.join(","));
        line.push(' ');
        line.push_str(&metric.time().0.to_string());
        line.push('\n');
        Ok(line.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Timestamp;

    #[test]
    fn text_serializer_formats_name_tags_fields_and_time() {
        let mut m = Metric::untyped("cpu", vec![("host", "a")], Timestamp(42));
        m.add_field("usage", 1.5_f64);
        let serializer = TextSerializer;
        let line = String::from_utf8(serializer.serialize(&m).unwrap()).unwrap();
        assert_eq!(line, "cpu,host=a usage=1.5 42\n");
    }

    #[test]
    fn serialize_batch_concatenates_lines() {
        let m1 = Metric::untyped("cpu", Vec::<(&str, &str)>::new(), Timestamp(0));
        let m2 = Metric::untyped("mem", Vec::<(&str, &str)>::new(), Timestamp(1));
        let serializer = TextSerializer;
        let out = String::from_utf8(serializer.serialize_batch(&[m1, m2]).unwrap()).unwrap();
        assert_eq!(out.lines().count(), 2);
    }
}
