//! The metric value type that flows through the whole pipeline.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The kind of a metric, mirroring the usual statsd/line-protocol taxonomy.
///
/// Kinds are informational: the pipeline does not change its behavior based
/// on the kind of a metric, serializers and outputs may.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricKind {
    Counter,
    Gauge,
    #[default]
    Untyped,
    Summary,
    Histogram,
}

/// A single field value.
///
/// Only a handful of primitive shapes are kept after construction; anything
/// else is dropped silently by [`IntoFieldValue`], matching the coercion
/// rules of the system this agent is modelled on.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Int(i64),
    UInt(u64),
    Str(String),
    Bool(bool),
}

/// Converts a Rust value into a [`FieldValue`], or drops it.
///
/// Integers and unsigned integers are widened to 64 bits, floats are widened
/// to `f64`, byte slices become strings. `None` (the stand-in for a nil
/// pointer) and any other shape are dropped, never an error.
pub trait IntoFieldValue {
    fn into_field_value(self) -> Option<FieldValue>;
}

macro_rules! impl_into_field_value {
    ($variant:ident; $($t:ty),+ $(,)?) => {
        $(
            impl IntoFieldValue for $t {
                fn into_field_value(self) -> Option<FieldValue> {
                    Some(FieldValue::$variant(self.into()))
                }
            }
        )+
    };
}

impl_into_field_value!(Float; f32, f64);
impl_into_field_value!(Int; i8, i16, i32, i64);
impl_into_field_value!(UInt; u8, u16, u32, u64);
impl_into_field_value!(Bool; bool);
impl_into_field_value!(Str; String, &str);

impl IntoFieldValue for &[u8] {
    fn into_field_value(self) -> Option<FieldValue> {
        Some(FieldValue::Str(String::from_utf8_lossy(self).into_owned()))
    }
}

impl IntoFieldValue for Vec<u8> {
    fn into_field_value(self) -> Option<FieldValue> {
        Some(FieldValue::Str(String::from_utf8_lossy(&self).into_owned()))
    }
}

impl<T: IntoFieldValue> IntoFieldValue for Option<T> {
    fn into_field_value(self) -> Option<FieldValue> {
        self.and_then(IntoFieldValue::into_field_value)
    }
}

impl IntoFieldValue for FieldValue {
    fn into_field_value(self) -> Option<FieldValue> {
        Some(self)
    }
}

/// An absolute timestamp with nanosecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub u128);

impl Timestamp {
    /// Returns the current wall-clock time.
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock should be after the unix epoch");
        Timestamp(since_epoch.as_nanos())
    }

    /// Rounds this timestamp down to the nearest multiple of `precision`.
    ///
    /// A zero precision is treated as "no rounding".
    pub fn round_down(self, precision: Duration) -> Self {
        let precision_ns = precision.as_nanos();
        if precision_ns == 0 {
            return self;
        }
        Timestamp(self.0 - (self.0 % precision_ns))
    }
}

/// A single tag (key, value) pair.
pub type Tag = (String, String);

/// A single field (key, value) pair.
pub type Field = (String, FieldValue);

/// A measurement: a name, a sorted set of tags, a set of fields, a timestamp
/// and a kind.
///
/// Metrics are immutable by convention once they leave their owning
/// [`crate::input::RunningInput`]: the fan-out stage only ever renames or
/// deep-copies them, it never edits fields or tags in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    name: String,
    tags: Vec<Tag>,
    fields: Vec<Field>,
    time: Timestamp,
    kind: MetricKind,
}

impl Metric {
    /// Builds a new metric, sorting tags by key and dropping any field that
    /// cannot be coerced to a [`FieldValue`].
    pub fn new<I, F, K, V>(name: impl Into<String>, tags: I, fields: F, time: Timestamp, kind: MetricKind) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
        F: IntoIterator<Item = (String, Option<FieldValue>)>,
    {
        let mut tags: Vec<Tag> = tags.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        tags.sort_by(|a, b| a.0.cmp(&b.0));

        let mut metric = Metric {
            name: name.into(),
            tags,
            fields: Vec::new(),
            time,
            kind,
        };
        for (key, value) in fields {
            if let Some(value) = value {
                metric.add_field(key, value);
            }
        }
        metric
    }

    /// Convenience constructor defaulting to [`MetricKind::Untyped`].
    pub fn untyped<I, K, V>(name: impl Into<String>, tags: I, time: Timestamp) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::new(name, tags, std::iter::empty(), time, MetricKind::Untyped)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn time(&self) -> Timestamp {
        self.time
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn add_prefix(&mut self, prefix: &str) {
        self.name = format!("{prefix}{}", self.name);
    }

    pub fn add_suffix(&mut self, suffix: &str) {
        self.name.push_str(suffix);
    }

    /// Inserts or replaces the tag with `key`, keeping the tag list sorted.
    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        match self.tags.binary_search_by(|(k, _)| k.cmp(&key)) {
            Ok(i) => self.tags[i].1 = value.into(),
            Err(i) => self.tags.insert(i, (key, value.into())),
        }
    }

    /// Inserts or replaces the field with `key`.
    pub fn add_field(&mut self, key: impl Into<String>, value: impl IntoFieldValue) {
        let Some(value) = value.into_field_value() else {
            return;
        };
        let key = key.into();
        if let Some(existing) = self.fields.iter_mut().find(|(k, _)| *k == key) {
            existing.1 = value;
        } else {
            self.fields.push((key, value));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns a structurally independent deep copy of this metric.
    pub fn clone_deep(&self) -> Self {
        self.clone()
    }

    /// Called when an output has durably accepted this metric.
    ///
    /// No-op on the base record; reserved for tracked variants.
    pub fn accept(&self) {}

    /// Called when an output has rejected this metric (it will be retried).
    pub fn reject(&self) {}

    /// Called when this metric was dropped, e.g. because a buffer overflowed.
    pub fn drop_metric(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(n: u128) -> Timestamp {
        Timestamp(n)
    }

    #[test]
    fn tags_are_sorted_by_key() {
        let m = Metric::new(
            "cpu",
            vec![("zone", "eu"), ("host", "a")],
            vec![("usage".to_string(), 1.0_f64.into_field_value())],
            ts(0),
            MetricKind::Untyped,
        );
        let keys: Vec<&str> = m.tags().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["host", "zone"]);
    }

    #[test]
    fn unconvertible_fields_are_dropped() {
        let m = Metric::new(
            "cpu",
            Vec::<(&str, &str)>::new(),
            vec![
                ("a".to_string(), 1i32.into_field_value()),
                ("b".to_string(), None::<i64>.into_field_value()),
            ],
            ts(0),
            MetricKind::Untyped,
        );
        assert_eq!(m.fields().len(), 1);
        assert_eq!(m.fields()[0], ("a".to_string(), FieldValue::Int(1)));
    }

    #[test]
    fn integers_widen_to_64_bits() {
        assert_eq!(42u8.into_field_value(), Some(FieldValue::UInt(42)));
        assert_eq!((-3i16).into_field_value(), Some(FieldValue::Int(-3)));
        assert_eq!(1.5f32.into_field_value(), Some(FieldValue::Float(1.5)));
    }

    #[test]
    fn add_field_upserts_by_key() {
        let mut m = Metric::untyped("cpu", Vec::<(&str, &str)>::new(), ts(0));
        m.add_field("usage", 1.0_f64);
        m.add_field("usage", 2.0_f64);
        assert_eq!(m.fields(), &[("usage".to_string(), FieldValue::Float(2.0))]);
    }

    #[test]
    fn clone_deep_is_independent() {
        let mut m = Metric::untyped("cpu", vec![("host", "a")], ts(0));
        m.add_field("usage", 1.0_f64);
        let mut copy = m.clone_deep();
        copy.set_tag("host", "b");
        copy.add_field("usage", 2.0_f64);
        assert_eq!(m.tags()[0].1, "a");
        assert_eq!(m.fields()[0].1, FieldValue::Float(1.0));
    }

    #[test]
    fn round_down_rounds_timestamp_to_precision() {
        let t = Timestamp(12_750_000_000); // 12.75s in ns
        let rounded = t.round_down(Duration::from_secs(1));
        assert_eq!(rounded.0, 12_000_000_000);
    }

    #[test]
    fn round_down_with_zero_precision_is_identity() {
        let t = Timestamp(12_345);
        assert_eq!(t.round_down(Duration::from_secs(0)), t);
    }
}
