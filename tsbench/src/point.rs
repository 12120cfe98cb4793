//! The data point model shared by generators and serializers.

use bytes::Bytes;

use crate::pool::Recycle;

/// The value of a single field of a [`Point`].
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    /// A signed 64-bit integer.
    Int(i64),
    /// A 64-bit float.
    Float(f64),
    /// A 32-bit float.
    Float32(f32),
    /// A boolean.
    Bool(bool),
    /// Raw bytes, written quoted. Clones share the buffer.
    Bytes(Bytes),
    /// Text, written quoted.
    Str(String),
}

/// One timestamped, multi-field sample to be written.
///
/// Tags and fields are kept in insertion order; serializers emit them exactly in that order.
/// A point is filled by a generator, handed to exactly one serializer, and then recycled through
/// a [`Pool`](crate::pool::Pool).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Point {
    /// Measurement name, e.g. `cpu`.
    pub measurement: String,
    /// Ordered tag key/value pairs.
    pub tags: Vec<(String, String)>,
    /// Ordered field key/value pairs.
    pub fields: Vec<(String, FieldValue)>,
    /// Timestamp in nanoseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Point {
    /// Sets the measurement name, reusing the existing allocation.
    pub fn set_measurement(&mut self, measurement: &str) {
        self.measurement.clear();
        self.measurement.push_str(measurement);
    }

    /// Appends a tag.
    pub fn push_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.push((key.into(), value.into()));
    }

    /// Appends a field.
    pub fn push_field(&mut self, key: impl Into<String>, value: FieldValue) {
        self.fields.push((key.into(), value));
    }

    /// Returns the timestamp truncated to milliseconds.
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.div_euclid(1_000_000)
    }
}

impl Recycle for Point {
    fn recycle(&mut self) {
        self.measurement.clear();
        self.tags.clear();
        self.fields.clear();
        self.timestamp = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;

    #[test]
    fn recycled_points_are_empty() {
        let pool = Pool::<Point>::new();

        let mut point = pool.get();
        point.set_measurement("cpu");
        point.push_tag("hostname", "host_0");
        point.push_field("usage_user", FieldValue::Float(1.5));
        point.timestamp = 1_451_606_400_123_456_789;
        assert_eq!(point.timestamp_millis(), 1_451_606_400_123);
        pool.put(point);

        let point = pool.get();
        assert_eq!(point, Point::default());
        assert!(point.tags.capacity() >= 1);
    }

    #[test]
    fn cloned_byte_fields_share_the_buffer() {
        let mut point = Point::default();
        point.set_measurement("log");
        point.push_field("raw", FieldValue::Bytes(Bytes::from(vec![1, 2, 3])));

        let copy = point.clone();
        let (FieldValue::Bytes(a), FieldValue::Bytes(b)) = (&point.fields[0].1, &copy.fields[0].1)
        else {
            panic!("expected byte fields");
        };
        assert_eq!(a, b);
        assert_eq!(a.as_ptr(), b.as_ptr());
    }
}
