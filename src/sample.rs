//! Samples as they travel from a data source to storage.
//!
//! A [`Sample`] is a time stamp, an alarm status/severity pair and a typed
//! [`Value`]. Besides real data the engine inserts marker samples (repeat
//! counts, disconnect/stop/disable events) that use special [`Severity`]
//! values; markers other than [`Severity::Repeat`] carry a zero value.

use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a channel's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// 64-bit float
    Double,
    /// 32-bit float
    Float,
    /// 32-bit integer
    Long,
    /// 16-bit integer
    Short,
    /// Enumerated state index
    Enum,
    /// Byte
    Char,
    /// Single string
    Text,
}

/// Type and element count of a channel's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueShape {
    /// Element type
    pub value_type: ValueType,
    /// Number of elements (1 for scalars and text)
    pub count: usize,
}

impl ValueShape {
    /// Shape used before a source has told us its own.
    pub const DEFAULT: ValueShape = ValueShape {
        value_type: ValueType::Double,
        count: 1,
    };

    /// Shape with `count` elements of `value_type`.
    pub fn new(value_type: ValueType, count: usize) -> Self {
        Self { value_type, count }
    }
}

impl Default for ValueShape {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A channel value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// 64-bit floats
    Double(Vec<f64>),
    /// 32-bit floats
    Float(Vec<f32>),
    /// 32-bit integers
    Long(Vec<i32>),
    /// 16-bit integers
    Short(Vec<i16>),
    /// Enumerated state indices
    Enum(Vec<u16>),
    /// Bytes
    Char(Vec<u8>),
    /// A string
    Text(String),
}

impl Value {
    /// Scalar double.
    pub fn double(v: f64) -> Self {
        Value::Double(vec![v])
    }

    /// All-zero value of the given shape.
    pub fn zero(shape: ValueShape) -> Self {
        let n = shape.count.max(1);
        match shape.value_type {
            ValueType::Double => Value::Double(vec![0.0; n]),
            ValueType::Float => Value::Float(vec![0.0; n]),
            ValueType::Long => Value::Long(vec![0; n]),
            ValueType::Short => Value::Short(vec![0; n]),
            ValueType::Enum => Value::Enum(vec![0; n]),
            ValueType::Char => Value::Char(vec![0; n]),
            ValueType::Text => Value::Text(String::new()),
        }
    }

    /// Element type of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Double(_) => ValueType::Double,
            Value::Float(_) => ValueType::Float,
            Value::Long(_) => ValueType::Long,
            Value::Short(_) => ValueType::Short,
            Value::Enum(_) => ValueType::Enum,
            Value::Char(_) => ValueType::Char,
            Value::Text(_) => ValueType::Text,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            Value::Double(v) => v.len(),
            Value::Float(v) => v.len(),
            Value::Long(v) => v.len(),
            Value::Short(v) => v.len(),
            Value::Enum(v) => v.len(),
            Value::Char(v) => v.len(),
            Value::Text(_) => 1,
        }
    }

    /// Whether there are no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Type and element count.
    pub fn shape(&self) -> ValueShape {
        ValueShape::new(self.value_type(), self.len())
    }

    /// Bitwise equality; NaN equals NaN, `0.0` differs from `-0.0`.
    ///
    /// Repeat compression must treat an unchanged bit pattern as a repeat even
    /// where IEEE comparison would not.
    pub fn same_value(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Double(a), Value::Double(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Value::Float(a), Value::Float(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Short(a), Value::Short(b)) => a == b,
            (Value::Enum(a), Value::Enum(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            _ => false,
        }
    }

    /// The disable trigger: first element greater than zero.
    pub fn is_above_zero(&self) -> bool {
        match self {
            Value::Double(v) => v.first().is_some_and(|x| *x > 0.0),
            Value::Float(v) => v.first().is_some_and(|x| *x > 0.0),
            Value::Long(v) => v.first().is_some_and(|x| *x > 0),
            Value::Short(v) => v.first().is_some_and(|x| *x > 0),
            Value::Enum(v) => v.first().is_some_and(|x| *x > 0),
            Value::Char(v) => v.first().is_some_and(|x| *x > 0),
            Value::Text(_) => false,
        }
    }
}

fn join<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(" ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Double(v) => join(f, v),
            Value::Float(v) => join(f, v),
            Value::Long(v) => join(f, v),
            Value::Short(v) => join(f, v),
            Value::Enum(v) => join(f, v),
            Value::Char(v) => join(f, v),
            Value::Text(s) => f.write_str(s),
        }
    }
}

/// Alarm severity, extended with the engine's marker severities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// Normal value
    NoAlarm,
    /// Minor alarm
    Minor,
    /// Major alarm
    Major,
    /// Invalid value
    Invalid,
    /// Repeat marker; `status` holds the repeat count
    Repeat,
    /// Source disconnected
    Disconnected,
    /// Archiving stopped
    Stopped,
    /// Archiving disabled by a group
    Disabled,
}

impl Severity {
    /// Markers that carry no value of their own.
    pub fn is_info(self) -> bool {
        matches!(
            self,
            Severity::Disconnected | Severity::Stopped | Severity::Disabled
        )
    }

    /// Short label used in storage files and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::NoAlarm => "",
            Severity::Minor => "MINOR",
            Severity::Major => "MAJOR",
            Severity::Invalid => "INVALID",
            Severity::Repeat => "Repeat",
            Severity::Disconnected => "Disconnected",
            Severity::Stopped => "Archive_Off",
            Severity::Disabled => "Archive_Disabled",
        }
    }
}

/// One time-stamped value.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Time stamp
    pub time: Timestamp,
    /// Alarm status, or the repeat count of a repeat marker
    pub status: u32,
    /// Severity
    pub severity: Severity,
    /// Value
    pub value: Value,
}

impl Sample {
    /// Regular sample without alarm.
    pub fn new(time: Timestamp, value: Value) -> Self {
        Self {
            time,
            status: 0,
            severity: Severity::NoAlarm,
            value,
        }
    }

    /// Zero-valued marker of the given severity.
    pub fn event(severity: Severity, time: Timestamp, shape: ValueShape) -> Self {
        Self {
            time,
            status: 0,
            severity,
            value: Value::zero(shape),
        }
    }

    /// Copy with a different time stamp.
    pub fn restamped(&self, time: Timestamp) -> Self {
        Self {
            time,
            ..self.clone()
        }
    }

    /// Whether this is a disconnect/stop/disable marker.
    pub fn is_info(&self) -> bool {
        self.severity.is_info()
    }
}

/// Display and control information a source reports on connect.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Metadata {
    /// Engineering units
    pub units: String,
    /// Display precision
    pub precision: u8,
    /// Lower display limit
    pub display_low: f64,
    /// Upper display limit
    pub display_high: f64,
    /// State names for enumerated values
    pub enum_strings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::from_secs_f64;

    #[test]
    fn nan_repeats_compare_equal() {
        let a = Value::double(f64::NAN);
        let b = Value::double(f64::NAN);
        assert!(a.same_value(&b));
        assert_ne!(a, b);
        assert!(!Value::double(0.0).same_value(&Value::double(-0.0)));
    }

    #[test]
    fn different_types_never_match() {
        assert!(!Value::Long(vec![1]).same_value(&Value::Short(vec![1])));
        assert!(!Value::Double(vec![1.0]).same_value(&Value::Double(vec![1.0, 2.0])));
    }

    #[test]
    fn above_zero_uses_first_element() {
        assert!(Value::Double(vec![0.5, -1.0]).is_above_zero());
        assert!(!Value::Long(vec![0, 5]).is_above_zero());
        assert!(Value::Enum(vec![1]).is_above_zero());
        assert!(!Value::Double(vec![]).is_above_zero());
        assert!(!Value::Text("1".into()).is_above_zero());
    }

    #[test]
    fn event_is_zero_valued_info() {
        let shape = ValueShape::new(ValueType::Short, 3);
        let s = Sample::event(Severity::Stopped, from_secs_f64(5.0), shape);
        assert!(s.is_info());
        assert_eq!(s.value, Value::Short(vec![0, 0, 0]));
        assert_eq!(s.value.shape(), shape);
        assert!(!Sample::event(Severity::Repeat, from_secs_f64(5.0), shape).is_info());
    }

    #[test]
    fn display_joins_elements() {
        assert_eq!(Value::Long(vec![1, 2, 3]).to_string(), "1 2 3");
        assert_eq!(Value::Text("on".into()).to_string(), "on");
    }
}
