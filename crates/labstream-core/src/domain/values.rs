//! Typed channel values and conversion between channel formats.
//!
//! A sample's values are stored as one [`ChannelValues`] variant per format.
//! Callers push and pull with whatever Rust element type suits them (any
//! type implementing [`SampleValue`]); values are converted to the stream's
//! declared [`ChannelFormat`] on push and to the caller's type on pull.
//!
//! Conversion rules:
//!
//! - integer → integer goes through `i64` and truncates with `as`,
//! - numeric → float and float → integer go through `f64` (float → integer
//!   saturates, NaN becomes 0),
//! - numeric → string uses `Display`; string → numeric parses the trimmed
//!   text as `f64` and fails with [`ValueError::NotANumber`] otherwise.

use thiserror::Error;

use crate::domain::channel_format::ChannelFormat;

/// Errors raised when channel values do not fit a stream.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValueError {
    /// The number of values does not match the stream's channel count.
    #[error("expected {expected} channel values, got {actual}")]
    ChannelCountMismatch { expected: usize, actual: usize },

    /// A multiplexed chunk buffer is not a whole number of samples.
    #[error("chunk of {len} values is not a multiple of {channels} channels")]
    RaggedChunk { len: usize, channels: usize },

    /// A chunk's timestamp list does not line up with its samples.
    #[error("{samples} samples were given {timestamps} timestamps")]
    TimestampCountMismatch { samples: usize, timestamps: usize },

    /// The target format cannot hold any values.
    #[error("cannot convert {from} values to {to}")]
    IncompatibleFormat {
        from: ChannelFormat,
        to: ChannelFormat,
    },

    /// A string value could not be parsed as a number.
    #[error("value {value:?} is not a number")]
    NotANumber { value: String },
}

/// The values of one sample, tagged by format.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelValues {
    Float32(Vec<f32>),
    Double64(Vec<f64>),
    String(Vec<String>),
    Int32(Vec<i32>),
    Int16(Vec<i16>),
    Int8(Vec<i8>),
    Int64(Vec<i64>),
}

impl ChannelValues {
    /// The format of the stored values.
    pub fn format(&self) -> ChannelFormat {
        match self {
            ChannelValues::Float32(_) => ChannelFormat::Float32,
            ChannelValues::Double64(_) => ChannelFormat::Double64,
            ChannelValues::String(_) => ChannelFormat::String,
            ChannelValues::Int32(_) => ChannelFormat::Int32,
            ChannelValues::Int16(_) => ChannelFormat::Int16,
            ChannelValues::Int8(_) => ChannelFormat::Int8,
            ChannelValues::Int64(_) => ChannelFormat::Int64,
        }
    }

    /// Number of channel values.
    pub fn len(&self) -> usize {
        match self {
            ChannelValues::Float32(v) => v.len(),
            ChannelValues::Double64(v) => v.len(),
            ChannelValues::String(v) => v.len(),
            ChannelValues::Int32(v) => v.len(),
            ChannelValues::Int16(v) => v.len(),
            ChannelValues::Int8(v) => v.len(),
            ChannelValues::Int64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Builds `channels` zero values (empty strings for text) of `format`.
    ///
    /// Returns `None` for [`ChannelFormat::Undefined`].
    pub fn zeroed(format: ChannelFormat, channels: usize) -> Option<Self> {
        let values = match format {
            ChannelFormat::Float32 => ChannelValues::Float32(vec![0.0; channels]),
            ChannelFormat::Double64 => ChannelValues::Double64(vec![0.0; channels]),
            ChannelFormat::String => ChannelValues::String(vec![String::new(); channels]),
            ChannelFormat::Int32 => ChannelValues::Int32(vec![0; channels]),
            ChannelFormat::Int16 => ChannelValues::Int16(vec![0; channels]),
            ChannelFormat::Int8 => ChannelValues::Int8(vec![0; channels]),
            ChannelFormat::Int64 => ChannelValues::Int64(vec![0; channels]),
            ChannelFormat::Undefined => return None,
        };
        Some(values)
    }

    /// Converts the values to `target`, consuming `self`.
    ///
    /// Converting to the current format is free.
    ///
    /// # Errors
    ///
    /// [`ValueError::IncompatibleFormat`] when `target` is undefined and
    /// [`ValueError::NotANumber`] when a string does not parse.
    pub fn convert(self, target: ChannelFormat) -> Result<ChannelValues, ValueError> {
        let from = self.format();
        if from == target {
            return Ok(self);
        }
        match target {
            ChannelFormat::Undefined => Err(ValueError::IncompatibleFormat { from, to: target }),
            ChannelFormat::String => Ok(ChannelValues::String(self.to_strings())),
            _ if from.is_integer() && target.is_integer() => {
                Ok(Self::from_i64(target, &self.to_i64()))
            }
            _ => Ok(Self::from_f64(target, &self.to_f64()?)),
        }
    }

    fn to_strings(&self) -> Vec<String> {
        match self {
            ChannelValues::Float32(v) => v.iter().map(|x| x.to_string()).collect(),
            ChannelValues::Double64(v) => v.iter().map(|x| x.to_string()).collect(),
            ChannelValues::String(v) => v.clone(),
            ChannelValues::Int32(v) => v.iter().map(|x| x.to_string()).collect(),
            ChannelValues::Int16(v) => v.iter().map(|x| x.to_string()).collect(),
            ChannelValues::Int8(v) => v.iter().map(|x| x.to_string()).collect(),
            ChannelValues::Int64(v) => v.iter().map(|x| x.to_string()).collect(),
        }
    }

    fn to_i64(&self) -> Vec<i64> {
        match self {
            ChannelValues::Int32(v) => v.iter().map(|&x| i64::from(x)).collect(),
            ChannelValues::Int16(v) => v.iter().map(|&x| i64::from(x)).collect(),
            ChannelValues::Int8(v) => v.iter().map(|&x| i64::from(x)).collect(),
            ChannelValues::Int64(v) => v.clone(),
            ChannelValues::Float32(v) => v.iter().map(|&x| x as i64).collect(),
            ChannelValues::Double64(v) => v.iter().map(|&x| x as i64).collect(),
            ChannelValues::String(v) => v.iter().map(|s| s.trim().parse().unwrap_or(0)).collect(),
        }
    }

    fn to_f64(&self) -> Result<Vec<f64>, ValueError> {
        let numbers = match self {
            ChannelValues::Float32(v) => v.iter().map(|&x| f64::from(x)).collect(),
            ChannelValues::Double64(v) => v.clone(),
            ChannelValues::Int32(v) => v.iter().map(|&x| f64::from(x)).collect(),
            ChannelValues::Int16(v) => v.iter().map(|&x| f64::from(x)).collect(),
            ChannelValues::Int8(v) => v.iter().map(|&x| f64::from(x)).collect(),
            ChannelValues::Int64(v) => v.iter().map(|&x| x as f64).collect(),
            ChannelValues::String(v) => v
                .iter()
                .map(|s| {
                    s.trim().parse::<f64>().map_err(|_| ValueError::NotANumber {
                        value: s.clone(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(numbers)
    }

    fn from_i64(target: ChannelFormat, v: &[i64]) -> ChannelValues {
        match target {
            ChannelFormat::Int32 => ChannelValues::Int32(v.iter().map(|&x| x as i32).collect()),
            ChannelFormat::Int16 => ChannelValues::Int16(v.iter().map(|&x| x as i16).collect()),
            ChannelFormat::Int8 => ChannelValues::Int8(v.iter().map(|&x| x as i8).collect()),
            _ => ChannelValues::Int64(v.to_vec()),
        }
    }

    fn from_f64(target: ChannelFormat, v: &[f64]) -> ChannelValues {
        match target {
            ChannelFormat::Float32 => ChannelValues::Float32(v.iter().map(|&x| x as f32).collect()),
            ChannelFormat::Int32 => ChannelValues::Int32(v.iter().map(|&x| x as i32).collect()),
            ChannelFormat::Int16 => ChannelValues::Int16(v.iter().map(|&x| x as i16).collect()),
            ChannelFormat::Int8 => ChannelValues::Int8(v.iter().map(|&x| x as i8).collect()),
            ChannelFormat::Int64 => ChannelValues::Int64(v.iter().map(|&x| x as i64).collect()),
            _ => ChannelValues::Double64(v.to_vec()),
        }
    }

    /// Deterministic values used to validate a freshly negotiated data
    /// connection: both ends build the same pattern and compare.
    ///
    /// Odd channels are negated; integer patterns stay below the format's
    /// maximum.
    pub fn test_pattern(format: ChannelFormat, channels: usize, offset: i64) -> Option<Self> {
        fn signed(k: usize, val: i64) -> i64 {
            if k % 2 == 0 {
                val
            } else {
                -val
            }
        }
        fn integral(channels: usize, base: i64, max: i64) -> Vec<i64> {
            (0..channels)
                .map(|k| signed(k, (k as i64 + base) % max))
                .collect()
        }

        let values = match format {
            ChannelFormat::Float32 => ChannelValues::Float32(
                (0..channels)
                    .map(|k| signed(k, k as i64 + offset) as f32)
                    .collect(),
            ),
            ChannelFormat::Double64 => ChannelValues::Double64(
                (0..channels)
                    .map(|k| signed(k, k as i64 + offset + 16_777_217) as f64)
                    .collect(),
            ),
            ChannelFormat::String => ChannelValues::String(
                (0..channels)
                    .map(|k| signed(k, k as i64 + 10).to_string())
                    .collect(),
            ),
            ChannelFormat::Int32 => Self::from_i64(
                format,
                &integral(channels, offset + 65_537, i64::from(i32::MAX)),
            ),
            ChannelFormat::Int16 => Self::from_i64(
                format,
                &integral(channels, offset + 257, i64::from(i16::MAX)),
            ),
            ChannelFormat::Int8 => {
                Self::from_i64(format, &integral(channels, offset + 1, i64::from(i8::MAX)))
            }
            ChannelFormat::Int64 => ChannelValues::Int64(
                (0..channels)
                    .map(|k| signed(k, k as i64 + offset + 2_147_483_649))
                    .collect(),
            ),
            ChannelFormat::Undefined => return None,
        };
        Some(values)
    }
}

/// A Rust element type that can be pushed to or pulled from a stream.
///
/// Implemented for `i8`, `i16`, `i32`, `i64`, `f32`, `f64` and `String`.
pub trait SampleValue: Sized + Clone + Send + 'static {
    /// The channel format this type maps to without conversion.
    const FORMAT: ChannelFormat;

    /// Wraps a vector of this type into [`ChannelValues`].
    fn wrap(values: Vec<Self>) -> ChannelValues;

    /// Unwraps values that are already in [`Self::FORMAT`].
    fn unwrap(values: ChannelValues) -> Option<Vec<Self>>;

    /// Converts any values into this type.
    ///
    /// # Errors
    ///
    /// Propagates [`ChannelValues::convert`] failures.
    fn from_values(values: ChannelValues) -> Result<Vec<Self>, ValueError> {
        let from = values.format();
        Self::unwrap(values.convert(Self::FORMAT)?).ok_or(ValueError::IncompatibleFormat {
            from,
            to: Self::FORMAT,
        })
    }
}

macro_rules! impl_sample_value {
    ($ty:ty, $variant:ident) => {
        impl SampleValue for $ty {
            const FORMAT: ChannelFormat = ChannelFormat::$variant;

            fn wrap(values: Vec<Self>) -> ChannelValues {
                ChannelValues::$variant(values)
            }

            fn unwrap(values: ChannelValues) -> Option<Vec<Self>> {
                match values {
                    ChannelValues::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_sample_value!(f32, Float32);
impl_sample_value!(f64, Double64);
impl_sample_value!(String, String);
impl_sample_value!(i32, Int32);
impl_sample_value!(i16, Int16);
impl_sample_value!(i8, Int8);
impl_sample_value!(i64, Int64);

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_same_format_is_identity() {
        // Arrange
        let values = ChannelValues::Int16(vec![1, -2, 3]);

        // Act
        let converted = values.clone().convert(ChannelFormat::Int16).expect("convert");

        // Assert
        assert_eq!(converted, values);
    }

    #[test]
    fn test_convert_float_to_int8_saturates() {
        // Arrange
        let values = ChannelValues::Double64(vec![1000.0, -1000.0, 3.7, f64::NAN]);

        // Act
        let converted = values.convert(ChannelFormat::Int8).expect("convert");

        // Assert
        assert_eq!(converted, ChannelValues::Int8(vec![127, -128, 3, 0]));
    }

    #[test]
    fn test_convert_int64_to_int32_keeps_small_values_exact() {
        let values = ChannelValues::Int64(vec![i64::from(i32::MAX), -5]);

        let converted = values.convert(ChannelFormat::Int32).expect("convert");

        assert_eq!(converted, ChannelValues::Int32(vec![i32::MAX, -5]));
    }

    #[test]
    fn test_convert_numbers_to_strings_and_back() {
        // Arrange
        let values = ChannelValues::Int32(vec![42, -7]);

        // Act
        let text = values.convert(ChannelFormat::String).expect("to string");
        let back = text.clone().convert(ChannelFormat::Double64).expect("to double");

        // Assert
        assert_eq!(
            text,
            ChannelValues::String(vec!["42".to_string(), "-7".to_string()])
        );
        assert_eq!(back, ChannelValues::Double64(vec![42.0, -7.0]));
    }

    #[test]
    fn test_convert_non_numeric_string_fails() {
        let values = ChannelValues::String(vec!["marker".to_string()]);

        let result = values.convert(ChannelFormat::Float32);

        assert_eq!(
            result,
            Err(ValueError::NotANumber {
                value: "marker".to_string()
            })
        );
    }

    #[test]
    fn test_convert_to_undefined_fails() {
        let result = ChannelValues::Int8(vec![1]).convert(ChannelFormat::Undefined);

        assert!(matches!(result, Err(ValueError::IncompatibleFormat { .. })));
    }

    #[test]
    fn test_sample_value_from_values_converts() {
        // Act
        let pulled = f32::from_values(ChannelValues::Int8(vec![1, -1])).expect("convert");

        // Assert
        assert_eq!(pulled, vec![1.0f32, -1.0]);
    }

    #[test]
    fn test_test_pattern_alternates_sign_and_is_deterministic() {
        // Act
        let a = ChannelValues::test_pattern(ChannelFormat::Int32, 4, 4).expect("pattern");
        let b = ChannelValues::test_pattern(ChannelFormat::Int32, 4, 4).expect("pattern");

        // Assert
        assert_eq!(a, b);
        assert_eq!(
            a,
            ChannelValues::Int32(vec![65_541, -65_542, 65_543, -65_544])
        );
    }

    #[test]
    fn test_test_pattern_int8_stays_in_range() {
        let pattern = ChannelValues::test_pattern(ChannelFormat::Int8, 300, 4).expect("pattern");

        assert_eq!(pattern.len(), 300);
    }

    #[test]
    fn test_zeroed_undefined_is_none() {
        assert!(ChannelValues::zeroed(ChannelFormat::Undefined, 3).is_none());
        assert_eq!(
            ChannelValues::zeroed(ChannelFormat::Int16, 2),
            Some(ChannelValues::Int16(vec![0, 0]))
        );
    }
}
