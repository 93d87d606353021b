//! # Line Protocol Encoder
//!
//! Appends the parts of one record to a capacity-bounded buffer.
//!
//! Wire layout:
//!
//! ```text
//! name[,tagKey=tagValue]* field1=v1.000000[,fieldKey=value.000000]* epochSeconds
//! ```
//!
//! Each call either appends its whole piece or fails and leaves the buffer
//! exactly as it was. Nothing is ever truncated.

use crate::error::EncodeError;

/// Decimal places used for every numeric field
pub const FIELD_PRECISION: usize = 6;

/// Upper bound on the rendered width of one numeric value
///
/// Covers a sign, 24 integer digits, the point and six decimals. Wider
/// values are rejected by [`LineBuffer::add_field`].
pub const MAX_VALUE_WIDTH: usize = 32;

/// Upper bound on the rendered width of a timestamp (`i64::MIN`)
pub const MAX_TIMESTAMP_WIDTH: usize = 20;

/// Characters that would make a record ambiguous to split
const RESERVED: &[char] = &[' ', ',', '=', '\n', '\r', '"', '\\'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Empty,
    Named,
    Fields,
    Complete,
}

/// Capacity-bounded line protocol buffer
///
/// # Examples
///
/// ```
/// use telemetry_uplink::line_protocol::LineBuffer;
///
/// let mut line = LineBuffer::with_capacity(128);
/// line.set_name("measurements")?;
/// line.add_tag("source", "boat")?;
/// line.add_field("tensao", 12.5)?;
/// line.add_field("corrente", -0.25)?;
/// line.add_timestamp(1_700_000_000)?;
/// assert_eq!(
///     line.as_str(),
///     "measurements,source=boat tensao=12.500000,corrente=-0.250000 1700000000"
/// );
/// # Ok::<(), telemetry_uplink::error::EncodeError>(())
/// ```
#[derive(Debug, Clone)]
pub struct LineBuffer {
    buf: String,
    capacity: usize,
    stage: Stage,
    tag_keys: Vec<String>,
    field_keys: Vec<String>,
}

impl LineBuffer {
    /// Create an empty buffer that never grows past `capacity` bytes
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: String::with_capacity(capacity),
            capacity,
            stage: Stage::Empty,
            tag_keys: Vec::new(),
            field_keys: Vec::new(),
        }
    }

    /// Maximum number of bytes this buffer accepts
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Whether the timestamp has been written
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.stage == Stage::Complete
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.buf
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.buf
    }

    /// Write the measurement name; must be the first call
    pub fn set_name(&mut self, name: &str) -> Result<(), EncodeError> {
        if self.stage != Stage::Empty {
            return Err(EncodeError::OutOfOrder("name must come first"));
        }
        validate_token(name)?;

        self.append(name)?;
        self.stage = Stage::Named;
        Ok(())
    }

    /// Append `,key=value`; tags must precede every field
    pub fn add_tag(&mut self, key: &str, value: &str) -> Result<(), EncodeError> {
        if self.stage != Stage::Named {
            return Err(EncodeError::OutOfOrder("tags must follow the name and precede fields"));
        }
        validate_token(key)?;
        validate_token(value)?;
        if self.tag_keys.iter().any(|k| k == key) {
            return Err(EncodeError::DuplicateKey(key.to_string()));
        }

        self.append(&format!(",{}={}", key, value))?;
        self.tag_keys.push(key.to_string());
        Ok(())
    }

    /// Append a numeric field with fixed six-decimal precision
    ///
    /// The first field is prefixed with a space, every later one with a comma.
    /// A value rendering wider than [`MAX_VALUE_WIDTH`] fails with
    /// [`EncodeError::Capacity`] even when the buffer has room left.
    pub fn add_field(&mut self, key: &str, value: f64) -> Result<(), EncodeError> {
        if !matches!(self.stage, Stage::Named | Stage::Fields) {
            return Err(EncodeError::OutOfOrder("fields must follow the name and precede the timestamp"));
        }
        validate_token(key)?;
        if !value.is_finite() {
            return Err(EncodeError::NonFinite(key.to_string()));
        }
        if self.field_keys.iter().any(|k| k == key) {
            return Err(EncodeError::DuplicateKey(key.to_string()));
        }

        let rendered = format!("{:.*}", FIELD_PRECISION, value);
        if rendered.len() > MAX_VALUE_WIDTH {
            return Err(EncodeError::Capacity {
                needed: rendered.len(),
                capacity: MAX_VALUE_WIDTH,
            });
        }

        let separator = if self.stage == Stage::Named { ' ' } else { ',' };
        self.append(&format!("{}{}={}", separator, key, rendered))?;
        self.field_keys.push(key.to_string());
        self.stage = Stage::Fields;
        Ok(())
    }

    /// Append ` seconds`; requires at least one field and completes the record
    pub fn add_timestamp(&mut self, seconds: i64) -> Result<(), EncodeError> {
        if self.stage != Stage::Fields {
            return Err(EncodeError::OutOfOrder("timestamp requires at least one field"));
        }

        self.append(&format!(" {}", seconds))?;
        self.stage = Stage::Complete;
        Ok(())
    }

    fn append(&mut self, piece: &str) -> Result<(), EncodeError> {
        let needed = self.buf.len() + piece.len();
        if needed > self.capacity {
            return Err(EncodeError::Capacity {
                needed,
                capacity: self.capacity,
            });
        }
        self.buf.push_str(piece);
        Ok(())
    }
}

fn validate_token(token: &str) -> Result<(), EncodeError> {
    if token.is_empty() || token.contains(RESERVED) {
        return Err(EncodeError::InvalidToken(token.to_string()));
    }
    Ok(())
}
