//! Compact sensor payload encoding.
//!
//! Slots are written in this fixed order and only when the field is present:
//!
//! | Field                   | Size | Format                          | Decode     |
//! |-------------------------|------|---------------------------------|------------|
//! | `temp`/`temperature`    | 2    | big-endian i16, value x 10      | `v / 10`   |
//! | `humidity`              | 1    | u8, value x 2, saturated        | `v / 2`    |
//! | `pressure`              | 2    | big-endian u16, value x 10      | `v / 10`   |
//! | `battery`               | 1    | u8, percentage, saturated 0~100 | `v`        |
//!
//! Scaled values are rounded half away from zero. Unknown fields are ignored.

use std::collections::BTreeMap;

use super::error::Error;

/// Sensor readings by field name.
pub type Fields = BTreeMap<String, f64>;

/// Maximum encoded size when all slots are present.
pub const MAX_ENCODED: usize = 6;

pub fn encode(fields: &Fields) -> Result<Vec<u8>, Error> {
    let mut buff = Vec::with_capacity(MAX_ENCODED);

    // `temp` wins when both names are present.
    let temp = match fields.get("temp") {
        Some(v) => Some(("temp", *v)),
        None => fields.get("temperature").map(|v| ("temperature", *v)),
    };
    if let Some((field, value)) = temp {
        let scaled = scale(field, value, 10.0)?;
        if scaled < i16::MIN as f64 || scaled > i16::MAX as f64 {
            return Err(Error::Encoding { field, value });
        }
        buff.extend_from_slice(&(scaled as i16).to_be_bytes());
    }

    if let Some(value) = fields.get("humidity") {
        let scaled = scale("humidity", *value, 2.0)?;
        buff.push(scaled.clamp(0.0, u8::MAX as f64) as u8);
    }

    if let Some(value) = fields.get("pressure") {
        let scaled = scale("pressure", *value, 10.0)?;
        if scaled < 0.0 || scaled > u16::MAX as f64 {
            return Err(Error::Encoding {
                field: "pressure",
                value: *value,
            });
        }
        buff.extend_from_slice(&(scaled as u16).to_be_bytes());
    }

    if let Some(value) = fields.get("battery") {
        let scaled = scale("battery", *value, 1.0)?;
        buff.push(scaled.clamp(0.0, 100.0) as u8);
    }

    Ok(buff)
}

fn scale(field: &'static str, value: f64, factor: f64) -> Result<f64, Error> {
    if !value.is_finite() {
        return Err(Error::Encoding { field, value });
    }
    Ok((value * factor).round())
}
