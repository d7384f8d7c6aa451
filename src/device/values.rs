use std::collections::HashMap;
use std::mem::size_of;

use crate::error::ValueError;

/// A value that can be decoded from a characteristic payload.
///
/// Numeric payloads use the fixed-width big-endian layout the peripheral firmware sends.
pub trait FromPayload: Sized {
    /// Exact payload width in bytes, `None` if any width is accepted.
    const WIDTH: Option<usize>;

    /// Returns `None` if the payload does not have the expected width.
    fn from_payload(payload: &[u8]) -> Option<Self>;
}

impl FromPayload for Vec<u8> {
    const WIDTH: Option<usize> = None;

    fn from_payload(payload: &[u8]) -> Option<Self> {
        Some(payload.to_vec())
    }
}

macro_rules! impl_from_payload {
    ($($t:ty),*) => {
        $(
            impl FromPayload for $t {
                const WIDTH: Option<usize> = Some(size_of::<$t>());

                fn from_payload(payload: &[u8]) -> Option<Self> {
                    payload.try_into().ok().map(<$t>::from_be_bytes)
                }
            }
        )*
    };
}

impl_from_payload!(u8, i16, i32, u32, f64);

/// The latest raw payload received for every named characteristic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeasuredValues {
    values: HashMap<String, Vec<u8>>,
}

impl MeasuredValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces whatever was stored for `name`.
    pub fn insert(&mut self, name: &str, payload: Vec<u8>) {
        self.values.insert(name.to_string(), payload);
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.values.get(name).map(Vec::as_slice)
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn decode<T: FromPayload>(&self, name: &str) -> Result<T, ValueError> {
        let payload = self.get(name).ok_or_else(|| ValueError::Absent { name: name.to_string() })?;

        T::from_payload(payload).ok_or_else(|| ValueError::WidthMismatch {
            name: name.to_string(),
            expected: T::WIDTH.unwrap_or(payload.len()),
            actual: payload.len(),
        })
    }

    /// Decodes the value stored for `name`. The flag is `false` (and `default` is returned) if
    /// nothing was stored or the payload has the wrong width for `T`.
    pub fn value_or<T: FromPayload>(&self, name: &str, default: T) -> (T, bool) {
        match self.decode(name) {
            Ok(value) => (value, true),
            Err(err) => {
                if let ValueError::WidthMismatch { .. } = err {
                    log::warn!("{}", err);
                }
                (default, false)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(name: &str, payload: &[u8]) -> MeasuredValues {
        let mut values = MeasuredValues::new();
        values.insert(name, payload.to_vec());
        values
    }

    #[test]
    fn decodes_each_width_big_endian() {
        assert_eq!(store("v", &[0x2a]).decode::<u8>("v"), Ok(42));
        assert_eq!(store("v", &[0xff, 0xfe]).decode::<i16>("v"), Ok(-2));
        assert_eq!(store("v", &[0x00, 0x01, 0x00, 0x00]).decode::<i32>("v"), Ok(65536));
        assert_eq!(store("v", &[0xff, 0xff, 0xff, 0xff]).decode::<u32>("v"), Ok(u32::MAX));
        assert_eq!(store("v", &1.5f64.to_be_bytes()).decode::<f64>("v"), Ok(1.5));
        assert_eq!(store("v", &[1, 2, 3]).decode::<Vec<u8>>("v"), Ok(vec![1, 2, 3]));
    }

    #[test]
    fn absent_name_returns_default() {
        let values = store("finger_1", &[0x2a]);

        assert_eq!(values.value_or::<u8>("finger_2", 9), (9, false));
        assert_eq!(values.value_or::<Vec<u8>>("finger_2", vec![7]), (vec![7], false));
        assert_eq!(
            values.decode::<u8>("finger_2"),
            Err(ValueError::Absent { name: "finger_2".to_string() }),
        );
    }

    #[test]
    fn wrong_width_is_rejected() {
        let values = store("imu_x", &[0x01, 0x02]);

        assert_eq!(values.value_or::<u8>("imu_x", 5), (5, false));
        assert_eq!(values.value_or::<i32>("imu_x", -1), (-1, false));
        assert_eq!(
            values.decode::<u32>("imu_x"),
            Err(ValueError::WidthMismatch { name: "imu_x".to_string(), expected: 4, actual: 2 }),
        );
        assert_eq!(values.value_or::<i16>("imu_x", 0), (0x0102, true));

        let empty = store("imu_y", &[]);
        assert_eq!(empty.value_or::<u8>("imu_y", 3), (3, false));
        assert_eq!(empty.value_or::<Vec<u8>>("imu_y", vec![1]), (vec![], true));
    }

    #[test]
    fn insert_overwrites_instead_of_appending() {
        let mut values = store("finger_1", &[1, 2, 3, 4]);
        values.insert("finger_1", vec![5]);

        assert_eq!(values.get("finger_1"), Some(&[5u8][..]));
        assert_eq!(values.len(), 1);

        values.clear();
        assert!(values.is_empty());
    }
}
