//! Tunables for buffer sub-allocation.

use failure::Fail;
use serde::Deserialize;

/// How new buffers get laid out.
///
/// Usually read from the `memory` section of Nova's settings file:
///
/// ```json
/// {
///     "partitionSize": 256,
///     "partitionCount": 1024,
///     "stagingPartitionSize": 256,
///     "stagingPartitionCount": 1024
/// }
/// ```
///
/// Every field is optional.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MemorySettings {
    /// Smallest block, in bytes, in a newly created buffer. Requests bigger than a whole buffer of this partition size
    /// get a buffer with bigger partitions instead.
    #[serde(default = "MemorySettings::default_partition_size")]
    pub partition_size: u64,

    /// Number of partitions in a newly created buffer. Must be a power of two.
    #[serde(default = "MemorySettings::default_partition_count")]
    pub partition_count: u64,

    /// Smallest block, in bytes, in a newly created staging buffer.
    #[serde(default = "MemorySettings::default_partition_size")]
    pub staging_partition_size: u64,

    /// Number of partitions in a newly created staging buffer. Must be a power of two.
    #[serde(default = "MemorySettings::default_partition_count")]
    pub staging_partition_count: u64,
}

/// Failure type for bad memory settings.
#[derive(Fail, Debug)]
pub enum SettingsError {
    #[fail(display = "Error while parsing memory settings: {}", _0)]
    JsonError(serde_json::Error),

    #[fail(display = "Partition count {} for {} is not a power of two.", count, field)]
    PartitionCountNotPowerOfTwo { field: &'static str, count: u64 },

    #[fail(display = "Partition size for {} must not be zero.", _0)]
    ZeroPartitionSize(&'static str),
}

impl MemorySettings {
    fn default_partition_size() -> u64 {
        256
    }

    fn default_partition_count() -> u64 {
        1024
    }

    /// Parses and validates settings from JSON.
    pub fn from_json(json: &str) -> Result<Self, SettingsError> {
        let settings: MemorySettings = serde_json::from_str(json).map_err(SettingsError::JsonError)?;
        settings.validate()?;

        Ok(settings)
    }

    /// Checks that every partition count is a power of two and every partition size is non-zero.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let layouts = [
            ("partitionSize", self.partition_size, "partitionCount", self.partition_count),
            (
                "stagingPartitionSize",
                self.staging_partition_size,
                "stagingPartitionCount",
                self.staging_partition_count,
            ),
        ];

        for &(size_field, size, count_field, count) in layouts.iter() {
            if size == 0 {
                return Err(SettingsError::ZeroPartitionSize(size_field));
            }
            if !count.is_power_of_two() {
                return Err(SettingsError::PartitionCountNotPowerOfTwo {
                    field: count_field,
                    count,
                });
            }
        }

        Ok(())
    }
}

impl Default for MemorySettings {
    fn default() -> Self {
        MemorySettings {
            partition_size: Self::default_partition_size(),
            partition_count: Self::default_partition_count(),
            staging_partition_size: Self::default_partition_size(),
            staging_partition_count: Self::default_partition_count(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use matches::assert_matches;

    #[test]
    fn missing_fields_use_defaults() {
        let settings = MemorySettings::from_json(r#"{ "partitionCount": 64 }"#).unwrap();

        assert_eq!(settings.partition_count, 64);
        assert_eq!(settings.partition_size, 256);
        assert_eq!(settings.staging_partition_count, 1024);
    }

    #[test]
    fn empty_object_is_default() {
        assert_eq!(MemorySettings::from_json("{}").unwrap(), MemorySettings::default());
    }

    #[test]
    fn rejects_bad_partition_counts() {
        assert_matches!(
            MemorySettings::from_json(r#"{ "stagingPartitionCount": 1000 }"#),
            Err(SettingsError::PartitionCountNotPowerOfTwo {
                field: "stagingPartitionCount",
                count: 1000
            })
        );
        assert_matches!(
            MemorySettings::from_json(r#"{ "partitionSize": 0 }"#),
            Err(SettingsError::ZeroPartitionSize("partitionSize"))
        );
        assert_matches!(MemorySettings::from_json(r#"{ "partitionSize": "big" }"#), Err(SettingsError::JsonError(_)));
    }
}
