use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::{Container, candidate_paths};
use crate::error::StoreError;

/// Write `container` to a file under `dir` that did not exist before
pub fn write_new(dir: &Path, stem: &str, container: &Container) -> Result<PathBuf, StoreError> {
    for path in candidate_paths(dir, stem, "json") {
        let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(source) => {
                return Err(StoreError::Io {
                    source,
                    context: format!("Creating {}", path.display()),
                });
            }
        };

        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, container)?;
        writer.flush().map_err(|source| StoreError::Io {
            source,
            context: format!("Writing {}", path.display()),
        })?;
        return Ok(path);
    }

    Err(StoreError::Format {
        path: dir.join(stem),
        message: "no free file name".to_string(),
    })
}

pub fn read(path: &Path) -> Result<Container, StoreError> {
    let file = File::open(path).map_err(|source| StoreError::Io {
        source,
        context: format!("Opening {}", path.display()),
    })?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// `serde(with)` adapters that keep every double intact in JSON. Finite values
/// stay plain numbers; infinities become `"inf"` / `"-inf"` and NaN becomes
/// `"NaN"`, or `"NaN:<hex bits>"` when its payload differs from the default.
pub(crate) mod lossless {
    use serde::de::{self, Deserializer, Visitor};
    use serde::ser::Serializer;
    use serde::{Deserialize, Serialize};
    use std::fmt;

    const NAN_BITS_PREFIX: &str = "NaN:";

    #[derive(Clone, Copy)]
    struct Float(f64);

    impl Serialize for Float {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            let value = self.0;
            if value.is_finite() {
                serializer.serialize_f64(value)
            } else if value == f64::INFINITY {
                serializer.serialize_str("inf")
            } else if value == f64::NEG_INFINITY {
                serializer.serialize_str("-inf")
            } else if value.to_bits() == f64::NAN.to_bits() {
                serializer.serialize_str("NaN")
            } else {
                serializer.serialize_str(&format!("{NAN_BITS_PREFIX}{:016x}", value.to_bits()))
            }
        }
    }

    fn parse_token(token: &str) -> Option<f64> {
        match token {
            "inf" => Some(f64::INFINITY),
            "-inf" => Some(f64::NEG_INFINITY),
            "NaN" => Some(f64::NAN),
            _ => {
                let bits = token.strip_prefix(NAN_BITS_PREFIX)?;
                let value = f64::from_bits(u64::from_str_radix(bits, 16).ok()?);
                value.is_nan().then_some(value)
            }
        }
    }

    struct FloatVisitor;

    impl Visitor<'_> for FloatVisitor {
        type Value = Float;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a number or one of \"inf\", \"-inf\", \"NaN\"")
        }

        fn visit_f64<E: de::Error>(self, value: f64) -> Result<Float, E> {
            Ok(Float(value))
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<Float, E> {
            Ok(Float(value as f64))
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<Float, E> {
            Ok(Float(value as f64))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Float, E> {
            parse_token(value)
                .map(Float)
                .ok_or_else(|| E::invalid_value(de::Unexpected::Str(value), &self))
        }
    }

    impl<'de> Deserialize<'de> for Float {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            deserializer.deserialize_any(FloatVisitor)
        }
    }

    struct Row<'a>(&'a [f64]);

    impl Serialize for Row<'_> {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_seq(self.0.iter().map(|v| Float(*v)))
        }
    }

    pub mod vec {
        use super::*;

        pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
            Row(values).serialize(serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
            let values = Vec::<Float>::deserialize(deserializer)?;
            Ok(values.into_iter().map(|f| f.0).collect())
        }
    }

    pub mod matrix {
        use super::*;

        pub fn serialize<S: Serializer>(rows: &[Vec<f64>], serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_seq(rows.iter().map(|row| Row(row)))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Vec<Vec<f64>>, D::Error> {
            let rows = Vec::<Vec<Float>>::deserialize(deserializer)?;
            Ok(rows
                .into_iter()
                .map(|row| row.into_iter().map(|f| f.0).collect())
                .collect())
        }
    }

    pub mod table {
        use super::*;

        pub fn serialize<S: Serializer>(rows: &[[f64; 2]], serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_seq(rows.iter().map(|row| Row(row)))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Vec<[f64; 2]>, D::Error> {
            let rows = Vec::<[Float; 2]>::deserialize(deserializer)?;
            Ok(rows.into_iter().map(|[x, y]| [x.0, y.0]).collect())
        }
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
            value.map(Float).serialize(serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
            Ok(Option::<Float>::deserialize(deserializer)?.map(|f| f.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::sample_result;

    #[test]
    fn test_layout_uses_container_names() {
        let dir = tempfile::tempdir().unwrap();
        let container = Container::from_result(&sample_result()).unwrap();
        let path = write_new(dir.path(), "scan_data_test", &container).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let params = &value["scan_parameters"];
        assert_eq!(params["center_x"], 85.0);
        assert_eq!(params["t_max"], 100.0);
        assert_eq!(params["start_humidity"], 41.25);
        assert!(params["end_humidity"].is_null());
        assert_eq!(value["positions"][1][0], 82.0);
        assert_eq!(value["spectra"].as_array().unwrap().len(), 2);
        assert_eq!(value["skipped_status"][0], "move_failed");
    }

    #[test]
    fn test_non_finite_values_are_written_as_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let mut result = sample_result();
        result.samples[0].waveform[1] = f64::NAN;
        result.samples[0].max = f64::INFINITY;
        result.time_axis[2] = f64::NEG_INFINITY;
        let container = Container::from_result(&result).unwrap();
        let path = write_new(dir.path(), "scan_data_test", &container).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["spectra"][0][1], "NaN");
        assert_eq!(value["max_values"][0], "inf");
        assert_eq!(value["time_axis"][2], "-inf");
        assert_eq!(value["time_axis"][1], 0.1);
    }

    #[test]
    fn test_unknown_token_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let container = Container::from_result(&sample_result()).unwrap();
        let path = write_new(dir.path(), "scan_data_test", &container).unwrap();

        let text = std::fs::read_to_string(&path)
            .unwrap()
            .replace("\"time_axis\":[0.0,", "\"time_axis\":[\"zero\",");
        std::fs::write(&path, text).unwrap();
        assert!(matches!(read(&path), Err(StoreError::Json(_))));
    }

    #[test]
    fn test_existing_file_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let taken = dir.path().join("scan_data_test.json");
        std::fs::write(&taken, "keep").unwrap();

        let container = Container::from_result(&sample_result()).unwrap();
        let path = write_new(dir.path(), "scan_data_test", &container).unwrap();

        assert_eq!(path, dir.path().join("scan_data_test_1.json"));
        assert_eq!(std::fs::read_to_string(&taken).unwrap(), "keep");
    }
}
