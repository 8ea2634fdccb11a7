//! HDF5 backend: `scan_parameters` is a group of scalar attributes, every
//! column is a dataset at the file root.

use ::hdf5::types::VarLenUnicode;
use ::hdf5::{File, Group};
use chrono::{DateTime, Local};
use log::warn;
use std::path::{Path, PathBuf};

use super::{Container, ScanParameters, candidate_paths};
use crate::error::StoreError;
use crate::scan::{PointStatus, ScanPlan};

const PARAMETERS: &str = "scan_parameters";

pub fn write_new(dir: &Path, stem: &str, container: &Container) -> Result<PathBuf, StoreError> {
    let path = candidate_paths(dir, stem, "hdf5")
        .find(|p| !p.exists())
        .ok_or_else(|| StoreError::Format {
            path: dir.join(stem),
            message: "no free file name".to_string(),
        })?;

    // Fails if the file appeared in the meantime
    let file = File::create_excl(&path)?;
    let written = write_contents(&file, container, &path);
    let closed = file.close().map_err(StoreError::from);

    if let Err(e) = written.and(closed) {
        if let Err(remove) = std::fs::remove_file(&path) {
            warn!("Could not remove incomplete {}: {remove}", path.display());
        }
        return Err(e);
    }
    Ok(path)
}

fn write_contents(file: &File, container: &Container, path: &Path) -> Result<(), StoreError> {
    write_parameters(&file.create_group(PARAMETERS)?, &container.scan_parameters, path)?;

    write_table(file, "positions", &container.positions)?;
    write_matrix(file, "spectra", &container.spectra)?;
    write_vector(file, "max_values", &container.max_values)?;
    write_vector(file, "min_values", &container.min_values)?;
    write_vector(file, "time_axis", &container.time_axis)?;
    write_table(file, "skipped_positions", &container.skipped_positions)?;

    let status: Vec<u8> = container
        .skipped_status
        .iter()
        .map(|s| status_code(*s))
        .collect();
    let dataset = file
        .new_dataset::<u8>()
        .shape([status.len()])
        .create("skipped_status")?;
    if !status.is_empty() {
        dataset.write_raw(&status)?;
    }
    Ok(())
}

pub fn read(path: &Path) -> Result<Container, StoreError> {
    let file = File::open(path)?;
    let scan_parameters = read_parameters(&file.group(PARAMETERS)?, path)?;

    let skipped_status = file
        .dataset("skipped_status")?
        .read_raw::<u8>()?
        .into_iter()
        .map(|code| status_from_code(code, path))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Container {
        scan_parameters,
        positions: read_table(&file, "positions", path)?,
        spectra: read_matrix(&file, "spectra", path)?,
        max_values: file.dataset("max_values")?.read_raw::<f64>()?,
        min_values: file.dataset("min_values")?.read_raw::<f64>()?,
        time_axis: file.dataset("time_axis")?.read_raw::<f64>()?,
        skipped_positions: read_table(&file, "skipped_positions", path)?,
        skipped_status,
    })
}

fn write_scalar(group: &Group, name: &str, value: f64) -> Result<(), StoreError> {
    group.new_attr::<f64>().create(name)?.write_scalar(&value)?;
    Ok(())
}

fn write_text(group: &Group, name: &str, value: &str, path: &Path) -> Result<(), StoreError> {
    let text: VarLenUnicode = value.parse().map_err(|e| StoreError::Format {
        path: path.to_path_buf(),
        message: format!("attribute {name}: {e}"),
    })?;
    group
        .new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&text)?;
    Ok(())
}

fn write_parameters(group: &Group, params: &ScanParameters, path: &Path) -> Result<(), StoreError> {
    let plan = &params.plan;
    for (name, value) in [
        ("center_x", plan.center_x),
        ("center_y", plan.center_y),
        ("width", plan.width),
        ("height", plan.height),
        ("step_x", plan.step_x),
        ("step_y", plan.step_y),
        ("t_min", plan.t_min),
        ("t_max", plan.t_max),
        ("wait_time", plan.wait_time_secs),
    ] {
        write_scalar(group, name, value)?;
    }

    // Absent humidity readings are left out rather than stored as a sentinel
    if let Some(h) = params.start_humidity {
        write_scalar(group, "start_humidity", h)?;
    }
    if let Some(h) = params.end_humidity {
        write_scalar(group, "end_humidity", h)?;
    }

    group
        .new_attr::<bool>()
        .create("completed")?
        .write_scalar(&params.completed)?;
    write_text(group, "message", &params.message, path)?;
    write_text(group, "started_at", &params.started_at.to_rfc3339(), path)?;
    Ok(())
}

fn read_parameters(group: &Group, path: &Path) -> Result<ScanParameters, StoreError> {
    let scalar = |name: &str| -> Result<f64, StoreError> {
        Ok(group.attr(name)?.read_scalar::<f64>()?)
    };
    let optional = |name: &str| -> Option<f64> {
        group
            .attr(name)
            .ok()
            .and_then(|attr| attr.read_scalar::<f64>().ok())
    };
    let text = |name: &str| -> Result<String, StoreError> {
        Ok(group
            .attr(name)?
            .read_scalar::<VarLenUnicode>()?
            .as_str()
            .to_string())
    };

    let started_at = text("started_at")?;
    let started_at = DateTime::parse_from_rfc3339(&started_at)
        .map_err(|e| StoreError::Format {
            path: path.to_path_buf(),
            message: format!("started_at: {e}"),
        })?
        .with_timezone(&Local);

    Ok(ScanParameters {
        plan: ScanPlan {
            center_x: scalar("center_x")?,
            center_y: scalar("center_y")?,
            width: scalar("width")?,
            height: scalar("height")?,
            step_x: scalar("step_x")?,
            step_y: scalar("step_y")?,
            t_min: scalar("t_min")?,
            t_max: scalar("t_max")?,
            wait_time_secs: scalar("wait_time")?,
        },
        start_humidity: optional("start_humidity"),
        end_humidity: optional("end_humidity"),
        completed: group.attr("completed")?.read_scalar::<bool>()?,
        message: text("message")?,
        started_at,
    })
}

fn write_vector(file: &File, name: &str, values: &[f64]) -> Result<(), StoreError> {
    let dataset = file.new_dataset::<f64>().shape([values.len()]).create(name)?;
    if !values.is_empty() {
        dataset.write_raw(values)?;
    }
    Ok(())
}

fn write_table(file: &File, name: &str, rows: &[[f64; 2]]) -> Result<(), StoreError> {
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    let dataset = file.new_dataset::<f64>().shape([rows.len(), 2]).create(name)?;
    if !flat.is_empty() {
        dataset.write_raw(&flat)?;
    }
    Ok(())
}

fn write_matrix(file: &File, name: &str, rows: &[Vec<f64>]) -> Result<(), StoreError> {
    let width = rows.first().map_or(0, Vec::len);
    if let Some((index, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != width) {
        return Err(StoreError::RaggedWaveforms {
            index,
            expected: width,
            found: row.len(),
        });
    }
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    let dataset = file
        .new_dataset::<f64>()
        .shape([rows.len(), width])
        .create(name)?;
    if !flat.is_empty() {
        dataset.write_raw(&flat)?;
    }
    Ok(())
}

fn read_matrix(file: &File, name: &str, path: &Path) -> Result<Vec<Vec<f64>>, StoreError> {
    let dataset = file.dataset(name)?;
    let shape = dataset.shape();
    let [rows, cols] = shape[..] else {
        return Err(StoreError::Format {
            path: path.to_path_buf(),
            message: format!("{name} has shape {shape:?}, expected two dimensions"),
        });
    };
    if rows == 0 {
        return Ok(Vec::new());
    }
    let flat = dataset.read_raw::<f64>()?;
    if cols == 0 {
        return Ok(vec![Vec::new(); rows]);
    }
    Ok(flat.chunks(cols).map(<[f64]>::to_vec).collect())
}

fn read_table(file: &File, name: &str, path: &Path) -> Result<Vec<[f64; 2]>, StoreError> {
    read_matrix(file, name, path)?
        .into_iter()
        .map(|row| {
            <[f64; 2]>::try_from(row.as_slice()).map_err(|_| StoreError::Format {
                path: path.to_path_buf(),
                message: format!("{name} rows must have two columns"),
            })
        })
        .collect()
}

fn status_code(status: PointStatus) -> u8 {
    match status {
        PointStatus::Acquired => 0,
        PointStatus::MoveFailed => 1,
        PointStatus::AcquireFailed => 2,
    }
}

fn status_from_code(code: u8, path: &Path) -> Result<PointStatus, StoreError> {
    match code {
        0 => Ok(PointStatus::Acquired),
        1 => Ok(PointStatus::MoveFailed),
        2 => Ok(PointStatus::AcquireFailed),
        other => Err(StoreError::Format {
            path: path.to_path_buf(),
            message: format!("unknown point status {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::sample_result;
    use crate::store::{StoreFormat, load, save_as};

    #[test]
    fn test_failed_write_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut container = Container::from_result(&sample_result()).unwrap();
        container.spectra[1].pop();

        let err = write_new(dir.path(), "scan_data_test", &container).unwrap_err();
        assert!(matches!(err, StoreError::RaggedWaveforms { index: 1, .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_hdf5_round_trip_is_bit_exact() {
        let dir = tempfile::tempdir().unwrap();
        let original = sample_result();

        let path = save_as(&original, dir.path(), StoreFormat::Hdf5).unwrap();
        assert_eq!(path.extension().unwrap(), "hdf5");

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.plan, original.plan);
        assert_eq!(loaded.start_humidity, original.start_humidity);
        assert_eq!(loaded.end_humidity, None);
        assert_eq!(loaded.message, original.message);

        let before = Container::from_result(&original).unwrap();
        let after = Container::from_result(&loaded).unwrap();
        let bits = |c: &Container| -> Vec<u64> {
            c.spectra.iter().flatten().map(|v| v.to_bits()).collect()
        };
        assert_eq!(bits(&before), bits(&after));
        assert_eq!(before.positions, after.positions);
        assert_eq!(before.skipped_status, after.skipped_status);
    }
}
