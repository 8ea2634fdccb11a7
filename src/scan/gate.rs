use crate::error::ScanError;

/// Max and min of `waveform` over the samples whose time lies in `[t_min, t_max]`.
///
/// An empty gate yields `(0.0, 0.0)`. A waveform too short to cover a gated
/// index is a shape error rather than a skipped point.
pub fn gated_extrema(
    time_axis: &[f64],
    waveform: &[f64],
    t_min: f64,
    t_max: f64,
) -> Result<(f64, f64), ScanError> {
    let mut extrema: Option<(f64, f64)> = None;

    for (index, _) in time_axis
        .iter()
        .enumerate()
        .filter(|(_, t)| **t >= t_min && **t <= t_max)
    {
        let value = *waveform.get(index).ok_or(ScanError::WaveformShape {
            waveform_len: waveform.len(),
            index,
        })?;

        extrema = Some(match extrema {
            Some((max, min)) => (max.max(value), min.min(value)),
            None => (value, value),
        });
    }

    Ok(extrema.unwrap_or((0.0, 0.0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_is_inclusive() {
        let time_axis = [0.0, 1.0, 2.0, 3.0];
        let waveform = [100.0, 5.0, -2.0, -100.0];

        let (max, min) = gated_extrema(&time_axis, &waveform, 1.0, 2.0).unwrap();
        assert_eq!(max, 5.0);
        assert_eq!(min, -2.0);
    }

    #[test]
    fn test_empty_gate_records_zero() {
        let time_axis = [0.0, 1.0, 2.0, 3.0];
        let waveform = [1.0, 2.0, 3.0, 4.0];

        assert_eq!(
            gated_extrema(&time_axis, &waveform, 10.0, 20.0).unwrap(),
            (0.0, 0.0)
        );
        assert_eq!(gated_extrema(&[], &waveform, 0.0, 5.0).unwrap(), (0.0, 0.0));
    }

    #[test]
    fn test_short_waveform_is_shape_error() {
        let time_axis = [0.0, 1.0, 2.0, 3.0];
        let waveform = [1.0, 2.0];

        let err = gated_extrema(&time_axis, &waveform, 1.0, 3.0).unwrap_err();
        assert!(matches!(
            err,
            ScanError::WaveformShape {
                waveform_len: 2,
                index: 2
            }
        ));
    }

    #[test]
    fn test_longer_waveform_ignores_tail() {
        let time_axis = [0.0, 1.0];
        let waveform = [3.0, 4.0, 99.0];
        assert_eq!(
            gated_extrema(&time_axis, &waveform, 0.0, 1.0).unwrap(),
            (4.0, 3.0)
        );
    }
}
