pub mod command;
pub mod conversion;
pub mod macros;
pub mod processing;
pub mod registry;
pub mod workspace;

#[cfg(test)]
mod tests {
    use super::command::Operation;
    use super::conversion;
    use super::macros::{self, MacroStep};
    use super::workspace::Workspace;
    use crate::data::spectrum::{AxisParams, SpectrumData};
    use ndarray::{ArrayD, IxDyn};
    use num_complex::Complex64;

    fn sample_2d() -> SpectrumData {
        let values = (0..8 * 16)
            .map(|k| Complex64::from_polar((-(k % 16) as f64 / 5.0).exp(), 0.4 * k as f64))
            .collect();
        let data = ArrayD::from_shape_vec(IxDyn(&[8, 16]), values).unwrap();
        SpectrumData::new(
            data,
            vec![AxisParams::new(150e6, 2000.0, false), AxisParams::new(600e6, 8000.0, false)],
        )
        .unwrap()
    }

    #[test]
    fn test_processed_dataset_survives_interchange_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("raw.json");
        crate::data::interchange::write_json(&sample_2d(), &source).unwrap();

        let loaded = conversion::load_spectrum(&source).unwrap();
        let mut ws = Workspace::new(loaded.spectrum);
        for op in [
            Operation::Apodize { lor: 30.0, gauss: 10.0, axis: -1 },
            Operation::Fourier { axis: -1 },
            Operation::Ref { reference: Some(600e6 - 120.0), axis: -1 },
            Operation::States { axis: 0 },
            Operation::Fourier { axis: 0 },
        ] {
            assert!(ws.apply(op, None).unwrap());
        }

        let saved = dir.path().join("processed.json");
        conversion::save_spectrum(ws.spectrum(), "spectrum0", &saved, false).unwrap();
        let back = conversion::load_spectrum(&saved).unwrap().spectrum;
        assert_eq!(back.data(), ws.spectrum().data());
        assert_eq!(back.axes(), ws.spectrum().axes());
        // the stored history plus the new load line
        assert_eq!(&back.history()[..ws.spectrum().history().len()], ws.spectrum().history());
        assert_eq!(back.history().len(), ws.spectrum().history().len() + 1);
    }

    #[test]
    fn test_macro_file_replays_on_fresh_load() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("raw.json");
        crate::data::interchange::write_json(&sample_2d(), &source).unwrap();

        let mut live = Workspace::new(conversion::load_spectrum(&source).unwrap().spectrum);
        let mut steps: Vec<MacroStep> = Vec::new();
        for op in [
            Operation::Size { size: 32, axis: 1 },
            Operation::Fourier { axis: 1 },
            Operation::Phase { phase0: 0.5, phase1: -1.0, axis: 1 },
            Operation::Reduce {
                kind: super::command::Reduction::Integrate,
                pos1: 10,
                pos2: 20,
                axis: 1,
            },
        ] {
            live.apply(op, Some(&mut steps)).unwrap();
        }
        let file = dir.path().join("macro.json");
        macros::save_macro(&steps, &file).unwrap();

        let mut replayed = Workspace::new(conversion::load_spectrum(&source).unwrap().spectrum);
        let report = macros::replay(&mut replayed, &macros::load_macro(&file).unwrap(), None);
        assert_eq!(report.applied, 4);
        assert_eq!(replayed.spectrum(), live.spectrum());
        assert_eq!(replayed.spectrum().shape(), &[8]);
    }
}
