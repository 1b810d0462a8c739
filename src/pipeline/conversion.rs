/// Format detection and loader dispatch
///
/// Detects the vendor layout behind a path (file or directory), runs the
/// matching parser, and stamps the result with its provenance line and
/// reload source. Saving picks a writer from the output extension.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};

use crate::data::spectrum::{ReloadSource, SpectrumData, VendorFormat};
use crate::data::{
    bruker, chemagnetics, interchange, magritek, matlab, nmrpipe_format, simpson, varian,
    LoadError, SaveError,
};

/// Parser selected for a path.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub format: VendorFormat,
    /// File or directory handed to the parser
    pub path: PathBuf,
}

/// A freshly loaded dataset plus the non-fatal problems met on the way.
#[derive(Debug)]
pub struct Loaded {
    pub spectrum: SpectrumData,
    pub format: VendorFormat,
    pub warnings: Vec<String>,
}

// =========================================================================
//  Detection
// =========================================================================

/// `.fid`/`.spe` files are either NMRPipe (first big-endian float is 0.0)
/// or SIMPSON text.
fn sniff_fid(path: &Path) -> Result<VendorFormat, LoadError> {
    let mut head = [0u8; 4];
    let mut file = fs::File::open(path)?;
    let mut got = 0;
    while got < head.len() {
        let n = file.read(&mut head[got..])?;
        if n == 0 {
            break;
        }
        got += n;
    }
    if got == head.len() && BigEndian::read_f32(&head) == 0.0 {
        Ok(VendorFormat::NMRPipe)
    } else {
        Ok(VendorFormat::Simpson)
    }
}

fn has_magritek_payload(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|entries| {
            entries.flatten().any(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.contains(".1d") || name.contains(".2d")
            })
        })
        .unwrap_or(false)
}

/// Directory signatures, checked in priority order.
fn detect_directory(dir: &Path) -> Option<VendorFormat> {
    let has = |name: &str| dir.join(name).exists();
    let procpar_near = has("procpar")
        || dir
            .parent()
            .map(|p| p.join("procpar").exists())
            .unwrap_or(false);

    if (has("procpar") && has("fid")) || (procpar_near && has("data")) {
        Some(VendorFormat::Varian)
    } else if has("acqus") && (has("fid") || has("ser")) {
        Some(VendorFormat::Bruker)
    } else if has("procs") && (has("1r") || has("2rr")) {
        Some(VendorFormat::BrukerSpectrum)
    } else if has("acq") && has("data") {
        Some(VendorFormat::Chemagnetics)
    } else if has("acqu.par") && has_magritek_payload(dir) {
        Some(VendorFormat::Magritek)
    } else {
        None
    }
}

/// Detect the vendor format behind a path.
///
/// Regular files dispatch on extension; any other file re-runs detection on
/// its parent directory, so pointing at `acqus` or `procpar` works.
pub fn detect_format(path: &Path) -> Result<Detection, LoadError> {
    if path.is_file() {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let format = match ext.as_str() {
            "fid" | "spe" => Some(sniff_fid(path)?),
            "json" => Some(VendorFormat::Json),
            "mat" => Some(VendorFormat::Matlab),
            _ => None,
        };
        if let Some(format) = format {
            return Ok(Detection {
                format,
                path: path.to_path_buf(),
            });
        }
        if let Some(parent) = path.parent().filter(|p| p.is_dir()) {
            if let Some(format) = detect_directory(parent) {
                return Ok(Detection {
                    format,
                    path: parent.to_path_buf(),
                });
            }
        }
    } else if path.is_dir() {
        if let Some(format) = detect_directory(path) {
            return Ok(Detection {
                format,
                path: path.to_path_buf(),
            });
        }
    }
    Err(LoadError::UnrecognizedFormat(path.to_path_buf()))
}

// =========================================================================
//  Loading
// =========================================================================

/// Run one parser without touching history or reload source.
pub fn read_format(
    format: VendorFormat,
    path: &Path,
    warnings: &mut Vec<String>,
) -> Result<SpectrumData, LoadError> {
    match format {
        VendorFormat::Varian => varian::read_varian(path, warnings),
        VendorFormat::Bruker => bruker::read_bruker_fid(path, warnings),
        VendorFormat::BrukerSpectrum => bruker::read_bruker_spectrum(path, warnings),
        VendorFormat::Chemagnetics => chemagnetics::read_chemagnetics(path, warnings),
        VendorFormat::Magritek => magritek::read_magritek(path, warnings),
        VendorFormat::Simpson => simpson::read_simpson(path, warnings),
        VendorFormat::NMRPipe => nmrpipe_format::read_nmrpipe(path, warnings),
        VendorFormat::Json => interchange::read_json(path, warnings),
        VendorFormat::Matlab => matlab::read_matlab(path, warnings),
    }
}

/// Load a detected source and stamp it with its provenance.
pub fn load_detected(detection: &Detection) -> Result<Loaded, LoadError> {
    let mut warnings = Vec::new();
    let mut spectrum = read_format(detection.format, &detection.path, &mut warnings)?;
    spectrum.add_history(format!(
        "{} data loaded from {}",
        detection.format.history_label(),
        detection.path.display()
    ));
    spectrum.set_reload_source(ReloadSource {
        path: detection.path.clone(),
        format: detection.format,
    });
    for w in &warnings {
        log::warn!("{}: {}", detection.path.display(), w);
    }
    log::info!(
        "Loaded {} data from {} (shape {:?})",
        detection.format,
        detection.path.display(),
        spectrum.shape()
    );
    Ok(Loaded {
        spectrum,
        format: detection.format,
        warnings,
    })
}

/// Detect and load any supported path.
pub fn load_spectrum(path: &Path) -> Result<Loaded, LoadError> {
    let detection = detect_format(path)?;
    log::info!("Detected format: {} for {}", detection.format, path.display());
    load_detected(&detection)
}

/// Re-read the file a dataset was originally loaded from.
pub fn reload(source: &ReloadSource) -> Result<Loaded, LoadError> {
    load_detected(&Detection {
        format: source.format,
        path: source.path.clone(),
    })
}

// =========================================================================
//  Saving
// =========================================================================

/// Writers selectable by output extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveFormat {
    Json,
    Matlab,
    Simpson,
}

impl SaveFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_string_lossy().to_lowercase();
        match ext.as_str() {
            "json" => Some(SaveFormat::Json),
            "mat" => Some(SaveFormat::Matlab),
            "fid" | "spe" => Some(SaveFormat::Simpson),
            _ => None,
        }
    }
}

/// Save under the writer chosen by `path`'s extension. `binary` selects
/// the SIMPSON BINARY payload and is ignored by the other writers.
pub fn save_spectrum(
    spectrum: &SpectrumData,
    workspace: &str,
    path: &Path,
    binary: bool,
) -> Result<SaveFormat, SaveError> {
    let format = SaveFormat::from_path(path).ok_or_else(|| {
        SaveError::Unsupported(format!("no writer for {}", path.display()))
    })?;
    match format {
        SaveFormat::Json => interchange::write_json(spectrum, path)?,
        SaveFormat::Matlab => matlab::write_matlab(spectrum, workspace, path)?,
        SaveFormat::Simpson => simpson::write_simpson(spectrum, path, binary)?,
    }
    log::info!("Saved {} as {:?} to {}", workspace, format, path.display());
    Ok(format)
}
