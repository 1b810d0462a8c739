/// JSON interchange container
///
/// Object with `dataReal`/`dataImag` (nested arrays in the data shape),
/// `freq`, `sw`, `spec`, `wholeEcho`, `ref`, `history` and `xaxArray`.
/// Non-finite numbers are written as the strings `"NaN"`, `"Infinity"` and
/// `"-Infinity"`. Bare tokens from older tools read the same way; `null`
/// reads as NaN in numeric arrays and as an unset reference in `ref`.

use std::borrow::Cow;
use std::fs;
use std::path::Path;

use ndarray::{ArrayD, IxDyn};
use num_complex::Complex64;
use serde::Serialize;
use serde_json::{Map, Value};

use super::spectrum::{AxisParams, SpectrumData};
use super::{read_required_text, LoadError, SaveError};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Container {
    data_real: Value,
    data_imag: Value,
    freq: Value,
    sw: Value,
    spec: Vec<u8>,
    whole_echo: Vec<u8>,
    #[serde(rename = "ref")]
    reference: Vec<Value>,
    history: Vec<String>,
    xax_array: Vec<Value>,
}

const NAN_TOKEN: &str = "NaN";
const INF_TOKEN: &str = "Infinity";
const NEG_INF_TOKEN: &str = "-Infinity";

// ────────────────────────────────────────────────────────────────
//  Writer
// ────────────────────────────────────────────────────────────────

fn number_value(v: f64) -> Value {
    if v.is_nan() {
        Value::from(NAN_TOKEN)
    } else if v == f64::INFINITY {
        Value::from(INF_TOKEN)
    } else if v == f64::NEG_INFINITY {
        Value::from(NEG_INF_TOKEN)
    } else {
        Value::from(v)
    }
}

fn number_array(values: &[f64]) -> Value {
    Value::Array(values.iter().copied().map(number_value).collect())
}

/// Nest a row-major buffer into arrays of arrays following `shape`.
fn nest(values: &[f64], shape: &[usize]) -> Value {
    match shape {
        [] | [_] => number_array(values),
        [n, rest @ ..] => {
            let stride: usize = rest.iter().product();
            Value::Array(
                (0..*n)
                    .map(|i| nest(&values[i * stride..(i + 1) * stride], rest))
                    .collect(),
            )
        }
    }
}

/// Serialize a dataset to the interchange layout.
pub fn to_json(spectrum: &SpectrumData) -> Result<String, SaveError> {
    let shape = spectrum.shape();
    let re: Vec<f64> = spectrum.data().iter().map(|c| c.re).collect();
    let im: Vec<f64> = spectrum.data().iter().map(|c| c.im).collect();
    let container = Container {
        data_real: nest(&re, shape),
        data_imag: nest(&im, shape),
        freq: number_array(&spectrum.freq()),
        sw: number_array(&spectrum.sw()),
        spec: spectrum.spec().into_iter().map(u8::from).collect(),
        whole_echo: spectrum.whole_echo().into_iter().map(u8::from).collect(),
        reference: spectrum
            .reference()
            .into_iter()
            .map(|r| r.map_or(Value::Null, number_value))
            .collect(),
        history: spectrum.history().to_vec(),
        xax_array: spectrum.axes().iter().map(|a| number_array(&a.xax)).collect(),
    };
    Ok(serde_json::to_string(&container)?)
}

pub fn write_json(spectrum: &SpectrumData, path: &Path) -> Result<(), SaveError> {
    fs::write(path, to_json(spectrum)?)?;
    log::info!("JSON container written to {}", path.display());
    Ok(())
}

// ────────────────────────────────────────────────────────────────
//  Reader
// ────────────────────────────────────────────────────────────────

fn malformed(msg: impl Into<String>) -> LoadError {
    LoadError::MalformedContainer(msg.into())
}

/// Quote bare `NaN`, `Infinity` and `-Infinity` tokens outside strings.
fn sanitize_non_finite(text: &str) -> Cow<'_, str> {
    if !text.contains("NaN") && !text.contains("Infinity") {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut rest = text;
    while let Some(ch) = rest.chars().next() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            rest = &rest[ch.len_utf8()..];
            continue;
        }
        let token = ["-Infinity", "Infinity", "NaN"]
            .into_iter()
            .find(|t| rest.starts_with(t));
        if let Some(t) = token {
            out.push('"');
            out.push_str(t);
            out.push('"');
            rest = &rest[t.len()..];
            continue;
        }
        if ch == '"' {
            in_string = true;
        }
        out.push(ch);
        rest = &rest[ch.len_utf8()..];
    }
    Cow::Owned(out)
}

fn field<'a>(obj: &'a Map<String, Value>, key: &str) -> Result<&'a Value, LoadError> {
    obj.get(key)
        .ok_or_else(|| malformed(format!("missing required key '{}'", key)))
}

fn number_or_nan(v: &Value, key: &str) -> Result<f64, LoadError> {
    match v {
        Value::Null => Ok(f64::NAN),
        Value::String(t) if t == NAN_TOKEN => Ok(f64::NAN),
        Value::String(t) if t == INF_TOKEN => Ok(f64::INFINITY),
        Value::String(t) if t == NEG_INF_TOKEN => Ok(f64::NEG_INFINITY),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| malformed(format!("'{}' holds a non-float number", key))),
        _ => Err(malformed(format!("'{}' holds a non-numeric entry", key))),
    }
}

fn numbers(v: &Value, key: &str) -> Result<Vec<f64>, LoadError> {
    v.as_array()
        .ok_or_else(|| malformed(format!("'{}' is not an array", key)))?
        .iter()
        .map(|x| number_or_nan(x, key))
        .collect()
}

fn flags(v: &Value, key: &str) -> Result<Vec<bool>, LoadError> {
    v.as_array()
        .ok_or_else(|| malformed(format!("'{}' is not an array", key)))?
        .iter()
        .map(|x| match x {
            Value::Bool(b) => Ok(*b),
            Value::Number(n) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
            _ => Err(malformed(format!("'{}' holds a non-flag entry", key))),
        })
        .collect()
}

/// Flatten a nested numeric array, recording its (rectangular) shape.
fn flatten(v: &Value, key: &str) -> Result<(Vec<usize>, Vec<f64>), LoadError> {
    fn walk(
        v: &Value,
        depth: usize,
        shape: &mut Vec<usize>,
        out: &mut Vec<f64>,
        key: &str,
    ) -> Result<(), LoadError> {
        match v {
            Value::Array(items) => {
                if depth == shape.len() {
                    shape.push(items.len());
                } else if shape[depth] != items.len() {
                    return Err(malformed(format!("'{}' is not rectangular", key)));
                }
                items
                    .iter()
                    .try_for_each(|item| walk(item, depth + 1, shape, out, key))
            }
            other => {
                if depth != shape.len() {
                    return Err(malformed(format!("'{}' is not rectangular", key)));
                }
                out.push(number_or_nan(other, key)?);
                Ok(())
            }
        }
    }
    let mut shape = Vec::new();
    let mut out = Vec::new();
    walk(v, 0, &mut shape, &mut out, key)?;
    Ok((shape, out))
}

/// Parse an interchange document into a dataset (history included, no
/// reload source).
pub fn from_json(text: &str) -> Result<SpectrumData, LoadError> {
    let root: Value = serde_json::from_str(&sanitize_non_finite(text))
        .map_err(|e| malformed(format!("invalid JSON: {}", e)))?;
    let obj = root
        .as_object()
        .ok_or_else(|| malformed("top level is not an object"))?;

    let (shape, re) = flatten(field(obj, "dataReal")?, "dataReal")?;
    let (imag_shape, im) = flatten(field(obj, "dataImag")?, "dataImag")?;
    if shape != imag_shape {
        return Err(malformed(format!(
            "dataReal shape {:?} differs from dataImag shape {:?}",
            shape, imag_shape
        )));
    }
    let freq = numbers(field(obj, "freq")?, "freq")?;
    let sw = numbers(field(obj, "sw")?, "sw")?;
    let spec = flags(field(obj, "spec")?, "spec")?;
    let whole_echo = flags(field(obj, "wholeEcho")?, "wholeEcho")?;
    let reference: Vec<Option<f64>> = field(obj, "ref")?
        .as_array()
        .ok_or_else(|| malformed("'ref' is not an array"))?
        .iter()
        .map(|r| match r {
            Value::Null => Ok(None),
            other => number_or_nan(other, "ref").map(|v| Some(v).filter(|v| !v.is_nan())),
        })
        .collect::<Result<_, _>>()?;
    let xax: Vec<Vec<f64>> = field(obj, "xaxArray")?
        .as_array()
        .ok_or_else(|| malformed("'xaxArray' is not an array"))?
        .iter()
        .map(|row| numbers(row, "xaxArray"))
        .collect::<Result<_, _>>()?;
    let history: Vec<String> = match obj.get("history") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(lines)) => lines
            .iter()
            .map(|l| {
                l.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| malformed("'history' holds a non-string entry"))
            })
            .collect::<Result<_, _>>()?,
        Some(_) => return Err(malformed("'history' is not an array")),
    };

    let ndim = shape.len();
    for (key, len) in [
        ("freq", freq.len()),
        ("sw", sw.len()),
        ("spec", spec.len()),
        ("wholeEcho", whole_echo.len()),
        ("ref", reference.len()),
        ("xaxArray", xax.len()),
    ] {
        if len != ndim {
            return Err(malformed(format!(
                "'{}' has {} entries for {} dimensions",
                key, len, ndim
            )));
        }
    }

    let samples: Vec<Complex64> = re
        .into_iter()
        .zip(im)
        .map(|(r, i)| Complex64::new(r, i))
        .collect();
    let data = ArrayD::from_shape_vec(IxDyn(&shape), samples)
        .map_err(|e| malformed(e.to_string()))?;
    let axes = (0..ndim)
        .map(|i| AxisParams {
            freq: freq[i],
            sw: sw[i],
            spec: spec[i],
            whole_echo: whole_echo[i],
            reference: reference[i],
            xax: xax[i].clone(),
        })
        .collect();
    let mut spectrum = SpectrumData::new(data, axes)?;
    spectrum.set_history(history);
    Ok(spectrum)
}

/// Read an interchange container from disk.
pub fn read_json(path: &Path, _warnings: &mut Vec<String>) -> Result<SpectrumData, LoadError> {
    from_json(&read_required_text(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_2d() -> SpectrumData {
        let values: Vec<Complex64> = (0..6)
            .map(|k| Complex64::new(k as f64 * 0.1, -(k as f64) / 3.0))
            .collect();
        let data = ArrayD::from_shape_vec(IxDyn(&[2, 3]), values).unwrap();
        let mut direct = AxisParams::new(400.13e6, 12345.678, true);
        direct.reference = Some(400.1e6);
        direct.whole_echo = true;
        let mut s = SpectrumData::new(data, vec![AxisParams::new(100.0e6, 5000.0, false), direct])
            .unwrap();
        s.set_history(vec!["Varian data loaded from /tmp/x".into(), "Fourier transform".into()]);
        s
    }

    #[test]
    fn test_round_trip_is_exact() {
        let source = sample_2d();
        let text = to_json(&source).unwrap();
        let back = from_json(&text).unwrap();
        assert_eq!(back, source);
        for (a, b) in back.data().iter().zip(source.data().iter()) {
            assert_eq!(a.re.to_bits(), b.re.to_bits());
            assert_eq!(a.im.to_bits(), b.im.to_bits());
        }
    }

    #[test]
    fn test_written_layout() {
        let text = to_json(&sample_2d()).unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["spec"], serde_json::json!([0, 1]));
        assert_eq!(v["ref"][0], Value::Null);
        assert_eq!(v["dataReal"].as_array().unwrap().len(), 2);
        assert_eq!(v["dataReal"][1].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_missing_key_is_named() {
        let text = r#"{"dataReal":[1],"dataImag":[0],"freq":[1],"sw":[1],"spec":[0],"wholeEcho":[0],"ref":[null]}"#;
        match from_json(text) {
            Err(LoadError::MalformedContainer(msg)) => assert!(msg.contains("xaxArray")),
            other => panic!("unexpected {:?}", other.map(|s| s.shape().to_vec())),
        }
    }

    #[test]
    fn test_nan_reference_and_bool_flags() {
        let text = r#"{"dataReal":[1,2],"dataImag":[0,0],"freq":[1e8],"sw":[10],
            "spec":[true],"wholeEcho":[false],"ref":[NaN],"xaxArray":[[0,0.1]]}"#;
        let s = from_json(text).unwrap();
        assert_eq!(s.reference(), vec![None]);
        assert_eq!(s.spec(), vec![true]);
        assert!(s.history().is_empty());
    }

    #[test]
    fn test_sanitizer_leaves_strings_alone() {
        let text = r#"{"history":["NaN in \"quoted\" text"],"x":[NaN,-Infinity]}"#;
        let clean = sanitize_non_finite(text);
        assert_eq!(
            clean,
            r#"{"history":["NaN in \"quoted\" text"],"x":["NaN","-Infinity"]}"#
        );
    }

    #[test]
    fn test_non_finite_values_survive() {
        let values = vec![
            Complex64::new(f64::INFINITY, f64::NAN),
            Complex64::new(f64::NEG_INFINITY, 1.5),
        ];
        let data = ArrayD::from_shape_vec(IxDyn(&[2]), values).unwrap();
        let mut axis = AxisParams::new(f64::INFINITY, 1000.0, false);
        axis.reference = Some(f64::NEG_INFINITY);
        axis.xax = vec![f64::NAN, 0.5];
        let source = SpectrumData::new(data, vec![axis]).unwrap();

        let text = to_json(&source).unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["dataReal"], serde_json::json!(["Infinity", "-Infinity"]));
        assert_eq!(v["ref"], serde_json::json!(["-Infinity"]));

        let back = from_json(&text).unwrap();
        let samples: Vec<Complex64> = back.data().iter().copied().collect();
        assert_eq!(samples[0].re, f64::INFINITY);
        assert!(samples[0].im.is_nan());
        assert_eq!(samples[1].re, f64::NEG_INFINITY);
        assert_eq!(samples[1].im, 1.5);
        assert_eq!(back.freq(), vec![f64::INFINITY]);
        assert_eq!(back.reference(), vec![Some(f64::NEG_INFINITY)]);
        assert!(back.axes()[0].xax[0].is_nan());
    }

    #[test]
    fn test_bare_infinity_keeps_its_sign() {
        let text = r#"{"dataReal":[Infinity,-Infinity],"dataImag":[NaN,0],"freq":[1e8],"sw":[10],
            "spec":[0],"wholeEcho":[0],"ref":[null],"xaxArray":[[0,0.1]]}"#;
        let s = from_json(text).unwrap();
        let samples: Vec<Complex64> = s.data().iter().copied().collect();
        assert_eq!(samples[0].re, f64::INFINITY);
        assert_eq!(samples[1].re, f64::NEG_INFINITY);
        assert!(samples[0].im.is_nan());
        assert_eq!(s.reference(), vec![None]);
    }

    #[test]
    fn test_ragged_data_rejected() {
        let text = r#"{"dataReal":[[1,2],[3]],"dataImag":[[0,0],[0]],"freq":[1,1],"sw":[1,1],
            "spec":[0,0],"wholeEcho":[0,0],"ref":[null,null],"xaxArray":[[0,1],[0,1]]}"#;
        assert!(matches!(from_json(text), Err(LoadError::MalformedContainer(_))));
    }
}
