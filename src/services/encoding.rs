use std::io;
use std::path::Path;

use crate::error::PipelineError;
use crate::models::prediction::Label;
use crate::services::class_names::ClassNameTable;

/// Labels recovered from detector output, plus the lines that had to be dropped.
#[derive(Debug, Default)]
pub struct EncodedLabels {
    pub labels: Vec<Label>,
    pub skipped: Vec<PipelineError>,
}

/// Read a detector output file. A missing file means nothing was detected.
pub async fn read_labels(path: &Path, classes: &ClassNameTable) -> io::Result<EncodedLabels> {
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(encode_labels(&raw, classes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(EncodedLabels::default()),
        Err(e) => Err(e),
    }
}

/// Turn `<class> <cx> <cy> <w> <h> [conf]` lines into labels, in order.
///
/// Lines are decoded one at a time, so a line that is not UTF-8 is skipped
/// like any other corrupt line. Corrupt lines become
/// [`PipelineError::DataCorruption`] entries and never abort the rest.
pub fn encode_labels(raw: &[u8], classes: &ClassNameTable) -> EncodedLabels {
    let mut encoded = EncodedLabels::default();

    for (number, bytes) in raw.split(|b| *b == b'\n').enumerate() {
        let parsed = std::str::from_utf8(bytes)
            .map_err(|_| "line is not valid UTF-8".to_string())
            .map(str::trim);
        let result = match parsed {
            Ok("") => continue,
            Ok(line) => parse_line(line, classes),
            Err(reason) => Err(reason),
        };
        match result {
            Ok(label) => encoded.labels.push(label),
            Err(reason) => encoded.skipped.push(PipelineError::DataCorruption {
                line: number + 1,
                reason,
            }),
        }
    }

    encoded
}

fn parse_number(field: &str, what: &str) -> Result<f64, String> {
    let value: f64 = field
        .parse()
        .map_err(|_| format!("{what} {field:?} is not a number"))?;
    if !value.is_finite() {
        return Err(format!("{what} {field:?} is not finite"));
    }
    Ok(value)
}

fn parse_line(line: &str, classes: &ClassNameTable) -> Result<Label, String> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 5 {
        return Err(format!("expected 5 fields, found {}", fields.len()));
    }

    let index: usize = fields[0]
        .parse()
        .map_err(|_| format!("class index {:?} is not a non-negative integer", fields[0]))?;
    let class_name = classes
        .get(index)
        .ok_or_else(|| format!("class index {index} out of range ({} classes)", classes.len()))?;

    let mut coords = [0.0f64; 4];
    for (slot, field) in coords.iter_mut().zip(&fields[1..5]) {
        *slot = parse_number(field, "coordinate")?;
    }
    let [cx, cy, width, height] = coords;

    let confidence = fields
        .get(5)
        .map(|field| parse_number(field, "confidence"))
        .transpose()?;

    Ok(Label {
        class_name: class_name.to_string(),
        cx,
        cy,
        width,
        height,
        confidence,
    })
}
