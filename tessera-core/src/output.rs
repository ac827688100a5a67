//! Writing rendered outputs to disk.

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::{error::ConversionError, pipeline::ConversionResult};

pub fn sanitize_doc_name(doc_name: &str) -> String {
    let name: String = doc_name
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                Some(c)
            } else if c.is_whitespace() {
                None
            } else {
                Some('-')
            }
        })
        .collect();
    if name.is_empty() {
        "document".to_owned()
    } else {
        name
    }
}

/// `<output_dir>/<name>-results`.
pub fn results_dir(output_dir: &Path, doc_name: &str) -> PathBuf {
    output_dir.join(format!("{}-results", sanitize_doc_name(doc_name)))
}

/// Writes every rendered output of `result` as
/// `<output_dir>/<name>-results/<name>.<ext>` and returns the written paths.
///
/// Each file is written to a temporary file in the results directory and
/// renamed into place, so a reader never sees a partial artifact.
pub fn write_outputs(
    result: &ConversionResult,
    output_dir: &Path,
) -> Result<Vec<PathBuf>, ConversionError> {
    let doc_name = sanitize_doc_name(&result.document.metadata.doc_name);
    let dir = results_dir(output_dir, &doc_name);
    let io_err = |path: &Path| {
        let path = path.to_owned();
        move |source: std::io::Error| ConversionError::Output { path, source }
    };
    std::fs::create_dir_all(&dir).map_err(io_err(&dir))?;

    let mut written = Vec::with_capacity(result.outputs.len());
    for output in &result.outputs {
        let target = dir.join(format!("{doc_name}.{}", output.format.extension()));
        let mut tmp = NamedTempFile::new_in(&dir).map_err(io_err(&dir))?;
        tmp.write_all(output.content.as_bytes())
            .and_then(|()| tmp.flush())
            .map_err(io_err(&target))?;
        tmp.persist(&target)
            .map_err(|e| io_err(&target)(e.error))?;
        debug!(path = %target.display(), "wrote {}", output.format);
        written.push(target);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_names_are_filesystem_safe() {
        assert_eq!(sanitize_doc_name("My Report (final).pdf"), "MyReport-final--pdf");
        assert_eq!(sanitize_doc_name("   "), "document");
        assert_eq!(
            results_dir(Path::new("/out"), "a b"),
            PathBuf::from("/out/ab-results")
        );
    }
}
