use crate::dataset::{validate_example, Dataset, LabeledExample, ValidationPolicy};
use crate::error::{TrainingError, TrainingResult};
use std::io::Write;
use std::path::Path;

/// Writes one JSON object per line. The file is replaced atomically so a crash
/// never leaves a truncated dataset behind.
pub fn write_jsonl_dataset(path: &Path, examples: &[LabeledExample]) -> TrainingResult<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    {
        let mut out = std::io::BufWriter::new(tmp.as_file_mut());
        for ex in examples {
            serde_json::to_writer(&mut out, ex)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| TrainingError::Io(e.error))?;
    Ok(())
}

/// Reads a JSONL dataset, validating every record against `policy`.
///
/// Blank lines are skipped. The first malformed or invalid record aborts the
/// read with an error naming its line.
pub fn read_jsonl_dataset(path: &Path, policy: ValidationPolicy) -> TrainingResult<Dataset> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        TrainingError::Dataset(format!("failed to read dataset {}: {}", path.display(), e))
    })?;
    let mut dataset = Vec::new();

    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let ex: LabeledExample = serde_json::from_str(line).map_err(|e| {
            TrainingError::Dataset(format!("failed to parse jsonl line {}: {}", idx + 1, e))
        })?;
        validate_example(&ex, policy)
            .map_err(|e| TrainingError::Dataset(format!("invalid record on line {}: {}", idx + 1, e)))?;
        dataset.push(ex);
    }

    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read_preserves_order() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("data.jsonl");
        let examples = vec![
            LabeledExample::new("Hello!", 0.1, "local", "greeting").unwrap(),
            LabeledExample::new("Prove Fermat", 0.95, "cloud", "research").unwrap(),
            LabeledExample::new("Hello!", 0.15, "local", "greeting again").unwrap(),
        ];

        write_jsonl_dataset(&path, &examples).unwrap();
        let read = read_jsonl_dataset(&path, ValidationPolicy::Strict).unwrap();
        assert_eq!(read, examples);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 3);
    }

    #[test]
    fn test_read_reports_line_of_malformed_record() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data.jsonl");
        let good = serde_json::to_string(&LabeledExample::new("a", 0.2, "local", "r").unwrap()).unwrap();
        std::fs::write(&path, format!("{good}\n\n{{\"instruction\": 3}}\n")).unwrap();

        let err = read_jsonl_dataset(&path, ValidationPolicy::Strict).unwrap_err();
        assert!(err.to_string().contains("line 3"), "{err}");
    }

    #[test]
    fn test_read_applies_validation_policy() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data.jsonl");
        let ex = LabeledExample::new("a", 1.7, "cloud", "r").unwrap();
        write_jsonl_dataset(&path, &[ex]).unwrap();

        assert!(read_jsonl_dataset(&path, ValidationPolicy::Strict).is_err());
        assert_eq!(read_jsonl_dataset(&path, ValidationPolicy::Lenient).unwrap().len(), 1);
    }

    #[test]
    fn test_empty_file_reads_as_empty_dataset() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("empty.jsonl");
        write_jsonl_dataset(&path, &[]).unwrap();
        assert!(read_jsonl_dataset(&path, ValidationPolicy::Strict).unwrap().is_empty());
    }
}
