//! File I/O primitives with consistent error handling.

use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

/// Read file contents, mapping failures to `internal.io_error` with the
/// operation as context.
pub fn read_file(path: &Path, operation: &str) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| Error::internal_io(e.to_string(), Some(operation.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn read_file_succeeds_for_existing_file() {
        let mut temp = NamedTempFile::new().unwrap();
        writeln!(temp, r#"{{ "hosts": {{}} }}"#).unwrap();

        let content = read_file(temp.path(), "read recipe").unwrap();
        assert!(content.contains("hosts"));
    }

    #[test]
    fn read_file_reports_operation_on_failure() {
        let err = read_file(Path::new("/nonexistent/rollout.json"), "read recipe").unwrap_err();
        assert_eq!(err.code.as_str(), "internal.io_error");
        assert_eq!(err.details["context"], "read recipe");
    }
}
