//! `PlanValidator` over an external VAL-style binary.
//!
//! The emitted domain and problem are written to temp files and handed to
//! the configured validator binary. A non-zero exit is a rejection; its
//! stdout/stderr become the diagnostics.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::ports::plan_validator::{PlanValidator, ValidationReport};

/// Runs the external PDDL validator binary.
pub struct ValBinaryValidator {
    binary: PathBuf,
    timeout: Duration,
}

impl ValBinaryValidator {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    async fn write_temp(content: &str, suffix: &str) -> EngineResult<tempfile_path::TempPath> {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("orra-{}-{suffix}.pddl", uuid::Uuid::new_v4().simple()));
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| EngineError::Validation(format!("cannot write PDDL file: {e}")))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| EngineError::Validation(format!("cannot write PDDL file: {e}")))?;
        file.flush()
            .await
            .map_err(|e| EngineError::Validation(format!("cannot write PDDL file: {e}")))?;
        Ok(tempfile_path::TempPath(path))
    }
}

/// Removes the temp file on drop.
mod tempfile_path {
    use std::path::PathBuf;

    pub struct TempPath(pub PathBuf);

    impl Drop for TempPath {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }
}

#[async_trait]
impl PlanValidator for ValBinaryValidator {
    async fn validate(&self, domain: &str, problem: &str) -> EngineResult<ValidationReport> {
        let domain_file = Self::write_temp(domain, "domain").await?;
        let problem_file = Self::write_temp(problem, "problem").await?;

        let mut command = Command::new(&self.binary);
        command
            .arg(&domain_file.0)
            .arg(&problem_file.0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                EngineError::Validation(format!(
                    "PDDL validator timed out after {:?}",
                    self.timeout
                ))
            })?
            .map_err(|e| EngineError::Validation(format!("PDDL validator failed to run: {e}")))?;

        if output.status.success() {
            return Ok(ValidationReport::valid());
        }
        let mut diagnostics = Vec::new();
        for stream in [output.stdout, output.stderr] {
            let text = String::from_utf8_lossy(&stream);
            diagnostics.extend(
                text.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from),
            );
        }
        Ok(ValidationReport::invalid(diagnostics))
    }
}
