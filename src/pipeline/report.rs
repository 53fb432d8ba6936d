//! Per-clip outcomes and the batch report.
//!
//! Every clip ends as exactly one [`ClipOutcome`]; the batch report lists
//! them in processing order and renders as text or JSON.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

use super::ClipState;

/// Final status of one clip.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipStatus {
    /// All stages ran (skippable stages may have been skipped).
    Done,
    /// Output already existed; nothing was run.
    Skipped,
    Failed,
}

/// Warning-level findings that do not fail a clip.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipIssueCode {
    /// No mask directory was found; masking was disabled for the clip.
    MaskNotFound,
    /// A mask directory exists but some frames have no mask.
    FramesWithoutMask,
    /// Registered frames whose image file was missing during undistortion.
    FramesSkipped,
    /// Camera positions were too close together to rescale the scene.
    DegenerateNormalization,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClipIssue {
    pub code: ClipIssueCode,
    pub message: String,
}

impl ClipIssue {
    pub fn new(code: ClipIssueCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// What happened to one clip.
#[derive(Clone, Debug, Serialize)]
pub struct ClipOutcome {
    pub clip: String,
    pub output_dir: PathBuf,
    pub status: ClipStatus,
    /// `Done` or `Failed` once the clip has run; `Init` when skipped.
    pub state: ClipState,
    /// Stage that was being entered when the clip failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<ClipState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Captured tail of the failing tool's output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<ClipIssue>,
    pub frames: usize,
    pub elapsed_secs: f64,
}

impl ClipOutcome {
    pub fn skipped(clip: impl Into<String>, output_dir: PathBuf) -> Self {
        Self {
            clip: clip.into(),
            output_dir,
            status: ClipStatus::Skipped,
            state: ClipState::Init,
            failed_stage: None,
            error: None,
            diagnostic: None,
            issues: Vec::new(),
            frames: 0,
            elapsed_secs: 0.0,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == ClipStatus::Failed
    }
}

impl fmt::Display for ClipOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            ClipStatus::Done => write!(
                f,
                "[done]    {} ({} frames, {:.1}s)",
                self.clip, self.frames, self.elapsed_secs
            )?,
            ClipStatus::Skipped => write!(f, "[skipped] {} (output exists)", self.clip)?,
            ClipStatus::Failed => {
                let stage = self.failed_stage.unwrap_or(self.state);
                write!(f, "[failed]  {} at {}", self.clip, stage)?;
                if let Some(error) = &self.error {
                    write!(f, ": {error}")?;
                }
            }
        }
        for issue in &self.issues {
            write!(f, "\n          - {}", issue.message)?;
        }
        if let Some(diagnostic) = &self.diagnostic {
            if !diagnostic.is_empty() {
                for line in diagnostic.lines() {
                    write!(f, "\n          | {line}")?;
                }
            }
        }
        Ok(())
    }
}

/// Aggregated result of a batch run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct BatchReport {
    pub input: PathBuf,
    pub output: PathBuf,
    pub clips: Vec<ClipOutcome>,
    /// Clips never started because the run was aborted.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub not_started: Vec<String>,
    /// Why the run stopped early, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl BatchReport {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn push(&mut self, outcome: ClipOutcome) {
        self.clips.push(outcome);
    }

    fn count(&self, status: ClipStatus) -> usize {
        self.clips.iter().filter(|c| c.status == status).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(ClipStatus::Done)
    }

    pub fn skipped(&self) -> usize {
        self.count(ClipStatus::Skipped)
    }

    pub fn failed(&self) -> usize {
        self.count(ClipStatus::Failed)
    }

    /// Clips considered by the run, including ones never started.
    pub fn total(&self) -> usize {
        self.clips.len() + self.not_started.len()
    }

    /// No clip failed and the run was not aborted.
    pub fn is_ok(&self) -> bool {
        self.failed() == 0 && self.aborted.is_none()
    }

    pub fn outcome(&self, clip: &str) -> Option<&ClipOutcome> {
        self.clips.iter().find(|c| c.clip == clip)
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Batch finished: {} done, {} skipped, {} failed ({} clip(s))",
            self.succeeded(),
            self.skipped(),
            self.failed(),
            self.total()
        )?;

        if self.clips.is_empty() && self.not_started.is_empty() {
            writeln!(f, "  no clips found in {}", self.input.display())?;
        }
        for outcome in &self.clips {
            writeln!(f, "  {outcome}")?;
        }
        if !self.not_started.is_empty() {
            writeln!(f)?;
            writeln!(f, "Not started ({}):", self.not_started.len())?;
            for clip in &self.not_started {
                writeln!(f, "  - {clip}")?;
            }
        }
        if let Some(reason) = &self.aborted {
            writeln!(f)?;
            writeln!(f, "Run aborted: {reason}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(clip: &str) -> ClipOutcome {
        ClipOutcome {
            status: ClipStatus::Failed,
            state: ClipState::Failed,
            failed_stage: Some(ClipState::ModelExported),
            error: Some("Malformed sparse model".to_string()),
            diagnostic: Some("line one\nline two".to_string()),
            ..ClipOutcome::skipped(clip, PathBuf::from("out").join(clip))
        }
    }

    #[test]
    fn counts_by_status() {
        let mut report = BatchReport::new("in", "out");
        report.push(ClipOutcome::skipped("a", PathBuf::from("out/a")));
        report.push(failed("b"));
        report.not_started.push("c".to_string());
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.total(), 3);
        assert!(!report.is_ok());
    }

    #[test]
    fn text_report_names_failing_stage_and_diagnostic() {
        let mut report = BatchReport::new("in", "out");
        report.push(failed("shot01"));
        let text = report.to_string();
        assert!(text.contains("[failed]  shot01 at ModelExported"));
        assert!(text.contains("| line two"));
    }

    #[test]
    fn json_report_uses_snake_case_codes() {
        let mut outcome = ClipOutcome::skipped("a", PathBuf::from("out/a"));
        outcome
            .issues
            .push(ClipIssue::new(ClipIssueCode::MaskNotFound, "no masks"));
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["issues"][0]["code"], "mask_not_found");
        assert!(json.get("failed_stage").is_none());
    }

    #[test]
    fn failed_clip_serializes_as_failed_with_its_stage() {
        let json = serde_json::to_value(failed("shot01")).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["state"], "failed");
        assert_eq!(json["failed_stage"], "model_exported");
    }
}
