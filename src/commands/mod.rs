pub mod concat;
pub mod cycle;
pub mod promote;
pub mod status;

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }

    pub fn merge(&mut self, mut other: CommandReport) {
        self.ok &= other.ok;
        self.details.append(&mut other.details);
        self.issues.append(&mut other.issues);
    }
}

/// Stable warn/issue code for an error, falling back to `generic` when the
/// chain holds no typed engine error.
pub(crate) fn error_code(err: &anyhow::Error, generic: &'static str) -> &'static str {
    err.downcast_ref::<crate::error::EprofileError>()
        .map(|e| e.code().as_str())
        .unwrap_or(generic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EprofileError;

    #[test]
    fn merge_keeps_issues_and_ok_flag() {
        let mut first = CommandReport::new("concat");
        first.detail("groups=1");
        let mut second = CommandReport::new("promote");
        second.issue("transfer failed");

        first.merge(second);
        assert!(!first.ok);
        assert_eq!(first.details, vec!["groups=1".to_string()]);
        assert_eq!(first.issues, vec!["transfer failed".to_string()]);
    }

    #[test]
    fn error_code_reads_typed_errors() {
        let typed = anyhow::Error::new(EprofileError::merge("x", "bad shape"));
        assert_eq!(error_code(&typed, "GENERIC"), "E002_MERGE_FAILURE");
        let plain = anyhow::anyhow!("disk full");
        assert_eq!(error_code(&plain, "GENERIC"), "GENERIC");
    }
}
