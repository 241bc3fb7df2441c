use anyhow::Result;

use crate::commands::{CommandReport, concat, promote};

/// `concat` followed by one `promote` pass. A fatal concat error still lets
/// the promotion pass run.
pub fn run() -> Result<CommandReport> {
    let mut report = CommandReport::new("cycle");
    match concat::run() {
        Ok(concat_report) => report.merge(concat_report),
        Err(err) => report.issue(format!("concat aborted: {err:#}")),
    }
    report.merge(promote::run()?);
    Ok(report)
}
