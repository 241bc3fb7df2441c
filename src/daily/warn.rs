fn sanitize_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_sep = false;
    for ch in value.chars() {
        if ch.is_ascii_whitespace() {
            if !out.is_empty() && !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else if ch.is_ascii_graphic() {
            out.push(ch);
            prev_sep = false;
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "na".to_string()
    } else {
        trimmed.to_string()
    }
}

/// One degraded-but-continuing condition, printed as a single
/// `EPROFILE_WARN key=value ...` line on stderr.
#[derive(Debug, Clone, Copy)]
pub struct WarnEvent<'a> {
    pub code: &'a str,
    pub stage: &'a str,
    pub action: &'a str,
    pub target: &'a str,
    pub source: &'a str,
    pub retry: &'a str,
    pub reason: &'a str,
    pub err: &'a str,
}

fn render(event: &WarnEvent<'_>) -> String {
    format!(
        "EPROFILE_WARN code={} stage={} action={} target={} source={} retry={} reason={} err={}",
        sanitize_value(event.code),
        sanitize_value(event.stage),
        sanitize_value(event.action),
        sanitize_value(event.target),
        sanitize_value(event.source),
        sanitize_value(event.retry),
        sanitize_value(event.reason),
        sanitize_value(event.err),
    )
}

pub fn emit(event: WarnEvent<'_>) {
    eprintln!("{}", render(&event));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_value_rewrites_whitespace() {
        assert_eq!(sanitize_value("a b\tc"), "a_b_c");
    }

    #[test]
    fn sanitize_value_falls_back_for_empty() {
        assert_eq!(sanitize_value("   "), "na");
    }

    #[test]
    fn render_keeps_one_line_per_event() {
        let line = render(&WarnEvent {
            code: "E001_UNMAPPED_METADATA",
            stage: "concat",
            action: "resolve-archive-path",
            target: "L2_0-20000-0-06610_A20210601.nc",
            source: "",
            retry: "skip-group",
            reason: "unmapped operator",
            err: "unmapped operator `Nowhere`\n(context)",
        });
        assert!(!line.contains('\n'));
        assert!(line.starts_with("EPROFILE_WARN code=E001_UNMAPPED_METADATA stage=concat"));
        assert!(line.contains(" source=na "));
        assert!(line.contains("reason=unmapped_operator"));
    }
}
