static CLI_MISSING_PATTERNS: &[&str] = &[
    "not installed",
    "command not found",
    "no such file or directory",
    "is not recognized as an internal or external command",
];

pub fn is_cli_missing_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    CLI_MISSING_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}

/// First line of `output` that says the tool itself could not be found.
pub fn find_cli_missing_line(output: &str) -> Option<&str> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && is_cli_missing_line(line))
}

/// Hint attached to spawn failures and failed runs whose stderr shows the
/// tool is absent.
pub fn cli_missing_message(program: &str, line: &str) -> String {
    format!("{} does not appear to be installed ({})", program, line)
}

#[cfg(test)]
mod tests {
    use super::{cli_missing_message, find_cli_missing_line, is_cli_missing_line};

    #[test]
    fn detects_cli_missing_variants() {
        assert!(is_cli_missing_line("bash: legendary: command not found"));
        assert!(is_cli_missing_line("is not recognized as an internal or external command"));
        assert!(!is_cli_missing_line("[cli] INFO: normal stderr line"));
    }

    #[test]
    fn finds_first_missing_line_in_output() {
        let stderr = "\n[cli] INFO: starting\nsh: 1: wine: not found\nbash: wine: command not found\n";
        assert_eq!(find_cli_missing_line(stderr), Some("bash: wine: command not found"));
        assert_eq!(find_cli_missing_line("all good\n"), None);
        assert!(cli_missing_message("wine", "x").starts_with("wine does not appear"));
    }
}
