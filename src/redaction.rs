use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

const REDACTED: &str = "[REDACTED]";

/// Flags whose following argument is a credential.
static SECRET_FLAGS: &[&str] = &["--code", "--token", "--sid", "--ex-token", "--password"];

static SECRET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(
            r#"(?i)\b(access[_-]?token|refresh[_-]?token|exchange[_-]?code|authorization[_-]?code|sid|token|secret|password)\s*[:=]\s*["']?([A-Za-z0-9_\-\.]{6,})["']?"#,
        )
        .expect("valid regex"),
        Regex::new(r#"(?i)"(access_token|refresh_token|code)"\s*:\s*"([^"]{6,})""#).expect("valid regex"),
        Regex::new(r"\b([A-Fa-f0-9]{32,})\b").expect("valid regex"),
    ]
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RedactionResult {
    pub content: String,
    pub redaction_count: usize,
}

#[derive(Debug, Default, Clone)]
pub struct Redactor {
    aggressive: bool,
}

impl Redactor {
    pub fn new(aggressive: bool) -> Self {
        Self { aggressive }
    }

    /// Masks credential values in an argument vector before it is logged.
    /// Both `--code VALUE` and `--code=VALUE` forms are covered.
    pub fn redact_args(&self, args: &[String]) -> Vec<String> {
        let mut redacted = Vec::with_capacity(args.len());
        let mut mask_next = false;
        for arg in args {
            if mask_next {
                redacted.push(REDACTED.to_string());
                mask_next = false;
                continue;
            }
            if let Some((flag, _)) = arg.split_once('=') {
                if SECRET_FLAGS.contains(&flag) {
                    redacted.push(format!("{}={}", flag, REDACTED));
                    continue;
                }
            }
            mask_next = SECRET_FLAGS.contains(&arg.as_str());
            redacted.push(arg.clone());
        }
        redacted
    }

    pub fn redact(&self, input: &str) -> RedactionResult {
        if input.is_empty() {
            return RedactionResult {
                content: String::new(),
                redaction_count: 0,
            };
        }

        let mut result = input.to_string();
        let mut redaction_count = 0usize;

        if self.aggressive {
            result = result
                .split_whitespace()
                .map(|token| {
                    if token.len() > 48
                        && token
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
                    {
                        redaction_count += 1;
                        "[REDACTED_LONG_TOKEN]".to_string()
                    } else {
                        token.to_string()
                    }
                })
                .collect::<Vec<_>>()
                .join(" ");
        }

        for pattern in SECRET_PATTERNS.iter() {
            let matches = pattern.find_iter(&result).count();
            if matches == 0 {
                continue;
            }
            redaction_count += matches;
            result = pattern
                .replace_all(&result, |caps: &regex::Captures<'_>| match (caps.get(1), caps.get(2)) {
                    (Some(key), Some(_)) => {
                        format!("{}={}", key.as_str().to_ascii_lowercase(), REDACTED)
                    }
                    _ => REDACTED.to_string(),
                })
                .into_owned();
        }

        RedactionResult {
            content: result,
            redaction_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Redactor;

    fn argv(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn masks_values_after_secret_flags() {
        let redactor = Redactor::default();
        let masked = redactor.redact_args(&argv(&["auth", "--code", "abc123", "--token=xyz", "-y"]));
        assert_eq!(masked, argv(&["auth", "--code", "[REDACTED]", "--token=[REDACTED]", "-y"]));
    }

    #[test]
    fn leaves_plain_argv_alone() {
        let redactor = Redactor::default();
        let args = argv(&["install", "Fortnite", "--platform", "Windows"]);
        assert_eq!(redactor.redact_args(&args), args);
    }

    #[test]
    fn redacts_named_secret_in_output() {
        let redactor = Redactor::new(false);
        let result = redactor.redact("[Core] DEBUG: refresh_token=abcd1234abcd1234");
        assert!(result.content.contains("refresh_token=[REDACTED]"));
        assert!(!result.content.contains("abcd1234abcd1234"));
        assert_eq!(result.redaction_count, 1);
    }

    #[test]
    fn redacts_long_token_when_aggressive() {
        let redactor = Redactor::new(true);
        let result = redactor.redact("prefix AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA suffix");
        assert!(result.content.contains("[REDACTED_LONG_TOKEN]"));
    }
}
