use once_cell::sync::Lazy;
use regex::Regex;

static ANSI_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]").expect("valid ansi escape regex"));

/// Lines backends print on stderr that never describe a failure.
static NOISE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)^loaded cached credentials\.?$",
        r"(?i)^data collection is (enabled|disabled)",
        r"(?i)usage statistics",
        r"(?i)^telemetry\b",
        r"^\(node:\d+\)",
        r"(?i)deprecationwarning",
        r"(?i)^\(use `node --trace-",
        r"(?i)^reading prompt from stdin",
        r"(?i)^openai codex v",
        r"^-{4,}$",
        r"(?i)^(workdir|model|provider|approval|sandbox|reasoning effort|reasoning summaries|session id): ",
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).expect("valid stderr noise regex"))
    .collect()
});

static CLI_MISSING_PATTERNS: &[&str] = &[
    "not installed",
    "command not found",
    "no such file or directory",
    "is not recognized as an internal or external command",
];

pub fn strip_ansi(value: &str) -> String {
    ANSI_ESCAPE_RE.replace_all(value, "").replace('\r', "")
}

pub fn is_noise_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || NOISE_PATTERNS.iter().any(|pattern| pattern.is_match(trimmed))
}

/// Keeps only the stderr lines that can explain a failure.
pub fn filter_stderr(raw: &str) -> String {
    strip_ansi(raw)
        .lines()
        .filter(|line| !is_noise_line(line))
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn is_cli_missing_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    CLI_MISSING_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}
