//! Low-quality content filter for relevance search

use once_cell::sync::Lazy;
use regex::Regex;

const MIN_CONTENT_CHARS: usize = 15;
const MIN_ALNUM_RATIO: f32 = 0.2;

static NOISE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^console\.log\(",
        r"^print\(",
        r"^\s*(?://|#)?\s*(?:TODO|FIXME|HACK|XXX)\b",
        r"^import\s+\w+$",
        r"^(?:var|let|const)\s+\w+\s*=\s*\S+;?$",
        r"^(?:temp|tmp)\w*\s*=",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// True for content too short, too symbol-heavy, or matching a known noise pattern.
pub fn is_low_quality(content: &str) -> bool {
    let trimmed = content.trim();
    let total = trimmed.chars().count();
    if total < MIN_CONTENT_CHARS {
        return true;
    }

    let alnum = trimmed.chars().filter(|c| c.is_alphanumeric()).count();
    if (alnum as f32) / (total as f32) < MIN_ALNUM_RATIO {
        return true;
    }

    NOISE_PATTERNS.iter().any(|re| re.is_match(trimmed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_and_symbolic_content() {
        assert!(is_low_quality("x = 1"));
        assert!(is_low_quality("{{}}[[]]();;,,..--=="));
        assert!(!is_low_quality("def parse_config(path): return load(path)"));
    }

    #[test]
    fn test_noise_patterns() {
        assert!(is_low_quality("console.log(\"value is\", value)"));
        assert!(is_low_quality("print(\"debugging output here\")"));
        assert!(is_low_quality("# TODO: handle the error case later"));
        assert!(is_low_quality("import somethinglong"));
        assert!(is_low_quality("const answerValue = 42;"));
        assert!(is_low_quality("tmp_buffer = read_everything()"));
    }

    #[test]
    fn test_real_code_passes() {
        assert!(!is_low_quality("class Parser:\n    def parse(self, text): ..."));
        assert!(!is_low_quality("import os\nimport sys\n\ndef main():\n    run()"));
    }
}
