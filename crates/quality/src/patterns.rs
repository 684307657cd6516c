//! Risky-construct patterns for static scans.

use evoloop_core::RiskLevel;
use regex::Regex;

/// Raw rule table: (name, level, pattern).
const RULES: &[(&str, RiskLevel, &str)] = &[
    // Critical: destructive or system-wide effects
    ("recursive delete of root", RiskLevel::Critical, r#"\brm\s+-[a-zA-Z]*[rR][a-zA-Z]*\s+/(?:[\s'"*;)]|$)"#),
    ("fork bomb", RiskLevel::Critical, r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:"),
    ("filesystem format", RiskLevel::Critical, r"\bmkfs(\.\w+)?\b"),
    ("raw device write", RiskLevel::Critical, r"\bdd\s+[^\n]*of=/dev/"),
    ("credential file access", RiskLevel::Critical, r"/etc/(passwd|shadow|sudoers)\b"),
    ("host power control", RiskLevel::Critical, r"\b(shutdown|reboot|halt)\b\s"),
    // High: arbitrary execution or network reach
    ("dynamic eval", RiskLevel::High, r"\beval\s*\("),
    ("dynamic exec", RiskLevel::High, r"\bexec\s*\("),
    ("subprocess spawn", RiskLevel::High, r"\b(subprocess\.\w+|os\.system|os\.popen|os\.exec\w*)\s*\("),
    ("dynamic import", RiskLevel::High, r"\b__import__\s*\("),
    ("raw socket", RiskLevel::High, r"\bsocket\.socket\s*\("),
    ("network download", RiskLevel::High, r"\b(curl|wget)\s+\S"),
    ("unsafe deserialization", RiskLevel::High, r"\b(pickle|marshal)\.loads?\s*\("),
    // Medium: side effects worth a second look
    ("file write", RiskLevel::Medium, r#"\bopen\s*\([^)]*,\s*['"][wax]"#),
    ("environment access", RiskLevel::Medium, r"\bos\.environ\b"),
    ("foreign function interface", RiskLevel::Medium, r"\bctypes\b"),
    ("reflective mutation", RiskLevel::Medium, r"\b(setattr|delattr)\s*\(|\bglobals\s*\(\s*\)"),
];

/// A rule that matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleHit {
    /// Rule name
    pub rule: &'static str,
    /// Risk tier of the rule
    pub level: RiskLevel,
    /// 1-based line of the first match
    pub line: usize,
}

/// Compiled rule set.
#[derive(Debug, Clone)]
pub struct RiskPatterns {
    rules: Vec<(&'static str, RiskLevel, Regex)>,
}

impl RiskPatterns {
    /// Compile the built-in rule table.
    pub fn builtin() -> Result<Self, regex::Error> {
        let rules = RULES
            .iter()
            .map(|(name, level, pattern)| Ok((*name, *level, Regex::new(pattern)?)))
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { rules })
    }

    /// Every rule matching `code`, most severe first.
    pub fn scan(&self, code: &str) -> Vec<RuleHit> {
        let mut hits: Vec<RuleHit> = self
            .rules
            .iter()
            .filter_map(|(rule, level, re)| {
                let m = re.find(code)?;
                let line = code[..m.start()].matches('\n').count() + 1;
                Some(RuleHit {
                    rule,
                    level: *level,
                    line,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.level.cmp(&a.level).then(a.line.cmp(&b.line)));
        hits
    }

    /// Highest tier matched, if any.
    pub fn worst(&self, code: &str) -> Option<RiskLevel> {
        self.scan(code).first().map(|h| h.level)
    }
}
