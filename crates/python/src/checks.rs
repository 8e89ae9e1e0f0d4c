//! Textual checks run on guest code before it executes.
//!
//! This is a plain pattern list that catches the common mistakes (blocking on
//! the host's event loop, installing packages at run time). It is trivially
//! bypassable and is not a security boundary.

use std::sync::LazyLock;

use regex::Regex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViolationKind {
    /// Starting or blocking on an event loop from inside the running one.
    BlockingLoop,
    /// Installing packages while the program runs.
    PackageInstall,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    pub kind: ViolationKind,
    pub pattern: &'static str,
}

impl Violation {
    #[must_use]
    pub fn message(&self) -> String {
        match self.kind {
            ViolationKind::BlockingLoop => format!(
                "`{}` is not allowed: the program already runs inside an event loop",
                self.pattern
            ),
            ViolationKind::PackageInstall => format!(
                "`{}` is not allowed: packages cannot be installed at run time",
                self.pattern
            ),
        }
    }
}

struct Rule {
    kind: ViolationKind,
    pattern: &'static str,
    regex: Regex,
}

const PATTERNS: [(ViolationKind, &str, &str); 10] = [
    (ViolationKind::BlockingLoop, "asyncio.run(", r"\basyncio\s*\.\s*run\s*\("),
    (ViolationKind::BlockingLoop, ".run_until_complete(", r"\.\s*run_until_complete\s*\("),
    (ViolationKind::BlockingLoop, "run_sync(", r"\brun_sync\s*\("),
    (
        ViolationKind::BlockingLoop,
        "asyncio.get_event_loop().run_forever",
        r"\bget_event_loop\s*\(\s*\)\s*\.\s*run_forever\b",
    ),
    (ViolationKind::PackageInstall, "pip install", r"\bpip3?\s+install\b"),
    (ViolationKind::PackageInstall, "%pip", r"(?m)^\s*%pip\b"),
    (ViolationKind::PackageInstall, "!pip", r"(?m)^\s*!\s*pip3?\b"),
    (ViolationKind::PackageInstall, "micropip.install(", r"\bmicropip\s*\.\s*install\s*\("),
    (ViolationKind::PackageInstall, "pip.main(", r"\bpip\s*\.\s*main\s*\("),
    (ViolationKind::PackageInstall, "import pip", r"(?m)^\s*(import\s+pip\b|from\s+pip\b)"),
];

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    PATTERNS
        .iter()
        .filter_map(|&(kind, pattern, source)| {
            Regex::new(source)
                .inspect_err(|err| tracing::error!(%err, pattern, "invalid check pattern"))
                .ok()
                .map(|regex| Rule {
                    kind,
                    pattern,
                    regex,
                })
        })
        .collect()
});

/// Return the first rule `code` matches.
///
/// # Errors
/// Returns the matched [`Violation`].
pub fn scan(code: &str) -> Result<(), Violation> {
    RULES
        .iter()
        .find(|rule| rule.regex.is_match(code))
        .map_or(Ok(()), |rule| {
            Err(Violation {
                kind: rule.kind,
                pattern: rule.pattern,
            })
        })
}
