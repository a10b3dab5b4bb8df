use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Only the crate's own sources are policed.
const SOURCE_ROOTS: [&str; 4] = ["gmrf", "cli", "tests", "benches"];

const FORBIDDEN_WORDS: [&str; 14] = [
    "FIXED",
    "CORRECTED",
    "FIX",
    "FIXES",
    "NEW",
    "CHANGED",
    "CHANGES",
    "CHANGE",
    "MODIFIED",
    "MODIFIES",
    "MODIFY",
    "UPDATED",
    "UPDATES",
    "UPDATE",
];

/// A line-level source rule: a regex plus a filter that decides whether a
/// matching line is really a violation.
struct Rule {
    description: &'static str,
    pattern: String,
    accepts: fn(&str) -> bool,
    advice: &'static str,
}

struct RuleCollector<'r> {
    rule: &'r Rule,
    file_path: PathBuf,
    violations: Vec<String>,
}

impl<'r> RuleCollector<'r> {
    fn new(rule: &'r Rule, file_path: &Path) -> Self {
        Self {
            rule,
            file_path: file_path.to_path_buf(),
            violations: Vec::new(),
        }
    }

    fn error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let mut message = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.rule.description,
            self.file_path.display()
        );
        for violation in &self.violations {
            message.push_str(&format!("   {violation}\n"));
        }
        message.push_str(&format!("\n⚠️ {}\n", self.rule.advice));
        Some(message)
    }
}

impl Sink for RuleCollector<'_> {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.rule.accepts)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("//") || trimmed.starts_with("/*")
}

fn is_doc_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("///") || trimmed.starts_with("//!")
}

fn comment_text(line: &str) -> &str {
    let trimmed = line.trim_start();
    trimmed
        .trim_start_matches('/')
        .trim_start_matches('!')
        .trim_start_matches('*')
        .trim()
}

/// An underscore-prefixed binding outside comments and string literals.
fn underscore_binding(line: &str) -> bool {
    if is_comment(line) {
        return false;
    }
    let inside_string = line
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'));
    !inside_string
}

fn always(_: &str) -> bool {
    true
}

fn stars_outside_doc_comment(line: &str) -> bool {
    !is_doc_comment(line)
}

fn all_caps_comment(line: &str) -> bool {
    if !is_comment(line) {
        return false;
    }
    let letters: Vec<char> = comment_text(line)
        .chars()
        .filter(|c| c.is_alphabetic())
        .collect();
    !letters.is_empty() && letters.iter().all(|c| c.is_uppercase())
}

fn rules() -> Vec<Rule> {
    vec![
        Rule {
            description: "underscore-prefixed variables",
            pattern: r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            accepts: underscore_binding,
            advice: "Underscore-prefixed variable names are not allowed. Use the variable or remove it.",
        },
        Rule {
            description: "forbidden comment words",
            pattern: format!(r"(//|/\*).*(?:{})", FORBIDDEN_WORDS.join("|")),
            accepts: always,
            advice: "Comments must describe the code as it is, not its edit history.",
        },
        Rule {
            description: "'**' in regular comments",
            pattern: r"(//|/\*).*\*\*".to_string(),
            accepts: stars_outside_doc_comment,
            advice: "The '**' pattern is only allowed in doc comments.",
        },
        Rule {
            description: "comments written entirely in uppercase",
            pattern: r"(//|/\*).*".to_string(),
            accepts: all_caps_comment,
            advice: "Comments where every letter is uppercase are not allowed.",
        },
        Rule {
            description: "#[allow(dead_code)] attributes",
            pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
            accepts: always,
            advice: "Use the code or remove it; dead code may not be silenced.",
        },
    ]
}

fn rust_sources() -> impl Iterator<Item = PathBuf> {
    SOURCE_ROOTS
        .into_iter()
        .filter(|root| Path::new(root).is_dir())
        .flat_map(|root| WalkDir::new(root).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
}

fn scan(rule: &Rule) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&rule.pattern)?;
    let mut searcher = Searcher::new();
    for path in rust_sources() {
        let mut collector = RuleCollector::new(rule, &path);
        searcher.search_path(&matcher, &path, &mut collector)?;
        if let Some(message) = collector.error_message() {
            return Err(message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    for rule in rules() {
        if let Err(e) = scan(&rule) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
