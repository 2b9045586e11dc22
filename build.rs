use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Only the crate's own sources are policed; vendored or reference material
// elsewhere in the checkout is left alone.
const SOURCE_ROOTS: [&str; 4] = ["gam", "src", "tests", "benches"];

const FORBIDDEN_MARKERS: [&str; 14] = [
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

/// The kinds of source-policy violations the build refuses.
#[derive(Clone, Copy)]
enum Rule {
    UnderscorePrefix,
    ForbiddenMarker,
    StarsInComment,
    UppercaseComment,
    AllowDeadCode,
}

impl Rule {
    fn pattern(self) -> &'static str {
        match self {
            Rule::UnderscorePrefix => r"\b(_[a-zA-Z0-9_]+)\b",
            Rule::ForbiddenMarker => {
                r"(//|/\*).*(?:FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE)"
            }
            Rule::StarsInComment => r"(//|/\*).*\*\*",
            Rule::UppercaseComment => r"(//|/\*).*",
            Rule::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        }
    }

    fn description(self) -> &'static str {
        match self {
            Rule::UnderscorePrefix => "underscore-prefixed variables",
            Rule::ForbiddenMarker => "forbidden comment markers",
            Rule::StarsInComment => "'**' patterns in regular comments",
            Rule::UppercaseComment => "comments with all uppercase alphabetic characters",
            Rule::AllowDeadCode => "#[allow(dead_code)] attributes",
        }
    }

    fn advice(self) -> String {
        match self {
            Rule::UnderscorePrefix => {
                "Either use the variable (removing the underscore) or remove it completely."
                    .to_string()
            }
            Rule::ForbiddenMarker => format!(
                "Comments containing {} are not allowed. Remove them rather than commenting them out.",
                FORBIDDEN_MARKERS.join(", ")
            ),
            Rule::StarsInComment => {
                "The '**' pattern is only allowed in doc comments.".to_string()
            }
            Rule::UppercaseComment => "Consider deleting the comment completely.".to_string(),
            Rule::AllowDeadCode => {
                "Either use the code (removing the attribute) or remove it completely.".to_string()
            }
        }
    }

    /// Whether a matched line really violates the rule.
    fn applies_to(self, line: &str) -> bool {
        match self {
            Rule::UnderscorePrefix => !is_comment(line) && !underscore_only_in_strings(line),
            Rule::ForbiddenMarker | Rule::AllowDeadCode => true,
            Rule::StarsInComment => !is_doc_comment(line),
            Rule::UppercaseComment => comment_text(line).is_some_and(|text| {
                let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
                !letters.is_empty() && letters.iter().all(|c| c.is_uppercase())
            }),
        }
    }
}

// Collects every violating line of one file for a single rule.
struct ViolationCollector {
    rule: Rule,
    violations: Vec<String>,
    file_path: PathBuf,
}

impl ViolationCollector {
    fn new(rule: Rule, file_path: &Path) -> Self {
        Self {
            rule,
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
        }
    }

    fn check_and_get_error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let file_name = self.file_path.to_str().unwrap_or("?");
        let mut error_msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.rule.description(),
            file_name
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!("\n⚠️ {}\n", self.rule.advice()));
        Some(error_msg)
    }
}

impl Sink for ViolationCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();

        if self.rule.applies_to(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("//") || trimmed.starts_with("/*") || trimmed.starts_with('*')
}

fn is_doc_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("///") || trimmed.starts_with("//!")
}

fn underscore_only_in_strings(line: &str) -> bool {
    line.contains('"')
        && line
            .split('"')
            .enumerate()
            .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("///").or_else(|| trimmed.strip_prefix("//!")) {
        return Some(rest.trim());
    }
    if let Some(rest) = trimmed.strip_prefix("//") {
        return Some(rest.trim());
    }
    let start = line.find("/*")?;
    let body = &line[start + 2..];
    Some(match body.find("*/") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    })
}

fn source_files() -> Vec<PathBuf> {
    SOURCE_ROOTS
        .iter()
        .flat_map(|root| WalkDir::new(root).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

fn enforce(rule: Rule, files: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(rule.pattern())?;
    let mut searcher = Searcher::new();

    for path in files {
        let mut collector = ViolationCollector::new(rule, path);
        searcher.search_path(&matcher, path, &mut collector)?;
        if let Some(error_message) = collector.check_and_get_error_message() {
            return Err(error_message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    let files = source_files();
    let rules = [
        Rule::UnderscorePrefix,
        Rule::ForbiddenMarker,
        Rule::StarsInComment,
        Rule::UppercaseComment,
        Rule::AllowDeadCode,
    ];
    for rule in rules {
        if let Err(e) = enforce(rule, &files) {
            // eprintln keeps the report visible in cargo's output.
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
