use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Only the crate's own sources are policed; data directories and vendored material
// next to the manifest are not.
const SOURCE_DIRS: [&str; 5] = ["score", "hd", "cli", "tests", "benches"];

// Which kind of policy a collector enforces. Decides how matches are filtered and how
// the failure is explained.
#[derive(Clone, Copy)]
enum Policy {
    UnderscorePrefix,
    ForbiddenComment,
    AllowDeadCode,
}

impl Policy {
    fn pattern(self) -> &'static str {
        match self {
            Policy::UnderscorePrefix => r"\b(_[a-zA-Z0-9_]+)\b",
            Policy::ForbiddenComment => {
                r"(//|/\*).*(?:FIXED|CORRECTED|FIX|FIXES|CHANGED|MODIFIED|UPDATED|\*\*)"
            }
            Policy::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        }
    }

    fn explanation(self) -> &'static str {
        match self {
            Policy::UnderscorePrefix => {
                "Underscore-prefixed names are not allowed in this project.\n   Either use the binding (removing the underscore) or remove it completely."
            }
            Policy::ForbiddenComment => {
                "Comments narrating edits ('FIXED', 'CORRECTED', 'UPDATED', ...) and '**' outside doc comments are not allowed.\n   Describe what the code does, not how it got there."
            }
            Policy::AllowDeadCode => {
                "#[allow(dead_code)] attributes are not allowed in this project.\n   Either use the code (removing the attribute) or remove it completely."
            }
        }
    }
}

struct ViolationCollector {
    policy: Policy,
    violations: Vec<String>,
    file_path: PathBuf,
}

impl ViolationCollector {
    fn new(policy: Policy, file_path: &Path) -> Self {
        Self {
            policy,
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
            "\n❌ ERROR: Found {} policy violations in {}:\n",
            self.violations.len(),
            file_name
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!("\n⚠️ {}\n", self.policy.explanation()));
        Some(error_msg)
    }
}

// Lines that only match inside a comment or a string literal are not bindings.
fn is_comment_or_string_match(line_text: &str) -> bool {
    if line_text.trim_start().starts_with("//") {
        return true;
    }
    line_text
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

impl Sink for ViolationCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();

        let skip = match self.policy {
            Policy::UnderscorePrefix => is_comment_or_string_match(line_text),
            // '**' is fine in doc comments, edit narration never is.
            Policy::ForbiddenComment => {
                line_text.trim_start().starts_with("///")
                    && !line_text.contains("FIX")
                    && !line_text.contains("CORRECTED")
                    && !line_text.contains("MODIFIED")
                    && !line_text.contains("UPDATED")
                    && !line_text.contains("CHANGED")
            }
            Policy::AllowDeadCode => false,
        };
        if !skip {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn rust_sources() -> impl Iterator<Item = PathBuf> {
    SOURCE_DIRS
        .iter()
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
}

fn scan(policy: Policy) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(policy.pattern())?;
    let mut searcher = Searcher::new();

    for path in rust_sources() {
        let mut collector = ViolationCollector::new(policy, &path);
        searcher.search_path(&matcher, &path, &mut collector)?;
        if let Some(error_message) = collector.check_and_get_error_message() {
            return Err(error_message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    for policy in [
        Policy::UnderscorePrefix,
        Policy::ForbiddenComment,
        Policy::AllowDeadCode,
    ] {
        if let Err(e) = scan(policy) {
            // `eprintln!` so the message shows up in cargo's output.
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
