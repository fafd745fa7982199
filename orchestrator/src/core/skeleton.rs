//! Structural skeletons: declarations and their docs, bodies elided.
//!
//! Extraction is line-based and tolerant. Unknown file kinds yield `None`
//! so callers fall back to truncation.

use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Rust,
    Python,
    Markdown,
}

impl SourceKind {
    pub fn from_path(path: &str) -> Option<Self> {
        match Path::new(path).extension().and_then(|ext| ext.to_str()) {
            Some("rs") => Some(SourceKind::Rust),
            Some("py" | "pyi") => Some(SourceKind::Python),
            Some("md" | "markdown") => Some(SourceKind::Markdown),
            _ => None,
        }
    }
}

/// Skeleton of `content`, or `None` when the kind is unsupported or nothing
/// structural was found.
pub fn extract(path: &str, content: &str) -> Option<String> {
    let skeleton = match SourceKind::from_path(path)? {
        SourceKind::Rust => rust_skeleton(content),
        SourceKind::Python => python_skeleton(content),
        SourceKind::Markdown => markdown_skeleton(content),
    };
    if skeleton.trim().is_empty() {
        None
    } else {
        Some(skeleton)
    }
}

/// Net `{`/`}` count, ignoring string literals, char literals, and line comments.
fn brace_delta(line: &str) -> i32 {
    let mut delta = 0;
    let mut chars = line.chars().peekable();
    let mut in_str = false;
    while let Some(c) = chars.next() {
        if in_str {
            match c {
                '\\' => {
                    chars.next();
                }
                '"' => in_str = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_str = true,
            '/' if chars.peek() == Some(&'/') => break,
            '\'' => {
                // Skip 'x' and '\x' char literals; lifetimes fall through.
                let mut ahead = chars.clone();
                match (ahead.next(), ahead.next(), ahead.next()) {
                    (Some('\\'), Some(_), Some('\'')) => {
                        chars.next();
                        chars.next();
                        chars.next();
                    }
                    (Some(_), Some('\''), _) => {
                        chars.next();
                        chars.next();
                    }
                    _ => {}
                }
            }
            '{' => delta += 1,
            '}' => delta -= 1,
            _ => {}
        }
    }
    delta
}

fn is_rust_fn(trimmed: &str) -> bool {
    let mut rest = trimmed;
    for prefix in ["pub(crate) ", "pub(super) ", "pub ", "const ", "async ", "unsafe ", "extern \"C\" "] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
        }
    }
    rest.starts_with("fn ")
}

fn rust_skeleton(content: &str) -> String {
    let mut out = Vec::new();
    // Depth inside a function body being elided, and the depth it started at.
    let mut body_depth: i32 = 0;
    let mut in_signature = false;

    for line in content.lines() {
        let trimmed = line.trim_start();
        if body_depth > 0 {
            body_depth += brace_delta(line);
            continue;
        }

        if in_signature || is_rust_fn(trimmed) {
            let delta = brace_delta(line);
            match line.find('{') {
                Some(open) if delta > 0 => {
                    out.push(format!("{} {{ ... }}", line[..open].trim_end()));
                    body_depth = delta;
                    in_signature = false;
                }
                _ => {
                    out.push(line.to_string());
                    // A signature spans lines until its body opens or it ends with `;`.
                    in_signature = !(trimmed.ends_with(';') || trimmed.ends_with('}'));
                }
            }
            continue;
        }

        if trimmed.is_empty()
            || trimmed.starts_with("//")
            || trimmed.starts_with("#[")
            || trimmed.starts_with("#![")
        {
            out.push(line.to_string());
            continue;
        }

        // Declarations, fields, and container braces stay verbatim.
        out.push(line.to_string());
    }
    collapse_blank_runs(out)
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn python_skeleton(content: &str) -> String {
    let mut out = Vec::new();
    let mut skip_indent: Option<usize> = None;
    let mut in_signature = false;
    let mut expect_docstring = false;
    let mut in_docstring: Option<&str> = None;

    for line in content.lines() {
        let trimmed = line.trim_start();
        let indent = indent_of(line);

        if let Some(quote) = in_docstring {
            out.push(line.to_string());
            if trimmed.contains(quote) {
                in_docstring = None;
            }
            continue;
        }

        if in_signature {
            out.push(line.to_string());
            if trimmed.trim_end().ends_with(':') {
                in_signature = false;
                expect_docstring = true;
            }
            continue;
        }

        if expect_docstring && !trimmed.is_empty() {
            expect_docstring = false;
            if let Some(quote) = ["\"\"\"", "'''"].into_iter().find(|q| trimmed.starts_with(q)) {
                out.push(line.to_string());
                let rest = &trimmed[quote.len()..];
                if !rest.contains(quote) {
                    in_docstring = Some(quote);
                }
                continue;
            }
        }

        if let Some(body) = skip_indent {
            if trimmed.is_empty() || indent > body {
                continue;
            }
            out.push(format!("{}    ...", " ".repeat(body)));
            skip_indent = None;
        }

        let is_def = trimmed.starts_with("def ") || trimmed.starts_with("async def ");
        let is_class = trimmed.starts_with("class ");
        if is_def || is_class {
            out.push(line.to_string());
            if is_def {
                skip_indent = Some(indent);
            }
            if trimmed.trim_end().ends_with(':') {
                expect_docstring = true;
            } else {
                in_signature = true;
            }
            continue;
        }

        if trimmed.starts_with('@') || trimmed.starts_with('#') || indent == 0 {
            out.push(line.to_string());
        }
    }
    if let Some(body) = skip_indent {
        out.push(format!("{}    ...", " ".repeat(body)));
    }
    collapse_blank_runs(out)
}

fn markdown_skeleton(content: &str) -> String {
    let mut out = Vec::new();
    let mut in_fence = false;
    for line in content.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if !in_fence && line.starts_with('#') {
            out.push(line.to_string());
        }
    }
    out.join("\n")
}

fn collapse_blank_runs(lines: Vec<String>) -> String {
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    for line in lines {
        if line.trim().is_empty() && out.last().is_some_and(|prev| prev.trim().is_empty()) {
            continue;
        }
        out.push(line);
    }
    out.join("\n")
}
