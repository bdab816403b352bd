//! Static pre-commit checks on generated source text. A structurally broken
//! file written to the sandbox silently corrupts every later agent turn, so
//! batched writes are gated here before anything touches the file system.

use std::sync::LazyLock;

use regex_lite::Regex;

/// Extensions the checks apply to; anything else passes untouched.
const TEXT_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "mjs", "cjs"];

/// Extensions that may carry component markup and get the extra JSX checks.
const MARKUP_EXTENSIONS: &[&str] = &["tsx", "jsx"];

static CONTRACTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::unwrap_used)]
    let re = Regex::new(r"[A-Za-z]'[A-Za-z]").unwrap();
    re
});

static UNWRAPPED_RETURN_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::unwrap_used)]
    let re = Regex::new(r"return\s*<").unwrap();
    re
});

static HTML_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::unwrap_used)]
    let re = Regex::new(r#"\b(class|for)="#).unwrap();
    re
});

static CLIENT_API_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::unwrap_used)]
    let re =
        Regex::new(r"\b(useState|useEffect|useReducer|useRef|onClick|onChange|onSubmit)\b")
            .unwrap();
    re
});

fn extension(path: &str) -> Option<&str> {
    path.rsplit_once('.').map(|(_, ext)| ext)
}

/// Validates every file in order. The first file with any issue fails the
/// whole batch with an aggregated message naming the file and listing each
/// issue found in it; partial success is not permitted.
pub fn validate_batch<'a, I>(files: I) -> Result<(), String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    for (path, content) in files {
        let issues = validate_file(path, content);
        if !issues.is_empty() {
            let mut msg = format!("{path} failed validation:");
            for issue in &issues {
                msg.push_str("\n- ");
                msg.push_str(issue);
            }
            return Err(msg);
        }
    }
    Ok(())
}

/// All issues found in one file. Checks never short-circuit each other: the
/// model gets the complete list in one round trip.
pub fn validate_file(path: &str, content: &str) -> Vec<String> {
    let Some(ext) = extension(path) else {
        return Vec::new();
    };
    if !TEXT_EXTENSIONS.contains(&ext) {
        return Vec::new();
    }

    let mut issues = Vec::new();

    // Line-level quote checks. An odd backtick count on a line means a
    // template literal opens or closes there; that toggles the in-literal
    // flag instead of failing, and quote heuristics are unreliable on such
    // boundary lines, so they are skipped.
    let mut in_template = false;
    for (idx, line) in content.lines().enumerate() {
        let lineno = idx + 1;

        let backticks = line.matches('`').count();
        if backticks % 2 == 1 {
            in_template = !in_template;
            continue;
        }
        if in_template {
            continue;
        }

        let without_contractions = CONTRACTION_RE.replace_all(line, "");
        if without_contractions.matches('\'').count() % 2 == 1 {
            issues.push(format!("line {lineno}: unbalanced single quotes"));
        }

        // Inline comments legitimately carry stray quotes.
        if !line.contains("//") && line.matches('"').count() % 2 == 1 {
            issues.push(format!("line {lineno}: unbalanced double quotes"));
        }
    }
    if in_template {
        issues.push("unterminated template literal at end of file".to_string());
    }

    if MARKUP_EXTENSIONS.contains(&ext) {
        issues.extend(markup_issues(content));
    }

    for (open, close) in [('{', '}'), ('(', ')'), ('[', ']')] {
        let opens = content.matches(open).count();
        let closes = content.matches(close).count();
        if opens != closes {
            issues.push(format!(
                "unbalanced {open}{close} pairs: {opens} `{open}` vs {closes} `{close}`"
            ));
        }
    }

    issues
}

fn markup_issues(content: &str) -> Vec<String> {
    let mut issues = Vec::new();

    if UNWRAPPED_RETURN_RE.is_match(content) {
        issues.push(
            "JSX return statement is not wrapped in parentheses: use `return ( <...> )`"
                .to_string(),
        );
    }

    if let Some(m) = HTML_ATTR_RE.captures(content) {
        let (attr, jsx) = match &m[1] {
            "class" => ("class", "className"),
            _ => ("for", "htmlFor"),
        };
        issues.push(format!(
            "HTML attribute `{attr}=` is not valid in JSX: use `{jsx}=`"
        ));
    }

    if let Some(m) = CLIENT_API_RE.find(content) {
        let first_line = content.lines().next().unwrap_or_default();
        if !first_line.contains("use client") {
            issues.push(format!(
                "`{}` requires the \"use client\" directive on the first line of the file",
                m.as_str()
            ));
        }
    }

    issues
}
