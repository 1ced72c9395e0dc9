//! Turns a raw model reply into a runnable test module.

use regex::Regex;

use crate::state::TargetObject;

pub fn postprocess(response: &str, target: &TargetObject) -> String {
    let code = extract_code(response);
    ensure_import(&code, target)
}

/// First python (or unlabeled) fenced block; the whole reply otherwise.
pub fn extract_code(response: &str) -> String {
    let fence = Regex::new(r"(?s)```([A-Za-z0-9_+-]*)[ \t]*\r?\n(.*?)```").expect("static regex");

    let mut fallback: Option<String> = None;
    for caps in fence.captures_iter(response) {
        let lang = caps.get(1).map(|m| m.as_str().to_ascii_lowercase()).unwrap_or_default();
        let body = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        match lang.as_str() {
            "python" | "py" | "python3" => return tidy(body),
            "" if fallback.is_none() => fallback = Some(tidy(body)),
            _ => {}
        }
    }

    fallback.unwrap_or_else(|| tidy(response))
}

fn tidy(code: &str) -> String {
    let mut s = code.trim_matches('\n').trim_end().to_string();
    s.push('\n');
    s
}

/// Prepends `from <module> import <name>` unless the module is already imported.
pub fn ensure_import(code: &str, target: &TargetObject) -> String {
    let module = target.module_name();
    let escaped = regex::escape(&module);
    let imported = Regex::new(&format!(r"(?m)^\s*(from\s+{escaped}\s+import\b|import\s+{escaped}\b)"))
        .map(|re| re.is_match(code))
        .unwrap_or(false);

    if imported {
        return code.to_string();
    }
    format!("from {module} import {}\n{code}", target.import_name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LineSpan;
    use std::path::PathBuf;

    fn target() -> TargetObject {
        TargetObject {
            name: "deposit".into(),
            class_name: Some("Account".into()),
            source_path: PathBuf::from("bank/accounts.py"),
            span: LineSpan { start: 1, end: 5 },
            source: String::new(),
            info_sheet: Vec::new(),
        }
    }

    #[test]
    fn python_block_wins_over_others() {
        let reply = "Here:\n```text\nignore\n```\n```python\nimport unittest\n```\nDone";
        assert_eq!(extract_code(reply), "import unittest\n");
    }

    #[test]
    fn plain_reply_is_kept() {
        assert_eq!(extract_code("\nimport unittest\n\n"), "import unittest\n");
    }

    #[test]
    fn unlabeled_fence_is_used_as_fallback() {
        assert_eq!(extract_code("```\nx = 1\n```"), "x = 1\n");
    }

    #[test]
    fn missing_import_is_added() {
        let out = ensure_import("import unittest\n", &target());
        assert!(out.starts_with("from bank.accounts import Account\n"));
    }

    #[test]
    fn existing_import_is_left_alone() {
        let code = "from bank.accounts import Account, Ledger\nimport unittest\n";
        assert_eq!(ensure_import(code, &target()), code);
        let code = "import bank.accounts\n";
        assert_eq!(ensure_import(code, &target()), code);
    }
}
