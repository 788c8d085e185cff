use std::path::{Path, PathBuf};
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/packed-refs");
    println!("cargo:rustc-env=SESSIOND_GIT_SHA={}", git_sha());

    let root = PathBuf::from(std::env::var_os("CARGO_MANIFEST_DIR").unwrap_or_default());
    let mut sources = Vec::new();
    collect_sources(&root.join("src"), &mut sources);

    let mut findings = Vec::new();
    for path in &sources {
        println!("cargo:rerun-if-changed={}", path.display());
        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };
        let rel = path.strip_prefix(&root).unwrap_or(path).display().to_string();
        check_source(&rel, &content, &mut findings);
    }

    if !findings.is_empty() {
        eprintln!("\nsessiond source guards failed:\n");
        for finding in &findings {
            eprintln!("  {}", finding);
        }
        eprintln!();
        panic!("{} source guard violation(s)", findings.len());
    }
}

fn git_sha() -> String {
    Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|sha| sha.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn collect_sources(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_sources(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            out.push(path);
        }
    }
}

/// A `#[test]` / `#[tokio::test]` function: its attributes and body lines.
struct TestFn<'a> {
    line: usize,
    name: &'a str,
    attrs: Vec<&'a str>,
    body: Vec<&'a str>,
}

fn check_source(file: &str, content: &str, findings: &mut Vec<String>) {
    let lines: Vec<&str> = content.lines().collect();

    // Unused code is deleted or gated on cfg(test), never allowed.
    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("#") && trimmed.contains("allow(") && trimmed.contains("dead_code") {
            findings.push(format!("{}:{}: #[allow(dead_code)] is not permitted", file, i + 1));
        }
    }

    // A runtime built on a side thread drops its tarpc clients when the
    // thread ends; async work runs on the daemon's runtime.
    for (i, line) in lines.iter().enumerate() {
        if line.trim_start().starts_with("//") || !line.contains("thread::spawn(") {
            continue;
        }
        let window = lines[i..lines.len().min(i + 20)].join("\n");
        if window.contains("Runtime::new()") || window.contains("runtime::Builder") {
            findings.push(format!("{}:{}: thread builds its own tokio runtime", file, i + 1));
        }
    }

    for test in test_fns(&lines) {
        // A conditional `return;` inside a test passes without asserting anything.
        let mut depth = 0i32;
        for line in &test.body {
            if line.trim() == "return;" && depth > 1 {
                findings.push(format!(
                    "{}:{}: test `{}` returns early instead of failing",
                    file, test.line, test.name
                ));
                break;
            }
            depth += brace_delta(line);
        }

        let mutates_env = test.body.iter().any(|line| {
            !line.trim_start().starts_with("//")
                && (line.contains("env::set_var") || line.contains("env::remove_var"))
        });
        let serial = test
            .attrs
            .iter()
            .any(|attr| *attr == "#[serial]" || *attr == "#[serial_test::serial]");
        if mutates_env && !serial {
            findings.push(format!(
                "{}:{}: test `{}` changes the process environment without #[serial]",
                file, test.line, test.name
            ));
        }
    }
}

fn test_fns<'a>(lines: &[&'a str]) -> Vec<TestFn<'a>> {
    let mut tests = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let trimmed = lines[i].trim();
        if trimmed != "#[test]" && !trimmed.starts_with("#[tokio::test") {
            i += 1;
            continue;
        }

        let start = i;
        let mut attrs = Vec::new();
        // Attributes stacked directly above the marker count too.
        let mut above = start;
        while above > 0 && lines[above - 1].trim().starts_with("#[") {
            above -= 1;
            attrs.push(lines[above].trim());
        }
        while i < lines.len() && !lines[i].contains("fn ") {
            attrs.push(lines[i].trim());
            i += 1;
        }
        let Some(signature) = lines.get(i) else {
            break;
        };
        let name = signature
            .split("fn ")
            .nth(1)
            .and_then(|rest| rest.split('(').next())
            .unwrap_or("?")
            .trim();

        let mut body = Vec::new();
        let mut depth = 0i32;
        let mut opened = false;
        while i < lines.len() {
            body.push(lines[i]);
            depth += brace_delta(lines[i]);
            opened |= lines[i].contains('{');
            i += 1;
            if opened && depth <= 0 {
                break;
            }
        }
        tests.push(TestFn {
            line: start + 1,
            name,
            attrs,
            body,
        });
    }
    tests
}

fn brace_delta(line: &str) -> i32 {
    line.chars().fold(0, |acc, c| match c {
        '{' => acc + 1,
        '}' => acc - 1,
        _ => acc,
    })
}
