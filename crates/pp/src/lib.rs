//! RT-Micro-C preprocessor.
//!
//! Scans source line-by-line ahead of the lexer and handles exactly two
//! directives: `#include "path"` (optional trailing `;`) and object-like
//! `#define NAME replacement`. Included paths are remembered by absolute
//! path, so re-including a file is a silent no-op; the same set breaks
//! include cycles.

use diag::{Diag, DiagKind, Result};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq)]
enum TokKind {
    Ident,
    Other,
    Whitespace,
    /// String/char literal or comment text: opaque to macro expansion.
    Verbatim,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Tok {
    kind: TokKind,
    text: String,
}

const MAX_EXPANSION_DEPTH: usize = 128;

pub struct Preprocessor {
    macros: HashMap<String, Vec<Tok>>,
    included: HashSet<PathBuf>,
    include_dirs: Vec<PathBuf>,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Preprocessor {
    pub fn new() -> Self {
        Self {
            macros: HashMap::new(),
            included: HashSet::new(),
            include_dirs: Vec::new(),
        }
    }

    pub fn with_include_dirs(dirs: Vec<PathBuf>) -> Self {
        Self {
            macros: HashMap::new(),
            included: HashSet::new(),
            include_dirs: dirs,
        }
    }

    /// Predefine an object-like macro ahead of any source line.
    pub fn define_object(&mut self, name: &str, body: &str) {
        let mut in_comment = false;
        let toks = tokenize(body, &mut in_comment);
        self.macros.insert(name.to_string(), toks);
    }

    pub fn undef(&mut self, name: &str) {
        let _ = self.macros.remove(name);
    }

    /// Preprocess a file on disk, resolving includes relative to it.
    pub fn preprocess_file(&mut self, path: &Path) -> Result<String> {
        let abs = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.included.insert(abs);
        let src = fs::read_to_string(path).map_err(|e| {
            Diag::new(
                DiagKind::Io,
                0,
                0,
                format!("failed to read {}: {}", path.display(), e),
            )
        })?;
        let cur_dir = path.parent().unwrap_or(Path::new("."));
        self.preprocess_text(&src, cur_dir)
            .map_err(|d| d.with_file(path.display().to_string()))
    }

    /// Preprocess in-memory source; includes resolve against `.` and the
    /// search list. Used by tests.
    pub fn preprocess_source(&mut self, src: &str) -> Result<String> {
        self.preprocess_text(src, Path::new("."))
    }

    fn preprocess_text(&mut self, src: &str, cur_dir: &Path) -> Result<String> {
        let mut out = String::new();
        let mut in_comment = false;
        for (idx, raw_line) in src.lines().enumerate() {
            let lineno = (idx + 1) as u32;
            let trimmed = raw_line.trim_start();
            if !in_comment && trimmed.starts_with('#') {
                let rest = trimmed[1..].trim_start();
                if let Some(drest) = rest.strip_prefix("define") {
                    let (name, body) = parse_define(drest, lineno)?;
                    let mut body_comment = false;
                    let toks = tokenize(&body, &mut body_comment);
                    self.macros.insert(name, toks);
                    continue;
                }
                if let Some(irest) = rest.strip_prefix("include") {
                    let name = parse_include(irest, lineno)?;
                    let expanded = self.run_include(&name, cur_dir, lineno)?;
                    out.push_str(&expanded);
                    continue;
                }
                return Err(Diag::new(
                    DiagKind::MalformedDirective,
                    lineno,
                    1,
                    format!("unknown preprocessor directive: {}", trimmed),
                ));
            }

            let toks = tokenize(raw_line, &mut in_comment);
            let mut active = HashSet::new();
            let expanded = self.expand(&toks, &mut active, 0, lineno)?;
            out.push_str(&untokenize(&expanded));
            out.push('\n');
        }
        Ok(out)
    }

    fn run_include(&mut self, name: &str, cur_dir: &Path, lineno: u32) -> Result<String> {
        let mut candidates: Vec<PathBuf> = vec![cur_dir.join(name)];
        for d in &self.include_dirs {
            candidates.push(d.join(name));
        }
        let found = candidates.into_iter().find(|c| c.exists()).ok_or_else(|| {
            Diag::new(
                DiagKind::IncludeNotFound,
                lineno,
                1,
                format!("include not found: {}", name),
            )
        })?;
        let abs = fs::canonicalize(&found).unwrap_or_else(|_| found.clone());
        if !self.included.insert(abs) {
            // Already included once (or currently being included): skip.
            return Ok(String::new());
        }
        let src = fs::read_to_string(&found).map_err(|e| {
            Diag::new(
                DiagKind::Io,
                lineno,
                1,
                format!("failed to read {}: {}", found.display(), e),
            )
        })?;
        let nested_dir = found.parent().unwrap_or(Path::new("."));
        self.preprocess_text(&src, nested_dir)
            .map_err(|d| d.with_file(found.display().to_string()))
    }

    fn expand(
        &self,
        toks: &[Tok],
        active: &mut HashSet<String>,
        depth: usize,
        lineno: u32,
    ) -> Result<Vec<Tok>> {
        if depth >= MAX_EXPANSION_DEPTH {
            return Err(Diag::new(
                DiagKind::CyclicMacro,
                lineno,
                1,
                "macro expansion exceeds depth limit",
            ));
        }
        let mut out = Vec::with_capacity(toks.len());
        for t in toks {
            if t.kind == TokKind::Ident {
                if let Some(body) = self.macros.get(&t.text) {
                    if active.contains(&t.text) {
                        return Err(Diag::new(
                            DiagKind::CyclicMacro,
                            lineno,
                            1,
                            format!("macro {} expands into itself", t.text),
                        ));
                    }
                    active.insert(t.text.clone());
                    let expanded = self.expand(body, active, depth + 1, lineno)?;
                    active.remove(&t.text);
                    out.extend(expanded);
                    continue;
                }
            }
            out.push(t.clone());
        }
        Ok(out)
    }
}

fn is_ident_start(ch: char) -> bool {
    ch == '_' || ch.is_ascii_alphabetic()
}
fn is_ident_continue(ch: char) -> bool {
    ch == '_' || ch.is_ascii_alphanumeric()
}

/// Split a line into macro-expansion units. String and character literals,
/// plus both comment forms, come back as `Verbatim` so expansion never
/// rewrites their interior. `in_comment` carries block-comment state across
/// lines.
fn tokenize(s: &str, in_comment: &mut bool) -> Vec<Tok> {
    let mut toks = Vec::new();
    let bytes = s.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        if *in_comment {
            let start = i;
            while i < bytes.len() {
                if bytes[i] == b'*' && i + 1 < bytes.len() && bytes[i + 1] == b'/' {
                    i += 2;
                    *in_comment = false;
                    break;
                }
                i += 1;
            }
            toks.push(Tok {
                kind: TokKind::Verbatim,
                text: s[start..i].to_string(),
            });
            continue;
        }
        let ch = s[i..].chars().next().unwrap();
        if ch.is_whitespace() {
            let start = i;
            while i < bytes.len() {
                let c2 = s[i..].chars().next().unwrap();
                if c2.is_whitespace() {
                    i += c2.len_utf8();
                } else {
                    break;
                }
            }
            toks.push(Tok {
                kind: TokKind::Whitespace,
                text: s[start..i].to_string(),
            });
            continue;
        }
        if is_ident_start(ch) {
            let start = i;
            while i < bytes.len() {
                let c2 = s[i..].chars().next().unwrap();
                if is_ident_continue(c2) {
                    i += c2.len_utf8();
                } else {
                    break;
                }
            }
            toks.push(Tok {
                kind: TokKind::Ident,
                text: s[start..i].to_string(),
            });
            continue;
        }
        if ch == '/' && i + 1 < bytes.len() && bytes[i + 1] == b'/' {
            toks.push(Tok {
                kind: TokKind::Verbatim,
                text: s[i..].to_string(),
            });
            break;
        }
        if ch == '/' && i + 1 < bytes.len() && bytes[i + 1] == b'*' {
            let start = i;
            i += 2;
            *in_comment = true;
            while i < bytes.len() {
                if bytes[i] == b'*' && i + 1 < bytes.len() && bytes[i + 1] == b'/' {
                    i += 2;
                    *in_comment = false;
                    break;
                }
                i += 1;
            }
            toks.push(Tok {
                kind: TokKind::Verbatim,
                text: s[start..i].to_string(),
            });
            continue;
        }
        if ch == '"' || ch == '\'' {
            let quote = ch;
            let start = i;
            i += 1;
            while i < bytes.len() {
                let c2 = s[i..].chars().next().unwrap();
                i += c2.len_utf8();
                if c2 == '\\' && i < bytes.len() {
                    let c3 = s[i..].chars().next().unwrap();
                    i += c3.len_utf8();
                    continue;
                }
                if c2 == quote {
                    break;
                }
            }
            toks.push(Tok {
                kind: TokKind::Verbatim,
                text: s[start..i].to_string(),
            });
            continue;
        }
        toks.push(Tok {
            kind: TokKind::Other,
            text: ch.to_string(),
        });
        i += ch.len_utf8();
    }
    toks
}

fn untokenize(toks: &[Tok]) -> String {
    let mut s = String::new();
    for t in toks {
        s.push_str(&t.text);
    }
    s
}

fn parse_define(rest: &str, lineno: u32) -> Result<(String, String)> {
    let rest = rest.trim_start();
    match rest.chars().next() {
        Some(c) if is_ident_start(c) => {}
        _ => {
            return Err(Diag::new(
                DiagKind::MalformedDirective,
                lineno,
                1,
                "expected identifier after #define",
            ));
        }
    }
    let mut end = rest.len();
    for (i, c) in rest.char_indices().skip(1) {
        if !is_ident_continue(c) {
            end = i;
            break;
        }
    }
    let name = rest[..end].to_string();
    let body = rest[end..].trim().to_string();
    Ok((name, body))
}

fn parse_include(rest: &str, lineno: u32) -> Result<String> {
    let rest = rest.trim();
    let inner = rest.strip_suffix(';').unwrap_or(rest).trim_end();
    let malformed = || {
        Diag::new(
            DiagKind::MalformedDirective,
            lineno,
            1,
            "expected #include \"path\"",
        )
    };
    let inner = inner.strip_prefix('"').ok_or_else(malformed)?;
    let inner = inner.strip_suffix('"').ok_or_else(malformed)?;
    if inner.is_empty() {
        return Err(malformed());
    }
    Ok(inner.to_string())
}
