//! Shader Template Environment
//!
//! GLSL stages and their named chunks live under
//! `src/renderer/program/shaders` and are embedded with `rust-embed`.
//! Templates use custom delimiters so they never collide with GLSL:
//!
//! | Syntax | Meaning |
//! |--------|---------|
//! | `{$ include "common" $}` | inline `chunks/common.glsl` (recursively) |
//! | `$$ if USE_MAP` | line statement, gated on a define |
//! | `{{ NUM_DIR_LIGHT_SHADOWS }}` | define value |
//!
//! Every define of the program is visible to the template as a variable.

use std::borrow::Cow;
use std::sync::OnceLock;

use minijinja::{Environment, Error, ErrorKind, syntax::SyntaxConfig};
use rust_embed::RustEmbed;

static SHADER_ENV: OnceLock<Environment<'static>> = OnceLock::new();

#[derive(RustEmbed)]
#[folder = "src/renderer/program/shaders"]
struct ShaderAssets;

pub fn get_env() -> &'static Environment<'static> {
    SHADER_ENV.get_or_init(|| {
        let mut env = Environment::new();

        match SyntaxConfig::builder()
            .block_delimiters("{$", "$}")
            .variable_delimiters("{{", "}}")
            .line_statement_prefix("$$")
            .build()
        {
            Ok(syntax) => env.set_syntax(syntax),
            Err(err) => log::error!("Shader template syntax rejected: {err}"),
        }

        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.set_undefined_behavior(minijinja::UndefinedBehavior::SemiStrict);

        env.set_loader(shader_loader);
        env.set_path_join_callback(|name, _parent| format!("chunks/{name}").into());

        env
    })
}

fn shader_loader(name: &str) -> Result<Option<String>, Error> {
    let filename = if std::path::Path::new(name)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("glsl"))
    {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(format!("{name}.glsl"))
    };

    let Some(file) = ShaderAssets::get(&filename) else {
        return Ok(None);
    };
    match std::str::from_utf8(file.data.as_ref()) {
        Ok(source) => Ok(Some(source.to_string())),
        Err(e) => Err(Error::new(
            ErrorKind::BadInclude,
            format!("{filename} is not valid UTF-8: {e}"),
        )),
    }
}

/// Rewrites `#include <chunk>` lines of user GLSL into template includes.
#[must_use]
pub fn expand_include_directives(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    for line in source.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("#include")
            && let Some(name) = rest
                .trim()
                .strip_prefix('<')
                .and_then(|r| r.strip_suffix('>'))
        {
            out.push_str("{$ include \"");
            out.push_str(name.trim());
            out.push_str("\" $}\n");
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// Renders `source` with numbered lines, marking `error_line` (1-based) and
/// keeping six lines of context on either side.
#[must_use]
pub fn numbered_context(source: &str, error_line: usize) -> String {
    let lines: Vec<&str> = source.lines().collect();
    let from = error_line.saturating_sub(7);
    let to = (error_line + 6).min(lines.len());
    let mut out = String::new();
    for (i, line) in lines.iter().enumerate().take(to).skip(from) {
        let number = i + 1;
        let marker = if number == error_line { '>' } else { ' ' };
        out.push_str(&format!("{marker} {number:4}: {line}\n"));
    }
    out
}

/// First `0:<line>:` reference of a driver info log.
#[must_use]
pub fn error_line(log: &str) -> Option<usize> {
    let start = log.find("0:")? + 2;
    let digits: String = log[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn include_directives_become_template_includes() {
        let out = expand_include_directives("#include <common>\nvoid main() {}");
        assert_eq!(out, "{$ include \"common\" $}\nvoid main() {}\n");
    }

    #[test]
    fn error_line_parses_driver_log() {
        assert_eq!(error_line("ERROR: 0:17: 'foo' : undeclared"), Some(17));
        assert_eq!(error_line("no location"), None);
    }

    #[test]
    fn numbered_context_marks_line() {
        let src = (1..=20).map(|i| format!("line{i}")).collect::<Vec<_>>().join("\n");
        let ctx = numbered_context(&src, 10);
        assert!(ctx.contains(">   10: line10"));
        assert!(ctx.contains("    4: line4"));
        assert!(!ctx.contains("line3\n"));
    }
}
