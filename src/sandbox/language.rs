use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::config::LanguageConfig;

use super::EngineError;

/// Name of the compiled artifact inside a workspace
const ARTIFACT_NAME: &str = "main";
const DEFAULT_ENTRY: &str = "main";
const DEFAULT_JAVA_CLASS: &str = "Main";

/// Modifiers that may sit between `public` and `class`, including `non-sealed`
const JAVA_CLASS_MODIFIERS: &[&str] = &[
    "final", "abstract", "static", "strictfp", "sealed", "non", "-",
];

/// Reserved words and restricted identifiers, none of which can name a class
const JAVA_KEYWORDS: &[&str] = &[
    "abstract", "assert", "boolean", "break", "byte", "case", "catch", "char", "class",
    "const", "continue", "default", "do", "double", "else", "enum", "extends", "final",
    "finally", "float", "for", "goto", "if", "implements", "import", "instanceof", "int",
    "interface", "long", "native", "new", "package", "private", "protected", "public",
    "return", "short", "static", "strictfp", "super", "switch", "synchronized", "this",
    "throw", "throws", "transient", "try", "void", "volatile", "while", "true", "false",
    "null", "_", "var", "yield", "record", "sealed", "permits",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Cpp,
    Java,
    Python,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::Cpp, Language::Java, Language::Python];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpp => "cpp",
            Self::Java => "java",
            Self::Python => "python",
        }
    }

    /// Looks up a language by its wire name; matching is exact
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.as_str() == name)
    }

    /// Entry point name used for `%MAIN%`
    fn entry_name(self, source: &str) -> String {
        match self {
            Self::Java => {
                java_entry_class(source).unwrap_or_else(|| DEFAULT_JAVA_CLASS.to_string())
            }
            Self::Cpp | Self::Python => DEFAULT_ENTRY.to_string(),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single process invocation inside a workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub program: String,
    pub args: Vec<String>,
}

impl Step {
    fn from_template(template: &[String], vars: &[(&str, &str)]) -> Self {
        let mut argv = template.iter().map(|part| expand(part, vars));
        // Templates are checked to be non-empty when the toolchain is built
        let program = argv.next().unwrap_or_default();
        Self {
            program,
            args: argv.collect(),
        }
    }
}

/// Resolved commands for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub source_file: String,
    pub compile: Option<Step>,
    pub run: Step,
}

/// Per-language command templates, resolved against a workspace per request
#[derive(Debug, Clone)]
pub struct Toolchain {
    languages: HashMap<Language, LanguageConfig>,
}

impl Toolchain {
    pub fn new(configs: Vec<LanguageConfig>) -> Result<Self> {
        let mut languages = HashMap::new();
        for config in configs {
            if config.run.is_empty() {
                bail!("Empty run command for language {}", config.name);
            }
            if config.compile.as_ref().is_some_and(|c| c.is_empty()) {
                bail!("Empty compile command for language {}", config.name);
            }
            let sample = config.file_name.replace("%MAIN%", DEFAULT_ENTRY);
            if sample.is_empty() || sample.contains('/') || sample == "." || sample == ".." {
                bail!(
                    "Invalid source file name {:?} for language {}",
                    config.file_name,
                    config.name
                );
            }
            if languages.insert(config.name, config).is_some() {
                log::warn!("Duplicate language entry in configuration, the last one wins");
            }
        }

        for language in Language::ALL {
            if !languages.contains_key(&language) {
                log::warn!("Language {language} is supported but has no pipeline configured");
            }
        }

        Ok(Self { languages })
    }

    pub fn is_wired(&self, language: Language) -> bool {
        self.languages.contains_key(&language)
    }

    pub fn is_compiled(&self, language: Language) -> bool {
        self.languages
            .get(&language)
            .is_some_and(|c| c.compile.is_some())
    }

    /// Resolves the language's templates for `source` without touching the
    /// filesystem, so unwired languages are rejected before any allocation
    pub fn prepare(
        &self,
        language: Language,
        source: &str,
    ) -> Result<PreparedPipeline<'_>, EngineError> {
        let config = self
            .languages
            .get(&language)
            .ok_or(EngineError::UnwiredLanguage(language))?;

        let entry = language.entry_name(source);
        let source_file = config.file_name.replace("%MAIN%", &entry);
        Ok(PreparedPipeline {
            config,
            entry,
            source_file,
        })
    }

    /// Builds the argument vectors for `language` inside `workspace_dir`
    #[cfg(test)]
    fn pipeline(
        &self,
        language: Language,
        source: &str,
        workspace_dir: &Path,
    ) -> Result<Pipeline, EngineError> {
        Ok(self.prepare(language, source)?.bind(workspace_dir))
    }
}

/// Templates resolved for one source text, not yet tied to a directory
#[derive(Debug)]
pub struct PreparedPipeline<'a> {
    config: &'a LanguageConfig,
    entry: String,
    source_file: String,
}

impl PreparedPipeline<'_> {
    pub fn source_file(&self) -> &str {
        &self.source_file
    }

    pub fn bind(&self, workspace_dir: &Path) -> Pipeline {
        let source_path = workspace_dir.join(&self.source_file);
        let artifact_path = workspace_dir.join(ARTIFACT_NAME);

        let source_path = source_path.to_string_lossy();
        let artifact_path = artifact_path.to_string_lossy();
        let dir = workspace_dir.to_string_lossy();
        let vars = [
            ("%SOURCE%", source_path.as_ref()),
            ("%OUTPUT%", artifact_path.as_ref()),
            ("%DIR%", dir.as_ref()),
            ("%MAIN%", self.entry.as_str()),
        ];

        Pipeline {
            compile: self
                .config
                .compile
                .as_ref()
                .map(|template| Step::from_template(template, &vars)),
            run: Step::from_template(&self.config.run, &vars),
            source_file: self.source_file.clone(),
        }
    }
}

/// Built-in wiring for the system toolchains
pub fn default_languages() -> Vec<LanguageConfig> {
    let argv = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    vec![
        LanguageConfig {
            name: Language::Cpp,
            file_name: "main.cpp".to_string(),
            compile: Some(argv(&[
                "g++",
                "-O2",
                "-std=c++17",
                "-o",
                "%OUTPUT%",
                "%SOURCE%",
            ])),
            run: argv(&["%OUTPUT%"]),
        },
        LanguageConfig {
            name: Language::Java,
            file_name: "%MAIN%.java".to_string(),
            // Bounded heaps keep both JVMs inside the default address-space cap
            compile: Some(argv(&[
                "javac",
                "-J-Xmx512m",
                "-J-XX:+UseSerialGC",
                "-J-XX:CompressedClassSpaceSize=64m",
                "-d",
                "%DIR%",
                "%SOURCE%",
            ])),
            run: argv(&[
                "java",
                "-Xmx256m",
                "-XX:+UseSerialGC",
                "-XX:CompressedClassSpaceSize=64m",
                "-cp",
                "%DIR%",
                "%MAIN%",
            ]),
        },
        LanguageConfig {
            name: Language::Python,
            file_name: "main.py".to_string(),
            compile: None,
            run: argv(&["python3", "%SOURCE%"]),
        },
    ]
}

fn expand(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(key, value);
    }
    out
}

/// Finds the class `javac` expects the file to be named after.
///
/// Comments and literals are blanked out first. A `public` top-level class wins;
/// otherwise the first declared class is used. Names that are keywords or not
/// plain ASCII identifiers are ignored, so the result is always safe to use as
/// a file name.
pub fn java_entry_class(source: &str) -> Option<String> {
    let code = strip_comments_and_literals(source);
    let tokens = java_tokens(&code);

    let mut first = None;
    for (idx, pair) in tokens.windows(2).enumerate() {
        // `Foo.class` is a class literal, not a declaration
        if pair[0] != "class" || (idx > 0 && tokens[idx - 1] == ".") {
            continue;
        }
        let name = pair[1];
        if !is_java_identifier(name) || JAVA_KEYWORDS.contains(&name) {
            continue;
        }

        let is_public = tokens[..idx]
            .iter()
            .rev()
            .find(|t| !JAVA_CLASS_MODIFIERS.contains(*t))
            .is_some_and(|t| *t == "public");
        if is_public {
            return Some(name.to_string());
        }
        if first.is_none() {
            first = Some(name);
        }
    }

    first.map(str::to_string)
}

/// Replaces comments, string, text block and char literals with a space
fn strip_comments_and_literals(source: &str) -> String {
    const TEXT_BLOCK: [char; 3] = ['"', '"', '"'];

    let chars: Vec<char> = source.chars().collect();
    let mut out = String::with_capacity(source.len());
    let mut i = 0;
    while i < chars.len() {
        let rest = &chars[i..];
        if rest.starts_with(&['/', '/']) {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if rest.starts_with(&['/', '*']) {
            i += 2;
            while i < chars.len() && !chars[i..].starts_with(&['*', '/']) {
                i += 1;
            }
            i += 2;
        } else if rest.starts_with(&TEXT_BLOCK) {
            i += 3;
            while i < chars.len() && !chars[i..].starts_with(&TEXT_BLOCK) {
                i += if chars[i] == '\\' { 2 } else { 1 };
            }
            i += 3;
        } else if rest[0] == '"' || rest[0] == '\'' {
            let quote = rest[0];
            i += 1;
            while i < chars.len() && chars[i] != quote && chars[i] != '\n' {
                i += if chars[i] == '\\' { 2 } else { 1 };
            }
            i += 1;
        } else {
            out.push(rest[0]);
            i += 1;
            continue;
        }
        out.push(' ');
    }
    out
}

/// Identifier-like runs plus every other non-blank character on its own
fn java_tokens(code: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = None;
    for (idx, c) in code.char_indices() {
        let word = c.is_alphanumeric() || c == '_' || c == '$';
        match (word, start) {
            (true, None) => start = Some(idx),
            (false, Some(from)) => {
                tokens.push(&code[from..idx]);
                start = None;
            }
            _ => {}
        }
        if !word && !c.is_whitespace() {
            tokens.push(&code[idx..idx + c.len_utf8()]);
        }
    }
    if let Some(from) = start {
        tokens.push(&code[from..]);
    }
    tokens
}

fn is_java_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}
