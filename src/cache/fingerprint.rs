//! Content fingerprints for compilation units
//!
//! The fingerprint covers everything that can change the artifact: source
//! contents in unit order, referenced libraries, compiler flags, build mode
//! and the compiler itself. Same inputs = same cache entry.

use crate::resolve::CompilationUnit;
use sha2::{Digest, Sha256};

/// Bumped whenever the canonical text layout changes
const FINGERPRINT_VERSION: &str = "kiln-fp-1";

/// Length of the fingerprint prefix used as a directory name
pub const SHORT_LEN: usize = 16;

/// Compute the full SHA-256 fingerprint of a unit built by `backend`
pub fn fingerprint(unit: &CompilationUnit, backend: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_text(unit, backend).as_bytes());
    hex::encode(hasher.finalize())
}

/// Directory name for a fingerprint
pub fn short(fingerprint: &str) -> &str {
    &fingerprint[..SHORT_LEN.min(fingerprint.len())]
}

fn canonical_text(unit: &CompilationUnit, backend: &str) -> String {
    let mut text = String::new();
    let mut line = |key: &str, value: &str| {
        text.push_str(key);
        text.push('=');
        text.push_str(value);
        text.push('\n');
    };

    line("version", FINGERPRINT_VERSION);
    line("primary", &unit.primary.display().to_string());
    for source in &unit.sources {
        line(
            "source",
            &format!("{}:{}", source.path.display(), source.hash),
        );
    }

    // Reference order does not change linkage for our purposes
    let mut references: Vec<_> = unit.references.iter().collect();
    references.sort_by(|a, b| a.path.cmp(&b.path));
    for reference in references {
        line(
            "ref",
            &format!("{}:{}", reference.path.display(), reference.hash),
        );
    }

    for arg in &unit.compiler_args {
        line("arg", arg);
    }
    line("mode", unit.mode());
    line("backend", backend);

    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::{content_hash, Reference, SourceFile};
    use chrono::Utc;
    use std::path::PathBuf;

    fn source(path: &str, text: &str) -> SourceFile {
        SourceFile {
            path: PathBuf::from(path),
            compile_path: PathBuf::from(path),
            text: text.to_string(),
            modified: Utc::now(),
            hash: content_hash(text.as_bytes()),
        }
    }

    fn reference(path: &str) -> Reference {
        Reference {
            path: PathBuf::from(path),
            hash: content_hash(path.as_bytes()),
            modified: Utc::now(),
        }
    }

    fn unit() -> CompilationUnit {
        CompilationUnit {
            primary: PathBuf::from("/s/main.c"),
            sources: vec![source("/s/main.c", "int main(){}"), source("/s/a.c", "")],
            references: vec![reference("/lib/libm.a"), reference("/lib/libz.a")],
            probing_dirs: vec![],
            compiler_args: vec!["-DX".to_string()],
            debug: true,
            output: None,
            macros: vec![],
            diagnostics: vec![],
        }
    }

    #[test]
    fn stable_for_same_inputs() {
        let a = fingerprint(&unit(), "cc@1");
        let b = fingerprint(&unit(), "cc@1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_eq!(short(&a).len(), SHORT_LEN);
    }

    #[test]
    fn source_content_changes_fingerprint() {
        let mut changed = unit();
        changed.sources[1] = source("/s/a.c", "int x;");
        assert_ne!(fingerprint(&unit(), "cc"), fingerprint(&changed, "cc"));
    }

    #[test]
    fn mode_args_and_backend_change_fingerprint() {
        let base = fingerprint(&unit(), "cc");

        let mut release = unit();
        release.debug = false;
        assert_ne!(base, fingerprint(&release, "cc"));

        let mut args = unit();
        args.compiler_args.push("-O3".to_string());
        assert_ne!(base, fingerprint(&args, "cc"));

        assert_ne!(base, fingerprint(&unit(), "clang"));
    }

    #[test]
    fn reference_order_ignored() {
        let mut swapped = unit();
        swapped.references.reverse();
        assert_eq!(fingerprint(&unit(), "cc"), fingerprint(&swapped, "cc"));
    }

    #[test]
    fn source_order_matters() {
        let mut swapped = unit();
        swapped.sources.swap(0, 1);
        assert_ne!(fingerprint(&unit(), "cc"), fingerprint(&swapped, "cc"));
    }
}
