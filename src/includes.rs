//! Dependency discovery for a translation unit.
//!
//! The daemon runs the real compiler locally with `-M -o -` (preprocessor
//! only) and parses the emitted Makefile rule into the full dependency list.
//! Every dependency is then opened and hashed; a header with a `.nocc-pch`
//! sidecar next to it promotes the sidecar into the session's PCH reference,
//! so the worker compiles the real PCH instead of receiving it.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

use nocc_protocol::{FileMetadata, PchInvocation, Sha256Digest};

use crate::invocation::{is_source_file_name, path_abs, Invocation};

/// One resolved dependency: the input source, a header, or a PCH sidecar.
#[derive(Debug, Clone, PartialEq)]
pub struct IncludedFile {
    /// Full path, starts with `/`.
    pub file_name: String,
    /// Size in bytes; -1 marks a probed file that does not exist.
    pub file_size: i64,
    /// Content digest; for a sidecar, the digest of the PCH it stands for.
    pub sha256: Sha256Digest,
}

impl IncludedFile {
    pub fn to_metadata(&self) -> FileMetadata {
        FileMetadata {
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            sha256: self.sha256,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("can't launch {compiler}: {source}")]
    Launch {
        compiler: String,
        source: std::io::Error,
    },

    #[error("{compiler} exited with code {exit_code}: {stderr}")]
    CompilerFailed {
        compiler: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("can't read dependency {path}: {source}")]
    ReadDep {
        path: String,
        source: std::io::Error,
    },
}

/// Kept in memory for the daemon's lifetime: results of `.nocc-pch` sidecar
/// probes, so repeated builds don't re-stat a sidecar per invocation.
/// A negative size caches a miss.
pub struct IncludesCache {
    sidecars: Mutex<HashMap<String, IncludedFile>>,
}

impl IncludesCache {
    pub fn new() -> Self {
        Self {
            sidecars: Mutex::new(HashMap::new()),
        }
    }

    fn lookup_sidecar(&self, sidecar_path: &str) -> Option<IncludedFile> {
        self.sidecars
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(sidecar_path)
            .cloned()
    }

    fn remember_sidecar(&self, sidecar_path: String, entry: IncludedFile) {
        self.sidecars
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(sidecar_path, entry);
    }
}

impl Default for IncludesCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything `collect_dependent_includes` discovers for one invocation.
pub struct CollectedDeps {
    /// Headers (and other includes), in preprocessor order, deduplicated.
    pub dep_files: Vec<IncludedFile>,
    /// The input source itself.
    pub cpp_file: IncludedFile,
    /// A `.nocc-pch` sidecar found next to one of the headers, if any.
    pub pch_file: Option<IncludedFile>,
}

/// Run the compiler with `-M` and resolve the full dependency list.
pub fn collect_dependent_includes(
    invocation: &Invocation,
    cache: &IncludesCache,
) -> Result<CollectedDeps, CollectError> {
    let mut cmd_line: Vec<String> = invocation.compiler_args.clone();
    strip_pch_emission_args(&mut cmd_line);
    cmd_line.push("-o".to_string());
    cmd_line.push("-".to_string());
    cmd_line.push("-M".to_string());
    cmd_line.push(invocation.cpp_in_file.clone());

    let output = Command::new(&invocation.compiler_name)
        .args(&cmd_line)
        .current_dir(&invocation.cwd)
        .output()
        .map_err(|e| CollectError::Launch {
            compiler: invocation.compiler_name.clone(),
            source: e,
        })?;

    if !output.status.success() {
        return Err(CollectError::CompilerFailed {
            compiler: invocation.compiler_name.clone(),
            exit_code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    let dep_names = extract_includes_from_make_rule(
        &String::from_utf8_lossy(&output.stdout),
        &invocation.cpp_in_file,
        &invocation.cwd,
    );

    let search_for_pch = is_source_file_name(&invocation.cpp_in_file);
    let mut dep_files = Vec::with_capacity(dep_names.len());
    let mut pch_file: Option<IncludedFile> = None;
    let mut seen: HashSet<String> = HashSet::with_capacity(dep_names.len());

    for dep_name in dep_names {
        if !seen.insert(dep_name.clone()) {
            continue;
        }
        if search_for_pch && pch_file.is_none() {
            if let Some(sidecar) = locate_pch_sidecar(&dep_name, cache) {
                // the sidecar takes the header's place as the PCH reference;
                // the header itself still travels, the worker compiles the
                // real PCH from it
                pch_file = Some(sidecar);
            }
        }
        dep_files.push(hash_dep(&dep_name)?);
    }

    let cpp_file = hash_dep(&invocation.cpp_in_file)?;

    Ok(CollectedDeps {
        dep_files,
        cpp_file,
        pch_file,
    })
}

fn hash_dep(file_name: &str) -> Result<IncludedFile, CollectError> {
    let (sha256, file_size) =
        Sha256Digest::of_file(Path::new(file_name)).map_err(|e| CollectError::ReadDep {
            path: file_name.to_string(),
            source: e,
        })?;
    Ok(IncludedFile {
        file_name: file_name.to_string(),
        file_size,
        sha256,
    })
}

/// Probe for `header.nocc-pch`; results (including misses) are cached for
/// the daemon's lifetime.
fn locate_pch_sidecar(header_name: &str, cache: &IncludesCache) -> Option<IncludedFile> {
    let sidecar_path = nocc_protocol::sidecar_path_for(header_name);

    if let Some(cached) = cache.lookup_sidecar(&sidecar_path) {
        return (cached.file_size >= 0).then_some(cached);
    }

    let entry = match std::fs::metadata(&sidecar_path) {
        Ok(meta) => match PchInvocation::load(Path::new(&sidecar_path)) {
            Ok(sidecar) => IncludedFile {
                file_name: sidecar_path.clone(),
                file_size: meta.len() as i64,
                sha256: Sha256Digest::from_long_hex(&sidecar.hash),
            },
            Err(e) => {
                tracing::error!("ignoring {sidecar_path}: {e}");
                missing_entry(&sidecar_path)
            }
        },
        Err(_) => missing_entry(&sidecar_path),
    };

    cache.remember_sidecar(sidecar_path, entry.clone());
    (entry.file_size >= 0).then_some(entry)
}

fn missing_entry(path: &str) -> IncludedFile {
    IncludedFile {
        file_name: path.to_string(),
        file_size: -1,
        sha256: Sha256Digest::empty(),
    }
}

/// A PCH-generating invocation must still yield an include list, so the
/// flags that would make the preprocessor emit a PCH are dropped; a
/// `-include-pch` file is generated worker-side and does not exist locally.
fn strip_pch_emission_args(cmd_line: &mut Vec<String>) {
    if let Some(i) = cmd_line
        .windows(2)
        .position(|w| w[0] == "-Xclang" && w[1] == "-emit-pch")
    {
        cmd_line.drain(i..i + 2);
    }
    if let Some(i) = cmd_line.iter().position(|a| a == "-include-pch") {
        let end = (i + 2).min(cmd_line.len());
        cmd_line.drain(i..end);
    }
}

/// Parse `-M` output: whitespace-separated paths, with the make target and
/// the input file dropped, `\` continuations skipped, and
/// `#pragma GCC pch_preprocess "file"` lines honored.
fn extract_includes_from_make_rule(stdout: &str, cpp_in_file: &str, cwd: &Path) -> Vec<String> {
    let mut names: Vec<String> = Vec::with_capacity(16);
    let mut tokens = stdout.split_whitespace().peekable();

    while let Some(token) = tokens.next() {
        if token == "#pragma" {
            if tokens.next_if_eq(&"GCC").is_some()
                && tokens.next_if_eq(&"pch_preprocess").is_some()
            {
                if let Some(pch_token) = tokens.next() {
                    let pch_name = pch_token.trim_matches('"');
                    names.push(path_abs(cwd, pch_name));
                }
            }
            continue;
        }
        if token == "\\" || token == cpp_in_file || token.ends_with(".o") || token.ends_with(".o:")
        {
            continue;
        }
        let abs = path_abs(cwd, token);
        if abs == cpp_in_file {
            continue;
        }
        names.push(abs);
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_extract_includes_basic_rule() {
        let stdout = "foo.o: /w/foo.cpp /w/inc/bar.h \\\n  /w/inc/baz.h\n";
        let names = extract_includes_from_make_rule(stdout, "/w/foo.cpp", Path::new("/w"));
        assert_eq!(names, vec!["/w/inc/bar.h", "/w/inc/baz.h"]);
    }

    #[test]
    fn test_extract_includes_relative_paths_absolutized() {
        let stdout = "foo.o: foo.cpp inc/bar.h\n";
        let names = extract_includes_from_make_rule(stdout, "/w/foo.cpp", Path::new("/w"));
        assert_eq!(names, vec!["/w/inc/bar.h"]);
    }

    #[test]
    fn test_extract_includes_pch_pragma() {
        let stdout = "foo.o: /w/foo.cpp\n#pragma GCC pch_preprocess \"/w/all.h.gch\"\n";
        let names = extract_includes_from_make_rule(stdout, "/w/foo.cpp", Path::new("/w"));
        assert_eq!(names, vec!["/w/all.h.gch"]);
    }

    #[test]
    fn test_strip_pch_emission_args() {
        let mut args: Vec<String> = ["-Wall", "-Xclang", "-emit-pch", "-include-pch", "a.gch", "-O2"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        strip_pch_emission_args(&mut args);
        assert_eq!(args, vec!["-Wall", "-O2"]);
    }

    #[test]
    fn test_locate_pch_sidecar_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        let header = dir.path().join("all.h");
        fs::write(&header, "#pragma once\n").unwrap();

        let cache = IncludesCache::new();
        let header_str = header.to_string_lossy().to_string();

        // no sidecar yet: miss, and the miss is cached
        assert!(locate_pch_sidecar(&header_str, &cache).is_none());

        let sidecar = PchInvocation {
            hash: Sha256Digest::of_bytes(b"pch").to_long_hex(),
            compiler: "g++".to_string(),
            input_file: header_str.clone(),
            output_file: format!("{header_str}.gch"),
            args: vec![],
        };
        fs::write(
            format!("{header_str}.nocc-pch"),
            sidecar.to_json().unwrap(),
        )
        .unwrap();

        // the cached miss is still served (sidecars appear only between
        // daemon restarts in practice)
        assert!(locate_pch_sidecar(&header_str, &cache).is_none());

        // a fresh cache sees it
        let fresh = IncludesCache::new();
        let found = locate_pch_sidecar(&header_str, &fresh).unwrap();
        assert!(found.file_name.ends_with(".nocc-pch"));
        assert_eq!(found.sha256, Sha256Digest::of_bytes(b"pch"));
    }

    #[test]
    fn test_hash_dep_missing_file_errors() {
        assert!(hash_dep("/nonexistent/x.h").is_err());
    }
}
