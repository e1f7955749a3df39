//! Depfile flags and Makefile-style dependency emission.
//!
//! Build systems pass `-MD -MT tgt -MF file` to get a `.d` file alongside the
//! object. Those flags are captured at parse time, stripped from the argument
//! list that travels to the worker, and the daemon emits the depfile itself
//! once dependency discovery has produced the include list.

use std::io;
use std::path::Path;

use nocc_protocol::fileio;

use crate::includes::IncludedFile;

/// Captured `-M*` flags of one invocation.
#[derive(Debug, Clone, Default)]
pub struct DepCmdFlags {
    /// `-MF {file}`, pre-resolved against cwd.
    flag_mf: String,
    /// `-MT`/`-MQ` targets, already escaped and joined.
    flag_mt: String,
    /// `-MD`: emit the depfile named after the output file.
    flag_md: bool,
    /// `-MMD`: like `-MD`, user headers only (the distinction is left to the
    /// preprocessor run; emission is identical).
    flag_mmd: bool,
    /// `-MP`: add a phony target per dependency other than the main file.
    flag_mp: bool,
}

impl DepCmdFlags {
    pub fn set_mf(&mut self, abs_file_name: String) {
        self.flag_mf = abs_file_name;
    }

    pub fn set_mt(&mut self, target: &str) {
        if !self.flag_mt.is_empty() {
            self.flag_mt.push_str(" \\\n ");
        }
        self.flag_mt.push_str(target);
    }

    pub fn set_mq(&mut self, target: &str) {
        if !self.flag_mt.is_empty() {
            self.flag_mt.push_str(" \\\n ");
        }
        self.flag_mt.push_str(&quote_makefile_target(target));
    }

    pub fn set_md(&mut self) {
        self.flag_md = true;
    }

    pub fn set_mmd(&mut self) {
        self.flag_mmd = true;
    }

    pub fn set_mp(&mut self) {
        self.flag_mp = true;
    }

    /// Whether a depfile must be produced alongside the object.
    pub fn should_generate_dep_file(&self) -> bool {
        self.flag_md || self.flag_mmd || !self.flag_mf.is_empty()
    }

    /// The depfile path: `-MF` wins; otherwise derive from the output path
    /// with a `.d` suffix (GCC's rule, which build systems rely on).
    pub fn output_path(&self, obj_out_file: &str) -> String {
        if !self.flag_mf.is_empty() {
            return self.flag_mf.clone();
        }
        fileio::replace_file_ext(obj_out_file, ".d")
    }

    /// Generate the depfile contents for `cpp_in_file` and its dependencies.
    pub fn generate(
        &self,
        cpp_in_file: &str,
        obj_out_file: &str,
        dep_files: &[IncludedFile],
    ) -> Vec<u8> {
        let target_name = if self.flag_mt.is_empty() {
            quote_makefile_target(obj_out_file)
        } else {
            self.flag_mt.clone()
        };

        let mut dep_list: Vec<String> = Vec::with_capacity(1 + dep_files.len());
        dep_list.push(quote_makefile_target(cpp_in_file));
        for dep in dep_files {
            dep_list.push(quote_makefile_target(&dep.file_name));
        }

        let mut out = String::new();
        write_target(&mut out, &target_name, &dep_list);

        if self.flag_mp {
            // a phony target per dependency other than the main file,
            // each depending on nothing
            for dep in &dep_list[1..] {
                out.push('\n');
                write_target(&mut out, dep, &[]);
            }
        }

        out.into_bytes()
    }

    /// Generate and write the depfile next to the object.
    pub fn generate_and_save(
        &self,
        cpp_in_file: &str,
        obj_out_file: &str,
        dep_files: &[IncludedFile],
    ) -> io::Result<String> {
        let dep_file_name = self.output_path(obj_out_file);
        let contents = self.generate(cpp_in_file, obj_out_file, dep_files);
        fileio::write_file_atomic(Path::new(&dep_file_name), &contents)?;
        Ok(dep_file_name)
    }
}

fn write_target(out: &mut String, target_name: &str, dep_list: &[String]) {
    out.push_str(target_name);
    out.push(':');
    let mut first = true;
    for dep in dep_list {
        if first {
            out.push(' ');
            first = false;
        } else {
            out.push_str(" \\\n  ");
        }
        out.push_str(dep);
    }
    out.push('\n');
}

/// Escape the characters Make treats specially in target/prerequisite names:
/// spaces and tabs (with their preceding backslashes), `$`, `#`, and `:`.
fn quote_makefile_target(name: &str) -> String {
    let bytes = name.as_bytes();
    let mut escaped = String::with_capacity(name.len());
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b' ' | b'\t' => {
                let mut j = i;
                while j > 0 && bytes[j - 1] == b'\\' {
                    escaped.push('\\');
                    j -= 1;
                }
                escaped.push('\\');
            }
            b'$' => escaped.push('$'),
            b'#' | b':' => escaped.push('\\'),
            _ => {}
        }
        escaped.push(b as char);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use nocc_protocol::Sha256Digest;

    fn dep(name: &str) -> IncludedFile {
        IncludedFile {
            file_name: name.to_string(),
            file_size: 1,
            sha256: Sha256Digest::of_bytes(name.as_bytes()),
        }
    }

    #[test]
    fn test_quote_makefile_target() {
        assert_eq!(quote_makefile_target("plain.o"), "plain.o");
        assert_eq!(quote_makefile_target("a b.o"), "a\\ b.o");
        assert_eq!(quote_makefile_target("c$d.o"), "c$$d.o");
        assert_eq!(quote_makefile_target("e#f.o"), "e\\#f.o");
        assert_eq!(quote_makefile_target("g:h.o"), "g\\:h.o");
        assert_eq!(quote_makefile_target("i\\ j"), "i\\\\\\ j");
    }

    #[test]
    fn test_default_depfile_name_follows_output() {
        let flags = DepCmdFlags {
            flag_md: true,
            ..Default::default()
        };
        assert_eq!(flags.output_path("/w/obj/foo.o"), "/w/obj/foo.d");
    }

    #[test]
    fn test_mf_wins_over_derived_name() {
        let mut flags = DepCmdFlags::default();
        flags.set_mf("/w/custom.d".to_string());
        assert_eq!(flags.output_path("/w/foo.o"), "/w/custom.d");
        assert!(flags.should_generate_dep_file());
    }

    #[test]
    fn test_generate_lists_exactly_the_deps() {
        let mut flags = DepCmdFlags::default();
        flags.set_md();
        let deps = [dep("/w/inc/bar.h"), dep("/w/inc/baz.h")];
        let text =
            String::from_utf8(flags.generate("/w/foo.cpp", "/w/foo.o", &deps)).unwrap();

        assert!(text.starts_with("/w/foo.o: /w/foo.cpp"));
        assert!(text.contains("/w/inc/bar.h"));
        assert!(text.contains("/w/inc/baz.h"));
        // one continuation per extra dependency
        assert_eq!(text.matches(" \\\n  ").count(), 2);
    }

    #[test]
    fn test_mt_target_used_verbatim() {
        let mut flags = DepCmdFlags::default();
        flags.set_md();
        flags.set_mt("custom.o");
        let text = String::from_utf8(flags.generate("/w/a.cpp", "/w/a.o", &[])).unwrap();
        assert!(text.starts_with("custom.o: /w/a.cpp"));
    }

    #[test]
    fn test_mq_target_escaped() {
        let mut flags = DepCmdFlags::default();
        flags.set_mq("weird$name.o");
        let text = String::from_utf8(flags.generate("/w/a.cpp", "/w/a.o", &[])).unwrap();
        assert!(text.starts_with("weird$$name.o:"));
    }

    #[test]
    fn test_mp_emits_phony_targets() {
        let mut flags = DepCmdFlags::default();
        flags.set_md();
        flags.set_mp();
        let deps = [dep("/w/b.h")];
        let text = String::from_utf8(flags.generate("/w/a.cpp", "/w/a.o", &deps)).unwrap();
        // the dependency reappears as a target with no prerequisites
        assert!(text.contains("\n/w/b.h:\n"));
        // but the main source file does not
        assert!(!text.contains("\n/w/a.cpp:"));
    }
}
