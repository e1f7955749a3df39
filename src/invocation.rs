//! Command-line model: parsing and classification of one compiler invocation.
//!
//! Every wrapper call becomes an [`Invocation`]. The argument scan
//! canonicalizes path-taking options to absolute paths, captures depfile
//! flags into a separate structure (they are handled daemon-side and never
//! sent to a worker), and classifies the invocation: compile remotely,
//! compile locally, generate a PCH, link, or unsupported.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::depfile::DepCmdFlags;
use crate::sync::WaitGroup;

/// What the daemon decided to do with a command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeType {
    /// Unsupported options or malformed command line; run locally.
    Unsupported,
    /// Looks like a configure test or targets /dev/null; run locally.
    LocalCompile,
    /// One translation unit with `-c`; eligible for remote compilation.
    CompileCpp,
    /// `-x {c,c++,objective-c,objective-c++}-header`; local PCH generation.
    CompilePch,
    /// One source and `-o` without `-c`; linking, run locally.
    Link,
}

/// Result of a remote compilation, mirrored from the worker.
#[derive(Debug, Clone, Default)]
pub struct RemoteResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: i32,
}

/// One wrapper call inside the daemon.
pub struct Invocation {
    pub session_id: u32,
    pub invoke_type: InvokeType,
    /// Human-readable reason when classification failed.
    pub parse_error: Option<String>,

    pub uid: u32,
    pub gid: u32,
    pub created_at: Instant,

    pub cwd: PathBuf,
    pub compiler_name: String,
    /// Canonicalized arguments forwarded to the compiler/worker.
    pub compiler_args: Vec<String>,
    pub has_c_option: bool,
    /// Input source, absolute (`.cpp` for compilation, `.h` for PCH).
    pub cpp_in_file: String,
    /// Output file, absolute (`.o`, or `.gch`/`.pch` for PCH).
    pub obj_out_file: String,
    pub dep_flags: DepCmdFlags,

    /// Worker host this invocation was routed to, for logs and fallback notes.
    pub remote_host: Mutex<String>,

    // Remote pipeline synchronization. Exactly-once result delivery is
    // guaranteed by `recv_once` + the two wait groups.
    pub wg_upload: WaitGroup,
    pub wg_recv: WaitGroup,
    recv_once: AtomicBool,
    error: Mutex<Option<String>>,
    pub result: Mutex<RemoteResult>,
}

impl Invocation {
    pub fn parse(
        session_id: u32,
        uid: u32,
        gid: u32,
        cwd: &str,
        compiler_name: &str,
        cmd_line: &[String],
    ) -> Self {
        let mut invocation = Self {
            session_id,
            invoke_type: InvokeType::Unsupported,
            parse_error: None,
            uid,
            gid,
            created_at: Instant::now(),
            cwd: PathBuf::from(cwd),
            compiler_name: compiler_name.to_string(),
            compiler_args: Vec::with_capacity(cmd_line.len()),
            has_c_option: false,
            cpp_in_file: String::new(),
            obj_out_file: String::new(),
            dep_flags: DepCmdFlags::default(),
            remote_host: Mutex::new(String::new()),
            wg_upload: WaitGroup::new(),
            wg_recv: WaitGroup::new(),
            recv_once: AtomicBool::new(false),
            error: Mutex::new(None),
            result: Mutex::new(RemoteResult::default()),
        };
        invocation.parse_cmd_line(cmd_line);
        invocation
    }

    fn parse_cmd_line(&mut self, cmd_line: &[String]) {
        // -Wp,... members are unpacked onto the end of this work list and
        // re-scanned as ordinary arguments, so it must stay growable.
        let mut args: Vec<String> = cmd_line.to_vec();
        let mut i = 0;

        while i < args.len() {
            let arg = args[i].clone();
            if arg.is_empty() {
                i += 1;
                continue;
            }

            if arg.starts_with('-') {
                if arg == "-c" {
                    self.has_c_option = true;
                    i += 1;
                    continue;
                }
                if arg == "-I-" || arg == "-E" || arg == "-M" || arg == "-MM" || arg == "-MG" {
                    self.parse_error = Some(format!("unsupported option: {arg}"));
                    return;
                }
                if arg == "-march=native" {
                    self.parse_error = Some("-march=native can't be launched remotely".to_string());
                    return;
                }
                if let Some((_, value)) = self.parse_arg_file(&args, "-o", &mut i) {
                    if value == "/dev/null" {
                        self.invoke_type = InvokeType::LocalCompile;
                    }
                    self.obj_out_file = path_abs(&self.cwd, &value);
                    i += 1;
                    continue;
                }
                if self.parse_include_arg(&args, &mut i) {
                    i += 1;
                    continue;
                }
                if arg == "-x" && i + 1 < args.len() {
                    let x_arg = args[i + 1].clone();
                    if matches!(
                        x_arg.as_str(),
                        "c-header" | "c++-header" | "objective-c-header" | "objective-c++-header"
                    ) {
                        self.invoke_type = InvokeType::CompilePch;
                        self.compiler_args.push(arg);
                        self.compiler_args.push(x_arg);
                        i += 2;
                        continue;
                    }
                }
                if let Some((_, value)) = self.parse_arg_file(&args, "-MF", &mut i) {
                    self.dep_flags.set_mf(path_abs(&self.cwd, &value));
                    i += 1;
                    continue;
                }
                if let Some((_, value)) = self.parse_arg_file(&args, "-MT", &mut i) {
                    self.dep_flags.set_mt(&value);
                    i += 1;
                    continue;
                }
                if let Some((_, value)) = self.parse_arg_file(&args, "-MQ", &mut i) {
                    self.dep_flags.set_mq(&value);
                    i += 1;
                    continue;
                }
                if arg == "-MD" {
                    self.dep_flags.set_md();
                    i += 1;
                    continue;
                }
                if arg == "-MMD" {
                    self.dep_flags.set_mmd();
                    i += 1;
                    continue;
                }
                if arg == "-MP" {
                    self.dep_flags.set_mp();
                    i += 1;
                    continue;
                }
                if arg.starts_with("-Wp,") {
                    self.unpack_wp_arg(&arg, &mut args);
                    i += 1;
                    continue;
                }
                if self.parse_error.is_some() {
                    return;
                }
            } else if is_source_file_name(&arg) || is_header_file_name(&arg) {
                if !self.cpp_in_file.is_empty() {
                    self.parse_error =
                        Some("unsupported command-line: multiple input source files".to_string());
                    return;
                }
                if looks_like_configure_test(&self.cwd, &arg) {
                    self.invoke_type = InvokeType::LocalCompile;
                }
                self.cpp_in_file = path_abs(&self.cwd, &arg);
                i += 1;
                continue;
            }

            self.compiler_args.push(arg);
            i += 1;
        }

        if self.parse_error.is_some() || self.invoke_type != InvokeType::Unsupported {
            return;
        }

        if self.has_c_option && !self.cpp_in_file.is_empty() {
            if self.obj_out_file.is_empty() {
                let base = Path::new(&self.cpp_in_file)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                let obj_name = nocc_protocol::fileio::replace_file_ext(&base, ".o");
                self.obj_out_file = path_abs(&self.cwd, &obj_name);
            }
            self.invoke_type = InvokeType::CompileCpp;
        } else if !self.cpp_in_file.is_empty() && !self.obj_out_file.is_empty() {
            self.invoke_type = InvokeType::Link;
        } else {
            self.parse_error =
                Some("unsupported command-line: no output file specified".to_string());
        }
    }

    /// Match `key value`, `keyvalue`, or `key -Xclang value` at position `i`,
    /// leaving `i` on the last consumed element. Returns the flag tokens as
    /// seen (so callers that forward the flag keep `-Xclang` pairing) and the
    /// raw value. Records a parse error when the key matches but its argument
    /// is missing.
    fn parse_arg_file(
        &mut self,
        args: &[String],
        key: &str,
        i: &mut usize,
    ) -> Option<(Vec<String>, String)> {
        let arg = &args[*i];
        if arg == key {
            if *i + 1 >= args.len() {
                self.parse_error =
                    Some(format!("unsupported command-line: no argument after {arg}"));
                return None;
            }
            *i += 1;
            if args[*i] == "-Xclang" {
                if *i + 1 >= args.len() {
                    self.parse_error =
                        Some(format!("unsupported command-line: no argument after {key}"));
                    return None;
                }
                *i += 1;
                return Some((
                    vec![key.to_string(), "-Xclang".to_string()],
                    args[*i].clone(),
                ));
            }
            Some((vec![key.to_string()], args[*i].clone()))
        } else if let Some(rest) = arg.strip_prefix(key) {
            Some((vec![key.to_string()], rest.to_string()))
        } else {
            None
        }
    }

    /// `-I`, `-iquote`, `-isystem`, `-include-pch`, `-include`: canonicalize
    /// the path and keep the flag/value pair in `compiler_args` (the worker
    /// remaps exactly these pairs into its mirror tree).
    fn parse_include_arg(&mut self, args: &[String], i: &mut usize) -> bool {
        // -include-pch before -include: the latter is a prefix of the former
        const INCLUDE_KEYS: [&str; 5] = ["-I", "-iquote", "-isystem", "-include-pch", "-include"];

        for key in INCLUDE_KEYS {
            if let Some((prefix, value)) = self.parse_arg_file(args, key, i) {
                self.compiler_args.extend(prefix);
                self.compiler_args.push(path_abs(&self.cwd, &value));
                return true;
            }
            if self.parse_error.is_some() {
                return false;
            }
        }
        false
    }

    /// `-Wp,-MD,file` and `-Wp,-MMD,file` feed the depfile flags; any other
    /// member is appended to the work list and re-scanned as a plain argument.
    fn unpack_wp_arg(&mut self, arg: &str, args: &mut Vec<String>) {
        let parts: Vec<&str> = arg.split(',').collect();
        let mut j = 1;
        while j < parts.len() {
            match parts[j] {
                "-MD" | "-MMD" if j + 1 < parts.len() => {
                    if parts[j] == "-MD" {
                        self.dep_flags.set_md();
                    } else {
                        self.dep_flags.set_mmd();
                    }
                    self.dep_flags.set_mf(path_abs(&self.cwd, parts[j + 1]));
                    j += 2;
                }
                other => {
                    args.push(other.to_string());
                    j += 1;
                }
            }
        }
    }

    // --- remote pipeline bookkeeping ---

    pub fn set_error(&self, message: impl Into<String>) {
        let mut error = self
            .error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if error.is_none() {
            *error = Some(message.into());
        }
    }

    pub fn take_error(&self) -> Option<String> {
        self.error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// One upload finished (successfully or not).
    pub fn done_upload_file(&self, err: Option<String>) {
        if let Some(message) = err {
            self.set_error(message);
        }
        self.wg_upload.done();
    }

    /// The object (or the error result) arrived; idempotent.
    pub fn done_recv_obj(&self, err: Option<String>) {
        if self.recv_once.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(message) = err {
            self.set_error(message);
        }
        self.wg_recv.done();
    }

    /// Releases every waiter with an error (timeout, shutdown, stream loss).
    pub fn force_interrupt(&self, message: impl Into<String>) {
        self.set_error(message);
        self.wg_upload.force_release();
        if !self.recv_once.swap(true, Ordering::SeqCst) {
            self.wg_recv.force_release();
        }
    }
}

/// Absolutize `rel_path` against `cwd` and normalize `.`/`..` lexically.
pub fn path_abs(cwd: &Path, rel_path: &str) -> String {
    let joined = if rel_path.starts_with('/') {
        PathBuf::from(rel_path)
    } else {
        cwd.join(rel_path)
    };
    clean_path(&joined)
}

fn clean_path(path: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => {}
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop();
            }
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
        }
    }
    format!("/{}", parts.join("/"))
}

pub fn is_source_file_name(file_name: &str) -> bool {
    const SUFFIXES: [&str; 20] = [
        ".c", ".i", ".cpp", ".cxx", ".cc", ".C", ".CC", ".cp", ".CPP", ".c++", ".C++", ".CXX",
        ".ii", ".S", ".s", ".m", ".mi", ".mm", ".M", ".mii",
    ];
    SUFFIXES.iter().any(|s| file_name.ends_with(s))
}

pub fn is_header_file_name(file_name: &str) -> bool {
    const SUFFIXES: [&str; 5] = [".h", ".H", ".hh", ".hxx", ".hpp"];
    SUFFIXES.iter().any(|s| file_name.ends_with(s))
}

/// Build systems probe the compiler with tiny throwaway TUs; compiling those
/// remotely costs more than it saves, and some must see the local toolchain.
fn looks_like_configure_test(cwd: &Path, arg: &str) -> bool {
    let cwd_str = cwd.to_string_lossy();
    let base = Path::new(arg)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    cwd_str.contains("TryCompile-")          // cmake
        || cwd_str.contains("meson-private") // meson
        || cwd_str.contains(".conf_check")   // waf
        || arg.contains("ffconf.")           // ffmpeg
        || arg.contains("cgo-gcc-input")     // go
        || base.starts_with("conftest")      // autoconf
        || arg.starts_with("tmp.conftest.") // autoconf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(cwd: &str, args: &[&str]) -> Invocation {
        let cmd_line: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        Invocation::parse(1, 0, 0, cwd, "g++", &cmd_line)
    }

    #[test]
    fn test_basic_compile_classification() {
        let inv = parse("/home/u/proj", &["-c", "foo.cpp", "-o", "foo.o", "-Iinc"]);
        assert_eq!(inv.invoke_type, InvokeType::CompileCpp);
        assert_eq!(inv.cpp_in_file, "/home/u/proj/foo.cpp");
        assert_eq!(inv.obj_out_file, "/home/u/proj/foo.o");
        assert_eq!(inv.compiler_args, vec!["-I", "/home/u/proj/inc"]);
    }

    #[test]
    fn test_output_synthesis_without_dash_o() {
        let inv = parse("/w", &["-c", "src/foo.cpp"]);
        assert_eq!(inv.invoke_type, InvokeType::CompileCpp);
        assert_eq!(inv.obj_out_file, "/w/foo.o");
    }

    #[test]
    fn test_link_classification() {
        let inv = parse("/w", &["main.cpp", "-o", "app"]);
        assert_eq!(inv.invoke_type, InvokeType::Link);
    }

    #[test]
    fn test_unsupported_options() {
        for flag in ["-E", "-I-", "-M", "-MM", "-MG", "-march=native"] {
            let inv = parse("/w", &["-c", "a.cpp", flag, "-o", "a.o"]);
            assert_eq!(inv.invoke_type, InvokeType::Unsupported, "flag {flag}");
            assert!(inv.parse_error.is_some());
        }
    }

    #[test]
    fn test_dev_null_output_is_local() {
        let inv = parse("/w", &["-c", "a.cpp", "-o", "/dev/null"]);
        assert_eq!(inv.invoke_type, InvokeType::LocalCompile);
    }

    #[test]
    fn test_configure_test_heuristics() {
        let inv = parse("/w", &["-c", "conftest.c", "-o", "conftest.o"]);
        assert_eq!(inv.invoke_type, InvokeType::LocalCompile);

        let inv = parse("/b/CMakeFiles/TryCompile-x1", &["-c", "src.cxx", "-o", "s.o"]);
        assert_eq!(inv.invoke_type, InvokeType::LocalCompile);
    }

    #[test]
    fn test_pch_classification() {
        let inv = parse("/w", &["-x", "c++-header", "-o", "all.h.gch", "all.h"]);
        assert_eq!(inv.invoke_type, InvokeType::CompilePch);
        assert_eq!(inv.cpp_in_file, "/w/all.h");
        assert_eq!(inv.obj_out_file, "/w/all.h.gch");
    }

    #[test]
    fn test_dep_flags_captured_and_stripped() {
        let inv = parse(
            "/w",
            &["-MD", "-MT", "a.o", "-MF", "a.o.d", "-c", "a.cpp", "-o", "a.o", "-Wall"],
        );
        assert_eq!(inv.invoke_type, InvokeType::CompileCpp);
        assert!(inv.dep_flags.should_generate_dep_file());
        assert_eq!(inv.dep_flags.output_path(&inv.obj_out_file), "/w/a.o.d");
        // none of the -M* flags leak into the forwarded arguments
        assert_eq!(inv.compiler_args, vec!["-Wall"]);
    }

    #[test]
    fn test_wp_unpacking() {
        let inv = parse("/w", &["-Wp,-MMD,a.d,-DFOO", "-c", "a.cpp", "-o", "a.o"]);
        assert!(inv.dep_flags.should_generate_dep_file());
        assert_eq!(inv.dep_flags.output_path(&inv.obj_out_file), "/w/a.d");
        assert!(inv.compiler_args.contains(&"-DFOO".to_string()));
    }

    #[test]
    fn test_inline_include_forms() {
        let inv = parse("/w", &["-I/abs/inc", "-iquote", "rel", "-c", "a.cpp", "-o", "a.o"]);
        assert_eq!(
            inv.compiler_args,
            vec!["-I", "/abs/inc", "-iquote", "/w/rel"]
        );
    }

    #[test]
    fn test_xclang_pairing_preserved() {
        let inv = parse("/w", &["-include", "-Xclang", "pre.h", "-c", "a.cpp", "-o", "a.o"]);
        assert_eq!(
            inv.compiler_args,
            vec!["-include", "-Xclang", "/w/pre.h"]
        );
    }

    #[test]
    fn test_missing_argument_is_unsupported() {
        let inv = parse("/w", &["-c", "a.cpp", "-o"]);
        assert_eq!(inv.invoke_type, InvokeType::Unsupported);
        assert!(inv.parse_error.as_deref().unwrap_or("").contains("-o"));
    }

    #[test]
    fn test_multiple_sources_unsupported() {
        let inv = parse("/w", &["-c", "a.cpp", "b.cpp", "-o", "a.o"]);
        assert_eq!(inv.invoke_type, InvokeType::Unsupported);
    }

    #[test]
    fn test_path_abs_cleans_dots() {
        assert_eq!(path_abs(Path::new("/a/b"), "../c/./d.h"), "/a/c/d.h");
        assert_eq!(path_abs(Path::new("/a"), "/x/../y.h"), "/y.h");
    }

    #[test]
    fn test_force_interrupt_releases_waiters() {
        let inv = parse("/w", &["-c", "a.cpp", "-o", "a.o"]);
        inv.wg_recv.add(1);
        inv.wg_upload.add(3);
        inv.force_interrupt("timeout");
        inv.wg_upload.wait();
        inv.wg_recv.wait();
        assert!(inv.take_error().unwrap().contains("timeout"));

        // a late result must not clobber the interrupt
        inv.done_recv_obj(None);
    }
}
