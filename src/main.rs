//! `nocc` wrapper entry point.
//!
//! Usage: `nocc <compiler> [args...]` (or install a compiler-named symlink).
//! The real work happens in the daemon; this binary stays as thin as the
//! build system's process churn demands.

use nocc::wrapper;

fn main() {
    let argv: Vec<String> = std::env::args().collect();

    if argv.len() == 2 && (argv[1] == "-version" || argv[1] == "-v" || argv[1] == "--version") {
        println!("nocc {}", nocc::VERSION);
        return;
    }

    let (compiler, args) = wrapper::split_compiler_and_args(&argv);
    if compiler.is_empty() {
        eprintln!("usage: nocc <compiler> [args...]");
        std::process::exit(1);
    }

    if wrapper::should_compile_locally(&args) {
        wrapper::execute_locally(&compiler, &args, "");
    }

    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd.to_string_lossy().into_owned(),
        Err(e) => wrapper::execute_locally(&compiler, &args, &format!("can't get cwd: {e}")),
    };

    let socket_path = wrapper::socket_path();
    let reply = wrapper::run_via_daemon(&socket_path, &cwd, &compiler, &args).or_else(|_| {
        // no daemon yet: the first wrapper invocation spawns it
        match wrapper::spawn_daemon() {
            Ok(()) => wrapper::run_via_daemon(&socket_path, &cwd, &compiler, &args),
            Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
        }
    });

    match reply {
        Ok((exit_code, stdout, stderr)) => {
            use std::io::Write;
            let _ = std::io::stdout().write_all(&stdout);
            let _ = std::io::stderr().write_all(&stderr);
            std::process::exit(exit_code);
        }
        Err(e) => {
            wrapper::execute_locally(&compiler, &args, &format!("daemon unreachable ({e})"));
        }
    }
}
