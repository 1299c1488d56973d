//! Generates the `/init` shell script that PID 1 runs inside the guest.
//!
//! The script brackets the program's output between fixed markers and echoes
//! its exit code, so the host side can scrape both from the serial console.

use crate::runtimes::LanguageRuntime;

/// Marks the first line of program output on the console.
pub const OUTPUT_START_MARKER: &str = "--- PROGRAM OUTPUT ---";
/// Marks the end of program output.
pub const OUTPUT_END_MARKER: &str = "--- END OUTPUT ---";
/// Prefix of the line carrying the program's exit code.
pub const EXIT_CODE_PREFIX: &str = "Exit code:";

/// Render the init script for `runtime`, executing the code at `code_path`.
pub fn render(runtime: &dyn LanguageRuntime, code_path: &str) -> String {
    let mut script = String::from("#!/bin/sh\n\n");

    script.push_str("mount -t proc proc /proc\n");
    script.push_str("mount -t sysfs sysfs /sys\n");
    script.push_str("mount -t devtmpfs dev /dev\n\n");

    script.push_str("export PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin\n\n");

    script.push_str("echo '=== Cloude Agent Init ==='\n\n");

    if let Some(compile_cmd) = runtime.compile_command() {
        script.push_str("echo 'Compiling...'\n");
        script.push_str(&format!(
            "{compile_cmd} || {{ echo 'Compilation failed'; sync; exit 1; }}\n"
        ));
        script.push_str("echo 'Compilation successful'\n\n");
    }

    script.push_str(&format!("echo '{OUTPUT_START_MARKER}'\n"));

    let run_cmd = match runtime.execute_path() {
        Some(exec_path) => exec_path.to_string(),
        None => format!("{} {}", runtime.run_command(), code_path),
    };

    script.push_str(&format!("{run_cmd}\n"));
    script.push_str("EXIT_CODE=$?\n");
    script.push_str(&format!("echo '{OUTPUT_END_MARKER}'\n"));
    script.push_str(&format!("echo \"{EXIT_CODE_PREFIX} $EXIT_CODE\"\n\n"));

    script.push_str("sync\n");
    script.push_str("poweroff -f 2>/dev/null || exit $EXIT_CODE\n");

    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtimes::{node::NodeRuntime, python::PythonRuntime, rust::RustRuntime};

    #[test]
    fn python_script_runs_interpreter_directly() {
        let script = render(&PythonRuntime, "/lambda/code.py");
        assert!(script.contains("python3 /lambda/code.py"));
        assert!(!script.contains("Compiling..."));
    }

    #[test]
    fn node_script_runs_interpreter_directly() {
        let script = render(&NodeRuntime, "/lambda/code.js");
        assert!(script.contains("node /lambda/code.js"));
        assert!(!script.contains("Compiling..."));
    }

    #[test]
    fn rust_script_compiles_then_runs_binary() {
        let script = render(&RustRuntime, "/lambda/code.rs");
        assert!(script.contains("rustc -o /lambda/bin /lambda/code.rs"));
        assert!(script.contains("Compiling..."));
        assert!(script.contains("/lambda/bin\n"));
    }

    #[test]
    fn script_brackets_output_with_markers() {
        let script = render(&PythonRuntime, "/lambda/code.py");
        let start = script.find(OUTPUT_START_MARKER).unwrap();
        let end = script.find(OUTPUT_END_MARKER).unwrap();
        assert!(start < end);
        assert!(script.contains("echo \"Exit code: $EXIT_CODE\""));
    }

    #[test]
    fn script_powers_off_at_the_end() {
        let script = render(&PythonRuntime, "/lambda/code.py");
        assert!(script.trim_end().ends_with("poweroff -f 2>/dev/null || exit $EXIT_CODE"));
    }
}
