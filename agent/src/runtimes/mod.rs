pub mod node;
pub mod python;
pub mod rust;

use std::path::Path;

/// How a guest language runtime compiles and runs the injected code.
///
/// The code is always placed at `/lambda/code.<ext>` inside the initramfs.
pub trait LanguageRuntime {
    /// Command that runs the code file, for interpreted runtimes.
    fn run_command(&self) -> &'static str;

    /// File extension this runtime claims.
    fn source_extension(&self) -> &'static str;

    /// Compile step executed before running, if the runtime needs one.
    fn compile_command(&self) -> Option<&'static str> {
        None
    }

    /// Path of the compiled artifact to execute instead of
    /// `run_command() <code>`.
    fn execute_path(&self) -> Option<&'static str> {
        None
    }
}

/// Pick a runtime from the code file's extension.
pub fn detect_runtime<P: AsRef<Path>>(path: P) -> Option<Box<dyn LanguageRuntime>> {
    let ext = path.as_ref().extension()?.to_str()?;
    match ext {
        "py" => Some(Box::new(python::PythonRuntime)),
        "js" => Some(Box::new(node::NodeRuntime)),
        "rs" => Some(Box::new(rust::RustRuntime)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_runtime_by_extension() {
        assert_eq!(detect_runtime("code.py").unwrap().source_extension(), "py");
        assert_eq!(detect_runtime("code.js").unwrap().source_extension(), "js");
        assert_eq!(detect_runtime("code.rs").unwrap().source_extension(), "rs");
    }

    #[test]
    fn unknown_extension_is_rejected() {
        assert!(detect_runtime("code.rb").is_none());
        assert!(detect_runtime("no_extension").is_none());
    }
}
