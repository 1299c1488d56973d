use super::LanguageRuntime;

pub struct NodeRuntime;

impl LanguageRuntime for NodeRuntime {
    fn run_command(&self) -> &'static str {
        "node"
    }

    fn source_extension(&self) -> &'static str {
        "js"
    }
}
