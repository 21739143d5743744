use crate::judge::adapter::LanguageHarness;

/// Submissions are complete `Main` classes reading stdin themselves; they run
/// through the single-file source launcher, so nothing is compiled into the
/// read-only workspace.
#[derive(Debug, Clone, Default)]
pub struct JavaHarness;

impl LanguageHarness for JavaHarness {
    fn runtime_id(&self) -> &'static str {
        "java17"
    }

    fn source_file(&self) -> &'static str {
        "Main.java"
    }

    fn wrap(&self, code: &str) -> String {
        code.to_string()
    }

    fn run_command(&self, workdir: &str) -> Vec<String> {
        vec![
            "java".to_string(),
            "-XX:+UseSerialGC".to_string(),
            format!("{}/{}", workdir.trim_end_matches('/'), self.source_file()),
        ]
    }
}
