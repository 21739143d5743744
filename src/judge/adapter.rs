/// Language harness contract: how a submitted solution is wrapped and started.
pub trait LanguageHarness: Send + Sync {
    /// Canonical runtime identifier in the image table
    fn runtime_id(&self) -> &'static str;

    /// File name the wrapped source is written to
    fn source_file(&self) -> &'static str;

    /// Complete program text for `code`
    fn wrap(&self, code: &str) -> String;

    /// Command line, with `workdir` being the mount point inside the container
    fn run_command(&self, workdir: &str) -> Vec<String>;
}
