use crate::judge::adapter::LanguageHarness;

#[derive(Debug, Clone, Default)]
pub struct PythonHarness;

impl LanguageHarness for PythonHarness {
    fn runtime_id(&self) -> &'static str {
        "python"
    }

    fn source_file(&self) -> &'static str {
        "main.py"
    }

    fn wrap(&self, code: &str) -> String {
        format!(
            r#"import json, sys, time

{code}

start = time.time()
args = json.loads(sys.stdin.read())
result = solution(*args)
print(json.dumps(result))
print("TIME_MS=" + str(int((time.time() - start) * 1000)))
"#
        )
    }

    fn run_command(&self, workdir: &str) -> Vec<String> {
        vec![
            "python3".to_string(),
            // The workspace is mounted read-only
            "-B".to_string(),
            format!("{}/{}", workdir.trim_end_matches('/'), self.source_file()),
        ]
    }
}
