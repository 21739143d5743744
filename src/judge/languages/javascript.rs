use crate::judge::adapter::LanguageHarness;

#[derive(Debug, Clone, Default)]
pub struct JavaScriptHarness;

impl LanguageHarness for JavaScriptHarness {
    fn runtime_id(&self) -> &'static str {
        "javascript"
    }

    fn source_file(&self) -> &'static str {
        "main.js"
    }

    fn wrap(&self, code: &str) -> String {
        format!(
            r#"{code}

const fs = require("fs");
const input = fs.readFileSync(0, "utf8").trim();
const args = JSON.parse(input);

const start = Date.now();
const result = solution(...args);
console.log(JSON.stringify(result));
console.log("TIME_MS=" + (Date.now() - start));
"#
        )
    }

    fn run_command(&self, workdir: &str) -> Vec<String> {
        vec![
            "node".to_string(),
            format!("{}/{}", workdir.trim_end_matches('/'), self.source_file()),
        ]
    }
}
