use crate::config::types::{LauncherError, Result};
use crate::judge::adapter::LanguageHarness;
use crate::judge::languages::{
    java::JavaHarness, javascript::JavaScriptHarness, python::PythonHarness,
};

pub fn harness_for(language: &str) -> Result<Box<dyn LanguageHarness>> {
    match language.trim().to_ascii_lowercase().as_str() {
        "python" | "py" | "python3" => Ok(Box::new(PythonHarness)),
        "javascript" | "js" | "node" => Ok(Box::new(JavaScriptHarness)),
        "java17" | "java" => Ok(Box::new(JavaHarness)),
        _ => Err(LauncherError::UnsupportedRuntime(language.to_string())),
    }
}
