// Server settings - renders per-instance config files from {{VAR}} templates

use super::ServerError;
use crate::settings::Settings;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;

pub const SERVER_SETTINGS_FILE: &str = "server-settings.json";
pub const WHITELIST_FILE: &str = "server-whitelist.json";

/// Replace `{{name}}` placeholders with values from `variables`.
/// Placeholders without a value are left as they are.
pub fn render_template(
    template: &str,
    variables: &HashMap<String, String>,
) -> Result<String, ServerError> {
    let re = Regex::new(r"\{\{\s*(\w+)\s*\}\}").map_err(|e| ServerError::Template(e.to_string()))?;

    let rendered = re.replace_all(template, |caps: &regex::Captures| {
        let name = &caps[1];
        match variables.get(name) {
            Some(value) => value.clone(),
            None => {
                tracing::debug!("No value for template variable {}", name);
                caps[0].to_string()
            }
        }
    });

    Ok(rendered.into_owned())
}

/// Variables available to the server settings template
pub fn server_variables(name: &str, settings: &Settings) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    vars.insert("servername".to_string(), name.to_string());
    vars.insert("username".to_string(), settings.username.clone());
    vars.insert("token".to_string(), settings.token.clone());
    vars
}

/// Write `server-settings.json` into `server_dir` from the template, unless one exists.
/// Returns Ok(true) if the file was written.
pub fn write_server_settings(
    server_dir: &Path,
    template_path: &Path,
    variables: &HashMap<String, String>,
) -> Result<bool, ServerError> {
    let target = server_dir.join(SERVER_SETTINGS_FILE);
    if target.exists() {
        tracing::debug!("Keeping existing {:?}", target);
        return Ok(false);
    }

    let template = std::fs::read_to_string(template_path).map_err(|e| {
        ServerError::Template(format!(
            "Failed to read template {:?}: {}",
            template_path, e
        ))
    })?;
    let rendered = render_template(&template, variables)?;

    // Values are substituted raw, so a stray quote in a name breaks the file
    serde_json::from_str::<serde_json::Value>(&rendered).map_err(|e| {
        ServerError::Template(format!(
            "Rendered {} is not valid JSON: {}",
            SERVER_SETTINGS_FILE, e
        ))
    })?;

    std::fs::write(&target, rendered)?;
    tracing::info!("Created server settings: {:?}", target);
    Ok(true)
}

/// Overwrite the instance whitelist with `players`
pub fn write_whitelist(server_dir: &Path, players: &[String]) -> Result<(), ServerError> {
    let target = server_dir.join(WHITELIST_FILE);
    let json = serde_json::to_string_pretty(players)
        .map_err(|e| ServerError::Template(e.to_string()))?;
    std::fs::write(&target, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("servername".to_string(), "alpha".to_string());
        vars.insert("username".to_string(), "engineer".to_string());
        vars
    }

    #[test]
    fn test_render_template() {
        let out = render_template(r#"{"name": "{{servername}}", "user": "{{ username }}"}"#, &vars())
            .unwrap();
        assert_eq!(out, r#"{"name": "alpha", "user": "engineer"}"#);
    }

    #[test]
    fn test_unknown_placeholder_untouched() {
        let out = render_template("token={{token}}", &vars()).unwrap();
        assert_eq!(out, "token={{token}}");
    }

    #[test]
    fn test_write_server_settings_only_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("server-settings.jj");
        std::fs::write(&template, r#"{"name": "{{servername}}", "visibility": {"public": false}}"#)
            .unwrap();

        let server = dir.path().join("alpha");
        std::fs::create_dir(&server).unwrap();

        assert!(write_server_settings(&server, &template, &vars()).unwrap());
        let written = std::fs::read_to_string(server.join(SERVER_SETTINGS_FILE)).unwrap();
        assert!(written.contains(r#""name": "alpha""#));

        std::fs::write(server.join(SERVER_SETTINGS_FILE), "{}").unwrap();
        assert!(!write_server_settings(&server, &template, &vars()).unwrap());
        assert_eq!(
            std::fs::read_to_string(server.join(SERVER_SETTINGS_FILE)).unwrap(),
            "{}"
        );
    }

    #[test]
    fn test_invalid_rendered_json_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("server-settings.jj");
        std::fs::write(&template, r#"{"name": {{servername}}}"#).unwrap();

        let result = write_server_settings(dir.path(), &template, &vars());
        assert!(matches!(result, Err(ServerError::Template(_))));
        assert!(!dir.path().join(SERVER_SETTINGS_FILE).exists());
    }

    #[test]
    fn test_write_whitelist() {
        let dir = tempfile::tempdir().unwrap();
        write_whitelist(dir.path(), &["alice".to_string(), "bob".to_string()]).unwrap();
        let content = std::fs::read_to_string(dir.path().join(WHITELIST_FILE)).unwrap();
        let players: Vec<String> = serde_json::from_str(&content).unwrap();
        assert_eq!(players, vec!["alice", "bob"]);
    }
}
