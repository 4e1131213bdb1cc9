use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, NO_ARG_COMMANDS, RAW_ARG_COMMANDS, SINGLE_PATH_COMMANDS,
};

/// One line of studio input, resolved to an action.
///
/// Free text becomes an `edit` whose `prompt` is the trimmed line.
#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub prompt: Option<String>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            prompt: None,
            command_args: BTreeMap::new(),
        }
    }

    pub fn arg_str(&self, key: &str) -> &str {
        self.command_args
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or("")
    }
}

fn find_spec(command: &str, specs: &'static [CommandSpec]) -> Option<&'static CommandSpec> {
    specs.iter().find(|spec| spec.command == command)
}

fn parse_single_path_arg(arg: &str) -> String {
    if arg.trim().is_empty() {
        return String::new();
    }
    let parts = match shell_words::split(arg) {
        Ok(parts) => parts,
        Err(_) => arg.split_whitespace().map(str::to_string).collect(),
    };
    parts
        .into_iter()
        .filter(|value| !value.is_empty())
        .collect::<Vec<String>>()
        .join(" ")
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let arg = slash_tail[command_len..].trim();

            if let Some(spec) = find_spec(&command, RAW_ARG_COMMANDS) {
                let mut intent = Intent::new(spec.action, text);
                intent
                    .command_args
                    .insert(spec.arg_key.to_string(), Value::String(arg.to_string()));
                return intent;
            }

            if let Some(spec) = find_spec(&command, SINGLE_PATH_COMMANDS) {
                let mut intent = Intent::new(spec.action, text);
                intent.command_args.insert(
                    spec.arg_key.to_string(),
                    Value::String(parse_single_path_arg(arg)),
                );
                return intent;
            }

            if let Some(spec) = find_spec(&command, NO_ARG_COMMANDS) {
                return Intent::new(spec.action, text);
            }

            let mut intent = Intent::new("unknown", text);
            intent
                .command_args
                .insert("command".to_string(), Value::String(command));
            intent
                .command_args
                .insert("arg".to_string(), Value::String(arg.to_string()));
            return intent;
        }
    }

    let mut intent = Intent::new("edit", text);
    intent.prompt = Some(raw_trimmed.to_string());
    intent
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_intent;

    #[test]
    fn free_text_is_an_edit() {
        let intent = parse_intent("  Change background to a marble table  ");
        assert_eq!(intent.action, "edit");
        assert_eq!(
            intent.prompt.as_deref(),
            Some("Change background to a marble table")
        );
    }

    #[test]
    fn blank_line_is_noop() {
        assert_eq!(parse_intent("   ").action, "noop");
    }

    #[test]
    fn upload_accepts_quoted_paths() {
        let intent = parse_intent("/upload \"/tmp/my product.png\"");
        assert_eq!(intent.action, "load_source");
        assert_eq!(intent.command_args["path"], json!("/tmp/my product.png"));
    }

    #[test]
    fn export_path_is_optional() {
        let intent = parse_intent("/export");
        assert_eq!(intent.action, "export");
        assert_eq!(intent.arg_str("path"), "");
    }

    #[test]
    fn preset_and_key_keep_raw_argument() {
        let preset = parse_intent("/preset nobg");
        assert_eq!(preset.action, "apply_preset");
        assert_eq!(preset.arg_str("preset"), "nobg");

        let key = parse_intent("/key  abc-123 ");
        assert_eq!(key.action, "switch_credential");
        assert_eq!(key.arg_str("credential"), "abc-123");

        let cleared = parse_intent("/key");
        assert_eq!(cleared.action, "switch_credential");
        assert_eq!(cleared.arg_str("credential"), "");
    }

    #[test]
    fn no_arg_commands_and_aliases() {
        assert_eq!(parse_intent("/presets").action, "list_presets");
        assert_eq!(parse_intent("/HISTORY").action, "show_history");
        assert_eq!(parse_intent("/models").action, "list_models");
        assert_eq!(parse_intent("/exit").action, "quit");
        assert_eq!(parse_intent("/quit").action, "quit");
    }

    #[test]
    fn parse_unknown_command() {
        let intent = parse_intent("/magic foo bar");
        assert_eq!(intent.action, "unknown");
        assert_eq!(intent.command_args["command"], json!("magic"));
        assert_eq!(intent.command_args["arg"], json!("foo bar"));
    }

    #[test]
    fn bare_slash_is_treated_as_text() {
        let intent = parse_intent("/ make it blue");
        assert_eq!(intent.action, "edit");
        assert_eq!(intent.prompt.as_deref(), Some("/ make it blue"));
    }
}
