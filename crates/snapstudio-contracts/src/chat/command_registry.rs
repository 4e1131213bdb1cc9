#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
    pub arg_key: &'static str,
}

pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "preset",
        action: "apply_preset",
        arg_key: "preset",
    },
    CommandSpec {
        command: "key",
        action: "switch_credential",
        arg_key: "credential",
    },
];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "upload",
        action: "load_source",
        arg_key: "path",
    },
    CommandSpec {
        command: "export",
        action: "export",
        arg_key: "path",
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "presets",
        action: "list_presets",
        arg_key: "",
    },
    CommandSpec {
        command: "history",
        action: "show_history",
        arg_key: "",
    },
    CommandSpec {
        command: "models",
        action: "list_models",
        arg_key: "",
    },
    CommandSpec {
        command: "help",
        action: "help",
        arg_key: "",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
        arg_key: "",
    },
    CommandSpec {
        command: "exit",
        action: "quit",
        arg_key: "",
    },
];

pub const STUDIO_HELP_COMMANDS: &[&str] = &[
    "/upload <path>",
    "/preset <id>",
    "/presets",
    "/history",
    "/export [path]",
    "/key [credential]",
    "/models",
    "/help",
    "/quit",
];
