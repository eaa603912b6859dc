fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_state_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("sharesync")
}

fn required_var(vars: &dyn Fn(&str) -> Option<String>, name: &str) -> anyhow::Result<String> {
    vars(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .with_context(|| format!("{name} is not set"))
}

fn read_u64_var(vars: &dyn Fn(&str) -> Option<String>, name: &str, default: u64) -> u64 {
    vars(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_var(vars: &dyn Fn(&str) -> Option<String>, name: &str, default: bool) -> bool {
    vars(name)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

/// Comma-separated values; `None` when unset so the default applies. An
/// empty value yields an empty list.
fn read_list_var(vars: &dyn Fn(&str) -> Option<String>, name: &str) -> Option<Vec<String>> {
    vars(name).map(|value| {
        value
            .split(',')
            .map(|item| item.trim().trim_start_matches('.').to_string())
            .filter(|item| !item.is_empty())
            .collect()
    })
}
