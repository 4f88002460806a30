use mc_domain::config::{Config, ConfigSeverity};

/// Validate the config and print every issue.  Returns `false` when any
/// issue is an error.
pub fn validate(config: &Config, config_path: &str) -> bool {
    let mut issues = config.validate();
    let secret_set = std::env::var(&config.auth.secret_env).is_ok_and(|s| !s.is_empty());

    if issues.is_empty() && secret_set {
        println!("Config OK ({config_path})");
        return true;
    }

    issues.sort_by_key(|i| i.severity != ConfigSeverity::Error);
    for issue in &issues {
        println!("{issue}");
    }
    if !secret_set {
        println!(
            "[WARN] auth.secret_env: ${} is not set; client upgrades will be refused",
            config.auth.secret_env
        );
    }

    let errors = issues
        .iter()
        .filter(|i| i.severity == ConfigSeverity::Error)
        .count();
    let warnings = issues.len() - errors + usize::from(!secret_set);
    println!("\n{errors} error(s), {warnings} warning(s) in {config_path}");

    errors == 0
}

/// Print the resolved config, defaults filled in, as TOML.
pub fn show(config: &Config) -> anyhow::Result<()> {
    let output = toml::to_string_pretty(config)?;
    print!("{output}");
    Ok(())
}
