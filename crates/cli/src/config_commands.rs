use std::path::Path;

use {anyhow::Result, clap::Subcommand};

use brainproxy_config::{Diagnostic, Severity, ValidationResult, load_or_discover, to_toml, validate};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML, secrets redacted.
    Show,
    /// Check the configuration and list problems; exits non-zero on errors.
    Validate {
        /// Also list informational notes.
        #[arg(long)]
        verbose: bool,
    },
}

pub fn handle_config(action: ConfigAction, path: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_or_discover(path)?;
            print!("{}", to_toml(&config.redacted())?);
            Ok(())
        },
        ConfigAction::Validate { verbose } => {
            let result = validate::validate(path);
            print_report(&result, verbose);
            if result.has_errors() {
                std::process::exit(1);
            }
            Ok(())
        },
    }
}

fn print_report(result: &ValidationResult, verbose: bool) {
    match &result.config_path {
        Some(path) => eprintln!("config: {}", path.display()),
        None => eprintln!("config: <defaults>"),
    }

    let listed: Vec<&Diagnostic> = result
        .diagnostics
        .iter()
        .filter(|d| verbose || d.severity != Severity::Info)
        .collect();
    for d in &listed {
        eprintln!("{}", format_line(d));
    }

    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);
    if errors + warnings == 0 {
        eprintln!("ok");
    } else {
        eprintln!("{errors} error(s), {warnings} warning(s)");
    }
}

fn format_line(d: &Diagnostic) -> String {
    let level = match d.severity {
        Severity::Error => "ERROR",
        Severity::Warning => "WARN ",
        Severity::Info => "INFO ",
    };
    let location = if d.path.is_empty() { "-" } else { d.path.as_str() };
    format!("{level} {location} ({}): {}", d.category, d.message)
}
