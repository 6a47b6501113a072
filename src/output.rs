use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;

use crate::error::Result;
use crate::validate::ValidationReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Json,
    Pretty,
    Minimal,
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

/// Render the roles list the way pretty output shows it.
pub fn roles_inline(roles: &[String]) -> String {
    if roles.is_empty() {
        "[]".to_string()
    } else {
        format!("[{}]", roles.join(", "))
    }
}

pub fn print_validation(title: &str, report: &ValidationReport) {
    let badge = if report.ok {
        "ok".green().to_string()
    } else {
        "FAILED".red().bold().to_string()
    };
    println!("{} {}", title.bold(), badge);
    for issue in &report.issues {
        println!("  - {}", issue.red());
    }
    for warning in &report.warnings {
        println!("  - {}", warning.yellow());
    }
}

pub fn print_warnings(warnings: &[String]) {
    if warnings.is_empty() {
        return;
    }
    println!("\n{}", "Warnings".yellow().bold());
    for warning in warnings {
        println!("  - {}", warning.yellow());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_inline_formats_lists() {
        assert_eq!(roles_inline(&[]), "[]");
        assert_eq!(
            roles_inline(&["admin".to_string(), "hr".to_string()]),
            "[admin, hr]"
        );
    }
}
