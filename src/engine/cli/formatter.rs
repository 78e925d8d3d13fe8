//! CLI Output Formatting Module
//! Colorized terminal output for the update commands

use colored::Colorize;

use crate::engine::updater::{InstalledBundle, UpdateOffer};

pub struct CliFormatter;

impl CliFormatter {
    pub fn success(message: &str) {
        println!("{} {}", "✓".green().bold(), message);
    }

    pub fn error(message: &str) {
        eprintln!("{} {}", "✗".red().bold(), message);
    }

    pub fn warning(message: &str) {
        println!("{} {}", "⚠".yellow().bold(), message);
    }

    pub fn info(message: &str) {
        println!("{} {}", "ℹ".blue().bold(), message);
    }

    /// Print a section header
    pub fn header(title: &str) {
        println!("\n{}", title.bright_cyan().bold());
        println!("{}", "─".repeat(title.chars().count()).bright_black());
    }

    /// Print a key-value pair
    pub fn kv(key: &str, value: &str) {
        println!("  {}: {}", key.bright_white().bold(), value);
    }

    /// Redraw a single-line download bar. `total` of 0 means unknown.
    pub fn download_progress(downloaded: u64, total: u64) {
        if total == 0 {
            print!("\r  {} {}", "▶".bright_blue(), format_size(downloaded));
        } else {
            let percentage = (downloaded.min(total) * 100 / total) as u32;
            let filled = percentage / 5;
            let bar: String = (0..20)
                .map(|i| {
                    if i < filled {
                        "█".bright_green().to_string()
                    } else {
                        "░".bright_black().to_string()
                    }
                })
                .collect();
            print!(
                "\r  [{}] {:>3}% {} / {}",
                bar,
                percentage,
                format_size(downloaded),
                format_size(total)
            );
        }
        std::io::Write::flush(&mut std::io::stdout()).ok();
    }

    pub fn offer(offer: &UpdateOffer) {
        Self::header(&format!("Update {}", offer.display_name()));
        Self::kv("Version", &offer.version);
        if !offer.description.is_empty() {
            Self::kv("Description", &offer.description);
        }
        Self::kv("Mandatory", if offer.is_mandatory { "yes" } else { "no" });
        Self::kv(
            "Signed",
            if offer.has_signature() { "yes" } else { "no" },
        );
    }

    pub fn bundle(bundle: &InstalledBundle) {
        Self::kv("Version", &bundle.version);
        Self::kv("Path", &bundle.local_path.display().to_string());
        if let Some(assets) = &bundle.assets_path {
            Self::kv("Assets", &assets.display().to_string());
        }
        Self::kv("Installed", &bundle.installed_at.to_rfc3339());
        Self::kv("SHA-256", &bundle.sha256);
    }
}

/// Format file size in human-readable format
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}
