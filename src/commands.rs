//! Handlers behind each CLI subcommand.
//!
//! Every handler takes the [`Manager`] for the work and the [`Ui`] for output;
//! nothing here touches Git, SSH or the store directly. `main.rs` maps parsed
//! arguments onto these functions.

use anstyle::AnsiColor;
use anyhow::{Context, Result, bail};
use std::fs;
use std::path::Path;

use crate::doctor;
use crate::manager::Manager;
use crate::platform::{self, PlatformDefinition};
use crate::profiles::{AuthMethod, Profile, ProfileFields, Secret};
use crate::switch::{StepStatus, SwitchOptions, SwitchReport};
use crate::ui::Ui;

/// List all profiles, valid and invalid
pub fn list(manager: &Manager, ui: &Ui) -> Result<()> {
    let loaded = manager.load_profiles()?;
    for warning in &loaded.warnings {
        ui.warn(warning);
    }

    if loaded.config.profiles.is_empty() && loaded.errors.is_empty() {
        ui.warn("No profiles found.");
        ui.newline();
        ui.println("Create one with:");
        ui.println(format!(
            "  {} add <name> --username <user> --email <email>",
            ui.bold("gitprof")
        ));
        return Ok(());
    }

    let current = loaded.config.current.as_deref();
    let mut table = ui.table();
    table.set_header(vec![
        ui.header_cell(""),
        ui.header_cell("Profile"),
        ui.header_cell("Username"),
        ui.header_cell("Email"),
        ui.header_cell("Platform"),
        ui.header_cell("Auth"),
    ]);

    for (name, profile) in &loaded.config.profiles {
        let is_current = current == Some(name.as_str());
        let name_cell = if is_current {
            ui.colored_cell(name, AnsiColor::Green)
        } else {
            ui.cell(name)
        };
        table.add_row(vec![
            ui.cell(ui.current_marker(is_current)),
            name_cell,
            ui.cell(&profile.username),
            ui.cell(&profile.email),
            ui.cell(platform_label(manager, profile)),
            ui.cell(profile.auth_method.as_str()),
        ]);
    }

    for (name, error) in &loaded.errors {
        table.add_row(vec![
            ui.cell(""),
            ui.colored_cell(name, AnsiColor::Red),
            ui.colored_cell(format!("invalid: {}", error), AnsiColor::Red),
            ui.cell("-"),
            ui.cell("-"),
            ui.cell("-"),
        ]);
    }

    ui.section("Profiles");
    ui.println(table.to_string());

    if !loaded.errors.is_empty() {
        ui.newline();
        ui.warn(format!(
            "{} invalid profile(s). Fix them with 'gitprof add <name> --overwrite' or remove them.",
            loaded.errors.len()
        ));
    }

    Ok(())
}

fn platform_label(manager: &Manager, profile: &Profile) -> String {
    let name = manager
        .registry()
        .get(&profile.platform)
        .map(|p| p.name.clone())
        .unwrap_or_else(|| profile.platform.clone());
    match &profile.host {
        Some(host) => format!("{} ({})", name, host),
        None => name,
    }
}

/// Show the current profile
pub fn current(manager: &Manager, ui: &Ui) -> Result<()> {
    let loaded = manager.load_profiles()?;
    for warning in &loaded.warnings {
        ui.warn(warning);
    }

    let Some((name, profile)) = loaded.config.current_profile() else {
        ui.warn("No current profile.");
        ui.println(format!("Activate one with: {} switch <name>", ui.bold("gitprof")));
        return Ok(());
    };

    let token = match &profile.token {
        Some(token) if token.is_encrypted() => "stored (encrypted)",
        Some(_) => "stored (plaintext)",
        None => "none",
    };

    ui.section(format!("Current profile: {}", name));
    ui.field("Username", &profile.username);
    ui.field("Email", &profile.email);
    ui.field("Platform", platform_label(manager, profile));
    ui.field(
        "Host",
        platform::effective_host(profile, manager.registry()),
    );
    ui.field("Auth method", profile.auth_method.as_str());
    ui.field("Token", token);
    ui.field(
        "SSH identity",
        profile.ssh_identity.as_deref().unwrap_or("none"),
    );
    if profile.auth_method == AuthMethod::Ssh {
        ui.field(
            "Host alias",
            platform::host_alias(&profile.platform, name),
        );
    }

    if let Some(repository) = manager.repository() {
        ui.newline();
        ui.section("Repository");
        ui.field(
            "Remote",
            repository.origin.as_deref().unwrap_or("no 'origin' remote"),
        );
        if let Some(protocol) = &repository.protocol {
            ui.field("Protocol", protocol);
        }
    }

    Ok(())
}

/// Options of `gitprof add` that are not profile fields
#[derive(Debug, Clone, Default)]
pub struct AddArgs {
    pub overwrite: bool,
    /// Prompt for the token instead of reading it from the command line
    pub ask_token: bool,
    /// Leave ~/.ssh/gitprof_config alone
    pub skip_ssh_setup: bool,
}

/// Create or update a profile
pub fn add(
    manager: &Manager,
    name: &str,
    mut fields: ProfileFields,
    args: &AddArgs,
    ui: &Ui,
) -> Result<()> {
    if args.ask_token {
        if fields.token.is_some() {
            bail!("Use either --token or --ask-token, not both");
        }
        let token = inquire::Password::new("Access token:")
            .without_confirmation()
            .with_help_message("Stored encrypted unless token storage is disabled")
            .prompt()
            .context("Token prompt cancelled")?;
        fields.token = Some(Secret::new(token));
    }

    let outcome = manager.add_profile(name, fields, args.overwrite, !args.skip_ssh_setup)?;
    if outcome.created {
        ui.ok(format!("Created profile '{}'", name));
    } else {
        ui.ok(format!("Updated profile '{}'", name));
    }
    if outcome.became_current {
        ui.info(format!("'{}' is now the current profile", name));
    }
    for warning in &outcome.warnings {
        ui.warn(warning);
    }

    Ok(())
}

/// Remove a profile, asking for confirmation unless `force`
pub fn remove(manager: &Manager, name: &str, force: bool, no_backup: bool, ui: &Ui) -> Result<()> {
    let loaded = manager.load_profiles()?;
    let exists =
        loaded.config.profiles.contains_key(name) || loaded.config.is_quarantined(name);
    if !exists {
        bail!("Profile '{}' not found", name);
    }

    if !force {
        let help = if no_backup {
            "The profile will be deleted without a backup"
        } else {
            "A backup is written to ~/.gitprof/backups first"
        };
        let confirm = inquire::Confirm::new(&format!("Remove profile '{}'?", name))
            .with_default(false)
            .with_help_message(help)
            .prompt()
            .context("Confirmation cancelled")?;

        if !confirm {
            ui.warn("Removal cancelled.");
            return Ok(());
        }
    }

    let was_current = loaded.config.current.as_deref() == Some(name);
    let outcome = manager.remove_profile(name, no_backup)?;
    for warning in &outcome.warnings {
        ui.warn(warning);
    }
    ui.ok(format!("Removed profile '{}'", name));
    if let Some(path) = outcome.backup {
        ui.info(format!("Backup written to {}", path.display()));
    }
    if was_current {
        ui.warn("No profile is current now. Run 'gitprof switch <name>' to pick one.");
    }

    Ok(())
}

/// Switch to a profile
pub fn switch(manager: &Manager, name: &str, options: &SwitchOptions, ui: &Ui) -> Result<()> {
    let spinner = ui.spinner(format!("Switching to profile '{}'...", name));

    // The error itself is printed once, by main
    let report = manager.switch_to(name, options).inspect_err(|_| spinner.finish_and_clear())?;

    if report.dry_run {
        spinner.finish_and_clear();
        print_load_warnings(&report, ui);
        print_plan(&report, ui);
        return Ok(());
    }

    let warnings = report.warnings().count();
    let summary = format!(
        "Active profile: {} ({}, {})",
        report.profile, report.platform, report.auth_method
    );
    ui.spinner_finish_ok(&spinner, summary);
    print_load_warnings(&report, ui);
    print_steps(&report, ui);

    if warnings > 0 {
        ui.newline();
        ui.warn(format!(
            "Switched with {} warning(s); run 'gitprof doctor' for details",
            warnings
        ));
    }

    Ok(())
}

fn print_load_warnings(report: &SwitchReport, ui: &Ui) {
    for warning in &report.load_warnings {
        ui.warn(warning);
    }
}

fn print_plan(report: &SwitchReport, ui: &Ui) {
    ui.section(format!(
        "Dry run: switching to '{}' ({}) would",
        report.profile, report.platform
    ));
    for action in &report.planned {
        ui.println(format!("  {} {}", ui.icon_info(), action));
    }
    ui.println(ui.dim("No changes were made."));
}

fn print_steps(report: &SwitchReport, ui: &Ui) {
    for step in &report.steps {
        let icon = match step.status {
            StepStatus::Applied => ui.icon_ok(),
            StepStatus::Unchanged | StepStatus::Skipped => ui.icon_info(),
            StepStatus::Warning => ui.icon_warn(),
        };
        let detail = match step.status {
            StepStatus::Skipped | StepStatus::Unchanged => ui.dim(&step.detail),
            StepStatus::Warning => ui.colored(&step.detail, AnsiColor::Yellow),
            StepStatus::Applied => step.detail.clone(),
        };
        ui.println(format!("  {} {}: {}", icon, step.step, detail));
    }
}

/// List built-in and custom platforms
pub fn platforms_list(manager: &Manager, ui: &Ui) -> Result<()> {
    let mut table = ui.table();
    table.set_header(vec![
        ui.header_cell("ID"),
        ui.header_cell("Name"),
        ui.header_cell("Default host"),
        ui.header_cell("SSH prefix"),
        ui.header_cell("Source"),
    ]);

    for platform in manager.list_platforms() {
        let source = if platform.custom {
            ui.colored_cell("custom", AnsiColor::Cyan)
        } else {
            ui.cell("built-in")
        };
        table.add_row(vec![
            ui.cell(&platform.id),
            ui.cell(&platform.name),
            ui.cell(&platform.default_host),
            ui.cell(&platform.ssh_prefix),
            source,
        ]);
    }

    ui.section("Platforms");
    ui.println(table.to_string());
    ui.println(ui.dim(format!(
        "Custom platforms are read from {}",
        manager.paths().platforms_file.display()
    )));

    Ok(())
}

/// Register (or with `force`, replace) a custom platform
pub fn platforms_register(
    manager: &mut Manager,
    id: &str,
    definition: PlatformDefinition,
    force: bool,
    ui: &Ui,
) -> Result<()> {
    let platform = manager.register_platform(id, definition, force)?;
    ui.ok(format!(
        "Registered platform '{}' ({})",
        platform.id, platform.name
    ));
    ui.field("Default host", &platform.default_host);
    ui.field("SSH prefix", &platform.ssh_prefix);
    ui.field("HTTPS prefix", &platform.https_prefix);
    Ok(())
}

/// Register a custom platform from a YAML definition file
///
/// `id` overrides an `id` given in the file.
pub fn platforms_register_yaml(
    manager: &mut Manager,
    file: &Path,
    id: Option<&str>,
    force: bool,
    ui: &Ui,
) -> Result<()> {
    let content = fs::read_to_string(file)
        .with_context(|| format!("Failed to read platform file: {}", file.display()))?;
    let (id, definition) = platform::parse_definition(&content, id)
        .with_context(|| format!("Invalid platform file: {}", file.display()))?;
    platforms_register(manager, &id, definition, force, ui)
}

/// Run diagnostics, as a report or as JSON
pub fn doctor(manager: &Manager, json: bool, ui: &Ui) -> Result<()> {
    let diagnosis = manager.diagnose()?;
    if json {
        let out =
            serde_json::to_string_pretty(&diagnosis).context("Failed to serialize diagnosis")?;
        ui.println(out);
    } else {
        doctor::render(&diagnosis, ui);
    }
    Ok(())
}
