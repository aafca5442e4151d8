use std::path::Path;

use tabula_db::{MigrationState, MigrationStatus, PlannedMigration, Progress, RunReport};

fn state_label(state: MigrationState) -> &'static str {
    match state {
        MigrationState::Applied => "applied",
        MigrationState::Pending => "pending",
        MigrationState::Modified => "modified",
        MigrationState::Orphaned => "orphaned",
        MigrationState::Draft => "draft",
    }
}

/// Print the status table with a header naming the database.
pub fn print_status(rows: &[MigrationStatus], database: &Path) {
    let db_display = match std::env::var("HOME") {
        Ok(home) if !home.is_empty() => database.to_string_lossy().replace(&home, "~"),
        _ => database.to_string_lossy().to_string(),
    };
    println!("database: {db_display}");
    println!();

    if rows.is_empty() {
        println!("no migrations");
        return;
    }
    for line in status_lines(rows) {
        println!("{line}");
    }

    let pending = rows
        .iter()
        .filter(|r| r.state == MigrationState::Pending)
        .count();
    println!();
    match pending {
        0 => println!("schema is up to date"),
        1 => println!("1 migration pending"),
        n => println!("{n} migrations pending"),
    }
}

fn status_lines(rows: &[MigrationStatus]) -> Vec<String> {
    let name_w = rows
        .iter()
        .map(|r| r.name.len())
        .max()
        .unwrap_or(0)
        .max("name".len());

    let mut lines = vec![format!(
        "{:<9}  {:<14}  {:<name_w$}  {}",
        "state", "version", "name", "applied at"
    )];
    lines.extend(rows.iter().map(|row| {
        let applied = row
            .applied_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "{:<9}  {:<14}  {:<name_w$}  {applied}",
            state_label(row.state),
            row.version.to_string(),
            row.name
        )
    }));
    lines
}

/// One line per committed migration, printed as the run goes so an
/// interrupted run still shows what it finished.
pub fn print_progress(event: Progress<'_>) {
    println!("{}", progress_line(event));
}

fn progress_line(event: Progress<'_>) -> String {
    match event {
        Progress::Applied(m) => format!("applied  {} {}", m.version, m.name),
        Progress::Reverted(m) => format!("reverted {} {}", m.version, m.name),
    }
}

pub fn print_run(report: &RunReport) {
    if report.applied.is_empty() && report.reverted.is_empty() {
        println!("nothing to do");
        return;
    }
    println!("{} operation(s) executed", report.operations);
}

pub fn print_plan(plan: &[PlannedMigration]) {
    if plan.is_empty() {
        println!("-- nothing pending");
        return;
    }
    for migration in plan {
        println!("-- {} {}", migration.version, migration.name);
        for statement in &migration.statements {
            println!("{statement}");
        }
        println!();
    }
}
