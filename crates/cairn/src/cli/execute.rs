//! Command execution logic.
//!
//! This module contains the implementation of all CLI commands.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;

use super::args::{
    AddArgs, BlockedArgs, DeleteArgs, DepAction, DepArgs, InitArgs, ListArgs, ReadyArgs,
    RollbackArgs, StatusArgs, SyncArgs,
};
use crate::app::{self, Workspace};
use crate::domain::{IssueFilter, IssueId, IssueNumber, IssueStatus, IssueUpdate, NewIssue};
use crate::output::{self, BlockedRow, OutputMode};
use crate::store::{issues, Migrator};
use crate::sync::CancelToken;

/// Execute the init command
pub async fn execute_init(args: &InitArgs) -> Result<()> {
    use crate::commands::init;

    let current_dir = std::env::current_dir()?;
    let result = init::init(&current_dir, args.project.as_deref()).await?;

    if !args.quiet {
        println!("Initialized cairn in {}", result.cairn_dir.display());
        println!("  Config:  {}", result.config_file.display());
        println!("  Issues:  {}", result.sync_file.display());
        println!("  Project: {}", result.project);
    }

    Ok(())
}

/// Bring the flat file up to date after a store mutation.
async fn mirror(workspace: &Workspace, output_mode: OutputMode) -> Result<()> {
    let report = workspace.engine().run_pass().await?;
    if output_mode == OutputMode::Text && !report.conflicts.is_empty() {
        eprintln!(
            "warning: {} sync conflict(s) pending; run 'cairn sync' to review",
            report.conflicts.len()
        );
    }
    Ok(())
}

/// Execute the add command
pub async fn execute_add(
    workspace: &Workspace,
    args: &AddArgs,
    output_mode: OutputMode,
    sync: bool,
) -> Result<()> {
    let mut new = NewIssue::new(
        workspace.project().clone(),
        args.title.clone(),
        args.author
            .clone()
            .unwrap_or_else(|| workspace.config().sync.default_author.clone()),
    );
    new.description = args.description.clone();
    new.priority = args.priority;
    new.status = args.status;
    new.assigned_to = args.assignee.clone();

    let mut depends_on = Vec::with_capacity(args.deps.len());
    for number in &args.deps {
        depends_on.push(workspace.resolve(*number).await?.id);
    }

    let issue = {
        let conn = workspace.pool().acquire().await?;
        issues::create_issue(&conn, new)?
    };
    for dep in depends_on {
        workspace
            .graph()
            .add_dependency(issue.id, dep)
            .await
            .with_context(|| format!("issue {} was created without this dependency", issue.number))?;
    }

    if sync {
        mirror(workspace, output_mode).await?;
    }

    match output_mode {
        OutputMode::Json => output::print_json(&issue)?,
        OutputMode::Text => println!("Created issue {}: {}", issue.number, issue.title),
    }
    Ok(())
}

/// Execute the list command
pub async fn execute_list(
    workspace: &Workspace,
    args: &ListArgs,
    output_mode: OutputMode,
) -> Result<()> {
    let filter = IssueFilter {
        project_id: Some(workspace.project().clone()),
        status: args.status,
        priority: args.priority,
        assigned_to: args.assignee.clone(),
    };
    let conn = workspace.pool().acquire().await?;
    let found = issues::list_issues(&conn, &filter)?;
    drop(conn);

    output::print_issues(&found, output_mode)?;
    Ok(())
}

/// Execute the status command
pub async fn execute_status(
    workspace: &Workspace,
    args: &StatusArgs,
    output_mode: OutputMode,
    sync: bool,
) -> Result<()> {
    let issue = workspace.resolve(args.issue).await?;
    let update = IssueUpdate {
        status: Some(args.status),
        ..IssueUpdate::default()
    };

    let updated = {
        let mut conn = workspace.pool().acquire().await?;
        conn.transaction(|tx| issues::update_issue(tx, issue.id, &update))?
    };

    if sync {
        mirror(workspace, output_mode).await?;
    }

    match output_mode {
        OutputMode::Json => output::print_json(&updated)?,
        OutputMode::Text => println!("{} is now {}", updated.number, updated.status),
    }
    Ok(())
}

/// Execute the delete command
pub async fn execute_delete(
    workspace: &Workspace,
    args: &DeleteArgs,
    output_mode: OutputMode,
    sync: bool,
) -> Result<()> {
    let issue = workspace.resolve(args.issue).await?;
    let dependents = workspace.graph().delete_issue(issue.id, args.force).await?;

    if sync {
        mirror(workspace, output_mode).await?;
    }

    match output_mode {
        OutputMode::Json => output::print_json(&serde_json::json!({
            "deleted": issue.number.0,
            "orphaned_dependents": dependents.iter().map(|id| id.0).collect::<Vec<_>>(),
        }))?,
        OutputMode::Text => {
            println!("Deleted issue {}: {}", issue.number, issue.title);
            if !dependents.is_empty() {
                println!("  {} dependent issue(s) lost this dependency", dependents.len());
            }
        }
    }
    Ok(())
}

/// Execute the dep command
pub async fn execute_dep(
    workspace: &Workspace,
    args: &DepArgs,
    output_mode: OutputMode,
    sync: bool,
) -> Result<()> {
    let (issue, depends_on, adding) = match &args.action {
        DepAction::Add { issue, depends_on } => (*issue, *depends_on, true),
        DepAction::Rm { issue, depends_on } => (*issue, *depends_on, false),
    };
    let from = workspace.resolve(issue).await?;
    let to = workspace.resolve(depends_on).await?;

    let changed = if adding {
        workspace.graph().add_dependency(from.id, to.id).await?
    } else {
        workspace.graph().remove_dependency(from.id, to.id).await?
    };

    if sync && changed {
        mirror(workspace, output_mode).await?;
    }

    match output_mode {
        OutputMode::Json => output::print_json(&serde_json::json!({
            "issue": issue.0,
            "depends_on": depends_on.0,
            "action": if adding { "add" } else { "rm" },
            "changed": changed,
        }))?,
        OutputMode::Text => match (adding, changed) {
            (true, true) => println!("{issue} now depends on {depends_on}"),
            (true, false) => println!("{issue} already depends on {depends_on}"),
            (false, true) => println!("{issue} no longer depends on {depends_on}"),
            (false, false) => println!("{issue} did not depend on {depends_on}"),
        },
    }
    Ok(())
}

/// Execute the ready command
pub async fn execute_ready(
    workspace: &Workspace,
    args: &ReadyArgs,
    output_mode: OutputMode,
) -> Result<()> {
    let filter = IssueFilter {
        project_id: Some(workspace.project().clone()),
        status: None,
        priority: args.priority,
        assigned_to: args.assignee.clone(),
    };
    let mut ready = workspace.graph().compute_ready_set(&filter).await?;
    if !args.all {
        ready.retain(|issue| issue.status != IssueStatus::Completed);
    }

    output::print_issues(&ready, output_mode)?;
    Ok(())
}

/// Execute the blocked command
pub async fn execute_blocked(
    workspace: &Workspace,
    args: &BlockedArgs,
    output_mode: OutputMode,
) -> Result<()> {
    let filter = IssueFilter {
        project_id: Some(workspace.project().clone()),
        assigned_to: args.assignee.clone(),
        ..IssueFilter::default()
    };
    let blocked = workspace.graph().compute_blocked_set(&filter).await?;

    let numbers: HashMap<IssueId, IssueNumber> = {
        let conn = workspace.pool().acquire().await?;
        issues::list_issues(&conn, &IssueFilter::project(workspace.project().clone()))?
            .into_iter()
            .map(|issue| (issue.id, issue.number))
            .collect()
    };

    let rows: Vec<BlockedRow> = blocked
        .into_iter()
        .map(|entry| {
            let blockers = entry
                .blockers
                .iter()
                .filter_map(|id| numbers.get(id).copied())
                .collect();
            (entry.issue, blockers)
        })
        .collect();

    output::print_blocked(&rows, output_mode)?;
    Ok(())
}

/// Execute the migrate command
pub async fn execute_migrate(output_mode: OutputMode) -> Result<()> {
    let (root, config) = app::locate(&std::env::current_dir()?).await?;
    let pool = app::open_pool(&root, &config)?;
    let mut conn = pool.acquire().await?;

    let migrator = Migrator::builtin();
    let applied = migrator.apply(&mut conn)?;
    let current = Migrator::current_version(&conn)?;

    match output_mode {
        OutputMode::Json => output::print_json(&serde_json::json!({
            "applied": applied,
            "current_version": current,
        }))?,
        OutputMode::Text if applied.is_empty() => {
            println!("Schema is up to date at version {current}");
        }
        OutputMode::Text => println!(
            "Applied {} migration(s); schema is at version {current}",
            applied.len()
        ),
    }
    Ok(())
}

/// Execute the rollback command
pub async fn execute_rollback(args: &RollbackArgs, output_mode: OutputMode) -> Result<()> {
    let (root, config) = app::locate(&std::env::current_dir()?).await?;
    let pool = app::open_pool(&root, &config)?;
    let mut conn = pool.acquire().await?;

    let rolled_back = Migrator::builtin().rollback(&mut conn, args.target)?;
    let current = Migrator::current_version(&conn)?;

    match output_mode {
        OutputMode::Json => output::print_json(&serde_json::json!({
            "rolled_back": rolled_back,
            "current_version": current,
        }))?,
        OutputMode::Text => println!(
            "Rolled back {} migration(s); schema is at version {current}",
            rolled_back.len()
        ),
    }
    Ok(())
}

/// Execute the history command
pub async fn execute_history(output_mode: OutputMode) -> Result<()> {
    let (root, config) = app::locate(&std::env::current_dir()?).await?;
    let pool = app::open_pool(&root, &config)?;
    let conn = pool.acquire().await?;

    let history = Migrator::builtin().verify(&conn)?;
    output::print_history(&history, output_mode)?;
    Ok(())
}

/// Execute the sync command
pub async fn execute_sync(
    workspace: &Workspace,
    args: &SyncArgs,
    output_mode: OutputMode,
) -> Result<()> {
    let engine = workspace.engine();
    let policy = args.policy.unwrap_or(engine.settings().policy);
    let report = engine.run_pass_with(policy, &CancelToken::new()).await?;

    output::print_report(&report, output_mode)?;
    if args.strict {
        report.ensure_no_conflicts()?;
        if !report.parse_errors.is_empty() {
            bail!("{} block(s) of the issue file failed to parse", report.parse_errors.len());
        }
    }
    Ok(())
}

/// Execute the watch command
pub async fn execute_watch(workspace: &Workspace) -> Result<()> {
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Cannot listen for Ctrl-C; stop the process to end watching");
            std::future::pending::<()>().await;
        }
    };

    println!(
        "Watching {} (Ctrl-C to stop)",
        workspace.engine().settings().file.display()
    );
    let stats = workspace.watch(shutdown).await?;
    println!(
        "Stopped after {} pass(es) ({} failed) for {} change event(s)",
        stats.passes, stats.failed_passes, stats.events
    );
    Ok(())
}
