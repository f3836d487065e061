//! Built-in schema migrations for the cairn store.

use super::migrate::Migration;

const ISSUES_UP: &str = r"
CREATE TABLE issues (
    id INTEGER PRIMARY KEY,
    project_id TEXT NOT NULL,
    issue_number INTEGER NOT NULL CHECK (issue_number > 0),
    title TEXT NOT NULL CHECK (length(trim(title)) > 0),
    description TEXT,
    status TEXT NOT NULL CHECK (status IN ('open', 'in_progress', 'blocked', 'completed')),
    priority TEXT NOT NULL CHECK (priority IN ('low', 'medium', 'high', 'critical')),
    created_by TEXT NOT NULL,
    assigned_to TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT,
    UNIQUE (project_id, issue_number)
);
";

const ISSUES_DOWN: &str = "DROP TABLE issues;";

// Edge direction: issue_id depends on depends_on_id.
const DEPENDENCIES_UP: &str = r"
CREATE TABLE dependencies (
    issue_id INTEGER NOT NULL REFERENCES issues(id) ON DELETE CASCADE,
    depends_on_id INTEGER NOT NULL REFERENCES issues(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL,
    PRIMARY KEY (issue_id, depends_on_id),
    CHECK (issue_id <> depends_on_id)
);
";

const DEPENDENCIES_DOWN: &str = "DROP TABLE dependencies;";

const INDEXES_UP: &str = r"
CREATE INDEX idx_issues_project_status ON issues(project_id, status);
CREATE INDEX idx_dependencies_depends_on ON dependencies(depends_on_id);
";

const INDEXES_DOWN: &str = r"
DROP INDEX idx_dependencies_depends_on;
DROP INDEX idx_issues_project_status;
";

/// The migrations every cairn store runs, in version order.
#[must_use]
pub fn builtin_migrations() -> Vec<Migration> {
    vec![
        Migration::new(1, "create issues table", ISSUES_UP, ISSUES_DOWN),
        Migration::new(2, "create dependencies table", DEPENDENCIES_UP, DEPENDENCIES_DOWN),
        Migration::new(3, "index issue status and reverse dependencies", INDEXES_UP, INDEXES_DOWN),
    ]
}
