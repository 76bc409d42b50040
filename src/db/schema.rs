use rusqlite::Connection;

use crate::error::Result;

/// Version stamped into `PRAGMA user_version` once every step has run.
pub const SCHEMA_VERSION: i64 = 2;

const INITIAL_SCHEMA: &str = r#"
-- posts table
CREATE TABLE IF NOT EXISTS posts (
    id INTEGER PRIMARY KEY NOT NULL,
    title TEXT,
    content TEXT NOT NULL,
    created_at TEXT DEFAULT (datetime('now'))
);

-- users table
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY NOT NULL,
    name TEXT NOT NULL
);

-- posts_likes table (row existence means liked)
CREATE TABLE IF NOT EXISTS posts_likes (
    post_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    PRIMARY KEY (post_id, user_id)
);
"#;

const SEED_POSTS: [(&str, &str); 2] = [
    ("hello", "Initial content for post 1"),
    ("world", "Initial content for post 2"),
];

const SEED_USERS: [&str; 2] = ["Steven Universo", "Pearl"];

const POST_COUNTERS: &str = r#"
ALTER TABLE posts ADD COLUMN likes_count INTEGER DEFAULT 0;
ALTER TABLE posts ADD COLUMN comments_count INTEGER DEFAULT 0;
"#;

struct MigrationStep {
    /// The exact version this step upgrades from.
    from: i64,
    name: &'static str,
    apply: fn(&Connection) -> rusqlite::Result<()>,
}

const STEPS: &[MigrationStep] = &[
    MigrationStep {
        from: 0,
        name: "initial_schema",
        apply: initial_schema,
    },
    MigrationStep {
        from: 1,
        name: "post_counters",
        apply: post_counters,
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from_version: i64,
    pub to_version: i64,
    pub applied: Vec<&'static str>,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty() && self.from_version == self.to_version
    }
}

pub fn read_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}

/// Bring the database up to `SCHEMA_VERSION`.
///
/// Steps run in order, each only when the tracked version equals the step's
/// `from`, so a version no step starts from skips every step and is still
/// stamped. The final version is written once at the end; a failing statement
/// aborts the run and leaves `user_version` untouched.
pub fn migrate(conn: &Connection) -> Result<MigrationReport> {
    let from_version = read_version(conn)?;

    if from_version >= SCHEMA_VERSION {
        return Ok(MigrationReport {
            from_version,
            to_version: from_version,
            applied: Vec::new(),
        });
    }

    if !STEPS.iter().any(|step| step.from == from_version) {
        tracing::warn!(
            "No migration step starts at v{}; stamping v{} without changes",
            from_version,
            SCHEMA_VERSION
        );
    }

    let mut current = from_version;
    let mut applied = Vec::new();

    for step in STEPS {
        if current == step.from {
            tracing::debug!("Applying migration {} (from v{})", step.name, step.from);
            (step.apply)(conn)?;
            current += 1;
            applied.push(step.name);
        }
    }

    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;

    Ok(MigrationReport {
        from_version,
        to_version: SCHEMA_VERSION,
        applied,
    })
}

fn initial_schema(conn: &Connection) -> rusqlite::Result<()> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "wal", |row| row.get(0))?;
    tracing::debug!("Journal mode is now {}", mode);

    conn.execute_batch(INITIAL_SCHEMA)?;

    for (title, content) in SEED_POSTS {
        conn.execute(
            "INSERT INTO posts (title, content) VALUES (?1, ?2)",
            [title, content],
        )?;
    }
    for name in SEED_USERS {
        conn.execute("INSERT INTO users (name) VALUES (?1)", [name])?;
    }

    Ok(())
}

fn post_counters(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(POST_COUNTERS)
}
