//! Argument templates for the external PostgreSQL and archive tools.
//!
//! Every invocation is a structured argument list. Passwords only travel in
//! the `PGPASSWORD` overlay of commands against the matching side.

use std::path::Path;

use crate::artifacts::DatabaseArtifacts;
use crate::config::{Connection, RunSettings};
use crate::runner::Invocation;

pub const PASSWORD_VAR: &str = "PGPASSWORD";

/// Quote a SQL identifier (`orders` -> `"orders"`, embedded quotes doubled).
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Builds every command of a run from its settings.
pub struct CommandTemplates<'a> {
    settings: &'a RunSettings,
}

impl<'a> CommandTemplates<'a> {
    pub fn new(settings: &'a RunSettings) -> Self {
        Self { settings }
    }

    fn connect(label: &str, program: &str, conn: &Connection) -> Invocation {
        Invocation::new(label, program)
            .args(["-h", conn.host.as_str()])
            .args(["-p".to_string(), conn.port.to_string()])
            .args(["-U", conn.user.as_str()])
            .secret_env(PASSWORD_VAR, conn.secret.as_ref())
    }

    fn admin_sql(&self, label: &str, sql: String) -> Invocation {
        let target = &self.settings.target;
        Self::connect(label, &self.settings.tools.psql, target)
            .args(["-X", "-v", "ON_ERROR_STOP=1"])
            .args(["-d", self.settings.admin_database.as_str()])
            .arg("-c")
            .arg(sql)
    }

    /// Roles only, without passwords, from the source cluster.
    pub fn roles_dump(&self, dump_file: &Path) -> Invocation {
        Self::connect(
            "roles dump",
            &self.settings.tools.pg_dumpall,
            &self.settings.source,
        )
        .args(["--roles-only", "--no-role-passwords"])
        .arg("-f")
        .arg(dump_file.display().to_string())
    }

    /// Replays the role script on the target admin database.
    ///
    /// Without ON_ERROR_STOP: roles that already exist on the target (the
    /// bootstrap superuser at least) report an error but must not stop the
    /// remaining statements.
    pub fn roles_restore(&self, dump_file: &Path) -> Invocation {
        Self::connect(
            "roles restore",
            &self.settings.tools.psql,
            &self.settings.target,
        )
        .arg("-X")
        .args(["-d", self.settings.admin_database.as_str()])
        .arg("-f")
        .arg(dump_file.display().to_string())
    }

    pub fn drop_database(&self, database: &str) -> Invocation {
        self.admin_sql(
            "drop database",
            format!("DROP DATABASE IF EXISTS {}", quote_ident(database)),
        )
    }

    pub fn create_database(&self, database: &str) -> Invocation {
        self.admin_sql(
            "create database",
            format!("CREATE DATABASE {}", quote_ident(database)),
        )
    }

    /// Directory-format parallel dump from the source.
    ///
    /// Every user-supplied value is an option argument (`-d`, `-f`), never a
    /// positional, so names starting with `-` stay names.
    pub fn dump_database(&self, artifacts: &DatabaseArtifacts) -> Invocation {
        Self::connect("dump", &self.settings.tools.pg_dump, &self.settings.source)
            .arg("-Fd")
            .args(["-j".to_string(), self.settings.parallel_jobs.to_string()])
            .arg("-f")
            .arg(artifacts.dump_dir.display().to_string())
            .args(["-d", artifacts.database.as_str()])
    }

    /// The member is `./<db>_dump_dir` so tar never reads it as an option.
    pub fn archive(&self, artifacts: &DatabaseArtifacts) -> Invocation {
        Invocation::new("archive", &self.settings.tools.tar)
            .arg("-czf")
            .arg(artifacts.archive.display().to_string())
            .arg("-C")
            .arg(artifacts.work_dir.display().to_string())
            .arg(format!("./{}", artifacts.dump_dir_name()))
    }

    pub fn unpack(&self, artifacts: &DatabaseArtifacts) -> Invocation {
        Invocation::new("unpack", &self.settings.tools.tar)
            .arg("-xzf")
            .arg(artifacts.archive.display().to_string())
            .arg("-C")
            .arg(artifacts.work_dir.display().to_string())
    }

    /// Parallel restore into the freshly created target database.
    pub fn restore_database(&self, artifacts: &DatabaseArtifacts) -> Invocation {
        Self::connect(
            "restore",
            &self.settings.tools.pg_restore,
            &self.settings.target,
        )
        .args(["-d", artifacts.database.as_str()])
        .args(["-j".to_string(), self.settings.parallel_jobs.to_string()])
        .arg(artifacts.dump_dir.display().to_string())
    }
}
