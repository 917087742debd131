//! Statement executors.
//!
//! A step's statement is run by one of these: directly against the target
//! database, through an external online-schema-change tool, or printed
//! during a dry run.

use camino::Utf8PathBuf;
use keel_config::OnlineToolConfig;
use mysql_async::prelude::Queryable;
use owo_colors::OwoColorize;
use std::future::Future;
use std::pin::Pin;
use tracing::Instrument;

/// A boxed future, as returned by [`StatementExecutor`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors raised while running a statement.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("mysql error: {0}")]
    Mysql(#[from] mysql_async::Error),

    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("statement not supported by {executor}: {statement}")]
    Unsupported {
        executor: &'static str,
        statement: String,
    },

    #[error("{0}")]
    Rejected(String),
}

/// Runs one statement and reports what happened.
pub trait StatementExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run `statement`, returning a human-readable summary. With `dry_run`
    /// set nothing may change on the target.
    fn execute<'a>(
        &'a self,
        statement: &'a str,
        dry_run: bool,
    ) -> BoxFuture<'a, Result<String, ExecutorError>>;
}

/// Executes statements on the target database through a connection pool.
#[derive(Clone)]
pub struct DirectExecutor {
    pool: mysql_async::Pool,
}

impl DirectExecutor {
    pub fn new(pool: mysql_async::Pool) -> Self {
        Self { pool }
    }

    pub fn from_url(url: &str) -> Result<Self, ExecutorError> {
        let pool = mysql_async::Pool::from_url(url)?;
        tracing::debug!(url = %keel_config::mask_password(url), "created target pool");
        Ok(Self::new(pool))
    }

    /// Close all pooled connections.
    pub async fn disconnect(self) -> Result<(), ExecutorError> {
        self.pool.disconnect().await?;
        Ok(())
    }

    async fn run(&self, statement: &str, dry_run: bool) -> Result<String, ExecutorError> {
        if dry_run {
            return Ok(statement.to_string());
        }
        let span = tracing::debug_span!(
            "target.execute",
            sql = %statement,
            affected = tracing::field::Empty,
        );
        let mut conn = self.pool.get_conn().instrument(span.clone()).await?;
        conn.query_drop(statement).instrument(span.clone()).await?;
        let affected = conn.affected_rows();
        span.record("affected", affected);
        Ok(format!("{} rows affected", affected))
    }
}

impl StatementExecutor for DirectExecutor {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn execute<'a>(
        &'a self,
        statement: &'a str,
        dry_run: bool,
    ) -> BoxFuture<'a, Result<String, ExecutorError>> {
        Box::pin(self.run(statement, dry_run))
    }
}

/// Runs `ALTER TABLE` statements through an external online-schema-change
/// binary (gh-ost style flags).
#[derive(Debug, Clone)]
pub struct OnlineSchemaChangeExecutor {
    binary: Utf8PathBuf,
    host: String,
    port: u16,
    user: Option<String>,
    password: Option<String>,
    database: Option<String>,
    extra_args: Vec<String>,
}

impl OnlineSchemaChangeExecutor {
    pub fn new(binary: impl Into<Utf8PathBuf>) -> Self {
        let defaults = OnlineToolConfig::default();
        Self {
            binary: binary.into(),
            host: defaults.host,
            port: defaults.port,
            user: None,
            password: None,
            database: None,
            extra_args: Vec::new(),
        }
    }

    /// `None` when the tool is disabled or has no binary configured.
    pub fn from_config(config: &OnlineToolConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let binary = config.path.clone()?;
        Some(Self {
            binary,
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            password: config.password.clone(),
            database: config.database.clone(),
            extra_args: config.extra_args.clone(),
        })
    }

    /// Command-line arguments for one statement.
    pub fn args(&self, statement: &str, dry_run: bool) -> Result<Vec<String>, ExecutorError> {
        let (table, alter) = parse_alter(statement).ok_or_else(|| ExecutorError::Unsupported {
            executor: "online",
            statement: statement.to_string(),
        })?;

        let mut args = vec![
            format!("--host={}", self.host),
            format!("--port={}", self.port),
        ];
        if let Some(user) = &self.user {
            args.push(format!("--user={}", user));
        }
        if let Some(password) = &self.password {
            args.push(format!("--password={}", password));
        }
        if let Some(database) = &self.database {
            args.push(format!("--database={}", database));
        }
        args.push(format!("--table={}", table));
        args.push(format!("--alter={}", alter));
        args.extend(self.extra_args.iter().cloned());
        if !dry_run {
            args.push("--execute".to_string());
        }
        Ok(args)
    }
}

impl OnlineSchemaChangeExecutor {
    async fn run(&self, statement: &str, dry_run: bool) -> Result<String, ExecutorError> {
        let args = self.args(statement, dry_run)?;
        let tool = self.binary.to_string();
        let span = tracing::info_span!("online.execute", tool = %tool, sql = %statement, dry_run);

        let output = tokio::process::Command::new(self.binary.as_std_path())
            .args(&args)
            .output()
            .instrument(span)
            .await
            .map_err(|source| ExecutorError::Spawn {
                tool: tool.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ExecutorError::ToolFailed {
                tool,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl StatementExecutor for OnlineSchemaChangeExecutor {
    fn name(&self) -> &'static str {
        "online"
    }

    fn execute<'a>(
        &'a self,
        statement: &'a str,
        dry_run: bool,
    ) -> BoxFuture<'a, Result<String, ExecutorError>> {
        Box::pin(self.run(statement, dry_run))
    }
}

/// Split `ALTER TABLE <table> <clause>` into the unquoted table name and the
/// clause.
pub fn parse_alter(statement: &str) -> Option<(String, String)> {
    let statement = statement.trim().trim_end_matches(';');
    let prefix = statement.get(..12)?;
    if !prefix.eq_ignore_ascii_case("ALTER TABLE ") {
        return None;
    }
    let rest = statement[12..].trim_start();

    let (table, clause) = if let Some(quoted) = rest.strip_prefix('`') {
        let mut name = String::new();
        let mut chars = quoted.char_indices().peekable();
        let mut end = None;
        while let Some((i, c)) = chars.next() {
            if c == '`' {
                if matches!(chars.peek(), Some((_, '`'))) {
                    name.push('`');
                    chars.next();
                } else {
                    end = Some(i + 1);
                    break;
                }
            } else {
                name.push(c);
            }
        }
        (name, &quoted[end?..])
    } else {
        let split = rest.find(char::is_whitespace)?;
        (rest[..split].to_string(), &rest[split..])
    };

    let clause = clause.trim();
    if table.is_empty() || clause.is_empty() {
        return None;
    }
    Some((table, clause.to_string()))
}

/// Prints statements instead of running them.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrintExecutor;

impl StatementExecutor for PrintExecutor {
    fn name(&self) -> &'static str {
        "print"
    }

    fn execute<'a>(
        &'a self,
        statement: &'a str,
        _dry_run: bool,
    ) -> BoxFuture<'a, Result<String, ExecutorError>> {
        println!("{} {};", "--".dimmed(), statement.cyan());
        Box::pin(std::future::ready(Ok(statement.to_string())))
    }
}

/// Records statements instead of running them; optionally fails on
/// statements containing a marker.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingExecutor {
    statements: std::sync::Mutex<Vec<String>>,
    fail_on: Option<String>,
}

#[cfg(test)]
impl RecordingExecutor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fail every statement that contains `marker`.
    pub(crate) fn failing_on(marker: impl Into<String>) -> Self {
        Self {
            statements: Default::default(),
            fail_on: Some(marker.into()),
        }
    }

    /// Statements received so far, including failed ones.
    pub(crate) fn statements(&self) -> Vec<String> {
        self.statements
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
impl StatementExecutor for RecordingExecutor {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn execute<'a>(
        &'a self,
        statement: &'a str,
        _dry_run: bool,
    ) -> BoxFuture<'a, Result<String, ExecutorError>> {
        self.statements
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(statement.to_string());
        let result = match &self.fail_on {
            Some(marker) if statement.contains(marker.as_str()) => {
                Err(ExecutorError::Rejected(format!("rejected: {statement}")))
            }
            _ => Ok("0 rows affected".to_string()),
        };
        Box::pin(std::future::ready(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_alter_quoted() {
        assert_eq!(
            parse_alter("ALTER TABLE `dogs` ADD COLUMN `age` int NOT NULL"),
            Some(("dogs".into(), "ADD COLUMN `age` int NOT NULL".into()))
        );
        assert_eq!(
            parse_alter("alter table `we``ird` DROP INDEX `x`;"),
            Some(("we`ird".into(), "DROP INDEX `x`".into()))
        );
    }

    #[test]
    fn test_parse_alter_bare_name() {
        assert_eq!(
            parse_alter("ALTER TABLE dogs ENGINE=InnoDB"),
            Some(("dogs".into(), "ENGINE=InnoDB".into()))
        );
    }

    #[test]
    fn test_parse_alter_rejects_other_statements() {
        assert_eq!(parse_alter("CREATE TABLE `dogs` (id int)"), None);
        assert_eq!(parse_alter("ALTER TABLE `dogs`"), None);
        assert_eq!(parse_alter("ALTER"), None);
    }

    #[test]
    fn test_online_args() {
        let mut exec = OnlineSchemaChangeExecutor::new("/usr/bin/gh-ost");
        exec.database = Some("kennel".into());
        exec.user = Some("root".into());
        exec.extra_args = vec!["--allow-on-master".into()];

        let args = exec
            .args("ALTER TABLE `dogs` ADD INDEX `idx_name` (`name`)", false)
            .unwrap();
        assert_eq!(
            args,
            vec![
                "--host=127.0.0.1",
                "--port=3306",
                "--user=root",
                "--database=kennel",
                "--table=dogs",
                "--alter=ADD INDEX `idx_name` (`name`)",
                "--allow-on-master",
                "--execute",
            ]
        );

        let dry = exec.args("ALTER TABLE `dogs` DROP INDEX `x`", true).unwrap();
        assert!(!dry.contains(&"--execute".to_string()));
    }

    #[test]
    fn test_online_from_config() {
        let mut config = OnlineToolConfig::default();
        assert!(OnlineSchemaChangeExecutor::from_config(&config).is_none());
        config.enabled = true;
        assert!(OnlineSchemaChangeExecutor::from_config(&config).is_none());
        config.path = Some("/opt/gh-ost".into());
        let exec = OnlineSchemaChangeExecutor::from_config(&config).unwrap();
        assert_eq!(exec.binary, "/opt/gh-ost");
    }

    #[tokio::test]
    async fn test_online_rejects_create_table() {
        let exec = OnlineSchemaChangeExecutor::new("/nonexistent/gh-ost");
        let err = exec.execute("DROP TABLE `dogs`", false).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_online_missing_binary() {
        let exec = OnlineSchemaChangeExecutor::new("/nonexistent/gh-ost");
        let err = exec
            .execute("ALTER TABLE `dogs` DROP INDEX `x`", true)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Spawn { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_recording_executor() {
        let exec = RecordingExecutor::failing_on("DROP");
        exec.execute("ALTER TABLE `a` ADD COLUMN `b` int", false)
            .await
            .unwrap();
        assert!(exec.execute("DROP TABLE `a`", false).await.is_err());
        assert_eq!(exec.statements().len(), 2);
    }
}
