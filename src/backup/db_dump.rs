// dbvault/src/backup/db_dump.rs
use sqlx::Connection;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};
use url::Url;

use crate::errors::{AppError, Result};
use crate::model::{ConnectionParams, Engine, Target};
use crate::utils::find_executable;

/// A single external dump-tool call: program, arguments and extra environment.
///
/// The tool writes its dump to the output path given in `args`; its exit status
/// is the only success signal. stdout/stderr are kept for error detail.
#[derive(Clone)]
pub struct DumpInvocation {
    pub engine: Engine,
    pub tool: String,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub envs: Vec<(String, String)>,
}

impl std::fmt::Debug for DumpInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // args may carry a connection URI with credentials
        f.debug_struct("DumpInvocation")
            .field("engine", &self.engine)
            .field("tool", &self.tool)
            .field("program", &self.program)
            .finish_non_exhaustive()
    }
}

impl DumpInvocation {
    /// Builds the engine-specific invocation writing to `output`.
    pub fn for_target(target: &Target, output: &Path) -> Result<Self> {
        match target.engine {
            Engine::Postgres => Self::pg_dump(&target.connection, output),
            Engine::MongoDb => Self::mongodump(&target.connection, output),
        }
    }

    fn pg_dump(params: &ConnectionParams, output: &Path) -> Result<Self> {
        let program = find_executable("pg_dump")?;
        let args: Vec<OsString> = vec![
            "-h".into(),
            params.host.clone().into(),
            "-p".into(),
            params.port.to_string().into(),
            "-U".into(),
            params.username.clone().into(),
            "-d".into(),
            params.database_name.clone().into(),
            "--format=c".into(),
            "--no-password".into(),
            "-f".into(),
            output.as_os_str().to_os_string(),
        ];
        Ok(Self {
            engine: Engine::Postgres,
            tool: "pg_dump".to_string(),
            program,
            args,
            envs: vec![("PGPASSWORD".to_string(), params.password.clone())],
        })
    }

    fn mongodump(params: &ConnectionParams, output: &Path) -> Result<Self> {
        let program = find_executable("mongodump")?;
        let uri = mongodb_uri(params)?;
        let mut archive_arg = OsString::from("--archive=");
        archive_arg.push(output.as_os_str());
        Ok(Self {
            engine: Engine::MongoDb,
            tool: "mongodump".to_string(),
            program,
            args: vec![format!("--uri={}", uri).into(), archive_arg],
            envs: Vec::new(),
        })
    }

    /// Runs the tool to completion. Dropping the returned future kills the child.
    pub async fn execute(&self) -> Result<()> {
        debug!(tool = %self.tool, program = %self.program.display(), "spawning dump tool");
        let output = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    AppError::Configuration(format!(
                        "Failed to execute {} at {}: {}",
                        self.tool,
                        self.program.display(),
                        e
                    ))
                }
                _ => AppError::Io(e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(AppError::Execution {
                tool: self.tool.clone(),
                status: output.status.to_string(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                hint: diagnose(self.engine, &stderr).map(str::to_string),
                stderr,
            });
        }
        info!(tool = %self.tool, "✓ dump tool finished successfully");
        Ok(())
    }
}

fn mongodb_uri(params: &ConnectionParams) -> Result<String> {
    let mut uri = Url::parse(&format!(
        "mongodb://{}:{}/{}",
        params.host, params.port, params.database_name
    ))
    .map_err(|e| AppError::Configuration(format!("Invalid MongoDB address: {}", e)))?;
    uri.set_username(&params.username)
        .map_err(|_| AppError::Configuration("Cannot set MongoDB username".to_string()))?;
    uri.set_password(Some(&params.password))
        .map_err(|_| AppError::Configuration("Cannot set MongoDB password".to_string()))?;
    uri.set_query(Some("authSource=admin"));
    Ok(uri.to_string())
}

/// Checks that the target accepts connections before a dump tool is spawned.
///
/// Postgres gets a real login attempt; MongoDB a TCP connect.
pub async fn preflight(target: &Target, within: Duration) -> Result<()> {
    let params = &target.connection;
    let attempt = async {
        match target.engine {
            Engine::Postgres => {
                let options = PgConnectOptions::new()
                    .host(&params.host)
                    .port(params.port)
                    .username(&params.username)
                    .password(&params.password)
                    .database(&params.database_name);
                let conn = PgConnection::connect_with(&options)
                    .await
                    .map_err(classify_pg_error)?;
                let _ = conn.close().await;
                Ok::<(), AppError>(())
            }
            Engine::MongoDb => {
                TcpStream::connect((params.host.as_str(), params.port))
                    .await
                    .map_err(|e| AppError::Connection(format!("{}", e)))?;
                Ok::<(), AppError>(())
            }
        }
    };

    match timeout(within, attempt).await {
        Ok(result) => result.map_err(|e| match e {
            AppError::Connection(detail) => AppError::Connection(format!(
                "{} at {}:{} is unreachable: {}",
                target.engine, params.host, params.port, detail
            )),
            AppError::Rejected { message, hint } => AppError::Rejected {
                message: format!(
                    "{} at {}:{} refused the login: {}",
                    target.engine, params.host, params.port, message
                ),
                hint,
            },
            other => other,
        }),
        Err(_) => Err(AppError::Connection(format!(
            "{} at {}:{} did not answer within {}s",
            target.engine,
            params.host,
            params.port,
            within.as_secs()
        ))),
    }
}

/// Splits a failed Postgres login into a server-side refusal, which needs an
/// operator, and everything else, which may clear up on its own.
fn classify_pg_error(err: sqlx::Error) -> AppError {
    match err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            // 08: connection exception, 53: insufficient resources, 57P: shutdown in progress
            if code.starts_with("08") || code.starts_with("53") || code.starts_with("57P") {
                return AppError::Connection(format!("{} (SQLSTATE {})", db.message(), code));
            }
            AppError::Rejected {
                message: format!("{} (SQLSTATE {})", db.message(), code),
                hint: diagnose(Engine::Postgres, db.message()).map(str::to_string),
            }
        }
        other => AppError::Connection(other.to_string()),
    }
}

/// Turns dump-tool stderr into a short human-readable summary, when it
/// matches a known failure. Informational only.
pub fn diagnose(engine: Engine, stderr: &str) -> Option<&'static str> {
    let stderr = stderr.to_lowercase();
    let rules: &[(&str, &str)] = match engine {
        Engine::Postgres => &[
            ("password authentication failed", "Authentication error: the password was rejected."),
            ("authentication failed", "Authentication error: wrong username or password."),
            ("connection refused", "Connection error: the server refused the connection. Check host and port."),
            ("could not translate host name", "Connection error: the host name could not be resolved."),
            ("timeout expired", "Connection error: timed out while connecting to the server."),
            ("permission denied", "Permission error: the user lacks the privileges needed for a dump."),
        ],
        Engine::MongoDb => &[
            ("authentication failed", "Authentication error: wrong username or password."),
            ("could not connect to server", "Connection error: could not reach the server. Check host and port."),
            ("failed to connect", "Connection error: failed to connect to the server. Check network settings."),
        ],
    };

    if engine == Engine::Postgres && stderr.contains("does not exist") && stderr.contains("database") {
        return Some("Database error: the database does not exist.");
    }
    rules
        .iter()
        .find(|(needle, _)| stderr.contains(needle))
        .map(|(_, hint)| *hint)
}
